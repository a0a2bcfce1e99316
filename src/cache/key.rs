//! Brick identity keys.

use crate::dataset::DatasetId;
use crate::util::Coords;

/// `(dataset, LOD vector, brick vector)`; a pure value with no reference to
/// dataset state.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BrickKey {
    pub dataset: DatasetId,
    pub lod: Coords,
    pub brick: Coords,
}

impl BrickKey {
    pub fn new(dataset: DatasetId, lod: &[u64], brick: &[u64]) -> Self {
        Self {
            dataset,
            lod: lod.iter().copied().collect(),
            brick: brick.iter().copied().collect(),
        }
    }
}

impl std::fmt::Display for BrickKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} lod {:?} brick {:?}", self.dataset, self.lod.as_slice(), self.brick.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_equality_is_by_value() {
        let id = DatasetId::next();
        let a = BrickKey::new(id, &[0], &[1, 2, 3]);
        let b = BrickKey::new(id, &[0], &[1, 2, 3]);
        let c = BrickKey::new(id, &[0], &[1, 2, 4]);
        let d = BrickKey::new(DatasetId::next(), &[0], &[1, 2, 3]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);

        let set: HashSet<_> = [a, b, c, d].into_iter().collect();
        assert_eq!(set.len(), 3);
    }
}
