//! Small coordinate vectors and grid iteration.
//!
//! LOD vectors, brick coordinates and per-axis sizes are all short `u64`
//! vectors; most volumes are 3-D, so four inline slots avoid heap traffic.

use smallvec::SmallVec;

/// Per-axis coordinate or size vector.
pub type Coords = SmallVec<[u64; 4]>;

/// Build a [`Coords`] from a slice.
#[inline]
pub fn coords(values: &[u64]) -> Coords {
    SmallVec::from_slice(values)
}

/// All-zero vector of the given length.
#[inline]
pub fn zeros(len: usize) -> Coords {
    smallvec::smallvec![0; len]
}

/// Integer division rounding up. `b` must be non-zero.
#[inline]
pub fn ceil_div(a: u64, b: u64) -> u64 {
    a.div_ceil(b)
}

/// Product of all components (1 for an empty vector).
#[inline]
pub fn product(values: &[u64]) -> u64 {
    values.iter().product()
}

/// Linear index of `pos` inside `extent`, first axis fastest.
pub fn linear_index(pos: &[u64], extent: &[u64]) -> u64 {
    let mut index = 0;
    let mut stride = 1;
    for (p, e) in pos.iter().zip(extent) {
        index += p * stride;
        stride *= e;
    }
    index
}

/// Inverse of [`linear_index`].
pub fn unlinear_index(mut index: u64, extent: &[u64]) -> Coords {
    let mut pos = Coords::with_capacity(extent.len());
    for &e in extent {
        pos.push(index % e);
        index /= e;
    }
    pos
}

/// Iterates every position in an N-D grid, first axis fastest.
///
/// An empty extent yields one empty position; any zero-sized axis yields nothing.
#[derive(Debug, Clone)]
pub struct GridIter {
    extent: Coords,
    current: Option<Coords>,
}

impl GridIter {
    pub fn new(extent: &[u64]) -> Self {
        let current = if extent.contains(&0) {
            None
        } else {
            Some(zeros(extent.len()))
        };
        Self { extent: coords(extent), current }
    }
}

impl Iterator for GridIter {
    type Item = Coords;

    fn next(&mut self) -> Option<Coords> {
        let out = self.current.take()?;
        let mut next = out.clone();
        let mut carried = true;
        for (axis, value) in next.iter_mut().enumerate() {
            *value += 1;
            if *value < self.extent[axis] {
                carried = false;
                break;
            }
            *value = 0;
        }
        if !carried {
            self.current = Some(next);
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_iter_x_fastest() {
        let all: Vec<Coords> = GridIter::new(&[2, 3]).collect();
        assert_eq!(all.len(), 6);
        assert_eq!(all[0].as_slice(), &[0, 0]);
        assert_eq!(all[1].as_slice(), &[1, 0]);
        assert_eq!(all[2].as_slice(), &[0, 1]);
        assert_eq!(all[5].as_slice(), &[1, 2]);
    }

    #[test]
    fn test_grid_iter_edge_cases() {
        assert_eq!(GridIter::new(&[]).count(), 1);
        assert_eq!(GridIter::new(&[4, 0, 2]).count(), 0);
    }

    #[test]
    fn test_linear_index_roundtrip() {
        let extent = [4, 5, 6];
        for (i, pos) in GridIter::new(&extent).enumerate() {
            assert_eq!(linear_index(&pos, &extent), i as u64);
            assert_eq!(unlinear_index(i as u64, &extent), pos);
        }
    }

    #[test]
    fn test_ceil_div() {
        assert_eq!(ceil_div(100, 32), 4);
        assert_eq!(ceil_div(64, 32), 2);
        assert_eq!(ceil_div(0, 32), 0);
    }
}
