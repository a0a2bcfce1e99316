//! Volume datasets: an opened container with one raster chosen as the volume.
//!
//! [`BrickSource`] is the seam between the brick cache and the raster model.
//! The cache only sees identities, geometry and sample bytes.

use glam::DVec3;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::StreamingConfig;
use crate::util::{Coords, Error, GridIter, Result};
use crate::uvf::{
    Block, BrickIndex, Container, Histogram1DDataBlock, Histogram2DDataBlock, OpenOptions, RasterDataBlock,
};

static NEXT_DATASET_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an opened dataset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatasetId(u64);

impl DatasetId {
    pub fn next() -> Self {
        Self(NEXT_DATASET_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for DatasetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dataset#{}", self.0)
    }
}

/// Brick geometry and samples, as seen by the brick cache.
pub trait BrickSource {
    fn dataset_id(&self) -> DatasetId;

    /// Number of LOD groups in the LOD vectors this source accepts.
    fn lod_count(&self) -> usize;

    /// Stored voxel extent of a brick, halo included.
    fn brick_voxels(&self, lod: &[u64], brick: &[u64]) -> Result<Coords>;

    /// Bits per component.
    fn bit_width(&self) -> u64;

    fn component_count(&self) -> u64;

    /// Raw samples of one brick; the caller owns the buffer.
    fn read_brick(&self, lod: &[u64], brick: &[u64]) -> Result<Vec<u8>>;

    /// The brick one level coarser that covers the same region, if any.
    fn coarser_brick(&self, lod: &[u64], brick: &[u64]) -> Option<BrickIndex>;
}

/// Opened container with its volume raster and optional histograms.
#[derive(Debug)]
pub struct VolumeDataset {
    id: DatasetId,
    container: Container,
    volume: usize,
    hist1d: Option<usize>,
    hist2d: Option<usize>,
}

impl VolumeDataset {
    pub fn open(path: impl AsRef<Path>, config: &StreamingConfig) -> Result<Self> {
        let options = OpenOptions::default()
            .verify(config.verify_checksum)
            .use_mmap(config.use_mmap);
        Self::from_container(Container::open(path, options)?)
    }

    /// Use the first raster block of `container` as the volume.
    pub fn from_container(container: Container) -> Result<Self> {
        let (volume, raster) = container
            .rasters()
            .next()
            .ok_or_else(|| Error::validation("container holds no raster block"))?;
        raster.verify()?;
        if !raster.has_payload() {
            return Err(Error::validation(format!("raster '{}' has no payload", raster.id)));
        }
        let bit_width = raster.components().next().map(|c| c.bit_size).unwrap_or(0);
        if raster.components().any(|c| c.bit_size != bit_width) {
            return Err(Error::unsupported(format!(
                "raster '{}' mixes component bit widths",
                raster.id
            )));
        }

        let position = |f: fn(&Block) -> bool| container.blocks().iter().position(f);
        let hist1d = position(|b| b.as_histogram_1d().is_some());
        let hist2d = position(|b| b.as_histogram_2d().is_some());
        let id = DatasetId::next();
        tracing::info!(
            %id,
            volume = %raster.id,
            domain = ?raster.domain_size.as_slice(),
            lods = raster.lod_permutations().len(),
            "opened dataset"
        );
        Ok(Self { id, container, volume, hist1d, hist2d })
    }

    #[inline]
    pub fn id(&self) -> DatasetId {
        self.id
    }

    #[inline]
    pub fn container(&self) -> &Container {
        &self.container
    }

    /// Give back the container (for instance to close a read-write file).
    pub fn into_container(self) -> Container {
        self.container
    }

    pub fn volume(&self) -> &RasterDataBlock {
        // Index checked in `from_container`; the block list is private.
        match self.container.block(self.volume).and_then(Block::as_raster) {
            Some(raster) => raster,
            None => unreachable!("volume index always names a raster block"),
        }
    }

    pub fn histogram_1d(&self) -> Option<&Histogram1DDataBlock> {
        self.hist1d.and_then(|i| self.container.block(i)).and_then(Block::as_histogram_1d)
    }

    pub fn histogram_2d(&self) -> Option<&Histogram2DDataBlock> {
        self.hist2d.and_then(|i| self.container.block(i)).and_then(Block::as_histogram_2d)
    }

    /// Freshly computed histograms of the volume's coarsest level.
    pub fn compute_histograms(&self) -> Result<(Histogram1DDataBlock, Histogram2DDataBlock)> {
        let volume = self.volume();
        let mut h1 = Histogram1DDataBlock::new(format!("{} 1D histogram", volume.id));
        h1.compute(volume)?;
        let mut h2 = Histogram2DDataBlock::new(format!("{} 2D histogram", volume.id));
        h2.compute(volume)?;
        Ok((h1, h2))
    }

    /// All bricks of `lod` in storage order (first axis fastest).
    pub fn brick_list(&self, lod: &[u64]) -> Result<Vec<BrickIndex>> {
        let counts = self.volume().brick_count(lod)?;
        Ok(GridIter::new(&counts)
            .map(|brick| BrickIndex { lod: lod.iter().copied().collect(), brick })
            .collect())
    }

    /// Interior region of a brick in normalised volume coordinates `[0, 1]`.
    ///
    /// Only the first three axes are spatial; missing axes span the full range.
    pub fn brick_bounds(&self, lod: &[u64], brick: &[u64]) -> Result<(DVec3, DVec3)> {
        let volume = self.volume();
        let n = volume.lod_domain_size(lod)?;
        let counts = volume.brick_count(lod)?;
        if brick.len() != counts.len() || brick.iter().zip(&counts).any(|(b, c)| b >= c) {
            return Err(Error::out_of_range(format!("brick {:?} at LOD {:?}", brick, lod)));
        }
        let mut min = DVec3::ZERO;
        let mut max = DVec3::ONE;
        for axis in 0..volume.dimension().min(3) {
            let b = volume.brick_size[axis];
            let start = brick[axis] * b;
            let end = (start + b).min(n[axis]);
            min[axis] = start as f64 / n[axis] as f64;
            max[axis] = end as f64 / n[axis] as f64;
        }
        Ok((min, max))
    }
}

impl BrickSource for VolumeDataset {
    fn dataset_id(&self) -> DatasetId {
        self.id
    }

    fn lod_count(&self) -> usize {
        self.volume().lod_level_count.len()
    }

    fn brick_voxels(&self, lod: &[u64], brick: &[u64]) -> Result<Coords> {
        self.volume().brick_size(lod, brick)
    }

    fn bit_width(&self) -> u64 {
        self.volume().components().next().map(|c| c.bit_size).unwrap_or(0)
    }

    fn component_count(&self) -> u64 {
        self.volume().component_count()
    }

    fn read_brick(&self, lod: &[u64], brick: &[u64]) -> Result<Vec<u8>> {
        self.volume().get_data(lod, brick)
    }

    fn coarser_brick(&self, lod: &[u64], brick: &[u64]) -> Option<BrickIndex> {
        coarser_brick(self.volume(), lod, brick)
    }
}

/// Step every LOD group that is not yet coarsest one level up and locate the
/// brick containing the interior origin of `brick`.
pub fn coarser_brick(raster: &RasterDataBlock, lod: &[u64], brick: &[u64]) -> Option<BrickIndex> {
    let fine = raster.lod_domain_size(lod).ok()?;
    let counts = raster.brick_count(lod).ok()?;
    if brick.len() != counts.len() || brick.iter().zip(&counts).any(|(b, c)| b >= c) {
        return None;
    }

    let coarse_lod: Coords = lod
        .iter()
        .zip(&raster.lod_level_count)
        .map(|(&level, &count)| (level + 1).min(count.saturating_sub(1)))
        .collect();
    if coarse_lod.as_slice() == lod {
        return None;
    }

    let coarse = raster.lod_domain_size(&coarse_lod).ok()?;
    let coarse_counts = raster.brick_count(&coarse_lod).ok()?;
    let target = (0..raster.dimension())
        .map(|axis| {
            let b = raster.brick_size[axis];
            let start = brick[axis] * b;
            // Map through the level ratio so axes that did not shrink keep their index.
            let pos = if coarse[axis] == fine[axis] {
                start
            } else {
                start * coarse[axis] / fine[axis]
            };
            (pos / b).min(coarse_counts[axis] - 1)
        })
        .collect();
    Some(BrickIndex { lod: coarse_lod, brick: target })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uvf::GlobalHeader;

    fn ramp_dataset(size: u64, brick: u64) -> VolumeDataset {
        let mut raster = RasterDataBlock::volume("ramp", [size, size, size], brick, 1, 2);
        let flat: Vec<u8> = (0..size * size * size).map(|i| (i % 251) as u8).collect();
        raster.build_from_flat_data(&flat).expect("build");
        let mut container = Container::new("unused.uvf", GlobalHeader::default());
        container.add_data_block(raster).expect("add");
        VolumeDataset::from_container(container).expect("dataset")
    }

    #[test]
    fn test_ids_are_unique() {
        let a = ramp_dataset(8, 4);
        let b = ramp_dataset(8, 4);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.dataset_id(), a.id());
    }

    #[test]
    fn test_requires_raster() {
        let container = Container::new("unused.uvf", GlobalHeader::default());
        assert!(matches!(VolumeDataset::from_container(container), Err(Error::Validation(_))));
    }

    #[test]
    fn test_brick_list_order() {
        let ds = ramp_dataset(16, 8);
        let lod = ds.volume().finest_lod();
        let list = ds.brick_list(&lod).expect("list");
        assert_eq!(list.len(), 8);
        assert_eq!(list[0].brick.as_slice(), &[0, 0, 0]);
        assert_eq!(list[1].brick.as_slice(), &[1, 0, 0]);
        assert_eq!(list[2].brick.as_slice(), &[0, 1, 0]);
        assert_eq!(list[7].brick.as_slice(), &[1, 1, 1]);
    }

    #[test]
    fn test_coarser_brick() {
        let ds = ramp_dataset(32, 8);
        let fine = ds.volume().finest_lod();
        let up = ds.coarser_brick(&fine, &[3, 2, 0]).expect("coarser");
        assert_eq!(up.lod.as_slice(), &[1]);
        assert_eq!(up.brick.as_slice(), &[1, 1, 0]);

        let coarsest = ds.volume().coarsest_lod();
        assert!(ds.coarser_brick(&coarsest, &[0, 0, 0]).is_none());
        assert!(ds.coarser_brick(&fine, &[9, 0, 0]).is_none());
    }

    #[test]
    fn test_brick_bounds_and_reads() {
        let ds = ramp_dataset(16, 8);
        let lod = ds.volume().finest_lod();
        let (min, max) = ds.brick_bounds(&lod, &[1, 0, 0]).expect("bounds");
        assert_eq!(min, DVec3::new(0.5, 0.0, 0.0));
        assert_eq!(max, DVec3::new(1.0, 0.5, 0.5));

        let voxels = ds.brick_voxels(&lod, &[1, 0, 0]).expect("voxels");
        assert_eq!(voxels.as_slice(), &[9, 9, 9]);
        let bytes = ds.read_brick(&lod, &[1, 0, 0]).expect("read");
        assert_eq!(bytes.len(), 9 * 9 * 9);
        assert_eq!(ds.bit_width(), 8);
        assert_eq!(ds.component_count(), 1);
    }

    #[test]
    fn test_compute_histograms() {
        let ds = ramp_dataset(8, 8);
        let (h1, h2) = ds.compute_histograms().expect("histograms");
        assert_eq!(h1.bins().iter().sum::<u64>(), 512);
        assert_eq!(h2.total(), 6 * 6 * 6);
    }
}
