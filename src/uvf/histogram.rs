//! 1-D intensity and 2-D intensity/gradient histogram blocks.
//!
//! Both are computed from the single brick of a raster's coarsest LOD.
//! The 2-D table is intensity-major: row `i` holds the 256 gradient buckets
//! of intensity `i`.
//!
//! On-disk bodies (integers in the file byte order):
//! ```text
//! 1-D: bin count u64, bins [u64]
//! 2-D: intensity bins u64, gradient bins u64, max gradient f64, counts [u64]
//! ```

use byteorder::{ByteOrder, LittleEndian};
use glam::DVec3;
use rayon::prelude::*;

use super::format::DomainSemantic;
use super::raster::RasterDataBlock;
use crate::store::{ByteBuf, Endian, StoreCursor};
use crate::util::{product, Error, Result, ScalarType};

/// Gradient buckets per intensity in a 2-D histogram.
pub const GRADIENT_BINS: usize = 256;

/// Coarsest-brick samples of a scalar 8/16-bit unsigned raster.
struct ScalarBrick {
    values: Vec<u32>,
    size: Vec<u64>,
    bins: usize,
}

fn load_scalar_brick(source: &RasterDataBlock) -> Result<ScalarBrick> {
    if !source.is_scalar() {
        return Err(Error::validation(format!(
            "histogram source '{}' has {} components, expected 1",
            source.id,
            source.component_count()
        )));
    }
    let ty = source
        .components()
        .next()
        .and_then(|c| c.scalar_type())
        .ok_or_else(|| Error::validation("histogram source has no usable element type"))?;
    let bins = match ty {
        ScalarType::Uint8 => 1 << 8,
        ScalarType::Uint16 => 1 << 16,
        other => {
            return Err(Error::validation(format!(
                "histogram source must be 8 or 16 bit unsigned, found {}",
                other
            )))
        }
    };

    let index = source.smallest_brick_index();
    let counts = source.brick_count(&index.lod)?;
    if counts.iter().any(|&c| c != 1) {
        return Err(Error::validation(format!(
            "coarsest LOD has {:?} bricks, expected a single brick",
            counts.as_slice()
        )));
    }
    let size = source.brick_size(&index.lod, &index.brick)?.to_vec();
    let data = source.get_data(&index.lod, &index.brick)?;
    let values = match ty {
        ScalarType::Uint8 => data.iter().map(|&v| v as u32).collect(),
        _ => data.chunks_exact(2).map(|c| LittleEndian::read_u16(c) as u32).collect(),
    };
    Ok(ScalarBrick { values, size, bins })
}

/// Length after dropping trailing empty bins (at least 1).
fn trimmed_len(bins: &[u64]) -> usize {
    bins.iter().rposition(|&c| c != 0).map_or(1, |last| last + 1)
}

/// Intensity histogram.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Histogram1DDataBlock {
    pub id: String,
    bins: Vec<u64>,
}

impl Histogram1DDataBlock {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), bins: Vec::new() }
    }

    /// Count raw intensities of `source`'s coarsest brick, replacing any
    /// previous bins. Trailing zero bins are trimmed.
    ///
    /// On error the block is left unchanged.
    pub fn compute(&mut self, source: &RasterDataBlock) -> Result<()> {
        let brick = load_scalar_brick(source)?;
        let mut bins = vec![0u64; brick.bins];
        for v in brick.values {
            bins[v as usize] += 1;
        }
        bins.truncate(trimmed_len(&bins));
        tracing::debug!(id = %self.id, bins = bins.len(), "computed 1D histogram");
        self.bins = bins;
        Ok(())
    }

    #[inline]
    pub fn bins(&self) -> &[u64] {
        &self.bins
    }

    /// Number of stored bins (the filled size).
    #[inline]
    pub fn len(&self) -> usize {
        self.bins.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub(crate) fn parse(cursor: &mut StoreCursor<'_>, id: String) -> Result<Self> {
        let bins = cursor.read_u64_vec()?;
        Ok(Self { id, bins })
    }

    pub(crate) fn encode(&self, endian: Endian) -> Vec<u8> {
        let mut buf = ByteBuf::new(endian);
        buf.put_u64_vec(&self.bins);
        buf.into_inner()
    }
}

/// Joint intensity / gradient-magnitude histogram.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Histogram2DDataBlock {
    pub id: String,
    intensity_bins: usize,
    gradient_bins: usize,
    max_gradient: f64,
    counts: Vec<u64>,
}

impl Histogram2DDataBlock {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), ..Self::default() }
    }

    /// Bucket (intensity, central-difference gradient magnitude) over the
    /// interior voxels of `source`'s coarsest brick.
    ///
    /// Magnitudes are normalised by the largest one found and quantised to
    /// 256 buckets. Requires X/Y/Z as the first three axes, each at least 3
    /// voxels wide. On error the block is left unchanged.
    pub fn compute(&mut self, source: &RasterDataBlock) -> Result<()> {
        let axes = [DomainSemantic::X, DomainSemantic::Y, DomainSemantic::Z];
        if source.domain_semantics.len() < 3 || source.domain_semantics[..3] != axes {
            return Err(Error::validation("2D histogram needs X, Y, Z as the first three axes"));
        }
        let brick = load_scalar_brick(source)?;
        let (sx, sy, sz) = (brick.size[0] as usize, brick.size[1] as usize, brick.size[2] as usize);
        if sx < 3 || sy < 3 || sz < 3 {
            return Err(Error::validation(format!(
                "coarsest brick {}x{}x{} is too small for a gradient stencil",
                sx, sy, sz
            )));
        }
        if product(&brick.size[3..]) != 1 {
            return Err(Error::validation("2D histogram supports a single sample on axes past Z"));
        }

        let values = &brick.values;
        let at = |x: usize, y: usize, z: usize| values[x + sx * (y + sy * z)] as f64;
        let samples: Vec<(u32, f64)> = (1..sz - 1)
            .into_par_iter()
            .flat_map_iter(|z| {
                (1..sy - 1).flat_map(move |y| {
                    (1..sx - 1).map(move |x| {
                        let gradient = DVec3::new(
                            at(x + 1, y, z) - at(x - 1, y, z),
                            at(x, y + 1, z) - at(x, y - 1, z),
                            at(x, y, z + 1) - at(x, y, z - 1),
                        ) * 0.5;
                        (values[x + sx * (y + sy * z)], gradient.length())
                    })
                })
            })
            .collect();

        let max_gradient = samples.iter().map(|s| s.1).fold(0.0, f64::max);
        let mut counts = vec![0u64; brick.bins * GRADIENT_BINS];
        for (value, magnitude) in samples {
            let bucket = if max_gradient > 0.0 {
                ((magnitude / max_gradient) * 255.0) as usize
            } else {
                0
            };
            counts[value as usize * GRADIENT_BINS + bucket.min(GRADIENT_BINS - 1)] += 1;
        }

        let row_totals: Vec<u64> = counts.chunks(GRADIENT_BINS).map(|row| row.iter().sum()).collect();
        let rows = trimmed_len(&row_totals);
        counts.truncate(rows * GRADIENT_BINS);

        tracing::debug!(id = %self.id, rows, max_gradient, "computed 2D histogram");
        self.intensity_bins = rows;
        self.gradient_bins = GRADIENT_BINS;
        self.max_gradient = max_gradient;
        self.counts = counts;
        Ok(())
    }

    /// Filled intensity range.
    #[inline]
    pub fn intensity_bins(&self) -> usize {
        self.intensity_bins
    }

    #[inline]
    pub fn gradient_bins(&self) -> usize {
        self.gradient_bins
    }

    /// Largest gradient magnitude seen during compute.
    #[inline]
    pub fn max_gradient(&self) -> f64 {
        self.max_gradient
    }

    /// Count for one (intensity, gradient bucket) cell.
    pub fn count(&self, intensity: usize, gradient: usize) -> Option<u64> {
        if intensity >= self.intensity_bins || gradient >= self.gradient_bins {
            return None;
        }
        self.counts.get(intensity * self.gradient_bins + gradient).copied()
    }

    /// Gradient buckets of one intensity.
    pub fn row(&self, intensity: usize) -> Option<&[u64]> {
        let start = intensity.checked_mul(self.gradient_bins)?;
        self.counts.get(start..start + self.gradient_bins)
    }

    /// Sum of all cells.
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn verify(&self) -> Result<()> {
        if self.counts.len() != self.intensity_bins * self.gradient_bins {
            return Err(Error::validation(format!(
                "2D histogram has {} counts for a {}x{} table",
                self.counts.len(),
                self.intensity_bins,
                self.gradient_bins
            )));
        }
        Ok(())
    }

    pub(crate) fn parse(cursor: &mut StoreCursor<'_>, id: String) -> Result<Self> {
        let intensity_bins = cursor.read_u64()?;
        let gradient_bins = cursor.read_u64()?;
        let max_gradient = cursor.read_f64()?;
        let cells = intensity_bins
            .checked_mul(gradient_bins)
            .ok_or_else(|| Error::invalid("2D histogram size overflows"))?;
        let counts = cursor.read_u64_array(cells)?;
        Ok(Self {
            id,
            intensity_bins: intensity_bins as usize,
            gradient_bins: gradient_bins as usize,
            max_gradient,
            counts,
        })
    }

    pub(crate) fn encode(&self, endian: Endian) -> Vec<u8> {
        let mut buf = ByteBuf::new(endian);
        buf.put_u64(self.intensity_bins as u64);
        buf.put_u64(self.gradient_bins as u64);
        buf.put_f64(self.max_gradient);
        for &c in &self.counts {
            buf.put_u64(c);
        }
        buf.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uvf::format::ElementSemantic;

    fn single_brick(size: u64, fill: impl Fn(u64, u64, u64) -> u8) -> RasterDataBlock {
        let mut block = RasterDataBlock::volume("src", [size; 3], size, 0, 2);
        let mut flat = Vec::with_capacity((size * size * size) as usize);
        for z in 0..size {
            for y in 0..size {
                for x in 0..size {
                    flat.push(fill(x, y, z));
                }
            }
        }
        block.build_from_flat_data(&flat).expect("build");
        block
    }

    #[test]
    fn test_1d_trims_to_highest_bin() {
        let source = single_brick(16, |x, y, z| if (x, y, z) == (3, 4, 5) { 200 } else { 5 });
        let mut hist = Histogram1DDataBlock::new("h1");
        hist.compute(&source).expect("compute");
        assert_eq!(hist.len(), 201);
        assert_eq!(hist.bins()[5], 16 * 16 * 16 - 1);
        assert_eq!(hist.bins()[200], 1);
        let others: u64 = hist.bins().iter().enumerate().filter(|(i, _)| *i != 5 && *i != 200).map(|(_, c)| c).sum();
        assert_eq!(others, 0);
    }

    #[test]
    fn test_1d_uses_coarsest_level_only() {
        let mut source = RasterDataBlock::volume("src", [8, 8, 8], 4, 1, 2);
        source.build_from_flat_data(&vec![9u8; 512]).expect("build");
        let mut hist = Histogram1DDataBlock::new("h1");
        hist.compute(&source).expect("compute");
        // coarsest level is 4x4x4
        assert_eq!(hist.bins()[9], 64);
    }

    #[test]
    fn test_compute_failure_leaves_block_unchanged() {
        let source = single_brick(8, |_, _, _| 7);
        let mut hist = Histogram1DDataBlock::new("h1");
        hist.compute(&source).expect("compute");
        let before = hist.clone();

        let mut vector = source.clone();
        vector.set_type_to_vector(8, 8, false, &[ElementSemantic::Red, ElementSemantic::Green]);
        assert!(matches!(hist.compute(&vector), Err(Error::Validation(_))));
        assert_eq!(hist, before);

        let mut float = source.clone();
        float.set_type_to_float(ElementSemantic::Intensity);
        assert!(hist.compute(&float).is_err());
        assert_eq!(hist, before);
    }

    #[test]
    fn test_2d_constant_volume_has_zero_gradient() {
        let source = single_brick(6, |_, _, _| 42);
        let mut hist = Histogram2DDataBlock::new("h2");
        hist.compute(&source).expect("compute");
        assert_eq!(hist.intensity_bins(), 43);
        assert_eq!(hist.gradient_bins(), GRADIENT_BINS);
        assert_eq!(hist.max_gradient(), 0.0);
        // interior voxels only
        assert_eq!(hist.count(42, 0), Some(4 * 4 * 4));
        assert_eq!(hist.total(), 64);
    }

    #[test]
    fn test_2d_ramp_lands_in_top_bucket() {
        let source = single_brick(5, |x, _, _| (x * 10) as u8);
        let mut hist = Histogram2DDataBlock::new("h2");
        hist.compute(&source).expect("compute");
        assert_eq!(hist.max_gradient(), 10.0);
        assert_eq!(hist.count(20, 255), Some(9));
        assert_eq!(hist.row(10).map(|r| r[255]), Some(9));
        hist.verify().expect("consistent");
    }

    #[test]
    fn test_2d_rejects_thin_volume() {
        let mut source = RasterDataBlock::volume("thin", [8, 8, 2], 8, 0, 2);
        source.build_from_flat_data(&vec![1u8; 128]).expect("build");
        let mut hist = Histogram2DDataBlock::new("h2");
        assert!(matches!(hist.compute(&source), Err(Error::Validation(_))));
        assert_eq!(hist.intensity_bins(), 0);
    }
}
