//! Regular N-dimensional grid blocks: the bricked multiresolution raster.
//!
//! Payload layout: LOD levels are stored coarsest first. Within a level,
//! bricks follow in first-axis-fastest order and each brick is one
//! contiguous first-axis-fastest run of elements. A stored brick is its
//! interior (`brick_size` per axis, clipped at the domain edge) extended by
//! `brick_overlap` voxels on every side that has a neighbour inside the level.
//!
//! Element samples are little-endian regardless of the header byte order.

use std::borrow::Cow;
use std::ops::Range;
use std::sync::Arc;

use glam::DMat4;
use parking_lot::Mutex;
use rayon::prelude::*;

use super::compression;
use super::format::{CompressionScheme, DomainSemantic, ElementSemantic};
use crate::store::{ByteBuf, ByteStore, Endian, StoreCursor};
use crate::util::{
    ceil_div, coords, linear_index, product, unlinear_index, zeros, Coords, Error, GridIter,
    Result, ScalarType,
};

/// Upper bound on raster dimensionality accepted from a file.
const MAX_DIMENSION: u64 = 16;
/// Upper bound on components per element accepted from a file.
const MAX_COMPONENTS: u64 = 1024;
/// Levels per LOD group; a decimation of 2 reaches one voxel within 64.
const MAX_LOD_LEVELS: u64 = 64;
const MAX_LOD_PERMUTATIONS: u64 = 1 << 16;

/// Layout of one component of a raster element.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ComponentType {
    pub semantic: ElementSemantic,
    pub bit_size: u64,
    pub mantissa: u64,
    pub signed: bool,
}

impl ComponentType {
    pub fn new(semantic: ElementSemantic, bit_size: u64, mantissa: u64, signed: bool) -> Self {
        Self { semantic, bit_size, mantissa, signed }
    }

    /// Storage bytes for this component.
    #[inline]
    pub fn byte_size(&self) -> u64 {
        ceil_div(self.bit_size, 8)
    }

    #[inline]
    pub fn scalar_type(&self) -> Option<ScalarType> {
        ScalarType::from_layout(self.bit_size, self.mantissa, self.signed)
    }
}

/// A (LOD vector, brick vector) pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BrickIndex {
    pub lod: Coords,
    pub brick: Coords,
}

/// Where a raster's sample payload currently lives.
#[derive(Clone, Default)]
enum RasterPayload {
    #[default]
    Empty,
    Memory(Vec<u8>),
    Stored(StoredPayload),
}

/// Payload bytes still in the container file.
#[derive(Clone)]
struct StoredPayload {
    store: Arc<ByteStore>,
    offset: u64,
    len: u64,
    compression: CompressionScheme,
    inflated: Arc<Mutex<Option<Arc<Vec<u8>>>>>,
}

impl StoredPayload {
    /// Decompressed payload, inflated once on first use.
    fn inflated(&self) -> Result<Arc<Vec<u8>>> {
        let mut slot = self.inflated.lock();
        if let Some(data) = slot.as_ref() {
            return Ok(Arc::clone(data));
        }
        let raw = self.store.read_at(self.offset, self.len as usize)?;
        let data = Arc::new(compression::decompress(self.compression, &raw)?);
        tracing::debug!(packed = raw.len(), inflated = data.len(), "inflated raster payload");
        *slot = Some(Arc::clone(&data));
        Ok(data)
    }

    fn read(&self, range: Range<u64>) -> Result<Vec<u8>> {
        if self.compression == CompressionScheme::None {
            if range.end > self.len {
                return Err(Error::invalid("brick extends past the stored payload"));
            }
            return self.store.read_at(self.offset + range.start, (range.end - range.start) as usize);
        }
        let data = self.inflated()?;
        data.get(range.start as usize..range.end as usize)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Error::invalid("brick extends past the inflated payload"))
    }

    fn to_vec(&self) -> Result<Vec<u8>> {
        if self.compression == CompressionScheme::None {
            self.store.read_at(self.offset, self.len as usize)
        } else {
            Ok(self.inflated()?.as_ref().clone())
        }
    }
}

impl std::fmt::Debug for RasterPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Memory(v) => write!(f, "Memory({} bytes)", v.len()),
            Self::Stored(s) => write!(
                f,
                "Stored({} bytes at {} in {}, {})",
                s.len,
                s.offset,
                s.store.path().display(),
                s.compression
            ),
        }
    }
}

/// Payload source handed to the container writer.
pub(crate) enum WritePayload<'a> {
    Bytes(Cow<'a, [u8]>),
    Copy { store: &'a ByteStore, offset: u64, len: u64 },
}

impl WritePayload<'_> {
    pub(crate) fn len(&self) -> u64 {
        match self {
            Self::Bytes(b) => b.len() as u64,
            Self::Copy { len, .. } => *len,
        }
    }
}

/// Bricked multiresolution raster block.
#[derive(Clone, Debug)]
pub struct RasterDataBlock {
    pub id: String,
    pub compression: CompressionScheme,
    /// Meaning of each axis.
    pub domain_semantics: Vec<DomainSemantic>,
    /// Row-major (dim+1)x(dim+1) transform, empty for 0-D rasters.
    pub transformation: Vec<f64>,
    pub domain_size: Coords,
    /// Interior brick size per axis.
    pub brick_size: Coords,
    /// Halo voxels per side per axis.
    pub brick_overlap: Coords,
    pub lod_dec_factor: Coords,
    /// LOD group of each axis; axes in one group shrink together.
    pub lod_groups: Coords,
    /// Level count of each LOD group.
    pub lod_level_count: Coords,
    /// Components of each element dimension.
    pub elements: Vec<Vec<ComponentType>>,
    payload: RasterPayload,
}

impl RasterDataBlock {
    /// Empty 0-D raster with no element type.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            compression: CompressionScheme::None,
            domain_semantics: Vec::new(),
            transformation: Vec::new(),
            domain_size: Coords::new(),
            brick_size: Coords::new(),
            brick_overlap: Coords::new(),
            lod_dec_factor: Coords::new(),
            lod_groups: Coords::new(),
            lod_level_count: Coords::new(),
            elements: Vec::new(),
            payload: RasterPayload::Empty,
        }
    }

    /// 8-bit scalar X/Y/Z volume with one LOD group, enough levels that the
    /// coarsest fits in a single brick, and an identity transform.
    pub fn volume(id: impl Into<String>, domain: [u64; 3], brick: u64, overlap: u64, dec: u64) -> Self {
        let mut block = Self::new(id);
        block.domain_semantics = vec![DomainSemantic::X, DomainSemantic::Y, DomainSemantic::Z];
        block.domain_size = coords(&domain);
        block.brick_size = coords(&[brick; 3]);
        block.brick_overlap = coords(&[overlap; 3]);
        block.lod_dec_factor = coords(&[dec; 3]);
        block.lod_groups = zeros(3);
        let largest = domain.iter().copied().max().unwrap_or(1);
        block.lod_level_count = coords(&[Self::lod_levels_for(largest, brick, dec)]);
        block.set_identity_transformation();
        block.set_type_to_ubyte(ElementSemantic::Intensity);
        block
    }

    /// Number of levels needed to shrink `size` to at most one brick.
    pub fn lod_levels_for(size: u64, brick: u64, dec: u64) -> u64 {
        let mut levels = 1;
        let mut n = size;
        while n > brick && dec > 1 {
            n = ceil_div(n, dec);
            levels += 1;
        }
        levels
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.domain_size.len()
    }

    pub fn set_identity_transformation(&mut self) {
        self.set_scale_only_transformation(&[]);
    }

    /// Diagonal transform; missing scale entries default to 1.
    pub fn set_scale_only_transformation(&mut self, scale: &[f64]) {
        let d = self.dimension();
        if d == 0 {
            self.transformation.clear();
            return;
        }
        let n = d + 1;
        self.transformation = vec![0.0; n * n];
        for i in 0..n {
            self.transformation[i * n + i] = scale.get(i).copied().filter(|_| i < d).unwrap_or(1.0);
        }
    }

    /// Transform as a 4x4 matrix (3-D rasters only).
    pub fn transform_matrix(&self) -> Option<DMat4> {
        let cols: [f64; 16] = self.transformation.as_slice().try_into().ok()?;
        Some(DMat4::from_cols_array(&cols).transpose())
    }

    pub fn set_type_to_scalar(&mut self, bit_size: u64, mantissa: u64, signed: bool, semantic: ElementSemantic) {
        self.set_type_to_vector(bit_size, mantissa, signed, &[semantic]);
    }

    /// One element dimension whose components share a storage type.
    pub fn set_type_to_vector(
        &mut self,
        bit_size: u64,
        mantissa: u64,
        signed: bool,
        semantics: &[ElementSemantic],
    ) {
        self.elements = vec![semantics
            .iter()
            .map(|&s| ComponentType::new(s, bit_size, mantissa, signed))
            .collect()];
    }

    pub fn set_type_to_ubyte(&mut self, semantic: ElementSemantic) {
        self.set_type_to_scalar(8, 8, false, semantic);
    }

    pub fn set_type_to_ushort(&mut self, semantic: ElementSemantic) {
        self.set_type_to_scalar(16, 16, false, semantic);
    }

    pub fn set_type_to_float(&mut self, semantic: ElementSemantic) {
        self.set_type_to_scalar(32, 23, true, semantic);
    }

    pub fn set_type_to_double(&mut self, semantic: ElementSemantic) {
        self.set_type_to_scalar(64, 52, true, semantic);
    }

    /// Components across all element dimensions.
    pub fn components(&self) -> impl Iterator<Item = &ComponentType> {
        self.elements.iter().flatten()
    }

    #[inline]
    pub fn component_count(&self) -> u64 {
        self.components().count() as u64
    }

    #[inline]
    pub fn is_scalar(&self) -> bool {
        self.component_count() == 1
    }

    /// Bytes per element: each component rounded up to whole bytes.
    pub fn element_byte_size(&self) -> u64 {
        self.components().map(ComponentType::byte_size).sum()
    }

    // ------------------------------------------------------------------
    // LOD / brick address arithmetic
    // ------------------------------------------------------------------

    /// Finest LOD vector (all zeros).
    pub fn finest_lod(&self) -> Coords {
        zeros(self.lod_level_count.len())
    }

    /// Coarsest LOD vector.
    pub fn coarsest_lod(&self) -> Coords {
        self.lod_level_count.iter().map(|&c| c.saturating_sub(1)).collect()
    }

    /// Every LOD vector in payload order, coarsest first.
    pub fn lod_permutations(&self) -> Vec<Coords> {
        GridIter::new(&self.lod_level_count)
            .map(|g| {
                g.iter()
                    .zip(&self.lod_level_count)
                    .map(|(&level, &count)| count - 1 - level)
                    .collect()
            })
            .collect()
    }

    fn check_lod(&self, lod: &[u64]) -> Result<()> {
        if lod.len() != self.lod_level_count.len() {
            return Err(Error::out_of_range(format!(
                "LOD vector has {} entries, raster has {} LOD groups",
                lod.len(),
                self.lod_level_count.len()
            )));
        }
        for (group, (&level, &count)) in lod.iter().zip(&self.lod_level_count).enumerate() {
            if level >= count {
                return Err(Error::out_of_range(format!(
                    "LOD {} of group {} (group has {} levels)",
                    level, group, count
                )));
            }
        }
        Ok(())
    }

    fn check_layout(&self) -> Result<()> {
        let d = self.dimension();
        let lens = [
            ("domain semantics", self.domain_semantics.len()),
            ("brick size", self.brick_size.len()),
            ("brick overlap", self.brick_overlap.len()),
            ("LOD decimation factor", self.lod_dec_factor.len()),
            ("LOD groups", self.lod_groups.len()),
        ];
        for (name, len) in lens {
            if len != d {
                return Err(Error::validation(format!(
                    "{} has {} entries for a {}-D domain",
                    name, len, d
                )));
            }
        }
        for axis in 0..d {
            if self.brick_size[axis] == 0 {
                return Err(Error::validation(format!("brick size of axis {} is zero", axis)));
            }
            if self.lod_dec_factor[axis] == 0 {
                return Err(Error::validation(format!("LOD decimation of axis {} is zero", axis)));
            }
            if self.lod_groups[axis] >= self.lod_level_count.len() as u64 {
                return Err(Error::validation(format!(
                    "axis {} references LOD group {} of {}",
                    axis,
                    self.lod_groups[axis],
                    self.lod_level_count.len()
                )));
            }
            if self.brick_overlap[axis] >= self.brick_size[axis] {
                return Err(Error::validation(format!(
                    "overlap {} of axis {} is not smaller than brick size {}",
                    self.brick_overlap[axis], axis, self.brick_size[axis]
                )));
            }
        }
        let mut permutations: u64 = 1;
        for (group, &count) in self.lod_level_count.iter().enumerate() {
            if count == 0 || count > MAX_LOD_LEVELS {
                return Err(Error::validation(format!("LOD group {} has {} levels", group, count)));
            }
            permutations = permutations
                .checked_mul(count)
                .filter(|&p| p <= MAX_LOD_PERMUTATIONS)
                .ok_or_else(|| Error::validation("too many LOD level combinations"))?;
        }
        if let Some(c) = self.components().find(|c| c.bit_size == 0 || c.bit_size > 64) {
            return Err(Error::validation(format!("component of {} bits", c.bit_size)));
        }
        Ok(())
    }

    #[inline]
    fn axis_level(&self, lod: &[u64], axis: usize) -> u64 {
        lod[self.lod_groups[axis] as usize]
    }

    /// Per-axis element counts at a LOD: `ceil(domain / dec^level)`.
    pub fn lod_domain_size(&self, lod: &[u64]) -> Result<Coords> {
        self.check_layout()?;
        self.check_lod(lod)?;
        Ok((0..self.dimension())
            .map(|axis| {
                let dec = self.lod_dec_factor[axis];
                let mut n = self.domain_size[axis];
                for _ in 0..self.axis_level(lod, axis) {
                    if dec < 2 || n <= 1 {
                        break;
                    }
                    n = ceil_div(n, dec);
                }
                n
            })
            .collect())
    }

    /// Per-axis brick counts at a LOD.
    pub fn brick_count(&self, lod: &[u64]) -> Result<Coords> {
        let n = self.lod_domain_size(lod)?;
        Ok(n.iter().zip(&self.brick_size).map(|(&n, &b)| ceil_div(n, b)).collect())
    }

    /// Stored extent `(start, len)` of brick `index` on one axis.
    #[inline]
    fn axis_extent(&self, n: u64, axis: usize, index: u64) -> (u64, u64) {
        let b = self.brick_size[axis];
        let o = self.brick_overlap[axis];
        let interior_start = index.saturating_mul(b).min(n);
        let interior_end = interior_start.saturating_add(b).min(n);
        let start = interior_start.saturating_sub(o);
        let end = interior_end.saturating_add(o).min(n);
        (start, end - start)
    }

    fn check_brick(&self, counts: &[u64], brick: &[u64]) -> Result<()> {
        if brick.len() != counts.len() {
            return Err(Error::out_of_range(format!(
                "brick vector has {} entries for a {}-D raster",
                brick.len(),
                counts.len()
            )));
        }
        for (axis, (&b, &c)) in brick.iter().zip(counts).enumerate() {
            if b >= c {
                return Err(Error::out_of_range(format!(
                    "brick {} on axis {} (axis has {} bricks)",
                    b, axis, c
                )));
            }
        }
        Ok(())
    }

    /// Stored voxel extent of a brick, overlap included.
    pub fn brick_size(&self, lod: &[u64], brick: &[u64]) -> Result<Coords> {
        let n = self.lod_domain_size(lod)?;
        let counts = self.brick_count(lod)?;
        self.check_brick(&counts, brick)?;
        Ok((0..self.dimension()).map(|axis| self.axis_extent(n[axis], axis, brick[axis]).1).collect())
    }

    /// Voxel offset of the stored brick inside the level volume.
    pub fn brick_origin(&self, lod: &[u64], brick: &[u64]) -> Result<Coords> {
        let n = self.lod_domain_size(lod)?;
        let counts = self.brick_count(lod)?;
        self.check_brick(&counts, brick)?;
        Ok((0..self.dimension()).map(|axis| self.axis_extent(n[axis], axis, brick[axis]).0).collect())
    }

    /// Sum of stored extents of bricks `0..upto` on one axis.
    ///
    /// Every brick carries `o` halo voxels on each side except where the
    /// domain edge clips it: none left of the first brick, none right of
    /// the last, and at most the last brick's interior right of the second
    /// to last. Requires `o < b`, which [`Self::check_layout`] enforces.
    fn axis_prefix(&self, n: u64, axis: usize, upto: u64) -> Result<u64> {
        let b = self.brick_size[axis];
        let o = self.brick_overlap[axis];
        let count = ceil_div(n, b);
        let upto = upto.min(count);
        if upto == 0 {
            return Ok(0);
        }
        let interior = upto.checked_mul(b).map_or(n, |v| v.min(n));
        let last_interior = n - (count - 1) * b;
        let full_right = upto.min(count.saturating_sub(2));
        let clipped_right = if count >= 2 && upto >= count - 1 { o.min(last_interior) } else { 0 };
        o.checked_mul(upto - 1)
            .and_then(|left| o.checked_mul(full_right).and_then(|right| left.checked_add(right)))
            .and_then(|halo| halo.checked_add(clipped_right))
            .and_then(|halo| halo.checked_add(interior))
            .ok_or_else(|| overflow(axis))
    }

    /// Element count of one whole level as stored (halos included).
    fn lod_element_count(&self, n: &[u64], counts: &[u64]) -> Result<u64> {
        (0..self.dimension()).try_fold(1u64, |acc, axis| {
            let extent = self.axis_prefix(n[axis], axis, counts[axis])?;
            acc.checked_mul(extent).ok_or_else(|| overflow(axis))
        })
    }

    /// Payload bytes of one LOD level.
    pub fn lod_byte_size(&self, lod: &[u64]) -> Result<u64> {
        let n = self.lod_domain_size(lod)?;
        let counts = self.brick_count(lod)?;
        self.lod_element_count(&n, &counts)?
            .checked_mul(self.element_byte_size())
            .ok_or_else(|| Error::invalid("raster level size overflows 64 bits"))
    }

    /// Total payload bytes over all levels.
    pub fn data_size(&self) -> Result<u64> {
        self.check_layout()?;
        self.lod_permutations().iter().try_fold(0u64, |total, lod| {
            total
                .checked_add(self.lod_byte_size(lod)?)
                .ok_or_else(|| Error::invalid("raster payload size overflows 64 bits"))
        })
    }

    /// Byte range of a brick inside the payload.
    ///
    /// Offset is the size of every coarser level stored before this one plus
    /// the size of every brick preceding this one in its level.
    pub fn brick_byte_range(&self, lod: &[u64], brick: &[u64]) -> Result<Range<u64>> {
        let n = self.lod_domain_size(lod)?;
        let counts = self.brick_count(lod)?;
        self.check_brick(&counts, brick)?;
        let too_large = || Error::invalid("raster brick offset overflows 64 bits");

        let mut level_offset: u64 = 0;
        for other in self.lod_permutations() {
            if other.as_slice() == lod {
                break;
            }
            level_offset = level_offset.checked_add(self.lod_byte_size(&other)?).ok_or_else(too_large)?;
        }

        // Bricks before `brick` in first-axis-fastest order: those equal on all
        // higher axes and smaller on axis k, with any index on lower axes.
        let d = self.dimension();
        let mut elements_before: u64 = 0;
        for k in 0..d {
            let mut term = self.axis_prefix(n[k], k, brick[k])?;
            for j in 0..k {
                term = term.checked_mul(self.axis_prefix(n[j], j, counts[j])?).ok_or_else(too_large)?;
            }
            for j in k + 1..d {
                term = term.checked_mul(self.axis_extent(n[j], j, brick[j]).1).ok_or_else(too_large)?;
            }
            elements_before = elements_before.checked_add(term).ok_or_else(too_large)?;
        }

        let voxels = (0..d).try_fold(1u64, |acc, axis| {
            acc.checked_mul(self.axis_extent(n[axis], axis, brick[axis]).1)
        });
        let eb = self.element_byte_size();
        let start = elements_before
            .checked_mul(eb)
            .and_then(|bytes| bytes.checked_add(level_offset))
            .ok_or_else(too_large)?;
        let end = voxels
            .and_then(|v| v.checked_mul(eb))
            .and_then(|bytes| bytes.checked_add(start))
            .ok_or_else(too_large)?;
        Ok(start..end)
    }

    /// LOD and brick of the coarsest level's first brick.
    pub fn smallest_brick_index(&self) -> BrickIndex {
        BrickIndex { lod: self.coarsest_lod(), brick: zeros(self.dimension()) }
    }

    /// Stored extent of [`Self::smallest_brick_index`].
    pub fn smallest_brick_size(&self) -> Result<Coords> {
        let index = self.smallest_brick_index();
        self.brick_size(&index.lod, &index.brick)
    }

    // ------------------------------------------------------------------
    // Payload access
    // ------------------------------------------------------------------

    #[inline]
    pub fn has_payload(&self) -> bool {
        !matches!(self.payload, RasterPayload::Empty)
    }

    /// Read one brick; the caller owns the returned buffer.
    pub fn get_data(&self, lod: &[u64], brick: &[u64]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.get_data_into(&mut out, lod, brick)?;
        Ok(out)
    }

    /// Read one brick into `out`, replacing its contents.
    pub fn get_data_into(&self, out: &mut Vec<u8>, lod: &[u64], brick: &[u64]) -> Result<()> {
        let range = self.brick_byte_range(lod, brick)?;
        match &self.payload {
            RasterPayload::Empty => Err(Error::invalid(format!("raster block '{}' has no payload", self.id))),
            RasterPayload::Memory(data) => {
                let bytes = data
                    .get(range.start as usize..range.end as usize)
                    .ok_or_else(|| Error::invalid("brick extends past the payload"))?;
                out.clear();
                out.extend_from_slice(bytes);
                Ok(())
            }
            RasterPayload::Stored(stored) => {
                *out = stored.read(range)?;
                Ok(())
            }
        }
    }

    /// Replace the whole payload. Its length must match [`Self::data_size`].
    pub fn set_payload(&mut self, data: Vec<u8>) -> Result<()> {
        let expected = self.data_size()?;
        if data.len() as u64 != expected {
            return Err(Error::validation(format!(
                "payload has {} bytes, layout needs {}",
                data.len(),
                expected
            )));
        }
        self.payload = RasterPayload::Memory(data);
        Ok(())
    }

    /// Overwrite one brick.
    ///
    /// Uncompressed payloads in a writable store are patched in place; any
    /// other stored payload is first loaded into memory.
    pub fn set_brick_data(&mut self, lod: &[u64], brick: &[u64], data: &[u8]) -> Result<()> {
        let range = self.brick_byte_range(lod, brick)?;
        if data.len() as u64 != range.end - range.start {
            return Err(Error::validation(format!(
                "brick data has {} bytes, brick needs {}",
                data.len(),
                range.end - range.start
            )));
        }

        let materialized = match &self.payload {
            RasterPayload::Empty => Some(vec![0u8; self.data_size()? as usize]),
            RasterPayload::Memory(_) => None,
            RasterPayload::Stored(stored) => {
                if stored.compression == CompressionScheme::None && stored.store.is_writable() {
                    stored.store.write_at(stored.offset + range.start, data)?;
                    return Ok(());
                }
                Some(stored.to_vec()?)
            }
        };
        if let Some(buf) = materialized {
            self.payload = RasterPayload::Memory(buf);
        }
        if let RasterPayload::Memory(buf) = &mut self.payload {
            let target = buf
                .get_mut(range.start as usize..range.end as usize)
                .ok_or_else(|| Error::invalid("brick extends past the payload"))?;
            target.copy_from_slice(data);
        }
        Ok(())
    }

    /// Build the bricked LOD pyramid from a flat finest-level volume.
    ///
    /// `flat` holds the whole domain first-axis-fastest. Every coarser level
    /// is a box average of the finest voxels it covers, per component.
    pub fn build_from_flat_data(&mut self, flat: &[u8]) -> Result<()> {
        self.check_layout()?;
        let eb = self.element_byte_size() as usize;
        let expected = product(&self.domain_size) as usize * eb;
        if flat.len() != expected {
            return Err(Error::validation(format!(
                "flat volume has {} bytes, domain needs {}",
                flat.len(),
                expected
            )));
        }
        let types: Vec<ScalarType> = self
            .components()
            .map(|c| {
                c.scalar_type().ok_or_else(|| {
                    Error::unsupported(format!(
                        "cannot average {}-bit components with {} mantissa bits",
                        c.bit_size, c.mantissa
                    ))
                })
            })
            .collect::<Result<_>>()?;

        let mut out = Vec::with_capacity(self.data_size()? as usize);
        for lod in self.lod_permutations() {
            let level: Cow<'_, [u8]> = if lod.iter().all(|&l| l == 0) {
                Cow::Borrowed(flat)
            } else {
                Cow::Owned(self.downsample(flat, &lod, &types)?)
            };
            let n = self.lod_domain_size(&lod)?;
            for brick in GridIter::new(&self.brick_count(&lod)?) {
                let (origin, extent): (Coords, Coords) = (0..self.dimension())
                    .map(|axis| self.axis_extent(n[axis], axis, brick[axis]))
                    .unzip();
                copy_region(&level, &n, &origin, &extent, eb, &mut out);
            }
        }
        tracing::debug!(id = %self.id, bytes = out.len(), levels = self.lod_permutations().len(), "built LOD pyramid");
        self.payload = RasterPayload::Memory(out);
        Ok(())
    }

    /// Box-average the finest level down to `lod`.
    fn downsample(&self, flat: &[u8], lod: &[u64], types: &[ScalarType]) -> Result<Vec<u8>> {
        let d = self.dimension();
        let finest = self.domain_size.clone();
        let n = self.lod_domain_size(lod)?;
        let factors: Coords = (0..d)
            .map(|axis| {
                let dec = self.lod_dec_factor[axis];
                dec.checked_pow(self.axis_level(lod, axis) as u32)
                    .unwrap_or(u64::MAX)
                    .min(finest[axis])
                    .max(1)
            })
            .collect();
        let offsets: Vec<usize> = types
            .iter()
            .scan(0usize, |acc, t| {
                let at = *acc;
                *acc += t.num_bytes();
                Some(at)
            })
            .collect();
        let eb = self.element_byte_size() as usize;

        let mut level = vec![0u8; product(&n) as usize * eb];
        level.par_chunks_mut(eb).enumerate().for_each(|(index, voxel)| {
            let pos = unlinear_index(index as u64, &n);
            let start: Coords = (0..d).map(|axis| pos[axis] * factors[axis]).collect();
            let extent: Coords = (0..d)
                .map(|axis| ((pos[axis] + 1) * factors[axis]).min(finest[axis]) - start[axis])
                .collect();

            let mut sums = vec![0.0f64; types.len()];
            let mut count = 0u64;
            for local in GridIter::new(&extent) {
                let src: Coords = local.iter().zip(&start).map(|(l, s)| l + s).collect();
                let at = linear_index(&src, &finest) as usize * eb;
                for (c, ty) in types.iter().enumerate() {
                    sums[c] += ty.read_f64(&flat[at + offsets[c]..]);
                }
                count += 1;
            }
            for (c, ty) in types.iter().enumerate() {
                ty.write_f64(&mut voxel[offsets[c]..], sums[c] / count.max(1) as f64);
            }
        });
        Ok(level)
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    /// Check internal consistency before the block joins a container.
    pub fn verify(&self) -> Result<()> {
        self.check_layout()?;
        let d = self.dimension();
        let transform_len = if d == 0 { 0 } else { (d + 1) * (d + 1) };
        if self.transformation.len() != transform_len {
            return Err(Error::validation(format!(
                "transformation has {} entries, expected {}",
                self.transformation.len(),
                transform_len
            )));
        }
        for axis in 0..d {
            if self.domain_size[axis] == 0 {
                return Err(Error::validation(format!("domain size of axis {} is zero", axis)));
            }
            let levels = self.lod_level_count[self.lod_groups[axis] as usize];
            if levels > 1 && self.lod_dec_factor[axis] < 2 {
                return Err(Error::validation(format!(
                    "axis {} has {} LOD levels but decimation factor {}",
                    axis, levels, self.lod_dec_factor[axis]
                )));
            }
        }
        if self.elements.is_empty() || self.elements.iter().any(Vec::is_empty) {
            return Err(Error::validation("element type has an empty dimension"));
        }
        for c in self.components() {
            if c.mantissa > c.bit_size {
                return Err(Error::validation(format!(
                    "invalid component layout: {} bits, {} mantissa",
                    c.bit_size, c.mantissa
                )));
            }
        }

        let expected = self.data_size()?;
        let stored = match &self.payload {
            RasterPayload::Empty => None,
            RasterPayload::Memory(data) => Some(data.len() as u64),
            RasterPayload::Stored(s) if s.compression == CompressionScheme::None => Some(s.len),
            RasterPayload::Stored(_) => None,
        };
        if let Some(len) = stored {
            if len != expected {
                return Err(Error::validation(format!(
                    "payload has {} bytes, layout needs {}",
                    len, expected
                )));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    /// Parse the raster header following a generic block header.
    pub(crate) fn parse(
        cursor: &mut StoreCursor<'_>,
        store: &Arc<ByteStore>,
        id: String,
        compression: CompressionScheme,
        block_end: u64,
    ) -> Result<Self> {
        if let CompressionScheme::Unknown(tag) = compression {
            return Err(Error::unsupported(format!("raster compression scheme {}", tag)));
        }
        let mut block = Self::new(id);
        block.compression = compression;

        let dim = cursor.read_u64()?;
        if dim > MAX_DIMENSION {
            return Err(Error::invalid(format!("raster dimension {}", dim)));
        }
        if dim > 0 {
            block.domain_semantics = cursor
                .read_u64_array(dim)?
                .into_iter()
                .map(DomainSemantic::from_tag)
                .collect();
            let n = (dim + 1) * (dim + 1);
            block.transformation = (0..n).map(|_| cursor.read_f64()).collect::<Result<_>>()?;
            block.domain_size = Coords::from_vec(cursor.read_u64_array(dim)?);
            block.brick_size = Coords::from_vec(cursor.read_u64_array(dim)?);
            block.brick_overlap = Coords::from_vec(cursor.read_u64_array(dim)?);
            block.lod_dec_factor = Coords::from_vec(cursor.read_u64_array(dim)?);
            block.lod_groups = Coords::from_vec(cursor.read_u64_array(dim)?);
        }
        block.lod_level_count = Coords::from_vec(cursor.read_u64_vec()?);

        let element_dims = cursor.read_u64()?;
        let sizes = cursor.read_u64_array(element_dims)?;
        if sizes.iter().sum::<u64>() > MAX_COMPONENTS {
            return Err(Error::invalid("too many element components"));
        }
        for size in sizes {
            let mut dim_components = Vec::with_capacity(size as usize);
            for _ in 0..size {
                let semantic = ElementSemantic::from_tag(cursor.read_u64()?);
                let bit_size = cursor.read_u64()?;
                let mantissa = cursor.read_u64()?;
                let signed = cursor.read_bool()?;
                dim_components.push(ComponentType::new(semantic, bit_size, mantissa, signed));
            }
            block.elements.push(dim_components);
        }

        let offset_to_data = cursor.read_u64()?;
        let payload_start = cursor
            .pos()
            .checked_add(offset_to_data)
            .filter(|&p| p <= block_end)
            .ok_or_else(|| Error::invalid("raster payload starts past the end of its block"))?;
        let available = block_end - payload_start;

        // Rejects layouts whose size does not fit in 64 bits, compressed or not.
        let expected = block.data_size()?;
        let len = if compression == CompressionScheme::None {
            if available == 0 {
                0
            } else if expected > available {
                return Err(Error::invalid(format!(
                    "raster payload truncated: {} of {} bytes",
                    available, expected
                )));
            } else {
                expected
            }
        } else {
            available
        };

        if len > 0 {
            block.payload = RasterPayload::Stored(StoredPayload {
                store: Arc::clone(store),
                offset: payload_start,
                len,
                compression,
                inflated: Arc::default(),
            });
        }
        Ok(block)
    }

    /// Raster header bytes (everything between the generic header and the payload).
    pub(crate) fn encode_header(&self, endian: Endian) -> Vec<u8> {
        let mut buf = ByteBuf::new(endian);
        let d = self.dimension();
        buf.put_u64(d as u64);
        if d > 0 {
            for s in &self.domain_semantics {
                buf.put_u64(s.tag());
            }
            for &t in &self.transformation {
                buf.put_f64(t);
            }
            for v in [
                &self.domain_size,
                &self.brick_size,
                &self.brick_overlap,
                &self.lod_dec_factor,
                &self.lod_groups,
            ] {
                for &x in v.iter() {
                    buf.put_u64(x);
                }
            }
        }
        buf.put_u64_vec(&self.lod_level_count);
        buf.put_u64(self.elements.len() as u64);
        for dim in &self.elements {
            buf.put_u64(dim.len() as u64);
        }
        for c in self.components() {
            buf.put_u64(c.semantic.tag());
            buf.put_u64(c.bit_size);
            buf.put_u64(c.mantissa);
            buf.put_bool(c.signed);
        }
        buf.put_u64(0); // payload follows directly
        buf.into_inner()
    }

    /// Payload bytes as they should be written for `self.compression`.
    pub(crate) fn payload_for_write(&self) -> Result<WritePayload<'_>> {
        let raw: Cow<'_, [u8]> = match &self.payload {
            RasterPayload::Empty => return Ok(WritePayload::Bytes(Cow::Borrowed(&[]))),
            RasterPayload::Memory(data) => Cow::Borrowed(data.as_slice()),
            RasterPayload::Stored(stored) => {
                if stored.compression == self.compression {
                    return Ok(WritePayload::Copy {
                        store: stored.store.as_ref(),
                        offset: stored.offset,
                        len: stored.len,
                    });
                }
                Cow::Owned(stored.to_vec()?)
            }
        };
        match self.compression {
            CompressionScheme::None => Ok(WritePayload::Bytes(raw)),
            scheme => Ok(WritePayload::Bytes(Cow::Owned(compression::compress(scheme, &raw)?))),
        }
    }
}

/// Append the box `origin..origin+extent` of a level volume to `out`.
fn copy_region(level: &[u8], n: &[u64], origin: &[u64], extent: &[u64], eb: usize, out: &mut Vec<u8>) {
    if n.is_empty() {
        out.extend_from_slice(&level[..eb]);
        return;
    }
    let run = extent[0] as usize * eb;
    for row in GridIter::new(&extent[1..]) {
        let mut src: Coords = Coords::with_capacity(n.len());
        src.push(origin[0]);
        src.extend(row.iter().zip(&origin[1..]).map(|(r, o)| r + o));
        let at = linear_index(&src, n) as usize * eb;
        out.extend_from_slice(&level[at..at + run]);
    }
}

fn overflow(axis: usize) -> Error {
    Error::invalid(format!("raster extent of axis {} overflows 64 bits", axis))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_volume(size: [u64; 3], brick: u64, overlap: u64) -> (RasterDataBlock, Vec<u8>) {
        let block = RasterDataBlock::volume("ramp", size, brick, overlap, 2);
        let flat: Vec<u8> = GridIter::new(&size).map(|p| (p[0] + 2 * p[1] + 3 * p[2]) as u8).collect();
        (block, flat)
    }

    #[test]
    fn test_brick_counts_per_lod() {
        let block = RasterDataBlock::volume("v", [100, 100, 100], 32, 1, 2);
        assert_eq!(block.lod_level_count.as_slice(), &[3]);
        assert_eq!(block.brick_count(&[0]).expect("lod 0").as_slice(), &[4, 4, 4]);
        assert_eq!(block.brick_count(&[1]).expect("lod 1").as_slice(), &[2, 2, 2]);
        assert_eq!(block.brick_count(&[2]).expect("lod 2").as_slice(), &[1, 1, 1]);
        assert!(matches!(block.brick_count(&[3]), Err(Error::OutOfRange(_))));
    }

    #[test]
    fn test_brick_extent_includes_halo() {
        let block = RasterDataBlock::volume("v", [100, 100, 100], 32, 1, 2);
        // first brick: interior 0..32, halo only on the high side
        assert_eq!(block.brick_size(&[0], &[0, 0, 0]).expect("size").as_slice(), &[33, 33, 33]);
        // inner brick: halo on both sides
        assert_eq!(block.brick_size(&[0], &[1, 2, 1]).expect("size").as_slice(), &[34, 34, 34]);
        // last brick: interior 96..100 plus low halo
        assert_eq!(block.brick_size(&[0], &[3, 0, 0]).expect("size").as_slice(), &[5, 33, 33]);
        // coarsest level is a single brick covering the whole 25^3 domain
        assert_eq!(block.smallest_brick_size().expect("size").as_slice(), &[25, 25, 25]);
        assert!(matches!(block.brick_size(&[0], &[4, 0, 0]), Err(Error::OutOfRange(_))));
    }

    #[test]
    fn test_byte_ranges_tile_payload() {
        let block = RasterDataBlock::volume("v", [40, 20, 9], 8, 1, 2);
        let mut ranges = Vec::new();
        for lod in block.lod_permutations() {
            for brick in GridIter::new(&block.brick_count(&lod).expect("count")) {
                ranges.push(block.brick_byte_range(&lod, &brick).expect("range"));
            }
        }
        assert_eq!(ranges[0].start, 0);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(ranges.last().map(|r| r.end), Some(block.data_size().expect("size")));
    }

    #[test]
    fn test_build_and_read_finest_brick() {
        let (mut block, flat) = ramp_volume([20, 12, 6], 8, 1);
        block.build_from_flat_data(&flat).expect("build");
        block.verify().expect("verify");

        let brick = [1u64, 0, 0];
        let data = block.get_data(&[0], &brick).expect("brick");
        let origin = block.brick_origin(&[0], &brick).expect("origin");
        let extent = block.brick_size(&[0], &brick).expect("extent");
        assert_eq!(origin.as_slice(), &[7, 0, 0]);
        assert_eq!(data.len() as u64, product(&extent));
        for (i, local) in GridIter::new(&extent).enumerate() {
            let global: Vec<u64> = local.iter().zip(&origin).map(|(l, o)| l + o).collect();
            assert_eq!(data[i], (global[0] + 2 * global[1] + 3 * global[2]) as u8);
        }
    }

    #[test]
    fn test_coarse_levels_average() {
        let mut block = RasterDataBlock::volume("c", [4, 4, 4], 2, 0, 2);
        let mut flat = vec![10u8; 64];
        flat[0] = 18; // lifts the first 2x2x2 block average by one
        block.build_from_flat_data(&flat).expect("build");
        assert_eq!(block.lod_permutations().len(), 2);
        let coarse = block.get_data(&[1], &[0, 0, 0]).expect("coarse");
        let mut expected = vec![10u8; 8];
        expected[0] = 11;
        assert_eq!(coarse, expected);
        assert_eq!(block.smallest_brick_index().lod.as_slice(), &[1]);
    }

    #[test]
    fn test_set_brick_data_in_memory() {
        let (mut block, flat) = ramp_volume([16, 16, 16], 8, 0);
        block.build_from_flat_data(&flat).expect("build");
        let patch = vec![0xAB; 512];
        block.set_brick_data(&[0], &[1, 1, 1], &patch).expect("patch");
        assert_eq!(block.get_data(&[0], &[1, 1, 1]).expect("read"), patch);
        assert!(block.set_brick_data(&[0], &[1, 1, 1], &patch[..10]).is_err());
    }

    #[test]
    fn test_verify_rejects_inconsistent_layout() {
        let mut block = RasterDataBlock::volume("bad", [10, 10, 10], 4, 1, 2);
        block.verify().expect("valid");

        block.brick_overlap[1] = 4;
        assert!(matches!(block.verify(), Err(Error::Validation(_))));
        block.brick_overlap[1] = 1;

        block.brick_size.pop();
        assert!(matches!(block.verify(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_scale_transform_matrix() {
        let mut block = RasterDataBlock::volume("t", [8, 8, 8], 8, 0, 2);
        block.set_scale_only_transformation(&[1.0, 2.0, 0.5]);
        let m = block.transform_matrix().expect("3-D");
        let p = m.transform_point3(glam::DVec3::new(1.0, 1.0, 1.0));
        assert_eq!(p, glam::DVec3::new(1.0, 2.0, 0.5));
    }

    #[test]
    fn test_multi_group_lod_order() {
        let mut block = RasterDataBlock::new("4d");
        block.domain_semantics = vec![DomainSemantic::X, DomainSemantic::Y, DomainSemantic::Z, DomainSemantic::Time];
        block.domain_size = coords(&[8, 8, 8, 4]);
        block.brick_size = coords(&[4, 4, 4, 2]);
        block.brick_overlap = zeros(4);
        block.lod_dec_factor = coords(&[2, 2, 2, 2]);
        block.lod_groups = coords(&[0, 0, 0, 1]);
        block.lod_level_count = coords(&[2, 2]);
        block.set_identity_transformation();
        block.set_type_to_ubyte(ElementSemantic::Intensity);
        block.verify().expect("verify");

        let order = block.lod_permutations();
        assert_eq!(order.len(), 4);
        assert_eq!(order[0].as_slice(), &[1, 1]);
        assert_eq!(order[3].as_slice(), &[0, 0]);
        assert_eq!(block.lod_domain_size(&[1, 0]).expect("size").as_slice(), &[4, 4, 4, 4]);
        assert_eq!(block.brick_count(&[0, 1]).expect("count").as_slice(), &[2, 2, 2, 1]);
    }

    #[test]
    fn test_axis_prefix_matches_per_brick_extents() {
        for (n, b, o) in [(1, 1, 0), (17, 8, 3), (16, 8, 3), (9, 4, 3), (25, 5, 4), (100, 32, 1), (7, 16, 2)] {
            let block = RasterDataBlock::volume("axis", [n, 1, 1], b, o, 2);
            let count = ceil_div(n, b);
            for upto in 0..=count {
                let summed: u64 = (0..upto).map(|i| block.axis_extent(n, 0, i).1).sum();
                assert_eq!(block.axis_prefix(n, 0, upto).expect("prefix"), summed, "n={} b={} o={} upto={}", n, b, o, upto);
            }
        }
    }

    #[test]
    fn test_huge_layout_reports_overflow() {
        let mut block = RasterDataBlock::volume("huge", [1 << 40, 1 << 40, 1 << 40], 1 << 39, 0, 2);
        assert!(matches!(block.data_size(), Err(Error::InvalidStructure(_))));
        assert!(block.verify().is_err());
        assert!(block.brick_byte_range(&[0], &[1, 1, 1]).is_err());

        // One brick per voxel over 2^50 voxels: sized in constant time.
        block.domain_size = coords(&[1 << 50, 1, 1]);
        block.brick_size = coords(&[1, 1, 1]);
        block.lod_level_count = coords(&[1]);
        assert_eq!(block.data_size().expect("fits"), 1 << 50);
        let range = block.brick_byte_range(&[0], &[(1 << 50) - 1, 0, 0]).expect("last brick");
        assert_eq!(range, (1 << 50) - 1..1 << 50);
    }

    #[test]
    fn test_layout_limits() {
        let mut block = RasterDataBlock::volume("limits", [8, 8, 8], 4, 0, 2);
        block.lod_level_count = coords(&[MAX_LOD_LEVELS + 1]);
        assert!(matches!(block.data_size(), Err(Error::Validation(_))));
        block.lod_level_count = coords(&[2]);
        block.elements[0][0].bit_size = 65;
        assert!(matches!(block.data_size(), Err(Error::Validation(_))));
    }
}
