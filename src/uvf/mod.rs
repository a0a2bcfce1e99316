//! UVF container format.
//!
//! A UVF file is the magic `UVF-DATA`, a [`GlobalHeader`], then a chain of
//! data blocks. Blocks are parsed into the closed [`Block`] enum: bricked
//! rasters, histograms, key/value metadata, or opaque blocks that are
//! carried through unchanged.

pub mod block;
pub mod checksum;
pub mod compression;
pub mod container;
pub mod format;
pub mod header;
pub mod histogram;
pub mod raster;

pub use block::{writer_version, Block, BlockHeader, KeyValuePairDataBlock, OpaqueBlock};
pub use container::{Container, OpenOptions};
pub use format::*;
pub use header::GlobalHeader;
pub use histogram::{Histogram1DDataBlock, Histogram2DDataBlock, GRADIENT_BINS};
pub use raster::{BrickIndex, ComponentType, RasterDataBlock};
