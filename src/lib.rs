//! # UVF
//!
//! Out-of-core volume streaming: a checksummed multiresolution container
//! format, brick address arithmetic over its raster blocks, a budgeted GPU
//! brick cache and a time-sliced progressive render scheduler.
//!
//! ## Modules
//!
//! - [`util`] - Errors, coordinate vectors, scalar types
//! - [`store`] - Random-access file storage and endian-aware cursors
//! - [`uvf`] - Container format, blocks, rasters and histograms
//! - [`dataset`] - Opened volumes and the brick source seam
//! - [`cache`] - Reference-counted brick textures under a byte budget
//! - [`render`] - Progressive frame scheduling
//! - [`config`] - Streaming settings
//!
//! ## Example
//!
//! ```ignore
//! use uvf::prelude::*;
//!
//! let config = StreamingConfig::default();
//! let dataset = VolumeDataset::open("head.uvf", &config)?;
//! let mut cache = BrickCache::new(HeadlessBackend::new(), config.cache_budget_bytes);
//! let mut scheduler = ProgressiveScheduler::from_config(&config);
//!
//! scheduler.begin_frame(dataset.brick_list(&dataset.volume().coarsest_lod())?);
//! while scheduler.needs_redraw() {
//!     scheduler.advance(&mut cache, &dataset, &mut sink, &SystemClock::new());
//! }
//! ```

pub mod cache;
pub mod config;
pub mod dataset;
pub mod render;
pub mod store;
pub mod util;
pub mod uvf;

// Re-export commonly used types
pub use config::StreamingConfig;
pub use util::{Coords, Error, ErrorKind, Result};
pub use uvf::{Container, OpenOptions};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cache::{BrickCache, BrickKey, HeadlessBackend, TextureBackend, TextureHandle};
    pub use crate::config::StreamingConfig;
    pub use crate::dataset::{BrickSource, DatasetId, VolumeDataset};
    pub use crate::render::{
        BrickDraw, Clock, FrameProgress, FrameState, ProgressiveScheduler, RenderSink, SystemClock,
    };
    pub use crate::util::{Coords, Error, Result};
    pub use crate::uvf::{
        Block, BrickIndex, ChecksumScheme, CompressionScheme, Container, GlobalHeader, OpenOptions,
        RasterDataBlock,
    };
}
