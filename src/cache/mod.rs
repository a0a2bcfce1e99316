//! GPU brick cache.
//!
//! Bricks are keyed by `(dataset, LOD, brick)` and uploaded through a
//! [`TextureBackend`]. [`HeadlessBackend`] runs without a device; the `gpu`
//! feature adds a wgpu backend.

mod brick_cache;
mod key;
mod texture;
#[cfg(feature = "gpu")]
mod wgpu_backend;

pub use brick_cache::{BrickCache, CacheStats};
pub use key::BrickKey;
pub use texture::{HeadlessBackend, HeadlessTexture, TextureBackend, TextureDesc, TextureFormat, TextureHandle};
#[cfg(feature = "gpu")]
pub use wgpu_backend::WgpuBackend;
