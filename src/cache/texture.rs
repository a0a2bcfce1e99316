//! Texture formats and the backend seam used by the brick cache.

use crate::util::{Error, Result};

/// Internal format of a brick texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    R8,
    R16,
    Rgb8,
    Rgb16,
    Rgba8,
    Rgba16,
}

impl TextureFormat {
    /// Format for `components` channels of `bits` each.
    ///
    /// 8 and 16 bit channels with 1, 3 or 4 components are supported.
    pub fn from_element(bits: u64, components: u64) -> Result<Self> {
        match (bits, components) {
            (8, 1) => Ok(Self::R8),
            (16, 1) => Ok(Self::R16),
            (8, 3) => Ok(Self::Rgb8),
            (16, 3) => Ok(Self::Rgb16),
            (8, 4) => Ok(Self::Rgba8),
            (16, 4) => Ok(Self::Rgba16),
            _ => Err(Error::unsupported(format!(
                "no texture format for {} components of {} bits",
                components, bits
            ))),
        }
    }

    #[inline]
    pub fn channels(self) -> u64 {
        match self {
            Self::R8 | Self::R16 => 1,
            Self::Rgb8 | Self::Rgb16 => 3,
            Self::Rgba8 | Self::Rgba16 => 4,
        }
    }

    #[inline]
    pub fn bytes_per_channel(self) -> u64 {
        match self {
            Self::R8 | Self::Rgb8 | Self::Rgba8 => 1,
            Self::R16 | Self::Rgb16 | Self::Rgba16 => 2,
        }
    }

    #[inline]
    pub fn bytes_per_voxel(self) -> u64 {
        self.channels() * self.bytes_per_channel()
    }
}

/// Shape of a 3-D brick texture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextureDesc {
    pub extent: [u32; 3],
    pub format: TextureFormat,
    pub label: String,
}

impl TextureDesc {
    #[inline]
    pub fn voxel_count(&self) -> u64 {
        self.extent.iter().map(|&e| e as u64).product()
    }

    /// Tightly packed sample bytes expected by `create_texture_3d`.
    #[inline]
    pub fn data_size(&self) -> u64 {
        self.voxel_count() * self.format.bytes_per_voxel()
    }
}

/// Creates and destroys 3-D textures on one graphics context.
///
/// Implementations are driven from the thread that owns the context.
pub trait TextureBackend {
    type Texture;

    fn create_texture_3d(&mut self, desc: &TextureDesc, data: &[u8]) -> Result<Self::Texture>;

    fn destroy_texture(&mut self, texture: Self::Texture);

    /// Bytes a texture of `desc` occupies on the device.
    fn footprint(&self, desc: &TextureDesc) -> u64 {
        desc.data_size()
    }
}

/// Opaque handle returned by the brick cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub(crate) u64);

impl TextureHandle {
    #[inline]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TextureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "texture#{}", self.0)
    }
}

/// Texture record kept by [`HeadlessBackend`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeadlessTexture {
    pub serial: u64,
    pub desc: TextureDesc,
}

/// Backend without a device: validates uploads and counts texture lifetimes.
#[derive(Debug, Default)]
pub struct HeadlessBackend {
    next_serial: u64,
    created: u64,
    destroyed: u64,
    uploaded_bytes: u64,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn created(&self) -> u64 {
        self.created
    }

    #[inline]
    pub fn destroyed(&self) -> u64 {
        self.destroyed
    }

    /// Textures created and not yet destroyed.
    #[inline]
    pub fn live(&self) -> u64 {
        self.created - self.destroyed
    }

    #[inline]
    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded_bytes
    }
}

impl TextureBackend for HeadlessBackend {
    type Texture = HeadlessTexture;

    fn create_texture_3d(&mut self, desc: &TextureDesc, data: &[u8]) -> Result<HeadlessTexture> {
        if data.len() as u64 != desc.data_size() {
            return Err(Error::validation(format!(
                "texture '{}' expects {} bytes, got {}",
                desc.label,
                desc.data_size(),
                data.len()
            )));
        }
        self.next_serial += 1;
        self.created += 1;
        self.uploaded_bytes += data.len() as u64;
        Ok(HeadlessTexture { serial: self.next_serial, desc: desc.clone() })
    }

    fn destroy_texture(&mut self, _texture: HeadlessTexture) {
        self.destroyed += 1;
    }
}
