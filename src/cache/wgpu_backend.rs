//! wgpu 3-D texture backend.

use wgpu::util::DeviceExt;

use super::texture::{TextureBackend, TextureDesc, TextureFormat};
use crate::util::Result;

/// Uploads bricks as `D3` textures on a wgpu device.
///
/// wgpu has no three-channel formats, so RGB bricks are expanded to RGBA with
/// an opaque alpha channel. 16-bit bricks need a device created with
/// `wgpu::Features::TEXTURE_FORMAT_16BIT_NORM`.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
}

impl WgpuBackend {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self { device, queue }
    }

    #[inline]
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    fn device_format(format: TextureFormat) -> wgpu::TextureFormat {
        match format {
            TextureFormat::R8 => wgpu::TextureFormat::R8Unorm,
            TextureFormat::R16 => wgpu::TextureFormat::R16Unorm,
            TextureFormat::Rgb8 | TextureFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
            TextureFormat::Rgb16 | TextureFormat::Rgba16 => wgpu::TextureFormat::Rgba16Unorm,
        }
    }
}

/// Insert an opaque alpha channel after every RGB triple.
fn expand_rgb(data: &[u8], bytes_per_channel: usize) -> Vec<u8> {
    let texel = 3 * bytes_per_channel;
    let mut out = Vec::with_capacity(data.len() / 3 * 4);
    for rgb in data.chunks_exact(texel) {
        out.extend_from_slice(rgb);
        out.extend(std::iter::repeat(0xFF).take(bytes_per_channel));
    }
    out
}

impl TextureBackend for WgpuBackend {
    type Texture = wgpu::Texture;

    fn create_texture_3d(&mut self, desc: &TextureDesc, data: &[u8]) -> Result<wgpu::Texture> {
        let expanded;
        let bytes = match desc.format {
            TextureFormat::Rgb8 | TextureFormat::Rgb16 => {
                expanded = expand_rgb(data, desc.format.bytes_per_channel() as usize);
                expanded.as_slice()
            }
            _ => data,
        };
        let texture = self.device.create_texture_with_data(
            &self.queue,
            &wgpu::TextureDescriptor {
                label: Some(desc.label.as_str()),
                size: wgpu::Extent3d {
                    width: desc.extent[0],
                    height: desc.extent[1],
                    depth_or_array_layers: desc.extent[2],
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D3,
                format: Self::device_format(desc.format),
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            },
            wgpu::util::TextureDataOrder::LayerMajor,
            bytes,
        );
        Ok(texture)
    }

    fn destroy_texture(&mut self, texture: wgpu::Texture) {
        texture.destroy();
    }

    fn footprint(&self, desc: &TextureDesc) -> u64 {
        let channels = match desc.format.channels() {
            3 => 4,
            n => n,
        };
        desc.voxel_count() * channels * desc.format.bytes_per_channel()
    }
}
