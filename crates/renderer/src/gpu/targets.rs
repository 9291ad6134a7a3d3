use anyhow::{anyhow, Context, Result};
use image::RgbaImage;
use kernel::Extent;

use super::pipeline::KERNEL_OUTPUT_FORMAT;

const BYTES_PER_PIXEL: u32 = 4;

fn texture_size(extent: Extent) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: extent.width,
        height: extent.height,
        depth_or_array_layers: 1,
    }
}

fn create_output_texture(
    device: &wgpu::Device,
    label: &str,
    extent: Extent,
    extra_usage: wgpu::TextureUsages,
) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: texture_size(extent),
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: KERNEL_OUTPUT_FORMAT,
        usage: wgpu::TextureUsages::STORAGE_BINDING | extra_usage,
        view_formats: &[],
    })
}

/// Storage texture the on-screen path computes into before the blit.
/// Kept across frames and recreated when the surface size changes.
pub(crate) struct FrameTarget {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    extent: Extent,
}

impl FrameTarget {
    pub(crate) fn new(device: &wgpu::Device, extent: Extent) -> Self {
        let texture = create_output_texture(
            device,
            "iterscope frame",
            extent,
            wgpu::TextureUsages::TEXTURE_BINDING,
        );
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            texture,
            view,
            extent,
        }
    }

    pub(crate) fn extent(&self) -> Extent {
        self.extent
    }

    pub(crate) fn view(&self) -> &wgpu::TextureView {
        &self.view
    }
}

impl Drop for FrameTarget {
    fn drop(&mut self) {
        self.texture.destroy();
    }
}

/// Texture plus staging buffer for one off-screen snapshot.
///
/// Both are destroyed when the guard drops, whichever way the snapshot ends.
pub(crate) struct TransientTarget {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    staging: wgpu::Buffer,
    extent: Extent,
    padded_bytes_per_row: u32,
}

impl TransientTarget {
    pub(crate) fn new(device: &wgpu::Device, extent: Extent) -> Self {
        let texture = create_output_texture(
            device,
            "iterscope snapshot",
            extent,
            wgpu::TextureUsages::COPY_SRC,
        );
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let padded_bytes_per_row = padded_bytes_per_row(extent.width);
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("iterscope snapshot staging"),
            size: u64::from(padded_bytes_per_row) * u64::from(extent.height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        Self {
            texture,
            view,
            staging,
            extent,
            padded_bytes_per_row,
        }
    }

    pub(crate) fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    pub(crate) fn encode_copy(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &self.staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(self.padded_bytes_per_row),
                    rows_per_image: Some(self.extent.height),
                },
            },
            texture_size(self.extent),
        );
    }

    /// Waits for the copy and strips row padding.
    pub(crate) fn read_image(&self, device: &wgpu::Device) -> Result<RgbaImage> {
        let pixels = read_mapped(device, &self.staging, |bytes| {
            let row_len = (self.extent.width * BYTES_PER_PIXEL) as usize;
            let mut pixels = Vec::with_capacity(row_len * self.extent.height as usize);
            for row in bytes.chunks_exact(self.padded_bytes_per_row as usize) {
                pixels.extend_from_slice(&row[..row_len]);
            }
            pixels
        })?;
        RgbaImage::from_raw(self.extent.width, self.extent.height, pixels)
            .ok_or_else(|| anyhow!("snapshot buffer does not match {}", self.extent))
    }
}

impl Drop for TransientTarget {
    fn drop(&mut self) {
        self.staging.destroy();
        self.texture.destroy();
    }
}

/// Row pitch rounded up to what texture-to-buffer copies require.
pub(crate) fn padded_bytes_per_row(width: u32) -> u32 {
    let unpadded = width * BYTES_PER_PIXEL;
    unpadded.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT) * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT
}

/// Maps `buffer` for reading, blocks until the GPU is done with it and
/// hands the contents to `read`.
pub(crate) fn read_mapped<T>(
    device: &wgpu::Device,
    buffer: &wgpu::Buffer,
    read: impl FnOnce(&[u8]) -> T,
) -> Result<T> {
    let slice = buffer.slice(..);
    let (tx, rx) = crossbeam_channel::bounded(1);
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    device
        .poll(wgpu::PollType::Wait)
        .map_err(|err| anyhow!("failed waiting for the GPU: {err}"))?;
    rx.recv()
        .context("buffer mapping callback was dropped")?
        .map_err(|err| anyhow!("failed to map buffer: {err}"))?;

    let mapped = slice.get_mapped_range();
    let value = read(&mapped);
    drop(mapped);
    buffer.unmap();
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_padded_to_copy_alignment() {
        assert_eq!(padded_bytes_per_row(1), 256);
        assert_eq!(padded_bytes_per_row(64), 256);
        assert_eq!(padded_bytes_per_row(65), 512);
        assert_eq!(padded_bytes_per_row(512), 2048);
    }
}
