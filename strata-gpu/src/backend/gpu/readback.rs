//! Mapping GPU results back to the host: textures and occlusion query
//! counts.

use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::time::{Duration, Instant};

use half::f16;

use crate::backend::TextureFormat;
use crate::error::StrataError;

const MAP_TIMEOUT: Duration = Duration::from_secs(5);

type MapResult = Result<(), wgpu::BufferAsyncError>;

fn map_read(buffer: &wgpu::Buffer) -> Receiver<MapResult> {
    let (sender, receiver) = mpsc::channel();
    buffer.slice(..).map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    receiver
}

/// Polls the device until `receiver` reports the mapping outcome.
fn wait_for_map(
    device: &wgpu::Device,
    receiver: &Receiver<MapResult>,
    what: &'static str,
) -> Result<(), StrataError> {
    let start = Instant::now();
    loop {
        device.poll(wgpu::PollType::Poll)?;
        match receiver.try_recv() {
            Ok(result) => return Ok(result?),
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => return Err(StrataError::Timeout(what)),
        }
        if start.elapsed() > MAP_TIMEOUT {
            return Err(StrataError::Timeout(what));
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn bytes_per_texel(format: TextureFormat) -> u32 {
    match format {
        TextureFormat::R16Float => 2,
        TextureFormat::R32Float | TextureFormat::Rg16Float | TextureFormat::Rgba8Unorm => 4,
        TextureFormat::Rg32Float | TextureFormat::Rgba16Float => 8,
        TextureFormat::Rgba32Float => 16,
    }
}

fn decode_texel(format: TextureFormat, bytes: &[u8]) -> [f32; 4] {
    let mut texel = [0.0; 4];
    match format {
        TextureFormat::Rgba8Unorm => {
            for (value, byte) in texel.iter_mut().zip(bytes) {
                *value = f32::from(*byte) / 255.0;
            }
        }
        TextureFormat::R16Float | TextureFormat::Rg16Float | TextureFormat::Rgba16Float => {
            for (value, half) in texel.iter_mut().zip(bytes.chunks_exact(2)) {
                *value = f16::from_le_bytes([half[0], half[1]]).to_f32();
            }
        }
        TextureFormat::R32Float | TextureFormat::Rg32Float | TextureFormat::Rgba32Float => {
            for (value, word) in texel.iter_mut().zip(bytes.chunks_exact(4)) {
                *value = bytemuck::pod_read_unaligned::<f32>(word);
            }
        }
    }
    texel
}

/// Copies `texture` into a mappable buffer and decodes it row-major.
pub(super) fn read_texture(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    texture: &wgpu::Texture,
    format: TextureFormat,
) -> Result<Vec<[f32; 4]>, StrataError> {
    let (width, height) = (texture.width(), texture.height());
    let texel_bytes = bytes_per_texel(format);
    let unpadded = width * texel_bytes;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    let padded = unpadded.div_ceil(align) * align;

    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("Texture Readback"),
        size: u64::from(padded) * u64::from(height),
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    });
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("Texture Readback Encoder"),
    });
    encoder.copy_texture_to_buffer(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::TexelCopyBufferInfo {
            buffer: &buffer,
            layout: wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(padded),
                rows_per_image: Some(height),
            },
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );
    queue.submit(Some(encoder.finish()));

    let receiver = map_read(&buffer);
    wait_for_map(device, &receiver, "texture readback")?;

    let data = buffer.slice(..).get_mapped_range();
    let texels = data
        .chunks_exact(padded as usize)
        .flat_map(|row| {
            row[..unpadded as usize]
                .chunks_exact(texel_bytes as usize)
                .map(|bytes| decode_texel(format, bytes))
        })
        .collect();
    drop(data);
    buffer.unmap();
    Ok(texels)
}

/// Occlusion results of one scene pass on their way to the host, each
/// tagged with the generation it was issued under.
pub(super) struct QueryReadback {
    queries: Vec<(u32, u64)>,
    buffer: wgpu::Buffer,
    receiver: Receiver<MapResult>,
}

impl QueryReadback {
    /// Resolves `queries` of `query_set` and starts mapping the counts.
    /// `encoder` must be submitted before the readback is polled.
    pub(super) fn record(
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        query_set: &wgpu::QuerySet,
        queries: Vec<(u32, u64)>,
    ) -> QueryReadbackRecording {
        let stride = u64::from(wgpu::QUERY_RESOLVE_BUFFER_ALIGNMENT);
        let count = queries.len() as u64;
        let resolve = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Occlusion Resolve"),
            size: stride * count,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Occlusion Readback"),
            size: wgpu::QUERY_SIZE as u64 * count,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        for (slot, &(query, _)) in queries.iter().enumerate() {
            let offset = slot as u64;
            encoder.resolve_query_set(query_set, query..query + 1, &resolve, offset * stride);
            encoder.copy_buffer_to_buffer(
                &resolve,
                offset * stride,
                &buffer,
                offset * wgpu::QUERY_SIZE as u64,
                wgpu::QUERY_SIZE as u64,
            );
        }
        QueryReadbackRecording { queries, buffer }
    }

    pub(super) fn contains(&self, query: u32, generation: u64) -> bool {
        self.queries.contains(&(query, generation))
    }

    /// Sample counts if the mapping finished.
    pub(super) fn try_take(&self) -> Result<Option<Vec<(u32, u64, u64)>>, StrataError> {
        match self.receiver.try_recv() {
            Ok(result) => {
                result?;
                Ok(Some(self.take()))
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(StrataError::Timeout("occlusion queries")),
        }
    }

    /// Blocks until the counts are mapped.
    pub(super) fn wait(
        &self,
        device: &wgpu::Device,
    ) -> Result<Vec<(u32, u64, u64)>, StrataError> {
        wait_for_map(device, &self.receiver, "occlusion queries")?;
        Ok(self.take())
    }

    fn take(&self) -> Vec<(u32, u64, u64)> {
        let data = self.buffer.slice(..).get_mapped_range();
        let samples: Vec<u64> = data
            .chunks_exact(wgpu::QUERY_SIZE as usize)
            .map(bytemuck::pod_read_unaligned::<u64>)
            .collect();
        drop(data);
        self.buffer.unmap();
        self.queries
            .iter()
            .zip(samples)
            .map(|(&(query, generation), samples)| (query, generation, samples))
            .collect()
    }
}

/// A [`QueryReadback`] whose copies are recorded but not yet submitted.
pub(super) struct QueryReadbackRecording {
    queries: Vec<(u32, u64)>,
    buffer: wgpu::Buffer,
}

impl QueryReadbackRecording {
    /// Starts mapping. Call after the recording encoder was submitted.
    pub(super) fn submitted(self) -> QueryReadback {
        let receiver = map_read(&self.buffer);
        QueryReadback {
            queries: self.queries,
            buffer: self.buffer,
            receiver,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_half_and_unorm_texels() {
        let half: Vec<u8> = [1.5f32, -2.0, 0.25, 1.0]
            .iter()
            .flat_map(|v| f16::from_f32(*v).to_le_bytes())
            .collect();
        assert_eq!(decode_texel(TextureFormat::Rgba16Float, &half), [1.5, -2.0, 0.25, 1.0]);
        assert_eq!(
            decode_texel(TextureFormat::Rgba8Unorm, &[255, 0, 51, 255]),
            [1.0, 0.0, 0.2, 1.0]
        );
        let single = 7.0f32.to_le_bytes();
        assert_eq!(decode_texel(TextureFormat::R32Float, &single), [7.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_poll_errors_propagate() {
        let error = StrataError::from(wgpu::PollError::Timeout);
        assert!(matches!(error, StrataError::PollError(_)));
        assert!(error.to_string().starts_with("Device poll error"));
    }

    #[test]
    fn test_bytes_per_texel_matches_channels() {
        for format in [
            TextureFormat::R32Float,
            TextureFormat::Rg32Float,
            TextureFormat::Rgba32Float,
        ] {
            assert_eq!(bytes_per_texel(format) as usize, 4 * format.channels());
        }
        for format in [
            TextureFormat::R16Float,
            TextureFormat::Rg16Float,
            TextureFormat::Rgba16Float,
        ] {
            assert_eq!(bytes_per_texel(format) as usize, 2 * format.channels());
        }
    }
}
