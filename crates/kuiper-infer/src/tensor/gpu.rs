use std::sync::Arc;

use anyhow::{anyhow, Result};
use wgpu::util::DeviceExt;
use wgpu::{Buffer, BufferDescriptor, BufferUsages};

use crate::gpu_ops::WgpuContext;

/// A wgpu storage buffer shared by a GPU tensor and all of its views.
pub struct GpuStorage {
    buffer: Buffer,
    len: usize,
    context: Arc<WgpuContext>,
}

impl std::fmt::Debug for GpuStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuStorage")
            .field("len", &self.len)
            .field("buffer_size", &self.buffer.size())
            .finish_non_exhaustive()
    }
}

impl GpuStorage {
    /// Allocates `len` 4-byte elements. wgpu zero-initialises new buffers.
    pub fn zeros(context: &Arc<WgpuContext>, len: usize, label: &str) -> Self {
        let size = (len * 4) as u64;
        let buffer = context.device.create_buffer(&BufferDescriptor {
            label: Some(label),
            size,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        context.track_allocation(len * 4);
        Self {
            buffer,
            len,
            context: context.clone(),
        }
    }

    pub fn from_slice<T: bytemuck::Pod>(
        context: &Arc<WgpuContext>,
        data: &[T],
        label: &str,
    ) -> Self {
        let buffer = context
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::cast_slice(data),
                usage: BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::COPY_DST,
            });
        context.track_allocation(std::mem::size_of_val(data));
        Self {
            buffer,
            len: data.len(),
            context: context.clone(),
        }
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn context(&self) -> &Arc<WgpuContext> {
        &self.context
    }

    /// Queue-ordered host write of `data` at element `offset`.
    pub fn write<T: bytemuck::Pod>(&self, offset: usize, data: &[T]) {
        self.context
            .queue
            .write_buffer(&self.buffer, (offset * 4) as u64, bytemuck::cast_slice(data));
    }

    /// Copies `len` elements starting at `offset` back to the host.
    ///
    /// Waits for all previously submitted work on the queue.
    pub fn read<T: bytemuck::Pod>(&self, offset: usize, len: usize) -> Result<Vec<T>> {
        let raw = futures::executor::block_on(self.read_raw(offset, len))?;
        Ok(raw
            .chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    async fn read_raw(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let device = &self.context.device;
        let size = (len * 4) as u64;

        let staging_buffer = device.create_buffer(&BufferDescriptor {
            label: Some("Staging Readback Buffer"),
            size,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Readback Encoder"),
        });
        encoder.copy_buffer_to_buffer(&self.buffer, (offset * 4) as u64, &staging_buffer, 0, size);
        self.context.queue.submit(Some(encoder.finish()));

        let buffer_slice = staging_buffer.slice(..);
        let (tx, rx) = futures_intrusive::channel::shared::oneshot_channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });

        self.context.synchronize()?;

        rx.receive()
            .await
            .ok_or(anyhow!("GPU readback channel closed"))??;

        let data = buffer_slice.get_mapped_range().to_vec();
        staging_buffer.unmap();
        Ok(data)
    }
}

impl Drop for GpuStorage {
    fn drop(&mut self) {
        self.context.track_deallocation(self.len * 4);
    }
}
