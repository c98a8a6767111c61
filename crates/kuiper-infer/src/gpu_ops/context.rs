use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use wgpu::{
    Adapter, DeviceDescriptor, Features, Instance, InstanceDescriptor, Limits, PowerPreference,
    RequestAdapterOptions,
};

#[derive(Debug, Clone)]
pub struct GpuMemoryInfo {
    pub max_buffer_size: u64,
    pub max_storage_buffer_binding_size: u32,
    pub max_compute_workgroups_per_dimension: u32,
}

impl GpuMemoryInfo {
    pub fn print_summary(&self) {
        log::debug!(
            "gpu memory: max_buffer={:.2}GB, max_binding={:.2}GB, max_workgroups={}",
            self.max_buffer_size as f64 / 1_073_741_824.0,
            self.max_storage_buffer_binding_size as f64 / 1_073_741_824.0,
            self.max_compute_workgroups_per_dimension
        );
    }
}

/// Device execution context: one wgpu device and its ordered queue.
///
/// All work for a session is submitted to `queue`, so operator calls
/// execute in issue order without explicit waits between them.
pub struct WgpuContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
    pub adapter: Adapter,
    pub memory_info: GpuMemoryInfo,
    allocated_memory: AtomicUsize,
}

impl WgpuContext {
    pub async fn new() -> Result<Arc<Self>> {
        Self::with_config(GpuConfig::default()).await
    }

    pub async fn with_config(config: GpuConfig) -> Result<Arc<Self>> {
        let instance = Instance::new(&InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            flags: wgpu::InstanceFlags::empty(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&RequestAdapterOptions {
                power_preference: config.power_preference,
                force_fallback_adapter: config.force_fallback_adapter,
                compatible_surface: None,
            })
            .await
            .map_err(|e| anyhow!("no suitable gpu adapter: {e}"))?;

        let adapter_info = adapter.get_info();
        let adapter_limits = adapter.limits();
        log::info!(
            "using adapter '{}' ({:?}, {:?})",
            adapter_info.name,
            adapter_info.device_type,
            adapter_info.backend
        );

        let memory_info = GpuMemoryInfo {
            max_buffer_size: adapter_limits.max_buffer_size,
            max_storage_buffer_binding_size: adapter_limits.max_storage_buffer_binding_size,
            max_compute_workgroups_per_dimension: adapter_limits
                .max_compute_workgroups_per_dimension,
        };
        memory_info.print_summary();

        let required_limits = Limits {
            max_buffer_size: memory_info.max_buffer_size,
            max_storage_buffer_binding_size: memory_info.max_storage_buffer_binding_size,
            ..adapter_limits.clone()
        };

        let (device, queue) = adapter
            .request_device(&DeviceDescriptor {
                label: Some("kuiper_gpu"),
                required_features: Features::empty(),
                required_limits,
                ..Default::default()
            })
            .await?;

        Ok(Arc::new(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter,
            memory_info,
            allocated_memory: AtomicUsize::new(0),
        }))
    }

    /// Blocks until every submitted command buffer has completed.
    pub fn synchronize(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| anyhow!("gpu poll failed: {e}"))?;
        Ok(())
    }

    pub fn track_allocation(&self, bytes: usize) {
        self.allocated_memory.fetch_add(bytes, Ordering::Relaxed);
        log::trace!(
            "allocated {} bytes, total: {:.2}MB",
            bytes,
            self.allocated_memory.load(Ordering::Relaxed) as f64 / 1_048_576.0
        );
    }

    pub fn track_deallocation(&self, bytes: usize) {
        self.allocated_memory.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn get_allocated_memory(&self) -> usize {
        self.allocated_memory.load(Ordering::Relaxed)
    }

    pub fn print_memory_usage(&self) {
        log::info!(
            "gpu memory: {:.2}MB allocated",
            self.get_allocated_memory() as f64 / 1_048_576.0
        );
    }
}

#[derive(Debug, Clone)]
pub struct GpuConfig {
    pub power_preference: PowerPreference,
    pub force_fallback_adapter: bool,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            power_preference: PowerPreference::HighPerformance,
            force_fallback_adapter: false,
        }
    }
}
