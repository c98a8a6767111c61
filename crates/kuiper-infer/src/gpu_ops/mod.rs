//! wgpu plumbing shared by the GPU kernels: the device execution context,
//! compute-pipeline construction and workgroup sizing.

pub mod context;
pub mod pipeline;

pub use context::{GpuConfig, GpuMemoryInfo, WgpuContext};
pub use pipeline::{Access, ComputePipeline};
