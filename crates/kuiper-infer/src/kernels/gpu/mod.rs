//! wgpu kernels. Each one owns a compiled [`ComputePipeline`]; views are
//! passed to the shaders as element offsets, never as sub-buffer bindings.

use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::gpu_ops::WgpuContext;
use crate::kernels::{KernelRegistry, OpKind};
use crate::tensor::Tensor;
use crate::traits::Device;

pub mod attention;
pub mod elementwise;
pub mod embedding;
pub mod matmul;
pub mod rms_norm;
pub mod rope;

pub use attention::GpuAttention;
pub use elementwise::{GpuAdd, GpuSwiGlu};
pub use embedding::GpuEmbedding;
pub use matmul::GpuMatmul;
pub use rms_norm::GpuRmsNorm;
pub use rope::GpuRope;

pub fn register_all(registry: &mut KernelRegistry, context: &Arc<WgpuContext>) {
    registry.register(OpKind::Embedding, Device::Wgpu, Arc::new(GpuEmbedding::new(context)));
    registry.register(OpKind::RmsNorm, Device::Wgpu, Arc::new(GpuRmsNorm::new(context)));
    registry.register(OpKind::Add, Device::Wgpu, Arc::new(GpuAdd::new(context)));
    registry.register(OpKind::Matmul, Device::Wgpu, Arc::new(GpuMatmul::new(context)));
    registry.register(OpKind::Rope, Device::Wgpu, Arc::new(GpuRope::new(context)));
    registry.register(OpKind::Attention, Device::Wgpu, Arc::new(GpuAttention::new(context)));
    registry.register(OpKind::SwiGlu, Device::Wgpu, Arc::new(GpuSwiGlu::new(context)));
}

pub(crate) fn buffer_of(tensor: &Tensor) -> EngineResult<&wgpu::Buffer> {
    tensor.gpu_storage().map(|s| s.buffer()).ok_or_else(|| {
        EngineError::DeviceUnavailable(format!(
            "gpu kernel received a {:?} tensor",
            tensor.device()
        ))
    })
}

#[cfg(test)]
mod tests;
