use std::sync::Arc;

use crate::error::EngineResult;
use crate::gpu_ops::pipeline::{grid_1d, groups_for};
use crate::gpu_ops::{Access, ComputePipeline, WgpuContext};
use crate::kernels::gpu::buffer_of;
use crate::kernels::{Kernel, KernelCall};
use crate::tensor::GpuStorage;

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct EmbeddingUniforms {
    rows: u32,
    dim: u32,
    table_offset: u32,
    out_offset: u32,
}

/// Row gather from the embedding table. Token ids arrive on the host and are
/// uploaded per call.
pub struct GpuEmbedding {
    pipeline: ComputePipeline,
}

impl GpuEmbedding {
    pub fn new(context: &Arc<WgpuContext>) -> Self {
        Self {
            pipeline: ComputePipeline::new(
                context,
                "Embedding",
                wgpu::include_wgsl!("./embedding.wgsl"),
                &[Access::Read, Access::Read, Access::ReadWrite],
            ),
        }
    }
}

impl Kernel for GpuEmbedding {
    fn launch(&self, call: &KernelCall<'_>) -> EngineResult<()> {
        let tokens = call.input(0)?.to_vec_u32()?;
        let (table, output) = (call.weight(0)?, call.output(0)?);
        let dim = table.dim(-1);
        let token_buffer = GpuStorage::from_slice(self.pipeline.context(), &tokens, "Token Ids");

        let uniforms = EmbeddingUniforms {
            rows: tokens.len() as u32,
            dim: dim as u32,
            table_offset: table.offset() as u32,
            out_offset: output.offset() as u32,
        };
        self.pipeline.dispatch(
            &uniforms,
            &[token_buffer.buffer(), buffer_of(table)?, buffer_of(output)?],
            grid_1d(groups_for(tokens.len() * dim, 256)),
        );
        Ok(())
    }
}
