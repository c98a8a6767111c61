use std::sync::Arc;

use anyhow::anyhow;

use crate::error::{EngineError, EngineResult};
use crate::gpu_ops::{Access, ComputePipeline, WgpuContext};
use crate::kernels::gpu::buffer_of;
use crate::kernels::{read_position, Kernel, KernelCall, OpParams};

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct AttentionUniforms {
    kv_mul: u32,
    head_size: u32,
    kv_dim: u32,
    visible: u32,
    q_offset: u32,
    out_offset: u32,
    k_offset: u32,
    v_offset: u32,
    score_offset: u32,
    seq_len: u32,
    scale: f32,
    _padding: u32,
}

/// Causal GQA over the block's KV cache.
///
/// Rows are dispatched one after another in a single command buffer because
/// they share the score scratch; each dispatch runs one workgroup per head.
pub struct GpuAttention {
    pipeline: ComputePipeline,
}

impl GpuAttention {
    pub fn new(context: &Arc<WgpuContext>) -> Self {
        Self {
            pipeline: ComputePipeline::new(
                context,
                "Attention",
                wgpu::include_wgsl!("./attention.wgsl"),
                &[
                    Access::Read,
                    Access::Read,
                    Access::Read,
                    Access::ReadWrite,
                    Access::ReadWrite,
                ],
            ),
        }
    }
}

impl Kernel for GpuAttention {
    fn launch(&self, call: &KernelCall<'_>) -> EngineResult<()> {
        let OpParams::Attention {
            head_num,
            kv_head_num,
            head_size,
        } = call.params
        else {
            return Err(EngineError::Internal(anyhow!("attention launched without its params")));
        };
        let query = call.input(0)?;
        let pos = read_position(call.input(1)?)?;
        let (key_cache, value_cache) = (call.input(2)?, call.input(3)?);
        let (output, score) = (call.output(0)?, call.output(1)?);

        let dim = head_num * head_size;
        let rows = query.num_elements() / dim;
        let buffers = [
            buffer_of(query)?,
            buffer_of(key_cache)?,
            buffer_of(value_cache)?,
            buffer_of(output)?,
            buffer_of(score)?,
        ];

        let mut encoder = self.pipeline.command_encoder();
        for r in 0..rows {
            let uniforms = AttentionUniforms {
                kv_mul: (head_num / kv_head_num) as u32,
                head_size: head_size as u32,
                kv_dim: (kv_head_num * head_size) as u32,
                visible: (pos + r + 1) as u32,
                q_offset: (query.offset() + r * dim) as u32,
                out_offset: (output.offset() + r * dim) as u32,
                k_offset: key_cache.offset() as u32,
                v_offset: value_cache.offset() as u32,
                score_offset: score.offset() as u32,
                seq_len: key_cache.dim(0) as u32,
                scale: 1.0 / (head_size as f32).sqrt(),
                _padding: 0,
            };
            self.pipeline
                .encode(&mut encoder, &uniforms, &buffers, (head_num as u32, 1, 1));
        }
        self.pipeline.context().queue.submit(Some(encoder.finish()));
        Ok(())
    }
}
