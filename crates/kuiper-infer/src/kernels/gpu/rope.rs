use std::sync::Arc;

use anyhow::anyhow;

use crate::error::{EngineError, EngineResult};
use crate::gpu_ops::pipeline::{grid_1d, groups_for};
use crate::gpu_ops::{Access, ComputePipeline, WgpuContext};
use crate::kernels::gpu::buffer_of;
use crate::kernels::{read_position, Kernel, KernelCall, OpParams};

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct RopeUniforms {
    rows: u32,
    head_size: u32,
    q_width: u32,
    k_width: u32,
    pos: u32,
    q_offset: u32,
    k_offset: u32,
    sin_offset: u32,
    cos_offset: u32,
    _padding: [u32; 3],
}

/// Rotates query and key rows in place using the precomputed sin/cos tables.
pub struct GpuRope {
    pipeline: ComputePipeline,
}

impl GpuRope {
    pub fn new(context: &Arc<WgpuContext>) -> Self {
        Self {
            pipeline: ComputePipeline::new(
                context,
                "RoPE",
                wgpu::include_wgsl!("./rope.wgsl"),
                &[Access::Read, Access::Read, Access::ReadWrite, Access::ReadWrite],
            ),
        }
    }
}

impl Kernel for GpuRope {
    fn launch(&self, call: &KernelCall<'_>) -> EngineResult<()> {
        let OpParams::Rope { head_size } = call.params else {
            return Err(EngineError::Internal(anyhow!("rope launched without its params")));
        };
        let (query, key) = (call.input(0)?, call.input(1)?);
        let pos = read_position(call.input(2)?)?;
        let (sin, cos) = (call.weight(0)?, call.weight(1)?);
        let (q_width, k_width) = (query.dim(-1), key.dim(-1));
        let rows = query.num_elements() / q_width;

        let uniforms = RopeUniforms {
            rows: rows as u32,
            head_size: head_size as u32,
            q_width: q_width as u32,
            k_width: k_width as u32,
            pos: pos as u32,
            q_offset: query.offset() as u32,
            k_offset: key.offset() as u32,
            sin_offset: sin.offset() as u32,
            cos_offset: cos.offset() as u32,
            _padding: [0; 3],
        };
        let invocations = rows * (q_width + k_width) / 2;
        self.pipeline.dispatch(
            &uniforms,
            &[
                buffer_of(sin)?,
                buffer_of(cos)?,
                buffer_of(query)?,
                buffer_of(key)?,
            ],
            grid_1d(groups_for(invocations, 256)),
        );
        Ok(())
    }
}
