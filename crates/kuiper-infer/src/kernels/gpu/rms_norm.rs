use std::sync::Arc;

use anyhow::anyhow;

use crate::error::{EngineError, EngineResult};
use crate::gpu_ops::pipeline::grid_1d;
use crate::gpu_ops::{Access, ComputePipeline, WgpuContext};
use crate::kernels::gpu::buffer_of;
use crate::kernels::{Kernel, KernelCall, OpParams};

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct NormUniforms {
    rows: u32,
    dim: u32,
    eps: f32,
    in_offset: u32,
    weight_offset: u32,
    out_offset: u32,
    _padding: [u32; 2],
}

/// RMSNorm over every `dim`-wide row of the input, one workgroup per row.
pub struct GpuRmsNorm {
    pipeline: ComputePipeline,
}

impl GpuRmsNorm {
    pub fn new(context: &Arc<WgpuContext>) -> Self {
        Self {
            pipeline: ComputePipeline::new(
                context,
                "RMSNorm",
                wgpu::include_wgsl!("./rms_norm.wgsl"),
                &[Access::Read, Access::Read, Access::ReadWrite],
            ),
        }
    }
}

impl Kernel for GpuRmsNorm {
    fn launch(&self, call: &KernelCall<'_>) -> EngineResult<()> {
        let OpParams::RmsNorm { dim, eps } = call.params else {
            return Err(EngineError::Internal(anyhow!("rmsnorm launched without its params")));
        };
        let (input, weight, output) = (call.input(0)?, call.weight(0)?, call.output(0)?);
        let rows = input.num_elements() / dim;

        let uniforms = NormUniforms {
            rows: rows as u32,
            dim: dim as u32,
            eps,
            in_offset: input.offset() as u32,
            weight_offset: weight.offset() as u32,
            out_offset: output.offset() as u32,
            _padding: [0; 2],
        };
        self.pipeline.dispatch(
            &uniforms,
            &[buffer_of(input)?, buffer_of(weight)?, buffer_of(output)?],
            grid_1d(rows),
        );
        Ok(())
    }
}
