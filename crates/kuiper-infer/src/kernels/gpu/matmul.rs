use std::sync::Arc;

use crate::error::EngineResult;
use crate::gpu_ops::pipeline::{grid_rows, groups_for};
use crate::gpu_ops::{Access, ComputePipeline, WgpuContext};
use crate::kernels::gpu::buffer_of;
use crate::kernels::{Kernel, KernelCall};

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct MatmulUniforms {
    rows: u32,
    in_dim: u32,
    out_dim: u32,
    x_offset: u32,
    w_offset: u32,
    y_offset: u32,
    _padding: [u32; 2],
}

/// `y = x · wᵀ` for a row-major weight of shape `[out_dim, in_dim]`.
///
/// One invocation per output element; rows map to the Y grid dimension,
/// folded into Z for long prompts.
pub struct GpuMatmul {
    pipeline: ComputePipeline,
}

impl GpuMatmul {
    pub fn new(context: &Arc<WgpuContext>) -> Self {
        Self {
            pipeline: ComputePipeline::new(
                context,
                "Matmul",
                wgpu::include_wgsl!("./matmul.wgsl"),
                &[Access::Read, Access::Read, Access::ReadWrite],
            ),
        }
    }
}

impl Kernel for GpuMatmul {
    fn launch(&self, call: &KernelCall<'_>) -> EngineResult<()> {
        let (x, w, y) = (call.input(0)?, call.weight(0)?, call.output(0)?);
        let (out_dim, in_dim) = (w.dim(0), w.dim(1));
        let rows = x.num_elements() / in_dim;

        let uniforms = MatmulUniforms {
            rows: rows as u32,
            in_dim: in_dim as u32,
            out_dim: out_dim as u32,
            x_offset: x.offset() as u32,
            w_offset: w.offset() as u32,
            y_offset: y.offset() as u32,
            _padding: [0; 2],
        };
        self.pipeline.dispatch(
            &uniforms,
            &[buffer_of(x)?, buffer_of(w)?, buffer_of(y)?],
            grid_rows(groups_for(out_dim, 64), rows),
        );
        Ok(())
    }
}
