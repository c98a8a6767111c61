//! In-place elementwise kernels over the output slot.
//!
//! Both ops write into `dst`. When the output is not already the first input,
//! the first input is copied into it on the same queue before the dispatch.

use std::sync::Arc;

use crate::error::EngineResult;
use crate::gpu_ops::pipeline::{grid_1d, groups_for};
use crate::gpu_ops::{Access, ComputePipeline, WgpuContext};
use crate::kernels::gpu::buffer_of;
use crate::kernels::{Kernel, KernelCall};
use crate::tensor::Tensor;

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct ElementwiseUniforms {
    len: u32,
    src_offset: u32,
    dst_offset: u32,
    _padding: u32,
}

fn launch_in_place(
    pipeline: &ComputePipeline,
    first: &Tensor,
    second: &Tensor,
    output: &Tensor,
) -> EngineResult<()> {
    let len = output.num_elements();
    let dst = buffer_of(output)?;
    let mut encoder = pipeline.command_encoder();
    if !output.same_view(first) {
        encoder.copy_buffer_to_buffer(
            buffer_of(first)?,
            (first.offset() * 4) as u64,
            dst,
            (output.offset() * 4) as u64,
            (len * 4) as u64,
        );
    }
    let uniforms = ElementwiseUniforms {
        len: len as u32,
        src_offset: second.offset() as u32,
        dst_offset: output.offset() as u32,
        _padding: 0,
    };
    pipeline.encode(
        &mut encoder,
        &uniforms,
        &[buffer_of(second)?, dst],
        grid_1d(groups_for(len, 256)),
    );
    pipeline.context().queue.submit(Some(encoder.finish()));
    Ok(())
}

/// Residual add, `out = a + b`.
pub struct GpuAdd {
    pipeline: ComputePipeline,
}

impl GpuAdd {
    pub fn new(context: &Arc<WgpuContext>) -> Self {
        Self {
            pipeline: ComputePipeline::new(
                context,
                "Add",
                wgpu::include_wgsl!("./add.wgsl"),
                &[Access::Read, Access::ReadWrite],
            ),
        }
    }
}

impl Kernel for GpuAdd {
    fn launch(&self, call: &KernelCall<'_>) -> EngineResult<()> {
        launch_in_place(&self.pipeline, call.input(0)?, call.input(1)?, call.output(0)?)
    }
}

/// `out = silu(gate) * up`.
pub struct GpuSwiGlu {
    pipeline: ComputePipeline,
}

impl GpuSwiGlu {
    pub fn new(context: &Arc<WgpuContext>) -> Self {
        Self {
            pipeline: ComputePipeline::new(
                context,
                "SwiGLU",
                wgpu::include_wgsl!("./swiglu.wgsl"),
                &[Access::Read, Access::ReadWrite],
            ),
        }
    }
}

impl Kernel for GpuSwiGlu {
    fn launch(&self, call: &KernelCall<'_>) -> EngineResult<()> {
        launch_in_place(&self.pipeline, call.input(0)?, call.input(1)?, call.output(0)?)
    }
}
