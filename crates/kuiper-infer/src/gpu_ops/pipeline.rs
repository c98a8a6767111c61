use std::sync::Arc;

use wgpu::util::DeviceExt;

use crate::gpu_ops::WgpuContext;

/// Storage access of one bound buffer. Binding 0 is always the uniform block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    ReadWrite,
}

/// A compiled compute shader plus its bind group layout.
///
/// Every kernel in this crate uses the same layout convention:
/// `@binding(0)` uniforms, `@binding(1..)` storage buffers in declaration order.
pub struct ComputePipeline {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    label: String,
    context: Arc<WgpuContext>,
}

impl ComputePipeline {
    pub fn new(
        context: &Arc<WgpuContext>,
        label: &str,
        shader: wgpu::ShaderModuleDescriptor<'_>,
        buffers: &[Access],
    ) -> Self {
        let shader = context.device.create_shader_module(shader);

        let mut entries = vec![wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }];
        for (i, access) in buffers.iter().enumerate() {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: i as u32 + 1,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage {
                        read_only: *access == Access::Read,
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            });
        }

        let bind_group_layout =
            context
                .device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(&format!("{label} Bind Group Layout")),
                    entries: &entries,
                });
        let pipeline_layout =
            context
                .device
                .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some(&format!("{label} Pipeline Layout")),
                    bind_group_layouts: &[&bind_group_layout],
                    push_constant_ranges: &[],
                });
        let pipeline = context
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(&format!("{label} Pipeline")),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            });

        Self {
            pipeline,
            bind_group_layout,
            label: label.to_string(),
            context: context.clone(),
        }
    }

    /// Records one dispatch into `encoder`.
    pub fn encode<U: bytemuck::Pod>(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        uniforms: &U,
        buffers: &[&wgpu::Buffer],
        workgroups: (u32, u32, u32),
    ) {
        let uniform_buffer =
            self.context
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(&format!("{} Uniforms", self.label)),
                    contents: bytemuck::bytes_of(uniforms),
                    usage: wgpu::BufferUsages::UNIFORM,
                });

        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: uniform_buffer.as_entire_binding(),
        }];
        for (i, buffer) in buffers.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32 + 1,
                resource: buffer.as_entire_binding(),
            });
        }
        let bind_group = self
            .context
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(&format!("{} Bind Group", self.label)),
                layout: &self.bind_group_layout,
                entries: &entries,
            });

        let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(&self.label),
            timestamp_writes: None,
        });
        compute_pass.set_pipeline(&self.pipeline);
        compute_pass.set_bind_group(0, &bind_group, &[]);
        compute_pass.dispatch_workgroups(workgroups.0, workgroups.1, workgroups.2);
    }

    /// Encodes a single dispatch and submits it to the queue.
    pub fn dispatch<U: bytemuck::Pod>(
        &self,
        uniforms: &U,
        buffers: &[&wgpu::Buffer],
        workgroups: (u32, u32, u32),
    ) {
        let mut encoder = self.command_encoder();
        self.encode(&mut encoder, uniforms, buffers, workgroups);
        self.context.queue.submit(Some(encoder.finish()));
    }

    pub fn command_encoder(&self) -> wgpu::CommandEncoder {
        self.context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(&format!("{} Encoder", self.label)),
            })
    }

    pub fn context(&self) -> &Arc<WgpuContext> {
        &self.context
    }
}

/// wgpu's default `max_compute_workgroups_per_dimension`.
pub const MAX_WORKGROUPS_PER_DIM: usize = 65_535;

/// Workgroup grid covering `groups` workgroups, folded into Y past the per-dimension limit.
///
/// Shaders recover the flat group index as `wg.y * nwg.x + wg.x`.
pub fn grid_1d(groups: usize) -> (u32, u32, u32) {
    let groups = groups.max(1);
    if groups <= MAX_WORKGROUPS_PER_DIM {
        (groups as u32, 1, 1)
    } else {
        let y = groups.div_ceil(MAX_WORKGROUPS_PER_DIM);
        (MAX_WORKGROUPS_PER_DIM as u32, y as u32, 1)
    }
}

/// Grid of `x_groups` columns by `rows` rows, rows folded into Z past the per-dimension limit.
///
/// Shaders recover the row as `wg.z * nwg.y + wg.y` and must bounds-check it.
pub fn grid_rows(x_groups: usize, rows: usize) -> (u32, u32, u32) {
    let rows = rows.max(1);
    let y = rows.min(MAX_WORKGROUPS_PER_DIM);
    (x_groups.max(1) as u32, y as u32, rows.div_ceil(y) as u32)
}

/// Number of workgroups of `size` threads needed to cover `count` items.
pub fn groups_for(count: usize, size: usize) -> usize {
    count.div_ceil(size)
}
