use std::collections::hash_map::Entry;
use std::collections::HashMap;

use kernel::{
    overrides, DeviceLimits, GroupShape, VariantError, VariantSpec, DEFAULT_SNAPSHOT_EXTENT,
    ENTRY_POINT,
};

use crate::compile::{compile_blit_module, compile_kernel_module};

/// Format of every texture the kernel writes.
pub(crate) const KERNEL_OUTPUT_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// A compiled kernel variant and its compute pipelines.
///
/// The shader module is compiled once; a pipeline is specialised for each
/// thread-group shape the partitioner asks for and kept for reuse.
pub struct KernelProgram {
    label: String,
    module: wgpu::ShaderModule,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    uses_escape_iteration: bool,
    control_point_count: u32,
    pipelines: HashMap<GroupShape, wgpu::ComputePipeline>,
}

impl KernelProgram {
    /// Compiles `source` and builds the pipeline for the default snapshot
    /// size, so a broken specialisation fails here rather than mid-frame.
    pub(crate) fn build(
        device: &wgpu::Device,
        spec: &VariantSpec,
        source: &str,
        limits: &DeviceLimits,
    ) -> Result<Self, VariantError> {
        let label = spec.label();
        let module = compile_kernel_module(device, &label, source).map_err(|message| {
            VariantError::Compile {
                label: label.clone(),
                message,
            }
        })?;

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("kernel bind group layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::StorageTexture {
                        access: wgpu::StorageTextureAccess::WriteOnly,
                        format: KERNEL_OUTPUT_FORMAT,
                        view_dimension: wgpu::TextureViewDimension::D2,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("kernel pipeline layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let mut program = Self {
            label,
            module,
            bind_group_layout,
            pipeline_layout,
            uses_escape_iteration: spec.uses_escape_iteration,
            control_point_count: spec.layout.control_point_count(),
            pipelines: HashMap::new(),
        };

        let initial = kernel::plan_within(DEFAULT_SNAPSHOT_EXTENT, limits);
        if !initial.is_degenerate() {
            let label = program.label.clone();
            if let Err(message) = program.pipeline_for(device, initial.group) {
                return Err(VariantError::Pipeline { label, message });
            }
        }
        Ok(program)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn cached_pipelines(&self) -> usize {
        self.pipelines.len()
    }

    pub(crate) fn bind_group_layout(&self) -> &wgpu::BindGroupLayout {
        &self.bind_group_layout
    }

    /// Pipeline specialised for `group`, built on first request.
    pub(crate) fn pipeline_for(
        &mut self,
        device: &wgpu::Device,
        group: GroupShape,
    ) -> Result<&wgpu::ComputePipeline, String> {
        match self.pipelines.entry(group) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let constants = [
                    (
                        overrides::USE_ESCAPE_ITERATION,
                        if self.uses_escape_iteration { 1.0 } else { 0.0 },
                    ),
                    (overrides::GROUP_WIDTH, f64::from(group.x)),
                    (overrides::GROUP_HEIGHT, f64::from(group.y)),
                    (
                        overrides::CONTROL_POINT_COUNT,
                        f64::from(self.control_point_count),
                    ),
                ];

                device.push_error_scope(wgpu::ErrorFilter::Validation);
                let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(&self.label),
                    layout: Some(&self.pipeline_layout),
                    module: &self.module,
                    entry_point: Some(ENTRY_POINT),
                    compilation_options: wgpu::PipelineCompilationOptions {
                        constants: &constants,
                        zero_initialize_workgroup_memory: false,
                    },
                    cache: None,
                });
                if let Some(err) = pollster::block_on(device.pop_error_scope()) {
                    return Err(err.to_string());
                }

                tracing::debug!(
                    variant = %self.label,
                    group_width = group.x,
                    group_height = group.y,
                    "built compute pipeline"
                );
                Ok(entry.insert(pipeline))
            }
        }
    }
}

/// Draws the compute output onto a surface texture.
pub(crate) struct BlitPipeline {
    pipeline: wgpu::RenderPipeline,
    layout: wgpu::BindGroupLayout,
    format: wgpu::TextureFormat,
}

impl BlitPipeline {
    pub(crate) fn new(device: &wgpu::Device, format: wgpu::TextureFormat) -> Self {
        let module = compile_blit_module(device);
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("blit bind group layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: false },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            }],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("blit pipeline layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("blit pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &module,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &module,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            multiview: None,
            cache: None,
        });

        Self {
            pipeline,
            layout,
            format,
        }
    }

    pub(crate) fn format(&self) -> wgpu::TextureFormat {
        self.format
    }

    pub(crate) fn encode(
        &self,
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        source: &wgpu::TextureView,
        target: &wgpu::TextureView,
    ) {
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("blit bind group"),
            layout: &self.layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::TextureView(source),
            }],
        });

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("blit pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: target,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            occlusion_query_set: None,
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.draw(0..3, 0..1);
    }
}
