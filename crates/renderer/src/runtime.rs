//! Dispatch of kernel variants, on screen or into an off-screen snapshot.
//!
//! Every dispatch walks the same steps: check the cached thread-group plan
//! (a degenerate plan ends the call before any GPU work), stage the
//! parameters, fetch the pipeline for the plan's group shape, encode, submit.
//! On-screen dispatches return right after presenting; snapshots block until
//! the GPU finishes and hand back the pixels.

use image::RgbaImage;
use kernel::{
    Extent, KernelVariant, ParameterError, Parameters, Snapshotter, ThreadGroupPlan, VariantSet,
};

use crate::gpu::{
    BlitPipeline, FrameTarget, GpuContext, ParameterBuffer, SurfaceTarget, TransientTarget,
};

pub type GpuVariant = KernelVariant<GpuContext>;
pub type GpuVariantSet = VariantSet<GpuContext>;

/// Where a dispatch should end up.
pub enum DispatchTarget<'a> {
    /// Present on the surface; the output size is the surface size.
    Surface(&'a SurfaceTarget),
    /// Render off-screen and read the pixels back.
    Snapshot,
}

/// Output size and parameter values for one submission.
#[derive(Clone, Copy, Debug)]
pub struct DispatchRequest<'a> {
    pub extent: Extent,
    pub parameters: &'a Parameters,
}

/// Why a dispatch did not happen. All of these are per-frame conditions;
/// the next dispatch may well succeed.
#[derive(Debug, thiserror::Error)]
pub enum SkipReason {
    #[error("output size {0} leaves nothing to draw")]
    EmptyOutput(Extent),
    #[error("output size {extent} exceeds the device texture limit of {max}")]
    TooLarge { extent: Extent, max: u32 },
    #[error("no drawable available: {0}")]
    NoDrawable(wgpu::SurfaceError),
    #[error(transparent)]
    Parameters(#[from] ParameterError),
    #[error("no pipeline for this group shape: {0}")]
    Pipeline(String),
    #[error("command submission failed: {0}")]
    Encoder(String),
    #[error("snapshot readback failed: {0}")]
    Readback(String),
}

impl SkipReason {
    /// Whether the surface should be reconfigured before the next frame.
    pub fn needs_reconfigure(&self) -> bool {
        matches!(
            self,
            SkipReason::NoDrawable(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated)
        )
    }
}

#[derive(Debug)]
pub enum DispatchOutcome {
    Skipped(SkipReason),
    Presented,
    Captured(RgbaImage),
}

impl DispatchOutcome {
    pub fn succeeded(&self) -> bool {
        !matches!(self, DispatchOutcome::Skipped(_))
    }

    pub fn into_image(self) -> Option<RgbaImage> {
        match self {
            DispatchOutcome::Captured(image) => Some(image),
            _ => None,
        }
    }
}

/// Submits kernel dispatches on the context's queue.
pub struct DispatchRuntime {
    device: wgpu::Device,
    queue: wgpu::Queue,
    max_texture_dimension: u32,
    frame: Option<FrameTarget>,
    blit: Option<BlitPipeline>,
    submissions: u64,
}

impl DispatchRuntime {
    pub fn new(context: &GpuContext) -> Self {
        Self {
            device: context.device.clone(),
            queue: context.queue.clone(),
            max_texture_dimension: context.max_texture_dimension(),
            frame: None,
            blit: None,
            submissions: 0,
        }
    }

    /// Command buffers submitted so far.
    pub fn submissions(&self) -> u64 {
        self.submissions
    }

    pub fn dispatch(
        &mut self,
        variant: &mut GpuVariant,
        request: DispatchRequest<'_>,
        target: DispatchTarget<'_>,
    ) -> DispatchOutcome {
        let result = match target {
            DispatchTarget::Surface(surface) => self
                .present_frame(variant, surface, request.parameters)
                .map(|()| DispatchOutcome::Presented),
            DispatchTarget::Snapshot => self
                .capture(variant, request.extent, request.parameters)
                .map(DispatchOutcome::Captured),
        };
        match result {
            Ok(outcome) => outcome,
            Err(reason) => {
                match &reason {
                    SkipReason::EmptyOutput(_) | SkipReason::NoDrawable(_) => {
                        tracing::debug!(
                            variant = %variant.spec().label(),
                            %reason,
                            "skipped dispatch"
                        );
                    }
                    _ => {
                        tracing::warn!(
                            variant = %variant.spec().label(),
                            %reason,
                            "skipped dispatch"
                        );
                    }
                }
                DispatchOutcome::Skipped(reason)
            }
        }
    }

    /// Dispatches onto `surface` and presents. `true` when a frame was queued.
    pub fn present(
        &mut self,
        variant: &mut GpuVariant,
        surface: &SurfaceTarget,
        parameters: &Parameters,
    ) -> bool {
        let request = DispatchRequest {
            extent: surface.extent(),
            parameters,
        };
        self.dispatch(variant, request, DispatchTarget::Surface(surface))
            .succeeded()
    }

    /// Renders off-screen at `extent` and returns the pixels.
    pub fn snapshot(
        &mut self,
        variant: &mut GpuVariant,
        extent: Extent,
        parameters: &Parameters,
    ) -> Option<RgbaImage> {
        self.dispatch(
            variant,
            DispatchRequest { extent, parameters },
            DispatchTarget::Snapshot,
        )
        .into_image()
    }

    fn present_frame(
        &mut self,
        variant: &mut GpuVariant,
        surface: &SurfaceTarget,
        parameters: &Parameters,
    ) -> Result<(), SkipReason> {
        let extent = surface.extent();
        let plan = checked_plan(variant, extent)?;
        check_texture_size(extent, self.max_texture_dimension)?;
        let bytes = variant.stage_parameters(parameters)?;

        let (program, parameter_buffer) = variant.program_and_parameters_mut();
        let pipeline = program
            .pipeline_for(&self.device, plan.group)
            .map_err(SkipReason::Pipeline)?
            .clone();

        let drawable = surface.acquire().map_err(SkipReason::NoDrawable)?;
        let drawable_view = drawable
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        parameter_buffer.write(&self.queue, &bytes);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        if self.frame.as_ref().map(FrameTarget::extent) != Some(extent) {
            self.frame = None;
        }
        let frame = self
            .frame
            .get_or_insert_with(|| FrameTarget::new(&self.device, extent));
        if self.blit.as_ref().map(BlitPipeline::format) != Some(surface.format()) {
            self.blit = None;
        }
        let blit = self
            .blit
            .get_or_insert_with(|| BlitPipeline::new(&self.device, surface.format()));

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("iterscope frame"),
            });
        encode_kernel(
            &self.device,
            &mut encoder,
            program.bind_group_layout(),
            &pipeline,
            frame.view(),
            parameter_buffer,
            &plan,
        );
        blit.encode(&self.device, &mut encoder, frame.view(), &drawable_view);
        self.queue.submit(Some(encoder.finish()));
        self.submissions += 1;
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            self.frame = None;
            return Err(SkipReason::Encoder(err.to_string()));
        }

        drawable.present();
        Ok(())
    }

    fn capture(
        &mut self,
        variant: &mut GpuVariant,
        extent: Extent,
        parameters: &Parameters,
    ) -> Result<RgbaImage, SkipReason> {
        let plan = checked_plan(variant, extent)?;
        check_texture_size(extent, self.max_texture_dimension)?;
        let bytes = variant.stage_parameters(parameters)?;

        let (program, parameter_buffer) = variant.program_and_parameters_mut();
        let pipeline = program
            .pipeline_for(&self.device, plan.group)
            .map_err(SkipReason::Pipeline)?
            .clone();

        parameter_buffer.write(&self.queue, &bytes);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let target = TransientTarget::new(&self.device, extent);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("iterscope snapshot"),
            });
        encode_kernel(
            &self.device,
            &mut encoder,
            program.bind_group_layout(),
            &pipeline,
            target.view(),
            parameter_buffer,
            &plan,
        );
        target.encode_copy(&mut encoder);
        self.queue.submit(Some(encoder.finish()));
        self.submissions += 1;
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(SkipReason::Encoder(err.to_string()));
        }

        target
            .read_image(&self.device)
            .map_err(|err| SkipReason::Readback(format!("{err:#}")))
    }
}

impl Snapshotter<GpuContext> for DispatchRuntime {
    fn snapshot(
        &mut self,
        variant: &mut GpuVariant,
        extent: Extent,
        parameters: &Parameters,
    ) -> Option<RgbaImage> {
        DispatchRuntime::snapshot(self, variant, extent, parameters)
    }
}

fn checked_plan(variant: &mut GpuVariant, extent: Extent) -> Result<ThreadGroupPlan, SkipReason> {
    let plan = variant.plan_for(extent);
    if plan.is_degenerate() {
        return Err(SkipReason::EmptyOutput(extent));
    }
    Ok(plan)
}

fn check_texture_size(extent: Extent, max: u32) -> Result<(), SkipReason> {
    if extent.width > max || extent.height > max {
        return Err(SkipReason::TooLarge { extent, max });
    }
    Ok(())
}

fn encode_kernel(
    device: &wgpu::Device,
    encoder: &mut wgpu::CommandEncoder,
    layout: &wgpu::BindGroupLayout,
    pipeline: &wgpu::ComputePipeline,
    output: &wgpu::TextureView,
    parameters: &ParameterBuffer,
    plan: &ThreadGroupPlan,
) {
    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("kernel bind group"),
        layout,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::TextureView(output),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: parameters.buffer().as_entire_binding(),
            },
        ],
    });

    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
        label: Some("kernel pass"),
        timestamp_writes: None,
    });
    pass.set_pipeline(pipeline);
    pass.set_bind_group(0, &bind_group, &[]);
    pass.dispatch_workgroups(plan.grid.x, plan.grid.y, plan.grid.z);
}
