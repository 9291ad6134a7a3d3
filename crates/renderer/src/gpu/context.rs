use anyhow::{anyhow, bail, Context as AnyhowContext, Result};
use kernel::{DeviceLimits, Extent};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::types::{device_limits, AdapterProfile, GpuOptions};

/// Device, queue and the limits every dispatch is planned against.
///
/// Passed by reference to whoever needs the GPU; there is no global device.
pub struct GpuContext {
    _instance: wgpu::Instance,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    adapter_profile: AdapterProfile,
    wgpu_limits: wgpu::Limits,
    limits: DeviceLimits,
}

impl GpuContext {
    /// Context without a presentation surface, for snapshots and tests.
    pub fn headless(options: &GpuOptions) -> Result<Self> {
        let instance = create_instance();
        let adapter = request_adapter(&instance, options, None)?;
        Self::from_adapter(instance, &adapter, options)
    }

    /// Context plus a configured surface for `target`.
    ///
    /// `target` must outlive the returned [`SurfaceTarget`].
    pub fn with_surface<T>(
        target: &T,
        size: Extent,
        options: &GpuOptions,
    ) -> Result<(Self, SurfaceTarget)>
    where
        T: HasDisplayHandle + HasWindowHandle,
    {
        let instance = create_instance();

        let window_handle = target
            .window_handle()
            .map_err(|err| anyhow!("failed to acquire window handle: {err}"))?;
        let display_handle = target
            .display_handle()
            .map_err(|err| anyhow!("failed to acquire display handle: {err}"))?;

        let surface = unsafe {
            instance.create_surface_unsafe(wgpu::SurfaceTargetUnsafe::RawHandle {
                raw_display_handle: display_handle.as_raw(),
                raw_window_handle: window_handle.as_raw(),
            })
        }
        .context("failed to create rendering surface")?;

        let adapter = request_adapter(&instance, options, Some(&surface))?;
        let context = Self::from_adapter(instance, &adapter, options)?;
        let surface = SurfaceTarget::configure(surface, &adapter, &context, size)?;
        Ok((context, surface))
    }

    fn from_adapter(
        instance: wgpu::Instance,
        adapter: &wgpu::Adapter,
        options: &GpuOptions,
    ) -> Result<Self> {
        let adapter_info = adapter.get_info();
        let adapter_profile = AdapterProfile::from_wgpu(&adapter_info);

        let downlevel = adapter.get_downlevel_capabilities();
        if !downlevel.flags.contains(wgpu::DownlevelFlags::COMPUTE_SHADERS) {
            bail!(
                "GPU adapter {} ({:?}) does not support compute shaders",
                adapter_profile.name,
                adapter_profile.backend
            );
        }

        let wgpu_limits = adapter.limits();
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("iterscope device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu_limits.clone(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .context("failed to create GPU device")?;

        let execution_width = options
            .execution_width
            .unwrap_or_else(|| adapter_profile.execution_width());
        let limits = device_limits(&wgpu_limits, execution_width);

        tracing::debug!(
            name = %adapter_profile.name,
            backend = ?adapter_profile.backend,
            device_type = ?adapter_profile.device_type,
            software = adapter_profile.is_software(),
            max_threads = limits.max_threads_per_group,
            execution_width = limits.execution_width,
            "selected GPU adapter"
        );

        Ok(Self {
            _instance: instance,
            device,
            queue,
            adapter_profile,
            wgpu_limits,
            limits,
        })
    }

    pub fn adapter_profile(&self) -> &AdapterProfile {
        &self.adapter_profile
    }

    /// Limits handed to the thread-group partitioner.
    pub fn limits(&self) -> DeviceLimits {
        self.limits
    }

    pub fn max_texture_dimension(&self) -> u32 {
        self.wgpu_limits.max_texture_dimension_2d
    }
}

fn create_instance() -> wgpu::Instance {
    wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        flags: wgpu::InstanceFlags::default(),
        memory_budget_thresholds: wgpu::MemoryBudgetThresholds::default(),
        backend_options: wgpu::BackendOptions::default(),
    })
}

fn request_adapter(
    instance: &wgpu::Instance,
    options: &GpuOptions,
    surface: Option<&wgpu::Surface<'_>>,
) -> Result<wgpu::Adapter> {
    pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: options.power.to_wgpu(),
        compatible_surface: surface,
        force_fallback_adapter: false,
    }))
    .context("failed to find a suitable GPU adapter")
}

/// A window surface and its current configuration.
pub struct SurfaceTarget {
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
    device: wgpu::Device,
    max_dimension: u32,
}

impl SurfaceTarget {
    fn configure(
        surface: wgpu::Surface<'static>,
        adapter: &wgpu::Adapter,
        context: &GpuContext,
        size: Extent,
    ) -> Result<Self> {
        let max_dimension = context.max_texture_dimension();
        let width = size.width.max(1);
        let height = size.height.max(1);
        if width > max_dimension || height > max_dimension {
            bail!(
                "GPU max texture dimension is {max_dimension}, requested surface is {width}x{height}"
            );
        }

        let caps = surface.get_capabilities(adapter);
        let Some(&first_format) = caps.formats.first() else {
            bail!("surface reports no supported formats for this adapter");
        };
        // Kernel output is already display-encoded, so skip the sRGB conversion.
        let format = caps
            .formats
            .iter()
            .copied()
            .find(|format| !format.is_srgb())
            .unwrap_or_else(|| {
                tracing::warn!(
                    fallback = ?first_format,
                    "no linear (non-sRGB) surface format available"
                );
                first_format
            });

        let present_mode = if caps.present_modes.contains(&wgpu::PresentMode::Fifo) {
            wgpu::PresentMode::Fifo
        } else {
            caps.present_modes.first().copied().unwrap_or(wgpu::PresentMode::Fifo)
        };
        let alpha_mode = caps
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width,
            height,
            present_mode,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&context.device, &config);
        tracing::debug!(?format, ?present_mode, width, height, "configured surface");

        Ok(Self {
            surface,
            config,
            device: context.device.clone(),
            max_dimension,
        })
    }

    pub fn extent(&self) -> Extent {
        Extent::new(self.config.width, self.config.height)
    }

    pub fn format(&self) -> wgpu::TextureFormat {
        self.config.format
    }

    /// Reconfigures for a new window size. Zero sizes (minimised windows)
    /// are ignored; sizes past the device texture limit are clamped to it.
    pub fn resize(&mut self, size: Extent) {
        if size.is_empty() {
            return;
        }
        let clamped = clamp_to_texture_limit(size, self.max_dimension);
        if clamped != size {
            tracing::warn!(
                requested = %size,
                surface = %clamped,
                max = self.max_dimension,
                "window exceeds the device texture limit; clamping surface"
            );
        }
        self.config.width = clamped.width;
        self.config.height = clamped.height;
        self.surface.configure(&self.device, &self.config);
    }

    /// Re-applies the current configuration after the surface was lost.
    pub fn reconfigure(&self) {
        self.surface.configure(&self.device, &self.config);
    }

    pub(crate) fn acquire(&self) -> Result<wgpu::SurfaceTexture, wgpu::SurfaceError> {
        self.surface.get_current_texture()
    }
}

fn clamp_to_texture_limit(size: Extent, max: u32) -> Extent {
    Extent::new(size.width.min(max), size.height.min(max))
}
