use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use kernel::{
    ControlPointModel, Derivation, Extent, FormulaCatalog, KernelTemplate, ParameterLayout,
    Parameters, ShaderVariantFactory, VariantCursor, ViewParameters,
};
use winit::dpi::{PhysicalPosition, PhysicalSize};
use winit::event::{ElementState, Event, KeyEvent, MouseButton, MouseScrollDelta, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowBuilder};

use crate::gpu::{GpuContext, SurfaceTarget};
use crate::runtime::{
    DispatchOutcome, DispatchRequest, DispatchRuntime, DispatchTarget, GpuVariantSet,
};
use crate::snapshot::{capture_file_name, save_png};
use crate::types::GpuOptions;

const ZOOM_STEP: f32 = 1.1;

/// Settings for the interactive preview window.
#[derive(Clone, Debug)]
pub struct PreviewConfig {
    pub size: Extent,
    pub initial_variant: usize,
    pub view: ViewParameters,
    pub gpu: GpuOptions,
    /// Minimum time between two redraws.
    pub frame_interval: Duration,
    /// Where `s` saves snapshots.
    pub capture_dir: PathBuf,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            size: Extent::new(1024, 768),
            initial_variant: 0,
            view: ViewParameters::default(),
            gpu: GpuOptions::default(),
            frame_interval: Duration::from_millis(33),
            capture_dir: PathBuf::from("."),
        }
    }
}

// Declaration order is drop order: GPU objects go before the window.
struct PreviewState {
    runtime: DispatchRuntime,
    variants: GpuVariantSet,
    cursor: VariantCursor,
    view: ViewParameters,
    control: ControlPointModel,
    surface: SurfaceTarget,
    context: GpuContext,
    window: Arc<Window>,
    mouse: MouseState,
    dirty: bool,
    last_frame: Option<Instant>,
    frame_interval: Duration,
    capture_dir: PathBuf,
}

impl PreviewState {
    fn extent(&self) -> Extent {
        self.surface.extent()
    }

    fn parameters_for(&self, layout: ParameterLayout) -> Parameters {
        match layout {
            ParameterLayout::Viewport => Parameters::View(self.view),
            ParameterLayout::ControlPoints { count } => {
                let derived = self.control.derived();
                Parameters::ControlPoints {
                    points: (0..count as usize).map(|i| derived[i % derived.len()]).collect(),
                    zoom: self.view.zoom,
                    origin: self.view.origin,
                }
            }
        }
    }

    fn update_title(&self) {
        let title = match self.variants.select(self.cursor.index()) {
            Some(variant) => format!(
                "iterscope: {} [{}/{}]",
                variant.spec().label(),
                self.cursor.index() + 1,
                self.variants.len()
            ),
            None => "iterscope".to_string(),
        };
        self.window.set_title(&title);
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn cycle(&mut self, forward: bool) {
        if forward {
            self.cursor.next();
        } else {
            self.cursor.previous();
        }
        self.update_title();
        self.mark_dirty();
    }

    fn cycle_derivation(&mut self) {
        let position = Derivation::ALL
            .iter()
            .position(|derivation| *derivation == self.control.derivation)
            .unwrap_or(0);
        self.control.derivation = Derivation::ALL[(position + 1) % Derivation::ALL.len()];
        tracing::info!(derivation = ?self.control.derivation, "control point derivation");
        self.mark_dirty();
    }

    fn resize(&mut self, size: PhysicalSize<u32>) {
        let previous = self.extent();
        let requested = Extent::new(size.width, size.height);
        if requested.is_empty() {
            return;
        }
        self.surface.resize(requested);
        self.view = self.view.rescaled(previous, self.extent());
        self.mark_dirty();
    }

    fn handle_pointer(&mut self, position: PhysicalPosition<f64>) {
        self.mouse.position = Some(position);
        let pixel = [position.x as f32, position.y as f32];
        let extent = self.extent();
        if self.mouse.left {
            self.view.cursor = pixel;
            self.control.points[0] = self.view.pixel_to_complex(pixel, extent);
            self.mark_dirty();
        } else if self.mouse.right {
            self.control.points[1] = self.view.pixel_to_complex(pixel, extent);
            self.mark_dirty();
        }
    }

    fn zoom(&mut self, lines: f32) {
        let factor = ZOOM_STEP.powf(-lines);
        self.view.zoom = [self.view.zoom[0] * factor, self.view.zoom[1] * factor];
        self.mark_dirty();
    }

    fn render(&mut self) {
        let index = self.cursor.index();
        let Some(layout) = self.variants.select(index).map(|variant| variant.layout()) else {
            return;
        };
        let parameters = self.parameters_for(layout);
        let Some(variant) = self.variants.select_mut(index) else {
            return;
        };
        let request = DispatchRequest {
            extent: self.surface.extent(),
            parameters: &parameters,
        };
        match self
            .runtime
            .dispatch(variant, request, DispatchTarget::Surface(&self.surface))
        {
            DispatchOutcome::Skipped(reason) if reason.needs_reconfigure() => {
                self.surface.reconfigure();
            }
            DispatchOutcome::Skipped(_) => {}
            DispatchOutcome::Presented | DispatchOutcome::Captured(_) => {
                self.dirty = false;
                self.last_frame = Some(Instant::now());
            }
        }
    }

    fn capture(&mut self) {
        let extent = self.extent();
        let index = self.cursor.index();
        let Some(layout) = self.variants.select(index).map(|variant| variant.layout()) else {
            return;
        };
        let parameters = self.parameters_for(layout);
        let Some(variant) = self.variants.select_mut(index) else {
            return;
        };
        let Some(image) = self.runtime.snapshot(variant, extent, &parameters) else {
            tracing::warn!("snapshot failed; nothing saved");
            return;
        };
        let path = self
            .capture_dir
            .join(capture_file_name(&chrono::Local::now()));
        if let Err(err) = save_png(&image, &path) {
            tracing::error!("{err:#}");
        }
    }

    fn handle_key(&mut self, event: &KeyEvent) -> bool {
        if event.state != ElementState::Pressed {
            return false;
        }
        match &event.logical_key {
            Key::Named(NamedKey::Escape) => return true,
            Key::Named(NamedKey::ArrowRight) | Key::Named(NamedKey::ArrowDown) => self.cycle(true),
            Key::Named(NamedKey::ArrowLeft) | Key::Named(NamedKey::ArrowUp) => self.cycle(false),
            Key::Character(value) => match value.as_str() {
                "]" => self.cycle(true),
                "[" => self.cycle(false),
                "d" | "D" => self.cycle_derivation(),
                "s" | "S" if !event.repeat => self.capture(),
                "r" | "R" => {
                    self.view = ViewParameters {
                        cursor: self.view.cursor,
                        ..ViewParameters::new([0.0, 0.0], [0.0, 0.0], [1.0, 1.0])
                    };
                    self.mark_dirty();
                }
                _ => {}
            },
            _ => {}
        }
        false
    }

    fn next_redraw(&self, now: Instant) -> Option<Instant> {
        next_redraw(self.dirty, self.last_frame, self.frame_interval, now)
    }
}

/// When the next redraw may happen, or `None` if nothing changed.
fn next_redraw(
    dirty: bool,
    last_frame: Option<Instant>,
    frame_interval: Duration,
    now: Instant,
) -> Option<Instant> {
    if !dirty {
        return None;
    }
    let earliest = last_frame.and_then(|last| last.checked_add(frame_interval));
    Some(earliest.map_or(now, |earliest| earliest.max(now)))
}

#[derive(Default)]
struct MouseState {
    position: Option<PhysicalPosition<f64>>,
    left: bool,
    right: bool,
}

/// Opens a window and renders the selected variant until it is closed.
///
/// Arrow keys and `[`/`]` cycle variants, the left mouse button moves the
/// cursor (and the first control point), the right button moves the second
/// control point, the wheel zooms, `d` cycles control-point derivations,
/// `r` resets the view and `s` saves a snapshot.
pub fn run_preview(
    template: &KernelTemplate,
    catalog: &FormulaCatalog,
    config: PreviewConfig,
) -> Result<()> {
    let event_loop =
        EventLoop::new().map_err(|err| anyhow!("failed to create event loop: {err}"))?;
    let window = WindowBuilder::new()
        .with_title("iterscope")
        .with_inner_size(PhysicalSize::new(
            config.size.width.max(1),
            config.size.height.max(1),
        ))
        .build(&event_loop)
        .map_err(|err| anyhow!("failed to create preview window: {err}"))?;
    let window = Arc::new(window);

    let inner = window.inner_size();
    let (context, surface) = GpuContext::with_surface(
        window.as_ref(),
        Extent::new(inner.width, inner.height),
        &config.gpu,
    )?;
    let variants = ShaderVariantFactory::new(&context, template).build_all(catalog);
    if variants.is_empty() {
        anyhow::bail!("no kernel variant compiled; see the log for details");
    }
    let runtime = DispatchRuntime::new(&context);

    let mut state = PreviewState {
        runtime,
        cursor: VariantCursor::starting_at(config.initial_variant, variants.len()),
        variants,
        view: config.view,
        control: ControlPointModel::default(),
        surface,
        context,
        window: window.clone(),
        mouse: MouseState::default(),
        dirty: true,
        last_frame: None,
        frame_interval: config.frame_interval,
        capture_dir: config.capture_dir,
    };
    state.update_title();
    tracing::info!(
        adapter = %state.context.adapter_profile().name,
        variants = state.variants.len(),
        "preview window ready"
    );

    event_loop
        .run(move |event, elwt| match event {
            Event::WindowEvent { window_id, event } if window_id == state.window.id() => {
                match event {
                    WindowEvent::CloseRequested | WindowEvent::Destroyed => elwt.exit(),
                    WindowEvent::KeyboardInput { event, .. } => {
                        if state.handle_key(&event) {
                            elwt.exit();
                        }
                    }
                    WindowEvent::CursorMoved { position, .. } => state.handle_pointer(position),
                    WindowEvent::MouseInput {
                        state: button_state,
                        button,
                        ..
                    } => {
                        let pressed = button_state == ElementState::Pressed;
                        match button {
                            MouseButton::Left => state.mouse.left = pressed,
                            MouseButton::Right => state.mouse.right = pressed,
                            _ => {}
                        }
                        if pressed {
                            if let Some(position) = state.mouse.position {
                                state.handle_pointer(position);
                            }
                        }
                    }
                    WindowEvent::MouseWheel { delta, .. } => {
                        let lines = match delta {
                            MouseScrollDelta::LineDelta(_, y) => y,
                            MouseScrollDelta::PixelDelta(position) => position.y as f32 / 40.0,
                        };
                        state.zoom(lines);
                    }
                    WindowEvent::Resized(size) => state.resize(size),
                    WindowEvent::RedrawRequested => state.render(),
                    _ => {}
                }
            }
            Event::AboutToWait => match state.next_redraw(Instant::now()) {
                Some(deadline) if deadline <= Instant::now() => {
                    state.window.request_redraw();
                    elwt.set_control_flow(ControlFlow::Wait);
                }
                Some(deadline) => elwt.set_control_flow(ControlFlow::WaitUntil(deadline)),
                None => elwt.set_control_flow(ControlFlow::Wait),
            },
            _ => {}
        })
        .map_err(|err| anyhow!("window event loop error: {err}"))
}
