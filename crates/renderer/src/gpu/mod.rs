//! `wgpu` side of the renderer.
//!
//! - `context` picks the adapter, creates the device and configures the
//!   optional window surface.
//! - `pipeline` turns expanded kernels into compute pipelines (one per
//!   thread-group shape) and builds the surface blit pipeline.
//! - `backend` plugs the context into the variant factory.
//! - `targets` owns the textures and staging buffers dispatches write into.

mod backend;
mod context;
mod pipeline;
mod targets;

pub use backend::ParameterBuffer;
pub use context::{GpuContext, SurfaceTarget};
pub use pipeline::KernelProgram;

pub(crate) use pipeline::BlitPipeline;
pub(crate) use targets::{FrameTarget, TransientTarget};
