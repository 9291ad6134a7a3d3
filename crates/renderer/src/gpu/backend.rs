use anyhow::Result;
use kernel::{DeviceLimits, KernelBackend, VariantError, VariantSpec};

use super::context::GpuContext;
use super::pipeline::KernelProgram;
use super::targets::read_mapped;

/// Device buffer the kernel reads its packed parameters from.
pub struct ParameterBuffer {
    buffer: wgpu::Buffer,
    size: u64,
}

impl ParameterBuffer {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub(crate) fn write(&self, queue: &wgpu::Queue, bytes: &[u8]) {
        debug_assert_eq!(bytes.len() as u64, self.size, "parameter size mismatch");
        queue.write_buffer(&self.buffer, 0, bytes);
    }

    /// Copies the buffer back to the host. Blocks until the copy finishes.
    pub fn read_back(&self, context: &GpuContext) -> Result<Vec<u8>> {
        let staging = context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("parameter readback"),
            size: self.size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("parameter readback"),
            });
        encoder.copy_buffer_to_buffer(&self.buffer, 0, &staging, 0, self.size);
        context.queue.submit(Some(encoder.finish()));

        let bytes = read_mapped(&context.device, &staging, |bytes| bytes.to_vec());
        staging.destroy();
        bytes
    }
}

impl KernelBackend for GpuContext {
    type Program = KernelProgram;
    type Parameters = ParameterBuffer;

    fn compile(&self, spec: &VariantSpec, source: &str) -> Result<KernelProgram, VariantError> {
        KernelProgram::build(&self.device, spec, source, &self.limits())
    }

    fn allocate_parameters(&self, spec: &VariantSpec) -> Result<ParameterBuffer, VariantError> {
        let size = spec.layout.byte_len() as u64;
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("{} parameters", spec.label())),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(VariantError::Allocation {
                label: spec.label(),
                bytes: size as usize,
                message: err.to_string(),
            });
        }
        Ok(ParameterBuffer { buffer, size })
    }

    fn program_limits(&self, _program: &KernelProgram) -> DeviceLimits {
        self.limits()
    }
}
