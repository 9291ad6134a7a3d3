use std::borrow::Cow;

use wgpu::naga;

/// Parses and validates WGSL with naga so failures come back as readable
/// diagnostics instead of an opaque device error.
pub(crate) fn preflight_wgsl(source: &str) -> Result<(), String> {
    let module = naga::front::wgsl::parse_str(source).map_err(|err| err.emit_to_string(source))?;
    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::default(),
    )
    .validate(&module)
    .map_err(|err| err.into_inner().to_string())?;
    Ok(())
}

/// Compiles an expanded kernel into a shader module.
pub(crate) fn compile_kernel_module(
    device: &wgpu::Device,
    label: &str,
    source: &str,
) -> Result<wgpu::ShaderModule, String> {
    preflight_wgsl(source)?;

    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(Cow::Owned(source.to_owned())),
    });
    match pollster::block_on(device.pop_error_scope()) {
        Some(err) => Err(err.to_string()),
        None => Ok(module),
    }
}

/// Compiles the shader that copies the compute output onto the surface.
pub(crate) fn compile_blit_module(device: &wgpu::Device) -> wgpu::ShaderModule {
    device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("iterscope blit"),
        source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(BLIT_SHADER_WGSL)),
    })
}

/// Full-screen triangle that loads the compute output texel for texel.
const BLIT_SHADER_WGSL: &str = r"
@group(0) @binding(0) var frame: texture_2d<f32>;

@vertex
fn vs_main(@builtin(vertex_index) vertex_index: u32) -> @builtin(position) vec4<f32> {
    var positions = array<vec2<f32>, 3>(
        vec2<f32>(-1.0, -3.0),
        vec2<f32>(3.0, 1.0),
        vec2<f32>(-1.0, 1.0),
    );
    return vec4<f32>(positions[vertex_index], 0.0, 1.0);
}

@fragment
fn fs_main(@builtin(position) position: vec4<f32>) -> @location(0) vec4<f32> {
    let limit = vec2<i32>(textureDimensions(frame)) - vec2<i32>(1);
    let texel = clamp(vec2<i32>(floor(position.xy)), vec2<i32>(0), limit);
    return textureLoad(frame, texel, 0);
}
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blit_shader_passes_preflight() {
        preflight_wgsl(BLIT_SHADER_WGSL).unwrap();
    }

    #[test]
    fn preflight_reports_the_offending_source() {
        let err = preflight_wgsl("fn main() { let x = missing_thing; }").unwrap_err();
        assert!(err.contains("missing_thing"), "{err}");
    }

    #[test]
    fn expanded_kernel_passes_preflight() {
        let template = kernel::KernelTemplate::bundled();
        preflight_wgsl(&template.expand("cmul(z, z) + c")).unwrap();
    }
}
