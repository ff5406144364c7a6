//! Shared helpers for `lumen-gpu` integration tests.

use lumen_gpu::binding::{PER_VIEW_REGISTER, PER_WORLD_REGISTER, STANDARD_REGISTER_SPACE};
use lumen_gpu::desc::{GraphicsPipelineDesc, PipelineStateDesc, ShaderBinding, ShaderBytecode, ShaderReflection};
use lumen_gpu::format::ViewDimension;

#[allow(dead_code)]
pub fn require_webgpu() -> bool {
    let Ok(raw) = std::env::var("LUMEN_REQUIRE_WEBGPU") else {
        return false;
    };

    let v = raw.trim();
    v == "1"
        || v.eq_ignore_ascii_case("true")
        || v.eq_ignore_ascii_case("yes")
        || v.eq_ignore_ascii_case("on")
}

#[allow(dead_code)]
pub fn skip_or_panic(test_name: &str, reason: &str) {
    if require_webgpu() {
        panic!("LUMEN_REQUIRE_WEBGPU is enabled but {test_name} cannot run: {reason}");
    }
    eprintln!("skipping {test_name}: {reason}");
}

/// Route `tracing` output through the test harness. Safe to call from every test.
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

#[allow(dead_code)]
pub fn shader(source: &str, bindings: Vec<ShaderBinding>) -> ShaderBytecode {
    ShaderBytecode::new(source.as_bytes().to_vec(), ShaderReflection::new(bindings))
}

/// A lit, textured mesh pipeline bound through the standard convention.
#[allow(dead_code)]
pub fn mesh_pipeline(name: &str) -> PipelineStateDesc {
    let vs = shader(
        &format!("{name}.vs"),
        vec![
            ShaderBinding::constant_buffer("PerView", PER_VIEW_REGISTER, 64)
                .in_space(STANDARD_REGISTER_SPACE),
            ShaderBinding::constant_buffer("PerWorld", PER_WORLD_REGISTER, 64)
                .in_space(STANDARD_REGISTER_SPACE),
        ],
    );
    let ps = shader(
        &format!("{name}.ps"),
        vec![
            ShaderBinding::constant_buffer("Material", 0, 32),
            ShaderBinding::texture("Albedo", 0, ViewDimension::Texture2D),
            ShaderBinding::texture("Normal", 1, ViewDimension::Texture2D),
            ShaderBinding::sampler("Linear", 0, false),
        ],
    );
    PipelineStateDesc::Graphics(GraphicsPipelineDesc::new(vs, Some(ps)))
}
