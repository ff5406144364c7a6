//! Content-comparable descriptions interned by [`crate::ContentPool`].
//!
//! Every description here compares by value. Shader bytecode compares by its BLAKE3 digest, so two
//! separately loaded copies of the same shader are the same content.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use bitflags::bitflags;

use crate::binding::StandardLayout;
use crate::descriptor::{ComparisonFunc, SamplerDesc};
use crate::error::GpuError;
use crate::format::{BufferLayoutId, Format, ViewDimension};

/// Resource class of a reflected shader binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindKind {
    ConstantBuffer,
    ShaderResource,
    UnorderedAccess,
    Sampler,
}

impl BindKind {
    pub fn register_prefix(self) -> char {
        match self {
            BindKind::ConstantBuffer => 'b',
            BindKind::ShaderResource => 't',
            BindKind::UnorderedAccess => 'u',
            BindKind::Sampler => 's',
        }
    }
}

/// One resource binding as reported by shader reflection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderBinding {
    pub name: String,
    pub kind: BindKind,
    pub register: u32,
    pub space: u32,
    /// Array size; 1 for scalar bindings.
    pub count: u32,
    pub dimension: ViewDimension,
    pub format: Format,
    pub layout: Option<BufferLayoutId>,
    /// Bytes the shader reads from a constant buffer.
    pub min_size: u32,
    /// Sampler bindings declared as `SamplerComparisonState`.
    pub comparison: bool,
}

impl ShaderBinding {
    fn new(name: &str, kind: BindKind, register: u32) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            register,
            space: 0,
            count: 1,
            dimension: ViewDimension::Unknown,
            format: Format::Unknown,
            layout: None,
            min_size: 0,
            comparison: false,
        }
    }

    pub fn constant_buffer(name: &str, register: u32, min_size: u32) -> Self {
        Self {
            min_size,
            ..Self::new(name, BindKind::ConstantBuffer, register)
        }
    }

    pub fn texture(name: &str, register: u32, dimension: ViewDimension) -> Self {
        Self {
            dimension,
            ..Self::new(name, BindKind::ShaderResource, register)
        }
    }

    pub fn structured_buffer(name: &str, register: u32, layout: BufferLayoutId) -> Self {
        Self {
            dimension: ViewDimension::Buffer,
            layout: Some(layout),
            ..Self::new(name, BindKind::ShaderResource, register)
        }
    }

    pub fn rw_buffer(name: &str, register: u32, layout: Option<BufferLayoutId>) -> Self {
        Self {
            dimension: ViewDimension::Buffer,
            layout,
            ..Self::new(name, BindKind::UnorderedAccess, register)
        }
    }

    pub fn rw_texture(name: &str, register: u32, dimension: ViewDimension, format: Format) -> Self {
        Self {
            dimension,
            format,
            ..Self::new(name, BindKind::UnorderedAccess, register)
        }
    }

    pub fn sampler(name: &str, register: u32, comparison: bool) -> Self {
        Self {
            comparison,
            ..Self::new(name, BindKind::Sampler, register)
        }
    }

    pub fn in_space(mut self, space: u32) -> Self {
        self.space = space;
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    /// `t3`, `b0, space1`, ...
    pub fn register_name(&self) -> String {
        let prefix = self.kind.register_prefix();
        if self.space == 0 {
            format!("{prefix}{}", self.register)
        } else {
            format!("{prefix}{}, space{}", self.register, self.space)
        }
    }
}

/// Bind points of one shader stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ShaderReflection {
    pub bindings: Vec<ShaderBinding>,
}

impl ShaderReflection {
    pub fn new(bindings: Vec<ShaderBinding>) -> Self {
        Self { bindings }
    }
}

/// Compiled shader bytecode plus its reflection.
#[derive(Clone)]
pub struct ShaderBytecode {
    bytes: Arc<[u8]>,
    hash: blake3::Hash,
    reflection: Arc<ShaderReflection>,
}

impl ShaderBytecode {
    pub fn new(bytes: impl Into<Arc<[u8]>>, reflection: ShaderReflection) -> Self {
        let bytes = bytes.into();
        let hash = blake3::hash(&bytes);
        Self {
            bytes,
            hash,
            reflection: Arc::new(reflection),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn hash(&self) -> blake3::Hash {
        self.hash
    }

    pub fn reflection(&self) -> &ShaderReflection {
        &self.reflection
    }
}

impl PartialEq for ShaderBytecode {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for ShaderBytecode {}

impl Hash for ShaderBytecode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.as_bytes().hash(state);
    }
}

impl fmt::Debug for ShaderBytecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShaderBytecode")
            .field("len", &self.bytes.len())
            .field("hash", &self.hash.to_hex())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FillMode {
    #[default]
    Solid,
    Wireframe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RasterizerState {
    pub fill_mode: FillMode,
    pub cull_mode: CullMode,
    pub front_counter_clockwise: bool,
    pub depth_bias: i32,
    pub depth_clip: bool,
    pub multisample: bool,
    pub conservative: bool,
}

impl Default for RasterizerState {
    fn default() -> Self {
        Self {
            fill_mode: FillMode::Solid,
            cull_mode: CullMode::Back,
            front_counter_clockwise: false,
            depth_bias: 0,
            depth_clip: true,
            multisample: false,
            conservative: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendFactor {
    Zero,
    #[default]
    One,
    SrcColor,
    InvSrcColor,
    SrcAlpha,
    InvSrcAlpha,
    DestAlpha,
    InvDestAlpha,
    DestColor,
    InvDestColor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendOp {
    #[default]
    Add,
    Subtract,
    RevSubtract,
    Min,
    Max,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ColorWriteMask: u8 {
        const RED = 1 << 0;
        const GREEN = 1 << 1;
        const BLUE = 1 << 2;
        const ALPHA = 1 << 3;
        const ALL = Self::RED.bits() | Self::GREEN.bits() | Self::BLUE.bits() | Self::ALPHA.bits();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderTargetBlend {
    pub blend_enable: bool,
    pub src: BlendFactor,
    pub dst: BlendFactor,
    pub op: BlendOp,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
    pub op_alpha: BlendOp,
    pub write_mask: ColorWriteMask,
}

impl Default for RenderTargetBlend {
    fn default() -> Self {
        Self {
            blend_enable: false,
            src: BlendFactor::One,
            dst: BlendFactor::Zero,
            op: BlendOp::Add,
            src_alpha: BlendFactor::One,
            dst_alpha: BlendFactor::Zero,
            op_alpha: BlendOp::Add,
            write_mask: ColorWriteMask::ALL,
        }
    }
}

impl RenderTargetBlend {
    pub fn alpha_blend() -> Self {
        Self {
            blend_enable: true,
            src: BlendFactor::SrcAlpha,
            dst: BlendFactor::InvSrcAlpha,
            src_alpha: BlendFactor::One,
            dst_alpha: BlendFactor::InvSrcAlpha,
            ..Self::default()
        }
    }
}

pub const MAX_RENDER_TARGETS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlendState {
    pub alpha_to_coverage: bool,
    pub independent_blend: bool,
    pub render_targets: [RenderTargetBlend; MAX_RENDER_TARGETS],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StencilOp {
    #[default]
    Keep,
    Zero,
    Replace,
    IncrSat,
    DecrSat,
    Invert,
    Incr,
    Decr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StencilFace {
    pub fail: StencilOp,
    pub depth_fail: StencilOp,
    pub pass: StencilOp,
    pub func: ComparisonFunc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthStencilState {
    pub depth_enable: bool,
    pub depth_write: bool,
    pub depth_func: ComparisonFunc,
    pub stencil_enable: bool,
    pub stencil_read_mask: u8,
    pub stencil_write_mask: u8,
    pub front: StencilFace,
    pub back: StencilFace,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_enable: true,
            depth_write: true,
            depth_func: ComparisonFunc::Less,
            stencil_enable: false,
            stencil_read_mask: 0xff,
            stencil_write_mask: 0xff,
            front: StencilFace::default(),
            back: StencilFace::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveTopologyType {
    Point,
    Line,
    #[default]
    Triangle,
    Patch,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GraphicsPipelineDesc {
    pub vs: ShaderBytecode,
    pub ps: Option<ShaderBytecode>,
    pub gs: Option<ShaderBytecode>,
    pub hs: Option<ShaderBytecode>,
    pub ds: Option<ShaderBytecode>,
    pub blend: BlendState,
    pub rasterizer: RasterizerState,
    pub depth_stencil: DepthStencilState,
    pub sample_mask: u32,
    pub topology: PrimitiveTopologyType,
}

impl GraphicsPipelineDesc {
    pub fn new(vs: ShaderBytecode, ps: Option<ShaderBytecode>) -> Self {
        Self {
            vs,
            ps,
            gs: None,
            hs: None,
            ds: None,
            blend: BlendState::default(),
            rasterizer: RasterizerState::default(),
            depth_stencil: DepthStencilState::default(),
            sample_mask: u32::MAX,
            topology: PrimitiveTopologyType::Triangle,
        }
    }

    /// Every bound stage, vertex shader first.
    pub fn shaders(&self) -> impl Iterator<Item = &ShaderBytecode> {
        std::iter::once(&self.vs).chain(
            [&self.hs, &self.ds, &self.gs, &self.ps]
                .into_iter()
                .flatten(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComputePipelineDesc {
    pub cs: ShaderBytecode,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PipelineStateDesc {
    Graphics(GraphicsPipelineDesc),
    Compute(ComputePipelineDesc),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputStepRate {
    PerVertex,
    PerInstance(u32),
}

/// Offset value meaning "directly after the previous element in the same slot".
pub const APPEND_ALIGNED_ELEMENT: u32 = u32::MAX;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InputElement {
    pub semantic: String,
    pub semantic_index: u32,
    pub format: Format,
    pub input_slot: u32,
    pub aligned_byte_offset: u32,
    pub step: InputStepRate,
}

impl InputElement {
    pub fn per_vertex(semantic: &str, semantic_index: u32, format: Format) -> Self {
        Self {
            semantic: semantic.to_owned(),
            semantic_index,
            format,
            input_slot: 0,
            aligned_byte_offset: APPEND_ALIGNED_ELEMENT,
            step: InputStepRate::PerVertex,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct InputLayoutDesc {
    pub elements: Vec<InputElement>,
}

impl InputLayoutDesc {
    pub fn new(elements: Vec<InputElement>) -> Self {
        Self { elements }
    }

    /// Elements with `APPEND_ALIGNED_ELEMENT` offsets replaced by concrete byte offsets.
    pub fn resolved_offsets(&self) -> Vec<u32> {
        let mut next_in_slot: Vec<(u32, u32)> = Vec::new();
        self.elements
            .iter()
            .map(|element| {
                let size = element.format.byte_size().unwrap_or(0);
                let index = match next_in_slot
                    .iter()
                    .position(|(slot, _)| *slot == element.input_slot)
                {
                    Some(index) => index,
                    None => {
                        next_in_slot.push((element.input_slot, 0));
                        next_in_slot.len() - 1
                    }
                };
                let offset = if element.aligned_byte_offset == APPEND_ALIGNED_ELEMENT {
                    next_in_slot[index].1
                } else {
                    element.aligned_byte_offset
                };
                next_in_slot[index].1 = offset + size;
                offset
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputLayoutDesc {
    pub render_targets: Vec<Format>,
    pub depth_stencil: Format,
    pub sample_count: u32,
    pub sample_quality: u32,
}

impl OutputLayoutDesc {
    pub fn new(render_targets: Vec<Format>, depth_stencil: Format) -> Self {
        Self {
            render_targets,
            depth_stencil,
            sample_count: 1,
            sample_quality: 0,
        }
    }

    pub fn validate(&self) -> Result<(), GpuError> {
        if self.render_targets.len() > MAX_RENDER_TARGETS {
            return Err(GpuError::InvalidArgument(format!(
                "{} render targets exceed the limit of {MAX_RENDER_TARGETS}",
                self.render_targets.len()
            )));
        }
        if self.depth_stencil != Format::Unknown && !self.depth_stencil.is_depth() {
            return Err(GpuError::InvalidArgument(format!(
                "{:?} is not a depth-stencil format",
                self.depth_stencil
            )));
        }
        if self.sample_count == 0 {
            return Err(GpuError::InvalidArgument(
                "sample count must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RootSignatureFlags: u32 {
        const ALLOW_INPUT_ASSEMBLER_INPUT_LAYOUT = 1 << 0;
        const DENY_VERTEX_SHADER_ROOT_ACCESS = 1 << 1;
        const DENY_HULL_SHADER_ROOT_ACCESS = 1 << 2;
        const DENY_DOMAIN_SHADER_ROOT_ACCESS = 1 << 3;
        const DENY_GEOMETRY_SHADER_ROOT_ACCESS = 1 << 4;
        const DENY_PIXEL_SHADER_ROOT_ACCESS = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderVisibility {
    All,
    Vertex,
    Hull,
    Domain,
    Geometry,
    Pixel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RangeKind {
    Cbv,
    Srv,
    Uav,
    Sampler,
}

/// Descriptor count meaning "unbounded"; only valid for the last range of a table.
pub const UNBOUNDED_RANGE: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorRange {
    pub kind: RangeKind,
    pub count: u32,
    pub base_register: u32,
    pub space: u32,
    pub offset_in_table: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RootParameter {
    Table {
        ranges: Vec<DescriptorRange>,
        visibility: ShaderVisibility,
    },
    Constants {
        register: u32,
        space: u32,
        num_values: u32,
        visibility: ShaderVisibility,
    },
    Cbv {
        register: u32,
        space: u32,
        visibility: ShaderVisibility,
    },
    Srv {
        register: u32,
        space: u32,
        visibility: ShaderVisibility,
    },
    Uav {
        register: u32,
        space: u32,
        visibility: ShaderVisibility,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StaticSampler {
    pub sampler: SamplerDesc,
    pub register: u32,
    pub space: u32,
    pub visibility: ShaderVisibility,
}

#[derive(Debug, Clone)]
pub struct RootSignatureDesc {
    pub parameters: Vec<RootParameter>,
    pub static_samplers: Vec<StaticSampler>,
    pub flags: RootSignatureFlags,
    /// Slot convention this root signature was generated from, if any.
    ///
    /// Not part of the serialized content, but part of the interning key: Tier 2 shapes that
    /// differ only in SRV count serialize identically.
    pub layout: Option<Arc<StandardLayout>>,
}

const ROOT_SIGNATURE_BLOB_MAGIC: &[u8; 4] = b"LRS1";

impl RootSignatureDesc {
    pub fn new(parameters: Vec<RootParameter>, flags: RootSignatureFlags) -> Self {
        Self {
            parameters,
            static_samplers: Vec::new(),
            flags,
            layout: None,
        }
    }

    /// Canonical byte form; two descriptions with equal content serialize identically.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = BlobWriter::default();
        out.bytes(ROOT_SIGNATURE_BLOB_MAGIC);
        out.u32(self.flags.bits());
        out.u32(self.parameters.len() as u32);
        for parameter in &self.parameters {
            match parameter {
                RootParameter::Table { ranges, visibility } => {
                    out.u8(0);
                    out.visibility(*visibility);
                    out.u32(ranges.len() as u32);
                    for range in ranges {
                        out.u8(range.kind as u8);
                        out.u32(range.count);
                        out.u32(range.base_register);
                        out.u32(range.space);
                        out.u32(range.offset_in_table);
                    }
                }
                RootParameter::Constants {
                    register,
                    space,
                    num_values,
                    visibility,
                } => {
                    out.u8(1);
                    out.visibility(*visibility);
                    out.u32(*register);
                    out.u32(*space);
                    out.u32(*num_values);
                }
                RootParameter::Cbv {
                    register,
                    space,
                    visibility,
                }
                | RootParameter::Srv {
                    register,
                    space,
                    visibility,
                }
                | RootParameter::Uav {
                    register,
                    space,
                    visibility,
                } => {
                    let tag = match parameter {
                        RootParameter::Cbv { .. } => 2,
                        RootParameter::Srv { .. } => 3,
                        _ => 4,
                    };
                    out.u8(tag);
                    out.visibility(*visibility);
                    out.u32(*register);
                    out.u32(*space);
                }
            }
        }
        out.u32(self.static_samplers.len() as u32);
        for sampler in &self.static_samplers {
            out.sampler(&sampler.sampler);
            out.u32(sampler.register);
            out.u32(sampler.space);
            out.visibility(sampler.visibility);
        }
        out.finish()
    }
}

#[derive(Default)]
struct BlobWriter {
    buf: Vec<u8>,
}

impl BlobWriter {
    fn bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn visibility(&mut self, visibility: ShaderVisibility) {
        self.u8(visibility as u8);
    }

    fn sampler(&mut self, sampler: &SamplerDesc) {
        self.u8(sampler.filter as u8);
        self.u8(sampler.address_u as u8);
        self.u8(sampler.address_v as u8);
        self.u8(sampler.address_w as u8);
        self.u32(sampler.max_anisotropy);
        match sampler.comparison {
            Some(func) => {
                self.u8(1);
                self.u8(func as u8);
            }
            None => self.u8(0),
        }
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shader(src: &str) -> ShaderBytecode {
        ShaderBytecode::new(src.as_bytes().to_vec(), ShaderReflection::default())
    }

    #[test]
    fn bytecode_equality_follows_content() {
        assert_eq!(shader("vs_main"), shader("vs_main"));
        assert_ne!(shader("vs_main"), shader("vs_other"));
    }

    #[test]
    fn serialization_distinguishes_parameter_order() {
        let a = RootSignatureDesc::new(
            vec![
                RootParameter::Cbv {
                    register: 0,
                    space: 0,
                    visibility: ShaderVisibility::All,
                },
                RootParameter::Srv {
                    register: 0,
                    space: 0,
                    visibility: ShaderVisibility::Pixel,
                },
            ],
            RootSignatureFlags::ALLOW_INPUT_ASSEMBLER_INPUT_LAYOUT,
        );
        let mut b = a.clone();
        b.parameters.reverse();

        assert_eq!(a.serialize(), a.clone().serialize());
        assert_ne!(a.serialize(), b.serialize());
    }

    #[test]
    fn appended_offsets_accumulate_per_slot() {
        let mut instance = InputElement::per_vertex("WORLD", 0, Format::R32G32B32A32Float);
        instance.input_slot = 1;
        let layout = InputLayoutDesc::new(vec![
            InputElement::per_vertex("POSITION", 0, Format::R32G32B32Float),
            instance,
            InputElement::per_vertex("TEXCOORD", 0, Format::R32G32Float),
        ]);
        assert_eq!(layout.resolved_offsets(), vec![0, 0, 12]);
    }
}
