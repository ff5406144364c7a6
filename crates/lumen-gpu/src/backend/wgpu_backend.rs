//! [`Device`] on top of `wgpu`.
//!
//! wgpu has no descriptor heaps and no root signatures, so both are emulated:
//!
//! - A root signature becomes one bind group layout per root parameter plus one trailing group
//!   for static samplers, and a pipeline layout over them. Table ranges map to consecutive
//!   bindings starting at `offset_in_table`. When there are more parameters than the device has
//!   bind groups, the tail parameters share the last group, each shifted to its own binding base;
//!   [`WgpuRootSignature::parameter_slot`] records where every parameter landed.
//! - Writable storage is only visible to the stages the device can write from: compute always,
//!   fragment unless the adapter is missing `FRAGMENT_WRITABLE_STORAGE`, vertex only with
//!   `VERTEX_WRITABLE_STORAGE`.
//! - A descriptor heap is a CPU array of logical descriptors; bind groups are assembled from it
//!   at draw time by the command layer.
//!
//! Shader bytecode is WGSL text with the entry points `vs_main`, `fs_main` and `cs_main`.
//! Validation errors are captured with an error scope and reported as [`DeviceError`].

use std::any::Any;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::binding::ResourceBindingTier;
use crate::desc::{
    BlendFactor, BlendOp, ComputePipelineDesc, CullMode, DepthStencilState, FillMode,
    InputStepRate, PrimitiveTopologyType, RangeKind, RenderTargetBlend, RootParameter,
    RootSignatureDesc, ShaderBytecode, ShaderVisibility, StencilFace, StencilOp,
    UNBOUNDED_RANGE,
};
use crate::descriptor::{ComparisonFunc, Descriptor, GpuResource, ResourceDesc};
use crate::device::{
    CpuDescriptorHandle, DescriptorHeapKind, Device, GpuDescriptorHandle, MappedBuffer,
    ResolvedGraphicsPipeline,
};
use crate::error::DeviceError;
use crate::format::{BufferLayoutId, Format};

const VERTEX_ENTRY_POINT: &str = "vs_main";
const FRAGMENT_ENTRY_POINT: &str = "fs_main";
const COMPUTE_ENTRY_POINT: &str = "cs_main";

// Synthetic handle space; wgpu exposes no descriptor or buffer addresses.
const CPU_HEAP_BASE: u64 = 0x0001_0000_0000;
const GPU_HEAP_BASE: u64 = 0x0002_0000_0000;
const UPLOAD_BASE: u64 = 0x0004_0000_0000;
const ADDRESS_SPACING: u64 = 0x0100_0000;

pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    writable_storage_stages: wgpu::ShaderStages,
    max_bind_groups: u32,
    next_heap: AtomicU64,
    next_upload: AtomicU64,
}

impl std::fmt::Debug for WgpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuDevice").finish_non_exhaustive()
    }
}

impl WgpuDevice {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let mut writable_storage_stages = wgpu::ShaderStages::COMPUTE | wgpu::ShaderStages::FRAGMENT;
        if device
            .features()
            .contains(wgpu::Features::VERTEX_WRITABLE_STORAGE)
        {
            writable_storage_stages |= wgpu::ShaderStages::VERTEX;
        }
        let max_bind_groups = device.limits().max_bind_groups;
        Self {
            device,
            queue,
            writable_storage_stages,
            max_bind_groups,
            next_heap: AtomicU64::new(0),
            next_upload: AtomicU64::new(0),
        }
    }

    /// Create a device on the first available adapter, without a surface.
    pub async fn new_headless() -> Result<Self, DeviceError> {
        // The GL backend complains loudly on Linux when `XDG_RUNTIME_DIR` is unset or unsafe.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let needs_runtime_dir = match std::env::var("XDG_RUNTIME_DIR") {
                Ok(dir) if !dir.is_empty() => match std::fs::metadata(&dir) {
                    Ok(meta) => !meta.is_dir() || (meta.permissions().mode() & 0o077) != 0,
                    Err(_) => true,
                },
                _ => true,
            };
            if needs_runtime_dir {
                let dir = std::env::temp_dir()
                    .join(format!("lumen-xdg-runtime-{}", std::process::id()));
                let _ = std::fs::create_dir_all(&dir);
                let _ = std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700));
                std::env::set_var("XDG_RUNTIME_DIR", &dir);
            }
        }

        let options = wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        };
        // Prefer GL on Linux; some Vulkan software adapters crash under test load.
        let adapter = if cfg!(target_os = "linux") {
            let gl = wgpu::Instance::new(wgpu::InstanceDescriptor {
                backends: wgpu::Backends::GL,
                ..Default::default()
            });
            match gl.request_adapter(&options).await {
                Some(adapter) => Some(adapter),
                None => {
                    wgpu::Instance::new(wgpu::InstanceDescriptor {
                        backends: wgpu::Backends::PRIMARY,
                        ..Default::default()
                    })
                    .request_adapter(&options)
                    .await
                }
            }
        } else {
            wgpu::Instance::new(wgpu::InstanceDescriptor {
                backends: wgpu::Backends::PRIMARY,
                ..Default::default()
            })
            .request_adapter(&options)
            .await
        }
        .ok_or_else(|| DeviceError::new("no suitable wgpu adapter found"))?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("lumen wgpu device"),
                    required_features: adapter.features()
                        & wgpu::Features::VERTEX_WRITABLE_STORAGE,
                    required_limits: wgpu::Limits::downlevel_defaults(),
                },
                None,
            )
            .await
            .map_err(|err| DeviceError::new(err.to_string()))?;

        debug!(adapter = ?adapter.get_info().name, "created headless wgpu device");
        let mut device = Self::new(device, queue);
        if !adapter
            .get_downlevel_capabilities()
            .flags
            .contains(wgpu::DownlevelFlags::FRAGMENT_WRITABLE_STORAGE)
        {
            device
                .writable_storage_stages
                .remove(wgpu::ShaderStages::FRAGMENT);
        }
        Ok(device)
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn max_bind_groups(&self) -> u32 {
        self.max_bind_groups
    }

    /// wgpu bind group layouts have no unbounded arrays.
    pub fn binding_tier(&self) -> ResourceBindingTier {
        ResourceBindingTier::Tier1
    }

    /// Run `create` inside a validation error scope.
    fn validated<T>(&self, create: impl FnOnce(&wgpu::Device) -> T) -> Result<T, DeviceError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = create(&self.device);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(DeviceError::new(err.to_string())),
            None => Ok(value),
        }
    }

    fn shader_module(&self, shader: &ShaderBytecode) -> Result<wgpu::ShaderModule, DeviceError> {
        let source = std::str::from_utf8(shader.bytes()).map_err(|_| {
            DeviceError::new(format!(
                "shader {} is not WGSL text",
                shader.hash().to_hex()
            ))
        })?;
        self.validated(|device| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("lumen shader"),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            })
        })
    }
}

/// Where a root parameter's bindings live: its bind group, and the number added to every
/// binding index (table offset or register) it declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterSlot {
    pub group: u32,
    pub binding_base: u32,
}

#[derive(Debug)]
pub struct WgpuRootSignature {
    bind_group_layouts: Vec<wgpu::BindGroupLayout>,
    pipeline_layout: wgpu::PipelineLayout,
    parameters: Vec<ParameterSlot>,
    static_samplers: Option<ParameterSlot>,
}

impl WgpuRootSignature {
    pub fn bind_group_layouts(&self) -> &[wgpu::BindGroupLayout] {
        &self.bind_group_layouts
    }

    pub fn parameter_slot(&self, parameter: u32) -> Option<ParameterSlot> {
        self.parameters.get(parameter as usize).copied()
    }

    pub fn static_sampler_slot(&self) -> Option<ParameterSlot> {
        self.static_samplers
    }

    pub fn pipeline_layout(&self) -> &wgpu::PipelineLayout {
        &self.pipeline_layout
    }
}

#[derive(Debug)]
pub enum WgpuPipelineState {
    Render(wgpu::RenderPipeline),
    Compute(wgpu::ComputePipeline),
}

/// Logical descriptors plus synthetic handles.
#[derive(Debug)]
pub struct WgpuDescriptorHeap {
    kind: DescriptorHeapKind,
    cpu_start: u64,
    gpu_start: Option<u64>,
    descriptors: Vec<Descriptor>,
}

impl WgpuDescriptorHeap {
    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    pub fn descriptor(&self, index: u32) -> Option<&Descriptor> {
        self.descriptors.get(index as usize)
    }
}

/// Upload buffer backed by a CPU shadow copy; [`Self::flush`] pushes it through the queue.
#[derive(Debug)]
pub struct WgpuUploadBuffer {
    buffer: wgpu::Buffer,
    shadow: Vec<u8>,
    gpu_address: u64,
}

impl WgpuUploadBuffer {
    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn flush(&self, queue: &wgpu::Queue) {
        queue.write_buffer(&self.buffer, 0, &self.shadow);
    }
}

impl MappedBuffer for WgpuUploadBuffer {
    fn len(&self) -> u64 {
        self.shadow.len() as u64
    }

    fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    fn mapped(&self) -> &[u8] {
        &self.shadow
    }

    fn mapped_mut(&mut self) -> &mut [u8] {
        &mut self.shadow
    }
}

#[derive(Debug)]
enum NativeResource {
    Buffer(wgpu::Buffer),
    Texture(wgpu::Texture),
}

/// A wgpu buffer or texture that descriptors can reference.
#[derive(Debug)]
pub struct WgpuResource {
    desc: ResourceDesc,
    native: NativeResource,
}

impl WgpuResource {
    pub fn from_buffer(buffer: wgpu::Buffer, stride: u32, layout: Option<BufferLayoutId>) -> Self {
        Self {
            desc: ResourceDesc::Buffer {
                size: buffer.size(),
                stride,
                layout,
            },
            native: NativeResource::Buffer(buffer),
        }
    }

    pub fn from_texture(texture: wgpu::Texture, format: Format) -> Self {
        let dimension = match texture.dimension() {
            wgpu::TextureDimension::D1 => crate::descriptor::TextureDimension::D1,
            wgpu::TextureDimension::D2 => crate::descriptor::TextureDimension::D2,
            wgpu::TextureDimension::D3 => crate::descriptor::TextureDimension::D3,
        };
        Self {
            desc: ResourceDesc::Texture {
                dimension,
                format,
                width: texture.width(),
                height: texture.height(),
                depth_or_array_layers: texture.depth_or_array_layers(),
                mip_levels: texture.mip_level_count(),
                sample_count: texture.sample_count(),
            },
            native: NativeResource::Texture(texture),
        }
    }

    pub fn buffer(&self) -> Option<&wgpu::Buffer> {
        match &self.native {
            NativeResource::Buffer(buffer) => Some(buffer),
            NativeResource::Texture(_) => None,
        }
    }

    pub fn texture(&self) -> Option<&wgpu::Texture> {
        match &self.native {
            NativeResource::Texture(texture) => Some(texture),
            NativeResource::Buffer(_) => None,
        }
    }
}

impl GpuResource for WgpuResource {
    fn desc(&self) -> &ResourceDesc {
        &self.desc
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn map_visibility(visibility: ShaderVisibility) -> Result<wgpu::ShaderStages, DeviceError> {
    match visibility {
        ShaderVisibility::All => Ok(wgpu::ShaderStages::all()),
        ShaderVisibility::Vertex => Ok(wgpu::ShaderStages::VERTEX),
        ShaderVisibility::Pixel => Ok(wgpu::ShaderStages::FRAGMENT),
        other => Err(DeviceError::new(format!(
            "shader visibility {other:?} has no wgpu stage"
        ))),
    }
}

fn uniform(has_dynamic_offset: bool) -> wgpu::BindingType {
    wgpu::BindingType::Buffer {
        ty: wgpu::BufferBindingType::Uniform,
        has_dynamic_offset,
        min_binding_size: None,
    }
}

fn storage(read_only: bool) -> wgpu::BindingType {
    wgpu::BindingType::Buffer {
        ty: wgpu::BufferBindingType::Storage { read_only },
        has_dynamic_offset: false,
        min_binding_size: None,
    }
}

/// Stages a binding of type `ty` may be visible to, given the stages that can write storage.
fn binding_stages(
    stages: wgpu::ShaderStages,
    ty: &wgpu::BindingType,
    writable_storage_stages: wgpu::ShaderStages,
) -> Result<wgpu::ShaderStages, DeviceError> {
    let writable = matches!(
        ty,
        wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: false },
            ..
        }
    );
    if !writable {
        return Ok(stages);
    }
    let allowed = stages.intersection(writable_storage_stages);
    if allowed.is_empty() {
        return Err(DeviceError::new(format!(
            "writable storage is not available to {stages:?} on this device"
        )));
    }
    Ok(allowed)
}

fn range_binding_type(kind: RangeKind) -> wgpu::BindingType {
    match kind {
        RangeKind::Cbv => uniform(false),
        // Root signatures carry no view dimension; table SRVs bind 2D float textures.
        RangeKind::Srv => wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        RangeKind::Uav => storage(false),
        RangeKind::Sampler => wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
    }
}

fn parameter_entries(
    parameter: &RootParameter,
    writable_storage_stages: wgpu::ShaderStages,
) -> Result<Vec<wgpu::BindGroupLayoutEntry>, DeviceError> {
    let entry = |binding, visibility, ty| wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty,
        count: None,
    };
    let entries = match parameter {
        RootParameter::Table { ranges, visibility } => {
            let visibility = map_visibility(*visibility)?;
            let mut entries = Vec::new();
            for range in ranges {
                if range.count == UNBOUNDED_RANGE {
                    return Err(DeviceError::new(
                        "unbounded descriptor ranges are not supported by the wgpu backend",
                    ));
                }
                entries.extend((0..range.count).map(|i| {
                    entry(range.offset_in_table + i, visibility, range_binding_type(range.kind))
                }));
            }
            entries
        }
        RootParameter::Constants {
            register,
            visibility,
            ..
        } => vec![entry(*register, map_visibility(*visibility)?, uniform(false))],
        RootParameter::Cbv {
            register,
            visibility,
            ..
        } => vec![entry(*register, map_visibility(*visibility)?, uniform(true))],
        RootParameter::Srv {
            register,
            visibility,
            ..
        } => vec![entry(*register, map_visibility(*visibility)?, storage(true))],
        RootParameter::Uav {
            register,
            visibility,
            ..
        } => vec![entry(*register, map_visibility(*visibility)?, storage(false))],
    };
    entries
        .into_iter()
        .map(|mut entry| {
            entry.visibility = binding_stages(entry.visibility, &entry.ty, writable_storage_stages)?;
            Ok(entry)
        })
        .collect()
}

/// Assign each unit of entries (root parameters, then static samplers) a bind group, merging the
/// tail into the last group once `max_groups` is reached.
fn pack_groups(
    units: Vec<Vec<wgpu::BindGroupLayoutEntry>>,
    max_groups: u32,
) -> Result<(Vec<Vec<wgpu::BindGroupLayoutEntry>>, Vec<ParameterSlot>), DeviceError> {
    if units.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }
    if max_groups == 0 {
        return Err(DeviceError::new("the device has no bind groups"));
    }
    let mut groups: Vec<Vec<wgpu::BindGroupLayoutEntry>> = Vec::new();
    let mut slots = Vec::with_capacity(units.len());
    for mut unit in units {
        if (groups.len() as u32) < max_groups {
            slots.push(ParameterSlot {
                group: groups.len() as u32,
                binding_base: 0,
            });
            groups.push(unit);
            continue;
        }
        let last = groups.len() - 1;
        let shared = &mut groups[last];
        let binding_base = shared
            .iter()
            .map(|entry| entry.binding)
            .max()
            .map_or(Some(0), |binding| binding.checked_add(1))
            .ok_or_else(|| DeviceError::new("bind group binding indices overflow"))?;
        for entry in &mut unit {
            entry.binding = entry
                .binding
                .checked_add(binding_base)
                .ok_or_else(|| DeviceError::new("bind group binding indices overflow"))?;
        }
        shared.extend(unit);
        slots.push(ParameterSlot {
            group: last as u32,
            binding_base,
        });
    }
    Ok((groups, slots))
}

fn map_vertex_format(format: Format) -> Result<wgpu::VertexFormat, DeviceError> {
    Ok(match format {
        Format::R32G32B32A32Float => wgpu::VertexFormat::Float32x4,
        Format::R32G32B32Float => wgpu::VertexFormat::Float32x3,
        Format::R32G32Float => wgpu::VertexFormat::Float32x2,
        Format::R32Float => wgpu::VertexFormat::Float32,
        Format::R32Uint => wgpu::VertexFormat::Uint32,
        Format::R16G16B16A16Float => wgpu::VertexFormat::Float16x4,
        Format::R8G8B8A8Unorm => wgpu::VertexFormat::Unorm8x4,
        Format::B8G8R8A8Unorm => wgpu::VertexFormat::Unorm8x4,
        other => {
            return Err(DeviceError::new(format!(
                "{other:?} is not a supported vertex format"
            )))
        }
    })
}

fn map_texture_format(format: Format) -> Result<wgpu::TextureFormat, DeviceError> {
    Ok(match format {
        Format::R8G8B8A8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        Format::R8G8B8A8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
        Format::B8G8R8A8Unorm => wgpu::TextureFormat::Bgra8Unorm,
        Format::B8G8R8A8UnormSrgb => wgpu::TextureFormat::Bgra8UnormSrgb,
        Format::R10G10B10A2Unorm => wgpu::TextureFormat::Rgb10a2Unorm,
        Format::R16G16B16A16Float => wgpu::TextureFormat::Rgba16Float,
        Format::R32G32B32A32Float => wgpu::TextureFormat::Rgba32Float,
        Format::R32G32Float => wgpu::TextureFormat::Rg32Float,
        Format::R32Float => wgpu::TextureFormat::R32Float,
        Format::R32Uint => wgpu::TextureFormat::R32Uint,
        Format::R16Uint => wgpu::TextureFormat::R16Uint,
        Format::D24UnormS8Uint => wgpu::TextureFormat::Depth24PlusStencil8,
        Format::D32Float => wgpu::TextureFormat::Depth32Float,
        other => {
            return Err(DeviceError::new(format!(
                "{other:?} has no wgpu render format"
            )))
        }
    })
}

fn map_blend_factor(factor: BlendFactor) -> wgpu::BlendFactor {
    match factor {
        BlendFactor::Zero => wgpu::BlendFactor::Zero,
        BlendFactor::One => wgpu::BlendFactor::One,
        BlendFactor::SrcColor => wgpu::BlendFactor::Src,
        BlendFactor::InvSrcColor => wgpu::BlendFactor::OneMinusSrc,
        BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
        BlendFactor::InvSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
        BlendFactor::DestAlpha => wgpu::BlendFactor::DstAlpha,
        BlendFactor::InvDestAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
        BlendFactor::DestColor => wgpu::BlendFactor::Dst,
        BlendFactor::InvDestColor => wgpu::BlendFactor::OneMinusDst,
    }
}

fn map_blend_op(op: BlendOp) -> wgpu::BlendOperation {
    match op {
        BlendOp::Add => wgpu::BlendOperation::Add,
        BlendOp::Subtract => wgpu::BlendOperation::Subtract,
        BlendOp::RevSubtract => wgpu::BlendOperation::ReverseSubtract,
        BlendOp::Min => wgpu::BlendOperation::Min,
        BlendOp::Max => wgpu::BlendOperation::Max,
    }
}

fn map_blend(blend: &RenderTargetBlend) -> Option<wgpu::BlendState> {
    blend.blend_enable.then(|| wgpu::BlendState {
        color: wgpu::BlendComponent {
            src_factor: map_blend_factor(blend.src),
            dst_factor: map_blend_factor(blend.dst),
            operation: map_blend_op(blend.op),
        },
        alpha: wgpu::BlendComponent {
            src_factor: map_blend_factor(blend.src_alpha),
            dst_factor: map_blend_factor(blend.dst_alpha),
            operation: map_blend_op(blend.op_alpha),
        },
    })
}

fn map_compare(func: ComparisonFunc) -> wgpu::CompareFunction {
    match func {
        ComparisonFunc::Never => wgpu::CompareFunction::Never,
        ComparisonFunc::Less => wgpu::CompareFunction::Less,
        ComparisonFunc::Equal => wgpu::CompareFunction::Equal,
        ComparisonFunc::LessEqual => wgpu::CompareFunction::LessEqual,
        ComparisonFunc::Greater => wgpu::CompareFunction::Greater,
        ComparisonFunc::NotEqual => wgpu::CompareFunction::NotEqual,
        ComparisonFunc::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
        ComparisonFunc::Always => wgpu::CompareFunction::Always,
    }
}

fn map_stencil_op(op: StencilOp) -> wgpu::StencilOperation {
    match op {
        StencilOp::Keep => wgpu::StencilOperation::Keep,
        StencilOp::Zero => wgpu::StencilOperation::Zero,
        StencilOp::Replace => wgpu::StencilOperation::Replace,
        StencilOp::IncrSat => wgpu::StencilOperation::IncrementClamp,
        StencilOp::DecrSat => wgpu::StencilOperation::DecrementClamp,
        StencilOp::Invert => wgpu::StencilOperation::Invert,
        StencilOp::Incr => wgpu::StencilOperation::IncrementWrap,
        StencilOp::Decr => wgpu::StencilOperation::DecrementWrap,
    }
}

fn map_stencil_face(face: &StencilFace) -> wgpu::StencilFaceState {
    wgpu::StencilFaceState {
        compare: map_compare(face.func),
        fail_op: map_stencil_op(face.fail),
        depth_fail_op: map_stencil_op(face.depth_fail),
        pass_op: map_stencil_op(face.pass),
    }
}

fn map_depth_stencil(
    format: wgpu::TextureFormat,
    state: &DepthStencilState,
    depth_bias: i32,
) -> wgpu::DepthStencilState {
    let stencil = if state.stencil_enable {
        wgpu::StencilState {
            front: map_stencil_face(&state.front),
            back: map_stencil_face(&state.back),
            read_mask: u32::from(state.stencil_read_mask),
            write_mask: u32::from(state.stencil_write_mask),
        }
    } else {
        wgpu::StencilState::default()
    };
    wgpu::DepthStencilState {
        format,
        depth_write_enabled: state.depth_enable && state.depth_write,
        depth_compare: if state.depth_enable {
            map_compare(state.depth_func)
        } else {
            wgpu::CompareFunction::Always
        },
        stencil,
        bias: wgpu::DepthBiasState {
            constant: depth_bias,
            slope_scale: 0.0,
            clamp: 0.0,
        },
    }
}

struct VertexBuffer {
    stride: u64,
    step_mode: wgpu::VertexStepMode,
    attributes: Vec<wgpu::VertexAttribute>,
}

fn vertex_buffers(pipeline: &ResolvedGraphicsPipeline<'_>) -> Result<Vec<VertexBuffer>, DeviceError> {
    let elements = &pipeline.input.elements;
    let offsets = pipeline.input.resolved_offsets();
    let slots = elements
        .iter()
        .map(|element| element.input_slot as usize + 1)
        .max()
        .unwrap_or(0);
    let mut buffers: Vec<VertexBuffer> = (0..slots)
        .map(|_| VertexBuffer {
            stride: 0,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: Vec::new(),
        })
        .collect();

    for (location, (element, offset)) in elements.iter().zip(offsets).enumerate() {
        let size = element.format.byte_size().ok_or_else(|| {
            DeviceError::new(format!("vertex element {} has no fixed size", element.semantic))
        })?;
        let buffer = &mut buffers[element.input_slot as usize];
        buffer.stride = buffer.stride.max(u64::from(offset + size));
        if let InputStepRate::PerInstance(_) = element.step {
            buffer.step_mode = wgpu::VertexStepMode::Instance;
        }
        buffer.attributes.push(wgpu::VertexAttribute {
            format: map_vertex_format(element.format)?,
            offset: u64::from(offset),
            shader_location: location as u32,
        });
    }
    Ok(buffers)
}

impl Device for WgpuDevice {
    type RootSignature = WgpuRootSignature;
    type PipelineState = WgpuPipelineState;
    type DescriptorHeap = WgpuDescriptorHeap;
    type UploadBuffer = WgpuUploadBuffer;

    fn create_root_signature(
        &self,
        _blob: &[u8],
        desc: &RootSignatureDesc,
    ) -> Result<WgpuRootSignature, DeviceError> {
        let mut units = desc
            .parameters
            .iter()
            .map(|parameter| parameter_entries(parameter, self.writable_storage_stages))
            .collect::<Result<Vec<_>, _>>()?;
        if !desc.static_samplers.is_empty() {
            let samplers = desc
                .static_samplers
                .iter()
                .map(|sampler| {
                    Ok(wgpu::BindGroupLayoutEntry {
                        binding: sampler.register,
                        visibility: map_visibility(sampler.visibility)?,
                        ty: wgpu::BindingType::Sampler(if sampler.sampler.comparison.is_some() {
                            wgpu::SamplerBindingType::Comparison
                        } else {
                            wgpu::SamplerBindingType::Filtering
                        }),
                        count: None,
                    })
                })
                .collect::<Result<Vec<_>, DeviceError>>()?;
            units.push(samplers);
        }
        let (groups, mut slots) = pack_groups(units, self.max_bind_groups)?;
        let static_samplers = if desc.static_samplers.is_empty() {
            None
        } else {
            slots.pop()
        };
        if groups.len() < desc.parameters.len() + usize::from(static_samplers.is_some()) {
            debug!(
                parameters = desc.parameters.len(),
                groups = groups.len(),
                "packed root parameters into shared bind groups"
            );
        }

        self.validated(|device| {
            let bind_group_layouts: Vec<_> = groups
                .iter()
                .map(|entries| {
                    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                        label: Some("lumen root parameter"),
                        entries,
                    })
                })
                .collect();
            let refs: Vec<&wgpu::BindGroupLayout> = bind_group_layouts.iter().collect();
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("lumen root signature"),
                bind_group_layouts: &refs,
                push_constant_ranges: &[],
            });
            WgpuRootSignature {
                bind_group_layouts,
                pipeline_layout,
                parameters: slots,
                static_samplers,
            }
        })
    }

    fn create_graphics_pipeline(
        &self,
        root_signature: &WgpuRootSignature,
        resolved: ResolvedGraphicsPipeline<'_>,
    ) -> Result<WgpuPipelineState, DeviceError> {
        let pipeline = resolved.pipeline;
        if pipeline.gs.is_some() || pipeline.hs.is_some() || pipeline.ds.is_some() {
            return Err(DeviceError::new(
                "wgpu has no geometry or tessellation stages",
            ));
        }
        let topology = match pipeline.topology {
            PrimitiveTopologyType::Point => wgpu::PrimitiveTopology::PointList,
            PrimitiveTopologyType::Line => wgpu::PrimitiveTopology::LineList,
            PrimitiveTopologyType::Triangle => wgpu::PrimitiveTopology::TriangleList,
            PrimitiveTopologyType::Patch => {
                return Err(DeviceError::new("wgpu has no patch topology"))
            }
        };

        let vs = self.shader_module(&pipeline.vs)?;
        let ps = pipeline
            .ps
            .as_ref()
            .map(|ps| self.shader_module(ps))
            .transpose()?;

        let buffers = vertex_buffers(&resolved)?;
        let buffer_layouts: Vec<_> = buffers
            .iter()
            .map(|buffer| wgpu::VertexBufferLayout {
                array_stride: buffer.stride,
                step_mode: buffer.step_mode,
                attributes: &buffer.attributes,
            })
            .collect();

        let blend = &pipeline.blend;
        let targets = resolved
            .output
            .render_targets
            .iter()
            .enumerate()
            .map(|(i, format)| {
                let target = if blend.independent_blend {
                    &blend.render_targets[i]
                } else {
                    &blend.render_targets[0]
                };
                Ok(Some(wgpu::ColorTargetState {
                    format: map_texture_format(*format)?,
                    blend: map_blend(target),
                    write_mask: wgpu::ColorWrites::from_bits_truncate(u32::from(
                        target.write_mask.bits(),
                    )),
                }))
            })
            .collect::<Result<Vec<_>, DeviceError>>()?;

        let depth_stencil = match resolved.output.depth_stencil {
            Format::Unknown => None,
            format => Some(map_depth_stencil(
                map_texture_format(format)?,
                &pipeline.depth_stencil,
                pipeline.rasterizer.depth_bias,
            )),
        };

        let rasterizer = &pipeline.rasterizer;
        let primitive = wgpu::PrimitiveState {
            topology,
            strip_index_format: None,
            front_face: if rasterizer.front_counter_clockwise {
                wgpu::FrontFace::Ccw
            } else {
                wgpu::FrontFace::Cw
            },
            cull_mode: match rasterizer.cull_mode {
                CullMode::None => None,
                CullMode::Front => Some(wgpu::Face::Front),
                CullMode::Back => Some(wgpu::Face::Back),
            },
            unclipped_depth: !rasterizer.depth_clip,
            polygon_mode: match rasterizer.fill_mode {
                FillMode::Solid => wgpu::PolygonMode::Fill,
                FillMode::Wireframe => wgpu::PolygonMode::Line,
            },
            conservative: rasterizer.conservative,
        };

        let render = self.validated(|device| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("lumen graphics pipeline"),
                layout: Some(&root_signature.pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &vs,
                    entry_point: VERTEX_ENTRY_POINT,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    buffers: &buffer_layouts,
                },
                fragment: ps.as_ref().map(|module| wgpu::FragmentState {
                    module,
                    entry_point: FRAGMENT_ENTRY_POINT,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    targets: &targets,
                }),
                primitive,
                depth_stencil,
                multisample: wgpu::MultisampleState {
                    count: resolved.output.sample_count,
                    mask: u64::from(pipeline.sample_mask),
                    alpha_to_coverage_enabled: blend.alpha_to_coverage,
                },
                multiview: None,
            })
        })?;
        debug!(state = %resolved.id, "created wgpu render pipeline");
        Ok(WgpuPipelineState::Render(render))
    }

    fn create_compute_pipeline(
        &self,
        root_signature: &WgpuRootSignature,
        pipeline: &ComputePipelineDesc,
    ) -> Result<WgpuPipelineState, DeviceError> {
        let cs = self.shader_module(&pipeline.cs)?;
        let compute = self.validated(|device| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("lumen compute pipeline"),
                layout: Some(&root_signature.pipeline_layout),
                module: &cs,
                entry_point: COMPUTE_ENTRY_POINT,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            })
        })?;
        Ok(WgpuPipelineState::Compute(compute))
    }

    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<WgpuDescriptorHeap, DeviceError> {
        let serial = self.next_heap.fetch_add(1, Ordering::Relaxed);
        Ok(WgpuDescriptorHeap {
            kind,
            cpu_start: CPU_HEAP_BASE + serial * ADDRESS_SPACING,
            gpu_start: shader_visible.then_some(GPU_HEAP_BASE + serial * ADDRESS_SPACING),
            descriptors: vec![Descriptor::None; capacity as usize],
        })
    }

    fn descriptor_increment(&self, kind: DescriptorHeapKind) -> u32 {
        match kind {
            DescriptorHeapKind::Sampler => 16,
            _ => 32,
        }
    }

    fn heap_start(
        &self,
        heap: &WgpuDescriptorHeap,
    ) -> (CpuDescriptorHandle, Option<GpuDescriptorHandle>) {
        (
            CpuDescriptorHandle(heap.cpu_start),
            heap.gpu_start.map(GpuDescriptorHandle),
        )
    }

    fn write_descriptor(&self, heap: &mut WgpuDescriptorHeap, index: u32, descriptor: &Descriptor) {
        if let Some(slot) = heap.descriptors.get_mut(index as usize) {
            *slot = descriptor.clone();
        }
    }

    fn clear_descriptors(&self, heap: &mut WgpuDescriptorHeap, slots: Range<u32>) {
        let end = (slots.end as usize).min(heap.descriptors.len());
        let start = (slots.start as usize).min(end);
        heap.descriptors[start..end].fill(Descriptor::None);
    }

    fn create_upload_buffer(&self, size: u64) -> Result<WgpuUploadBuffer, DeviceError> {
        // Queue writes must cover whole copy-aligned words.
        let padded = size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        let len = usize::try_from(padded)
            .map_err(|_| DeviceError::new(format!("upload buffer of {size} bytes is too large")))?;
        let buffer = self.validated(|device| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("lumen frame ring"),
                size: padded,
                usage: wgpu::BufferUsages::UNIFORM
                    | wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::VERTEX
                    | wgpu::BufferUsages::INDEX
                    | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        })?;
        let serial = self.next_upload.fetch_add(1, Ordering::Relaxed);
        Ok(WgpuUploadBuffer {
            buffer,
            shadow: vec![0; len],
            gpu_address: UPLOAD_BASE + serial * ADDRESS_SPACING,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn unit(bindings: &[u32]) -> Vec<wgpu::BindGroupLayoutEntry> {
        bindings
            .iter()
            .map(|&binding| wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::all(),
                ty: uniform(false),
                count: None,
            })
            .collect()
    }

    #[test]
    fn tail_parameters_share_the_last_group() {
        let (groups, slots) =
            pack_groups(vec![unit(&[0]), unit(&[1]), unit(&[0, 1, 2]), unit(&[0]), unit(&[2, 3])], 4)
                .unwrap();
        assert_eq!(groups.len(), 4);
        let last: Vec<_> = groups[3].iter().map(|entry| entry.binding).collect();
        assert_eq!(last, vec![0, 3, 4]);
        assert_eq!(
            &slots[3..],
            &[
                ParameterSlot { group: 3, binding_base: 0 },
                ParameterSlot { group: 3, binding_base: 1 },
            ][..]
        );
        assert_eq!(slots[2], ParameterSlot { group: 2, binding_base: 0 });
    }

    #[test]
    fn parameters_within_the_limit_keep_their_own_groups() {
        let (groups, slots) = pack_groups(vec![unit(&[0]), unit(&[1])], 4).unwrap();
        assert_eq!(groups.len(), 2);
        assert!(slots.iter().all(|slot| slot.binding_base == 0));
        assert!(pack_groups(vec![unit(&[0])], 0).is_err());
    }

    #[test]
    fn writable_storage_drops_stages_that_cannot_write() {
        let compute_and_fragment = wgpu::ShaderStages::COMPUTE | wgpu::ShaderStages::FRAGMENT;
        assert_eq!(
            binding_stages(wgpu::ShaderStages::all(), &storage(false), compute_and_fragment).unwrap(),
            compute_and_fragment
        );
        assert_eq!(
            binding_stages(wgpu::ShaderStages::all(), &storage(true), compute_and_fragment).unwrap(),
            wgpu::ShaderStages::all()
        );
        assert!(
            binding_stages(wgpu::ShaderStages::VERTEX, &storage(false), compute_and_fragment)
                .is_err()
        );

        let uav = RootParameter::Uav {
            register: 0,
            space: 0,
            visibility: ShaderVisibility::All,
        };
        let entries = parameter_entries(&uav, wgpu::ShaderStages::COMPUTE).unwrap();
        assert_eq!(entries[0].visibility, wgpu::ShaderStages::COMPUTE);
    }
}
