//! Logical descriptors stored in a [`crate::DescriptorHeap`].
//!
//! A [`Descriptor`] is a tagged value with owned per-variant storage. It keeps a shared reference
//! to the viewed resource, so a resource stays alive for as long as some heap slot still describes
//! it; the reference is released when the slot is reclaimed.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::format::{BufferLayoutId, Format, ViewDimension};

/// Dimensionality of a texture resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureDimension {
    D1,
    D2,
    D3,
}

/// Creation parameters of a GPU resource, as far as view validation needs them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceDesc {
    Buffer {
        size: u64,
        /// Element stride for structured buffers, 0 otherwise.
        stride: u32,
        layout: Option<BufferLayoutId>,
    },
    Texture {
        dimension: TextureDimension,
        format: Format,
        width: u32,
        height: u32,
        depth_or_array_layers: u32,
        mip_levels: u32,
        sample_count: u32,
    },
}

/// A GPU resource created by the device layer.
pub trait GpuResource: fmt::Debug + Send + Sync {
    fn desc(&self) -> &ResourceDesc;

    /// GPU virtual address of the first byte (buffers only).
    fn gpu_address(&self) -> u64 {
        0
    }

    fn as_any(&self) -> &dyn Any;
}

pub type ResourceRef = Arc<dyn GpuResource>;

#[derive(Debug, Clone, Default)]
pub struct CbvDesc {
    pub resource: Option<ResourceRef>,
    pub offset: u64,
    pub size: u32,
    pub layout: Option<BufferLayoutId>,
}

impl CbvDesc {
    pub fn new(resource: ResourceRef, offset: u64, size: u32) -> Self {
        let layout = match resource.desc() {
            ResourceDesc::Buffer { layout, .. } => *layout,
            ResourceDesc::Texture { .. } => None,
        };
        Self {
            resource: Some(resource),
            offset,
            size,
            layout,
        }
    }

    pub fn null() -> Self {
        Self::default()
    }
}

/// Shader resource view. `UavDesc` shares the same shape.
#[derive(Debug, Clone, Default)]
pub struct SrvDesc {
    pub resource: Option<ResourceRef>,
    pub dimension: ViewDimension,
    pub format: Format,
    pub layout: Option<BufferLayoutId>,
    pub first_element: u64,
    pub num_elements: u32,
}

impl SrvDesc {
    /// View over a whole texture, in the texture's own format.
    pub fn texture(resource: ResourceRef, dimension: ViewDimension) -> Self {
        let format = match resource.desc() {
            ResourceDesc::Texture { format, .. } => *format,
            ResourceDesc::Buffer { .. } => Format::Unknown,
        };
        Self {
            resource: Some(resource),
            dimension,
            format,
            layout: None,
            first_element: 0,
            num_elements: 0,
        }
    }

    /// View over a structured buffer; the buffer's layout id is carried along.
    pub fn structured_buffer(resource: ResourceRef, num_elements: u32) -> Self {
        let layout = match resource.desc() {
            ResourceDesc::Buffer { layout, .. } => *layout,
            ResourceDesc::Texture { .. } => None,
        };
        Self {
            resource: Some(resource),
            dimension: ViewDimension::Buffer,
            format: Format::Unknown,
            layout,
            first_element: 0,
            num_elements,
        }
    }

    /// A null view; reads return zero. D3D-style null views still need a dimension.
    pub fn null(dimension: ViewDimension) -> Self {
        Self {
            dimension,
            ..Self::default()
        }
    }
}

pub type UavDesc = SrvDesc;

#[derive(Debug, Clone, Default)]
pub struct RtvDesc {
    pub resource: Option<ResourceRef>,
    pub dimension: ViewDimension,
    pub format: Format,
}

pub type DsvDesc = RtvDesc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Filter {
    Point,
    #[default]
    Linear,
    Anisotropic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressMode {
    #[default]
    Wrap,
    Mirror,
    Clamp,
    Border,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ComparisonFunc {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    #[default]
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    pub filter: Filter,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    pub max_anisotropy: u32,
    /// `Some` for comparison (shadow) samplers.
    pub comparison: Option<ComparisonFunc>,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            filter: Filter::Linear,
            address_u: AddressMode::Wrap,
            address_v: AddressMode::Wrap,
            address_w: AddressMode::Wrap,
            max_anisotropy: 1,
            comparison: None,
        }
    }
}

impl SamplerDesc {
    pub fn comparison(func: ComparisonFunc) -> Self {
        Self {
            address_u: AddressMode::Clamp,
            address_v: AddressMode::Clamp,
            address_w: AddressMode::Clamp,
            comparison: Some(func),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    None,
    Cbv,
    Srv,
    Uav,
    Rtv,
    Dsv,
    Sampler,
}

impl fmt::Display for DescriptorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DescriptorKind::None => "empty slot",
            DescriptorKind::Cbv => "constant buffer view",
            DescriptorKind::Srv => "shader resource view",
            DescriptorKind::Uav => "unordered access view",
            DescriptorKind::Rtv => "render target view",
            DescriptorKind::Dsv => "depth stencil view",
            DescriptorKind::Sampler => "sampler",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default)]
pub enum Descriptor {
    #[default]
    None,
    Cbv(CbvDesc),
    Srv(SrvDesc),
    Uav(UavDesc),
    Rtv(RtvDesc),
    Dsv(DsvDesc),
    Sampler(SamplerDesc),
}

impl Descriptor {
    pub fn kind(&self) -> DescriptorKind {
        match self {
            Descriptor::None => DescriptorKind::None,
            Descriptor::Cbv(_) => DescriptorKind::Cbv,
            Descriptor::Srv(_) => DescriptorKind::Srv,
            Descriptor::Uav(_) => DescriptorKind::Uav,
            Descriptor::Rtv(_) => DescriptorKind::Rtv,
            Descriptor::Dsv(_) => DescriptorKind::Dsv,
            Descriptor::Sampler(_) => DescriptorKind::Sampler,
        }
    }

    pub fn resource(&self) -> Option<&ResourceRef> {
        match self {
            Descriptor::Cbv(v) => v.resource.as_ref(),
            Descriptor::Srv(v) | Descriptor::Uav(v) => v.resource.as_ref(),
            Descriptor::Rtv(v) | Descriptor::Dsv(v) => v.resource.as_ref(),
            Descriptor::None | Descriptor::Sampler(_) => None,
        }
    }

    /// Reset to `None`, dropping the resource reference.
    pub fn clear(&mut self) {
        *self = Descriptor::None;
    }
}

#[cfg(test)]
pub(crate) mod test_resources {
    use super::*;

    #[derive(Debug)]
    pub struct TestResource(pub ResourceDesc);

    impl GpuResource for TestResource {
        fn desc(&self) -> &ResourceDesc {
            &self.0
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    pub fn texture_2d(format: Format) -> ResourceRef {
        Arc::new(TestResource(ResourceDesc::Texture {
            dimension: TextureDimension::D2,
            format,
            width: 64,
            height: 64,
            depth_or_array_layers: 1,
            mip_levels: 1,
            sample_count: 1,
        }))
    }

    pub fn buffer(size: u64, layout: Option<BufferLayoutId>) -> ResourceRef {
        Arc::new(TestResource(ResourceDesc::Buffer {
            size,
            stride: 16,
            layout,
        }))
    }
}
