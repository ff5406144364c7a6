//! Native device seam.
//!
//! The resource layer never talks to a graphics API directly. Everything it needs from the driver
//! goes through [`Device`]; the native objects it gets back are opaque associated types.

use std::fmt;
use std::ops::Range;

use crate::content_pool::PipelineStateId;
use crate::desc::{
    ComputePipelineDesc, GraphicsPipelineDesc, InputLayoutDesc, OutputLayoutDesc,
    RootSignatureDesc,
};
use crate::descriptor::{Descriptor, DescriptorKind};
use crate::error::DeviceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuDescriptorHandle(pub u64);

impl CpuDescriptorHandle {
    pub fn offset(self, index: u32, increment: u32) -> Self {
        Self(self.0 + u64::from(index) * u64::from(increment))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuDescriptorHandle(pub u64);

impl GpuDescriptorHandle {
    pub fn offset(self, index: u32, increment: u32) -> Self {
        Self(self.0 + u64::from(index) * u64::from(increment))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorHeapKind {
    CbvSrvUav,
    Sampler,
    Rtv,
    Dsv,
}

impl DescriptorHeapKind {
    pub fn supports_shader_visible(self) -> bool {
        matches!(self, DescriptorHeapKind::CbvSrvUav | DescriptorHeapKind::Sampler)
    }

    /// Whether a descriptor of `kind` may be stored in a heap of this kind.
    pub fn accepts(self, kind: DescriptorKind) -> bool {
        match (self, kind) {
            (_, DescriptorKind::None) => true,
            (
                DescriptorHeapKind::CbvSrvUav,
                DescriptorKind::Cbv | DescriptorKind::Srv | DescriptorKind::Uav,
            ) => true,
            (DescriptorHeapKind::Sampler, DescriptorKind::Sampler) => true,
            (DescriptorHeapKind::Rtv, DescriptorKind::Rtv) => true,
            (DescriptorHeapKind::Dsv, DescriptorKind::Dsv) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DescriptorHeapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptorHeapKind::CbvSrvUav => write!(f, "CBV/SRV/UAV"),
            DescriptorHeapKind::Sampler => write!(f, "sampler"),
            DescriptorHeapKind::Rtv => write!(f, "RTV"),
            DescriptorHeapKind::Dsv => write!(f, "DSV"),
        }
    }
}

/// A persistently mapped, CPU-writable and GPU-readable buffer.
pub trait MappedBuffer {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// GPU virtual address of byte 0.
    fn gpu_address(&self) -> u64;

    fn mapped(&self) -> &[u8];

    fn mapped_mut(&mut self) -> &mut [u8];
}

/// Everything a graphics pipeline is built from, after the composite key has been resolved.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedGraphicsPipeline<'a> {
    pub id: PipelineStateId,
    pub pipeline: &'a GraphicsPipelineDesc,
    pub input: &'a InputLayoutDesc,
    pub output: &'a OutputLayoutDesc,
}

/// Native graphics device.
///
/// Creation calls are synchronous. Failures carry the driver's message and are memoized by the
/// caller, so implementations do not need to cache anything themselves.
pub trait Device {
    type RootSignature: fmt::Debug;
    type PipelineState: fmt::Debug;
    type DescriptorHeap: fmt::Debug;
    type UploadBuffer: MappedBuffer + fmt::Debug;

    fn create_root_signature(
        &self,
        blob: &[u8],
        desc: &RootSignatureDesc,
    ) -> Result<Self::RootSignature, DeviceError>;

    fn create_graphics_pipeline(
        &self,
        root_signature: &Self::RootSignature,
        pipeline: ResolvedGraphicsPipeline<'_>,
    ) -> Result<Self::PipelineState, DeviceError>;

    fn create_compute_pipeline(
        &self,
        root_signature: &Self::RootSignature,
        pipeline: &ComputePipelineDesc,
    ) -> Result<Self::PipelineState, DeviceError>;

    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<Self::DescriptorHeap, DeviceError>;

    /// Byte stride between consecutive descriptors of a heap kind.
    fn descriptor_increment(&self, kind: DescriptorHeapKind) -> u32;

    /// Handles of slot 0; the GPU handle is `None` for heaps that are not shader visible.
    fn heap_start(
        &self,
        heap: &Self::DescriptorHeap,
    ) -> (CpuDescriptorHandle, Option<GpuDescriptorHandle>);

    /// Materialize `descriptor` into slot `index` of `heap`. `Descriptor::None` writes a null view.
    fn write_descriptor(&self, heap: &mut Self::DescriptorHeap, index: u32, descriptor: &Descriptor);

    /// Reset `slots` of `heap` to null views. Called when reclaimed slots return to the free list;
    /// afterwards the native heap must not keep any of their resources alive.
    fn clear_descriptors(&self, heap: &mut Self::DescriptorHeap, slots: Range<u32>) {
        for index in slots {
            self.write_descriptor(heap, index, &Descriptor::None);
        }
    }

    fn create_upload_buffer(&self, size: u64) -> Result<Self::UploadBuffer, DeviceError>;
}
