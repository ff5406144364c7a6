//! `lumen-gpu` is the resource-lifecycle layer between the renderer and the native graphics API.
//!
//! It provides:
//! - Content-addressed interning of root-signature and pipeline descriptions, with lazily
//!   materialized and memoized native objects (see [`ContentPool`]).
//! - Descriptor heaps with refcounted tables and frame-deferred reuse (see [`DescriptorHeap`]).
//! - A per-frame wraparound upload allocator (see [`FrameRingAllocator`]).
//! - The standard root-signature convention and material table verification (see [`binding`]).
//!
//! Everything is generic over the [`Device`] trait. [`NullDevice`] is a headless implementation
//! for tests and tooling; the `wgpu` feature adds [`backend::WgpuDevice`].

mod context;
mod error;
mod frame;

pub mod backend;
pub mod binding;
pub mod content_pool;
pub mod desc;
pub mod descriptor;
pub mod descriptor_heap;
pub mod device;
pub mod format;
pub mod null_device;
pub mod ring;
pub mod stats;

pub use binding::{BindingLayoutCache, ResourceBindingTier, StandardLayout, StandardRootSignature};
pub use content_pool::{
    ContentPool, InputLayoutId, OutputLayoutId, PipelineDescId, PipelineState, PipelineStateId,
    RootSignature, RootSignatureId,
};
pub use context::{ResourceContext, ResourceContextConfig};
pub use descriptor::{Descriptor, ResourceRef};
pub use descriptor_heap::{DescriptorHeap, DescriptorHeapDesc, DescriptorTable};
pub use device::Device;
pub use error::{DeviceError, GpuError, IdKind, RingBufferError};
pub use frame::{FrameWindow, MAX_FRAMES_IN_FLIGHT};
pub use null_device::NullDevice;
pub use ring::{FrameRingAllocator, FrameRingDesc, RingAllocation};
pub use stats::ResourceStats;
