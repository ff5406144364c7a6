//! Native [`crate::Device`] implementations.

#[cfg(feature = "wgpu")]
mod wgpu_backend;

#[cfg(feature = "wgpu")]
pub use wgpu_backend::{
    ParameterSlot, WgpuDescriptorHeap, WgpuDevice, WgpuPipelineState, WgpuResource, WgpuRootSignature,
    WgpuUploadBuffer,
};
