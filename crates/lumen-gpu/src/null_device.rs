//! Headless [`Device`] that creates nothing on a GPU.
//!
//! Native objects are plain CPU structs with synthetic handles and addresses. The device counts
//! every creation call so callers can check what was (and was not) re-created, and it can be told
//! to reject particular shaders or all root signatures, or to map short upload buffers, to
//! exercise failure paths.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use hashbrown::HashSet;

use crate::desc::{ComputePipelineDesc, RootSignatureDesc, ShaderBytecode};
use crate::descriptor::{Descriptor, DescriptorKind};
use crate::device::{
    CpuDescriptorHandle, DescriptorHeapKind, Device, GpuDescriptorHandle, MappedBuffer,
    ResolvedGraphicsPipeline,
};
use crate::error::DeviceError;

const CPU_HEAP_BASE: u64 = 0x0001_0000_0000;
const GPU_HEAP_BASE: u64 = 0x0002_0000_0000;
const UPLOAD_BASE: u64 = 0x0004_0000_0000;
const ADDRESS_SPACING: u64 = 0x0100_0000;

/// Creation counts recorded by [`NullDevice`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NullDeviceCounts {
    pub root_signatures: u64,
    pub graphics_pipelines: u64,
    pub compute_pipelines: u64,
    pub descriptor_heaps: u64,
    pub descriptor_writes: u64,
    pub upload_buffers: u64,
}

#[derive(Debug, Default)]
pub struct NullDevice {
    root_signatures: AtomicU64,
    graphics_pipelines: AtomicU64,
    compute_pipelines: AtomicU64,
    descriptor_heaps: AtomicU64,
    descriptor_writes: AtomicU64,
    upload_buffers: AtomicU64,
    reject_root_signatures: AtomicBool,
    upload_buffer_shortfall: AtomicU64,
    rejected_shaders: Mutex<HashSet<[u8; 32]>>,
}

impl NullDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts(&self) -> NullDeviceCounts {
        NullDeviceCounts {
            root_signatures: self.root_signatures.load(Ordering::Relaxed),
            graphics_pipelines: self.graphics_pipelines.load(Ordering::Relaxed),
            compute_pipelines: self.compute_pipelines.load(Ordering::Relaxed),
            descriptor_heaps: self.descriptor_heaps.load(Ordering::Relaxed),
            descriptor_writes: self.descriptor_writes.load(Ordering::Relaxed),
            upload_buffers: self.upload_buffers.load(Ordering::Relaxed),
        }
    }

    /// Make every pipeline that uses `shader` fail to compile.
    pub fn reject_shader(&self, shader: &ShaderBytecode) {
        self.rejected_shaders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(*shader.hash().as_bytes());
    }

    pub fn set_reject_root_signatures(&self, reject: bool) {
        self.reject_root_signatures.store(reject, Ordering::Relaxed);
    }

    /// Map every later upload buffer `bytes` shorter than requested.
    pub fn set_upload_buffer_shortfall(&self, bytes: u64) {
        self.upload_buffer_shortfall.store(bytes, Ordering::Relaxed);
    }

    fn check_shader(&self, shader: &ShaderBytecode) -> Result<(), DeviceError> {
        let rejected = self
            .rejected_shaders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(shader.hash().as_bytes());
        if rejected {
            return Err(DeviceError::new(format!(
                "E_INVALIDARG: shader {} failed validation",
                shader.hash().to_hex()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NullRootSignature {
    pub blob: Vec<u8>,
    pub parameter_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullPipelineState {
    Graphics { serial: u64 },
    Compute { serial: u64 },
}

#[derive(Debug)]
pub struct NullDescriptorHeap {
    pub kind: DescriptorHeapKind,
    pub capacity: u32,
    cpu_start: u64,
    gpu_start: Option<u64>,
    /// Kind of the descriptor last written to each slot.
    pub slots: Vec<DescriptorKind>,
}

#[derive(Debug)]
pub struct NullUploadBuffer {
    bytes: Vec<u8>,
    gpu_address: u64,
}

impl MappedBuffer for NullUploadBuffer {
    fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    fn mapped(&self) -> &[u8] {
        &self.bytes
    }

    fn mapped_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl Device for NullDevice {
    type RootSignature = NullRootSignature;
    type PipelineState = NullPipelineState;
    type DescriptorHeap = NullDescriptorHeap;
    type UploadBuffer = NullUploadBuffer;

    fn create_root_signature(
        &self,
        blob: &[u8],
        desc: &RootSignatureDesc,
    ) -> Result<NullRootSignature, DeviceError> {
        self.root_signatures.fetch_add(1, Ordering::Relaxed);
        if self.reject_root_signatures.load(Ordering::Relaxed) {
            return Err(DeviceError::new(
                "E_FAIL: root signature serialization failed",
            ));
        }
        Ok(NullRootSignature {
            blob: blob.to_vec(),
            parameter_count: desc.parameters.len(),
        })
    }

    fn create_graphics_pipeline(
        &self,
        _root_signature: &NullRootSignature,
        pipeline: ResolvedGraphicsPipeline<'_>,
    ) -> Result<NullPipelineState, DeviceError> {
        let serial = self.graphics_pipelines.fetch_add(1, Ordering::Relaxed);
        for shader in pipeline.pipeline.shaders() {
            self.check_shader(shader)?;
        }
        Ok(NullPipelineState::Graphics { serial })
    }

    fn create_compute_pipeline(
        &self,
        _root_signature: &NullRootSignature,
        pipeline: &ComputePipelineDesc,
    ) -> Result<NullPipelineState, DeviceError> {
        let serial = self.compute_pipelines.fetch_add(1, Ordering::Relaxed);
        self.check_shader(&pipeline.cs)?;
        Ok(NullPipelineState::Compute { serial })
    }

    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<NullDescriptorHeap, DeviceError> {
        let serial = self.descriptor_heaps.fetch_add(1, Ordering::Relaxed);
        let cpu_start = CPU_HEAP_BASE + serial * ADDRESS_SPACING;
        let gpu_start = shader_visible.then(|| GPU_HEAP_BASE + serial * ADDRESS_SPACING);
        Ok(NullDescriptorHeap {
            kind,
            capacity,
            cpu_start,
            gpu_start,
            slots: vec![DescriptorKind::None; capacity as usize],
        })
    }

    fn descriptor_increment(&self, kind: DescriptorHeapKind) -> u32 {
        match kind {
            DescriptorHeapKind::Sampler => 16,
            DescriptorHeapKind::CbvSrvUav | DescriptorHeapKind::Rtv | DescriptorHeapKind::Dsv => 32,
        }
    }

    fn heap_start(
        &self,
        heap: &NullDescriptorHeap,
    ) -> (CpuDescriptorHandle, Option<GpuDescriptorHandle>) {
        (
            CpuDescriptorHandle(heap.cpu_start),
            heap.gpu_start.map(GpuDescriptorHandle),
        )
    }

    fn write_descriptor(&self, heap: &mut NullDescriptorHeap, index: u32, descriptor: &Descriptor) {
        self.descriptor_writes.fetch_add(1, Ordering::Relaxed);
        if let Some(slot) = heap.slots.get_mut(index as usize) {
            *slot = descriptor.kind();
        }
    }

    fn create_upload_buffer(&self, size: u64) -> Result<NullUploadBuffer, DeviceError> {
        let serial = self.upload_buffers.fetch_add(1, Ordering::Relaxed);
        let mapped = size.saturating_sub(self.upload_buffer_shortfall.load(Ordering::Relaxed));
        let len = usize::try_from(mapped)
            .map_err(|_| DeviceError::new(format!("upload buffer of {size} bytes is too large")))?;
        Ok(NullUploadBuffer {
            bytes: vec![0; len],
            gpu_address: UPLOAD_BASE + serial * ADDRESS_SPACING,
        })
    }
}
