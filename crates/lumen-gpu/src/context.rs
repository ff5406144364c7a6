use std::sync::Arc;

use tracing::{debug, trace};

use crate::binding::{
    BindingLayoutCache, MaterialResources, StandardRootSignature, VerificationCache,
};
use crate::content_pool::{ContentPool, PipelineState, PipelineStateId};
use crate::descriptor::SamplerDesc;
use crate::descriptor_heap::{DescriptorHeap, DescriptorHeapDesc, DescriptorTable};
use crate::device::{DescriptorHeapKind, Device};
use crate::error::GpuError;
use crate::frame::MAX_FRAMES_IN_FLIGHT;
use crate::ring::{FrameRingAllocator, FrameRingDesc};
use crate::stats::ResourceStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceContextConfig {
    /// Frames that may be recorded or in flight at once.
    pub frame_slots: usize,
    pub resource_heap_capacity: u32,
    pub sampler_heap_capacity: u32,
    /// Size of the per-frame upload ring in bytes.
    pub ring_capacity: u64,
}

impl Default for ResourceContextConfig {
    fn default() -> Self {
        Self {
            frame_slots: MAX_FRAMES_IN_FLIGHT,
            resource_heap_capacity: 16 * 1024,
            sampler_heap_capacity: 2048,
            ring_capacity: 8 * 1024 * 1024,
        }
    }
}

/// One device's worth of resource-lifecycle state, driven once per frame by the render thread.
///
/// When the device is lost and recreated, native objects from the old device become invalid.
/// [`Self::replace_device`] recreates the heaps and ring and drops materialized pool objects;
/// interned ids stay valid and rematerialize lazily.
#[derive(Debug)]
pub struct ResourceContext<D: Device> {
    pub device: D,
    pub pool: ContentPool<D>,
    pub layouts: BindingLayoutCache,
    pub resources: DescriptorHeap<D>,
    pub samplers: DescriptorHeap<D>,
    pub ring: FrameRingAllocator<D>,

    resource_verification: VerificationCache,
    sampler_verification: VerificationCache,
    config: ResourceContextConfig,
}

impl<D: Device> ResourceContext<D> {
    pub fn new(device: D, config: ResourceContextConfig) -> Result<Self, GpuError> {
        let (resources, samplers, ring) = Self::create_frame_resources(&device, &config)?;
        debug!(
            frame_slots = config.frame_slots,
            resource_heap = config.resource_heap_capacity,
            sampler_heap = config.sampler_heap_capacity,
            ring = config.ring_capacity,
            "created resource context"
        );
        Ok(Self {
            device,
            pool: ContentPool::new(),
            layouts: BindingLayoutCache::new(),
            resources,
            samplers,
            ring,
            resource_verification: VerificationCache::new(),
            sampler_verification: VerificationCache::new(),
            config,
        })
    }

    fn create_frame_resources(
        device: &D,
        config: &ResourceContextConfig,
    ) -> Result<(DescriptorHeap<D>, DescriptorHeap<D>, FrameRingAllocator<D>), GpuError> {
        let resources = DescriptorHeap::new(
            device,
            DescriptorHeapDesc {
                kind: DescriptorHeapKind::CbvSrvUav,
                capacity: config.resource_heap_capacity,
                shader_visible: true,
                frame_slots: config.frame_slots,
            },
        )?;
        let samplers = DescriptorHeap::new(
            device,
            DescriptorHeapDesc {
                kind: DescriptorHeapKind::Sampler,
                capacity: config.sampler_heap_capacity,
                shader_visible: true,
                frame_slots: config.frame_slots,
            },
        )?;
        let ring = FrameRingAllocator::new(
            device,
            FrameRingDesc {
                capacity: config.ring_capacity,
                frame_slots: config.frame_slots,
            },
        )?;
        Ok((resources, samplers, ring))
    }

    pub fn config(&self) -> &ResourceContextConfig {
        &self.config
    }

    /// Advance every frame-scoped component. Call once per frame before recording.
    ///
    /// # Panics
    ///
    /// Panics if the frame sequence is out of order or more frames are outstanding than the
    /// configured frame slots.
    pub fn begin_frame(&mut self, last_completed: u64, current: u64) {
        trace!(last_completed, current, "begin frame");
        self.resources
            .update_frame(&self.device, last_completed, current);
        self.samplers
            .update_frame(&self.device, last_completed, current);
        self.ring.update_frame(last_completed, current);
    }

    /// Swap in a new device (e.g. after device-lost recovery).
    ///
    /// Tables allocated from the old heaps stay valid as handles but belong to no live heap.
    pub fn replace_device(&mut self, device: D) -> Result<(), GpuError> {
        let (resources, samplers, ring) = Self::create_frame_resources(&device, &self.config)?;
        self.device = device;
        self.resources = resources;
        self.samplers = samplers;
        self.ring = ring;
        self.pool.clear();
        self.resource_verification.clear();
        self.sampler_verification.clear();
        debug!("replaced device; materialized objects dropped");
        Ok(())
    }

    pub fn get_state(&mut self, id: PipelineStateId) -> Result<Arc<PipelineState<D>>, GpuError> {
        self.pool.get_state(&self.device, id)
    }

    pub fn get_compute_state(
        &mut self,
        id: PipelineStateId,
    ) -> Result<Arc<PipelineState<D>>, GpuError> {
        self.pool.get_compute_state(&self.device, id)
    }

    /// Populate a material resource table for `state` from the shared resource heap.
    pub fn create_material_resources(
        &mut self,
        state: &PipelineState<D>,
        resources: &MaterialResources,
    ) -> Result<Option<DescriptorTable>, GpuError> {
        binder(state)?.create_material_resources(&self.device, &mut self.resources, resources)
    }

    /// Populate a material sampler table for `state` from the shared sampler heap.
    pub fn create_material_samplers(
        &mut self,
        state: &PipelineState<D>,
        samplers: &[SamplerDesc],
    ) -> Result<Option<DescriptorTable>, GpuError> {
        binder(state)?.create_material_samplers(&self.device, &mut self.samplers, samplers)
    }

    /// Verify `table` against what `state`'s shaders read. Recently verified pairs are skipped.
    pub fn verify_material_resources(
        &mut self,
        state: &PipelineState<D>,
        table: &DescriptorTable,
    ) -> Result<(), GpuError> {
        let binder = binder(state)?;
        let heap = &self.resources;
        self.resource_verification.verify(state.id(), table, || {
            binder.verify_material_resources(heap, table)
        })
    }

    pub fn verify_material_samplers(
        &mut self,
        state: &PipelineState<D>,
        table: &DescriptorTable,
    ) -> Result<(), GpuError> {
        let binder = binder(state)?;
        let heap = &self.samplers;
        self.sampler_verification.verify(state.id(), table, || {
            binder.verify_material_samplers(heap, table)
        })
    }

    pub fn stats(&self) -> ResourceStats {
        let window = self.ring.window();
        ResourceStats {
            frame: window.current_frame(),
            last_completed_frame: window.last_completed_frame(),
            pool: self.pool.stats(),
            resource_heap: self.resources.stats(),
            sampler_heap: self.samplers.stats(),
            ring: self.ring.stats(),
            layouts: self.layouts.stats(),
        }
    }
}

fn binder<D: Device>(state: &PipelineState<D>) -> Result<&StandardRootSignature, GpuError> {
    state.binder().map(|binder| binder.as_ref()).ok_or_else(|| {
        GpuError::InvalidArgument(format!(
            "pipeline state {} does not use a standard root signature",
            state.id()
        ))
    })
}
