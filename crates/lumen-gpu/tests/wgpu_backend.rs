#![cfg(feature = "wgpu")]

mod common;

use std::any::Any;
use std::sync::Arc;

use lumen_gpu::backend::{ParameterSlot, WgpuDevice, WgpuPipelineState};
use lumen_gpu::desc::{ComputePipelineDesc, PipelineStateDesc};
use lumen_gpu::descriptor::{GpuResource, ResourceDesc, SamplerDesc, SrvDesc, TextureDimension};
use lumen_gpu::device::MappedBuffer;
use lumen_gpu::format::{Format, ViewDimension};
use lumen_gpu::{
    Descriptor, GpuError, PipelineStateId, ResourceBindingTier, ResourceContext,
    ResourceContextConfig, ResourceRef,
};
use pretty_assertions::assert_eq;

const NOOP_COMPUTE: &str = "@compute @workgroup_size(1) fn cs_main() {}";

fn context(test_name: &str) -> Option<ResourceContext<WgpuDevice>> {
    common::init_tracing();
    let device = match pollster::block_on(WgpuDevice::new_headless()) {
        Ok(device) => device,
        Err(err) => {
            common::skip_or_panic(test_name, &err.to_string());
            return None;
        }
    };
    let config = ResourceContextConfig {
        resource_heap_capacity: 128,
        sampler_heap_capacity: 16,
        ring_capacity: 64 * 1024,
        ..ResourceContextConfig::default()
    };
    match ResourceContext::new(device, config) {
        Ok(ctx) => Some(ctx),
        Err(err) => {
            common::skip_or_panic(test_name, &err.to_string());
            None
        }
    }
}

#[derive(Debug)]
struct Texture(ResourceDesc);

impl GpuResource for Texture {
    fn desc(&self) -> &ResourceDesc {
        &self.0
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn compute_desc(source: &str) -> PipelineStateDesc {
    PipelineStateDesc::Compute(ComputePipelineDesc {
        cs: common::shader(source, Vec::new()),
    })
}

#[test]
fn compute_state_materializes_once() {
    let Some(mut ctx) = context("compute_state_materializes_once") else {
        return;
    };
    let tier = ctx.device.binding_tier();
    assert_eq!(tier, ResourceBindingTier::Tier1);

    let rs_desc = ctx.layouts.create_root_signature_desc(tier, 1, 1, 0, 1, &[]);
    let rs = ctx.pool.register_root_signature_desc(&rs_desc).unwrap();
    let pso = ctx
        .pool
        .register_pipeline_state_desc(&compute_desc(NOOP_COMPUTE))
        .unwrap();
    let id = PipelineStateId::compute(rs, pso);

    let first = match ctx.get_compute_state(id) {
        Ok(state) => state,
        Err(err) => {
            common::skip_or_panic(
                "compute_state_materializes_once",
                &format!("compute pipelines unavailable: {err}"),
            );
            return;
        }
    };
    assert!(matches!(first.native(), WgpuPipelineState::Compute(_)));
    let second = ctx.get_compute_state(id).unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    // Root CBVs, the material table and the sampler table each get a bind group.
    assert_eq!(first.root_signature().native().bind_group_layouts().len(), 4);
    assert_eq!(ctx.stats().pool.compute_state_hits, 1);
}

#[test]
fn invalid_wgsl_is_a_memoized_device_error() {
    let Some(mut ctx) = context("invalid_wgsl_is_a_memoized_device_error") else {
        return;
    };
    let rs_desc = ctx
        .layouts
        .create_root_signature_desc(ResourceBindingTier::Tier1, 0, 0, 0, 0, &[]);
    let rs = ctx.pool.register_root_signature_desc(&rs_desc).unwrap();
    let pso = ctx
        .pool
        .register_pipeline_state_desc(&compute_desc("@compute fn cs_main( {"))
        .unwrap();
    let id = PipelineStateId::compute(rs, pso);

    let first = ctx.get_compute_state(id).unwrap_err();
    assert!(matches!(first, GpuError::Device(_)));
    assert_eq!(ctx.get_compute_state(id).unwrap_err(), first);
    assert_eq!(ctx.stats().pool.compute_state_failures, 1);
}

#[test]
fn unbounded_tables_are_rejected() {
    let Some(mut ctx) = context("unbounded_tables_are_rejected") else {
        return;
    };
    let rs_desc = ctx
        .layouts
        .create_root_signature_desc(ResourceBindingTier::Tier2, 1, 4, 0, 1, &[]);
    let rs = ctx.pool.register_root_signature_desc(&rs_desc).unwrap();
    let device = &ctx.device;
    let err = ctx.pool.get_root_signature(device, rs).unwrap_err();
    assert!(err.to_string().contains("unbounded descriptor ranges"));
    assert_eq!(ctx.stats().pool.root_signature_failures, 1);
}

#[test]
fn ring_writes_reach_the_shadow_copy() {
    let Some(mut ctx) = context("ring_writes_reach_the_shadow_copy") else {
        return;
    };
    ctx.begin_frame(0, 1);
    let allocation = ctx.ring.write_slice(&[1u32, 2, 3]).unwrap();
    let start = allocation.offset as usize;
    let bytes = &ctx.ring.buffer().mapped()[start..start + 12];
    assert_eq!(bytes, bytemuck::cast_slice::<u32, u8>(&[1, 2, 3]));
    ctx.ring.buffer().flush(ctx.device.queue());
}

#[test]
fn uav_layouts_fit_the_device_bind_groups() {
    let Some(mut ctx) = context("uav_layouts_fit_the_device_bind_groups") else {
        return;
    };
    // Four root parameters plus the static-sampler group.
    let rs_desc = ctx.layouts.create_root_signature_desc(
        ResourceBindingTier::Tier2,
        1,
        0,
        1,
        1,
        &[SamplerDesc::default()],
    );
    let rs = ctx.pool.register_root_signature_desc(&rs_desc).unwrap();
    let pso = ctx
        .pool
        .register_pipeline_state_desc(&compute_desc(NOOP_COMPUTE))
        .unwrap();

    let device = &ctx.device;
    let root = ctx.pool.get_root_signature(device, rs).unwrap();
    let native = root.native();
    let max_groups = ctx.device.max_bind_groups() as usize;
    assert_eq!(native.bind_group_layouts().len(), 5.min(max_groups));
    assert_eq!(
        native.parameter_slot(2),
        Some(ParameterSlot { group: 2, binding_base: 0 })
    );
    if max_groups < 5 {
        // The static sampler (register 1) follows the sampler table's binding 0.
        assert_eq!(
            native.static_sampler_slot(),
            Some(ParameterSlot { group: 3, binding_base: 1 })
        );
    }

    if let Err(err) = ctx.get_compute_state(PipelineStateId::compute(rs, pso)) {
        common::skip_or_panic(
            "uav_layouts_fit_the_device_bind_groups",
            &format!("compute pipelines unavailable: {err}"),
        );
    }
}

#[test]
fn reclaimed_slots_release_their_resources() {
    let Some(mut ctx) = context("reclaimed_slots_release_their_resources") else {
        return;
    };
    ctx.begin_frame(0, 1);
    let texture: ResourceRef = Arc::new(Texture(ResourceDesc::Texture {
        dimension: TextureDimension::D2,
        format: Format::R8G8B8A8Unorm,
        width: 4,
        height: 4,
        depth_or_array_layers: 1,
        mip_levels: 1,
        sample_count: 1,
    }));

    let table = ctx.resources.get_descriptor_table(1).unwrap();
    let slot = table.offset();
    ctx.resources
        .set_descriptor(
            &table,
            0,
            Descriptor::Srv(SrvDesc::texture(texture.clone(), ViewDimension::Texture2D)),
        )
        .unwrap();
    ctx.resources.create_descriptors(&ctx.device, &table).unwrap();
    assert!(matches!(
        ctx.resources.native().descriptor(slot),
        Some(Descriptor::Srv(_))
    ));
    ctx.resources.free_descriptor_table(table).unwrap();
    // Held by the logical slot and by the native heap until frame 1 completes.
    assert_eq!(Arc::strong_count(&texture), 3);

    ctx.begin_frame(1, 2);
    assert_eq!(Arc::strong_count(&texture), 1);
    assert!(matches!(
        ctx.resources.native().descriptor(slot),
        Some(Descriptor::None)
    ));
}
