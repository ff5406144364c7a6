mod common;

use std::sync::Arc;

use lumen_gpu::desc::{InputElement, InputLayoutDesc, OutputLayoutDesc, PipelineStateDesc};
use lumen_gpu::format::Format;
use lumen_gpu::{
    ContentPool, GpuError, IdKind, NullDevice, PipelineDescId, PipelineStateId, ResourceBindingTier,
    ResourceContext, ResourceContextConfig, RootSignatureId,
};
use pretty_assertions::assert_eq;

fn mesh_input() -> InputLayoutDesc {
    InputLayoutDesc::new(vec![
        InputElement::per_vertex("POSITION", 0, Format::R32G32B32Float),
        InputElement::per_vertex("NORMAL", 0, Format::R32G32B32Float),
        InputElement::per_vertex("TEXCOORD", 0, Format::R32G32Float),
    ])
}

fn swapchain_output() -> OutputLayoutDesc {
    OutputLayoutDesc::new(vec![Format::B8G8R8A8UnormSrgb], Format::D32Float)
}

#[test]
fn standard_material_state_is_interned_and_materialized_once() {
    common::init_tracing();
    let mut ctx = ResourceContext::new(NullDevice::new(), ResourceContextConfig::default()).unwrap();

    let desc = ctx
        .layouts
        .create_root_signature_desc(ResourceBindingTier::Tier2, 4, 8, 2, 4, &[]);
    let rs = ctx.pool.register_root_signature_desc(&desc).unwrap();
    assert_eq!(rs, RootSignatureId::from_raw(1));

    let again = ctx
        .layouts
        .create_root_signature_desc(ResourceBindingTier::Tier2, 4, 8, 2, 4, &[]);
    assert_eq!(ctx.pool.register_root_signature_desc(&again).unwrap(), rs);

    let pso = ctx
        .pool
        .register_pipeline_state_desc(&common::mesh_pipeline("lit"))
        .unwrap();
    let input = ctx.pool.register_pipeline_input_state_desc(&mesh_input()).unwrap();
    let output = ctx
        .pool
        .register_pipeline_output_state_desc(&swapchain_output())
        .unwrap();
    assert_eq!(pso.get(), 1);
    assert_eq!(input.get(), 1);
    assert_eq!(output.get(), 1);

    let id = PipelineStateId::new(rs, pso, input, output);
    let first = ctx.get_state(id).unwrap();
    let second = ctx.get_state(id).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert!(first.binder().is_some());

    let counts = ctx.device.counts();
    assert_eq!(counts.root_signatures, 1);
    assert_eq!(counts.graphics_pipelines, 1);

    let stats = ctx.stats().pool;
    assert_eq!(stats.graphics_state_misses, 1);
    assert_eq!(stats.graphics_state_hits, 1);
    assert_eq!(ctx.stats().layouts.entries, 1);
}

#[test]
fn output_change_reuses_the_root_signature_object() {
    let device = NullDevice::new();
    let mut pool = ContentPool::new();
    let mut layouts = lumen_gpu::BindingLayoutCache::new();

    let rs = pool
        .register_root_signature_desc(&layouts.create_root_signature_desc(
            ResourceBindingTier::Tier1,
            1,
            2,
            0,
            1,
            &[],
        ))
        .unwrap();
    let pso = pool
        .register_pipeline_state_desc(&common::mesh_pipeline("lit"))
        .unwrap();
    let input = pool.register_pipeline_input_state_desc(&mesh_input()).unwrap();
    let ldr = pool
        .register_pipeline_output_state_desc(&swapchain_output())
        .unwrap();
    let hdr = pool
        .register_pipeline_output_state_desc(&OutputLayoutDesc::new(
            vec![Format::R16G16B16A16Float],
            Format::D32Float,
        ))
        .unwrap();

    let a = pool
        .get_state(&device, PipelineStateId::new(rs, pso, input, ldr))
        .unwrap();
    let b = pool
        .get_state(&device, PipelineStateId::new(rs, pso, input, hdr))
        .unwrap();
    assert!(!Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(a.root_signature(), b.root_signature()));
    assert_eq!(device.counts().root_signatures, 1);
    assert_eq!(device.counts().graphics_pipelines, 2);
}

#[test]
fn last_unregister_evicts_and_ids_are_not_reused() {
    let device = NullDevice::new();
    let mut pool = ContentPool::new();
    let mut layouts = lumen_gpu::BindingLayoutCache::new();
    let rs = pool
        .register_root_signature_desc(&layouts.create_root_signature_desc(
            ResourceBindingTier::Tier2,
            1,
            2,
            0,
            1,
            &[],
        ))
        .unwrap();
    let input = pool
        .register_pipeline_input_state_desc(&mesh_input())
        .unwrap();
    let output = pool
        .register_pipeline_output_state_desc(&swapchain_output())
        .unwrap();

    let desc = common::mesh_pipeline("lit");
    let pso = pool.register_pipeline_state_desc(&desc).unwrap();
    assert_eq!(pool.register_pipeline_state_desc(&desc).unwrap(), pso);
    assert_eq!(pool.register_pipeline_state_desc(&desc).unwrap(), pso);

    let id = PipelineStateId::new(rs, pso, input, output);
    let state = pool.get_state(&device, id).unwrap();

    pool.unregister_pipeline_state_desc(pso).unwrap();
    pool.unregister_pipeline_state_desc(pso).unwrap();
    assert!(Arc::ptr_eq(&state, &pool.get_state(&device, id).unwrap()));
    assert_eq!(pool.stats().graphics_state_evictions, 0);

    pool.unregister_pipeline_state_desc(pso).unwrap();
    assert_eq!(pool.stats().graphics_state_evictions, 1);
    assert_eq!(
        pool.get_state(&device, id).unwrap_err(),
        GpuError::InvalidId {
            kind: IdKind::PipelineDesc,
            id: u32::from(pso.get()),
        }
    );
    assert!(matches!(
        pool.unregister_pipeline_state_desc(pso),
        Err(GpuError::InvalidId { .. })
    ));

    // Same content again gets a fresh id, never the evicted one.
    let reborn = pool.register_pipeline_state_desc(&desc).unwrap();
    assert_eq!(reborn, PipelineDescId::from_raw(pso.get() + 1));
    assert_eq!(device.counts().graphics_pipelines, 1);
}

#[test]
fn device_failures_are_memoized_per_composite() {
    let device = NullDevice::new();
    let mut pool = ContentPool::new();
    let mut layouts = lumen_gpu::BindingLayoutCache::new();
    let rs = pool
        .register_root_signature_desc(&layouts.create_root_signature_desc(
            ResourceBindingTier::Tier2,
            1,
            2,
            0,
            1,
            &[],
        ))
        .unwrap();
    let input = pool.register_pipeline_input_state_desc(&mesh_input()).unwrap();
    let output = pool
        .register_pipeline_output_state_desc(&swapchain_output())
        .unwrap();

    let desc = common::mesh_pipeline("broken");
    let PipelineStateDesc::Graphics(graphics) = &desc else {
        unreachable!()
    };
    device.reject_shader(graphics.ps.as_ref().unwrap());
    let pso = pool.register_pipeline_state_desc(&desc).unwrap();
    let id = PipelineStateId::new(rs, pso, input, output);

    let first = pool.get_state(&device, id).unwrap_err();
    let second = pool.get_state(&device, id).unwrap_err();
    assert!(matches!(first, GpuError::Device(_)));
    assert_eq!(first, second);
    assert_eq!(device.counts().graphics_pipelines, 1);
    assert_eq!(pool.stats().graphics_state_failures, 1);
}
