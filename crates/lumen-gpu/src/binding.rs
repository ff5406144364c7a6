//! Standard root-signature convention and material binding.
//!
//! Every standard root signature has the same shape:
//!
//! - parameter 0: per-view constants, root CBV `b0, space1`
//! - parameter 1: per-world constants, root CBV `b1, space1`
//! - next: the material resource table (if the layout has any CBV/SRV/UAV)
//! - next: the material sampler table (if the layout has dynamic samplers)
//!
//! Material registers live in space 0 starting at register 0. On tier 1 hardware the resource
//! table is `[CBV..][SRV..][UAV..]`, all bounded. Tier 2 and up put SRVs last, `[CBV..][UAV..]
//! [SRV..]`, and declare the SRV range unbounded so a material may bind more textures than the
//! layout was created with. Static samplers take the sampler registers after the dynamic ones.

use std::sync::Arc;

use hashbrown::HashMap;
use tracing::debug;

use crate::content_pool::PipelineStateId;
use crate::desc::{
    BindKind, ComputePipelineDesc, DescriptorRange, GraphicsPipelineDesc, RangeKind,
    RootParameter, RootSignatureDesc, RootSignatureFlags, ShaderBinding, ShaderReflection,
    ShaderVisibility, StaticSampler, UNBOUNDED_RANGE,
};
use crate::descriptor::{
    CbvDesc, ComparisonFunc, Descriptor, SamplerDesc, SrvDesc, UavDesc,
};
use crate::descriptor_heap::{DescriptorHeap, DescriptorTable};
use crate::device::Device;
use crate::error::GpuError;
use crate::format::{BufferLayoutId, Format, ViewDimension};
use crate::stats::CacheStats;

pub const STANDARD_REGISTER_SPACE: u32 = 1;
pub const MATERIAL_REGISTER_SPACE: u32 = 0;
pub const PER_VIEW_REGISTER: u32 = 0;
pub const PER_WORLD_REGISTER: u32 = 1;
pub const PER_VIEW_PARAMETER: u32 = 0;
pub const PER_WORLD_PARAMETER: u32 = 1;

/// Highest SRV register count an unbounded material range may reach.
pub const MAX_UNBOUNDED_SRVS: u32 = 1 << 16;

/// Number of `(pipeline state, table)` pairs remembered as verified.
pub const VERIFICATION_CACHE_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceBindingTier {
    Tier1,
    Tier2,
    Tier3,
}

impl ResourceBindingTier {
    pub fn supports_unbounded_ranges(self) -> bool {
        self != ResourceBindingTier::Tier1
    }
}

/// Shape a [`StandardLayout`] is derived from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LayoutKey {
    pub tier: ResourceBindingTier,
    pub cbvs: u32,
    pub srvs: u32,
    pub uavs: u32,
    pub samplers: u32,
    pub static_samplers: Vec<SamplerDesc>,
}

/// Slot assignment of one standard root-signature shape. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StandardLayout {
    pub tier: ResourceBindingTier,
    pub cbvs: u32,
    pub srvs: u32,
    pub uavs: u32,
    pub samplers: u32,
    pub static_samplers: Vec<SamplerDesc>,

    pub resource_table_parameter: Option<u32>,
    pub sampler_table_parameter: Option<u32>,
    /// Offsets of each view kind inside the material resource table.
    pub cbv_offset: u32,
    pub srv_offset: u32,
    pub uav_offset: u32,
    pub unbounded_srvs: bool,
}

impl StandardLayout {
    fn derive(key: &LayoutKey) -> Self {
        let (srv_offset, uav_offset, unbounded_srvs) = if key.tier.supports_unbounded_ranges() {
            (key.cbvs + key.uavs, key.cbvs, key.srvs > 0)
        } else {
            (key.cbvs, key.cbvs + key.srvs, false)
        };

        let mut next_parameter = PER_WORLD_PARAMETER + 1;
        let mut take_parameter = |present: bool| {
            present.then(|| {
                let index = next_parameter;
                next_parameter += 1;
                index
            })
        };
        let resource_table_parameter = take_parameter(key.cbvs + key.srvs + key.uavs > 0);
        let sampler_table_parameter = take_parameter(key.samplers > 0);

        Self {
            tier: key.tier,
            cbvs: key.cbvs,
            srvs: key.srvs,
            uavs: key.uavs,
            samplers: key.samplers,
            static_samplers: key.static_samplers.clone(),
            resource_table_parameter,
            sampler_table_parameter,
            cbv_offset: 0,
            srv_offset,
            uav_offset,
            unbounded_srvs,
        }
    }

    /// Descriptors in a material resource table with exactly the configured counts.
    pub fn resource_table_size(&self) -> u32 {
        self.cbvs + self.srvs + self.uavs
    }

    pub fn static_sampler_base(&self) -> u32 {
        self.samplers
    }

    fn table_offset(&self, kind: BindKind) -> u32 {
        match kind {
            BindKind::ConstantBuffer => self.cbv_offset,
            BindKind::ShaderResource => self.srv_offset,
            BindKind::UnorderedAccess => self.uav_offset,
            BindKind::Sampler => 0,
        }
    }

    fn configured_count(&self, kind: BindKind) -> u32 {
        match kind {
            BindKind::ConstantBuffer => self.cbvs,
            BindKind::ShaderResource => self.srvs,
            BindKind::UnorderedAccess => self.uavs,
            BindKind::Sampler => self.samplers,
        }
    }

    pub fn root_signature_desc(self: &Arc<Self>) -> RootSignatureDesc {
        let mut parameters = vec![
            RootParameter::Cbv {
                register: PER_VIEW_REGISTER,
                space: STANDARD_REGISTER_SPACE,
                visibility: ShaderVisibility::All,
            },
            RootParameter::Cbv {
                register: PER_WORLD_REGISTER,
                space: STANDARD_REGISTER_SPACE,
                visibility: ShaderVisibility::All,
            },
        ];

        if self.resource_table_parameter.is_some() {
            let range = |kind, count, offset_in_table| DescriptorRange {
                kind,
                count,
                base_register: 0,
                space: MATERIAL_REGISTER_SPACE,
                offset_in_table,
            };
            let srv_count = if self.unbounded_srvs {
                UNBOUNDED_RANGE
            } else {
                self.srvs
            };
            let mut ranges = vec![
                range(RangeKind::Cbv, self.cbvs, self.cbv_offset),
                range(RangeKind::Srv, srv_count, self.srv_offset),
                range(RangeKind::Uav, self.uavs, self.uav_offset),
            ];
            ranges.retain(|r| r.count > 0);
            ranges.sort_by_key(|r| r.offset_in_table);
            parameters.push(RootParameter::Table {
                ranges,
                visibility: ShaderVisibility::All,
            });
        }

        if self.sampler_table_parameter.is_some() {
            parameters.push(RootParameter::Table {
                ranges: vec![DescriptorRange {
                    kind: RangeKind::Sampler,
                    count: self.samplers,
                    base_register: 0,
                    space: MATERIAL_REGISTER_SPACE,
                    offset_in_table: 0,
                }],
                visibility: ShaderVisibility::All,
            });
        }

        let static_samplers = self
            .static_samplers
            .iter()
            .zip(self.static_sampler_base()..)
            .map(|(sampler, register)| StaticSampler {
                sampler: *sampler,
                register,
                space: MATERIAL_REGISTER_SPACE,
                visibility: ShaderVisibility::All,
            })
            .collect();

        RootSignatureDesc {
            parameters,
            static_samplers,
            flags: RootSignatureFlags::ALLOW_INPUT_ASSEMBLER_INPUT_LAYOUT,
            layout: Some(Arc::clone(self)),
        }
    }
}

/// Caches one [`StandardLayout`] per shape.
#[derive(Debug, Default)]
pub struct BindingLayoutCache {
    layouts: HashMap<LayoutKey, Arc<StandardLayout>>,
    hits: u64,
    misses: u64,
}

impl BindingLayoutCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layout(&mut self, key: LayoutKey) -> Arc<StandardLayout> {
        if let Some(layout) = self.layouts.get(&key) {
            self.hits += 1;
            return Arc::clone(layout);
        }
        self.misses += 1;
        let layout = Arc::new(StandardLayout::derive(&key));
        debug!(
            tier = ?key.tier,
            cbvs = key.cbvs,
            srvs = key.srvs,
            uavs = key.uavs,
            samplers = key.samplers,
            static_samplers = key.static_samplers.len(),
            "derived standard binding layout"
        );
        self.layouts.insert(key, Arc::clone(&layout));
        layout
    }

    /// Root-signature description for a material shape, sharing the cached layout.
    pub fn create_root_signature_desc(
        &mut self,
        tier: ResourceBindingTier,
        cbvs: u32,
        srvs: u32,
        uavs: u32,
        samplers: u32,
        static_samplers: &[SamplerDesc],
    ) -> RootSignatureDesc {
        self.layout(LayoutKey {
            tier,
            cbvs,
            srvs,
            uavs,
            samplers,
            static_samplers: static_samplers.to_vec(),
        })
        .root_signature_desc()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.layouts.len(),
        }
    }
}

/// A material binding the shaders declare, mapped onto a table slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterialInput {
    pub name: String,
    pub kind: BindKind,
    pub register: u32,
    pub count: u32,
    /// First slot inside the material resource (or sampler) table.
    pub table_slot: u32,
    pub dimension: ViewDimension,
    pub format: Format,
    pub layout: Option<BufferLayoutId>,
    pub min_size: u32,
    pub comparison: bool,
}

impl MaterialInput {
    fn slot_name(&self, element: u32) -> String {
        let kind = match self.kind {
            BindKind::ConstantBuffer => "CBV",
            BindKind::ShaderResource => "SRV",
            BindKind::UnorderedAccess => "UAV",
            BindKind::Sampler => "sampler",
        };
        format!("material {kind} slot {}", self.register + element)
    }
}

/// Binder derived from a standard layout and the bindings a pipeline's shaders declare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandardRootSignature {
    layout: Arc<StandardLayout>,
    resources: Vec<MaterialInput>,
    samplers: Vec<MaterialInput>,
    uses_per_view: bool,
    uses_per_world: bool,
}

impl StandardRootSignature {
    pub fn for_graphics(
        layout: &Arc<StandardLayout>,
        pipeline: &GraphicsPipelineDesc,
    ) -> Result<Self, GpuError> {
        Self::build(layout, pipeline.shaders().map(|shader| shader.reflection()))
    }

    pub fn for_compute(
        layout: &Arc<StandardLayout>,
        pipeline: &ComputePipelineDesc,
    ) -> Result<Self, GpuError> {
        Self::build(layout, std::iter::once(pipeline.cs.reflection()))
    }

    fn build<'a>(
        layout: &Arc<StandardLayout>,
        stages: impl Iterator<Item = &'a ShaderReflection>,
    ) -> Result<Self, GpuError> {
        let mut binder = Self {
            layout: Arc::clone(layout),
            resources: Vec::new(),
            samplers: Vec::new(),
            uses_per_view: false,
            uses_per_world: false,
        };
        for binding in stages.flat_map(|reflection| &reflection.bindings) {
            binder.add(binding)?;
        }
        binder.resources.sort_by_key(|input| input.table_slot);
        binder.samplers.sort_by_key(|input| input.table_slot);
        Ok(binder)
    }

    fn add(&mut self, binding: &ShaderBinding) -> Result<(), GpuError> {
        let mismatch = |reason: String| GpuError::LayoutMismatch {
            shader_input: format!("{} ({})", binding.name, binding.register_name()),
            reason,
        };

        match binding.space {
            STANDARD_REGISTER_SPACE => {
                if binding.kind != BindKind::ConstantBuffer {
                    return Err(mismatch(
                        "only constant buffers live in the standard register space".into(),
                    ));
                }
                match binding.register {
                    PER_VIEW_REGISTER => self.uses_per_view = true,
                    PER_WORLD_REGISTER => self.uses_per_world = true,
                    other => {
                        return Err(mismatch(format!(
                            "standard constant buffer register b{other} is out of range"
                        )))
                    }
                }
                return Ok(());
            }
            MATERIAL_REGISTER_SPACE => {}
            other => return Err(mismatch(format!("register space {other} is not used"))),
        }

        let layout = &self.layout;
        let configured = layout.configured_count(binding.kind);
        let end = binding
            .register
            .checked_add(binding.count)
            .ok_or_else(|| mismatch("register range overflows".into()))?;

        let table_slot = match binding.kind {
            BindKind::Sampler => {
                let static_end = configured + layout.static_samplers.len() as u32;
                if end <= configured {
                    Some(binding.register)
                } else if binding.register >= configured && end <= static_end {
                    // Static samplers are part of the root signature; nothing to bind.
                    None
                } else {
                    return Err(mismatch(format!(
                        "the layout has {configured} dynamic and {} static samplers",
                        layout.static_samplers.len()
                    )));
                }
            }
            BindKind::ShaderResource if layout.unbounded_srvs => {
                if end > MAX_UNBOUNDED_SRVS {
                    return Err(mismatch(format!(
                        "unbounded material SRVs stop at register t{}",
                        MAX_UNBOUNDED_SRVS - 1
                    )));
                }
                Some(slot_in_table(layout, binding.kind, binding.register).ok_or_else(|| {
                    mismatch("register does not fit in the material table".into())
                })?)
            }
            kind => {
                if end > configured {
                    return Err(mismatch(format!(
                        "the layout has {configured} material {} registers",
                        kind.register_prefix()
                    )));
                }
                Some(slot_in_table(layout, kind, binding.register).ok_or_else(|| {
                    mismatch("register does not fit in the material table".into())
                })?)
            }
        };
        let Some(table_slot) = table_slot else {
            return Ok(());
        };

        let list = if binding.kind == BindKind::Sampler {
            &mut self.samplers
        } else {
            &mut self.resources
        };
        // Stages commonly share a binding; the first declaration wins.
        if list
            .iter()
            .any(|input| input.kind == binding.kind && input.register == binding.register)
        {
            return Ok(());
        }
        list.push(MaterialInput {
            name: binding.name.clone(),
            kind: binding.kind,
            register: binding.register,
            count: binding.count,
            table_slot,
            dimension: binding.dimension,
            format: binding.format,
            layout: binding.layout,
            min_size: binding.min_size,
            comparison: binding.comparison,
        });
        Ok(())
    }

    pub fn layout(&self) -> &Arc<StandardLayout> {
        &self.layout
    }

    pub fn resource_inputs(&self) -> &[MaterialInput] {
        &self.resources
    }

    pub fn sampler_inputs(&self) -> &[MaterialInput] {
        &self.samplers
    }

    pub fn uses_per_view(&self) -> bool {
        self.uses_per_view
    }

    pub fn uses_per_world(&self) -> bool {
        self.uses_per_world
    }

    pub fn per_view_parameter(&self) -> u32 {
        PER_VIEW_PARAMETER
    }

    pub fn per_world_parameter(&self) -> u32 {
        PER_WORLD_PARAMETER
    }

    pub fn resource_table_parameter(&self) -> Option<u32> {
        self.layout.resource_table_parameter
    }

    pub fn sampler_table_parameter(&self) -> Option<u32> {
        self.layout.sampler_table_parameter
    }

    fn input_at(&self, kind: BindKind, register: u32) -> Option<&MaterialInput> {
        let list = if kind == BindKind::Sampler {
            &self.samplers
        } else {
            &self.resources
        };
        list.iter().find(|input| {
            input.kind == kind && (input.register..input.register + input.count).contains(&register)
        })
    }

    fn null_view(&self, kind: BindKind, register: u32) -> SrvDesc {
        let dimension = self
            .input_at(kind, register)
            .map(|input| input.dimension)
            .filter(|dimension| *dimension != ViewDimension::Unknown)
            .unwrap_or(ViewDimension::Texture2D);
        SrvDesc::null(dimension)
    }

    /// Allocate and populate a material resource table.
    ///
    /// Slots without a caller-provided view get a null view of the dimension the shaders expect.
    /// `Ok(None)` means the heap is out of room; a table larger than the whole heap is an error.
    pub fn create_material_resources<D: Device>(
        &self,
        device: &D,
        heap: &mut DescriptorHeap<D>,
        resources: &MaterialResources,
    ) -> Result<Option<DescriptorTable>, GpuError> {
        let layout = &self.layout;
        if layout.resource_table_parameter.is_none() {
            return Err(GpuError::InvalidArgument(
                "the binding layout has no material resource table".into(),
            ));
        }
        let too_many = |what: &str, given: usize, max: u32| {
            GpuError::InvalidArgument(format!(
                "{given} material {what}s exceed the layout's {max}"
            ))
        };
        if resources.cbvs.len() > layout.cbvs as usize {
            return Err(too_many("CBV", resources.cbvs.len(), layout.cbvs));
        }
        if resources.uavs.len() > layout.uavs as usize {
            return Err(too_many("UAV", resources.uavs.len(), layout.uavs));
        }
        let srvs = if layout.unbounded_srvs {
            if resources.srvs.len() > MAX_UNBOUNDED_SRVS as usize {
                return Err(too_many("SRV", resources.srvs.len(), MAX_UNBOUNDED_SRVS));
            }
            let mut used = 0;
            for input in self
                .resources
                .iter()
                .filter(|input| input.kind == BindKind::ShaderResource)
            {
                let end = input.register.checked_add(input.count).ok_or_else(|| {
                    GpuError::InvalidArgument(format!(
                        "SRV range of {} overflows the register space",
                        input.name
                    ))
                })?;
                used = used.max(end);
            }
            layout.srvs.max(used).max(resources.srvs.len() as u32)
        } else if resources.srvs.len() > layout.srvs as usize {
            return Err(too_many("SRV", resources.srvs.len(), layout.srvs));
        } else {
            layout.srvs
        };

        let size = layout
            .cbvs
            .checked_add(layout.uavs)
            .and_then(|size| size.checked_add(srvs))
            .filter(|size| *size <= heap.capacity())
            .ok_or_else(|| {
                GpuError::InvalidArgument(format!(
                    "a material table with {srvs} SRVs does not fit in a heap of {} descriptors",
                    heap.capacity()
                ))
            })?;
        let Some(table) = heap.get_descriptor_table(size) else {
            return Ok(None);
        };

        for i in 0..layout.cbvs {
            let view = resources
                .cbvs
                .get(i as usize)
                .cloned()
                .unwrap_or_else(CbvDesc::null);
            heap.set_descriptor(&table, layout.cbv_offset + i, Descriptor::Cbv(view))?;
        }
        for i in 0..srvs {
            let view = resources
                .srvs
                .get(i as usize)
                .cloned()
                .unwrap_or_else(|| self.null_view(BindKind::ShaderResource, i));
            heap.set_descriptor(&table, layout.srv_offset + i, Descriptor::Srv(view))?;
        }
        for i in 0..layout.uavs {
            let view = resources
                .uavs
                .get(i as usize)
                .cloned()
                .unwrap_or_else(|| self.null_view(BindKind::UnorderedAccess, i));
            heap.set_descriptor(&table, layout.uav_offset + i, Descriptor::Uav(view))?;
        }
        heap.create_descriptors(device, &table)?;
        Ok(Some(table))
    }

    /// Allocate and populate a material sampler table. `Ok(None)` means the heap is out of room.
    pub fn create_material_samplers<D: Device>(
        &self,
        device: &D,
        heap: &mut DescriptorHeap<D>,
        samplers: &[SamplerDesc],
    ) -> Result<Option<DescriptorTable>, GpuError> {
        let count = self.layout.samplers;
        if count == 0 {
            return Err(GpuError::InvalidArgument(
                "the binding layout has no material sampler table".into(),
            ));
        }
        if samplers.len() > count as usize {
            return Err(GpuError::InvalidArgument(format!(
                "{} material samplers exceed the layout's {count}",
                samplers.len()
            )));
        }
        let Some(table) = heap.get_descriptor_table(count) else {
            return Ok(None);
        };
        for i in 0..count {
            let sampler = samplers.get(i as usize).copied().unwrap_or_else(|| {
                match self.input_at(BindKind::Sampler, i) {
                    Some(input) if input.comparison => {
                        SamplerDesc::comparison(ComparisonFunc::LessEqual)
                    }
                    _ => SamplerDesc::default(),
                }
            });
            heap.set_descriptor(&table, i, Descriptor::Sampler(sampler))?;
        }
        heap.create_descriptors(device, &table)?;
        Ok(Some(table))
    }

    /// Check every material resource the shaders read against what `table` holds.
    pub fn verify_material_resources<D: Device>(
        &self,
        heap: &DescriptorHeap<D>,
        table: &DescriptorTable,
    ) -> Result<(), GpuError> {
        let descriptors = heap.table_descriptors(table)?;
        for input in &self.resources {
            for element in 0..input.count {
                let slot = input.table_slot + element;
                let fail = |reason: String| GpuError::Verification {
                    slot: input.slot_name(element),
                    shader_input: input.name.clone(),
                    reason,
                };
                let descriptor = descriptors.get(slot as usize).ok_or_else(|| {
                    fail(format!("the table has only {} descriptors", descriptors.len()))
                })?;
                check_resource(input, descriptor).map_err(fail)?;
            }
        }
        Ok(())
    }

    /// Check every dynamic sampler the shaders read against what `table` holds.
    pub fn verify_material_samplers<D: Device>(
        &self,
        heap: &DescriptorHeap<D>,
        table: &DescriptorTable,
    ) -> Result<(), GpuError> {
        let descriptors = heap.table_descriptors(table)?;
        for input in &self.samplers {
            for element in 0..input.count {
                let fail = |reason: String| GpuError::Verification {
                    slot: input.slot_name(element),
                    shader_input: input.name.clone(),
                    reason,
                };
                let sampler = match descriptors.get((input.table_slot + element) as usize) {
                    Some(Descriptor::Sampler(sampler)) => sampler,
                    Some(other) => return Err(fail(format!("expected a sampler, found a {}", other.kind()))),
                    None => {
                        return Err(fail(format!(
                            "the table has only {} descriptors",
                            descriptors.len()
                        )))
                    }
                };
                match (input.comparison, sampler.comparison.is_some()) {
                    (true, false) => return Err(fail("shader expects a comparison sampler".into())),
                    (false, true) => {
                        return Err(fail("comparison sampler bound to a regular sampler input".into()))
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

fn slot_in_table(layout: &StandardLayout, kind: BindKind, register: u32) -> Option<u32> {
    layout.table_offset(kind).checked_add(register)
}

fn check_resource(input: &MaterialInput, descriptor: &Descriptor) -> Result<(), String> {
    match (input.kind, descriptor) {
        (BindKind::ConstantBuffer, Descriptor::Cbv(view)) => {
            if view.resource.is_none() {
                return Ok(());
            }
            if view.size < input.min_size {
                return Err(format!(
                    "constant buffer view covers {} bytes, shader reads {}",
                    view.size, input.min_size
                ));
            }
            check_layout(input.layout, view.layout)
        }
        (BindKind::ShaderResource, Descriptor::Srv(view))
        | (BindKind::UnorderedAccess, Descriptor::Uav(view)) => {
            if input.dimension != ViewDimension::Unknown && view.dimension != input.dimension {
                return Err(format!(
                    "view dimension {:?} does not match {:?}",
                    view.dimension, input.dimension
                ));
            }
            if view.resource.is_none() {
                return Ok(());
            }
            if !view.format.is_compatible_with(input.format) {
                return Err(format!(
                    "view format {:?} is not compatible with {:?}",
                    view.format, input.format
                ));
            }
            check_layout(input.layout, view.layout)
        }
        (_, other) => {
            let expected = match input.kind {
                BindKind::ConstantBuffer => "constant buffer view",
                BindKind::ShaderResource => "shader resource view",
                BindKind::UnorderedAccess => "unordered access view",
                BindKind::Sampler => "sampler",
            };
            Err(format!("expected a {expected}, found a {}", other.kind()))
        }
    }
}

fn check_layout(expected: Option<BufferLayoutId>, bound: Option<BufferLayoutId>) -> Result<(), String> {
    match (expected, bound) {
        (Some(expected), Some(bound)) if expected != bound => Err(format!(
            "buffer layout {} does not match the shader's layout {}",
            bound.0, expected.0
        )),
        (Some(expected), None) => Err(format!(
            "buffer has no layout, shader expects layout {}",
            expected.0
        )),
        _ => Ok(()),
    }
}

/// Views for a material resource table, in register order per kind.
#[derive(Debug, Clone, Default)]
pub struct MaterialResources {
    pub cbvs: Vec<CbvDesc>,
    pub srvs: Vec<SrvDesc>,
    pub uavs: Vec<UavDesc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct VerifiedKey {
    state: PipelineStateId,
    heap: u32,
    serial: u64,
    revision: u32,
}

/// Remembers the last few `(pipeline state, table contents)` pairs that passed verification.
///
/// Any write into a table bumps its revision, so a cached entry never vouches for contents it did
/// not check. Entries are replaced oldest first.
#[derive(Debug, Default)]
pub struct VerificationCache {
    entries: [Option<VerifiedKey>; VERIFICATION_CACHE_SIZE],
    next: usize,
    hits: u64,
    misses: u64,
}

impl VerificationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `check` unless this state/table pair was verified with the same contents recently.
    pub fn verify(
        &mut self,
        state: PipelineStateId,
        table: &DescriptorTable,
        check: impl FnOnce() -> Result<(), GpuError>,
    ) -> Result<(), GpuError> {
        let key = VerifiedKey {
            state,
            heap: table.heap_id(),
            serial: table.serial(),
            revision: table.revision(),
        };
        if self.entries.contains(&Some(key)) {
            self.hits += 1;
            return Ok(());
        }
        self.misses += 1;
        check()?;
        self.entries[self.next] = Some(key);
        self.next = (self.next + 1) % VERIFICATION_CACHE_SIZE;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.entries = Default::default();
        self.next = 0;
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.entries.iter().flatten().count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::test_resources::{buffer, texture_2d};
    use crate::descriptor::AddressMode;
    use crate::descriptor_heap::DescriptorHeapDesc;
    use crate::desc::ShaderBytecode;
    use crate::device::DescriptorHeapKind;
    use crate::null_device::NullDevice;
    use pretty_assertions::assert_eq;

    fn key(tier: ResourceBindingTier) -> LayoutKey {
        LayoutKey {
            tier,
            cbvs: 4,
            srvs: 8,
            uavs: 2,
            samplers: 4,
            static_samplers: Vec::new(),
        }
    }

    fn layout(tier: ResourceBindingTier) -> Arc<StandardLayout> {
        BindingLayoutCache::new().layout(key(tier))
    }

    fn pixel_pipeline(bindings: Vec<ShaderBinding>) -> GraphicsPipelineDesc {
        let vs = ShaderBytecode::new(
            b"vs".to_vec(),
            ShaderReflection::new(vec![
                ShaderBinding::constant_buffer("PerView", PER_VIEW_REGISTER, 64)
                    .in_space(STANDARD_REGISTER_SPACE),
                ShaderBinding::constant_buffer("PerWorld", PER_WORLD_REGISTER, 64)
                    .in_space(STANDARD_REGISTER_SPACE),
            ]),
        );
        let ps = ShaderBytecode::new(b"ps".to_vec(), ShaderReflection::new(bindings));
        GraphicsPipelineDesc::new(vs, Some(ps))
    }

    fn heaps(device: &NullDevice) -> (DescriptorHeap<NullDevice>, DescriptorHeap<NullDevice>) {
        let resources = DescriptorHeap::new(device, DescriptorHeapDesc::default()).unwrap();
        let samplers = DescriptorHeap::new(
            device,
            DescriptorHeapDesc {
                kind: DescriptorHeapKind::Sampler,
                capacity: 64,
                ..DescriptorHeapDesc::default()
            },
        )
        .unwrap();
        (resources, samplers)
    }

    #[test]
    fn tier1_tables_are_bounded_and_srvs_precede_uavs() {
        let layout = layout(ResourceBindingTier::Tier1);
        assert_eq!(
            (layout.cbv_offset, layout.srv_offset, layout.uav_offset),
            (0, 4, 12)
        );
        let desc = layout.root_signature_desc();
        let RootParameter::Table { ranges, .. } = &desc.parameters[2] else {
            panic!("expected the material table at parameter 2");
        };
        let kinds: Vec<_> = ranges.iter().map(|r| (r.kind, r.count)).collect();
        assert_eq!(
            kinds,
            vec![(RangeKind::Cbv, 4), (RangeKind::Srv, 8), (RangeKind::Uav, 2)]
        );
        assert_eq!(desc.parameters.len(), 4);
    }

    #[test]
    fn tier2_tables_end_with_unbounded_srvs() {
        let layout = layout(ResourceBindingTier::Tier2);
        assert!(layout.unbounded_srvs);
        let desc = layout.root_signature_desc();
        let RootParameter::Table { ranges, .. } = &desc.parameters[2] else {
            panic!("expected the material table at parameter 2");
        };
        let last = ranges.last().unwrap();
        assert_eq!((last.kind, last.count, last.offset_in_table), (RangeKind::Srv, UNBOUNDED_RANGE, 6));
    }

    #[test]
    fn static_samplers_follow_dynamic_registers() {
        let mut cache = BindingLayoutCache::new();
        let clamp = SamplerDesc {
            address_u: AddressMode::Clamp,
            ..SamplerDesc::default()
        };
        let desc = cache.create_root_signature_desc(
            ResourceBindingTier::Tier2,
            0,
            0,
            0,
            2,
            &[clamp, SamplerDesc::comparison(ComparisonFunc::Less)],
        );
        let registers: Vec<_> = desc.static_samplers.iter().map(|s| s.register).collect();
        assert_eq!(registers, vec![2, 3]);
        // No resource table, so the sampler table takes parameter 2.
        assert_eq!(desc.layout.as_ref().unwrap().sampler_table_parameter, Some(2));
    }

    #[test]
    fn layouts_are_shared_per_shape() {
        let mut cache = BindingLayoutCache::new();
        let a = cache.layout(key(ResourceBindingTier::Tier2));
        let b = cache.layout(key(ResourceBindingTier::Tier2));
        let c = cache.layout(key(ResourceBindingTier::Tier1));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 2,
                entries: 2
            }
        );
    }

    #[test]
    fn binder_maps_registers_to_table_slots() {
        let layout = layout(ResourceBindingTier::Tier2);
        let pipeline = pixel_pipeline(vec![
            ShaderBinding::constant_buffer("Material", 0, 48),
            ShaderBinding::texture("Albedo", 1, ViewDimension::Texture2D),
            ShaderBinding::rw_buffer("Counters", 1, None),
            ShaderBinding::sampler("Linear", 0, false),
        ]);
        let binder = StandardRootSignature::for_graphics(&layout, &pipeline).unwrap();
        let slots: Vec<_> = binder
            .resource_inputs()
            .iter()
            .map(|input| (input.name.as_str(), input.table_slot))
            .collect();
        assert_eq!(slots, vec![("Material", 0), ("Counters", 5), ("Albedo", 7)]);
        assert!(binder.uses_per_view() && binder.uses_per_world());
        assert_eq!(binder.sampler_table_parameter(), Some(3));
    }

    #[test]
    fn unrepresentable_bindings_are_layout_mismatches() {
        let layout = layout(ResourceBindingTier::Tier1);
        for binding in [
            ShaderBinding::constant_buffer("TooFar", 4, 16),
            ShaderBinding::texture("TooMany", 7, ViewDimension::Texture2D).with_count(2),
            ShaderBinding::constant_buffer("Odd", 0, 16).in_space(5),
            ShaderBinding::texture("Std", 0, ViewDimension::Texture2D).in_space(STANDARD_REGISTER_SPACE),
            ShaderBinding::constant_buffer("PerMaterialStd", 2, 16).in_space(STANDARD_REGISTER_SPACE),
        ] {
            let name = binding.name.clone();
            let err = StandardRootSignature::for_graphics(&layout, &pixel_pipeline(vec![binding]))
                .unwrap_err();
            let GpuError::LayoutMismatch { shader_input, .. } = &err else {
                panic!("expected a layout mismatch for {name}, got {err:?}");
            };
            assert!(shader_input.starts_with(&name));
        }
    }

    #[test]
    fn tier2_accepts_srvs_beyond_the_configured_count() {
        let layout = layout(ResourceBindingTier::Tier2);
        let pipeline = pixel_pipeline(vec![ShaderBinding::texture(
            "Atlas",
            10,
            ViewDimension::Texture2DArray,
        )]);
        let binder = StandardRootSignature::for_graphics(&layout, &pipeline).unwrap();
        let device = NullDevice::new();
        let (mut heap, _) = heaps(&device);
        let table = binder
            .create_material_resources(&device, &mut heap, &MaterialResources::default())
            .unwrap()
            .unwrap();
        assert_eq!(table.count(), 4 + 2 + 11);
        let atlas = heap.descriptor(&table, 6 + 10).unwrap();
        let Descriptor::Srv(view) = atlas else {
            panic!("expected a null SRV, got {atlas:?}");
        };
        assert_eq!(view.dimension, ViewDimension::Texture2DArray);
        binder.verify_material_resources(&heap, &table).unwrap();
    }

    #[test]
    fn huge_registers_are_layout_mismatches() {
        let tier2 = layout(ResourceBindingTier::Tier2);
        for binding in [
            ShaderBinding::texture("Huge", u32::MAX - 2, ViewDimension::Texture2D),
            ShaderBinding::texture("Wrapping", u32::MAX, ViewDimension::Texture2D).with_count(2),
            ShaderBinding::texture("PastLimit", MAX_UNBOUNDED_SRVS, ViewDimension::Texture2D),
        ] {
            let name = binding.name.clone();
            let err = StandardRootSignature::for_graphics(&tier2, &pixel_pipeline(vec![binding]))
                .unwrap_err();
            assert!(
                matches!(err, GpuError::LayoutMismatch { ref shader_input, .. } if shader_input.starts_with(&name)),
                "{name}: {err:?}"
            );
        }

        let tier1 = layout(ResourceBindingTier::Tier1);
        let pipeline = pixel_pipeline(vec![ShaderBinding::rw_buffer("Counters", u32::MAX, None)]);
        assert!(matches!(
            StandardRootSignature::for_graphics(&tier1, &pipeline),
            Err(GpuError::LayoutMismatch { .. })
        ));
    }

    #[test]
    fn material_tables_larger_than_the_heap_are_rejected() {
        let layout = layout(ResourceBindingTier::Tier2);
        let pipeline = pixel_pipeline(vec![ShaderBinding::texture(
            "Last",
            MAX_UNBOUNDED_SRVS - 1,
            ViewDimension::Texture2D,
        )]);
        let binder = StandardRootSignature::for_graphics(&layout, &pipeline).unwrap();
        let device = NullDevice::new();
        let (mut heap, _) = heaps(&device);

        let err = binder
            .create_material_resources(&device, &mut heap, &MaterialResources::default())
            .unwrap_err();
        assert!(matches!(err, GpuError::InvalidArgument(_)));

        let resources = MaterialResources {
            srvs: vec![SrvDesc::null(ViewDimension::Texture2D); MAX_UNBOUNDED_SRVS as usize + 1],
            ..MaterialResources::default()
        };
        assert!(matches!(
            binder.create_material_resources(&device, &mut heap, &resources),
            Err(GpuError::InvalidArgument(_))
        ));
        assert_eq!(heap.stats().allocated_slots, 0);
        assert_eq!(device.counts().descriptor_writes, 0);
    }

    #[test]
    fn verification_names_the_incompatible_slot() {
        let layout = layout(ResourceBindingTier::Tier1);
        let pipeline = pixel_pipeline(vec![
            ShaderBinding::constant_buffer("Material", 0, 128),
            ShaderBinding::texture("Albedo", 2, ViewDimension::Texture2D),
            ShaderBinding::structured_buffer("Lights", 3, BufferLayoutId(9)),
        ]);
        let binder = StandardRootSignature::for_graphics(&layout, &pipeline).unwrap();
        let device = NullDevice::new();
        let (mut heap, _) = heaps(&device);

        let mut resources = MaterialResources::default();
        resources.srvs = vec![
            SrvDesc::null(ViewDimension::Texture2D),
            SrvDesc::null(ViewDimension::Texture2D),
            SrvDesc::texture(texture_2d(Format::R8G8B8A8Unorm), ViewDimension::TextureCube),
        ];
        let table = binder
            .create_material_resources(&device, &mut heap, &resources)
            .unwrap()
            .unwrap();
        assert_eq!(device.counts().descriptor_writes, 14);

        let err = binder.verify_material_resources(&heap, &table).unwrap_err();
        assert_eq!(
            err,
            GpuError::Verification {
                slot: "material SRV slot 2".into(),
                shader_input: "Albedo".into(),
                reason: "view dimension TextureCube does not match Texture2D".into(),
            }
        );

        heap.set_descriptor(
            &table,
            layout.srv_offset + 2,
            Descriptor::Srv(SrvDesc::texture(
                texture_2d(Format::R8G8B8A8UnormSrgb),
                ViewDimension::Texture2D,
            )),
        )
        .unwrap();
        heap.set_descriptor(
            &table,
            layout.srv_offset + 3,
            Descriptor::Srv(SrvDesc::structured_buffer(buffer(1024, Some(BufferLayoutId(4))), 16)),
        )
        .unwrap();
        let err = binder.verify_material_resources(&heap, &table).unwrap_err();
        assert!(matches!(
            err,
            GpuError::Verification { ref shader_input, .. } if shader_input == "Lights"
        ));

        heap.set_descriptor(
            &table,
            layout.srv_offset + 3,
            Descriptor::Srv(SrvDesc::structured_buffer(buffer(1024, Some(BufferLayoutId(9))), 16)),
        )
        .unwrap();
        heap.set_descriptor(
            &table,
            0,
            Descriptor::Cbv(CbvDesc::new(buffer(64, None), 0, 64)),
        )
        .unwrap();
        let err = binder.verify_material_resources(&heap, &table).unwrap_err();
        assert!(err.to_string().contains("covers 64 bytes, shader reads 128"));
    }

    #[test]
    fn sampler_tables_default_to_the_expected_kind() {
        let layout = layout(ResourceBindingTier::Tier2);
        let pipeline = pixel_pipeline(vec![
            ShaderBinding::sampler("Linear", 0, false),
            ShaderBinding::sampler("Shadow", 1, true),
        ]);
        let binder = StandardRootSignature::for_graphics(&layout, &pipeline).unwrap();
        let device = NullDevice::new();
        let (_, mut heap) = heaps(&device);

        let table = binder
            .create_material_samplers(&device, &mut heap, &[])
            .unwrap()
            .unwrap();
        binder.verify_material_samplers(&heap, &table).unwrap();

        heap.set_descriptor(&table, 1, Descriptor::Sampler(SamplerDesc::default()))
            .unwrap();
        let err = binder.verify_material_samplers(&heap, &table).unwrap_err();
        assert!(matches!(
            err,
            GpuError::Verification { ref shader_input, .. } if shader_input == "Shadow"
        ));
    }

    #[test]
    fn verification_cache_tracks_table_revisions() {
        let device = NullDevice::new();
        let (mut heap, _) = heaps(&device);
        let table = heap.get_descriptor_table(1).unwrap();
        let state = PipelineStateId::from_raw(0x0101_0101);
        let mut cache = VerificationCache::new();
        let mut runs = 0;

        cache.verify(state, &table, || { runs += 1; Ok(()) }).unwrap();
        cache.verify(state, &table, || { runs += 1; Ok(()) }).unwrap();
        assert_eq!(runs, 1);

        heap.set_descriptor(&table, 0, Descriptor::None).unwrap();
        cache.verify(state, &table, || { runs += 1; Ok(()) }).unwrap();
        assert_eq!(runs, 2);
    }

    #[test]
    fn verification_cache_evicts_oldest_and_skips_failures() {
        let device = NullDevice::new();
        let (mut heap, _) = heaps(&device);
        let table = heap.get_descriptor_table(1).unwrap();
        let mut cache = VerificationCache::new();

        for raw in 1..=5u32 {
            cache
                .verify(PipelineStateId::from_raw(raw), &table, || Ok(()))
                .unwrap();
        }
        assert_eq!(cache.stats().entries, VERIFICATION_CACHE_SIZE);

        let mut reran = false;
        cache
            .verify(PipelineStateId::from_raw(1), &table, || {
                reran = true;
                Ok(())
            })
            .unwrap();
        assert!(reran);

        let failing = PipelineStateId::from_raw(42);
        let fail = || Err(GpuError::InvalidArgument("bad".into()));
        assert!(cache.verify(failing, &table, fail).is_err());
        assert!(cache.verify(failing, &table, fail).is_err());
    }
}
