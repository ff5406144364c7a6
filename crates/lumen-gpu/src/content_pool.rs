//! Content-addressed interning of pipeline descriptions and memoization of native objects.
//!
//! Descriptions are registered by value and get small stable ids. Native root signatures and
//! pipeline states are created lazily from those ids and cached, failures included: a composite
//! key that failed once keeps failing with the same error without calling the device again.
//!
//! Pipeline state lookups are exact on the full composite key. A pipeline state is never shared
//! between two root signatures, even when everything else about it is identical.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use hashbrown::HashMap;
use tracing::{debug, trace, warn};

use crate::binding::{StandardLayout, StandardRootSignature};
use crate::desc::{
    ComputePipelineDesc, GraphicsPipelineDesc, InputLayoutDesc, OutputLayoutDesc,
    PipelineStateDesc, RootSignatureDesc,
};
use crate::device::{Device, ResolvedGraphicsPipeline};
use crate::error::{GpuError, IdKind};
use crate::stats::ContentPoolStats;

macro_rules! interned_id {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u8);

        impl $name {
            pub const KIND: IdKind = $kind;

            /// Wrap a raw id. 0 is representable but never issued.
            pub const fn from_raw(raw: u8) -> Self {
                Self(raw)
            }

            pub const fn get(self) -> u8 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

interned_id!(RootSignatureId, IdKind::RootSignature);
interned_id!(
    /// Id of a graphics or compute pipeline description.
    PipelineDescId,
    IdKind::PipelineDesc
);
interned_id!(InputLayoutId, IdKind::InputLayout);
interned_id!(OutputLayoutId, IdKind::OutputLayout);

/// Composite key of a fully materialized pipeline state.
///
/// Packs the root signature id (bits 0..8), pipeline description id (8..16), input layout id
/// (16..24) and output layout id (24..32).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineStateId(u32);

impl PipelineStateId {
    pub fn new(
        root_signature: RootSignatureId,
        pipeline: PipelineDescId,
        input: InputLayoutId,
        output: OutputLayoutId,
    ) -> Self {
        Self(
            u32::from(root_signature.get())
                | u32::from(pipeline.get()) << 8
                | u32::from(input.get()) << 16
                | u32::from(output.get()) << 24,
        )
    }

    /// Compute pipelines have no input or output layout.
    pub fn compute(root_signature: RootSignatureId, pipeline: PipelineDescId) -> Self {
        Self::new(
            root_signature,
            pipeline,
            InputLayoutId::from_raw(0),
            OutputLayoutId::from_raw(0),
        )
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn root_signature(self) -> RootSignatureId {
        RootSignatureId::from_raw(self.0 as u8)
    }

    pub fn pipeline_desc(self) -> PipelineDescId {
        PipelineDescId::from_raw((self.0 >> 8) as u8)
    }

    pub fn input_layout(self) -> InputLayoutId {
        InputLayoutId::from_raw((self.0 >> 16) as u8)
    }

    pub fn output_layout(self) -> OutputLayoutId {
        OutputLayoutId::from_raw((self.0 >> 24) as u8)
    }
}

impl fmt::Display for PipelineStateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rs{}/pso{}/in{}/out{}",
            self.root_signature(),
            self.pipeline_desc(),
            self.input_layout(),
            self.output_layout()
        )
    }
}

#[derive(Debug)]
struct Interned<K, V> {
    key: K,
    value: V,
    refs: u32,
}

/// Value-keyed table handing out 1-based `u8` ids. Ids are never reused.
#[derive(Debug)]
struct InternTable<K, V> {
    kind: IdKind,
    ids: HashMap<K, u8>,
    /// Indexed by `id - 1`; `None` once an entry has been released.
    entries: Vec<Option<Interned<K, V>>>,
}

impl<K: Hash + Eq + Clone, V> InternTable<K, V> {
    fn new(kind: IdKind) -> Self {
        Self {
            kind,
            ids: HashMap::new(),
            entries: Vec::new(),
        }
    }

    /// Returns the id and whether a new entry was created.
    fn intern(&mut self, key: K, value: impl FnOnce() -> V) -> Result<(u8, bool), GpuError> {
        if let Some(&id) = self.ids.get(&key) {
            if let Some(entry) = self.entries[usize::from(id) - 1].as_mut() {
                entry.refs += 1;
            }
            return Ok((id, false));
        }
        if self.entries.len() >= usize::from(u8::MAX) {
            return Err(GpuError::IdSpaceExhausted {
                kind: self.kind,
                max: u32::from(u8::MAX),
            });
        }
        self.entries.push(Some(Interned {
            key: key.clone(),
            value: value(),
            refs: 1,
        }));
        let id = self.entries.len() as u8;
        self.ids.insert(key, id);
        Ok((id, true))
    }

    fn entry(&self, id: u8) -> Result<&Interned<K, V>, GpuError> {
        id.checked_sub(1)
            .and_then(|index| self.entries.get(usize::from(index)))
            .and_then(Option::as_ref)
            .ok_or(GpuError::InvalidId {
                kind: self.kind,
                id: u32::from(id),
            })
    }

    fn get(&self, id: u8) -> Result<&K, GpuError> {
        self.entry(id).map(|entry| &entry.key)
    }

    fn value(&self, id: u8) -> Result<&V, GpuError> {
        self.entry(id).map(|entry| &entry.value)
    }

    /// Drop one reference; returns `true` when the entry was removed.
    fn release(&mut self, id: u8) -> Result<bool, GpuError> {
        let invalid = GpuError::InvalidId {
            kind: self.kind,
            id: u32::from(id),
        };
        let slot = id
            .checked_sub(1)
            .and_then(|index| self.entries.get_mut(usize::from(index)))
            .ok_or_else(|| invalid.clone())?;
        let entry = slot.as_mut().ok_or_else(|| invalid.clone())?;
        if entry.refs == 0 {
            return Err(invalid);
        }
        entry.refs -= 1;
        if entry.refs > 0 {
            return Ok(false);
        }
        if let Some(entry) = slot.take() {
            self.ids.remove(&entry.key);
        }
        Ok(true)
    }

    fn live(&self) -> usize {
        self.ids.len()
    }
}

/// A materialized root signature.
pub struct RootSignature<D: Device> {
    id: RootSignatureId,
    native: D::RootSignature,
    layout: Option<Arc<StandardLayout>>,
}

impl<D: Device> RootSignature<D> {
    pub fn id(&self) -> RootSignatureId {
        self.id
    }

    pub fn native(&self) -> &D::RootSignature {
        &self.native
    }

    /// Slot convention the root signature was generated from, for standard root signatures.
    pub fn layout(&self) -> Option<&Arc<StandardLayout>> {
        self.layout.as_ref()
    }
}

impl<D: Device> fmt::Debug for RootSignature<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootSignature")
            .field("id", &self.id)
            .field("native", &self.native)
            .field("standard", &self.layout.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    Graphics,
    Compute,
}

/// A materialized pipeline state plus the binder derived from its shaders.
pub struct PipelineState<D: Device> {
    id: PipelineStateId,
    kind: PipelineKind,
    root_signature: Arc<RootSignature<D>>,
    native: D::PipelineState,
    binder: Option<Arc<StandardRootSignature>>,
}

impl<D: Device> PipelineState<D> {
    pub fn id(&self) -> PipelineStateId {
        self.id
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    pub fn root_signature(&self) -> &Arc<RootSignature<D>> {
        &self.root_signature
    }

    pub fn native(&self) -> &D::PipelineState {
        &self.native
    }

    /// Material binder; `None` when the root signature does not follow the standard layout.
    pub fn binder(&self) -> Option<&Arc<StandardRootSignature>> {
        self.binder.as_ref()
    }
}

impl<D: Device> fmt::Debug for PipelineState<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineState")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("native", &self.native)
            .finish_non_exhaustive()
    }
}

type Memo<T> = Result<Arc<T>, GpuError>;

/// Root signatures intern by serialized form plus slot convention. Tier 2 layouts that differ only
/// in SRV count serialize identically (the SRV range is unbounded) but bind differently.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RootSignatureKey {
    blob: Vec<u8>,
    layout: Option<Arc<StandardLayout>>,
}

/// Interns pipeline descriptions and memoizes the native objects built from them.
pub struct ContentPool<D: Device> {
    root_signatures: InternTable<RootSignatureKey, RootSignatureDesc>,
    pipeline_descs: InternTable<PipelineStateDesc, ()>,
    input_layouts: InternTable<InputLayoutDesc, ()>,
    output_layouts: InternTable<OutputLayoutDesc, ()>,

    root_signature_objects: HashMap<RootSignatureId, Memo<RootSignature<D>>>,
    graphics_states: HashMap<PipelineStateId, Memo<PipelineState<D>>>,
    compute_states: HashMap<PipelineStateId, Memo<PipelineState<D>>>,

    stats: ContentPoolStats,
}

impl<D: Device> Default for ContentPool<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Device> fmt::Debug for ContentPool<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentPool")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<D: Device> ContentPool<D> {
    pub fn new() -> Self {
        Self {
            root_signatures: InternTable::new(IdKind::RootSignature),
            pipeline_descs: InternTable::new(IdKind::PipelineDesc),
            input_layouts: InternTable::new(IdKind::InputLayout),
            output_layouts: InternTable::new(IdKind::OutputLayout),
            root_signature_objects: HashMap::new(),
            graphics_states: HashMap::new(),
            compute_states: HashMap::new(),
            stats: ContentPoolStats::default(),
        }
    }

    /// Intern a root signature description by its serialized form and standard layout.
    pub fn register_root_signature_desc(
        &mut self,
        desc: &RootSignatureDesc,
    ) -> Result<RootSignatureId, GpuError> {
        let key = RootSignatureKey {
            blob: desc.serialize(),
            layout: desc.layout.clone(),
        };
        let (id, _) = self.root_signatures.intern(key, || desc.clone())?;
        Ok(RootSignatureId(id))
    }

    /// Intern a pipeline description. Each call takes a reference that
    /// [`Self::unregister_pipeline_state_desc`] gives back.
    pub fn register_pipeline_state_desc(
        &mut self,
        desc: &PipelineStateDesc,
    ) -> Result<PipelineDescId, GpuError> {
        let (id, _) = self.pipeline_descs.intern(desc.clone(), || ())?;
        Ok(PipelineDescId(id))
    }

    /// Drop one reference. The last one removes the description and evicts every pipeline state
    /// built from it, releasing the shader bytecode.
    pub fn unregister_pipeline_state_desc(&mut self, id: PipelineDescId) -> Result<(), GpuError> {
        if !self.pipeline_descs.release(id.0)? {
            return Ok(());
        }

        let before = self.graphics_states.len();
        self.graphics_states
            .retain(|key, _| key.pipeline_desc() != id);
        let graphics = (before - self.graphics_states.len()) as u64;

        let before = self.compute_states.len();
        self.compute_states.retain(|key, _| key.pipeline_desc() != id);
        let compute = (before - self.compute_states.len()) as u64;

        self.stats.graphics_state_evictions += graphics;
        self.stats.compute_state_evictions += compute;
        trace!(
            pipeline_desc = id.get(),
            graphics,
            compute,
            "evicted pipeline states of released description"
        );
        Ok(())
    }

    pub fn register_pipeline_input_state_desc(
        &mut self,
        desc: &InputLayoutDesc,
    ) -> Result<InputLayoutId, GpuError> {
        let (id, _) = self.input_layouts.intern(desc.clone(), || ())?;
        Ok(InputLayoutId(id))
    }

    pub fn register_pipeline_output_state_desc(
        &mut self,
        desc: &OutputLayoutDesc,
    ) -> Result<OutputLayoutId, GpuError> {
        desc.validate()?;
        let (id, _) = self.output_layouts.intern(desc.clone(), || ())?;
        Ok(OutputLayoutId(id))
    }

    pub fn root_signature_desc(&self, id: RootSignatureId) -> Result<&RootSignatureDesc, GpuError> {
        self.root_signatures.value(id.0)
    }

    pub fn pipeline_state_desc(&self, id: PipelineDescId) -> Result<&PipelineStateDesc, GpuError> {
        self.pipeline_descs.get(id.0)
    }

    pub fn input_layout_desc(&self, id: InputLayoutId) -> Result<&InputLayoutDesc, GpuError> {
        self.input_layouts.get(id.0)
    }

    pub fn output_layout_desc(&self, id: OutputLayoutId) -> Result<&OutputLayoutDesc, GpuError> {
        self.output_layouts.get(id.0)
    }

    /// Materialize (or fetch) the native root signature for `id`.
    pub fn get_root_signature(
        &mut self,
        device: &D,
        id: RootSignatureId,
    ) -> Result<Arc<RootSignature<D>>, GpuError> {
        if let Some(memo) = self.root_signature_objects.get(&id) {
            self.stats.root_signature_hits += 1;
            return memo.clone();
        }

        let entry = self.root_signatures.entry(id.0)?;
        self.stats.root_signature_misses += 1;
        let result = match device.create_root_signature(&entry.key.blob, &entry.value) {
            Ok(native) => {
                debug!(
                    root_signature = id.get(),
                    parameters = entry.value.parameters.len(),
                    "created root signature"
                );
                Ok(Arc::new(RootSignature {
                    id,
                    native,
                    layout: entry.value.layout.clone(),
                }))
            }
            Err(err) => {
                self.stats.root_signature_failures += 1;
                warn!(root_signature = id.get(), error = %err, "root signature creation failed");
                Err(GpuError::from(err))
            }
        };
        self.root_signature_objects.insert(id, result.clone());
        result
    }

    /// Materialize (or fetch) the graphics pipeline state for a composite key.
    pub fn get_state(
        &mut self,
        device: &D,
        id: PipelineStateId,
    ) -> Result<Arc<PipelineState<D>>, GpuError> {
        if let Some(memo) = self.graphics_states.get(&id) {
            self.stats.graphics_state_hits += 1;
            return memo.clone();
        }

        let pipeline = match self.pipeline_descs.get(id.pipeline_desc().0)? {
            PipelineStateDesc::Graphics(desc) => desc.clone(),
            PipelineStateDesc::Compute(_) => {
                return Err(GpuError::InvalidArgument(format!(
                    "pipeline description {} is a compute pipeline",
                    id.pipeline_desc()
                )))
            }
        };
        let input = self.input_layouts.get(id.input_layout().0)?.clone();
        let output = self.output_layouts.get(id.output_layout().0)?.clone();
        // Resolve the root signature id up front so a bad id is reported, not memoized.
        self.root_signatures.entry(id.root_signature().0)?;

        self.stats.graphics_state_misses += 1;
        let result = self.build_graphics(device, id, &pipeline, &input, &output);
        if let Err(err) = &result {
            self.stats.graphics_state_failures += 1;
            warn!(state = %id, error = %err, "graphics pipeline state creation failed");
        }
        self.graphics_states.insert(id, result.clone());
        result
    }

    /// Materialize (or fetch) the compute pipeline state for a composite key.
    pub fn get_compute_state(
        &mut self,
        device: &D,
        id: PipelineStateId,
    ) -> Result<Arc<PipelineState<D>>, GpuError> {
        if let Some(memo) = self.compute_states.get(&id) {
            self.stats.compute_state_hits += 1;
            return memo.clone();
        }

        let pipeline = match self.pipeline_descs.get(id.pipeline_desc().0)? {
            PipelineStateDesc::Compute(desc) => desc.clone(),
            PipelineStateDesc::Graphics(_) => {
                return Err(GpuError::InvalidArgument(format!(
                    "pipeline description {} is a graphics pipeline",
                    id.pipeline_desc()
                )))
            }
        };
        self.root_signatures.entry(id.root_signature().0)?;

        self.stats.compute_state_misses += 1;
        let result = self.build_compute(device, id, &pipeline);
        if let Err(err) = &result {
            self.stats.compute_state_failures += 1;
            warn!(state = %id, error = %err, "compute pipeline state creation failed");
        }
        self.compute_states.insert(id, result.clone());
        result
    }

    fn build_graphics(
        &mut self,
        device: &D,
        id: PipelineStateId,
        pipeline: &GraphicsPipelineDesc,
        input: &InputLayoutDesc,
        output: &OutputLayoutDesc,
    ) -> Memo<PipelineState<D>> {
        let root_signature = self.get_root_signature(device, id.root_signature())?;
        let binder = root_signature
            .layout()
            .map(|layout| StandardRootSignature::for_graphics(layout, pipeline).map(Arc::new))
            .transpose()?;
        let native = device.create_graphics_pipeline(
            &root_signature.native,
            ResolvedGraphicsPipeline {
                id,
                pipeline,
                input,
                output,
            },
        )?;
        debug!(state = %id, "created graphics pipeline state");
        Ok(Arc::new(PipelineState {
            id,
            kind: PipelineKind::Graphics,
            root_signature,
            native,
            binder,
        }))
    }

    fn build_compute(
        &mut self,
        device: &D,
        id: PipelineStateId,
        pipeline: &ComputePipelineDesc,
    ) -> Memo<PipelineState<D>> {
        let root_signature = self.get_root_signature(device, id.root_signature())?;
        let binder = root_signature
            .layout()
            .map(|layout| StandardRootSignature::for_compute(layout, pipeline).map(Arc::new))
            .transpose()?;
        let native = device.create_compute_pipeline(&root_signature.native, pipeline)?;
        debug!(state = %id, "created compute pipeline state");
        Ok(Arc::new(PipelineState {
            id,
            kind: PipelineKind::Compute,
            root_signature,
            native,
            binder,
        }))
    }

    /// Drop every materialized object, failures included. Interned ids stay valid.
    pub fn clear(&mut self) {
        self.root_signature_objects.clear();
        self.graphics_states.clear();
        self.compute_states.clear();
    }

    pub fn stats(&self) -> ContentPoolStats {
        ContentPoolStats {
            root_signatures: self.root_signatures.live() as u64,
            pipeline_descs: self.pipeline_descs.live() as u64,
            input_layouts: self.input_layouts.live() as u64,
            output_layouts: self.output_layouts.live() as u64,
            graphics_states: self.graphics_states.len() as u64,
            compute_states: self.compute_states.len() as u64,
            ..self.stats
        }
    }
}
