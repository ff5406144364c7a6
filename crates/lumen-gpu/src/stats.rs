/// Snapshot of content pool counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContentPoolStats {
    pub root_signature_hits: u64,
    pub root_signature_misses: u64,
    pub root_signature_failures: u64,

    pub graphics_state_hits: u64,
    pub graphics_state_misses: u64,
    pub graphics_state_failures: u64,
    pub graphics_state_evictions: u64,

    pub compute_state_hits: u64,
    pub compute_state_misses: u64,
    pub compute_state_failures: u64,
    pub compute_state_evictions: u64,

    // Live interned descriptions.
    pub root_signatures: u64,
    pub pipeline_descs: u64,
    pub input_layouts: u64,
    pub output_layouts: u64,

    // Memoized native objects, failures included.
    pub graphics_states: u64,
    pub compute_states: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub capacity: u32,
    /// Slots owned by live tables.
    pub allocated_slots: u32,
    /// End of the bump-allocated prefix.
    pub watermark: u32,
    pub free_slots: u32,
    pub free_blocks: u32,
    /// Slots freed but waiting for their frame to complete.
    pub pending_slots: u32,
    pub allocations: u64,
    pub allocation_failures: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RingStats {
    pub capacity: u64,
    pub frame_bytes: u64,
    /// Tail bytes skipped by wraparound, over the ring's lifetime.
    pub wasted_bytes: u64,
    pub allocations: u64,
    pub failures: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Everything [`crate::ResourceContext::stats`] reports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceStats {
    pub frame: u64,
    pub last_completed_frame: u64,
    pub pool: ContentPoolStats,
    pub resource_heap: HeapStats,
    pub sampler_heap: HeapStats,
    pub ring: RingStats,
    pub layouts: CacheStats,
}

impl HeapStats {
    fn to_json(self) -> String {
        format!(
            "{{\"capacity\":{},\"allocated_slots\":{},\"watermark\":{},\"free_slots\":{},\"free_blocks\":{},\"pending_slots\":{},\"allocations\":{},\"allocation_failures\":{}}}",
            self.capacity,
            self.allocated_slots,
            self.watermark,
            self.free_slots,
            self.free_blocks,
            self.pending_slots,
            self.allocations,
            self.allocation_failures,
        )
    }
}

impl ResourceStats {
    /// Returns a JSON object as a string.
    pub fn to_json(&self) -> String {
        // Hand-built: this runs on the render thread once per telemetry tick.
        let pool = &self.pool;
        format!(
            "{{\"frame\":{},\"last_completed_frame\":{},\"pool\":{{\"root_signature_hits\":{},\"root_signature_misses\":{},\"root_signature_failures\":{},\"graphics_state_hits\":{},\"graphics_state_misses\":{},\"graphics_state_failures\":{},\"graphics_state_evictions\":{},\"compute_state_hits\":{},\"compute_state_misses\":{},\"compute_state_failures\":{},\"compute_state_evictions\":{},\"root_signatures\":{},\"pipeline_descs\":{},\"input_layouts\":{},\"output_layouts\":{},\"graphics_states\":{},\"compute_states\":{}}},\"resource_heap\":{},\"sampler_heap\":{},\"ring\":{{\"capacity\":{},\"frame_bytes\":{},\"wasted_bytes\":{},\"allocations\":{},\"failures\":{}}},\"layouts\":{{\"hits\":{},\"misses\":{},\"entries\":{}}}}}",
            self.frame,
            self.last_completed_frame,
            pool.root_signature_hits,
            pool.root_signature_misses,
            pool.root_signature_failures,
            pool.graphics_state_hits,
            pool.graphics_state_misses,
            pool.graphics_state_failures,
            pool.graphics_state_evictions,
            pool.compute_state_hits,
            pool.compute_state_misses,
            pool.compute_state_failures,
            pool.compute_state_evictions,
            pool.root_signatures,
            pool.pipeline_descs,
            pool.input_layouts,
            pool.output_layouts,
            pool.graphics_states,
            pool.compute_states,
            self.resource_heap.to_json(),
            self.sampler_heap.to_json(),
            self.ring.capacity,
            self.ring.frame_bytes,
            self.ring.wasted_bytes,
            self.ring.allocations,
            self.ring.failures,
            self.layouts.hits,
            self.layouts.misses,
            self.layouts.entries,
        )
    }
}
