//! Bounded descriptor heap with deferred, frame-indexed reclamation.
//!
//! Tables are contiguous `(offset, count)` ranges. A released range goes into the trash bin of the
//! frame being recorded and only returns to the free list once the frame driver reports that frame
//! as completed, so the GPU never reads a slot that has been handed to someone else.
//!
//! Reuse is best fit over a free list ordered by `(count, offset)`. Larger blocks are split and the
//! remainder goes back on the list. Adjacent free blocks are not merged.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::descriptor::Descriptor;
use crate::device::{CpuDescriptorHandle, DescriptorHeapKind, Device, GpuDescriptorHandle};
use crate::error::GpuError;
use crate::frame::{FrameSlots, MAX_FRAMES_IN_FLIGHT};
use crate::stats::HeapStats;

static NEXT_HEAP_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TableRange {
    offset: u32,
    count: u32,
}

impl TableRange {
    fn slots(self) -> std::ops::Range<usize> {
        self.offset as usize..(self.offset + self.count) as usize
    }
}

#[derive(Debug)]
struct TableInner {
    heap_id: u32,
    serial: u64,
    range: TableRange,
    revision: AtomicU32,
    recycle: Sender<TableRange>,
}

impl Drop for TableInner {
    fn drop(&mut self) {
        // The heap may already be gone; its slots went with it.
        let _ = self.recycle.send(self.range);
    }
}

/// Shared handle to a contiguous range of heap slots.
///
/// Clones share the range. When the last clone is dropped the range is queued back to its heap,
/// which files it under the frame being recorded.
#[derive(Clone)]
pub struct DescriptorTable(Arc<TableInner>);

impl DescriptorTable {
    /// First slot of the range within the heap.
    pub fn offset(&self) -> u32 {
        self.0.range.offset
    }

    pub fn count(&self) -> u32 {
        self.0.range.count
    }

    /// Heap-unique number; never repeats even when the range is reused.
    pub fn serial(&self) -> u64 {
        self.0.serial
    }

    /// Bumped by every write into the table.
    pub fn revision(&self) -> u32 {
        self.0.revision.load(Ordering::Relaxed)
    }

    /// Process-unique id of the heap the table was allocated from.
    pub fn heap_id(&self) -> u32 {
        self.0.heap_id
    }

    pub fn references(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl fmt::Debug for DescriptorTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorTable")
            .field("heap", &self.0.heap_id)
            .field("serial", &self.0.serial)
            .field("offset", &self.offset())
            .field("count", &self.count())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHeapDesc {
    pub kind: DescriptorHeapKind,
    pub capacity: u32,
    pub shader_visible: bool,
    /// Frames that may be recorded or in flight at once.
    pub frame_slots: usize,
}

impl Default for DescriptorHeapDesc {
    fn default() -> Self {
        Self {
            kind: DescriptorHeapKind::CbvSrvUav,
            capacity: 4096,
            shader_visible: true,
            frame_slots: MAX_FRAMES_IN_FLIGHT,
        }
    }
}

pub struct DescriptorHeap<D: Device> {
    id: u32,
    desc: DescriptorHeapDesc,
    native: D::DescriptorHeap,
    increment: u32,
    cpu_start: CpuDescriptorHandle,
    gpu_start: Option<GpuDescriptorHandle>,

    descriptors: Vec<Descriptor>,
    /// Slots below `next` have been handed out at least once.
    next: u32,
    free: BTreeSet<(u32, u32)>,
    trash: FrameSlots<Vec<TableRange>>,
    recycle_tx: Sender<TableRange>,
    recycle_rx: Receiver<TableRange>,

    next_serial: u64,
    allocated_slots: u32,
    pending_slots: u32,
    allocations: u64,
    allocation_failures: u64,
}

impl<D: Device> fmt::Debug for DescriptorHeap<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorHeap")
            .field("id", &self.id)
            .field("desc", &self.desc)
            .field("native", &self.native)
            .finish_non_exhaustive()
    }
}

impl<D: Device> DescriptorHeap<D> {
    pub fn new(device: &D, desc: DescriptorHeapDesc) -> Result<Self, GpuError> {
        if desc.capacity == 0 {
            return Err(GpuError::InvalidArgument(
                "descriptor heap capacity must be non-zero".into(),
            ));
        }
        if desc.shader_visible && !desc.kind.supports_shader_visible() {
            return Err(GpuError::InvalidArgument(format!(
                "{} heaps cannot be shader visible",
                desc.kind
            )));
        }
        if desc.frame_slots == 0 {
            return Err(GpuError::InvalidArgument(
                "descriptor heap needs at least one frame slot".into(),
            ));
        }

        let native = device.create_descriptor_heap(desc.kind, desc.capacity, desc.shader_visible)?;
        let increment = device.descriptor_increment(desc.kind);
        let (cpu_start, gpu_start) = device.heap_start(&native);
        let (recycle_tx, recycle_rx) = mpsc::channel();
        let id = NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed);
        debug!(
            heap = id,
            kind = %desc.kind,
            capacity = desc.capacity,
            shader_visible = desc.shader_visible,
            "created descriptor heap"
        );

        Ok(Self {
            id,
            desc,
            native,
            increment,
            cpu_start,
            gpu_start: if desc.shader_visible { gpu_start } else { None },
            descriptors: vec![Descriptor::None; desc.capacity as usize],
            next: 0,
            free: BTreeSet::new(),
            trash: FrameSlots::new(desc.frame_slots),
            recycle_tx,
            recycle_rx,
            next_serial: 0,
            allocated_slots: 0,
            pending_slots: 0,
            allocations: 0,
            allocation_failures: 0,
        })
    }

    pub fn kind(&self) -> DescriptorHeapKind {
        self.desc.kind
    }

    pub fn capacity(&self) -> u32 {
        self.desc.capacity
    }

    pub fn is_shader_visible(&self) -> bool {
        self.desc.shader_visible
    }

    pub fn native(&self) -> &D::DescriptorHeap {
        &self.native
    }

    /// Allocate `count` contiguous slots. `None` means the heap is out of room (or `count` is 0);
    /// callers are expected to handle it.
    pub fn get_descriptor_table(&mut self, count: u32) -> Option<DescriptorTable> {
        self.collect_released();
        if count == 0 {
            return None;
        }

        let range = match self.free.range((count, 0)..).next().copied() {
            Some((block_count, block_offset)) => {
                self.free.remove(&(block_count, block_offset));
                if block_count > count {
                    self.free.insert((block_count - count, block_offset + count));
                }
                TableRange {
                    offset: block_offset,
                    count,
                }
            }
            None if self.desc.capacity - self.next >= count => {
                let offset = self.next;
                self.next += count;
                TableRange { offset, count }
            }
            None => {
                self.allocation_failures += 1;
                debug!(
                    heap = self.id,
                    requested = count,
                    watermark = self.next,
                    "descriptor heap exhausted"
                );
                return None;
            }
        };

        self.allocated_slots += count;
        self.allocations += 1;
        self.next_serial += 1;
        Some(DescriptorTable(Arc::new(TableInner {
            heap_id: self.id,
            serial: self.next_serial,
            range,
            revision: AtomicU32::new(0),
            recycle: self.recycle_tx.clone(),
        })))
    }

    /// Release one reference to `table`. The slots are reclaimed after the current frame completes
    /// once no other clone is alive.
    pub fn free_descriptor_table(&mut self, table: DescriptorTable) -> Result<(), GpuError> {
        self.check_table(&table)?;
        drop(table);
        self.collect_released();
        Ok(())
    }

    /// Advance to `current`, returning the ranges of every frame up to `last_completed` to the
    /// free list and clearing their descriptors, both the logical copies and the native slots.
    ///
    /// # Panics
    ///
    /// Panics if the frame sequence is out of order or more frames are outstanding than the heap
    /// has frame slots.
    pub fn update_frame(&mut self, device: &D, last_completed: u64, current: u64) {
        self.collect_released();

        let Self {
            native,
            trash,
            descriptors,
            free,
            pending_slots,
            ..
        } = self;
        let mut reclaimed = 0u32;
        trash.advance(last_completed, current, |_, ranges| {
            for range in ranges {
                descriptors[range.slots()].iter_mut().for_each(Descriptor::clear);
                device.clear_descriptors(native, range.offset..range.offset + range.count);
                free.insert((range.count, range.offset));
                *pending_slots -= range.count;
                reclaimed += range.count;
            }
        });
        if reclaimed > 0 {
            trace!(
                heap = self.id,
                last_completed,
                current,
                reclaimed,
                "reclaimed descriptor slots"
            );
        }
    }

    pub fn set_descriptor(
        &mut self,
        table: &DescriptorTable,
        index: u32,
        descriptor: Descriptor,
    ) -> Result<(), GpuError> {
        let slot = self.slot_index(table, index)?;
        if !self.desc.kind.accepts(descriptor.kind()) {
            return Err(GpuError::InvalidArgument(format!(
                "a {} cannot be stored in a {} heap",
                descriptor.kind(),
                self.desc.kind
            )));
        }
        self.descriptors[slot] = descriptor;
        table.0.revision.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn descriptor(&self, table: &DescriptorTable, index: u32) -> Result<&Descriptor, GpuError> {
        let slot = self.slot_index(table, index)?;
        Ok(&self.descriptors[slot])
    }

    /// Logical contents of every slot of `table`.
    pub fn table_descriptors(&self, table: &DescriptorTable) -> Result<&[Descriptor], GpuError> {
        self.check_table(table)?;
        Ok(&self.descriptors[table.0.range.slots()])
    }

    /// Write every logical descriptor of `table` into the native heap.
    pub fn create_descriptors(&mut self, device: &D, table: &DescriptorTable) -> Result<(), GpuError> {
        self.check_table(table)?;
        let range = table.0.range;
        for (i, descriptor) in self.descriptors[range.slots()].iter().enumerate() {
            device.write_descriptor(&mut self.native, range.offset + i as u32, descriptor);
        }
        Ok(())
    }

    pub fn cpu_handle(&self, table: &DescriptorTable, index: u32) -> Result<CpuDescriptorHandle, GpuError> {
        let slot = self.slot_index(table, index)?;
        Ok(self.cpu_start.offset(slot as u32, self.increment))
    }

    pub fn gpu_handle(&self, table: &DescriptorTable, index: u32) -> Result<GpuDescriptorHandle, GpuError> {
        let slot = self.slot_index(table, index)?;
        let start = self.gpu_start.ok_or_else(|| {
            GpuError::InvalidArgument(format!(
                "heap {} is not shader visible and has no GPU handles",
                self.id
            ))
        })?;
        Ok(start.offset(slot as u32, self.increment))
    }

    pub fn get_descriptor_by_cpu_handle(&self, handle: CpuDescriptorHandle) -> Result<&Descriptor, GpuError> {
        self.lookup(self.cpu_start.0, handle.0)
    }

    pub fn get_descriptor_by_gpu_handle(&self, handle: GpuDescriptorHandle) -> Result<&Descriptor, GpuError> {
        let start = self.gpu_start.ok_or(GpuError::NotFound(handle.0))?;
        self.lookup(start.0, handle.0)
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            capacity: self.desc.capacity,
            allocated_slots: self.allocated_slots,
            watermark: self.next,
            free_slots: self.free.iter().map(|(count, _)| count).sum(),
            free_blocks: self.free.len() as u32,
            pending_slots: self.pending_slots,
            allocations: self.allocations,
            allocation_failures: self.allocation_failures,
        }
    }

    fn lookup(&self, start: u64, handle: u64) -> Result<&Descriptor, GpuError> {
        let not_found = GpuError::NotFound(handle);
        let delta = handle.checked_sub(start).ok_or_else(|| not_found.clone())?;
        let increment = u64::from(self.increment);
        if delta % increment != 0 || delta / increment >= u64::from(self.next) {
            return Err(not_found);
        }
        Ok(&self.descriptors[(delta / increment) as usize])
    }

    fn check_table(&self, table: &DescriptorTable) -> Result<(), GpuError> {
        if table.0.heap_id != self.id {
            return Err(GpuError::InvalidArgument(format!(
                "descriptor table {} belongs to heap {}, not heap {}",
                table.0.serial, table.0.heap_id, self.id
            )));
        }
        Ok(())
    }

    fn slot_index(&self, table: &DescriptorTable, index: u32) -> Result<usize, GpuError> {
        self.check_table(table)?;
        if index >= table.count() {
            return Err(GpuError::IndexOutOfRange {
                index,
                count: table.count(),
            });
        }
        Ok((table.offset() + index) as usize)
    }

    /// File ranges whose last table handle was dropped into the current frame's bin.
    fn collect_released(&mut self) {
        while let Ok(range) = self.recycle_rx.try_recv() {
            self.allocated_slots -= range.count;
            self.pending_slots += range.count;
            self.trash.current_mut().push(range);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::test_resources::texture_2d;
    use crate::descriptor::{DescriptorKind, SamplerDesc, SrvDesc};
    use crate::format::{Format, ViewDimension};
    use crate::null_device::NullDevice;
    use pretty_assertions::assert_eq;

    fn heap(capacity: u32) -> (NullDevice, DescriptorHeap<NullDevice>) {
        let device = NullDevice::new();
        let heap = DescriptorHeap::new(
            &device,
            DescriptorHeapDesc {
                capacity,
                ..DescriptorHeapDesc::default()
            },
        )
        .unwrap();
        (device, heap)
    }

    #[test]
    fn rejects_zero_capacity_and_visible_rtv_heaps() {
        let device = NullDevice::new();
        let zero = DescriptorHeap::new(
            &device,
            DescriptorHeapDesc {
                capacity: 0,
                ..DescriptorHeapDesc::default()
            },
        );
        assert!(matches!(zero, Err(GpuError::InvalidArgument(_))));

        let rtv = DescriptorHeap::new(
            &device,
            DescriptorHeapDesc {
                kind: DescriptorHeapKind::Rtv,
                shader_visible: true,
                ..DescriptorHeapDesc::default()
            },
        );
        assert!(matches!(rtv, Err(GpuError::InvalidArgument(_))));
        assert_eq!(device.counts().descriptor_heaps, 0);
    }

    #[test]
    fn exhaustion_returns_none() {
        let (_device, mut heap) = heap(8);
        let a = heap.get_descriptor_table(6).unwrap();
        assert!(heap.get_descriptor_table(3).is_none());
        assert!(heap.get_descriptor_table(0).is_none());
        let b = heap.get_descriptor_table(2).unwrap();
        assert_eq!((a.offset(), b.offset()), (0, 6));
        assert_eq!(heap.stats().allocation_failures, 1);
    }

    #[test]
    fn dropped_tables_wait_for_their_frame() {
        let (device, mut heap) = heap(4);
        heap.update_frame(&device, 0, 1);
        let table = heap.get_descriptor_table(4).unwrap();
        drop(table);
        assert!(heap.get_descriptor_table(4).is_none());
        assert_eq!(heap.stats().pending_slots, 4);

        heap.update_frame(&device, 0, 2);
        assert!(heap.get_descriptor_table(4).is_none());

        heap.update_frame(&device, 1, 3);
        let reused = heap.get_descriptor_table(4).unwrap();
        assert_eq!(reused.offset(), 0);
        assert_eq!(heap.stats().pending_slots, 0);
    }

    #[test]
    fn clones_keep_the_range_alive() {
        let (device, mut heap) = heap(4);
        heap.update_frame(&device, 0, 1);
        let table = heap.get_descriptor_table(4).unwrap();
        let clone = table.clone();
        heap.free_descriptor_table(table).unwrap();
        heap.update_frame(&device, 1, 2);
        assert_eq!(heap.stats().allocated_slots, 4);
        assert_eq!(clone.references(), 1);
    }

    #[test]
    fn best_fit_splits_and_keeps_remainder() {
        let (device, mut heap) = heap(64);
        heap.update_frame(&device, 0, 1);
        let small = heap.get_descriptor_table(4).unwrap();
        let large = heap.get_descriptor_table(16).unwrap();
        let _tail = heap.get_descriptor_table(44).unwrap();
        let (small_offset, large_offset) = (small.offset(), large.offset());
        heap.free_descriptor_table(small).unwrap();
        heap.free_descriptor_table(large).unwrap();
        heap.update_frame(&device, 1, 2);

        let three = heap.get_descriptor_table(3).unwrap();
        assert_eq!(three.offset(), small_offset);
        let ten = heap.get_descriptor_table(10).unwrap();
        assert_eq!(ten.offset(), large_offset);
        let six = heap.get_descriptor_table(6).unwrap();
        assert_eq!(six.offset(), large_offset + 10);

        let stats = heap.stats();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_slots, 1);
    }

    #[test]
    fn reclaiming_clears_descriptors_and_releases_resources() {
        let (device, mut heap) = heap(4);
        let texture = texture_2d(Format::R8G8B8A8Unorm);
        let table = heap.get_descriptor_table(1).unwrap();
        heap.set_descriptor(
            &table,
            0,
            Descriptor::Srv(SrvDesc::texture(texture.clone(), ViewDimension::Texture2D)),
        )
        .unwrap();
        heap.create_descriptors(&device, &table).unwrap();
        assert_eq!(heap.native().slots[0], DescriptorKind::Srv);
        let handle = heap.cpu_handle(&table, 0).unwrap();
        heap.free_descriptor_table(table).unwrap();
        assert_eq!(std::sync::Arc::strong_count(&texture), 2);

        heap.update_frame(&device, 0, 1);
        assert_eq!(std::sync::Arc::strong_count(&texture), 1);
        assert_eq!(
            heap.get_descriptor_by_cpu_handle(handle).unwrap().kind(),
            DescriptorKind::None
        );
        assert_eq!(heap.native().slots[0], DescriptorKind::None);
        assert_eq!(device.counts().descriptor_writes, 2);
    }

    #[test]
    fn set_descriptor_validates_index_and_kind() {
        let (_device, mut heap) = heap(8);
        let table = heap.get_descriptor_table(2).unwrap();
        assert_eq!(
            heap.set_descriptor(&table, 2, Descriptor::None),
            Err(GpuError::IndexOutOfRange { index: 2, count: 2 })
        );
        assert!(matches!(
            heap.set_descriptor(&table, 0, Descriptor::Sampler(SamplerDesc::default())),
            Err(GpuError::InvalidArgument(_))
        ));
        assert_eq!(table.revision(), 0);
        heap.set_descriptor(&table, 1, Descriptor::None).unwrap();
        assert_eq!(table.revision(), 1);
    }

    #[test]
    fn handle_lookup_is_bounded_by_the_watermark() {
        let (_device, mut heap) = heap(8);
        let table = heap.get_descriptor_table(2).unwrap();
        let gpu = heap.gpu_handle(&table, 1).unwrap();
        assert!(heap.get_descriptor_by_gpu_handle(gpu).is_ok());

        let past_end = GpuDescriptorHandle(gpu.0 + 32);
        assert_eq!(
            heap.get_descriptor_by_gpu_handle(past_end).unwrap_err(),
            GpuError::NotFound(past_end.0)
        );
        let misaligned = CpuDescriptorHandle(heap.cpu_handle(&table, 0).unwrap().0 + 1);
        assert!(matches!(
            heap.get_descriptor_by_cpu_handle(misaligned),
            Err(GpuError::NotFound(_))
        ));
    }

    #[test]
    fn tables_from_other_heaps_are_rejected() {
        let (device, mut a) = heap(4);
        let mut b = DescriptorHeap::new(&device, DescriptorHeapDesc::default()).unwrap();
        let table = a.get_descriptor_table(1).unwrap();
        assert!(matches!(
            b.set_descriptor(&table, 0, Descriptor::None),
            Err(GpuError::InvalidArgument(_))
        ));
        assert!(b.free_descriptor_table(table.clone()).is_err());
        a.create_descriptors(&device, &table).unwrap();
        assert_eq!(device.counts().descriptor_writes, 1);
    }

    #[test]
    #[should_panic(expected = "current frame must increase")]
    fn repeated_frame_is_fatal() {
        let (device, mut heap) = heap(4);
        heap.update_frame(&device, 0, 1);
        heap.update_frame(&device, 0, 1);
    }
}
