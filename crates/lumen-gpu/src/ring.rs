use std::fmt;

use bytemuck::Pod;
use tracing::{debug, trace};

use crate::device::{Device, MappedBuffer};
use crate::error::{GpuError, RingBufferError};
use crate::frame::{FrameSlots, FrameWindow, MAX_FRAMES_IN_FLIGHT};
use crate::stats::RingStats;

/// Placement alignment of constant buffer data.
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRingDesc {
    /// Size of the mapped upload buffer in bytes.
    pub capacity: u64,
    /// Frames that may be recorded or in flight at once.
    pub frame_slots: usize,
}

impl Default for FrameRingDesc {
    fn default() -> Self {
        Self {
            capacity: 8 * 1024 * 1024,
            frame_slots: MAX_FRAMES_IN_FLIGHT,
        }
    }
}

/// Where an allocation landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingAllocation {
    /// Byte offset from the start of the ring buffer.
    pub offset: u64,
    pub gpu_address: u64,
    pub size: u64,
}

/// A fresh allocation plus its CPU-visible bytes.
#[derive(Debug)]
pub struct RingSlice<'a> {
    pub allocation: RingAllocation,
    pub bytes: &'a mut [u8],
}

/// Per-frame wraparound allocator over one persistently mapped upload buffer.
///
/// Allocation advances a monotonically increasing virtual cursor; the physical offset is the
/// cursor modulo the capacity. Each frame records the cursor it started at, and no allocation may
/// run past the start of the oldest frame that is still recorded or in flight, so bytes the GPU
/// may read are never overwritten. A request that does not fit before the end of the buffer skips
/// the tail and starts again at offset 0.
///
/// Single writer: call [`Self::update_frame`] exactly once per frame, before allocating.
pub struct FrameRingAllocator<D: Device> {
    buffer: D::UploadBuffer,
    capacity: u64,
    cursor: u64,
    frame_marks: FrameSlots<Option<u64>>,
    stats: RingStats,
}

impl<D: Device> fmt::Debug for FrameRingAllocator<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameRingAllocator")
            .field("capacity", &self.capacity)
            .field("cursor", &self.cursor)
            .field("window", self.frame_marks.window())
            .finish_non_exhaustive()
    }
}

impl<D: Device> FrameRingAllocator<D> {
    pub fn new(device: &D, desc: FrameRingDesc) -> Result<Self, GpuError> {
        if desc.capacity == 0 {
            return Err(GpuError::InvalidArgument(
                "frame ring capacity must be non-zero".into(),
            ));
        }
        if desc.frame_slots == 0 {
            return Err(GpuError::InvalidArgument(
                "frame ring needs at least one frame slot".into(),
            ));
        }
        let buffer = device.create_upload_buffer(desc.capacity)?;
        let mapped = buffer.mapped().len() as u64;
        if mapped < desc.capacity {
            return Err(GpuError::InvalidArgument(format!(
                "upload buffer maps {mapped} of the {} ring bytes",
                desc.capacity
            )));
        }
        debug!(capacity = desc.capacity, "created frame ring");
        Ok(Self {
            buffer,
            capacity: desc.capacity,
            cursor: 0,
            frame_marks: FrameSlots::new(desc.frame_slots),
            stats: RingStats {
                capacity: desc.capacity,
                ..RingStats::default()
            },
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn buffer(&self) -> &D::UploadBuffer {
        &self.buffer
    }

    pub fn window(&self) -> &FrameWindow {
        self.frame_marks.window()
    }

    /// Retire completed frames and start recording `current` at the present cursor.
    ///
    /// # Panics
    ///
    /// Panics if the frame sequence is out of order or more frames are outstanding than the ring
    /// has frame slots.
    pub fn update_frame(&mut self, last_completed: u64, current: u64) {
        self.frame_marks
            .advance(last_completed, current, |_, _| {});
        *self.frame_marks.current_mut() = Some(self.cursor);
        trace!(
            last_completed,
            current,
            frame_bytes = self.stats.frame_bytes,
            "frame ring advanced"
        );
        self.stats.frame_bytes = 0;
    }

    /// Virtual cursor the oldest live frame started at; nothing may be written past it plus one
    /// capacity.
    fn boundary(&self) -> u64 {
        self.frame_marks
            .in_flight()
            .find_map(|(_, mark)| *mark)
            .unwrap_or(0)
    }

    fn reserve(&mut self, size: u64, alignment: u64) -> Result<RingAllocation, RingBufferError> {
        if size == 0 {
            return Err(RingBufferError::InvalidRequest("size must be non-zero"));
        }
        if size > self.capacity {
            return Err(RingBufferError::InvalidRequest(
                "size exceeds the ring capacity",
            ));
        }
        if !alignment.is_power_of_two() {
            return Err(RingBufferError::InvalidRequest(
                "alignment must be a power of two",
            ));
        }

        let physical = self.cursor % self.capacity;
        let (start, wasted) = match physical.checked_next_multiple_of(alignment) {
            Some(aligned) if aligned.checked_add(size).is_some_and(|end| end <= self.capacity) => {
                (self.cursor + (aligned - physical), 0)
            }
            // Offset 0 satisfies any alignment.
            _ => {
                let tail = self.capacity - physical;
                (self.cursor + tail, tail)
            }
        };

        let limit = self.boundary() + self.capacity;
        let end = start + size;
        if end > limit {
            self.stats.failures += 1;
            return Err(RingBufferError::InsufficientSpace {
                requested: size,
                alignment,
                available: limit.saturating_sub(self.cursor),
            });
        }

        self.stats.frame_bytes += end - self.cursor;
        self.stats.wasted_bytes += wasted;
        self.cursor = end;
        self.stats.allocations += 1;

        let offset = start % self.capacity;
        Ok(RingAllocation {
            offset,
            gpu_address: self.buffer.gpu_address() + offset,
            size,
        })
    }

    /// Reserve `size` bytes at `alignment` (a power of two) and return them for writing.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Result<RingSlice<'_>, RingBufferError> {
        let allocation = self.reserve(size, alignment)?;
        let range = allocation.offset as usize..(allocation.offset + allocation.size) as usize;
        Ok(RingSlice {
            allocation,
            bytes: &mut self.buffer.mapped_mut()[range],
        })
    }

    pub fn write_bytes(&mut self, bytes: &[u8], alignment: u64) -> Result<RingAllocation, RingBufferError> {
        let slice = self.allocate(bytes.len() as u64, alignment)?;
        slice.bytes.copy_from_slice(bytes);
        Ok(slice.allocation)
    }

    /// Size reserved by [`Self::write_pod`] for a `T`.
    pub fn constant_buffer_size<T: Pod>() -> u64 {
        (std::mem::size_of::<T>() as u64)
            .next_multiple_of(CONSTANT_BUFFER_ALIGNMENT)
            .max(CONSTANT_BUFFER_ALIGNMENT)
    }

    /// Upload one constant buffer value, zero-padded to the constant buffer alignment.
    pub fn write_pod<T: Pod>(&mut self, value: &T) -> Result<RingAllocation, RingBufferError> {
        let bytes = bytemuck::bytes_of(value);
        let size = Self::constant_buffer_size::<T>();
        let slice = self.allocate(size, CONSTANT_BUFFER_ALIGNMENT)?;
        let (data, padding) = slice.bytes.split_at_mut(bytes.len());
        data.copy_from_slice(bytes);
        padding.fill(0);
        Ok(slice.allocation)
    }

    /// Upload a POD slice (vertex or index data).
    pub fn write_slice<T: Pod>(&mut self, data: &[T]) -> Result<RingAllocation, RingBufferError> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let alignment = (std::mem::align_of::<T>() as u64).max(4);
        self.write_bytes(bytes, alignment)
    }

    pub fn stats(&self) -> RingStats {
        self.stats
    }
}
