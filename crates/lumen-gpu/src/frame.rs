//! Frame-indexed bookkeeping shared by the descriptor heap and the frame ring.
//!
//! The frame driver calls `update_frame(last_completed, current)` once per frame. Everything that
//! must not be recycled while the GPU may still read it is filed under the frame that was being
//! recorded, in a fixed number of slots indexed by `frame % slot_count`, and handed back once
//! `last_completed` reaches that frame.
//!
//! Frame numbers start at 1. `last_completed == 0` means no frame has completed yet; work filed
//! before the first `update_frame` belongs to frame 0 and is retired by that first call.

use std::ops::RangeInclusive;

/// Default number of frame slots (frames that may be recorded or in flight at once).
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

/// Validates the `(last_completed, current)` sequence supplied by the frame driver.
///
/// Ordering violations are fatal: they mean GPU-visible memory could be recycled while still in
/// flight, so they panic instead of returning an error.
#[derive(Debug, Clone)]
pub struct FrameWindow {
    slot_count: usize,
    oldest: u64,
    last_completed: u64,
    current: u64,
}

impl FrameWindow {
    pub fn new(slot_count: usize) -> Self {
        assert!(slot_count > 0, "frame window needs at least one slot");
        Self {
            slot_count,
            oldest: 0,
            last_completed: 0,
            current: 0,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Frame currently being recorded (0 before the first update).
    pub fn current_frame(&self) -> u64 {
        self.current
    }

    pub fn last_completed_frame(&self) -> u64 {
        self.last_completed
    }

    /// Oldest frame whose slot has not been retired yet.
    pub fn oldest_frame(&self) -> u64 {
        self.oldest
    }

    pub fn slot_index(&self, frame: u64) -> usize {
        (frame % self.slot_count as u64) as usize
    }

    /// Frames whose slots may hold live data, oldest first.
    pub fn in_flight(&self) -> RangeInclusive<u64> {
        self.oldest..=self.current
    }

    /// Apply a frame advance and return the frames whose slots are now safe to recycle.
    pub fn advance(&mut self, last_completed: u64, current: u64) -> RangeInclusive<u64> {
        assert!(
            current > self.current,
            "update_frame: current frame must increase (got {current} after {})",
            self.current
        );
        assert!(
            last_completed >= self.last_completed,
            "update_frame: last completed frame went backwards (got {last_completed} after {})",
            self.last_completed
        );
        assert!(
            last_completed < current,
            "update_frame: last completed frame {last_completed} is not older than current frame {current}"
        );
        assert!(
            current - last_completed <= self.slot_count as u64,
            "update_frame: {} frames outstanding exceeds the {} frame slots (last completed {last_completed}, current {current})",
            current - last_completed,
            self.slot_count
        );

        let retired = self.oldest..=last_completed.min(self.current);
        self.oldest = self.oldest.max(last_completed + 1);
        self.last_completed = last_completed;
        self.current = current;
        retired
    }
}

/// One `T` per frame slot, recycled as frames complete.
#[derive(Debug)]
pub struct FrameSlots<T> {
    window: FrameWindow,
    slots: Vec<T>,
}

impl<T: Default> FrameSlots<T> {
    pub fn new(slot_count: usize) -> Self {
        let window = FrameWindow::new(slot_count);
        let slots = (0..slot_count).map(|_| T::default()).collect();
        Self { window, slots }
    }

    pub fn window(&self) -> &FrameWindow {
        &self.window
    }

    /// Slot belonging to the frame currently being recorded.
    pub fn current_mut(&mut self) -> &mut T {
        let index = self.window.slot_index(self.window.current_frame());
        &mut self.slots[index]
    }

    /// Slots of every frame that is recorded or in flight, oldest first.
    pub fn in_flight(&self) -> impl Iterator<Item = (u64, &T)> + '_ {
        self.window
            .in_flight()
            .map(move |frame| (frame, &self.slots[self.window.slot_index(frame)]))
    }

    /// Advance the window, handing every retired slot's contents to `retire` in frame order.
    pub fn advance(&mut self, last_completed: u64, current: u64, mut retire: impl FnMut(u64, T)) {
        let retired = self.window.advance(last_completed, current);
        for frame in retired {
            let index = self.window.slot_index(frame);
            retire(frame, std::mem::take(&mut self.slots[index]));
        }
    }
}
