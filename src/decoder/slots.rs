//! Per-picture decode command slots.
//!
//! The slot table holds one reusable primary command buffer per concurrently
//! in-flight picture, allocated from a single command pool bound to the
//! hardware video-decode queue family. The in-flight tracker enforces the
//! slot invariant: at most one picture decode is associated with a slot at
//! any time. A slot is claimed before recording and released only once the
//! hardware signals completion; the release arrives from the completion
//! context and may run concurrently with the submitting thread, so the
//! in-use flags are atomic.

use crate::error::{FrameForgeError, Result};
use crate::vulkan::VideoContext;
use ash::vk;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// A decode slot handed out for command recording.
#[derive(Debug, Clone, Copy)]
pub struct DecodeFrameDataSlot {
    /// Slot index in `[0, max_decode_frames_count)`.
    pub slot: usize,
    /// The slot's reusable command buffer.
    pub command_buffer: vk::CommandBuffer,
}

/// Tracks which decode slots are claimed by in-flight pictures.
pub struct InFlightTracker {
    in_use: Vec<AtomicBool>,
}

impl InFlightTracker {
    /// Create a tracker with all `count` slots free.
    pub fn new(count: usize) -> Self {
        Self {
            in_use: (0..count).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    /// Number of slots tracked.
    pub fn len(&self) -> usize {
        self.in_use.len()
    }

    /// Whether the tracker has no slots.
    pub fn is_empty(&self) -> bool {
        self.in_use.is_empty()
    }

    /// Claim the lowest free slot, or `None` when every slot is in flight.
    pub fn claim(&self) -> Option<usize> {
        for (idx, flag) in self.in_use.iter().enumerate() {
            if flag
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(idx);
            }
        }
        None
    }

    /// Release a slot back to the free set.
    ///
    /// Called only from the completion path, after the hardware has finished
    /// consuming the slot's commands.
    pub fn release(&self, slot: usize) {
        debug_assert!(slot < self.in_use.len());
        let was_in_use = self.in_use[slot].swap(false, Ordering::AcqRel);
        debug_assert!(was_in_use, "released a slot that was not claimed");
    }

    /// Whether a slot is currently claimed. Out-of-range indexes are never
    /// in use.
    pub fn in_use(&self, slot: usize) -> bool {
        self.in_use
            .get(slot)
            .map_or(false, |flag| flag.load(Ordering::Acquire))
    }

    /// Number of slots currently claimed.
    pub fn in_flight_count(&self) -> usize {
        self.in_use
            .iter()
            .filter(|f| f.load(Ordering::Acquire))
            .count()
    }

    /// Whether no picture is in flight.
    pub fn is_idle(&self) -> bool {
        self.in_flight_count() == 0
    }
}

/// Fixed-size table of per-slot decode command resources.
pub struct DecodeFrameData {
    context: VideoContext,
    command_pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
}

impl DecodeFrameData {
    /// Create an empty slot table. Call [`DecodeFrameData::resize`] once the
    /// in-flight depth has been negotiated.
    pub fn new(context: VideoContext) -> Self {
        Self {
            context,
            command_pool: vk::CommandPool::null(),
            command_buffers: Vec::new(),
        }
    }

    /// Allocate `max_decode_frames_count` command buffers on the decode
    /// queue family, returning the number of slots available.
    ///
    /// Called once per session lifetime; a second call is an idempotent
    /// no-op returning the existing slot count. The queue family must be
    /// the one advertised by the device context as supporting video decode;
    /// anything else is a configuration error, reported here rather than
    /// silently tolerated.
    pub fn resize(&mut self, max_decode_frames_count: usize, queue_family_index: u32) -> Result<usize> {
        if queue_family_index != self.context.video_decode_queue_family() {
            return Err(FrameForgeError::InvalidInput(format!(
                "Decode slot table requires the video decode queue family {}, got {}",
                self.context.video_decode_queue_family(),
                queue_family_index
            )));
        }

        if self.command_pool != vk::CommandPool::null() {
            // Already sized; the session that sized it is still alive.
            return Ok(self.command_buffers.len());
        }

        let device = self.context.device();

        let pool_create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let command_pool = unsafe { device.create_command_pool(&pool_create_info, None) }
            .map_err(|e| FrameForgeError::CommandBuffer(e.to_string()))?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(max_decode_frames_count as u32);

        let command_buffers = match unsafe { device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers,
            Err(e) => {
                unsafe { device.destroy_command_pool(command_pool, None) };
                return Err(FrameForgeError::CommandBuffer(e.to_string()));
            }
        };

        info!(
            "Allocated {} decode command slots on queue family {}",
            max_decode_frames_count, queue_family_index
        );

        self.command_pool = command_pool;
        self.command_buffers = command_buffers;
        Ok(self.command_buffers.len())
    }

    /// Get the command segment for a slot, for recording.
    pub fn slot(&self, slot: usize) -> Option<DecodeFrameDataSlot> {
        self.command_buffers
            .get(slot)
            .map(|&command_buffer| DecodeFrameDataSlot {
                slot,
                command_buffer,
            })
    }

    /// Number of slots the table holds.
    pub fn len(&self) -> usize {
        self.command_buffers.len()
    }

    /// Whether the table has been sized yet.
    pub fn is_empty(&self) -> bool {
        self.command_buffers.is_empty()
    }

    /// Free all command segments and the owning pool together.
    ///
    /// Safe to call more than once; also invoked from `Drop`.
    pub fn deinit(&mut self) {
        if self.command_pool != vk::CommandPool::null() {
            let device = self.context.device();
            unsafe {
                device.free_command_buffers(self.command_pool, &self.command_buffers);
                device.destroy_command_pool(self.command_pool, None);
            }
            self.command_pool = vk::CommandPool::null();
            self.command_buffers.clear();
            debug!("Destroyed decode command slots");
        }
    }
}

impl Drop for DecodeFrameData {
    fn drop(&mut self) {
        self.deinit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claims_up_to_depth() {
        let tracker = InFlightTracker::new(8);
        for expected in 0..8 {
            assert_eq!(tracker.claim(), Some(expected));
        }
        assert_eq!(tracker.in_flight_count(), 8);
    }

    #[test]
    fn test_claim_beyond_depth_fails() {
        let tracker = InFlightTracker::new(8);
        for _ in 0..8 {
            tracker.claim().unwrap();
        }
        // The ninth submission before any completion is backpressure.
        assert_eq!(tracker.claim(), None);
    }

    #[test]
    fn test_release_then_reclaim_reuses_lowest_slot() {
        let tracker = InFlightTracker::new(8);
        for _ in 0..8 {
            tracker.claim().unwrap();
        }
        tracker.release(0);
        assert_eq!(tracker.claim(), Some(0));
    }

    #[test]
    fn test_release_out_of_order() {
        let tracker = InFlightTracker::new(4);
        for _ in 0..4 {
            tracker.claim().unwrap();
        }
        // Completion order need not match submission order.
        tracker.release(2);
        tracker.release(1);
        assert_eq!(tracker.claim(), Some(1));
        assert_eq!(tracker.claim(), Some(2));
        assert_eq!(tracker.claim(), None);
    }

    #[test]
    fn test_idle_after_all_released() {
        let tracker = InFlightTracker::new(3);
        let a = tracker.claim().unwrap();
        let b = tracker.claim().unwrap();
        assert!(!tracker.is_idle());
        tracker.release(a);
        tracker.release(b);
        assert!(tracker.is_idle());
    }

    #[test]
    fn test_in_use_reflects_claims() {
        let tracker = InFlightTracker::new(2);
        assert!(!tracker.in_use(0));
        tracker.claim().unwrap();
        assert!(tracker.in_use(0));
        assert!(!tracker.in_use(1));
    }

    #[test]
    fn test_out_of_range_slot_is_never_in_use() {
        // Completion notifications carry collaborator-supplied indexes; a
        // bad index must be detectable without panicking.
        let tracker = InFlightTracker::new(4);
        assert!(!tracker.in_use(4));
        assert!(!tracker.in_use(usize::MAX));
    }

    #[test]
    fn test_stale_completion_is_detectable() {
        let tracker = InFlightTracker::new(2);
        let slot = tracker.claim().unwrap();
        tracker.release(slot);
        // A second completion for the same slot finds it free.
        assert!(!tracker.in_use(slot));
    }
}
