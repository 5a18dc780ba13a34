//! Buffer slots: the fixed table entries of the queue's state machine.

use crate::buffer::GraphicBuffer;
use crate::fence::{DisplayId, Fence};
use std::sync::Arc;

/// Number of slots in the table. Slots above the active maximum hold no
/// buffer; the table itself never grows or shrinks.
pub const NUM_BUFFER_SLOTS: usize = 32;

/// Frame number installed in a slot right after its buffer is
/// reallocated. The maximum value makes the slot the last pick for LRU
/// selection until it is queued with a real frame number.
pub const REALLOCATED_FRAME_NUMBER: u64 = u64::MAX;

/// Lifecycle state of a slot.
///
/// Ownership follows the state: `Dequeued` slots belong to the producer,
/// `Acquired` slots to the consumer, everything else to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BufferState {
    /// Owned by the queue, available for dequeue.
    #[default]
    Free,
    /// Owned by the producer, being filled.
    Dequeued,
    /// Owned by the queue, waiting in the FIFO.
    Queued,
    /// Owned by the consumer, being sampled.
    Acquired,
}

/// One entry of the slot table.
#[derive(Debug)]
pub struct BufferSlot {
    /// Current lifecycle state.
    pub state: BufferState,
    /// The underlying allocation, if any. Empty until the first dequeue
    /// and after the slot is freed.
    pub buffer: Option<Arc<GraphicBuffer>>,
    /// Frame number assigned at queue time. `0` for never-queued or
    /// canceled slots, [`REALLOCATED_FRAME_NUMBER`] right after
    /// reallocation.
    pub frame_number: u64,
    /// Whether the producer has fetched the buffer handle since the last
    /// reallocation. A slot must be requested before it may be queued.
    pub request_buffer_called: bool,
    /// Whether the consumer has seen this slot's current buffer at least
    /// once. Used to elide redundant handle transmission on acquire.
    pub acquire_called: bool,
    /// Most recent sync token attached to the buffer. Owned by whoever
    /// currently owns the slot.
    pub fence: Fence,
    /// Display the release fence was submitted on.
    pub display: DisplayId,
    /// Set when the slot was freed while the consumer held it; the
    /// eventual release discards instead of returning to the pool.
    pub needs_cleanup_on_release: bool,
}

impl BufferSlot {
    /// A fresh, empty slot.
    pub fn new() -> Self {
        Self {
            state: BufferState::Free,
            buffer: None,
            frame_number: 0,
            request_buffer_called: false,
            acquire_called: false,
            fence: Fence::no_fence(),
            display: DisplayId::NONE,
            needs_cleanup_on_release: false,
        }
    }

    /// Drop the slot's buffer and reset its bookkeeping.
    ///
    /// A slot freed while `Acquired` is flagged so the consumer's late
    /// release discards rather than resurrecting the buffer.
    pub(crate) fn free_buffer(&mut self) {
        self.buffer = None;
        if self.state == BufferState::Acquired {
            self.needs_cleanup_on_release = true;
        }
        self.state = BufferState::Free;
        self.frame_number = 0;
        self.acquire_called = false;
        self.fence = Fence::no_fence();
        self.display = DisplayId::NONE;
    }
}

impl Default for BufferSlot {
    fn default() -> Self {
        Self::new()
    }
}
