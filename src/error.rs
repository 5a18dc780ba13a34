//! Error types for Flipchain.

use crate::slot::BufferState;
use thiserror::Error;

/// Result type alias using Flipchain's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for buffer queue operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The queue has been abandoned; every operation fails this way from
    /// then on.
    #[error("buffer queue has been abandoned")]
    Abandoned,

    /// Slot index outside the currently valid range.
    #[error("slot index out of range [0, {max}): {slot}")]
    SlotOutOfRange {
        /// The offending slot index.
        slot: usize,
        /// Exclusive upper bound at the time of the call.
        max: usize,
    },

    /// Operation issued on a slot that is not in the expected state.
    #[error("slot {slot} is {actual:?}, expected {expected:?}")]
    InvalidSlotState {
        /// The slot the operation targeted.
        slot: usize,
        /// State the operation requires.
        expected: BufferState,
        /// State the slot was actually in.
        actual: BufferState,
    },

    /// Consumer released a slot whose frame number no longer matches.
    #[error("stale release of slot {slot}: frame {frame}, slot is at frame {current}")]
    StaleRelease {
        /// The slot being released.
        slot: usize,
        /// Frame number the consumer passed.
        frame: u64,
        /// Frame number the slot currently carries.
        current: u64,
    },

    /// Invalid argument (geometry, raw enum value, missing fence).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not permitted in the queue's current configuration.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Dequeue would leave fewer than the minimum undequeued buffers.
    #[error("min undequeued buffer count ({min}) exceeded (dequeued={dequeued})")]
    MinUndequeuedViolated {
        /// Minimum number of slots that must stay undequeued.
        min: usize,
        /// Slots already dequeued when the request arrived.
        dequeued: usize,
    },

    /// Dequeue would have to wait and the queue is in cannot-block mode.
    #[error("dequeue would block")]
    WouldBlock,

    /// The FIFO holds no frame that is due for presentation.
    #[error("no buffer is available for acquisition")]
    NoBufferAvailable,

    /// Graphics memory allocation failed.
    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
