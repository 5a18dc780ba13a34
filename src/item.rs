//! Per-frame records exchanged with the producer and consumer.

use crate::buffer::GraphicBuffer;
use crate::clock::ClockTime;
use crate::fence::Fence;
use crate::format::{Rect, ScalingMode, Transform};
use std::sync::Arc;

/// A frame waiting in the FIFO, as delivered to the consumer by
/// `acquire_buffer`.
#[derive(Debug, Clone)]
pub struct BufferItem {
    /// The buffer holding the frame. `None` when the consumer has already
    /// received this slot's handle on an earlier acquire and is expected
    /// to have it cached.
    pub buffer: Option<Arc<GraphicBuffer>>,
    /// Crop rectangle within the buffer.
    pub crop: Rect,
    /// Sampling transform, with the inverse-display bit split off.
    pub transform: Transform,
    /// Whether the frame should additionally be inverted for the display.
    pub transform_to_display_inverse: bool,
    /// How the frame maps onto the output geometry.
    pub scaling_mode: ScalingMode,
    /// Presentation timestamp.
    pub timestamp: ClockTime,
    /// Whether the timestamp was generated by the queue rather than set
    /// by the producer.
    pub is_auto_timestamp: bool,
    /// Frame number assigned when the frame was queued.
    pub frame_number: u64,
    /// Slot index the frame occupies.
    pub slot: usize,
    /// Fence the consumer must pass before sampling the buffer.
    pub fence: Fence,
    /// Whether a newer queue may replace this entry in place.
    pub is_droppable: bool,
    /// Whether the consumer had already observed this slot's buffer when
    /// the frame was queued.
    pub acquire_called: bool,
}

/// Per-frame presentation metadata supplied to `queue_buffer`.
#[derive(Debug, Clone)]
pub struct QueueBufferInput {
    /// Presentation timestamp.
    pub timestamp: ClockTime,
    /// Whether the timestamp was auto-generated.
    pub is_auto_timestamp: bool,
    /// Crop rectangle; must be contained in the buffer's bounds.
    pub crop: Rect,
    /// How the frame maps onto the output geometry.
    pub scaling_mode: ScalingMode,
    /// Display transform bits (may include the inverse-display bit).
    pub transform: Transform,
    /// Request the extra undequeued buffer for this frame.
    pub async_mode: bool,
    /// Fence the consumer must pass before reading the frame. Must carry
    /// a real token; pass [`Fence::signaled`] for CPU-rendered frames.
    pub fence: Fence,
}

impl QueueBufferInput {
    /// A minimal input: the given timestamp, no crop (an empty crop means
    /// the full buffer), freeze scaling, no transform, synchronous,
    /// pre-signaled fence.
    pub fn new(timestamp: ClockTime) -> Self {
        Self {
            timestamp,
            is_auto_timestamp: false,
            crop: Rect::EMPTY,
            scaling_mode: ScalingMode::Freeze,
            transform: Transform::IDENTITY,
            async_mode: false,
            fence: Fence::signaled(),
        }
    }
}

/// Surface-wide state returned from `queue_buffer` and `connect`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueBufferOutput {
    /// Default buffer width.
    pub width: u32,
    /// Default buffer height.
    pub height: u32,
    /// Transform hint for the producer's next render pass.
    pub transform_hint: Transform,
    /// Number of frames pending in the FIFO.
    pub num_pending_buffers: usize,
}

/// Flags qualifying a successful dequeue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DequeueFlags {
    /// The slot's buffer was (re)allocated; the producer must call
    /// `request_buffer` to fetch the new handle.
    pub needs_reallocation: bool,
    /// Slots above the active maximum were freed; the producer should
    /// drop any cached handles.
    pub released_all_buffers: bool,
}

/// Result of a successful dequeue.
#[derive(Debug)]
pub struct DequeueOutput {
    /// The slot now owned by the producer.
    pub slot: usize,
    /// Fence to pass before writing pixels.
    pub fence: Fence,
    /// Qualifying flags.
    pub flags: DequeueFlags,
}
