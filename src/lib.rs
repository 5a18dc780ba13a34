//! # Flipchain
//!
//! A bounded graphics buffer queue between a frame producer and a display
//! consumer.
//!
//! Flipchain mediates ownership of a fixed set of buffer slots, each
//! wrapping a graphics memory allocation, through a four-state lifecycle
//! (FREE → DEQUEUED → QUEUED → ACQUIRED → FREE). An opaque fence rides
//! with each buffer so pixel-level GPU synchronization never blocks the
//! control path.
//!
//! ## Features
//!
//! - **Bounded memory**: at most `max_buffer_count` buffers in
//!   circulation, lazily allocated and reclaimed on geometry changes
//! - **At-most-one owner**: every slot is owned by exactly one of
//!   producer, consumer, or the queue at all times
//! - **Drop-on-overflow**: latency-sensitive modes replace the pending
//!   frame in place instead of blocking the producer
//! - **memfd-backed buffers**: pixel storage is always exportable by fd
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use flipchain::prelude::*;
//! use std::sync::Arc;
//!
//! let queue = BufferQueue::new();
//! queue.consumer_connect(Arc::downgrade(&listener), false)?;
//! queue.connect(ProducerApi::Cpu, false)?;
//!
//! // Producer side
//! let out = queue.dequeue_buffer(false, 640, 480, None, Usage::CPU_WRITE)?;
//! let buffer = queue.request_buffer(out.slot)?;
//! // ... render into buffer.memory() ...
//! queue.queue_buffer(out.slot, QueueBufferInput::new(ClockTime::ZERO))?;
//!
//! // Consumer side
//! let frame = queue.acquire_buffer(ClockTime::ZERO)?;
//! // ... sample the frame ...
//! queue.release_buffer(frame.slot, frame.frame_number, DisplayId::NONE, Fence::signaled())?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buffer;
pub mod clock;
pub mod error;
pub mod fence;
pub mod format;
pub mod item;
pub mod listener;
pub mod memory;
pub mod metrics;
pub mod queue;
pub mod slot;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::buffer::{GraphicBuffer, GraphicBufferAllocator, MemfdGraphicAllocator};
    pub use crate::clock::ClockTime;
    pub use crate::error::{Error, Result};
    pub use crate::fence::{DisplayId, Fence};
    pub use crate::format::{PixelFormat, Rect, ScalingMode, Transform, Usage};
    pub use crate::item::{
        BufferItem, DequeueFlags, DequeueOutput, QueueBufferInput, QueueBufferOutput,
    };
    pub use crate::listener::ConsumerListener;
    pub use crate::queue::{BufferQueue, ProducerApi, QueryKey};
}

pub use error::{Error, Result};
