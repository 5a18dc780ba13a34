//! The buffer queue: a bounded rendezvous between one producer and one
//! consumer over a fixed slot table.
//!
//! The queue mediates ownership of up to [`NUM_BUFFER_SLOTS`] graphics
//! buffers. Each slot cycles through FREE, DEQUEUED, QUEUED, ACQUIRED and
//! back to FREE; queued frames wait in a FIFO until the consumer takes
//! them. A single mutex and one condition variable serialize every
//! transition; the only operation that may block is the producer's
//! dequeue, waiting for a slot to come back.
//!
//! # Overflow behavior
//!
//! When the producer outruns the consumer there are two modes: block the
//! producer (default), or, when frames are droppable (cannot-block mode
//! or an async queue), replace the FIFO head in place so the consumer
//! always sees the freshest frame.

use crate::buffer::{GraphicBuffer, GraphicBufferAllocator, MemfdGraphicAllocator};
use crate::clock::ClockTime;
use crate::error::{Error, Result};
use crate::fence::{DisplayId, Fence};
use crate::format::{PixelFormat, Rect, Transform, Usage};
use crate::item::{BufferItem, DequeueFlags, DequeueOutput, QueueBufferInput, QueueBufferOutput};
use crate::listener::ConsumerListener;
use crate::metrics;
use crate::slot::{BufferSlot, BufferState, NUM_BUFFER_SLOTS, REALLOCATED_FRAME_NUMBER};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Bounded wait applied to the previous owner's fence during dequeue. By
/// the time the wait runs, ownership has already transferred, so a
/// timeout is logged and the buffer is returned anyway.
const DEQUEUE_FENCE_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound for `set_max_acquired_buffer_count`: the producer always
/// needs one dequeuable slot and one slot in flight.
const MAX_MAX_ACQUIRED_BUFFERS: usize = NUM_BUFFER_SLOTS - 2;

/// Counter feeding the default consumer name.
static QUEUE_ID_COUNTER: AtomicU32 = AtomicU32::new(0);

fn next_queue_id() -> u32 {
    QUEUE_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Producer-side APIs that may connect to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProducerApi {
    /// GPU rendering through EGL/GL.
    Egl,
    /// CPU rendering.
    Cpu,
    /// Media decoder output.
    Media,
    /// Camera capture output.
    Camera,
}

/// Keys understood by [`BufferQueue::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKey {
    /// Default buffer width.
    DefaultWidth,
    /// Default buffer height.
    DefaultHeight,
    /// Default buffer format (raw value).
    DefaultFormat,
    /// Minimum number of buffers that must stay undequeued.
    MinUndequeuedBuffers,
    /// 1 when the consumer is running behind (two or more frames
    /// pending), else 0.
    ConsumerRunningBehind,
    /// Usage bits the consumer requires on every buffer.
    ConsumerUsageBits,
}

/// Point-in-time view of one slot, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSnapshot {
    /// Lifecycle state.
    pub state: BufferState,
    /// Whether the slot holds a buffer.
    pub has_buffer: bool,
    /// Current frame number.
    pub frame_number: u64,
}

/// Point-in-time view of the queue, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    /// Per-slot state, indexed by slot.
    pub slots: Vec<SlotSnapshot>,
    /// Slot indices currently in the FIFO, front first.
    pub fifo_slots: Vec<usize>,
    /// Whether the queue has been abandoned.
    pub abandoned: bool,
}

impl QueueSnapshot {
    /// Number of slots in the given state.
    pub fn count(&self, state: BufferState) -> usize {
        self.slots.iter().filter(|slot| slot.state == state).count()
    }
}

/// Everything guarded by the queue mutex.
struct Core {
    slots: [BufferSlot; NUM_BUFFER_SLOTS],
    fifo: VecDeque<BufferItem>,
    default_width: u32,
    default_height: u32,
    default_format: PixelFormat,
    max_acquired_buffer_count: usize,
    default_max_buffer_count: usize,
    /// 0 means no override is in effect.
    override_max_buffer_count: usize,
    use_async_buffer: bool,
    dequeue_buffer_cannot_block: bool,
    consumer_controlled_by_app: bool,
    connected_api: Option<ProducerApi>,
    abandoned: bool,
    frame_counter: u64,
    buffer_has_been_queued: bool,
    consumer_usage_bits: Usage,
    transform_hint: Transform,
    consumer_name: String,
    consumer_listener: Option<Weak<dyn ConsumerListener>>,
    /// Partial-update side channel; orthogonal to the state machine.
    dirty_region: [Rect; NUM_BUFFER_SLOTS],
    current_dirty_region: Rect,
}

impl Core {
    /// Minimum number of slots that must remain non-dequeued so the
    /// consumer can hold its in-flight buffers without starving the
    /// producer.
    fn min_undequeued_buffer_count(&self, async_mode: bool) -> usize {
        if self.use_async_buffer || async_mode {
            self.max_acquired_buffer_count + 1
        } else {
            self.max_acquired_buffer_count
        }
    }

    /// Smallest max-buffer-count that still satisfies the undequeued
    /// minimum plus one dequeuable slot.
    fn min_max_buffer_count(&self, async_mode: bool) -> usize {
        self.min_undequeued_buffer_count(async_mode) + 1
    }

    /// The active ceiling on slots in circulation.
    fn max_buffer_count(&self, async_mode: bool) -> usize {
        let count = if self.override_max_buffer_count != 0 {
            self.override_max_buffer_count
        } else {
            self.default_max_buffer_count
                .max(self.min_max_buffer_count(async_mode))
        };
        count.min(NUM_BUFFER_SLOTS)
    }

    /// Whether a FIFO entry still refers to the buffer its slot holds.
    /// False once the slot was freed or reallocated out from under it.
    fn still_tracking(&self, item: &BufferItem) -> bool {
        let slot_buffer = match &self.slots[item.slot].buffer {
            Some(buffer) => buffer,
            None => return false,
        };
        item.buffer
            .as_ref()
            .is_some_and(|buffer| buffer.id() == slot_buffer.id())
    }

    /// Free every slot's buffer and forget pending frames. Slots held by
    /// the consumer are flagged for cleanup on their eventual release.
    fn free_all_buffers(&mut self) {
        if !self.fifo.is_empty() {
            warn!(
                pending = self.fifo.len(),
                "freeing all buffers with frames still pending"
            );
            self.fifo.clear();
        }
        self.buffer_has_been_queued = false;
        for slot in &mut self.slots {
            slot.free_buffer();
        }
    }
}

/// A bounded graphics buffer queue between one producer and one consumer.
///
/// Create with [`BufferQueue::new`], hand one reference to the producer
/// and one to the consumer. All operations take `&self`; a single
/// internal mutex serializes state transitions.
///
/// # Example
///
/// ```rust,ignore
/// use flipchain::prelude::*;
///
/// let queue = BufferQueue::new();
/// queue.consumer_connect(Arc::downgrade(&listener), false)?;
/// queue.connect(ProducerApi::Cpu, false)?;
///
/// let out = queue.dequeue_buffer(false, 640, 480, None, Usage::CPU_WRITE)?;
/// let buffer = queue.request_buffer(out.slot)?;
/// // ... render into buffer ...
/// queue.queue_buffer(out.slot, QueueBufferInput::new(ClockTime::ZERO))?;
/// ```
pub struct BufferQueue {
    core: Mutex<Core>,
    /// Signaled whenever a state change could unblock a waiting dequeue.
    dequeue_cond: Condvar,
    allocator: Arc<dyn GraphicBufferAllocator>,
}

impl BufferQueue {
    /// Create a queue backed by the default memfd allocator.
    pub fn new() -> Arc<Self> {
        Self::with_allocator(Arc::new(MemfdGraphicAllocator))
    }

    /// Create a queue with a custom buffer allocator.
    pub fn with_allocator(allocator: Arc<dyn GraphicBufferAllocator>) -> Arc<Self> {
        metrics::init_metrics();
        let consumer_name = format!("unnamed-{}-{}", std::process::id(), next_queue_id());
        trace!(name = %consumer_name, "new buffer queue");

        Arc::new(Self {
            core: Mutex::new(Core {
                slots: std::array::from_fn(|_| BufferSlot::new()),
                fifo: VecDeque::new(),
                default_width: 1,
                default_height: 1,
                default_format: PixelFormat::Rgba8888,
                max_acquired_buffer_count: 1,
                default_max_buffer_count: 2,
                override_max_buffer_count: 0,
                use_async_buffer: true,
                dequeue_buffer_cannot_block: false,
                consumer_controlled_by_app: false,
                connected_api: None,
                abandoned: false,
                frame_counter: 0,
                buffer_has_been_queued: false,
                consumer_usage_bits: Usage::NONE,
                transform_hint: Transform::IDENTITY,
                consumer_name,
                consumer_listener: None,
                dirty_region: [Rect::EMPTY; NUM_BUFFER_SLOTS],
                current_dirty_region: Rect::EMPTY,
            }),
            dequeue_cond: Condvar::new(),
            allocator,
        })
    }

    // ========================================================================
    // Producer interface
    // ========================================================================

    /// Connect the producer.
    ///
    /// Requires a connected consumer and no producer already attached.
    /// Dequeue becomes non-blocking when both sides are controlled by the
    /// application (frames also become droppable, see
    /// [`BufferQueue::queue_buffer`]).
    pub fn connect(
        &self,
        api: ProducerApi,
        producer_controlled_by_app: bool,
    ) -> Result<QueueBufferOutput> {
        let mut core = self.core.lock().unwrap();
        if core.abandoned {
            error!("connect: buffer queue has been abandoned");
            return Err(Error::Abandoned);
        }
        if core.consumer_listener.is_none() {
            return Err(Error::InvalidOperation(
                "consumer is not connected".into(),
            ));
        }
        if let Some(current) = core.connected_api {
            error!(?current, ?api, "connect: already connected");
            return Err(Error::InvalidOperation(format!(
                "already connected to {:?}",
                current
            )));
        }

        core.connected_api = Some(api);
        core.buffer_has_been_queued = false;
        core.dequeue_buffer_cannot_block =
            core.consumer_controlled_by_app && producer_controlled_by_app;

        trace!(?api, cannot_block = core.dequeue_buffer_cannot_block, "producer connected");
        Ok(QueueBufferOutput {
            width: core.default_width,
            height: core.default_height,
            transform_hint: core.transform_hint,
            num_pending_buffers: core.fifo.len(),
        })
    }

    /// Disconnect the producer, abandoning the queue.
    ///
    /// All slots are released; slots currently held by the consumer are
    /// flagged so a late release discards rather than revives them. Any
    /// producer blocked in dequeue wakes and fails.
    pub fn disconnect(&self, api: ProducerApi) -> Result<()> {
        let listener = {
            let mut core = self.core.lock().unwrap();
            if core.abandoned {
                // Disconnecting an abandoned queue is a no-op.
                return Ok(());
            }
            match core.connected_api {
                Some(current) if current == api => {}
                current => {
                    error!(?current, ?api, "disconnect: api mismatch");
                    return Err(Error::InvalidArgument(format!(
                        "producer connected as {:?}, disconnect requested for {:?}",
                        current, api
                    )));
                }
            }

            core.connected_api = None;
            core.fifo.clear();
            core.free_all_buffers();
            core.abandoned = true;
            self.dequeue_cond.notify_all();
            debug!(?api, "producer disconnected, queue abandoned");
            core.consumer_listener.clone()
        };

        if let Some(listener) = listener.and_then(|weak| weak.upgrade()) {
            listener.on_buffers_released();
        }
        Ok(())
    }

    /// Dequeue a slot for the producer to render into.
    ///
    /// `width == 0 && height == 0` selects the default geometry; a single
    /// zero dimension is invalid. `format: None` selects the default
    /// format. The requested usage is widened by the consumer's bits.
    ///
    /// Blocks while no slot is dequeuable, unless the queue is in
    /// cannot-block mode, in which case it fails with
    /// [`Error::WouldBlock`].
    pub fn dequeue_buffer(
        &self,
        async_mode: bool,
        width: u32,
        height: u32,
        format: Option<PixelFormat>,
        usage: Usage,
    ) -> Result<DequeueOutput> {
        if (width == 0) != (height == 0) {
            error!(width, height, "dequeue_buffer: invalid size");
            return Err(Error::InvalidArgument(format!(
                "one-sided zero dimensions: {}x{}",
                width, height
            )));
        }

        let mut flags = DequeueFlags::default();
        let mut core = self.core.lock().unwrap();
        let format = format.unwrap_or(core.default_format);
        let usage = usage | core.consumer_usage_bits;

        let found = loop {
            if core.abandoned {
                error!("dequeue_buffer: buffer queue has been abandoned");
                return Err(Error::Abandoned);
            }

            let max_buffer_count = core.max_buffer_count(async_mode);
            // An override below the async-adjusted minimum cannot satisfy
            // the extra in-flight buffer async mode asks for.
            if async_mode
                && core.override_max_buffer_count != 0
                && core.override_max_buffer_count < core.min_max_buffer_count(async_mode)
            {
                error!("dequeue_buffer: async mode is invalid with a buffer count override");
                return Err(Error::InvalidArgument(
                    "async mode is invalid with a buffer count override".into(),
                ));
            }

            // Free buffers stranded in slots beyond the active maximum.
            for i in max_buffer_count..NUM_BUFFER_SLOTS {
                if core.slots[i].buffer.is_some() {
                    core.slots[i].free_buffer();
                    flags.released_all_buffers = true;
                }
            }

            let mut found = None;
            let mut dequeued_count = 0;
            let mut acquired_count = 0;
            for i in 0..max_buffer_count {
                match core.slots[i].state {
                    BufferState::Dequeued => dequeued_count += 1,
                    BufferState::Acquired => acquired_count += 1,
                    BufferState::Free => {
                        // Prefer a slot that still holds a buffer over an
                        // empty one (reuse beats reallocation); among
                        // those, the oldest frame wins since the consumer
                        // may still have reads in flight on recent ones.
                        let better = match found {
                            None => true,
                            Some(f) => {
                                let cand = &core.slots[i];
                                let best: &BufferSlot = &core.slots[f];
                                match (cand.buffer.is_some(), best.buffer.is_some()) {
                                    (true, false) => true,
                                    (false, true) => false,
                                    _ => cand.frame_number < best.frame_number,
                                }
                            }
                        };
                        if better {
                            found = Some(i);
                        }
                    }
                    BufferState::Queued => {}
                }
            }

            // Without an explicit buffer count only one outstanding
            // dequeue is permitted.
            if core.override_max_buffer_count == 0 && dequeued_count > 0 {
                error!("dequeue_buffer: already dequeued without a buffer count override");
                return Err(Error::InvalidOperation(
                    "only one buffer may be dequeued without a buffer count override".into(),
                ));
            }

            if core.buffer_has_been_queued {
                let min_undequeued = core.min_undequeued_buffer_count(async_mode);
                let new_undequeued = max_buffer_count - (dequeued_count + 1);
                if new_undequeued < min_undequeued {
                    error!(
                        min_undequeued,
                        dequeued = dequeued_count,
                        "dequeue_buffer: min undequeued buffer count exceeded"
                    );
                    return Err(Error::MinUndequeuedViolated {
                        min: min_undequeued,
                        dequeued: dequeued_count,
                    });
                }
            }

            match found {
                Some(slot) => break slot,
                None => {
                    // The consumer may briefly hold one extra buffer
                    // (acquire before release); that wait is short, so
                    // cannot-block only fails fast outside that window.
                    if core.dequeue_buffer_cannot_block
                        && acquired_count <= core.max_acquired_buffer_count
                    {
                        error!("dequeue_buffer: would block");
                        return Err(Error::WouldBlock);
                    }
                    core = self.dequeue_cond.wait(core).unwrap();
                }
            }
        };

        let (width, height) = if width == 0 && height == 0 {
            (core.default_width, core.default_height)
        } else {
            (width, height)
        };

        let slot = &mut core.slots[found];
        slot.state = BufferState::Dequeued;

        let matches = slot
            .buffer
            .as_ref()
            .is_some_and(|b| b.satisfies(width, height, format, usage));
        if !matches {
            slot.buffer = None;
            slot.acquire_called = false;
            slot.request_buffer_called = false;
            slot.fence = Fence::no_fence();
            slot.display = DisplayId::NONE;
            flags.needs_reallocation = true;
        }

        let fence = std::mem::replace(&mut slot.fence, Fence::no_fence());
        slot.display = DisplayId::NONE;
        drop(core);

        if flags.needs_reallocation {
            // Allocation is slow; run it without the lock so the consumer
            // is never stalled behind it.
            let buffer = self
                .allocator
                .create_graphic_buffer(width, height, format, usage)?;
            metrics::record_buffer_allocated();

            let mut core = self.core.lock().unwrap();
            if core.abandoned {
                error!("dequeue_buffer: queue abandoned during allocation");
                return Err(Error::Abandoned);
            }
            core.slots[found].frame_number = REALLOCATED_FRAME_NUMBER;
            core.slots[found].buffer = Some(buffer);
        }

        // The previous owner's fence may still be pending. Ownership has
        // already transferred, so a timeout cannot fail the dequeue.
        if fence.is_valid() && !fence.wait(DEQUEUE_FENCE_TIMEOUT) {
            warn!(slot = found, "dequeue_buffer: timeout waiting for fence");
            metrics::record_fence_wait_timeout();
        }

        trace!(
            slot = found,
            needs_reallocation = flags.needs_reallocation,
            released_all = flags.released_all_buffers,
            "dequeued"
        );
        Ok(DequeueOutput {
            slot: found,
            fence,
            flags,
        })
    }

    /// Fetch the buffer handle of a dequeued slot.
    ///
    /// Must be called after a dequeue that reported
    /// `needs_reallocation`; a slot cannot be queued until it has been
    /// requested.
    pub fn request_buffer(&self, slot: usize) -> Result<Arc<GraphicBuffer>> {
        let mut core = self.core.lock().unwrap();
        if core.abandoned {
            error!("request_buffer: buffer queue has been abandoned");
            return Err(Error::Abandoned);
        }
        if slot >= NUM_BUFFER_SLOTS {
            return Err(Error::SlotOutOfRange {
                slot,
                max: NUM_BUFFER_SLOTS,
            });
        }
        if core.slots[slot].state != BufferState::Dequeued {
            error!(slot, state = ?core.slots[slot].state, "request_buffer: not owned by producer");
            return Err(Error::InvalidSlotState {
                slot,
                expected: BufferState::Dequeued,
                actual: core.slots[slot].state,
            });
        }

        let buffer = core.slots[slot]
            .buffer
            .clone()
            .ok_or_else(|| Error::InvalidOperation(format!("slot {} has no buffer", slot)))?;
        core.slots[slot].request_buffer_called = true;
        Ok(buffer)
    }

    /// Queue a filled buffer for the consumer.
    ///
    /// The frame is appended to the FIFO, or, when the current head is
    /// droppable, replaces it in place, returning the head's slot to the
    /// free pool with first pick at the next dequeue. The consumer's
    /// `on_frame_available` fires (outside the lock) only for appends.
    pub fn queue_buffer(&self, slot: usize, input: QueueBufferInput) -> Result<QueueBufferOutput> {
        if !input.fence.is_valid() {
            error!("queue_buffer: fence is required");
            return Err(Error::InvalidArgument("fence is required".into()));
        }

        let (output, listener) = {
            let mut core = self.core.lock().unwrap();
            if core.abandoned {
                error!("queue_buffer: buffer queue has been abandoned");
                return Err(Error::Abandoned);
            }

            let max_buffer_count = core.max_buffer_count(input.async_mode);
            if input.async_mode
                && core.override_max_buffer_count != 0
                && core.override_max_buffer_count < core.min_max_buffer_count(input.async_mode)
            {
                error!("queue_buffer: async mode is invalid with a buffer count override");
                return Err(Error::InvalidArgument(
                    "async mode is invalid with a buffer count override".into(),
                ));
            }
            if slot >= max_buffer_count {
                error!(slot, max_buffer_count, "queue_buffer: slot out of range");
                return Err(Error::SlotOutOfRange {
                    slot,
                    max: max_buffer_count,
                });
            }
            if core.slots[slot].state != BufferState::Dequeued {
                error!(slot, state = ?core.slots[slot].state, "queue_buffer: not owned by producer");
                return Err(Error::InvalidSlotState {
                    slot,
                    expected: BufferState::Dequeued,
                    actual: core.slots[slot].state,
                });
            }
            if !core.slots[slot].request_buffer_called {
                error!(slot, "queue_buffer: buffer was never requested");
                return Err(Error::InvalidOperation(format!(
                    "slot {} was queued without requesting its buffer",
                    slot
                )));
            }

            let buffer = core.slots[slot]
                .buffer
                .clone()
                .ok_or_else(|| Error::InvalidOperation(format!("slot {} has no buffer", slot)))?;
            let bounds = Rect::bounds_of(buffer.width(), buffer.height());
            let crop = input.crop.intersect(&bounds);
            if crop != input.crop {
                error!(slot, crop = %input.crop, bounds = %bounds, "queue_buffer: crop not contained");
                return Err(Error::InvalidArgument(format!(
                    "crop {} is not contained within the buffer {}",
                    input.crop, bounds
                )));
            }

            core.frame_counter += 1;
            let frame_number = core.frame_counter;
            core.slots[slot].fence = input.fence.clone();
            core.slots[slot].frame_number = frame_number;
            core.slots[slot].state = BufferState::Queued;

            trace!(
                slot,
                frame_number,
                timestamp = %input.timestamp,
                scaling_mode = ?input.scaling_mode,
                "queueing"
            );

            let item = BufferItem {
                buffer: Some(buffer),
                crop,
                transform: input.transform.without_inverse_display(),
                transform_to_display_inverse: input.transform.contains(Transform::INVERSE_DISPLAY),
                scaling_mode: input.scaling_mode,
                timestamp: input.timestamp,
                is_auto_timestamp: input.is_auto_timestamp,
                frame_number,
                slot,
                fence: input.fence.clone(),
                is_droppable: core.dequeue_buffer_cannot_block || input.async_mode,
                acquire_called: core.slots[slot].acquire_called,
            };

            // When the head is droppable, trade it for the new frame so a
            // lagging consumer sees the freshest content.
            let replace_head = core
                .fifo
                .front()
                .is_some_and(|front| front.is_droppable);
            let mut listener = None;
            if replace_head {
                let freed_slot = core
                    .fifo
                    .front()
                    .filter(|front| core.still_tracking(front))
                    .map(|front| front.slot);
                if let Some(freed) = freed_slot {
                    core.slots[freed].state = BufferState::Free;
                    // First in line at the next dequeue.
                    core.slots[freed].frame_number = 0;
                }
                if let Some(front) = core.fifo.front_mut() {
                    debug!(replaced = front.slot, with = slot, "replaced droppable FIFO head");
                    *front = item;
                }
                metrics::record_frame_dropped();
            } else {
                core.fifo.push_back(item);
                listener = core.consumer_listener.clone();
            }

            core.buffer_has_been_queued = true;
            self.dequeue_cond.notify_all();
            metrics::record_frame_queued();

            (
                QueueBufferOutput {
                    width: core.default_width,
                    height: core.default_height,
                    transform_hint: core.transform_hint,
                    num_pending_buffers: core.fifo.len(),
                },
                listener,
            )
        };

        if let Some(listener) = listener.and_then(|weak| weak.upgrade()) {
            listener.on_frame_available();
        }
        Ok(output)
    }

    /// Return a dequeued slot without queuing it.
    ///
    /// The slot goes back to the free pool with first pick at the next
    /// dequeue; the fence travels with it.
    pub fn cancel_buffer(&self, slot: usize, fence: Fence) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        if core.abandoned {
            error!("cancel_buffer: buffer queue has been abandoned");
            return Err(Error::Abandoned);
        }
        if slot >= NUM_BUFFER_SLOTS {
            return Err(Error::SlotOutOfRange {
                slot,
                max: NUM_BUFFER_SLOTS,
            });
        }
        if core.slots[slot].state != BufferState::Dequeued {
            error!(slot, state = ?core.slots[slot].state, "cancel_buffer: not owned by producer");
            return Err(Error::InvalidSlotState {
                slot,
                expected: BufferState::Dequeued,
                actual: core.slots[slot].state,
            });
        }

        core.slots[slot].state = BufferState::Free;
        core.slots[slot].frame_number = 0;
        core.slots[slot].fence = fence;
        self.dequeue_cond.notify_all();
        trace!(slot, "canceled");
        Ok(())
    }

    /// Override the maximum number of buffers in circulation.
    ///
    /// `count == 0` clears the override. Fails while the producer owns
    /// any dequeued slot. Setting a count frees every buffer; the
    /// consumer is notified via `on_buffers_released` outside the lock.
    pub fn set_buffer_count(&self, count: usize) -> Result<()> {
        let listener = {
            let mut core = self.core.lock().unwrap();
            if core.abandoned {
                error!("set_buffer_count: buffer queue has been abandoned");
                return Err(Error::Abandoned);
            }
            if count > NUM_BUFFER_SLOTS {
                error!(count, "set_buffer_count: count too large");
                return Err(Error::InvalidArgument(format!(
                    "buffer count {} exceeds the slot table ({})",
                    count, NUM_BUFFER_SLOTS
                )));
            }
            if core
                .slots
                .iter()
                .any(|slot| slot.state == BufferState::Dequeued)
            {
                error!("set_buffer_count: producer owns dequeued buffers");
                return Err(Error::InvalidOperation(
                    "buffer count cannot change while buffers are dequeued".into(),
                ));
            }

            if count == 0 {
                core.override_max_buffer_count = 0;
                self.dequeue_cond.notify_all();
                return Ok(());
            }

            // The override must leave room for the undequeued minimum.
            let min_buffer_count = core.min_max_buffer_count(false);
            if count < min_buffer_count {
                error!(count, min_buffer_count, "set_buffer_count: count too small");
                return Err(Error::InvalidArgument(format!(
                    "buffer count {} is less than the minimum {}",
                    count, min_buffer_count
                )));
            }

            let freed_any = core.slots.iter().any(|slot| slot.buffer.is_some());
            core.free_all_buffers();
            core.override_max_buffer_count = count;
            self.dequeue_cond.notify_all();
            debug!(count, "buffer count override set");

            if freed_any {
                core.consumer_listener.clone()
            } else {
                None
            }
        };

        if let Some(listener) = listener.and_then(|weak| weak.upgrade()) {
            listener.on_buffers_released();
        }
        Ok(())
    }

    /// Enable or disable the extra undequeued buffer that lets the
    /// producer run a frame ahead of the consumer.
    pub fn set_async_mode(&self, enabled: bool) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        if core.abandoned {
            error!("set_async_mode: buffer queue has been abandoned");
            return Err(Error::Abandoned);
        }
        core.use_async_buffer = enabled;
        // The derived maximum may have changed either way.
        self.dequeue_cond.notify_all();
        Ok(())
    }

    /// Read one of the queue's surface-wide values.
    pub fn query(&self, key: QueryKey) -> Result<u32> {
        let core = self.core.lock().unwrap();
        if core.abandoned {
            error!("query: buffer queue has been abandoned");
            return Err(Error::Abandoned);
        }
        let value = match key {
            QueryKey::DefaultWidth => core.default_width,
            QueryKey::DefaultHeight => core.default_height,
            QueryKey::DefaultFormat => core.default_format.as_raw(),
            QueryKey::MinUndequeuedBuffers => core.min_undequeued_buffer_count(false) as u32,
            QueryKey::ConsumerRunningBehind => u32::from(core.fifo.len() >= 2),
            QueryKey::ConsumerUsageBits => core.consumer_usage_bits.bits(),
        };
        Ok(value)
    }

    // ========================================================================
    // Consumer interface
    // ========================================================================

    /// Connect the consumer.
    ///
    /// The listener is held weakly: the queue never extends the
    /// consumer's lifetime, and callbacks silently no-op once the
    /// listener is gone.
    pub fn consumer_connect(
        &self,
        listener: Weak<dyn ConsumerListener>,
        controlled_by_app: bool,
    ) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        if core.abandoned {
            error!("consumer_connect: buffer queue has been abandoned");
            return Err(Error::Abandoned);
        }
        if core.consumer_listener.is_some() {
            return Err(Error::InvalidOperation(
                "consumer is already connected".into(),
            ));
        }
        core.consumer_listener = Some(listener);
        core.consumer_controlled_by_app = controlled_by_app;
        trace!(controlled_by_app, "consumer connected");
        Ok(())
    }

    /// Replace the consumer listener without reconnecting.
    pub fn set_consumer_listener(&self, listener: Weak<dyn ConsumerListener>) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        if core.abandoned {
            error!("set_consumer_listener: buffer queue has been abandoned");
            return Err(Error::Abandoned);
        }
        if core.consumer_listener.is_none() {
            return Err(Error::InvalidOperation("no consumer is connected".into()));
        }
        core.consumer_listener = Some(listener);
        Ok(())
    }

    /// Disconnect the consumer, abandoning the queue.
    pub fn consumer_disconnect(&self) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        if core.consumer_listener.is_none() {
            return Err(Error::InvalidOperation("no consumer is connected".into()));
        }

        core.abandoned = true;
        core.consumer_listener = None;
        core.fifo.clear();
        core.free_all_buffers();
        self.dequeue_cond.notify_all();
        debug!("consumer disconnected, queue abandoned");
        Ok(())
    }

    /// Take the next pending frame.
    ///
    /// When `present_when` is nonzero, the head is delivered only once
    /// its timestamp is due. The buffer handle is elided when the
    /// consumer has already received it for this slot.
    pub fn acquire_buffer(&self, present_when: ClockTime) -> Result<BufferItem> {
        let mut core = self.core.lock().unwrap();
        if core.abandoned {
            error!("acquire_buffer: buffer queue has been abandoned");
            return Err(Error::Abandoned);
        }

        let acquired_count = core
            .slots
            .iter()
            .filter(|slot| slot.state == BufferState::Acquired)
            .count();
        if acquired_count >= core.max_acquired_buffer_count {
            error!(
                acquired_count,
                max = core.max_acquired_buffer_count,
                "acquire_buffer: max acquired buffer count reached"
            );
            return Err(Error::InvalidOperation(format!(
                "max acquired buffer count ({}) already reached",
                core.max_acquired_buffer_count
            )));
        }

        match core.fifo.front() {
            None => return Err(Error::NoBufferAvailable),
            Some(front) if !present_when.is_zero() && front.timestamp > present_when => {
                trace!(
                    timestamp = %front.timestamp,
                    %present_when,
                    "acquire_buffer: head not yet due"
                );
                return Err(Error::NoBufferAvailable);
            }
            Some(_) => {}
        }
        let mut item = core.fifo.pop_front().ok_or(Error::NoBufferAvailable)?;

        if core.still_tracking(&item) {
            let slot = &mut core.slots[item.slot];
            // The consumer caches handles; re-sending one it has seen is
            // pure overhead.
            if slot.acquire_called {
                item.buffer = None;
            }
            slot.acquire_called = true;
            slot.state = BufferState::Acquired;
            slot.fence = Fence::no_fence();
        }

        metrics::record_frame_acquired();
        trace!(slot = item.slot, frame_number = item.frame_number, "acquired");
        Ok(item)
    }

    /// Return an acquired slot to the free pool.
    ///
    /// `frame_number` must match the slot's current frame; a mismatch
    /// means the release is stale (the slot was re-queued or reallocated
    /// since). A slot freed out from under the consumer (abandonment or
    /// buffer count change) is discarded silently.
    pub fn release_buffer(
        &self,
        slot: usize,
        frame_number: u64,
        display: DisplayId,
        fence: Fence,
    ) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        if slot >= NUM_BUFFER_SLOTS {
            return Err(Error::SlotOutOfRange {
                slot,
                max: NUM_BUFFER_SLOTS,
            });
        }

        let entry = &mut core.slots[slot];
        if entry.state == BufferState::Acquired {
            if entry.frame_number != frame_number {
                error!(
                    slot,
                    frame_number,
                    current = entry.frame_number,
                    "release_buffer: stale frame number"
                );
                return Err(Error::StaleRelease {
                    slot,
                    frame: frame_number,
                    current: entry.frame_number,
                });
            }
            entry.display = display;
            entry.fence = fence;
            entry.state = BufferState::Free;
            self.dequeue_cond.notify_all();
            trace!(slot, frame_number, "released");
            Ok(())
        } else if entry.needs_cleanup_on_release {
            // The slot was freed while the consumer held it; the buffer
            // is already gone and must not be resurrected.
            entry.needs_cleanup_on_release = false;
            trace!(slot, "release_buffer: discarding freed slot");
            Ok(())
        } else {
            error!(slot, state = ?entry.state, "release_buffer: not acquired");
            Err(Error::InvalidSlotState {
                slot,
                expected: BufferState::Acquired,
                actual: entry.state,
            })
        }
    }

    /// Set the geometry used when the producer dequeues with zero
    /// dimensions.
    pub fn set_default_buffer_size(&self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument(format!(
                "default buffer size must be nonzero: {}x{}",
                width, height
            )));
        }
        let mut core = self.core.lock().unwrap();
        core.default_width = width;
        core.default_height = height;
        Ok(())
    }

    /// Set the format used when the producer dequeues without one.
    pub fn set_default_buffer_format(&self, format: PixelFormat) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        core.default_format = format;
        Ok(())
    }

    /// Usage bits or'd into every producer allocation request.
    pub fn set_consumer_usage_bits(&self, usage: Usage) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        core.consumer_usage_bits = usage;
        Ok(())
    }

    /// Set how many buffers the consumer may hold acquired at once.
    ///
    /// Must be configured before a producer connects.
    pub fn set_max_acquired_buffer_count(&self, count: usize) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        if core.abandoned {
            error!("set_max_acquired_buffer_count: buffer queue has been abandoned");
            return Err(Error::Abandoned);
        }
        if !(1..=MAX_MAX_ACQUIRED_BUFFERS).contains(&count) {
            return Err(Error::InvalidArgument(format!(
                "max acquired buffer count {} outside [1, {}]",
                count, MAX_MAX_ACQUIRED_BUFFERS
            )));
        }
        if core.connected_api.is_some() {
            return Err(Error::InvalidOperation(
                "max acquired buffer count cannot change while a producer is connected".into(),
            ));
        }
        core.max_acquired_buffer_count = count;
        Ok(())
    }

    /// Raise or lower the default maximum buffer count (the ceiling used
    /// when the producer sets no override).
    pub fn set_default_max_buffer_count(&self, count: usize) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        let min_buffer_count = if core.use_async_buffer { 2 } else { 1 };
        if !(min_buffer_count..=NUM_BUFFER_SLOTS).contains(&count) {
            return Err(Error::InvalidArgument(format!(
                "default max buffer count {} outside [{}, {}]",
                count, min_buffer_count, NUM_BUFFER_SLOTS
            )));
        }
        core.default_max_buffer_count = count;
        self.dequeue_cond.notify_all();
        Ok(())
    }

    /// Name used in diagnostics.
    pub fn set_consumer_name(&self, name: impl Into<String>) {
        let mut core = self.core.lock().unwrap();
        core.consumer_name = name.into();
    }

    /// The queue's diagnostic name.
    pub fn consumer_name(&self) -> String {
        self.core.lock().unwrap().consumer_name.clone()
    }

    /// Hint the producer about the transform the consumer will apply, so
    /// it can render pre-rotated.
    pub fn set_transform_hint(&self, hint: Transform) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        core.transform_hint = hint;
        Ok(())
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Capture a consistent point-in-time view of the queue.
    pub fn snapshot(&self) -> QueueSnapshot {
        let core = self.core.lock().unwrap();
        QueueSnapshot {
            slots: core
                .slots
                .iter()
                .map(|slot| SlotSnapshot {
                    state: slot.state,
                    has_buffer: slot.buffer.is_some(),
                    frame_number: slot.frame_number,
                })
                .collect(),
            fifo_slots: core.fifo.iter().map(|item| item.slot).collect(),
            abandoned: core.abandoned,
        }
    }

    // ========================================================================
    // Dirty-region side channel
    // ========================================================================

    /// Record the dirty rectangle of a slot's pending content.
    pub fn update_dirty_region(&self, slot: usize, rect: Rect) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        if slot >= NUM_BUFFER_SLOTS {
            return Err(Error::SlotOutOfRange {
                slot,
                max: NUM_BUFFER_SLOTS,
            });
        }
        trace!(slot, %rect, "update_dirty_region");
        core.dirty_region[slot] = rect;
        Ok(())
    }

    /// Latch a slot's dirty rectangle as the current dirty region and
    /// clear the slot's.
    pub fn set_current_dirty_region(&self, slot: usize) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        if slot >= NUM_BUFFER_SLOTS {
            return Err(Error::SlotOutOfRange {
                slot,
                max: NUM_BUFFER_SLOTS,
            });
        }
        core.current_dirty_region = core.dirty_region[slot];
        core.dirty_region[slot] = Rect::EMPTY;
        Ok(())
    }

    /// The most recently latched dirty region.
    pub fn current_dirty_region(&self) -> Rect {
        self.core.lock().unwrap().current_dirty_region
    }
}
