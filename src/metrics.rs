//! Metrics collection using metrics-rs.

use metrics::Unit;
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const FRAMES_QUEUED: &str = "flipchain_frames_queued";
const FRAMES_DROPPED: &str = "flipchain_frames_dropped";
const FRAMES_ACQUIRED: &str = "flipchain_frames_acquired";
const BUFFERS_ALLOCATED: &str = "flipchain_buffers_allocated";
const FENCE_WAIT_TIMEOUTS: &str = "flipchain_fence_wait_timeouts";

/// Initialize metric descriptions.
///
/// Call once at application startup before using any metrics. Safe to
/// call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        FRAMES_QUEUED,
        Unit::Count,
        "Total frames queued by the producer"
    );
    metrics::describe_counter!(
        FRAMES_DROPPED,
        Unit::Count,
        "Frames replaced in place at the FIFO head (drop-on-overflow)"
    );
    metrics::describe_counter!(
        FRAMES_ACQUIRED,
        Unit::Count,
        "Frames acquired by the consumer"
    );
    metrics::describe_counter!(
        BUFFERS_ALLOCATED,
        Unit::Count,
        "Graphics buffer (re)allocations"
    );
    metrics::describe_counter!(
        FENCE_WAIT_TIMEOUTS,
        Unit::Count,
        "Bounded fence waits that expired before the fence signaled"
    );
}

/// Record a queued frame.
pub(crate) fn record_frame_queued() {
    metrics::counter!(FRAMES_QUEUED).increment(1);
}

/// Record a frame replaced at the FIFO head.
pub(crate) fn record_frame_dropped() {
    metrics::counter!(FRAMES_DROPPED).increment(1);
}

/// Record a frame handed to the consumer.
pub(crate) fn record_frame_acquired() {
    metrics::counter!(FRAMES_ACQUIRED).increment(1);
}

/// Record a buffer (re)allocation.
pub(crate) fn record_buffer_allocated() {
    metrics::counter!(BUFFERS_ALLOCATED).increment(1);
}

/// Record an expired bounded fence wait.
pub(crate) fn record_fence_wait_timeout() {
    metrics::counter!(FENCE_WAIT_TIMEOUTS).increment(1);
}
