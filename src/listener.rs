//! Consumer-side event notification.

/// Events delivered to the consumer as frames and buffers change state.
///
/// The queue holds the listener as a [`Weak`] back-reference so the
/// consumer's lifetime is never extended by the queue: each dispatch
/// upgrades for the duration of the call and silently drops the
/// notification if the consumer is gone. Callbacks are always invoked
/// with the queue mutex released, so implementations may call back into
/// the queue.
///
/// [`Weak`]: std::sync::Weak
pub trait ConsumerListener: Send + Sync {
    /// A frame was appended to the FIFO. Fired once per append (not for
    /// in-place head replacement).
    fn on_frame_available(&self);

    /// One or more buffers left the pool (buffer count change or
    /// disconnect); the consumer should drop cached handles.
    fn on_buffers_released(&self);

    /// The producer attached or detached a sideband stream.
    fn on_sideband_stream_changed(&self);
}
