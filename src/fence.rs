//! GPU synchronization fences.
//!
//! A [`Fence`] is an opaque token attached to a buffer transition. The GPU
//! (or a test harness) signals it when reads/writes of the buffer have
//! retired; waiting on it blocks until then. Fences are cheap to clone and
//! clones share state, so a fence can be handed to the next owner of a
//! buffer while the queue retains a handle to wait on.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Opaque identifier of the display/device a fence was submitted on.
///
/// Stored alongside the release fence as context; the queue never
/// interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DisplayId(pub u64);

impl DisplayId {
    /// No display.
    pub const NONE: Self = Self(0);
}

struct FenceState {
    signaled: Mutex<bool>,
    cond: Condvar,
}

/// A shareable synchronization token.
///
/// Three observable states: *no fence* (nothing to wait for), *pending*,
/// and *signaled*. Waiting on a no-fence or signaled fence returns
/// immediately.
#[derive(Clone, Default)]
pub struct Fence {
    inner: Option<Arc<FenceState>>,
}

impl Fence {
    /// A fence with nothing behind it. Waiting returns immediately.
    pub fn no_fence() -> Self {
        Self { inner: None }
    }

    /// A pending fence. It becomes passable once [`Fence::signal`] is
    /// called on it or any of its clones.
    pub fn new() -> Self {
        Self {
            inner: Some(Arc::new(FenceState {
                signaled: Mutex::new(false),
                cond: Condvar::new(),
            })),
        }
    }

    /// A fence that is already signaled.
    pub fn signaled() -> Self {
        Self {
            inner: Some(Arc::new(FenceState {
                signaled: Mutex::new(true),
                cond: Condvar::new(),
            })),
        }
    }

    /// True if this fence carries a real token (pending or signaled).
    pub fn is_valid(&self) -> bool {
        self.inner.is_some()
    }

    /// True if waiting on this fence would not block.
    pub fn is_signaled(&self) -> bool {
        match &self.inner {
            Some(state) => *state.signaled.lock().unwrap(),
            None => true,
        }
    }

    /// Signal the fence, waking all waiters. Signaling a no-fence or an
    /// already-signaled fence is a no-op.
    pub fn signal(&self) {
        if let Some(state) = &self.inner {
            let mut signaled = state.signaled.lock().unwrap();
            if !*signaled {
                *signaled = true;
                state.cond.notify_all();
            }
        }
    }

    /// Wait for the fence with a bounded timeout.
    ///
    /// Returns `true` once the fence is signaled (immediately for a
    /// no-fence), `false` if the timeout expired first.
    pub fn wait(&self, timeout: Duration) -> bool {
        let state = match &self.inner {
            Some(state) => state,
            None => return true,
        };

        let deadline = Instant::now() + timeout;
        let mut signaled = state.signaled.lock().unwrap();
        while !*signaled {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, result) = state.cond.wait_timeout(signaled, remaining).unwrap();
            signaled = guard;
            if result.timed_out() && !*signaled {
                return false;
            }
        }
        true
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            None => write!(f, "Fence(none)"),
            Some(_) => write!(f, "Fence(signaled={})", self.is_signaled()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_no_fence_is_passable() {
        let fence = Fence::no_fence();
        assert!(!fence.is_valid());
        assert!(fence.is_signaled());
        assert!(fence.wait(Duration::from_millis(1)));
    }

    #[test]
    fn test_pending_fence_times_out() {
        let fence = Fence::new();
        assert!(fence.is_valid());
        assert!(!fence.is_signaled());
        assert!(!fence.wait(Duration::from_millis(10)));
    }

    #[test]
    fn test_signal_wakes_waiter() {
        let fence = Fence::new();
        let waiter = fence.clone();

        let handle = thread::spawn(move || waiter.wait(Duration::from_secs(5)));

        thread::sleep(Duration::from_millis(20));
        fence.signal();

        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_clones_share_state() {
        let fence = Fence::new();
        let clone = fence.clone();
        clone.signal();
        assert!(fence.is_signaled());
        assert!(fence.wait(Duration::ZERO));
    }

    #[test]
    fn test_presignaled() {
        let fence = Fence::signaled();
        assert!(fence.is_valid());
        assert!(fence.wait(Duration::ZERO));
    }
}
