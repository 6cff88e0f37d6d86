//! Connection lifecycle shared between both engines.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// State of an engine's connection to its peer.
///
/// Both engines drive the same loop shape on their dedicated thread:
/// `TryConnect -> Running -> Disconnecting -> TryConnect`, terminating in
/// `Stopped` once a stop has been requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// No connection; attempting (or waiting) to establish one.
    TryConnect,
    /// Connected and exchanging messages.
    Running,
    /// Tearing the connection down and releasing tracked resources.
    Disconnecting,
    /// The engine thread has exited.
    Stopped,
}

/// A cancellable stop signal shared between an engine thread and its
/// public handle.
///
/// Retry sleeps go through [`StopToken::sleep`] so that `stop()` interrupts
/// them promptly instead of waiting out the full interval.
#[derive(Clone)]
pub struct StopToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopToken {
    /// Create a token in the not-stopped state.
    pub fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    /// Request a stop. Idempotent and safe to call from any thread.
    pub fn request(&self) {
        let (lock, cond) = &*self.inner;
        let mut stopped = lock.lock().unwrap();
        *stopped = true;
        cond.notify_all();
    }

    /// Whether a stop has been requested.
    pub fn is_requested(&self) -> bool {
        *self.inner.0.lock().unwrap()
    }

    /// Sleep for up to `dur`, waking early if a stop is requested.
    ///
    /// Returns `true` if the sleep was interrupted by a stop request.
    pub fn sleep(&self, dur: Duration) -> bool {
        let (lock, cond) = &*self.inner;
        let mut stopped = lock.lock().unwrap();
        let deadline = std::time::Instant::now() + dur;
        while !*stopped {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _timeout) = cond.wait_timeout(stopped, deadline - now).unwrap();
            stopped = guard;
        }
        true
    }
}

impl Default for StopToken {
    fn default() -> Self {
        Self::new()
    }
}
