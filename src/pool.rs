//! Receiver-side shell pool.
//!
//! Reconstructed buffers are cheap shells around descriptors the sender
//! still owns, but each shell held downstream keeps a sender buffer
//! unacknowledged. The pool caps how many shells are out at once; when it
//! is exhausted the receiver hands out an unpooled shell instead, which
//! costs nothing extra but makes the pressure visible in the stats.

use std::sync::{Arc, Condvar, Mutex};
use tracing::debug;

/// Default number of shells out at once.
pub const DEFAULT_SHELL_CAPACITY: usize = 3;

#[derive(Default)]
struct PoolState {
    in_use: usize,
    overflow_grants: u64,
}

/// A counted pool of buffer shells.
#[derive(Clone)]
pub struct ShellPool {
    inner: Arc<(Mutex<PoolState>, Condvar)>,
    capacity: usize,
}

impl ShellPool {
    /// Create a pool with `capacity` shells.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new((Mutex::new(PoolState::default()), Condvar::new())),
            capacity: capacity.max(1),
        }
    }

    /// Take a shell if one is free.
    ///
    /// On exhaustion returns `None` and counts an overflow grant; the
    /// caller proceeds with an unpooled shell.
    pub fn try_acquire(&self) -> Option<ShellTicket> {
        let (lock, _) = &*self.inner;
        let mut state = lock.lock().unwrap();
        if state.in_use < self.capacity {
            state.in_use += 1;
            Some(ShellTicket {
                pool: Arc::clone(&self.inner),
            })
        } else {
            state.overflow_grants += 1;
            debug!(capacity = self.capacity, "shell pool exhausted, granting unpooled shell");
            None
        }
    }

    /// Number of shells currently out.
    pub fn in_use(&self) -> usize {
        self.inner.0.lock().unwrap().in_use
    }

    /// Number of times the pool was exhausted and an unpooled shell was
    /// granted instead.
    pub fn overflow_grants(&self) -> u64 {
        self.inner.0.lock().unwrap().overflow_grants
    }
}

impl Default for ShellPool {
    fn default() -> Self {
        Self::new(DEFAULT_SHELL_CAPACITY)
    }
}

/// RAII grant of one pool shell; dropping it frees the slot.
pub struct ShellTicket {
    pool: Arc<(Mutex<PoolState>, Condvar)>,
}

impl Drop for ShellTicket {
    fn drop(&mut self) {
        let (lock, cond) = &*self.pool;
        let mut state = lock.lock().unwrap();
        state.in_use = state.in_use.saturating_sub(1);
        cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tickets_return_on_drop() {
        let pool = ShellPool::new(2);

        let a = pool.try_acquire().unwrap();
        let b = pool.try_acquire().unwrap();
        assert_eq!(pool.in_use(), 2);
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.overflow_grants(), 1);

        drop(a);
        assert_eq!(pool.in_use(), 1);
        let c = pool.try_acquire().unwrap();
        assert_eq!(pool.in_use(), 2);

        drop(b);
        drop(c);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_zero_capacity_rounds_up_to_one() {
        let pool = ShellPool::new(0);
        let ticket = pool.try_acquire();
        assert!(ticket.is_some());
        assert!(pool.try_acquire().is_none());
    }
}
