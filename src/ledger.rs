//! Ownership tracking for buffers in flight.
//!
//! The sender side keeps a [`PendingLedger`]: every submitted buffer is
//! held (keeping its descriptors open) until the peer acknowledges it with
//! a return message. The receiver side keeps an [`FdCache`]: descriptors
//! that arrived for pooled buffers, keyed by the sender's buffer id, so a
//! later message naming the same id needs no new descriptor transfer.

use crate::buffer::{BufferId, LogicalBuffer};
use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::os::fd::OwnedFd;
use std::sync::Arc;
use tracing::{debug, warn};

/// Sender-side ledger of buffers awaiting acknowledgment.
///
/// A multi-block buffer occupies one entry keyed by its primary id (the id
/// of its first fd-backed block); the remaining block ids alias the primary
/// so a return naming any of them resolves to the same entry.
#[derive(Default)]
pub struct PendingLedger {
    held: HashMap<BufferId, LogicalBuffer>,
    aliases: HashMap<BufferId, BufferId>,
    /// Ids of pooled buffers whose descriptors the peer has already
    /// received on this connection.
    pooled_sent: HashSet<BufferId>,
}

impl PendingLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a send of `id` must carry its descriptor.
    ///
    /// True always for non-pooled buffers; for pooled buffers only until
    /// the first transfer of that id on this connection.
    pub fn needs_fd(&self, id: BufferId, pooled: bool) -> bool {
        !pooled || !self.pooled_sent.contains(&id)
    }

    /// Record `buffer` as in flight under `ids` (its fd-backed block ids,
    /// in block order).
    ///
    /// Returns `true` if this send must carry the descriptors: always for
    /// non-pooled buffers, and for pooled buffers only the first time this
    /// id is seen on the connection.
    pub fn register(&mut self, ids: &[BufferId], buffer: LogicalBuffer) -> bool {
        let pooled = buffer.is_pooled();
        let primary = match ids.first() {
            Some(&id) => id,
            // Nothing fd-backed (pure text); nothing to track.
            None => return false,
        };

        for &id in &ids[1..] {
            self.aliases.insert(id, primary);
        }
        if let Some(evicted) = self.held.insert(primary, buffer) {
            // A pooled buffer can only be resubmitted under the same id
            // after the peer returned it; seeing it here means an ack was
            // lost or the peer misbehaved.
            warn!(id = %primary, "buffer id resubmitted while still outstanding, dropping older hold");
            drop(evicted);
        }

        if pooled {
            self.pooled_sent.insert(primary)
        } else {
            true
        }
    }

    /// Undo a registration whose message never reached the peer.
    ///
    /// Drops the held buffer and forgets the descriptor-transfer marker,
    /// so the next send of this id transfers the descriptor again instead
    /// of assuming the peer cached one it never received.
    pub fn rollback(&mut self, ids: &[BufferId]) {
        for &id in ids {
            let primary = self.aliases.remove(&id).unwrap_or(id);
            self.held.remove(&primary);
        }
        if let Some(&primary) = ids.first() {
            self.pooled_sent.remove(&primary);
        }
    }

    /// Release the buffers named by a return message.
    ///
    /// Ids aliasing an already-released entry are ignored: one return
    /// message names every block id of a multi-block buffer, and the first
    /// of them frees the whole entry.
    pub fn release(&mut self, ids: &[BufferId]) -> usize {
        let mut released = 0;
        for &id in ids {
            let primary = self.aliases.remove(&id).unwrap_or(id);
            if self.held.remove(&primary).is_some() {
                debug!(id = %primary, "buffer returned by peer");
                released += 1;
            }
        }
        released
    }

    /// Number of buffers in flight.
    pub fn outstanding(&self) -> usize {
        self.held.len()
    }

    /// Drop every held buffer and forget the descriptor-transfer history.
    ///
    /// Called on disconnect: a reconnecting peer starts with an empty
    /// descriptor cache, so pooled buffers must send their descriptors
    /// again.
    pub fn drain(&mut self) -> usize {
        let n = self.held.len();
        self.held.clear();
        self.aliases.clear();
        self.pooled_sent.clear();
        if n > 0 {
            debug!(count = n, "drained outstanding buffers");
        }
        n
    }
}

/// Receiver-side cache of descriptors for pooled buffers.
///
/// Descriptors are held as `Arc<OwnedFd>` so reconstructed buffers can
/// share them; the descriptor closes when the cache entry and every
/// buffer referencing it are gone.
#[derive(Default)]
pub struct FdCache {
    fds: HashMap<BufferId, Arc<OwnedFd>>,
}

impl FdCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache `fd` under the sender's `id`, replacing any stale entry.
    pub fn insert(&mut self, id: BufferId, fd: OwnedFd) -> Arc<OwnedFd> {
        let fd = Arc::new(fd);
        if self.fds.insert(id, Arc::clone(&fd)).is_some() {
            warn!(id = %id, "descriptor re-sent for cached buffer id, replacing");
        }
        fd
    }

    /// Look up the cached descriptor for `id`.
    ///
    /// A miss means the sender believed this connection had already seen
    /// the descriptor when it had not (for example after a reconnect the
    /// sender did not notice).
    pub fn get(&self, id: BufferId) -> Result<Arc<OwnedFd>> {
        self.fds
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownBufferId(id.0))
    }

    /// Number of cached descriptors.
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Drop every cached descriptor. Called on disconnect.
    pub fn clear(&mut self) {
        if !self.fds.is_empty() {
            debug!(count = self.fds.len(), "clearing descriptor cache");
        }
        self.fds.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{MemoryBlock, PixelFormat, TensorType};
    use rustix::fs::{memfd_create, MemfdFlags};
    use smallvec::SmallVec;
    use std::os::fd::AsRawFd;

    fn memfd() -> Arc<OwnedFd> {
        Arc::new(memfd_create("test-ledger", MemfdFlags::CLOEXEC).unwrap())
    }

    fn frame_buffer(fd: Arc<OwnedFd>, pooled: bool) -> LogicalBuffer {
        LogicalBuffer::new()
            .with_block(MemoryBlock::Frame {
                fd,
                format: PixelFormat::NV12,
                width: 64,
                height: 64,
                planes: SmallVec::new(),
                flags: 0,
                size: 4096,
                maxsize: 4096,
            })
            .with_pool_flag(pooled)
    }

    #[test]
    fn test_pooled_fd_sent_once_per_connection() {
        let mut ledger = PendingLedger::new();
        let fd = memfd();
        let id = BufferId(fd.as_ref().as_raw_fd());

        // First submit transfers the descriptor.
        assert!(ledger.register(&[id], frame_buffer(Arc::clone(&fd), true)));
        assert_eq!(ledger.release(&[id]), 1);

        // Resubmit after return: descriptor already cached on the peer.
        assert!(!ledger.register(&[id], frame_buffer(Arc::clone(&fd), true)));
        assert_eq!(ledger.release(&[id]), 1);

        // A drain (disconnect) forgets the history.
        ledger.drain();
        assert!(ledger.register(&[id], frame_buffer(fd, true)));
    }

    #[test]
    fn test_non_pooled_always_transfers() {
        let mut ledger = PendingLedger::new();
        let fd = memfd();
        let id = BufferId(fd.as_ref().as_raw_fd());

        assert!(ledger.register(&[id], frame_buffer(Arc::clone(&fd), false)));
        ledger.release(&[id]);
        assert!(ledger.register(&[id], frame_buffer(fd, false)));
    }

    #[test]
    fn test_multi_block_release_by_any_id() {
        let mut ledger = PendingLedger::new();
        let (a, b) = (memfd(), memfd());
        let (id_a, id_b) = (
            BufferId(a.as_ref().as_raw_fd()),
            BufferId(b.as_ref().as_raw_fd()),
        );

        let buffer = LogicalBuffer::new()
            .with_block(MemoryBlock::Tensor {
                fd: a,
                ty: TensorType::F32,
                dims: SmallVec::new(),
                size: 16,
                maxsize: 16,
            })
            .with_block(MemoryBlock::Tensor {
                fd: b,
                ty: TensorType::F32,
                dims: SmallVec::new(),
                size: 16,
                maxsize: 16,
            });

        ledger.register(&[id_a, id_b], buffer);
        assert_eq!(ledger.outstanding(), 1);

        // A return names every block id; the entry releases once.
        assert_eq!(ledger.release(&[id_a, id_b]), 1);
        assert_eq!(ledger.outstanding(), 0);
    }

    #[test]
    fn test_rollback_retransfers_descriptor() {
        let mut ledger = PendingLedger::new();
        let fd = memfd();
        let id = BufferId(fd.as_ref().as_raw_fd());

        // The send carrying the descriptor fails; the registration is
        // rolled back.
        assert!(ledger.register(&[id], frame_buffer(Arc::clone(&fd), true)));
        ledger.rollback(&[id]);
        assert_eq!(ledger.outstanding(), 0);

        // The next send must carry the descriptor again; the peer never
        // got one to cache.
        assert!(ledger.needs_fd(id, true));
        assert!(ledger.register(&[id], frame_buffer(fd, true)));
    }

    #[test]
    fn test_release_unknown_id_is_harmless() {
        let mut ledger = PendingLedger::new();
        assert_eq!(ledger.release(&[BufferId(99)]), 0);
    }

    #[test]
    fn test_cache_hit_and_miss() {
        let mut cache = FdCache::new();
        let fd = memfd_create("test-cache", MemfdFlags::CLOEXEC).unwrap();
        cache.insert(BufferId(7), fd);

        assert!(cache.get(BufferId(7)).is_ok());
        assert!(matches!(cache.get(BufferId(8)), Err(Error::UnknownBufferId(8))));

        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get(BufferId(7)).is_err());
    }

    #[test]
    fn test_cached_fd_survives_clear_while_referenced() {
        let mut cache = FdCache::new();
        let fd = memfd_create("test-refs", MemfdFlags::CLOEXEC).unwrap();
        let held = cache.insert(BufferId(3), fd);

        cache.clear();

        // The Arc keeps the descriptor alive past the cache.
        assert!(held.as_raw_fd() >= 0);
    }
}
