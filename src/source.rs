//! Receiver engine: accepts one peer connection, reconstructs logical
//! buffers from wire data and descriptors, and returns them to the sender
//! once the local consumer is done.
//!
//! The accept loop runs on a dedicated engine thread; [`SocketSource::next_buffer`]
//! runs on the caller's thread and performs the receive itself, bounded by
//! the caller's timeout. Returning a buffer to the sender is automatic: every
//! fd-backed buffer carries a [`ReleaseGuard`] whose drop sends the return
//! message.

use crate::buffer::{BufferId, LogicalBuffer, MemoryBlock, MAX_MEM_BLOCKS};
use crate::error::{Error, Result};
use crate::ledger::FdCache;
use crate::pool::{ShellPool, ShellTicket, DEFAULT_SHELL_CAPACITY};
use crate::state::{ConnState, StopToken};
use crate::wire::{self, socket, BlockPayload, ControlKind, PayloadSet};
use smallvec::SmallVec;
use std::os::fd::{AsFd, OwnedFd};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Default socket poll timeout.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_micros(1000);

// How long the engine blocks in one accept poll before rechecking the
// stop flag.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Configuration for a [`SocketSource`].
#[derive(Debug, Clone)]
pub struct SourceConfig {
    path: PathBuf,
    poll_timeout: Duration,
    shell_capacity: usize,
}

impl SourceConfig {
    /// Configuration for the channel at `path` with defaults elsewhere.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            shell_capacity: DEFAULT_SHELL_CAPACITY,
        }
    }

    /// Set the socket poll timeout used inside [`SocketSource::next_buffer`].
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set the number of pooled buffer shells.
    pub fn with_shell_capacity(mut self, capacity: usize) -> Self {
        self.shell_capacity = capacity;
        self
    }
}

struct Shared {
    state: ConnState,
    conn: Option<Arc<OwnedFd>>,
    cache: FdCache,
}

/// Consumer-side endpoint of the channel.
pub struct SocketSource {
    shared: Arc<(Mutex<Shared>, Condvar)>,
    stop: StopToken,
    engine: Option<JoinHandle<()>>,
    pool: ShellPool,
    poll_timeout: Duration,
}

impl SocketSource {
    /// Bind and listen at the configured path, then spawn the accept
    /// thread. Binding happens synchronously so a path collision fails
    /// `start` instead of surfacing later.
    pub fn start(config: SourceConfig) -> Result<Self> {
        let listener = socket::Listener::bind(&config.path)
            .map_err(|e| Error::StartFailed(format!("bind {}: {}", config.path.display(), e)))?;

        let shared = Arc::new((
            Mutex::new(Shared {
                state: ConnState::TryConnect,
                conn: None,
                cache: FdCache::new(),
            }),
            Condvar::new(),
        ));
        let stop = StopToken::new();

        let engine = {
            let shared = Arc::clone(&shared);
            let stop = stop.clone();
            thread::Builder::new()
                .name("fdlink-source".into())
                .spawn(move || accept_loop(&shared, &stop, listener))
                .map_err(|e| Error::StartFailed(format!("engine thread: {}", e)))?
        };

        info!(path = %config.path.display(), "source started");
        Ok(Self {
            shared,
            stop,
            engine: Some(engine),
            pool: ShellPool::new(config.shell_capacity),
            poll_timeout: config.poll_timeout,
        })
    }

    /// Receive the next logical buffer.
    ///
    /// Waits for a connection if none is up, then polls the socket;
    /// returns [`Error::Timeout`] once `timeout` elapses without a data
    /// message. A zero `timeout` blocks without bound. Malformed messages
    /// are dropped without surfacing to the caller; end of stream and
    /// shutdown surface as [`Error::Eos`] and [`Error::Flushing`].
    pub fn next_buffer(&self, timeout: Duration) -> Result<LogicalBuffer> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

        loop {
            if self.stop.is_requested() {
                return Err(Error::Flushing);
            }

            let conn = match self.wait_for_conn(deadline)? {
                Some(conn) => conn,
                None => return Err(Error::Timeout),
            };

            let slice = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(Error::Timeout);
                    }
                    self.poll_timeout.min(d - now)
                }
                None => self.poll_timeout,
            };

            match socket::wait_readable(conn.as_fd(), slice)? {
                socket::Readiness::TimedOut => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(Error::Timeout);
                    }
                }
                socket::Readiness::Hangup => self.handle_disconnect(),
                socket::Readiness::Ready => match socket::recv_message(conn.as_fd())? {
                    None => self.handle_disconnect(),
                    Some((bytes, fds)) => match wire::decode(&bytes) {
                        Ok(set) => {
                            if let Some(outcome) = self.dispatch(&conn, set, fds)? {
                                return Ok(outcome);
                            }
                        }
                        Err(e) => warn!(error = %e, "dropping malformed message"),
                    },
                },
            }
        }
    }

    /// Drain buffered inbound messages, acknowledging each data message
    /// so the sender's ledger is not left holding buffers that will never
    /// be consumed. Stops at the first timeout, hangup, or socket error.
    pub fn flush(&self) -> Result<()> {
        let conn = match self.shared.0.lock().unwrap().conn.clone() {
            Some(conn) => conn,
            None => return Ok(()),
        };

        loop {
            match socket::wait_readable(conn.as_fd(), self.poll_timeout) {
                Ok(socket::Readiness::Ready) => {}
                Ok(_) | Err(_) => return Ok(()),
            }
            let (bytes, fds) = match socket::recv_message(conn.as_fd()) {
                Ok(Some(msg)) => msg,
                Ok(None) | Err(_) => return Ok(()),
            };
            drop(fds);
            let set = match wire::decode(&bytes) {
                Ok(set) => set,
                Err(_) => continue,
            };
            if let Some(info) = set.buffer_info {
                if !info.buf_ids.is_empty() {
                    debug!(ids = ?info.buf_ids, "acknowledging flushed buffer");
                    send_return(&conn, &info.buf_ids);
                }
            }
        }
    }

    /// Whether a peer is currently connected.
    pub fn is_connected(&self) -> bool {
        self.shared.0.lock().unwrap().state == ConnState::Running
    }

    /// Number of descriptors cached for pooled buffer reuse.
    pub fn cached_fds(&self) -> usize {
        self.shared.0.lock().unwrap().cache.len()
    }

    /// The shell pool backing reconstructed buffers.
    pub fn pool(&self) -> &ShellPool {
        &self.pool
    }

    /// Stop the engine: send a best-effort disconnect to the peer, wake
    /// the accept loop, drop cached descriptors, and join the thread.
    pub fn stop(&mut self) {
        self.stop.request();

        // Acknowledge anything still queued on the socket so the sender's
        // ledger drains before we go.
        let _ = self.flush();

        let conn = {
            let (lock, cond) = &*self.shared;
            let mut shared = lock.lock().unwrap();
            cond.notify_all();
            shared.conn.take()
        };
        if let Some(conn) = conn {
            if let Ok(bytes) = wire::encode(&PayloadSet::control(ControlKind::Disconnect)) {
                let _ = socket::send_message(conn.as_fd(), &bytes, &[]);
            }
        }

        if let Some(engine) = self.engine.take() {
            let _ = engine.join();
        }

        let mut shared = self.shared.0.lock().unwrap();
        shared.cache.clear();
        shared.state = ConnState::Stopped;
    }

    fn wait_for_conn(&self, deadline: Option<Instant>) -> Result<Option<Arc<OwnedFd>>> {
        let (lock, cond) = &*self.shared;
        let mut shared = lock.lock().unwrap();
        loop {
            if let Some(ref conn) = shared.conn {
                return Ok(Some(Arc::clone(conn)));
            }
            if shared.state == ConnState::Stopped || self.stop.is_requested() {
                return Err(Error::Flushing);
            }
            let wait = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Ok(None);
                    }
                    (d - now).min(ACCEPT_POLL)
                }
                None => ACCEPT_POLL,
            };
            let (guard, _) = cond.wait_timeout(shared, wait).unwrap();
            shared = guard;
        }
    }

    /// Handle one decoded message. Returns the reconstructed buffer for
    /// data messages, `None` for messages that only advance state.
    fn dispatch(
        &self,
        conn: &Arc<OwnedFd>,
        set: PayloadSet,
        fds: Vec<OwnedFd>,
    ) -> Result<Option<LogicalBuffer>> {
        match set.control {
            Some(ControlKind::Eos) => return Err(Error::Eos),
            Some(ControlKind::Disconnect) => {
                debug!("peer requested disconnect");
                self.handle_disconnect();
                return Ok(None);
            }
            None => {}
        }

        if set.return_ids.is_some() {
            warn!("unexpected return message on receiver side, ignoring");
            return Ok(None);
        }

        let info = match set.buffer_info {
            Some(info) => info,
            None => return Ok(None),
        };

        match self.reconstruct(conn, &info, set.blocks, set.metas, fds) {
            Ok(buffer) => Ok(Some(buffer)),
            // Per-message decode failures drop the message, not the
            // connection.
            Err(e @ (Error::UnknownBufferId(_) | Error::MalformedMessage(_))) => {
                warn!(error = %e, "dropping undecodable buffer message");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn reconstruct(
        &self,
        conn: &Arc<OwnedFd>,
        info: &wire::BufferInfoPayload,
        blocks: Vec<BlockPayload>,
        metas: Vec<crate::meta::MetaRecord>,
        fds: Vec<OwnedFd>,
    ) -> Result<LogicalBuffer> {
        let fd_backed = blocks
            .iter()
            .filter(|b| !matches!(b, BlockPayload::Text(_)))
            .count();
        if fd_backed != info.buf_ids.len() {
            return Err(Error::MalformedMessage(format!(
                "{} fd-backed blocks but {} buffer ids",
                fd_backed,
                info.buf_ids.len()
            )));
        }

        let mut shared = self.shared.0.lock().unwrap();
        let mut incoming = fds.into_iter();
        let mut buffer = LogicalBuffer::new().with_pool_flag(info.use_buffer_pool);
        buffer.pts = wire::wire_to_dur(info.pts);
        buffer.dts = wire::wire_to_dur(info.dts);
        buffer.duration = wire::wire_to_dur(info.duration);

        let mut next_id = info.buf_ids.iter().copied();
        for block in blocks {
            match block {
                BlockPayload::Text(contents) => buffer.push_block(MemoryBlock::Text(contents)),
                BlockPayload::Tensor { ty, dims, size, maxsize } => {
                    let id = next_id
                        .next()
                        .ok_or_else(|| Error::MalformedMessage("missing buffer id".into()))?;
                    let fd = self.block_fd(&mut shared, BufferId(id), &mut incoming, info.use_buffer_pool)?;
                    buffer.push_block(MemoryBlock::Tensor {
                        fd,
                        ty,
                        dims,
                        size: size as usize,
                        maxsize: maxsize as usize,
                    });
                }
                BlockPayload::Frame { width, height, format, planes, flags, size, maxsize } => {
                    let id = next_id
                        .next()
                        .ok_or_else(|| Error::MalformedMessage("missing buffer id".into()))?;
                    let fd = self.block_fd(&mut shared, BufferId(id), &mut incoming, info.use_buffer_pool)?;
                    buffer.push_block(MemoryBlock::Frame {
                        fd,
                        format,
                        width,
                        height,
                        planes,
                        flags,
                        size: size as usize,
                        maxsize: maxsize as usize,
                    });
                }
            }
        }

        for meta in metas {
            trace!(kind = meta.kind(), "attaching metadata record");
            buffer.push_meta(meta);
        }

        if !info.buf_ids.is_empty() {
            let shell = info.use_buffer_pool.then(|| self.pool.try_acquire()).flatten();
            buffer.set_release_guard(ReleaseGuard {
                socket: Arc::clone(conn),
                ids: info.buf_ids.clone(),
                _shell: shell,
            });
        }

        Ok(buffer)
    }

    /// Resolve the descriptor for one fd-backed block: take the next
    /// transferred descriptor when this message carried them, otherwise
    /// fall back to the cache (pooled reuse).
    fn block_fd(
        &self,
        shared: &mut Shared,
        id: BufferId,
        incoming: &mut std::vec::IntoIter<OwnedFd>,
        pooled: bool,
    ) -> Result<Arc<OwnedFd>> {
        match incoming.next() {
            Some(fd) => {
                if pooled {
                    // Cache for later messages that name this id without
                    // resending the descriptor.
                    Ok(shared.cache.insert(id, fd))
                } else {
                    Ok(Arc::new(fd))
                }
            }
            None => shared.cache.get(id),
        }
    }

    fn handle_disconnect(&self) {
        let (lock, cond) = &*self.shared;
        let mut shared = lock.lock().unwrap();
        if shared.conn.take().is_some() {
            info!("connection closed, waiting for a new peer");
        }
        shared.cache.clear();
        shared.state = ConnState::TryConnect;
        cond.notify_all();
    }
}

impl Drop for SocketSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(shared: &(Mutex<Shared>, Condvar), stop: &StopToken, listener: socket::Listener) {
    let (lock, cond) = shared;

    loop {
        if stop.is_requested() {
            break;
        }

        // Only one peer at a time; park until the current connection is
        // gone before accepting another.
        {
            let mut s = lock.lock().unwrap();
            while s.conn.is_some() && !stop.is_requested() {
                let (guard, _) = cond.wait_timeout(s, ACCEPT_POLL).unwrap();
                s = guard;
            }
            if stop.is_requested() {
                break;
            }
        }

        match listener.accept_timeout(ACCEPT_POLL) {
            Ok(Some(conn)) => {
                info!("peer connected");
                let mut s = lock.lock().unwrap();
                s.conn = Some(Arc::new(conn));
                s.state = ConnState::Running;
                cond.notify_all();
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "accept failed");
                stop.sleep(ACCEPT_POLL);
            }
        }
    }

    let mut s = lock.lock().unwrap();
    s.state = ConnState::Stopped;
    cond.notify_all();
    debug!("source engine stopped");
}

fn send_return(conn: &Arc<OwnedFd>, ids: &[i32]) {
    let set = PayloadSet::return_buffer(ids.iter().copied().collect());
    match wire::encode(&set) {
        Ok(bytes) => {
            if let Err(e) = socket::send_message(conn.as_fd(), &bytes, &[]) {
                warn!(error = %e, ids = ?ids, "failed to send return message");
            }
        }
        Err(e) => warn!(error = %e, "failed to encode return message"),
    }
}

/// Drop guard that returns a buffer to the sender.
///
/// Attached to every fd-backed reconstructed buffer; when the hosting
/// consumer drops its last reference, the guard sends the return message
/// naming the buffer's block ids. The send is emitted regardless of local
/// descriptor lifetime because the sender, not the receiver, decides when
/// a pooled descriptor finally closes.
pub struct ReleaseGuard {
    socket: Arc<OwnedFd>,
    ids: SmallVec<[i32; MAX_MEM_BLOCKS]>,
    _shell: Option<ShellTicket>,
}

impl std::fmt::Debug for ReleaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseGuard").field("ids", &self.ids).finish()
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let set = PayloadSet::return_buffer(self.ids.clone());
        match wire::encode(&set) {
            Ok(bytes) => {
                if let Err(e) = socket::send_message(self.socket.as_fd(), &bytes, &[]) {
                    // The peer may already be gone; its ledger drains on
                    // disconnect either way.
                    debug!(error = %e, ids = ?self.ids, "return message not delivered");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode return message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_next_buffer_times_out_without_peer() {
        let dir = tempdir().unwrap();
        let config = SourceConfig::new(dir.path().join("lonely.sock"));
        let mut source = SocketSource::start(config).unwrap();

        let start = Instant::now();
        let result = source.next_buffer(Duration::from_millis(50));
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(Error::Timeout)));
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(2));

        source.stop();
    }

    #[test]
    fn test_start_fails_on_unbindable_path() {
        let config = SourceConfig::new("/nonexistent-dir/fdlink.sock");
        assert!(matches!(
            SocketSource::start(config),
            Err(Error::StartFailed(_))
        ));
    }

    #[test]
    fn test_next_buffer_after_stop_is_flushing() {
        let dir = tempdir().unwrap();
        let config = SourceConfig::new(dir.path().join("stopped.sock"));
        let mut source = SocketSource::start(config).unwrap();
        source.stop();

        assert!(matches!(
            source.next_buffer(Duration::from_millis(10)),
            Err(Error::Flushing)
        ));
    }
}
