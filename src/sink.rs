//! Sender engine: submits buffers over the channel and tracks them until
//! the peer hands them back.
//!
//! [`SocketSink::start`] spawns a dedicated engine thread that owns the
//! connection lifecycle: connect with retry, poll for return and control
//! messages while running, and tear down on hangup, peer disconnect, or
//! stop. [`SocketSink::submit`] runs on the caller's thread and never
//! blocks on the network; it shares state with the engine only through one
//! mutex and a condition variable.

use crate::buffer::{BufferId, LogicalBuffer, MemoryBlock, StreamMode, MAX_MEM_BLOCKS};
use crate::error::{Error, Result};
use crate::ledger::PendingLedger;
use crate::state::{ConnState, StopToken};
use crate::wire::{self, socket, BlockPayload, BufferInfoPayload, ControlKind, PayloadSet};
use smallvec::SmallVec;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default socket poll timeout.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_micros(1000);
/// Default pause between connect attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);
/// Default cap on unacknowledged buffers in flight.
pub const DEFAULT_MAX_OUTSTANDING: usize = 32;

/// Configuration for a [`SocketSink`].
#[derive(Debug, Clone)]
pub struct SinkConfig {
    path: PathBuf,
    mode: StreamMode,
    poll_timeout: Duration,
    reconnect_interval: Duration,
    max_outstanding: usize,
    tensor_blocks: Option<usize>,
}

impl SinkConfig {
    /// Configuration for the channel at `path`, video mode, defaults
    /// everywhere else.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mode: StreamMode::Video,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            max_outstanding: DEFAULT_MAX_OUTSTANDING,
            tensor_blocks: None,
        }
    }

    /// Set the stream mode; submitted buffers must match it.
    pub fn with_mode(mut self, mode: StreamMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the socket poll timeout of the engine loop.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set the pause between connect attempts.
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Set the cap on unacknowledged buffers in flight.
    pub fn with_max_outstanding(mut self, max: usize) -> Self {
        self.max_outstanding = max.max(1);
        self
    }

    /// Require tensor-mode buffers to carry exactly `n` blocks, as
    /// negotiated out of band. Unset, any block count within the per-
    /// buffer limit is accepted.
    pub fn with_tensor_blocks(mut self, n: usize) -> Self {
        self.tensor_blocks = Some(n.clamp(1, MAX_MEM_BLOCKS));
        self
    }
}

struct Shared {
    state: ConnState,
    socket: Option<Arc<OwnedFd>>,
    ledger: PendingLedger,
    /// Peer asked us to disconnect; honored once nothing is outstanding.
    disconnect_pending: bool,
}

/// Producer-side endpoint of the channel.
pub struct SocketSink {
    shared: Arc<(Mutex<Shared>, Condvar)>,
    stop: StopToken,
    engine: Option<JoinHandle<()>>,
    mode: StreamMode,
    max_outstanding: usize,
    tensor_blocks: Option<usize>,
}

impl SocketSink {
    /// Spawn the engine thread and return immediately; the connection is
    /// established asynchronously with retry.
    pub fn start(config: SinkConfig) -> Result<Self> {
        let shared = Arc::new((
            Mutex::new(Shared {
                state: ConnState::TryConnect,
                socket: None,
                ledger: PendingLedger::new(),
                disconnect_pending: false,
            }),
            Condvar::new(),
        ));
        let stop = StopToken::new();

        let engine = {
            let shared = Arc::clone(&shared);
            let stop = stop.clone();
            let config = config.clone();
            thread::Builder::new()
                .name("fdlink-sink".into())
                .spawn(move || engine_loop(&shared, &stop, &config))
                .map_err(|e| Error::StartFailed(format!("engine thread: {}", e)))?
        };

        info!(path = %config.path.display(), "sink started");
        Ok(Self {
            shared,
            stop,
            engine: Some(engine),
            mode: config.mode,
            max_outstanding: config.max_outstanding,
            tensor_blocks: config.tensor_blocks,
        })
    }

    /// Submit one buffer for transfer.
    ///
    /// The whole message is encoded before anything touches the socket, so
    /// a capacity failure sends nothing. Fd-backed buffers are held in the
    /// ledger until the peer returns them.
    pub fn submit(&self, buffer: LogicalBuffer) -> Result<()> {
        self.validate_mode(&buffer)?;

        let ids = buffer.fd_backed_ids();
        let fds: SmallVec<[Arc<OwnedFd>; MAX_MEM_BLOCKS]> = buffer
            .blocks()
            .iter()
            .filter_map(|b| match b {
                MemoryBlock::Text(_) => None,
                MemoryBlock::Tensor { fd, .. } | MemoryBlock::Frame { fd, .. } => {
                    Some(Arc::clone(fd))
                }
            })
            .collect();

        let (lock, _) = &*self.shared;
        let socket;
        let bytes;
        let need_fd;
        {
            let mut shared = lock.lock().unwrap();
            if shared.state != ConnState::Running {
                return Err(Error::NotConnected);
            }
            let outstanding = shared.ledger.outstanding();
            if outstanding >= self.max_outstanding {
                return Err(Error::Backpressure(outstanding));
            }
            socket = Arc::clone(shared.socket.as_ref().ok_or(Error::NotConnected)?);

            need_fd = match ids.first() {
                Some(&id) => shared.ledger.needs_fd(id, buffer.is_pooled()),
                None => false,
            };

            // Encode before registering: a capacity error must leave no
            // trace in the ledger and no bytes on the wire.
            bytes = wire::encode(&build_payload(&buffer, &ids, need_fd)?)?;

            if !ids.is_empty() {
                shared.ledger.register(&ids, buffer);
            }
        }

        let borrowed: SmallVec<[BorrowedFd<'_>; MAX_MEM_BLOCKS]> = if need_fd {
            fds.iter().map(|fd| fd.as_fd()).collect()
        } else {
            SmallVec::new()
        };

        if let Err(e) = socket::send_message(socket.as_fd(), &bytes, &borrowed) {
            // Undo the hold and the fd-sent marker; the descriptor never
            // reached the peer, and the engine notices the broken socket
            // on its next poll.
            let mut shared = lock.lock().unwrap();
            shared.ledger.rollback(&ids);
            warn!(error = %e, "send failed, rolling back buffer hold");
            return Err(e);
        }

        Ok(())
    }

    /// Best-effort single send of an end-of-stream control message. Not
    /// retried if the channel is down.
    pub fn send_eos(&self) -> Result<()> {
        self.send_control(ControlKind::Eos)
    }

    /// Wait up to `timeout` for the engine to connect.
    ///
    /// Returns `true` once connected, `false` on timeout.
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let (lock, cond) = &*self.shared;
        let deadline = Instant::now() + timeout;
        let mut shared = lock.lock().unwrap();
        while shared.state != ConnState::Running {
            let now = Instant::now();
            if now >= deadline || shared.state == ConnState::Stopped {
                return false;
            }
            let (guard, _) = cond.wait_timeout(shared, deadline - now).unwrap();
            shared = guard;
        }
        true
    }

    /// Whether the engine currently has a live connection.
    pub fn is_connected(&self) -> bool {
        self.shared.0.lock().unwrap().state == ConnState::Running
    }

    /// Number of submitted buffers not yet returned by the peer.
    pub fn outstanding(&self) -> usize {
        self.shared.0.lock().unwrap().ledger.outstanding()
    }

    /// Stop the engine: request the stop, wake any retry sleep, and join
    /// the thread. Outstanding buffers are released locally without
    /// waiting for acknowledgments.
    pub fn stop(&mut self) {
        self.stop.request();
        if let Some(engine) = self.engine.take() {
            let _ = engine.join();
        }
    }

    fn send_control(&self, kind: ControlKind) -> Result<()> {
        let socket = {
            let shared = self.shared.0.lock().unwrap();
            if shared.state != ConnState::Running {
                return Err(Error::NotConnected);
            }
            Arc::clone(shared.socket.as_ref().ok_or(Error::NotConnected)?)
        };
        let bytes = wire::encode(&PayloadSet::control(kind))?;
        socket::send_message(socket.as_fd(), &bytes, &[])
    }

    fn validate_mode(&self, buffer: &LogicalBuffer) -> Result<()> {
        let n = buffer.blocks().len();
        if n == 0 {
            return Err(Error::InvalidBuffer("buffer has no memory blocks".into()));
        }
        if n > MAX_MEM_BLOCKS {
            return Err(Error::InvalidBuffer(format!(
                "{} blocks exceeds the {} block limit",
                n, MAX_MEM_BLOCKS
            )));
        }
        // Text and video buffers are single-block; only tensor buffers
        // bundle several blocks per logical unit.
        if n != 1 && !matches!(self.mode, StreamMode::Tensor) {
            return Err(Error::InvalidBuffer(format!(
                "{:?} mode expects one block, got {}",
                self.mode, n
            )));
        }
        if matches!(self.mode, StreamMode::Tensor) {
            if let Some(expected) = self.tensor_blocks {
                if n != expected {
                    return Err(Error::InvalidBuffer(format!(
                        "tensor mode negotiated {} blocks, got {}",
                        expected, n
                    )));
                }
            }
        }
        for block in buffer.blocks() {
            let ok = matches!(
                (self.mode, block),
                (StreamMode::Text, MemoryBlock::Text(_))
                    | (StreamMode::Tensor, MemoryBlock::Tensor { .. })
                    | (StreamMode::Video, MemoryBlock::Frame { .. })
            );
            if !ok {
                return Err(Error::InvalidBuffer(format!(
                    "block kind does not match {:?} stream mode",
                    self.mode
                )));
            }
        }
        Ok(())
    }
}

impl Drop for SocketSink {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_payload(
    buffer: &LogicalBuffer,
    ids: &[BufferId],
    need_fd: bool,
) -> Result<PayloadSet> {
    let mut set = PayloadSet {
        buffer_info: Some(BufferInfoPayload {
            buf_ids: ids.iter().map(|id| id.0).collect(),
            pts: wire::dur_to_wire(buffer.pts),
            dts: wire::dur_to_wire(buffer.dts),
            duration: wire::dur_to_wire(buffer.duration),
            use_buffer_pool: buffer.is_pooled(),
        }),
        fd_count: (need_fd && !ids.is_empty()).then_some(ids.len() as i32),
        ..Default::default()
    };

    for block in buffer.blocks() {
        set.blocks.push(match block {
            MemoryBlock::Text(contents) => BlockPayload::Text(contents.clone()),
            MemoryBlock::Tensor { ty, dims, size, maxsize, .. } => BlockPayload::Tensor {
                ty: *ty,
                dims: dims.clone(),
                size: *size as u64,
                maxsize: *maxsize as u64,
            },
            MemoryBlock::Frame {
                format,
                width,
                height,
                planes,
                flags,
                size,
                maxsize,
                ..
            } => BlockPayload::Frame {
                width: *width,
                height: *height,
                format: *format,
                planes: planes.clone(),
                flags: *flags,
                size: *size as u64,
                maxsize: *maxsize as u64,
            },
        });
    }

    set.metas = buffer.metas().to_vec();
    Ok(set)
}

fn engine_loop(shared: &(Mutex<Shared>, Condvar), stop: &StopToken, config: &SinkConfig) {
    let (lock, cond) = shared;

    loop {
        if stop.is_requested() {
            break;
        }

        match socket::connect(&config.path) {
            Ok(fd) => {
                info!(path = %config.path.display(), "connected to peer");
                let socket = Arc::new(fd);
                {
                    let mut s = lock.lock().unwrap();
                    s.state = ConnState::Running;
                    s.socket = Some(Arc::clone(&socket));
                    s.disconnect_pending = false;
                    cond.notify_all();
                }

                run_connected(shared, stop, config, &socket);

                // Disconnecting: drop the connection and release every
                // outstanding hold exactly once.
                let mut s = lock.lock().unwrap();
                s.state = ConnState::Disconnecting;
                s.socket = None;
                let drained = s.ledger.drain();
                if drained > 0 {
                    info!(count = drained, "released outstanding buffers on disconnect");
                }
                s.state = ConnState::TryConnect;
                cond.notify_all();
            }
            Err(e) => {
                debug!(path = %config.path.display(), error = %e, "connect failed, will retry");
                stop.sleep(config.reconnect_interval);
            }
        }
    }

    let mut s = lock.lock().unwrap();
    s.state = ConnState::Stopped;
    s.socket = None;
    s.ledger.drain();
    cond.notify_all();
    debug!("sink engine stopped");
}

/// Steady-state loop: poll for return and control messages until hangup,
/// an honored disconnect, or a stop request.
fn run_connected(
    shared: &(Mutex<Shared>, Condvar),
    stop: &StopToken,
    config: &SinkConfig,
    socket: &Arc<OwnedFd>,
) {
    let (lock, cond) = shared;

    loop {
        if stop.is_requested() {
            // Forced teardown, best-effort goodbye.
            if let Ok(bytes) = wire::encode(&PayloadSet::control(ControlKind::Disconnect)) {
                let _ = socket::send_message(socket.as_fd(), &bytes, &[]);
            }
            return;
        }

        {
            let s = lock.lock().unwrap();
            if s.disconnect_pending && s.ledger.outstanding() == 0 {
                debug!("peer disconnect honored, nothing outstanding");
                return;
            }
        }

        let readiness = match socket::wait_readable(socket.as_fd(), config.poll_timeout) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "poll failed");
                return;
            }
        };

        match readiness {
            socket::Readiness::TimedOut => continue,
            socket::Readiness::Hangup => {
                debug!("peer hung up");
                return;
            }
            socket::Readiness::Ready => match socket::recv_message(socket.as_fd()) {
                Ok(None) => {
                    debug!("peer closed the connection");
                    return;
                }
                Ok(Some((bytes, _fds))) => match wire::decode(&bytes) {
                    Ok(set) => {
                        let mut s = lock.lock().unwrap();
                        dispatch(&mut s, &set);
                        cond.notify_all();
                        if s.disconnect_pending && s.ledger.outstanding() == 0 {
                            return;
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping malformed message"),
                },
                Err(e) => {
                    warn!(error = %e, "receive failed");
                    return;
                }
            },
        }
    }
}

fn dispatch(shared: &mut Shared, set: &PayloadSet) {
    if let Some(ref ids) = set.return_ids {
        let ids: SmallVec<[BufferId; MAX_MEM_BLOCKS]> =
            ids.iter().map(|&id| BufferId(id)).collect();
        let released = shared.ledger.release(&ids);
        if released == 0 {
            warn!("return message named no outstanding buffer");
        }
    }

    match set.control {
        Some(ControlKind::Disconnect) => {
            debug!(
                outstanding = shared.ledger.outstanding(),
                "peer requested disconnect"
            );
            shared.disconnect_pending = true;
        }
        Some(ControlKind::Eos) => warn!("unexpected end-of-stream from receiver, ignoring"),
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_before_connect_is_not_connected() {
        let config = SinkConfig::new("/tmp/fdlink-test-absent.sock")
            .with_mode(StreamMode::Text)
            .with_reconnect_interval(Duration::from_millis(10));
        let mut sink = SocketSink::start(config).unwrap();

        let buffer = LogicalBuffer::new().with_block(MemoryBlock::Text(b"hi".to_vec()));
        assert!(matches!(sink.submit(buffer), Err(Error::NotConnected)));
        assert!(!sink.wait_connected(Duration::from_millis(50)));

        sink.stop();
    }

    #[test]
    fn test_mode_mismatch_rejected() {
        let config = SinkConfig::new("/tmp/fdlink-test-mode.sock").with_mode(StreamMode::Video);
        let mut sink = SocketSink::start(config).unwrap();

        let buffer = LogicalBuffer::new().with_block(MemoryBlock::Text(b"oops".to_vec()));
        assert!(matches!(sink.submit(buffer), Err(Error::InvalidBuffer(_))));

        let empty = LogicalBuffer::new();
        assert!(matches!(sink.submit(empty), Err(Error::InvalidBuffer(_))));

        sink.stop();
    }

    #[test]
    fn test_tensor_block_count_enforced() {
        use crate::buffer::TensorType;
        use rustix::fs::{memfd_create, MemfdFlags};

        let config = SinkConfig::new("/tmp/fdlink-test-tensor-count.sock")
            .with_mode(StreamMode::Tensor)
            .with_tensor_blocks(2);
        let mut sink = SocketSink::start(config).unwrap();

        let tensor = || MemoryBlock::Tensor {
            fd: Arc::new(memfd_create("test-count", MemfdFlags::CLOEXEC).unwrap()),
            ty: TensorType::F32,
            dims: SmallVec::new(),
            size: 16,
            maxsize: 16,
        };

        // One block where two were negotiated: refused before any
        // connection state is consulted.
        let short = LogicalBuffer::new().with_block(tensor());
        assert!(matches!(sink.submit(short), Err(Error::InvalidBuffer(_))));

        // The right count passes validation and fails only on the absent
        // connection.
        let exact = LogicalBuffer::new().with_block(tensor()).with_block(tensor());
        assert!(matches!(sink.submit(exact), Err(Error::NotConnected)));

        sink.stop();
    }

    #[test]
    fn test_stop_is_prompt_and_idempotent() {
        let config = SinkConfig::new("/tmp/fdlink-test-stop.sock")
            .with_reconnect_interval(Duration::from_secs(60));
        let mut sink = SocketSink::start(config).unwrap();

        // The engine is asleep in its reconnect interval; stop must
        // interrupt it rather than waiting out the minute.
        let start = Instant::now();
        sink.stop();
        sink.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
