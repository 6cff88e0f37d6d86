//! `SOCK_SEQPACKET` Unix socket transport with `SCM_RIGHTS` fd passing.
//!
//! Seqpacket sockets preserve message boundaries, so one `sendmsg` carries
//! exactly one encoded [`PayloadSet`](super::PayloadSet) and one `recvmsg`
//! returns it whole, with any transferred descriptors in the ancillary
//! data of the same call.

use crate::buffer::MAX_MEM_BLOCKS;
use crate::error::{Error, Result};
use crate::wire::codec::MAX_MESSAGE_SIZE;
use rustix::event::{poll, PollFd, PollFlags};
use rustix::net::{
    accept, bind_unix, connect_unix, listen, recvmsg, sendmsg, socket, AddressFamily,
    RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags, SocketAddrUnix, SocketType,
};
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::trace;

// Ancillary space for up to MAX_MEM_BLOCKS descriptors plus the cmsg header.
const ANCILLARY_SPACE: usize = 256;

/// Outcome of waiting for socket readability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Data (or an incoming connection) is ready.
    Ready,
    /// The timeout elapsed with nothing to read.
    TimedOut,
    /// The peer hung up.
    Hangup,
}

/// Connect to a listening seqpacket socket at `path`.
///
/// Fails with [`Error::System`] (typically `ENOENT` or `ECONNREFUSED`)
/// while no peer is listening; the engine retries on its own schedule.
pub fn connect(path: &Path) -> Result<OwnedFd> {
    let fd = socket(AddressFamily::UNIX, SocketType::SEQPACKET, None)?;
    let addr = SocketAddrUnix::new(path)?;
    connect_unix(&fd, &addr)?;
    trace!(path = %path.display(), "connected");
    Ok(fd)
}

/// A listening seqpacket socket bound to a filesystem path.
///
/// The socket file is unlinked before binding (stale files from a crashed
/// peer would otherwise block the bind) and again on drop.
pub struct Listener {
    fd: OwnedFd,
    path: PathBuf,
}

impl Listener {
    /// Bind and listen at `path`.
    pub fn bind(path: &Path) -> Result<Self> {
        let _ = std::fs::remove_file(path);
        let fd = socket(AddressFamily::UNIX, SocketType::SEQPACKET, None)?;
        let addr = SocketAddrUnix::new(path)?;
        bind_unix(&fd, &addr)?;
        listen(&fd, 1)?;
        trace!(path = %path.display(), "listening");
        Ok(Self {
            fd,
            path: path.to_path_buf(),
        })
    }

    /// Wait up to `timeout` for an incoming connection, then accept it.
    ///
    /// Returns `Ok(None)` if the timeout elapsed with no pending
    /// connection.
    pub fn accept_timeout(&self, timeout: Duration) -> Result<Option<OwnedFd>> {
        match wait_readable(self.fd.as_fd(), timeout)? {
            Readiness::Ready => Ok(Some(accept(&self.fd)?)),
            Readiness::TimedOut => Ok(None),
            Readiness::Hangup => Err(Error::NotConnected),
        }
    }

    /// The bound socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Wait up to `timeout` for `fd` to become readable.
///
/// Sub-millisecond timeouts are rounded up to one millisecond, the finest
/// granularity `poll` offers.
pub fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> Result<Readiness> {
    let mut millis = timeout.as_millis().min(i32::MAX as u128) as i32;
    if millis == 0 && !timeout.is_zero() {
        millis = 1;
    }

    let mut fds = [PollFd::new(&fd, PollFlags::IN)];
    let n = poll(&mut fds, millis)?;
    if n == 0 {
        return Ok(Readiness::TimedOut);
    }

    let revents = fds[0].revents();
    if revents.contains(PollFlags::IN) {
        // Data first: a peer can send and then hang up, and HUP may be set
        // alongside IN while unread datagrams remain.
        Ok(Readiness::Ready)
    } else if revents.intersects(PollFlags::HUP | PollFlags::ERR) {
        Ok(Readiness::Hangup)
    } else {
        Ok(Readiness::TimedOut)
    }
}

/// Send one encoded message, attaching `fds` as `SCM_RIGHTS` ancillary
/// data when non-empty.
pub fn send_message(socket: BorrowedFd<'_>, bytes: &[u8], fds: &[BorrowedFd<'_>]) -> Result<()> {
    debug_assert!(fds.len() <= MAX_MEM_BLOCKS);

    let iov = [IoSlice::new(bytes)];
    let mut ancillary_space = [0u8; ANCILLARY_SPACE];
    let mut ancillary = SendAncillaryBuffer::new(&mut ancillary_space);

    if !fds.is_empty() && !ancillary.push(SendAncillaryMessage::ScmRights(fds)) {
        return Err(Error::PayloadTooLarge("descriptor set", fds.len(), MAX_MEM_BLOCKS));
    }

    sendmsg(socket, &iov, &mut ancillary, SendFlags::empty())?;
    trace!(bytes = bytes.len(), fds = fds.len(), "sent message");
    Ok(())
}

/// Receive one whole message plus any descriptors that travelled with it.
///
/// Returns `Ok(None)` when the peer has hung up (zero-byte read).
pub fn recv_message(socket: BorrowedFd<'_>) -> Result<Option<(Vec<u8>, Vec<OwnedFd>)>> {
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    let mut ancillary_space = [0u8; ANCILLARY_SPACE];
    let mut ancillary = RecvAncillaryBuffer::new(&mut ancillary_space);

    let mut iov = [IoSliceMut::new(&mut buf)];
    let result = recvmsg(socket, &mut iov, &mut ancillary, RecvFlags::CMSG_CLOEXEC)?;

    if result.bytes == 0 {
        return Ok(None);
    }

    let mut fds = Vec::new();
    for msg in ancillary.drain() {
        if let RecvAncillaryMessage::ScmRights(rights) = msg {
            fds.extend(rights);
        }
    }

    buf.truncate(result.bytes);
    trace!(bytes = buf.len(), fds = fds.len(), "received message");
    Ok(Some((buf, fds)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustix::fs::{memfd_create, MemfdFlags};
    use rustix::net::shutdown;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::thread;
    use tempfile::tempdir;

    fn connect_with_retry(path: &Path) -> OwnedFd {
        for _ in 0..100 {
            if let Ok(fd) = connect(path) {
                return fd;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("peer never came up at {}", path.display());
    }

    #[test]
    fn test_message_boundaries_preserved() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("boundaries.sock");
        let listener = Listener::bind(&path).unwrap();

        let client = thread::spawn({
            let path = path.clone();
            move || {
                let sock = connect_with_retry(&path);
                send_message(sock.as_fd(), b"first", &[]).unwrap();
                send_message(sock.as_fd(), b"second message", &[]).unwrap();
            }
        });

        let conn = listener
            .accept_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        let (first, _) = recv_message(conn.as_fd()).unwrap().unwrap();
        let (second, _) = recv_message(conn.as_fd()).unwrap().unwrap();
        client.join().unwrap();

        assert_eq!(first, b"first");
        assert_eq!(second, b"second message");
    }

    #[test]
    fn test_fd_transfer_carries_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fds.sock");
        let listener = Listener::bind(&path).unwrap();

        let client = thread::spawn({
            let path = path.clone();
            move || {
                let sock = connect_with_retry(&path);
                let memfd = memfd_create("test-payload", MemfdFlags::CLOEXEC).unwrap();
                let mut file = std::fs::File::from(memfd);
                file.write_all(b"shared bytes").unwrap();
                let memfd = OwnedFd::from(file);
                send_message(sock.as_fd(), b"with-fd", &[memfd.as_fd()]).unwrap();
            }
        });

        let conn = listener
            .accept_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        let (bytes, fds) = recv_message(conn.as_fd()).unwrap().unwrap();
        client.join().unwrap();

        assert_eq!(bytes, b"with-fd");
        assert_eq!(fds.len(), 1);

        // The received descriptor must reference the sender's memory.
        use std::io::{Read, Seek, SeekFrom};
        let mut file = std::fs::File::from(fds.into_iter().next().unwrap());
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "shared bytes");
    }

    #[test]
    fn test_hangup_reads_as_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hangup.sock");
        let listener = Listener::bind(&path).unwrap();

        let client = thread::spawn({
            let path = path.clone();
            move || {
                let sock = connect_with_retry(&path);
                send_message(sock.as_fd(), b"last words", &[]).unwrap();
                shutdown(&sock, rustix::net::Shutdown::ReadWrite).unwrap();
            }
        });

        let conn = listener
            .accept_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        let (bytes, _) = recv_message(conn.as_fd()).unwrap().unwrap();
        assert_eq!(bytes, b"last words");
        client.join().unwrap();

        assert!(recv_message(conn.as_fd()).unwrap().is_none());
    }

    #[test]
    fn test_wait_readable_times_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("timeout.sock");
        let listener = Listener::bind(&path).unwrap();

        let readiness = wait_readable(listener.as_fd(), Duration::from_millis(10)).unwrap();
        assert_eq!(readiness, Readiness::TimedOut);
    }

    #[test]
    fn test_connect_without_listener_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.sock");
        assert!(connect(&path).is_err());
    }

    #[test]
    fn test_socket_file_removed_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cleanup.sock");

        {
            let listener = Listener::bind(&path).unwrap();
            assert!(path.exists());
            let _ = listener.as_fd().as_raw_fd();
        }

        assert!(!path.exists());
    }
}
