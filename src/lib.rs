//! # fdlink
//!
//! Local buffer-transport IPC over Unix domain sockets with zero-copy
//! file-descriptor passing.
//!
//! fdlink moves media and tensor buffers — shared-memory blocks plus
//! structured metadata — between two processes on the same host. Buffer
//! contents never cross the socket: only fixed-layout descriptions travel
//! as `SOCK_SEQPACKET` datagrams, with the backing memory transferred once
//! per buffer id as an `SCM_RIGHTS` descriptor and reused thereafter.
//!
//! ## Features
//!
//! - **Zero-copy transfer**: memfd/dmabuf descriptors over `SCM_RIGHTS`
//! - **Fd-send-once**: pooled buffer descriptors cross the socket once per
//!   connection; later sends name the id and the receiver reuses its cache
//! - **Ownership hand-off**: the sender holds every fd-backed buffer until
//!   the receiver's drop guard sends the return message
//! - **Reconnect-friendly**: both endpoints run a dedicated engine thread
//!   with bounded polling and prompt, cancellable shutdown
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use fdlink::prelude::*;
//! use std::time::Duration;
//!
//! // Consumer process: listen and receive.
//! let source = SocketSource::start(SourceConfig::new("/tmp/frames.sock"))?;
//! let buffer = source.next_buffer(Duration::from_millis(100))?;
//! // ... use the buffer; dropping it returns it to the sender.
//!
//! // Producer process: connect and submit.
//! let sink = SocketSink::start(SinkConfig::new("/tmp/frames.sock"))?;
//! sink.wait_connected(Duration::from_secs(1));
//! sink.submit(buffer)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buffer;
pub mod error;
pub mod ledger;
pub mod meta;
pub mod pool;
pub mod sink;
pub mod source;
pub mod state;
pub mod wire;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::buffer::{BufferId, LogicalBuffer, MemoryBlock, StreamMode};
    pub use crate::error::{Error, Result};
    pub use crate::meta::MetaRecord;
    pub use crate::sink::{SinkConfig, SocketSink};
    pub use crate::source::{SocketSource, SourceConfig};
}

pub use error::{Error, Result};
