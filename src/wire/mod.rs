//! Wire protocol: message identities, fixed-layout payload records, and the
//! socket framing that carries them (plus the `SCM_RIGHTS` side-channel for
//! file descriptors).
//!
//! One logical send bundles exactly one buffer-info record, one memory-block
//! record per block (in block order), zero or more metadata records, and —
//! only when new descriptors are being transferred — one fd-count record
//! with the descriptors attached as ancillary data. Control messages
//! (end-of-stream, disconnect, return-buffer) travel as their own datagrams
//! on the same socket.

pub mod codec;
pub mod socket;

pub use codec::{
    decode, dur_to_wire, encode, wire_to_dur, BlockPayload, BufferInfoPayload, ControlKind,
    MessageId, PayloadSet, MAX_MESSAGE_SIZE, TIME_NONE,
};
pub use socket::{recv_message, send_message, wait_readable, Listener, Readiness};
