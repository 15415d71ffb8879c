//! The `TsIo` connection-operation record and its state machine (C6).
//!
//! This is the single shared unit between the caller, the backend, and the
//! worker threads that dequeue completions — see spec.md §3 "Connection-
//! operation (`ts_io`)" and §4.4. Follows mio's `event::Event`/`sys::Event`
//! split in spirit (a small public wrapper, backend-private bytes behind
//! it), but `TsIo` owns its socket and in-flight bookkeeping rather than
//! being a transient readiness notification.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::sockaddr::Protocol;
use crate::sys;

/// Sentinel socket handle meaning "no socket attached to this `TsIo`".
#[cfg(unix)]
pub type RawSocket = std::os::unix::io::RawFd;
#[cfg(windows)]
pub type RawSocket = std::os::windows::raw::SOCKET;

#[cfg(unix)]
pub const INVALID_SOCKET: RawSocket = -1;
#[cfg(windows)]
pub const INVALID_SOCKET: RawSocket = windows_sys::Win32::Networking::WinSock::INVALID_SOCKET as RawSocket;

/// `conn.status` — see spec.md §3 and the transition table in §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Status {
    None,
    Disconnected,
    Connected,
    Aborted,
    Error,
}

/// `conn.operation` — the operation currently (or most recently) in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Operation {
    None,
    Accept,
    Create,
    Disconnect,
    Terminate,
    RecvData,
    SendData,
    SendFile,
    Post,
}

/// Caller-owned transfer buffer for a submitted operation.
///
/// The caller retains ownership of the backing bytes for the entire
/// lifetime of the operation (spec.md §1 Non-goals: "the core does not own
/// socket buffer memory"). `SendFile` instead carries an open file plus the
/// byte count left to transmit.
pub enum IoBuffer {
    None,
    Bytes { ptr: *mut u8, len: usize },
    File { file: std::fs::File, len: u64 },
}

// SAFETY: `IoBuffer::Bytes` is a raw pointer into memory the caller
// guarantees is valid and not concurrently touched for the lifetime of the
// operation (spec.md §5 "Shared-resource policy"); `TsIo` itself is only
// ever touched by one thread at a time (submitter, then backend, then the
// worker that dequeues it), matching `ts_io`'s single-owner contract.
unsafe impl Send for IoBuffer {}

impl fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoBuffer::None => write!(f, "IoBuffer::None"),
            IoBuffer::Bytes { len, .. } => write!(f, "IoBuffer::Bytes({len} bytes)"),
            IoBuffer::File { len, .. } => write!(f, "IoBuffer::File({len} bytes left)"),
        }
    }
}

/// One async connection-operation record (`ts_io`).
///
/// Allocated and owned by the caller; its address must stay stable from
/// submission until the matching [`wait_on_io_queue`](crate::server::Server::wait_on_io_queue)
/// dequeues it. At most one operation may be in flight per `TsIo` at a
/// time — enforced here only in debug builds (spec.md §8 property 2: "reject
/// overlapping submission via debug assertions").
pub struct TsIo {
    pub(crate) socket: RawSocket,
    pub(crate) protocol: Protocol,
    pub(crate) status: Status,
    pub(crate) operation: Operation,
    pub(crate) buffer: IoBuffer,
    pub(crate) bytes_transferred: usize,
    pub(crate) internal: sys::Internal,
    in_flight: AtomicBool,
}

impl TsIo {
    /// A fresh, unattached `TsIo` ready for `accept_conn`/`create_conn`.
    pub fn new(protocol: Protocol) -> TsIo {
        TsIo {
            socket: INVALID_SOCKET,
            protocol,
            status: Status::None,
            operation: Operation::None,
            buffer: IoBuffer::None,
            bytes_transferred: 0,
            internal: sys::Internal::default(),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn bytes_transferred(&self) -> usize {
        self.bytes_transferred
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Raw socket for this connection, or `None` if it has been closed or
    /// was never attached. Callers must inspect this after
    /// `disconnect_socket` — whether the socket survives depends on
    /// backend capability (spec.md §4.4).
    pub fn raw_socket(&self) -> Option<RawSocket> {
        if self.socket == INVALID_SOCKET {
            None
        } else {
            Some(self.socket)
        }
    }

    pub fn io_buffer(&self) -> &IoBuffer {
        &self.buffer
    }

    pub fn set_buffer(&mut self, buffer: IoBuffer) {
        self.buffer = buffer;
    }

    /// Byte slice view of the caller's buffer, valid for `RecvData`/`SendData`.
    ///
    /// # Safety
    /// Caller must not read/write this region while a backend operation is
    /// in flight on it (spec.md §5 "Shared-resource policy").
    pub unsafe fn buffer_slice(&self) -> &[u8] {
        match &self.buffer {
            IoBuffer::Bytes { ptr, len } => std::slice::from_raw_parts(*ptr, *len),
            _ => &[],
        }
    }

    #[allow(clippy::mut_from_ref)]
    pub unsafe fn buffer_slice_mut(&self) -> &mut [u8] {
        match &self.buffer {
            IoBuffer::Bytes { ptr, len } => std::slice::from_raw_parts_mut(*ptr, *len),
            _ => &mut [],
        }
    }

    /// Marks the start of a new submitted operation. Panics in debug builds
    /// if one is already in flight — this is the caller-contract violation
    /// spec.md §8 property 2 calls out.
    pub(crate) fn begin(&mut self, op: Operation) {
        debug_assert!(
            !self.in_flight.swap(true, Ordering::AcqRel),
            "TsIo: overlapping operation submitted while one is already in flight"
        );
        self.operation = op;
    }

    /// Retags the operation already in flight without touching the
    /// in-flight flag — for the backend's own internal chaining (e.g.
    /// `accept_conn` arming the first `RecvData` as part of one submission)
    /// rather than a second caller-visible submission.
    pub(crate) fn rearm(&mut self, op: Operation) {
        self.operation = op;
    }

    /// Marks completion: the backend has finished updating `status` and
    /// `bytes_transferred`, so a new operation may be submitted.
    pub(crate) fn complete(&mut self, status: Status, bytes: usize) {
        self.status = status;
        self.bytes_transferred = bytes;
        self.in_flight.store(false, Ordering::Release);
    }
}

impl fmt::Debug for TsIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TsIo")
            .field("socket", &self.socket)
            .field("protocol", &self.protocol)
            .field("status", &self.status)
            .field("operation", &self.operation)
            .field("bytes_transferred", &self.bytes_transferred)
            .finish()
    }
}

// SAFETY: ownership transfers explicitly through the work queue; the
// backend and worker never touch a `TsIo` concurrently with the submitter
// (spec.md §5).
unsafe impl Send for TsIo {}
