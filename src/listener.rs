//! Listener registry & accept polling (C3).
//!
//! Grounded on mio's `net::tcp_listener`/`sys::unix::tcp::listener` split
//! (a thin public handle plus a sys-level bind/listen primitive) and on
//! `sys::windows::selector`'s WSAEVENT-per-listener accept tracking for the
//! Windows side. Unlike mio's `TcpListener`, a `Listener` here is never
//! individually registered by the application — the registry and its
//! accept-side polling are owned entirely by [`Server`](crate::server::Server),
//! matching spec.md §4.3: `listen_for_connections` is deliberately a single
//! entry point, not per-listener registration.

use std::io;
use std::sync::Mutex;

use crate::io::RawSocket;
use crate::sockaddr::Protocol;

/// `{ socket, accept_wait_handle, protocol }` — spec.md §3.
///
/// Lives until server shutdown once added; the registry only grows
/// (spec.md §3 invariant: "`listeners` grows only").
#[derive(Clone, Copy)]
pub struct Listener {
    pub(crate) socket: RawSocket,
    pub(crate) protocol: Protocol,
}

impl Listener {
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn raw_socket(&self) -> RawSocket {
        self.socket
    }
}

/// Append-only registry of listeners plus the stateful accept-poll cursor
/// described in spec.md §4.3.
///
/// `listen_for_connections` deliberately serializes accept polling through
/// whichever thread calls it (§5: "not safe for concurrent callers").
/// `Mutex` enforces that at the type level: a second concurrent caller
/// blocks rather than corrupting the cursor, which is a strictly safer
/// restatement of the same contract the spec already requires callers to
/// honor.
pub(crate) struct Registry {
    listeners: Mutex<Vec<Listener>>,
    cursor: Mutex<AcceptCursor>,
}

#[derive(Default)]
struct AcceptCursor {
    ready: Vec<usize>,
    pos: usize,
}

impl Registry {
    pub(crate) fn new() -> Registry {
        Registry {
            listeners: Mutex::new(Vec::new()),
            cursor: Mutex::new(AcceptCursor::default()),
        }
    }

    pub(crate) fn push(&self, listener: Listener) -> usize {
        let mut listeners = self.listeners.lock().unwrap();
        listeners.push(listener);
        listeners.len() - 1
    }

    pub(crate) fn with_listener<R>(&self, idx: usize, f: impl FnOnce(&Listener) -> R) -> R {
        let listeners = self.listeners.lock().unwrap();
        f(&listeners[idx])
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    /// The stateful-iterator step from spec.md §4.3: if the cursor has been
    /// drained, block for a fresh batch of ready listener indices via
    /// `wait_batch`, then return the next one, advancing the cursor.
    pub(crate) fn next_ready(
        &self,
        wait_batch: impl FnOnce() -> io::Result<Vec<usize>>,
    ) -> io::Result<usize> {
        let mut cursor = self.cursor.lock().unwrap();
        if cursor.pos >= cursor.ready.len() {
            cursor.ready = wait_batch()?;
            cursor.pos = 0;
        }
        let idx = cursor.ready[cursor.pos];
        cursor.pos += 1;
        Ok(idx)
    }
}
