//! Top-level orchestration: the public operation surface (§6) wired to
//! whichever concrete backend this target compiled (C4 on Windows, C5 on
//! Linux). Grounded on mio's `Poll`/`Registry` split in `poll.rs` — a thin
//! public type whose methods forward into `sys::Selector`, with no logic of
//! its own beyond argument marshalling and feature-gating.

use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use crate::io::TsIo;
use crate::listener::{Listener, Registry};
use crate::queue::WorkQueue;
use crate::sockaddr::{self, Protocol, SockAddr};
use crate::sys;

/// Explicit construction knobs, in place of the environment-variable or
/// config-file surface this crate deliberately does not have (spec.md §2:
/// mio's `Poll::new()` takes no arguments; capacities go to constructors).
#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    /// Capacity of the backend→worker handoff queue (C7). Per spec.md
    /// §4.5, size this to at least `max_concurrent_in_flight_connections +
    /// MAX_DEQUEUE` to avoid `send_to_io_queue`/backend pushes failing.
    pub queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            queue_capacity: 4096,
        }
    }
}

/// Process-wide server handle (`init_server`/`close_server` of spec.md §6,
/// collapsed into RAII: construction is `init_server`, `Drop` is
/// `close_server`). Holds the listener registry (C3), the work queue (C7),
/// and the platform backend (C4/C5) behind one value — no virtual dispatch,
/// matching the "concrete variant captured by value after init" design note
/// in spec.md §9.
pub struct Server {
    registry: Registry,
    queue: Arc<WorkQueue>,
    backend: sys::Backend,
}

impl Server {
    /// `init_server()` — spec.md §6. Brings up the concrete backend for
    /// this target (IOCP handle + extension-function detection on Windows,
    /// the two epoll instances plus reactor thread on Linux).
    pub fn new(config: ServerConfig) -> io::Result<Server> {
        let queue = Arc::new(WorkQueue::with_capacity(config.queue_capacity));
        let backend = sys::Backend::new(Arc::clone(&queue))?;
        log::debug!("tsio: server initialized, queue_capacity={}", config.queue_capacity);
        Ok(Server {
            registry: Registry::new(),
            queue,
            backend,
        })
    }

    /// `add_listening_socket(proto, port)` — spec.md §4.3. Binds to
    /// `INADDR_ANY`/`in6addr_any` on `port` with `SO_REUSEADDR|SO_REUSEPORT`
    /// (Linux) and registers the listener with the accept-side poller.
    pub fn add_listening_socket(&self, proto: Protocol, port: u16) -> io::Result<usize> {
        let ip = if proto.is_v6() {
            IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
        };
        let addr = sockaddr::create_sockaddr(ip, port, proto)?;
        let idx = self.backend.add_listening_socket(&self.registry, proto, &addr)?;
        log::debug!("tsio: listening on port {port} ({proto:?}), listener index {idx}");
        Ok(idx)
    }

    /// `listen_for_connections()` — spec.md §4.3, a blocking stateful
    /// iterator. Not safe for concurrent callers (§5); serialize externally
    /// if more than one thread calls this.
    pub fn listen_for_connections(&self) -> io::Result<Listener> {
        let idx = self.backend.listen_for_connections(&self.registry)?;
        Ok(self.registry.with_listener(idx, |l| *l))
    }

    /// `accept_conn(listener, conn)` — spec.md §6. Issues the first read
    /// synchronously after `accept4` on Linux, or via `AcceptEx`/`WSAAccept`
    /// on Windows; either way, the resulting completion (including the
    /// first `RecvData`, if `conn` carries a buffer) arrives later through
    /// [`wait_on_io_queue`](Server::wait_on_io_queue).
    pub fn accept_conn(&self, listener: &Listener, conn: &mut TsIo) -> io::Result<()> {
        self.backend.accept_conn(listener.raw_socket(), conn)
    }

    /// `create_conn(conn, addr)` — spec.md §6. Opens a typed socket of
    /// `conn`'s protocol and connects it (TCP) or fixes its default peer
    /// (UDP, per SPEC_FULL.md §3's supplemented UDP path).
    pub fn create_conn(&self, conn: &mut TsIo, addr: &SockAddr) -> io::Result<()> {
        self.backend.create_conn(conn, addr)
    }

    /// `recv_data(conn)` — spec.md §6. Uses `conn.io_buffer()`; on Linux
    /// this only re-arms epoll, the `recv` syscall runs inside
    /// `wait_on_io_queue` on whichever worker dequeues the completion.
    pub fn recv_data(&self, conn: &mut TsIo) -> io::Result<()> {
        self.backend.recv_data(conn)
    }

    /// `send_data(conn)` — spec.md §6.
    pub fn send_data(&self, conn: &mut TsIo) -> io::Result<()> {
        self.backend.send_data(conn)
    }

    /// `send_file(conn)` — spec.md §6. `conn`'s buffer must be
    /// [`IoBuffer::File`](crate::io::IoBuffer::File).
    pub fn send_file(&self, conn: &mut TsIo) -> io::Result<()> {
        self.backend.send_file(conn)
    }

    /// `disconnect_socket(conn)` — spec.md §4.4. Whether `conn.socket`
    /// survives for reuse afterward depends on backend capability; inspect
    /// [`TsIo::raw_socket`] to find out.
    pub fn disconnect_socket(&self, conn: &mut TsIo) {
        self.backend.disconnect_socket(conn)
    }

    /// `terminate_conn(conn)` — spec.md §4.4. The only path guaranteed to
    /// close the underlying socket.
    pub fn terminate_conn(&self, conn: &mut TsIo) {
        self.backend.terminate_conn(conn)
    }

    /// `send_to_io_queue(conn)` — spec.md §6. Synthesizes a completion with
    /// no syscall: `conn.status`/`conn.bytes_transferred` must already be
    /// set by the caller before calling this.
    pub fn send_to_io_queue(&self, conn: &mut TsIo) -> bool {
        self.backend.send_to_io_queue(conn)
    }

    /// `wait_on_io_queue()` — spec.md §6, the worker-thread blocking call.
    /// Safe for concurrent callers (§5): each call returns a distinct item.
    pub fn wait_on_io_queue(&self) -> &'static mut TsIo {
        self.backend.wait_on_io_queue()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

impl Drop for Server {
    /// `close_server()` — spec.md §6. Signals the reactor thread (Linux)
    /// and tears down the backend; arenas don't apply here, ownership is
    /// already explicit Rust values that drop normally.
    fn drop(&mut self) {
        self.backend.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::IoBuffer;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn free_port() -> u16 {
        40000 + (rand::random::<u16>() % 10000)
    }

    #[test]
    fn accept_and_echo() {
        init();
        let server = Server::new(ServerConfig::default()).unwrap();
        let port = free_port();
        server
            .add_listening_socket(Protocol::TcpV4, port)
            .unwrap();

        let client = std::thread::spawn(move || {
            // Give the listener a moment to be registered before connecting.
            std::thread::sleep(std::time::Duration::from_millis(50));
            let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            stream.write_all(b"ping").unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"ping");
        });

        let listener = server.listen_for_connections().unwrap();
        let mut buf = [0u8; 64];
        let mut conn = TsIo::new(Protocol::TcpV4);
        conn.set_buffer(IoBuffer::Bytes {
            ptr: buf.as_mut_ptr(),
            len: buf.len(),
        });
        server.accept_conn(&listener, &mut conn).unwrap();

        let conn = server.wait_on_io_queue();
        assert_eq!(conn.bytes_transferred(), 4);
        assert_eq!(&buf[..4], b"ping");

        conn.set_buffer(IoBuffer::Bytes {
            ptr: buf.as_mut_ptr(),
            len: 4,
        });
        server.send_data(conn).unwrap();
        let conn = server.wait_on_io_queue();
        assert_eq!(conn.bytes_transferred(), 4);

        server.disconnect_socket(conn);
        client.join().unwrap();
    }
}
