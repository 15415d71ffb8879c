//! Completion backend — Linux: epoll readiness, synthesized into
//! completions (C5). Mirrors the shape of mio's
//! `sys::unix::selector::epoll::Selector` (one `epoll_create1`-owned fd,
//! `register`/`reregister`/`deregister` through `epoll_ctl`, `select`
//! through `epoll_wait`) but duplicated into two instances per spec.md
//! §4.2 — one level-triggered instance for listener accept-readiness, one
//! edge-triggered + one-shot instance for connected-socket I/O — plus the
//! dedicated dispatcher thread that turns the second instance's readiness
//! events into `TsIo` completions on the work queue.

use std::io;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::io::{IoBuffer, Operation, Status, TsIo};
use crate::listener::{Listener, Registry as ListenerRegistry};
use crate::queue::WorkQueue;
use crate::sockaddr::{Protocol, SockAddr};

use super::socket;

/// Linux's `TsIo::internal` payload: just the epoll event mask the
/// dispatcher thread last observed for this connection (spec.md §3:
/// "on Linux holds a small work-type tag (K ≥ 4)").
#[derive(Default, Clone, Copy)]
pub struct Internal {
    pub(crate) events: u32,
}

fn epoll_add(ep: RawFd, fd: RawFd, events: u32, data: u64) -> io::Result<()> {
    let mut ev = libc::epoll_event { events, u64: data };
    syscall!(epoll_ctl(ep, libc::EPOLL_CTL_ADD, fd, &mut ev)).map(|_| ())
}

fn epoll_mod(ep: RawFd, fd: RawFd, events: u32, data: u64) -> io::Result<()> {
    let mut ev = libc::epoll_event { events, u64: data };
    syscall!(epoll_ctl(ep, libc::EPOLL_CTL_MOD, fd, &mut ev)).map(|_| ())
}

fn epoll_del(ep: RawFd, fd: RawFd) -> io::Result<()> {
    syscall!(epoll_ctl(ep, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())).map(|_| ())
}

/// Edge-triggered, one-shot interest bits for a connected socket armed for
/// `direction` plus error/hangup reporting.
fn conn_interest(direction: u32) -> u32 {
    direction | libc::EPOLLET as u32 | libc::EPOLLONESHOT as u32 | libc::EPOLLRDHUP as u32
}

pub(crate) struct Backend {
    accept_epoll: RawFd,
    io_epoll: RawFd,
    wake_read: RawFd,
    wake_write: RawFd,
    queue: Arc<WorkQueue>,
    reactor: std::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
}

impl Backend {
    pub(crate) fn new(queue: Arc<WorkQueue>) -> io::Result<Backend> {
        let accept_epoll = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        let io_epoll = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;

        let mut fds = [0 as RawFd; 2];
        syscall!(pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC))?;
        let (wake_read, wake_write) = (fds[0], fds[1]);
        epoll_add(io_epoll, wake_read, libc::EPOLLIN as u32, u64::MAX)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let backend = Backend {
            accept_epoll,
            io_epoll,
            wake_read,
            wake_write,
            queue: Arc::clone(&queue),
            reactor: std::sync::Mutex::new(None),
            shutdown,
        };
        backend.spawn_reactor();
        Ok(backend)
    }

    /// The dedicated I/O event thread of spec.md §4.2: loops `epoll_wait`
    /// over the connection instance, stamps each ready `TsIo`'s `internal`
    /// scratch with the observed event mask, and hands it to the work
    /// queue. The actual `recv`/`send`/`sendfile` syscall runs later, on
    /// whichever worker thread dequeues it.
    fn spawn_reactor(&self) {
        let io_epoll = self.io_epoll;
        let wake_read = self.wake_read;
        let queue = Arc::clone(&self.queue);
        let shutdown = Arc::clone(&self.shutdown);
        let handle = std::thread::Builder::new()
            .name("tsio-reactor".into())
            .spawn(move || {
                let mut events: [MaybeUninit<libc::epoll_event>; 256] =
                    unsafe { MaybeUninit::uninit().assume_init() };
                while !shutdown.load(Ordering::Acquire) {
                    let n = match syscall!(epoll_wait(
                        io_epoll,
                        events.as_mut_ptr() as *mut libc::epoll_event,
                        events.len() as i32,
                        -1,
                    )) {
                        Ok(n) => n as usize,
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            log::error!("tsio: epoll_wait on io instance failed: {e}");
                            break;
                        }
                    };
                    for ev in &events[..n] {
                        // SAFETY: initialized by the kernel for the first `n` slots.
                        let ev = unsafe { ev.assume_init() };
                        if ev.u64 == u64::MAX {
                            // Wake pipe: drain it and re-check shutdown.
                            let mut buf = [0u8; 64];
                            unsafe {
                                libc::read(wake_read, buf.as_mut_ptr() as *mut _, buf.len());
                            }
                            continue;
                        }
                        let conn = ev.u64 as *mut TsIo;
                        // SAFETY: the backend only ever reads/writes
                        // `internal` between a caller's submit and the
                        // caller's dequeue, per spec.md §5.
                        unsafe {
                            (*conn).internal.events = ev.events;
                        }
                        queue.push(conn);
                    }
                }
                log::trace!("tsio-reactor: shutting down");
            })
            .expect("failed to spawn tsio reactor thread");
        *self.reactor.lock().unwrap() = Some(handle);
    }

    pub(crate) fn close(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = unsafe { libc::write(self.wake_write, [0u8].as_ptr() as *const _, 1) };
        if let Some(handle) = self.reactor.lock().unwrap().take() {
            let _ = handle.join();
        }
        unsafe {
            libc::close(self.accept_epoll);
            libc::close(self.io_epoll);
            libc::close(self.wake_read);
            libc::close(self.wake_write);
        }
    }

    pub(crate) fn add_listening_socket(
        &self,
        registry: &ListenerRegistry,
        proto: Protocol,
        addr: &SockAddr,
    ) -> io::Result<usize> {
        let fd = socket::bind_and_listen(proto, addr)?;
        let idx = registry.push(Listener {
            socket: fd,
            protocol: proto,
        });
        if let Err(e) = epoll_add(self.accept_epoll, fd, libc::EPOLLIN as u32, idx as u64) {
            socket::close(fd);
            return Err(e);
        }
        Ok(idx)
    }

    /// `listen_for_connections`: blocks on the accept-side epoll the first
    /// time it's called (or whenever the cursor is drained), then returns
    /// the next ready listener index — spec.md §4.3.
    pub(crate) fn listen_for_connections(&self, registry: &ListenerRegistry) -> io::Result<usize> {
        let accept_epoll = self.accept_epoll;
        registry.next_ready(|| {
            let mut events: [MaybeUninit<libc::epoll_event>; 64] =
                unsafe { MaybeUninit::uninit().assume_init() };
            loop {
                match syscall!(epoll_wait(
                    accept_epoll,
                    events.as_mut_ptr() as *mut libc::epoll_event,
                    events.len() as i32,
                    -1,
                )) {
                    Ok(n) => {
                        let ready = events[..n as usize]
                            .iter()
                            .map(|e| unsafe { e.assume_init().u64 as usize })
                            .collect();
                        return Ok(ready);
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
        })
    }

    pub(crate) fn accept_conn(&self, listener_fd: RawFd, conn: &mut TsIo) -> io::Result<()> {
        conn.begin(Operation::Accept);
        let (fd, _peer) = socket::accept(listener_fd)?;
        conn.socket = fd;
        epoll_add(self.io_epoll, fd, conn_interest(0), conn as *mut TsIo as u64)?;
        match conn.io_buffer() {
            IoBuffer::Bytes { .. } => {
                // Chains directly into the first `RecvData` as part of this
                // same submission (`rearm`, not `begin` — the operation
                // already in flight is `accept_conn`'s, not a new one).
                conn.rearm(Operation::RecvData);
                epoll_mod(
                    self.io_epoll,
                    fd,
                    conn_interest(libc::EPOLLIN as u32),
                    conn as *mut TsIo as u64,
                )
            }
            _ => {
                conn.complete(Status::Connected, 0);
                self.queue.push(conn as *mut TsIo);
                Ok(())
            }
        }
    }

    pub(crate) fn create_conn(&self, conn: &mut TsIo, addr: &SockAddr) -> io::Result<()> {
        conn.begin(Operation::Create);
        let fd = socket::open(conn.protocol())?;
        if conn.protocol().is_stream() {
            socket::connect(fd, addr)?;
            conn.socket = fd;
            epoll_add(
                self.io_epoll,
                fd,
                conn_interest(libc::EPOLLOUT as u32),
                conn as *mut TsIo as u64,
            )?;
        } else {
            // Connectionless: `connect(2)` on a UDP socket only fixes the
            // default peer, it does not block or need readiness.
            socket::connect(fd, addr)?;
            conn.socket = fd;
            epoll_add(self.io_epoll, fd, conn_interest(0), conn as *mut TsIo as u64)?;
            conn.complete(Status::Connected, 0);
            self.queue.push(conn as *mut TsIo);
        }
        Ok(())
    }

    pub(crate) fn recv_data(&self, conn: &mut TsIo) -> io::Result<()> {
        conn.begin(Operation::RecvData);
        epoll_mod(
            self.io_epoll,
            conn.raw_socket().expect("recv_data on unattached TsIo"),
            conn_interest(libc::EPOLLIN as u32),
            conn as *mut TsIo as u64,
        )
    }

    pub(crate) fn send_data(&self, conn: &mut TsIo) -> io::Result<()> {
        conn.begin(Operation::SendData);
        epoll_mod(
            self.io_epoll,
            conn.raw_socket().expect("send_data on unattached TsIo"),
            conn_interest(libc::EPOLLOUT as u32),
            conn as *mut TsIo as u64,
        )
    }

    pub(crate) fn send_file(&self, conn: &mut TsIo) -> io::Result<()> {
        conn.begin(Operation::SendFile);
        epoll_mod(
            self.io_epoll,
            conn.raw_socket().expect("send_file on unattached TsIo"),
            conn_interest(libc::EPOLLOUT as u32),
            conn as *mut TsIo as u64,
        )
    }

    /// `shutdown` then `close` then `EPOLL_CTL_DEL` — spec.md §4.2. On
    /// Linux the socket never survives for reuse (no `DisconnectEx`
    /// equivalent), so `conn.socket` is always invalidated afterward.
    pub(crate) fn disconnect_socket(&self, conn: &mut TsIo) {
        if let Some(fd) = conn.raw_socket() {
            let _ = epoll_del(self.io_epoll, fd);
            socket::shutdown(fd);
            socket::close(fd);
        }
        conn.socket = crate::io::INVALID_SOCKET;
        conn.complete(Status::Disconnected, 0);
    }

    pub(crate) fn terminate_conn(&self, conn: &mut TsIo) {
        if let Some(fd) = conn.raw_socket() {
            let _ = epoll_del(self.io_epoll, fd);
            socket::close(fd);
        }
        conn.socket = crate::io::INVALID_SOCKET;
        conn.complete(Status::None, 0);
    }

    pub(crate) fn send_to_io_queue(&self, conn: &mut TsIo) -> bool {
        conn.begin(Operation::Post);
        self.queue.push(conn as *mut TsIo)
    }

    /// `wait_on_io_queue`: block for the next completed `TsIo`, then — per
    /// spec.md §4.2 — perform the actual nonblocking syscall the reactor's
    /// readiness event authorized, and fill in `status`/`bytes_transferred`.
    pub(crate) fn wait_on_io_queue(&self) -> &'static mut TsIo {
        loop {
            let ptr = self.queue.pop();
            // SAFETY: the caller guarantees `TsIo` addresses are stable
            // from submission to dequeue (spec.md §3 "Ownership & lifecycle").
            let conn: &'static mut TsIo = unsafe { &mut *ptr };
            if self.dispatch_completion(conn) {
                return conn;
            }
            // `Post` items with no corresponding readiness event, or an
            // operation that requeued itself (e.g. out-of-turn wake), loop
            // to fetch the next real item.
        }
    }

    /// Returns `true` once `conn` holds a final completion (status and
    /// bytes filled in) ready to hand to the caller.
    fn dispatch_completion(&self, conn: &mut TsIo) -> bool {
        if conn.operation() == Operation::Post {
            // Synthesized via `send_to_io_queue`: no syscall, `status`
            // was already set by the caller before the post.
            conn.complete(conn.status(), conn.bytes_transferred());
            return true;
        }

        let events = conn.internal.events;
        if events & libc::EPOLLERR as u32 != 0 {
            conn.complete(Status::Error, 0);
            return true;
        }
        if events & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 && conn.protocol().is_stream()
        {
            conn.complete(Status::Aborted, 0);
            return true;
        }

        match conn.operation() {
            Operation::Accept | Operation::RecvData if events & libc::EPOLLIN as u32 != 0 => {
                let fd = conn.raw_socket().expect("ready TsIo missing a socket");
                let buf = unsafe { conn.buffer_slice_mut() };
                match socket::recv(fd, buf) {
                    socket::Attempt::Bytes(0) if conn.protocol().is_stream() => {
                        conn.complete(Status::Aborted, 0)
                    }
                    socket::Attempt::Bytes(n) => conn.complete(Status::Connected, n),
                    socket::Attempt::WouldBlock => conn.complete(Status::Connected, 0),
                    socket::Attempt::Error(_) => conn.complete(Status::Error, 0),
                }
                true
            }
            Operation::Create if events & libc::EPOLLOUT as u32 != 0 => {
                let fd = conn.raw_socket().expect("ready TsIo missing a socket");
                match socket::take_socket_error(fd) {
                    Ok(()) => conn.complete(Status::Connected, 0),
                    Err(_) => conn.complete(Status::Error, 0),
                }
                true
            }
            Operation::SendData if events & libc::EPOLLOUT as u32 != 0 => {
                let fd = conn.raw_socket().expect("ready TsIo missing a socket");
                let buf = unsafe { conn.buffer_slice() };
                match socket::send(fd, buf) {
                    socket::Attempt::Bytes(n) => conn.complete(Status::Connected, n),
                    socket::Attempt::WouldBlock => conn.complete(Status::Connected, 0),
                    socket::Attempt::Error(_) => conn.complete(Status::Error, 0),
                }
                true
            }
            Operation::SendFile if events & libc::EPOLLOUT as u32 != 0 => {
                let fd = conn.raw_socket().expect("ready TsIo missing a socket");
                let (in_fd, remaining) = match conn.io_buffer() {
                    IoBuffer::File { file, len } => {
                        (std::os::unix::io::AsRawFd::as_raw_fd(file), *len as usize)
                    }
                    _ => {
                        conn.complete(Status::Error, 0);
                        return true;
                    }
                };
                match socket::sendfile(fd, in_fd, remaining) {
                    socket::Attempt::Bytes(n) => {
                        if let IoBuffer::File { len, .. } = &mut conn.buffer {
                            *len = len.saturating_sub(n as u64);
                        }
                        conn.complete(Status::Connected, n)
                    }
                    socket::Attempt::WouldBlock => conn.complete(Status::Connected, 0),
                    socket::Attempt::Error(_) => conn.complete(Status::Error, 0),
                }
                true
            }
            _ => {
                // Readiness arrived for a direction the current operation
                // doesn't care about (e.g. a stray EPOLLOUT while waiting
                // to recv); treat as a zero-byte, still-connected wakeup.
                conn.complete(Status::Connected, 0);
                true
            }
        }
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.close();
    }
}
