//! Typed-socket factory for the Linux backend (C2), grounded on mio's
//! `sys::unix::net` (`new_ip_socket`, `socket_addr`) and
//! `sys::unix::tcp::listener::TcpListener::bind`.

use std::io;
use std::mem::size_of;
use std::os::unix::io::RawFd;

use crate::sockaddr::{Protocol, SockAddr};

fn domain(proto: Protocol) -> libc::c_int {
    if proto.is_v6() {
        libc::AF_INET6
    } else {
        libc::AF_INET
    }
}

fn sock_type(proto: Protocol) -> libc::c_int {
    if proto.is_stream() {
        libc::SOCK_STREAM
    } else {
        libc::SOCK_DGRAM
    }
}

/// Open a nonblocking, close-on-exec socket of the given protocol.
pub(crate) fn open(proto: Protocol) -> io::Result<RawFd> {
    syscall!(socket(
        domain(proto),
        sock_type(proto) | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        0,
    ))
}

fn set_reuse(fd: RawFd) -> io::Result<()> {
    let one: libc::c_int = 1;
    syscall!(setsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_REUSEADDR,
        &one as *const _ as *const libc::c_void,
        size_of::<libc::c_int>() as libc::socklen_t,
    ))?;
    syscall!(setsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_REUSEPORT,
        &one as *const _ as *const libc::c_void,
        size_of::<libc::c_int>() as libc::socklen_t,
    ))?;
    Ok(())
}

/// Open, bind, and `listen(SOMAXCONN)` a listening socket (spec.md §4.3
/// `add_listening_socket`).
pub(crate) fn bind_and_listen(proto: Protocol, addr: &SockAddr) -> io::Result<RawFd> {
    let fd = open(proto)?;
    let result = (|| {
        set_reuse(fd)?;
        syscall!(bind(
            fd,
            addr.as_bytes().as_ptr() as *const libc::sockaddr,
            addr.len() as libc::socklen_t,
        ))?;
        if proto.is_stream() {
            syscall!(listen(fd, libc::SOMAXCONN))?;
        }
        Ok(())
    })();
    if let Err(err) = result {
        // SAFETY: `fd` was just opened by us and not yet shared.
        unsafe {
            libc::close(fd);
        }
        return Err(err);
    }
    Ok(fd)
}

/// `accept4(SOCK_NONBLOCK|SOCK_CLOEXEC)` — spec.md §4.2.
pub(crate) fn accept(listener_fd: RawFd) -> io::Result<(RawFd, SockAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let fd = syscall!(accept4(
        listener_fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    ))?;
    let addr = unsafe { SockAddr::from_raw_parts(&storage as *const _ as *const u8, len as usize) };
    Ok((fd, addr))
}

pub(crate) fn connect(fd: RawFd, addr: &SockAddr) -> io::Result<()> {
    match syscall!(connect(
        fd,
        addr.as_bytes().as_ptr() as *const libc::sockaddr,
        addr.len() as libc::socklen_t,
    )) {
        Ok(_) => Ok(()),
        Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Outcome of a nonblocking `recv`/`send`/`sendfile` attempt, distinguishing
/// `EAGAIN`/`EWOULDBLOCK` from hard errors per spec.md §9's Open Question
/// resolution.
pub(crate) enum Attempt {
    Bytes(usize),
    WouldBlock,
    Error(io::Error),
}

pub(crate) fn recv(fd: RawFd, buf: &mut [u8]) -> Attempt {
    let ret = unsafe {
        libc::recv(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_DONTWAIT,
        )
    };
    classify(ret)
}

pub(crate) fn send(fd: RawFd, buf: &[u8]) -> Attempt {
    let ret = unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
        )
    };
    classify(ret)
}

pub(crate) fn sendfile(out_fd: RawFd, in_fd: RawFd, count: usize) -> Attempt {
    let ret = unsafe { libc::sendfile(out_fd, in_fd, std::ptr::null_mut(), count) };
    classify(ret as isize)
}

fn classify(ret: isize) -> Attempt {
    if ret >= 0 {
        Attempt::Bytes(ret as usize)
    } else {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => Attempt::WouldBlock,
            _ => Attempt::Error(err),
        }
    }
}

/// `getsockopt(SO_ERROR)` — used to resolve a nonblocking `connect`'s
/// outcome once the socket reports writable.
pub(crate) fn take_socket_error(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut _ as *mut libc::c_void,
        &mut len,
    ))?;
    if err == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(err))
    }
}

pub(crate) fn shutdown(fd: RawFd) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_RDWR);
    }
}

pub(crate) fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}
