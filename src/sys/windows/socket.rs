//! Typed-socket factory for the Windows backend (C2), grounded on the
//! teacher's `sys::windows::tcp`/`sys::windows::net` and on `Selector::new`
//! in `sys::windows::selector` (the `CreateIoCompletionPort` dance every
//! socket goes through before it can complete through IOCP).

use std::io;
use std::os::windows::io::RawSocket;

use windows_sys::Win32::Networking::WinSock::{
    bind, closesocket, listen, socket, WSAGetLastError, AF_INET, AF_INET6, INVALID_SOCKET,
    IPPROTO_TCP, IPPROTO_UDP, SOCKET, SOCK_DGRAM, SOCK_STREAM, SOMAXCONN,
};
use windows_sys::Win32::System::IO::CreateIoCompletionPort;

use crate::sockaddr::{Protocol, SockAddr};

fn last_error() -> io::Error {
    io::Error::from_raw_os_error(unsafe { WSAGetLastError() })
}

fn domain(proto: Protocol) -> i32 {
    if proto.is_v6() {
        AF_INET6 as i32
    } else {
        AF_INET as i32
    }
}

fn type_and_proto(proto: Protocol) -> (u16, i32) {
    if proto.is_stream() {
        (SOCK_STREAM as u16, IPPROTO_TCP as i32)
    } else {
        (SOCK_DGRAM as u16, IPPROTO_UDP as i32)
    }
}

/// Open an overlapped-capable socket of the given protocol.
pub(crate) fn open(proto: Protocol) -> io::Result<SOCKET> {
    let (ty, ipproto) = type_and_proto(proto);
    let s = unsafe { socket(domain(proto), ty as i32, ipproto) };
    if s == INVALID_SOCKET as SOCKET {
        return Err(last_error());
    }
    Ok(s)
}

/// Bind an already-open completion port to a socket, so its completions
/// surface through `GetQueuedCompletionStatusEx` keyed by `token`.
pub(crate) fn associate(iocp: isize, sock: SOCKET, token: usize) -> io::Result<()> {
    let ret = unsafe { CreateIoCompletionPort(sock as isize, iocp, token, 0) };
    if ret == 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub(crate) fn bind_and_listen(proto: Protocol, addr: &SockAddr) -> io::Result<SOCKET> {
    let sock = open(proto)?;
    let result = (|| unsafe {
        if bind(
            sock,
            addr.as_bytes().as_ptr() as *const _,
            addr.len() as i32,
        ) != 0
        {
            return Err(last_error());
        }
        if proto.is_stream() && listen(sock, SOMAXCONN as i32) != 0 {
            return Err(last_error());
        }
        Ok(())
    })();
    if let Err(e) = result {
        unsafe {
            closesocket(sock);
        }
        return Err(e);
    }
    Ok(sock)
}

pub(crate) fn close(sock: SOCKET) {
    unsafe {
        closesocket(sock);
    }
}

pub(crate) fn as_raw_socket(sock: SOCKET) -> RawSocket {
    sock as RawSocket
}
