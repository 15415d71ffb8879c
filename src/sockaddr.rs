//! Socket address envelope and the typed-protocol socket factory (C2).
//!
//! Mirrors mio's `sys::unix::net::{from_socket_addr, to_socket_addr}` and
//! `sys::windows::net` helpers, but instead of handing back a typed
//! `std::net::SocketAddr` it copies the raw on-wire bytes into a
//! fixed-capacity envelope so the backend-specific accept/connect calls
//! (`AcceptEx`, `accept4`, ...) can pass a pointer + length without an
//! allocation, matching spec.md's `SockAddr` data model.

use std::fmt;
use std::mem::size_of;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// Transport + address-family a [`Listener`](crate::listener::Listener) or
/// connection operates over.
///
/// [`Protocol::TcpV4`]/[`Protocol::TcpV6`] are connection-oriented;
/// [`Protocol::UdpV4`]/[`Protocol::UdpV6`] are connectionless. The same
/// `TsIo` lifecycle (§4.4 of the design) drives both — a UDP `TsIo` simply
/// never observes the zero-byte-read "peer hung up" transition, since
/// `SOCK_DGRAM` has no peer to hang up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Protocol {
    TcpV4,
    UdpV4,
    TcpV6,
    UdpV6,
}

impl Protocol {
    pub(crate) fn is_stream(self) -> bool {
        matches!(self, Protocol::TcpV4 | Protocol::TcpV6)
    }

    pub(crate) fn is_v6(self) -> bool {
        matches!(self, Protocol::TcpV6 | Protocol::UdpV6)
    }
}

/// Largest on-wire sockaddr any supported protocol needs: `sockaddr_in6` is
/// 28 bytes on every platform this crate targets, and `sockaddr_in` fits
/// comfortably inside that. See spec.md §3 "Sockaddr envelope".
pub const SOCKADDR_MAX_SIZE: usize = 28;

/// A fixed-capacity sockaddr envelope: `{ addr_bytes[28], size }`.
///
/// Constructed by [`create_sockaddr`] and consumed by the backend's
/// accept/connect/bind paths. Never grows past [`SOCKADDR_MAX_SIZE`], so it
/// can live inline in a `TsIo` without an allocation.
#[derive(Clone, Copy)]
pub struct SockAddr {
    bytes: [u8; SOCKADDR_MAX_SIZE],
    size: u8,
}

impl SockAddr {
    /// Build a [`SockAddr`] by copying `len` bytes out of an OS-native
    /// sockaddr buffer (e.g. the `sockaddr_storage` `accept4`/`getsockname`
    /// fill in, or the local/remote address blocks `AcceptEx` writes).
    ///
    /// # Safety
    /// `src` must point to at least `len` initialized, readable bytes, and
    /// `len` must not exceed [`SOCKADDR_MAX_SIZE`].
    pub(crate) unsafe fn from_raw_parts(src: *const u8, len: usize) -> SockAddr {
        debug_assert!(len <= SOCKADDR_MAX_SIZE);
        let mut bytes = [0u8; SOCKADDR_MAX_SIZE];
        std::ptr::copy_nonoverlapping(src, bytes.as_mut_ptr(), len);
        SockAddr {
            bytes,
            size: len as u8,
        }
    }

    /// Raw on-wire bytes, truncated to [`SockAddr::len`].
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.size as usize]
    }

    /// Size, in bytes, of the address actually written (16 for v4, 28 for v6).
    pub fn len(&self) -> usize {
        self.size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Decode back into a `std::net::SocketAddr`.
    pub fn to_socket_addr(&self) -> std::io::Result<SocketAddr> {
        match self.size as usize {
            n if n == size_of::<libc_compat::sockaddr_in>() => {
                let mut raw: libc_compat::sockaddr_in = unsafe { std::mem::zeroed() };
                // SAFETY: `self.bytes` was filled by `create_sockaddr` with
                // exactly `size_of::<sockaddr_in>()` valid bytes.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        self.bytes.as_ptr(),
                        &mut raw as *mut _ as *mut u8,
                        n,
                    );
                }
                let ip = Ipv4Addr::from(u32::from_be(raw.sin_addr));
                let port = u16::from_be(raw.sin_port);
                Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
            }
            n if n == size_of::<libc_compat::sockaddr_in6>() => {
                let mut raw: libc_compat::sockaddr_in6 = unsafe { std::mem::zeroed() };
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        self.bytes.as_ptr(),
                        &mut raw as *mut _ as *mut u8,
                        n,
                    );
                }
                let ip = Ipv6Addr::from(raw.sin6_addr);
                let port = u16::from_be(raw.sin6_port);
                Ok(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0)))
            }
            _ => Err(std::io::ErrorKind::InvalidInput.into()),
        }
    }
}

impl fmt::Debug for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_socket_addr() {
            Ok(addr) => write!(f, "SockAddr({addr})"),
            Err(_) => write!(f, "SockAddr(<invalid, {} bytes>)", self.size),
        }
    }
}

/// Platform-independent view of the two sockaddr shapes we pack into
/// [`SockAddr`]. Kept separate from `libc`/`windows-sys` so the envelope
/// type and its `Debug` impl compile identically on both backends; the
/// unix and windows socket factories fill `SockAddr::bytes` directly from
/// their native sockaddr structs, which are bit-compatible with these.
mod libc_compat {
    #[repr(C)]
    #[derive(Clone, Copy)]
    pub(crate) struct sockaddr_in {
        pub family: u16,
        pub sin_port: u16,
        pub sin_addr: u32,
        pub _pad: [u8; 8],
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub(crate) struct sockaddr_in6 {
        pub family: u16,
        pub sin6_port: u16,
        pub sin6_flowinfo: u32,
        pub sin6_addr: [u8; 16],
        pub sin6_scope_id: u32,
    }
}

/// Build a [`SockAddr`] envelope for `ip:port` under `proto`.
///
/// `ip` must agree with `proto`'s address family ([`Protocol::is_v6`]);
/// mismatches are rejected rather than silently reinterpreted.
pub fn create_sockaddr(ip: IpAddr, port: u16, proto: Protocol) -> std::io::Result<SockAddr> {
    match (ip, proto.is_v6()) {
        (IpAddr::V4(v4), false) => Ok(encode_v4(v4, port)),
        (IpAddr::V6(v6), true) => Ok(encode_v6(v6, port)),
        _ => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "address family does not match protocol",
        )),
    }
}

fn encode_v4(ip: Ipv4Addr, port: u16) -> SockAddr {
    let raw = libc_compat::sockaddr_in {
        family: family_inet(),
        sin_port: port.to_be(),
        sin_addr: u32::from(ip).to_be(),
        _pad: [0; 8],
    };
    let mut bytes = [0u8; SOCKADDR_MAX_SIZE];
    let size = size_of::<libc_compat::sockaddr_in>();
    unsafe {
        std::ptr::copy_nonoverlapping(&raw as *const _ as *const u8, bytes.as_mut_ptr(), size);
    }
    SockAddr {
        bytes,
        size: size as u8,
    }
}

fn encode_v6(ip: Ipv6Addr, port: u16) -> SockAddr {
    let raw = libc_compat::sockaddr_in6 {
        family: family_inet6(),
        sin6_port: port.to_be(),
        sin6_flowinfo: 0,
        sin6_addr: ip.octets(),
        sin6_scope_id: 0,
    };
    let mut bytes = [0u8; SOCKADDR_MAX_SIZE];
    let size = size_of::<libc_compat::sockaddr_in6>();
    unsafe {
        std::ptr::copy_nonoverlapping(&raw as *const _ as *const u8, bytes.as_mut_ptr(), size);
    }
    SockAddr {
        bytes,
        size: size as u8,
    }
}

#[cfg(unix)]
fn family_inet() -> u16 {
    libc::AF_INET as u16
}

#[cfg(unix)]
fn family_inet6() -> u16 {
    libc::AF_INET6 as u16
}

#[cfg(windows)]
fn family_inet() -> u16 {
    windows_sys::Win32::Networking::WinSock::AF_INET as u16
}

#[cfg(windows)]
fn family_inet6() -> u16 {
    windows_sys::Win32::Networking::WinSock::AF_INET6 as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_round_trips() {
        let addr = create_sockaddr(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 50000, Protocol::TcpV4)
            .unwrap();
        assert_eq!(addr.len(), 16);
        let back = addr.to_socket_addr().unwrap();
        assert_eq!(back, "127.0.0.1:50000".parse().unwrap());
    }

    #[test]
    fn v6_round_trips() {
        let ip = Ipv6Addr::LOCALHOST;
        let addr = create_sockaddr(IpAddr::V6(ip), 8080, Protocol::TcpV6).unwrap();
        assert_eq!(addr.len(), 28);
        let back = addr.to_socket_addr().unwrap();
        assert_eq!(back.ip(), IpAddr::V6(ip));
        assert_eq!(back.port(), 8080);
    }

    #[test]
    fn family_mismatch_rejected() {
        let err = create_sockaddr(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 1, Protocol::TcpV6)
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }
}
