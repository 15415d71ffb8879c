//! Platform dispatch (design note §9.1: "a single `IoBackend` capability
//! set ... chosen once at `init_server`"). Each target compiles exactly one
//! concrete backend; `crate::server::Server` holds it behind a plain field,
//! no virtual dispatch, matching mio's `cfg(unix)`/`cfg(windows)` module
//! split in `src/sys/mod.rs`.

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub(crate) use unix::Backend;
#[cfg(unix)]
pub(crate) use unix::epoll::Internal;

#[cfg(windows)]
pub(crate) use windows::Backend;
#[cfg(windows)]
pub(crate) use windows::iocp::Internal;
