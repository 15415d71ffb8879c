//! A small, cross-platform asynchronous TCP/UDP core plus an HTTP/1 request
//! parser and response formatter.
//!
//! The core abstracts two fundamentally different OS async I/O models — a
//! Windows-style completion port (IOCP, `AcceptEx`/`ConnectEx`/
//! `DisconnectEx`/`TransmitFile`) and a POSIX-style readiness model (epoll
//! plus nonblocking `recv`/`send`/`sendfile`) — behind one operation
//! lifecycle, [`TsIo`](io::TsIo), that application code drives directly.
//! There is no reactor trait object and no async/await integration: callers
//! submit an operation, then block in [`Server::wait_on_io_queue`] on
//! whichever thread is free to pick up the next completion.
//!
//! # Feature flags
//!
//! | Feature | Default | Enables |
//! |---|---|---|
//! | `os-poll` | yes | The concrete epoll/IOCP backend and [`TsIo`](io::TsIo)'s operation surface. |
//! | `net` | yes | [`Server`], the listener registry, and the typed socket factory. Implies `os-poll`. |
//! | `http` | yes | The [`http`] module: header parsing, multipart bodies, response formatting. |
//! | `log` | yes | Tracing through the `log` crate at backend registration/arming/completion points. |
//!
//! This crate owns no socket buffer memory — callers provide the bytes for
//! every operation and keep them alive until the matching completion is
//! dequeued — performs no request routing, and retries nothing on the
//! caller's behalf.

#![deny(rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

#[macro_use]
mod macros;

cfg_os_poll! {
    pub mod io;
    mod queue;
    mod sys;
}

cfg_net! {
    pub mod listener;
    mod server;

    pub use server::{Server, ServerConfig};
    pub use listener::Listener;
}

pub mod sockaddr;

cfg_http! {
    pub mod http;
}

pub use sockaddr::{create_sockaddr, Protocol, SockAddr};
