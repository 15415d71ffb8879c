//! Windows backend: IOCP completions (C4) over typed sockets (C2).

pub(crate) mod iocp;
pub(crate) mod socket;

pub use iocp::Backend;
