//! Thin wrappers over the socket and readiness syscalls.

mod addr;
pub(crate) mod poll;
mod socket;

pub(crate) use addr::SockAddr;
pub use socket::SocketHandle;
