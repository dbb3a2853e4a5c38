//! Error taxonomy for the transport.
//!
//! Every fallible operation in this crate reports a [`Error`]. Operations that
//! lend a buffer to the OS report a [`BufResult`](crate::buf::BufResult)
//! instead, so the buffer comes back to the caller on failure too.

use std::io;

use thiserror::Error;

use crate::address::Address;
use crate::listener::ListenerState;

/// Result type used throughout this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by listeners, connections and dispatchers.
#[derive(Error, Debug)]
pub enum Error {
  /// The address is malformed or unusable for the requested operation.
  #[error("invalid address: {0}")]
  InvalidAddress(String),

  /// Another socket (or a stale socket file) already owns the address.
  #[error("address already in use: {0}")]
  AddressInUse(Address),

  /// A socket handle could not be associated with a dispatcher.
  #[error("failed to register handle with dispatcher: {0}")]
  Registration(#[source] io::Error),

  /// The operation's cancellation token fired before it completed.
  #[error("operation cancelled")]
  Cancelled,

  /// The peer terminated the connection abruptly.
  #[error("connection reset by peer")]
  ConnectionReset,

  /// The connection was disposed, or shut down in the operation's direction.
  #[error("connection closed")]
  ConnectionClosed,

  /// The listener was unbound or disposed.
  #[error("listener closed")]
  ListenerClosed,

  /// The dispatcher's readiness context failed and was torn down.
  #[error("dispatcher failed: {0}")]
  DispatcherFatal(#[source] io::Error),

  /// A second receive (or send) was issued while one is still in flight.
  #[error("a {0} operation is already in flight on this connection")]
  ConcurrentOperation(&'static str),

  /// A receive was given a buffer with no room, which would otherwise be
  /// indistinguishable from the peer shutting down.
  #[error("receive buffer has no capacity")]
  EmptyBuffer,

  /// The listener is not in a state that allows the operation.
  #[error("cannot {op} a listener in state {state:?}")]
  InvalidState { op: &'static str, state: ListenerState },

  /// A [`Config`](crate::Config) value is out of range.
  #[error("invalid configuration: {0}")]
  InvalidConfig(&'static str),

  /// Any other OS error.
  #[error(transparent)]
  Io(#[from] io::Error),
}

impl Error {
  /// Maps an error returned by a data-path syscall (`recv`, `send`,
  /// `accept`) onto the taxonomy.
  pub(crate) fn from_socket(err: io::Error) -> Self {
    match err.raw_os_error() {
      Some(libc::ECONNRESET | libc::EPIPE | libc::ECONNABORTED) => {
        Error::ConnectionReset
      }
      _ => Error::Io(err),
    }
  }

  /// Maps an error returned by `bind(2)` for `address`.
  pub(crate) fn from_bind(err: io::Error, address: &Address) -> Self {
    match err.raw_os_error() {
      Some(libc::EADDRINUSE) => Error::AddressInUse(address.clone()),
      Some(
        libc::EADDRNOTAVAIL
        | libc::EAFNOSUPPORT
        | libc::EINVAL
        | libc::ENOENT
        | libc::ENOTDIR,
      ) => Error::InvalidAddress(format!("{address}: {err}")),
      _ => Error::Io(err),
    }
  }

  /// Returns `true` for [`Error::Cancelled`].
  pub fn is_cancelled(&self) -> bool {
    matches!(self, Error::Cancelled)
  }

  /// Returns `true` when the error means the owning listener or connection
  /// is gone.
  pub fn is_closed(&self) -> bool {
    matches!(self, Error::ConnectionClosed | Error::ListenerClosed)
  }
}
