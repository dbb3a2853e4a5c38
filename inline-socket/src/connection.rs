//! Accepted stream connections.

use std::net::Shutdown;
use std::sync::Arc;

use tracing::trace;

use crate::address::Address;
use crate::buf::{BufResult, IoBuf, IoBufMut};
use crate::cancel::CancellationToken;
use crate::error::{Error, Result};
use crate::op::{Accepted, RecvOp, SendOp};
use crate::progress::{Completion, Progress};
use crate::source::{Side, Source, SourceKind};
use crate::transport::Transport;

/// Lifecycle of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
  Open,
  /// One or both directions were shut down; the handle is still held.
  ShuttingDown(Shutdown),
  Closed,
}

/// One accepted socket.
///
/// At most one [`Connection::receive`] and one [`Connection::send`] may be in
/// flight at a time. Completions of both are delivered by the dispatcher the
/// connection was registered with, in order.
pub struct Connection {
  source: Arc<Source>,
  local: Address,
  remote: Address,
  // Keeps the dispatcher workers running while the connection is alive.
  _transport: Transport,
}

impl Connection {
  /// Wraps a handle returned by `accept(2)` and registers it.
  pub(crate) fn accepted(transport: &Transport, accepted: Accepted) -> Result<Self> {
    let Accepted { handle, local, remote } = accepted;
    let source = transport
      .next_dispatcher()
      .register(handle, SourceKind::Connection)?;

    Ok(Self { source, local, remote, _transport: transport.clone() })
  }

  pub fn local_address(&self) -> &Address {
    &self.local
  }

  pub fn remote_address(&self) -> &Address {
    &self.remote
  }

  /// Id of the dispatcher that resolves this connection's operations.
  pub fn dispatcher_id(&self) -> usize {
    self.source.dispatcher().id()
  }

  pub fn state(&self) -> ConnectionState {
    let state = self.source.state();
    match (state.open, state.read_shut, state.write_shut) {
      (false, _, _) => ConnectionState::Closed,
      (true, true, true) => ConnectionState::ShuttingDown(Shutdown::Both),
      (true, true, false) => ConnectionState::ShuttingDown(Shutdown::Read),
      (true, false, true) => ConnectionState::ShuttingDown(Shutdown::Write),
      (true, false, false) => ConnectionState::Open,
    }
  }

  /// Receives up to `buf`'s capacity bytes.
  ///
  /// Resolves with the number of bytes read; `0` means the peer shut down
  /// its side. A buffer with no capacity (such as `Vec::new()`) is refused
  /// with [`Error::EmptyBuffer`], so `0` is never ambiguous. The buffer is
  /// handed back in every case.
  ///
  /// ```ignore
  /// let segment = transport.pool().get();
  /// let (read, segment) = connection.receive(segment, &token).wait();
  /// println!("{:?}", &segment[..read?]);
  /// ```
  pub fn receive<B: IoBufMut>(
    &self,
    buf: B,
    token: &CancellationToken,
  ) -> Progress<BufResult<usize, B>> {
    if buf.recv_capacity() == 0 {
      return Progress::ready((Err(Error::EmptyBuffer), buf));
    }

    let completion = Completion::new();
    let progress = Progress::new(Arc::clone(&completion));
    let op = RecvOp::new(buf, completion);
    self.source.submit(Side::Read, Box::new(op), token, Some("receive"));
    progress
  }

  /// Sends all of `buf`.
  ///
  /// Partial writes are retried until every byte is out. On failure the
  /// number of bytes already sent is unspecified.
  pub fn send<B: IoBuf>(
    &self,
    buf: B,
    token: &CancellationToken,
  ) -> Progress<BufResult<(), B>> {
    let completion = Completion::new();
    let progress = Progress::new(Arc::clone(&completion));
    let op = SendOp::new(buf, completion);
    self.source.submit(Side::Write, Box::new(op), token, Some("send"));
    progress
  }

  /// Half-closes the connection.
  ///
  /// Operations pending in a closed direction resolve with
  /// [`Error::ConnectionClosed`], as do later ones.
  pub fn shutdown(&self, how: Shutdown) -> Result<()> {
    self.source.shutdown(how)?;
    trace!(remote = %self.remote, ?how, "connection shut down");
    Ok(())
  }

  /// Closes the socket. Pending operations resolve with
  /// [`Error::ConnectionClosed`] and hand back their buffers.
  ///
  /// Runs on drop; calling it more than once is harmless.
  pub fn dispose(&self) {
    if self.source.close() {
      trace!(remote = %self.remote, "connection disposed");
    }
  }
}

impl Drop for Connection {
  fn drop(&mut self) {
    self.dispose();
  }
}

impl std::fmt::Debug for Connection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connection")
      .field("local", &self.local)
      .field("remote", &self.remote)
      .field("state", &self.state())
      .finish()
  }
}
