//! The operations a source can queue: accept, receive and send.
//!
//! An operation is first attempted on the submitting thread. If the syscall
//! would block it is queued on its source and retried by the dispatcher
//! thread each time the socket becomes ready, so the syscall, the copy into
//! the caller's buffer and the continuation all run on the thread that
//! observed readiness.

use std::io;
use std::sync::Arc;
use std::task::Poll;

use crate::address::Address;
use crate::buf::{BufResult, IoBuf, IoBufMut};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::progress::Completion;
use crate::sys::SocketHandle;
use crate::transport::Transport;

/// An operation waiting on a registered socket.
pub(crate) trait PendingOp: Send {
  /// Runs the non-blocking syscall. `Ready` once there is an outcome to
  /// deliver; `Pending` if the socket is not ready.
  ///
  /// Called with the source lock held.
  fn attempt(&mut self, handle: &SocketHandle) -> Poll<()>;

  /// Resolves the operation with its outcome. Called without any lock held.
  fn complete(self: Box<Self>);

  /// Resolves the operation with `err`. Called without any lock held.
  fn abort(self: Box<Self>, err: Error);
}

/// Retries `syscall` across `EINTR` and maps `WouldBlock` to `Pending`.
fn nonblocking<T>(mut syscall: impl FnMut() -> io::Result<T>) -> Poll<io::Result<T>> {
  match retry_eintr!(syscall()) {
    Err(err) if err.kind() == io::ErrorKind::WouldBlock => Poll::Pending,
    other => Poll::Ready(other),
  }
}

/// A peer taken off the backlog, with both ends' addresses.
pub(crate) struct Accepted {
  pub handle: SocketHandle,
  pub local: Address,
  pub remote: Address,
}

pub(crate) struct AcceptOp {
  transport: Transport,
  outcome: Option<io::Result<Accepted>>,
  completion: Arc<Completion<Result<Connection>>>,
}

impl AcceptOp {
  pub(crate) fn new(
    transport: Transport,
    completion: Arc<Completion<Result<Connection>>>,
  ) -> Self {
    Self { transport, outcome: None, completion }
  }
}

/// Errors that only concern the peer that was being accepted.
fn is_transient_accept_error(err: &io::Error) -> bool {
  err.kind() == io::ErrorKind::ConnectionAborted
    || err.raw_os_error() == Some(libc::EPROTO)
}

/// Reads both addresses of a freshly accepted socket.
///
/// A peer that reset before it was accepted has no peer address any more
/// (`ENOTCONN`, or `EINVAL` on the BSDs); that is reported as
/// `ConnectionAborted` so the peer is skipped like any other aborted one.
fn addresses(handle: SocketHandle) -> io::Result<Accepted> {
  let ends = handle.local_address().and_then(|local| {
    handle.peer_address().map(|remote| (local, remote))
  });

  match ends {
    Ok((local, remote)) => Ok(Accepted { handle, local, remote }),
    Err(err)
      if matches!(
        err.raw_os_error(),
        Some(libc::ENOTCONN | libc::ECONNRESET | libc::EINVAL)
      ) =>
    {
      Err(io::ErrorKind::ConnectionAborted.into())
    }
    Err(err) => Err(err),
  }
}

impl PendingOp for AcceptOp {
  fn attempt(&mut self, handle: &SocketHandle) -> Poll<()> {
    loop {
      let accepted = match nonblocking(|| handle.accept()) {
        Poll::Pending => return Poll::Pending,
        Poll::Ready(accepted) => accepted.and_then(addresses),
      };

      match accepted {
        Err(err) if is_transient_accept_error(&err) => {
          tracing::trace!(%err, "skipping peer that went away before accept");
        }
        outcome => {
          self.outcome = Some(outcome);
          return Poll::Ready(());
        }
      }
    }
  }

  fn complete(self: Box<Self>) {
    let this = *self;
    let result = match this.outcome {
      Some(Ok(accepted)) => Connection::accepted(&this.transport, accepted),
      Some(Err(err)) => Err(Error::from_socket(err)),
      None => Err(Error::ListenerClosed),
    };

    if let Ok(connection) = &result {
      tracing::trace!(
        local = %connection.local_address(),
        remote = %connection.remote_address(),
        "accepted connection"
      );
    }
    let _ = this.completion.resolve(result);
  }

  fn abort(self: Box<Self>, err: Error) {
    let _ = self.completion.resolve(Err(err));
  }
}

pub(crate) struct RecvOp<B> {
  buf: B,
  outcome: Option<io::Result<usize>>,
  completion: Arc<Completion<BufResult<usize, B>>>,
}

impl<B: IoBufMut> RecvOp<B> {
  pub(crate) fn new(
    buf: B,
    completion: Arc<Completion<BufResult<usize, B>>>,
  ) -> Self {
    Self { buf, outcome: None, completion }
  }
}

impl<B: IoBufMut> PendingOp for RecvOp<B> {
  fn attempt(&mut self, handle: &SocketHandle) -> Poll<()> {
    let buf = &mut self.buf;
    let polled = nonblocking(|| {
      buf.init();
      let len = buf.recv_capacity();
      let ptr = buf.recv_ptr();
      // SAFETY: the buffer is owned by this operation and exposes `len`
      // writable bytes at `ptr`.
      unsafe { handle.recv(ptr, len) }
    });

    match polled {
      Poll::Pending => Poll::Pending,
      Poll::Ready(outcome) => {
        if let Ok(read) = &outcome {
          // SAFETY: recv(2) initialized `read` bytes at the start of the
          // region.
          unsafe { self.buf.deinit(*read) };
        }
        self.outcome = Some(outcome);
        Poll::Ready(())
      }
    }
  }

  fn complete(self: Box<Self>) {
    let this = *self;
    let result = match this.outcome {
      Some(Ok(read)) => Ok(read),
      Some(Err(err)) => Err(Error::from_socket(err)),
      None => Err(Error::ConnectionClosed),
    };
    let _ = this.completion.resolve((result, this.buf));
  }

  fn abort(self: Box<Self>, err: Error) {
    let this = *self;
    let _ = this.completion.resolve((Err(err), this.buf));
  }
}

pub(crate) struct SendOp<B> {
  buf: B,
  sent: usize,
  outcome: Option<io::Result<()>>,
  completion: Arc<Completion<BufResult<(), B>>>,
}

impl<B: IoBuf> SendOp<B> {
  pub(crate) fn new(buf: B, completion: Arc<Completion<BufResult<(), B>>>) -> Self {
    Self { buf, sent: 0, outcome: None, completion }
  }
}

impl<B: IoBuf> PendingOp for SendOp<B> {
  /// Loops over partial writes; stays pending until every byte is out.
  fn attempt(&mut self, handle: &SocketHandle) -> Poll<()> {
    loop {
      let bytes = self.buf.as_bytes();
      if self.sent >= bytes.len() {
        self.outcome = Some(Ok(()));
        return Poll::Ready(());
      }

      match nonblocking(|| handle.send(&bytes[self.sent..])) {
        Poll::Pending => return Poll::Pending,
        Poll::Ready(Ok(0)) => {
          self.outcome = Some(Err(io::ErrorKind::WriteZero.into()));
          return Poll::Ready(());
        }
        Poll::Ready(Ok(written)) => self.sent += written,
        Poll::Ready(Err(err)) => {
          self.outcome = Some(Err(err));
          return Poll::Ready(());
        }
      }
    }
  }

  fn complete(self: Box<Self>) {
    let this = *self;
    let result = match this.outcome {
      Some(Ok(())) => Ok(()),
      Some(Err(err)) => Err(Error::from_socket(err)),
      None => Err(Error::ConnectionClosed),
    };
    let _ = this.completion.resolve((result, this.buf));
  }

  fn abort(self: Box<Self>, err: Error) {
    let this = *self;
    let _ = this.completion.resolve((Err(err), this.buf));
  }
}
