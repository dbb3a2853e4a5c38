//! A socket handle registered with a dispatcher, and its pending operations.
//!
//! Every operation on a source goes through its lock: the synchronous first
//! attempt, queueing, readiness-driven retries, cancellation and closing. The
//! handle is only ever touched under that lock, and closing takes it out, so
//! no syscall can run against a closed (or reused) descriptor.
//!
//! Operations are removed from their queue exactly once, under the lock, and
//! are then completed or aborted after the lock is released. User code never
//! runs while a source lock is held.

use std::collections::VecDeque;
use std::net::Shutdown;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::Poll;

use crate::cancel::{CancelGuard, CancellationToken};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::op::PendingOp;
use crate::sync::Mutex;
use crate::sys::SocketHandle;
use crate::sys::poll::Interest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SourceKind {
  Listener,
  Connection,
}

impl SourceKind {
  /// Error surfaced to operations once the source is closed.
  pub(crate) fn closed_error(self) -> Error {
    match self {
      SourceKind::Listener => Error::ListenerClosed,
      SourceKind::Connection => Error::ConnectionClosed,
    }
  }
}

/// Queue an operation waits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
  Read,
  Write,
}

struct Queued {
  id: u64,
  op: Box<dyn PendingOp>,
  _cancel: CancelGuard,
}

struct SourceInner {
  handle: Option<SocketHandle>,
  readers: VecDeque<Queued>,
  writers: VecDeque<Queued>,
  read_shut: bool,
  write_shut: bool,
  /// An exclusive operation on that side has been admitted and not yet
  /// resolved. Stays set while the operation sits in a dispatcher's
  /// completed batch.
  reading: bool,
  writing: bool,
}

impl SourceInner {
  fn queue(&mut self, side: Side) -> &mut VecDeque<Queued> {
    match side {
      Side::Read => &mut self.readers,
      Side::Write => &mut self.writers,
    }
  }

  fn is_shut(&self, side: Side) -> bool {
    match side {
      Side::Read => self.read_shut,
      Side::Write => self.write_shut,
    }
  }

  fn in_flight(&mut self, side: Side) -> &mut bool {
    match side {
      Side::Read => &mut self.reading,
      Side::Write => &mut self.writing,
    }
  }
}

/// Snapshot of a source's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SourceState {
  pub open: bool,
  pub read_shut: bool,
  pub write_shut: bool,
}

pub(crate) struct Source {
  key: u64,
  kind: SourceKind,
  dispatcher: Arc<Dispatcher>,
  next_op: AtomicU64,
  inner: Mutex<SourceInner>,
}

impl Source {
  pub(crate) fn new(
    key: u64,
    kind: SourceKind,
    handle: SocketHandle,
    dispatcher: Arc<Dispatcher>,
  ) -> Self {
    Self {
      key,
      kind,
      dispatcher,
      next_op: AtomicU64::new(0),
      inner: Mutex::new(SourceInner {
        handle: Some(handle),
        readers: VecDeque::new(),
        writers: VecDeque::new(),
        read_shut: false,
        write_shut: false,
        reading: false,
        writing: false,
      }),
    }
  }

  pub(crate) fn dispatcher(&self) -> &Arc<Dispatcher> {
    &self.dispatcher
  }

  pub(crate) fn state(&self) -> SourceState {
    let inner = self.inner.lock();
    SourceState {
      open: inner.handle.is_some(),
      read_shut: inner.read_shut,
      write_shut: inner.write_shut,
    }
  }

  /// Submits `op` on `side`.
  ///
  /// If nothing older is queued on that side the syscall is attempted right
  /// away and, when it does not block, the operation completes on the calling
  /// thread. Otherwise it is queued until readiness, cancellation or close.
  /// With `exclusive` set, a second operation on a side whose previous one
  /// has not been resolved yet is refused with [`Error::ConcurrentOperation`].
  pub(crate) fn submit(
    self: &Arc<Self>,
    side: Side,
    mut op: Box<dyn PendingOp>,
    token: &CancellationToken,
    exclusive: Option<&'static str>,
  ) {
    if token.is_cancelled() {
      op.abort(Error::Cancelled);
      return;
    }

    let mut guard = self.inner.lock();
    let inner = &mut *guard;

    let refused = if inner.handle.is_none() {
      Some(self.kind.closed_error())
    } else if inner.is_shut(side) {
      Some(Error::ConnectionClosed)
    } else if exclusive.is_some() && *inner.in_flight(side) {
      exclusive.map(Error::ConcurrentOperation)
    } else {
      None
    };
    if let Some(err) = refused {
      drop(guard);
      op.abort(err);
      return;
    }

    if exclusive.is_some() {
      *inner.in_flight(side) = true;
      op = Box::new(Exclusive { op, source: Arc::downgrade(self), side });
    }

    let SourceInner { handle, readers, writers, .. } = inner;
    let queue = match side {
      Side::Read => readers,
      Side::Write => writers,
    };

    let finished = match handle.as_ref() {
      Some(handle) if queue.is_empty() => op.attempt(handle).is_ready(),
      _ => false,
    };
    if finished {
      drop(guard);
      op.complete();
      return;
    }

    let id = self.next_op.fetch_add(1, Ordering::Relaxed);
    let weak = Arc::downgrade(self);
    let registered = token.register(move || {
      if let Some(source) = weak.upgrade() {
        source.cancel(side, id);
      }
    });

    match registered {
      Some(cancel) => queue.push_back(Queued { id, op, _cancel: cancel }),
      None => {
        drop(guard);
        op.abort(Error::Cancelled);
      }
    }
  }

  /// Pulls operation `id` out of its queue and resolves it as cancelled.
  ///
  /// Does nothing if the operation already left the queue.
  fn cancel(&self, side: Side, id: u64) {
    let removed = {
      let mut inner = self.inner.lock();
      let queue = inner.queue(side);
      queue
        .iter()
        .position(|queued| queued.id == id)
        .and_then(|index| queue.remove(index))
    };

    if let Some(queued) = removed {
      tracing::trace!(key = self.key, ?side, op = id, "operation cancelled");
      queued.op.abort(Error::Cancelled);
    }
  }

  /// Retries queued operations after readiness, oldest first, collecting the
  /// ones that finished into `completed`.
  pub(crate) fn on_ready(
    &self,
    interest: Interest,
    completed: &mut Vec<Box<dyn PendingOp>>,
  ) {
    let mut guard = self.inner.lock();
    let SourceInner { handle, readers, writers, .. } = &mut *guard;
    let Some(handle) = handle.as_ref() else {
      return;
    };

    if interest.is_readable() {
      drive(readers, handle, completed);
    }
    if interest.is_writable() {
      drive(writers, handle, completed);
    }
  }

  /// Half-closes the socket and fails the operations queued in the closed
  /// direction(s).
  pub(crate) fn shutdown(&self, how: Shutdown) -> Result<()> {
    let aborted = {
      let mut inner = self.inner.lock();
      let Some(handle) = inner.handle.as_ref() else {
        return Err(self.kind.closed_error());
      };
      handle.shutdown(how)?;

      let mut aborted = Vec::new();
      if matches!(how, Shutdown::Read | Shutdown::Both) {
        inner.read_shut = true;
        aborted.extend(inner.readers.drain(..));
      }
      if matches!(how, Shutdown::Write | Shutdown::Both) {
        inner.write_shut = true;
        aborted.extend(inner.writers.drain(..));
      }
      aborted
    };

    for queued in aborted {
      queued.op.abort(Error::ConnectionClosed);
    }
    Ok(())
  }

  /// Deregisters and closes the handle, failing every queued operation.
  ///
  /// Returns `false` if the source was already closed.
  pub(crate) fn close(&self) -> bool {
    let (handle, aborted) = {
      let mut inner = self.inner.lock();
      let Some(handle) = inner.handle.take() else {
        return false;
      };
      self.dispatcher.deregister(self.key, handle.as_raw_fd());

      let mut aborted: Vec<Queued> = inner.readers.drain(..).collect();
      aborted.extend(inner.writers.drain(..));
      (handle, aborted)
    };

    tracing::trace!(
      key = self.key,
      kind = ?self.kind,
      pending = aborted.len(),
      "source closed"
    );
    for queued in aborted {
      queued.op.abort(self.kind.closed_error());
    }
    drop(handle);
    true
  }
}

/// Clears the side's in-flight flag right before the wrapped operation is
/// resolved, so its continuation may already submit the next one.
struct Exclusive {
  op: Box<dyn PendingOp>,
  source: Weak<Source>,
  side: Side,
}

impl Exclusive {
  fn release(&self) {
    if let Some(source) = self.source.upgrade() {
      *source.inner.lock().in_flight(self.side) = false;
    }
  }
}

impl PendingOp for Exclusive {
  fn attempt(&mut self, handle: &SocketHandle) -> Poll<()> {
    self.op.attempt(handle)
  }

  fn complete(self: Box<Self>) {
    let this = *self;
    this.release();
    this.op.complete();
  }

  fn abort(self: Box<Self>, err: Error) {
    let this = *self;
    this.release();
    this.op.abort(err);
  }
}

impl std::fmt::Debug for Source {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Source")
      .field("key", &self.key)
      .field("kind", &self.kind)
      .finish_non_exhaustive()
  }
}

impl Drop for Source {
  fn drop(&mut self) {
    self.close();
  }
}

fn drive(
  queue: &mut VecDeque<Queued>,
  handle: &SocketHandle,
  completed: &mut Vec<Box<dyn PendingOp>>,
) {
  while let Some(front) = queue.front_mut() {
    if front.op.attempt(handle).is_pending() {
      break;
    }
    if let Some(queued) = queue.pop_front() {
      completed.push(queued.op);
    }
  }
}
