//! Cooperative cancellation.
//!
//! A [`CancellationToken`] is handed to `accept`, `receive` and `send`. When
//! it fires while the operation is still queued on its dispatcher, the
//! operation is pulled out of the queue and resolves with
//! [`Error::Cancelled`](crate::Error::Cancelled). An operation that already
//! completed is unaffected: exactly one of completion and cancellation wins.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crate::sync::Mutex;

type Callback = Box<dyn FnOnce() + Send>;

/// A shareable, one-shot cancellation signal.
///
/// Clones observe and trigger the same signal.
#[derive(Clone, Default)]
pub struct CancellationToken {
  inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
  cancelled: AtomicBool,
  callbacks: Mutex<Callbacks>,
}

#[derive(Default)]
struct Callbacks {
  next_id: u64,
  entries: Vec<(u64, Callback)>,
}

impl CancellationToken {
  pub fn new() -> Self {
    Self::default()
  }

  /// Fires the token.
  ///
  /// Callbacks of operations waiting on this token run on the calling thread
  /// before this returns. Calling it again is a no-op.
  pub fn cancel(&self) {
    if self.inner.cancelled.swap(true, Ordering::AcqRel) {
      return;
    }

    let entries = mem::take(&mut self.inner.callbacks.lock().entries);
    for (_, callback) in entries {
      callback();
    }
  }

  pub fn is_cancelled(&self) -> bool {
    self.inner.cancelled.load(Ordering::Acquire)
  }

  /// Fires the token once `timeout` has elapsed.
  ///
  /// The timer holds no strong reference: if every clone is dropped first
  /// nothing happens.
  pub fn cancel_after(&self, timeout: Duration) {
    let weak = Arc::downgrade(&self.inner);
    let spawned = thread::Builder::new()
      .name("inline-socket-timeout".into())
      .spawn(move || {
        thread::sleep(timeout);
        if let Some(inner) = weak.upgrade() {
          CancellationToken { inner }.cancel();
        }
      });

    if let Err(err) = spawned {
      tracing::warn!(error = %err, "failed to spawn cancellation timer, cancelling now");
      self.cancel();
    }
  }

  /// Runs `callback` when the token fires.
  ///
  /// Returns `None` without storing the callback if the token has already
  /// fired. Dropping the returned guard removes the callback.
  pub(crate) fn register<F>(&self, callback: F) -> Option<CancelGuard>
  where
    F: FnOnce() + Send + 'static,
  {
    let mut callbacks = self.inner.callbacks.lock();
    if self.is_cancelled() {
      return None;
    }

    let id = callbacks.next_id;
    callbacks.next_id += 1;
    callbacks.entries.push((id, Box::new(callback)));

    Some(CancelGuard { inner: Arc::downgrade(&self.inner), id })
  }
}

impl std::fmt::Debug for CancellationToken {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CancellationToken")
      .field("cancelled", &self.is_cancelled())
      .finish()
  }
}

/// Deregisters a cancellation callback on drop.
pub(crate) struct CancelGuard {
  inner: Weak<Inner>,
  id: u64,
}

impl Drop for CancelGuard {
  fn drop(&mut self) {
    let Some(inner) = self.inner.upgrade() else {
      return;
    };

    let removed = {
      let mut callbacks = inner.callbacks.lock();
      callbacks
        .entries
        .iter()
        .position(|(id, _)| *id == self.id)
        .map(|index| callbacks.entries.swap_remove(index))
    };
    // Dropped outside the lock: the callback may own an operation.
    drop(removed);
  }
}
