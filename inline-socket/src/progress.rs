//! Handles to operations that may complete later.
//!
//! Every `accept`, `receive` and `send` returns a [`Progress`]. The operation
//! either completed synchronously while being submitted, or it is queued on a
//! dispatcher and resolves on that dispatcher's thread. Both paths deliver the
//! result the same way.
//!
//! A result is consumed through exactly one of:
//!
//! - `.await` ([`Progress`] is a [`Future`]),
//! - [`Progress::wait`] / [`Progress::wait_timeout`] to block the caller,
//! - [`Progress::when_done`] to run a callback inline on the resolving thread,
//! - [`Progress::send`] to receive it on a channel.
//!
//! Dropping a [`Progress`] detaches the operation. It stays queued until it
//! completes, is cancelled, or its socket closes; the result is then dropped
//! and any buffer it carried is released.

use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use crate::sync::Mutex;

const WAITING: u8 = 0;
const RESOLVED: u8 = 1;

type Callback<T> = Box<dyn FnOnce(T) + Send>;

enum Notifier<T> {
  None,
  Waker(Waker),
  Callback(Callback<T>),
  Detached,
}

struct Slot<T> {
  value: Option<T>,
  notifier: Notifier<T>,
}

/// The resolve side of an operation.
///
/// Resolution is a compare-and-set on `state`: the first resolver wins, and
/// every later attempt gets its value back untouched.
pub(crate) struct Completion<T> {
  state: AtomicU8,
  slot: Mutex<Slot<T>>,
}

impl<T> Completion<T> {
  pub(crate) fn new() -> Arc<Self> {
    Arc::new(Self {
      state: AtomicU8::new(WAITING),
      slot: Mutex::new(Slot { value: None, notifier: Notifier::None }),
    })
  }

  pub(crate) fn is_resolved(&self) -> bool {
    self.state.load(Ordering::Acquire) == RESOLVED
  }

  /// Delivers `value`, running a registered callback on the calling thread.
  ///
  /// Returns `Err(value)` if the completion was already resolved.
  pub(crate) fn resolve(&self, value: T) -> Result<(), T> {
    if self
      .state
      .compare_exchange(WAITING, RESOLVED, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      return Err(value);
    }

    let mut slot = self.slot.lock();
    match mem::replace(&mut slot.notifier, Notifier::None) {
      Notifier::None => slot.value = Some(value),
      Notifier::Waker(waker) => {
        slot.value = Some(value);
        drop(slot);
        waker.wake();
      }
      Notifier::Callback(callback) => {
        drop(slot);
        callback(value);
      }
      Notifier::Detached => {
        slot.notifier = Notifier::Detached;
        drop(slot);
        drop(value);
      }
    }
    Ok(())
  }
}

/// A pending or completed operation.
#[must_use = "dropping a Progress detaches the operation and discards its result"]
pub struct Progress<T> {
  completion: Option<Arc<Completion<T>>>,
}

impl<T> Progress<T> {
  pub(crate) fn new(completion: Arc<Completion<T>>) -> Self {
    Self { completion: Some(completion) }
  }

  /// A progress that already holds its result.
  pub(crate) fn ready(value: T) -> Self {
    let completion = Completion::new();
    let _ = completion.resolve(value);
    Self::new(completion)
  }

  /// `true` once the result is available.
  pub fn is_complete(&self) -> bool {
    self.completion.as_ref().is_some_and(|completion| completion.is_resolved())
  }

  /// Runs `callback` with the result.
  ///
  /// If the operation already completed the callback runs right away on the
  /// calling thread; otherwise it runs on the dispatcher thread that resolves
  /// the operation, or on the thread that cancels it.
  pub fn when_done<F>(mut self, callback: F)
  where
    F: FnOnce(T) + Send + 'static,
  {
    let Some(completion) = self.completion.take() else {
      return;
    };

    let mut slot = completion.slot.lock();
    match slot.value.take() {
      Some(value) => {
        drop(slot);
        callback(value);
      }
      None => slot.notifier = Notifier::Callback(Box::new(callback)),
    }
  }

  /// Delivers the result on a channel.
  pub fn send(self) -> crossbeam_channel::Receiver<T>
  where
    T: Send + 'static,
  {
    let (sender, receiver) = crossbeam_channel::bounded(1);
    self.when_done(move |value| {
      let _ = sender.send(value);
    });
    receiver
  }

  /// Blocks the calling thread until the result is available.
  pub fn wait(mut self) -> T {
    loop {
      if let Some(value) = self.take_or_park(None) {
        return value;
      }
    }
  }

  /// Blocks for at most `timeout`.
  ///
  /// On timeout the operation is handed back still pending.
  pub fn wait_timeout(mut self, timeout: Duration) -> Result<T, Self> {
    let deadline = Instant::now() + timeout;
    loop {
      let now = Instant::now();
      if now >= deadline {
        return match self.take_value() {
          Some(value) => Ok(value),
          None => Err(self),
        };
      }
      if let Some(value) = self.take_or_park(Some(deadline - now)) {
        return Ok(value);
      }
    }
  }

  fn completion(&self) -> &Arc<Completion<T>> {
    match &self.completion {
      Some(completion) => completion,
      None => panic!("Progress result was already taken"),
    }
  }

  fn take_value(&mut self) -> Option<T> {
    let completion = self.completion();
    let mut slot = completion.slot.lock();
    let value = slot.value.take();
    if value.is_none() {
      slot.notifier = Notifier::None;
    }
    value
  }

  /// Takes the value, or parks the thread until woken (or `timeout`).
  fn take_or_park(&mut self, timeout: Option<Duration>) -> Option<T> {
    let completion = self.completion();
    {
      let mut slot = completion.slot.lock();
      if let Some(value) = slot.value.take() {
        return Some(value);
      }
      let waker = Waker::from(Arc::new(ThreadWaker(thread::current())));
      slot.notifier = Notifier::Waker(waker);
    }

    match timeout {
      Some(timeout) => thread::park_timeout(timeout),
      None => thread::park(),
    }
    None
  }
}

struct ThreadWaker(Thread);

impl Wake for ThreadWaker {
  fn wake(self: Arc<Self>) {
    self.0.unpark();
  }

  fn wake_by_ref(self: &Arc<Self>) {
    self.0.unpark();
  }
}

impl<T> Future for Progress<T> {
  type Output = T;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
    let Some(completion) = self.completion.as_ref() else {
      panic!("Progress polled after completion");
    };

    let mut slot = completion.slot.lock();
    if let Some(value) = slot.value.take() {
      drop(slot);
      self.completion = None;
      return Poll::Ready(value);
    }

    match &slot.notifier {
      Notifier::Waker(waker) if waker.will_wake(cx.waker()) => {}
      _ => slot.notifier = Notifier::Waker(cx.waker().clone()),
    }
    Poll::Pending
  }
}

impl<T> Drop for Progress<T> {
  fn drop(&mut self) {
    let Some(completion) = self.completion.take() else {
      return;
    };

    let value = {
      let mut slot = completion.slot.lock();
      slot.notifier = Notifier::Detached;
      slot.value.take()
    };
    drop(value);
  }
}

impl<T> std::fmt::Debug for Progress<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Progress").field("complete", &self.is_complete()).finish()
  }
}
