//! Completion dispatcher.
//!
//! A dispatcher owns one readiness context (`epoll`/`kqueue`) and the table of
//! sources registered with it. [`Dispatcher::drain`] waits for readiness and
//! then, on the calling thread, retries the queued operations of every ready
//! source and runs the continuations of those that finished. No completion is
//! handed off to another thread.
//!
//! A handle is registered with exactly one dispatcher for its lifetime, so all
//! of its completions are observed, in order, by the same thread.

use std::io;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{error, trace, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::op::PendingOp;
use crate::source::{Source, SourceKind};
use crate::store::Slab;
use crate::sync::Mutex;
use crate::sys::SocketHandle;
use crate::sys::poll::{Events, Poller, ReadinessPoll};

pub struct Dispatcher {
  id: usize,
  poller: Poller,
  sources: Mutex<Slab<Weak<Source>>>,
  events: Mutex<Events>,
  max_registrations: usize,
  failed: AtomicBool,
  stopping: AtomicBool,
}

impl Dispatcher {
  pub(crate) fn new(id: usize, config: &Config) -> Result<Arc<Self>> {
    Ok(Arc::new(Self {
      id,
      poller: Poller::new()?,
      sources: Mutex::new(Slab::with_capacity(64)),
      events: Mutex::new(Events::with_capacity(config.event_capacity)),
      max_registrations: config.max_registrations,
      failed: AtomicBool::new(false),
      stopping: AtomicBool::new(false),
    }))
  }

  pub fn id(&self) -> usize {
    self.id
  }

  /// Number of handles currently registered.
  pub fn registered(&self) -> usize {
    self.sources.lock().len()
  }

  /// `true` once the readiness context failed. A failed dispatcher accepts
  /// no new registrations.
  pub fn is_failed(&self) -> bool {
    self.failed.load(Ordering::Acquire)
  }

  /// Associates `handle` with this dispatcher.
  ///
  /// Fails with [`Error::Registration`] if the handle is already registered,
  /// cannot be polled, the table is full, or the dispatcher has failed. The
  /// handle is closed on failure.
  pub(crate) fn register(
    self: &Arc<Self>,
    handle: SocketHandle,
    kind: SourceKind,
  ) -> Result<Arc<Source>> {
    if self.is_failed() {
      return Err(Error::Registration(io::Error::other(
        "dispatcher has failed",
      )));
    }

    let mut sources = self.sources.lock();
    if sources.len() >= self.max_registrations {
      warn!(
        dispatcher = self.id,
        max = self.max_registrations,
        "registration table full"
      );
      return Err(Error::Registration(io::Error::from_raw_os_error(
        libc::ENOSPC,
      )));
    }

    let key = sources.vacant_key();
    let fd = handle.as_raw_fd();
    if let Err(err) = self.poller.add(fd, key) {
      drop(sources);
      warn!(dispatcher = self.id, fd, error = %err, "failed to register handle");
      return Err(Error::Registration(err));
    }

    let source = Arc::new(Source::new(key, kind, handle, Arc::clone(self)));
    let inserted = sources.insert(Arc::downgrade(&source));
    debug_assert_eq!(inserted, key);
    drop(sources);

    trace!(dispatcher = self.id, key, fd, ?kind, "registered handle");
    Ok(source)
  }

  /// Removes a source's registration. Called by the source while it closes.
  pub(crate) fn deregister(&self, key: u64, fd: std::os::fd::RawFd) {
    match self.poller.delete(fd) {
      Err(err) if err.raw_os_error() != Some(libc::ENOENT) => {
        warn!(dispatcher = self.id, key, error = %err, "failed to deregister handle");
      }
      _ => {}
    }
    let removed = self.sources.lock().remove(key);
    drop(removed);
  }

  /// Waits up to `timeout` (forever with `None`) for readiness, then
  /// completes every operation that became completable, running its
  /// continuation on this thread.
  ///
  /// Returns the number of operations resolved. A timeout, a wake-up through
  /// [`Dispatcher::notify`] or a signal interrupting the wait all return
  /// `Ok(0)`.
  ///
  /// One thread drains a dispatcher at a time; concurrent callers wait for
  /// each other. Continuations must not call `drain` on their own
  /// dispatcher.
  pub fn drain(&self, timeout: Option<Duration>) -> Result<usize> {
    if self.is_failed() {
      return Err(Error::DispatcherFatal(io::Error::other(
        "dispatcher has already failed",
      )));
    }

    let mut completed: Vec<Box<dyn PendingOp>> = Vec::new();
    {
      let mut events = self.events.lock();
      match events.fill(&self.poller, timeout) {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(0),
        Err(err) => {
          drop(events);
          self.fail(&err);
          return Err(Error::DispatcherFatal(err));
        }
      }

      let ready: Vec<_> = {
        let sources = self.sources.lock();
        events
          .iter()
          .filter_map(|event| {
            let source = sources.get(event.key)?.upgrade()?;
            Some((source, event.interest))
          })
          .collect()
      };

      for (source, interest) in &ready {
        source.on_ready(*interest, &mut completed);
      }
    }

    let resolved = completed.len();
    for op in completed {
      op.complete();
    }
    Ok(resolved)
  }

  /// Wakes a thread blocked in [`Dispatcher::drain`].
  pub fn notify(&self) -> Result<()> {
    self.poller.notify()?;
    Ok(())
  }

  /// Tears the dispatcher down after its readiness context failed.
  ///
  /// Every registered source is closed, so its pending operations resolve
  /// with [`Error::ListenerClosed`] or [`Error::ConnectionClosed`], and later
  /// ones fail the same way.
  pub(crate) fn fail(&self, err: &io::Error) {
    if self.failed.swap(true, Ordering::AcqRel) {
      return;
    }
    error!(dispatcher = self.id, error = %err, "dispatcher failed, closing all handles");

    let registered = self.sources.lock().drain();
    for source in registered.iter().filter_map(Weak::upgrade) {
      source.close();
    }
  }

  pub(crate) fn stop(&self) {
    self.stopping.store(true, Ordering::Release);
    if let Err(err) = self.poller.notify() {
      warn!(dispatcher = self.id, error = %err, "failed to wake dispatcher");
    }
  }

  pub(crate) fn is_stopping(&self) -> bool {
    self.stopping.load(Ordering::Acquire)
  }
}

impl std::fmt::Debug for Dispatcher {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Dispatcher")
      .field("id", &self.id)
      .field("registered", &self.registered())
      .field("failed", &self.is_failed())
      .finish()
  }
}
