//! The transport: a set of dispatchers plus the shared buffer pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use tracing::{debug, debug_span, error};

use crate::buf::BufferPool;
use crate::cancel::CancellationToken;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::listener::Listener;
use crate::sync::Mutex;

/// Entry point for creating listeners.
///
/// Cloning is cheap; clones share the same dispatchers and pool. Worker
/// threads stop once the last clone, listener and connection are gone.
#[derive(Clone)]
pub struct Transport {
  shared: Arc<Shared>,
}

struct Shared {
  config: Config,
  dispatchers: Vec<Arc<Dispatcher>>,
  next: AtomicUsize,
  pool: BufferPool,
  workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Transport {
  /// Creates the dispatchers and spawns one worker thread per dispatcher.
  ///
  /// Each worker drains its dispatcher in a loop, so continuations run on a
  /// thread named `<thread_name>-<index>`.
  pub fn new(config: Config) -> Result<Self> {
    let transport = Self::manual(config)?;

    let mut workers = Vec::with_capacity(transport.shared.dispatchers.len());
    for dispatcher in &transport.shared.dispatchers {
      let name = format!("{}-{}", transport.shared.config.thread_name, dispatcher.id());
      let dispatcher = Arc::clone(dispatcher);
      let spawned = thread::Builder::new().name(name).spawn(move || run(&dispatcher));

      match spawned {
        Ok(handle) => workers.push(handle),
        Err(err) => {
          // Dropping `transport` stops the workers spawned so far.
          *transport.shared.workers.lock() = workers;
          return Err(err.into());
        }
      }
    }
    *transport.shared.workers.lock() = workers;

    debug!(
      dispatchers = transport.shared.dispatchers.len(),
      segment_size = transport.shared.config.segment_size,
      "transport started"
    );
    Ok(transport)
  }

  /// Creates the dispatchers without worker threads.
  ///
  /// Nothing completes asynchronously until the caller drains the
  /// dispatchers with [`Dispatcher::drain`].
  pub fn manual(config: Config) -> Result<Self> {
    config.validate()?;

    let dispatchers = (0..config.dispatcher_threads)
      .map(|id| Dispatcher::new(id, &config))
      .collect::<Result<Vec<_>>>()?;
    let pool = BufferPool::new(config.segment_size, config.segment_count);

    Ok(Self {
      shared: Arc::new(Shared {
        config,
        dispatchers,
        next: AtomicUsize::new(0),
        pool,
        workers: Mutex::new(Vec::new()),
      }),
    })
  }

  pub fn config(&self) -> &Config {
    &self.shared.config
  }

  /// Pool of fixed-size segments usable as receive and send buffers.
  pub fn pool(&self) -> &BufferPool {
    &self.shared.pool
  }

  pub fn dispatchers(&self) -> &[Arc<Dispatcher>] {
    &self.shared.dispatchers
  }

  /// A fresh token. With [`Config::default_timeout`] set it fires on its own
  /// after that long.
  pub fn token(&self) -> CancellationToken {
    let token = CancellationToken::new();
    if let Some(timeout) = self.shared.config.default_timeout {
      token.cancel_after(timeout);
    }
    token
  }

  /// A listener in the `Created` state.
  pub fn listener(&self) -> Listener {
    Listener::new(self)
  }

  /// Picks the dispatcher for a new handle, round-robin.
  pub(crate) fn next_dispatcher(&self) -> &Arc<Dispatcher> {
    let dispatchers = &self.shared.dispatchers;
    let index = self.shared.next.fetch_add(1, Ordering::Relaxed) % dispatchers.len();
    &dispatchers[index]
  }
}

fn run(dispatcher: &Dispatcher) {
  let _span = debug_span!("dispatcher", id = dispatcher.id()).entered();
  debug!("dispatcher worker started");

  while !dispatcher.is_stopping() {
    if let Err(err) = dispatcher.drain(None) {
      error!(error = %err, "dispatcher worker exiting");
      return;
    }
  }
  debug!("dispatcher worker stopped");
}

impl Drop for Shared {
  fn drop(&mut self) {
    for dispatcher in &self.dispatchers {
      dispatcher.stop();
    }

    let current = thread::current().id();
    for worker in self.workers.get_mut().drain(..) {
      // The last handle can be released by a continuation on a worker.
      if worker.thread().id() == current {
        continue;
      }
      if worker.join().is_err() {
        error!("dispatcher worker panicked");
      }
    }
  }
}

impl std::fmt::Debug for Transport {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Transport")
      .field("dispatchers", &self.shared.dispatchers)
      .field("pool", &self.shared.pool)
      .finish()
  }
}
