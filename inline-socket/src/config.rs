//! Transport configuration.

use std::num::NonZeroUsize;
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};

/// Plain-value settings consumed by [`Transport::new`](crate::Transport::new).
///
/// ```ignore
/// let config = Config::default()
///   .with_dispatcher_threads(2)
///   .with_segment_size(16 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
  /// Number of dispatchers, each drained by its own worker thread.
  ///
  /// Default: the number of available cores.
  pub dispatcher_threads: usize,

  /// Size in bytes of each [`Segment`](crate::buf::Segment) in the pool.
  ///
  /// Default: 4096
  pub segment_size: usize,

  /// Number of segments preallocated in the pool.
  ///
  /// This bounds what the pool keeps, not what it hands out:
  /// [`BufferPool::get`](crate::BufferPool::get) allocates past it when every
  /// segment is in use, while
  /// [`BufferPool::try_get`](crate::BufferPool::try_get) does not.
  ///
  /// Default: 128
  pub segment_count: usize,

  /// `listen(2)` backlog.
  ///
  /// Default: 128
  pub backlog: i32,

  /// Readiness events fetched per wait call.
  ///
  /// Default: 512
  pub event_capacity: usize,

  /// Upper bound on handles registered with a single dispatcher.
  ///
  /// Default: 4096
  pub max_registrations: usize,

  /// Sets `SO_REUSEADDR` on IP listeners.
  ///
  /// Default: true
  pub reuse_address: bool,

  /// When set, tokens from [`Transport::token`](crate::Transport::token)
  /// fire after this long.
  ///
  /// Default: None
  pub default_timeout: Option<Duration>,

  /// Prefix of worker thread names. Workers are named `<prefix>-<index>`.
  pub thread_name: String,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      dispatcher_threads: thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1),
      segment_size: 4096,
      segment_count: 128,
      backlog: 128,
      event_capacity: 512,
      max_registrations: 4096,
      reuse_address: true,
      default_timeout: None,
      thread_name: "inline-socket".to_owned(),
    }
  }
}

impl Config {
  pub fn with_dispatcher_threads(mut self, threads: usize) -> Self {
    self.dispatcher_threads = threads;
    self
  }

  pub fn with_segment_size(mut self, size: usize) -> Self {
    self.segment_size = size;
    self
  }

  pub fn with_segment_count(mut self, count: usize) -> Self {
    self.segment_count = count;
    self
  }

  pub fn with_backlog(mut self, backlog: i32) -> Self {
    self.backlog = backlog;
    self
  }

  pub fn with_event_capacity(mut self, capacity: usize) -> Self {
    self.event_capacity = capacity;
    self
  }

  pub fn with_max_registrations(mut self, max: usize) -> Self {
    self.max_registrations = max;
    self
  }

  pub fn with_reuse_address(mut self, reuse: bool) -> Self {
    self.reuse_address = reuse;
    self
  }

  pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.default_timeout = timeout;
    self
  }

  pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
    self.thread_name = name.into();
    self
  }

  pub fn validate(&self) -> Result<()> {
    if self.dispatcher_threads == 0 {
      return Err(Error::InvalidConfig("dispatcher_threads must be at least 1"));
    }
    if self.segment_size == 0 {
      return Err(Error::InvalidConfig("segment_size must be non-zero"));
    }
    if self.backlog < 1 {
      return Err(Error::InvalidConfig("backlog must be positive"));
    }
    if self.event_capacity == 0 {
      return Err(Error::InvalidConfig("event_capacity must be non-zero"));
    }
    if self.max_registrations == 0
      || self.max_registrations > u32::MAX as usize
    {
      return Err(Error::InvalidConfig(
        "max_registrations must be between 1 and u32::MAX",
      ));
    }
    Ok(())
  }
}
