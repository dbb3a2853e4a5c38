//! Readiness polling: `epoll` on Linux, `kqueue` on the BSDs and Apple
//! platforms.
//!
//! Sockets are registered once, edge-triggered, for both directions. The
//! dispatcher keeps per-direction queues and drives them until the syscall
//! would block again, so no re-arming is needed after an event.

#[cfg(linux)]
mod epoll;
#[cfg(linux)]
use epoll as os;

#[cfg(kqueue)]
mod kqueue;
#[cfg(kqueue)]
use kqueue as os;

#[cfg(not(any(linux, kqueue)))]
compile_error!("inline-socket supports Linux (epoll) and kqueue platforms only");

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

pub(crate) use os::OsPoller as Poller;

/// Key reserved for the poller's own wake-up source.
pub(crate) const NOTIFY_KEY: u64 = u64::MAX;

/// OS-specific readiness polling.
///
/// - **epoll**: one registration carries both directions.
/// - **kqueue**: read and write are separate filters on the same ident.
pub(crate) trait ReadinessPoll {
  /// The native event type used by this implementation.
  type NativeEvent;

  /// Starts watching `fd` for both directions, edge-triggered.
  ///
  /// Fails if `fd` is already registered (where the OS can tell) or cannot be
  /// polled.
  fn add(&self, fd: RawFd, key: u64) -> io::Result<()>;

  /// Stops watching `fd`. Fails with `ENOENT` if it was not registered.
  fn delete(&self, fd: RawFd) -> io::Result<()>;

  /// Waits for events, filling `events` from the start.
  ///
  /// Returns the number of events written. Wake-ups caused by
  /// [`ReadinessPoll::notify`] are consumed here and reported with
  /// [`NOTIFY_KEY`].
  fn wait(
    &self,
    events: &mut [Self::NativeEvent],
    timeout: Option<Duration>,
  ) -> io::Result<usize>;

  /// Wakes up a thread blocked in [`ReadinessPoll::wait`].
  fn notify(&self) -> io::Result<()>;

  fn event_key(event: &Self::NativeEvent) -> u64;

  fn event_interest(event: &Self::NativeEvent) -> Interest;
}

/// Readiness directions of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Interest {
  bits: u8,
}

impl Interest {
  pub const NONE: Self = Self { bits: 0 };
  pub const READ: Self = Self { bits: 1 << 0 };
  pub const WRITE: Self = Self { bits: 1 << 1 };
  pub const READ_AND_WRITE: Self =
    Self { bits: Self::READ.bits | Self::WRITE.bits };

  pub const fn is_readable(self) -> bool {
    self.bits & Self::READ.bits != 0
  }

  pub const fn is_writable(self) -> bool {
    self.bits & Self::WRITE.bits != 0
  }

  pub const fn or(self, other: Self) -> Self {
    Self { bits: self.bits | other.bits }
  }
}

impl std::ops::BitOr for Interest {
  type Output = Self;

  fn bitor(self, rhs: Self) -> Self::Output {
    self.or(rhs)
  }
}

/// A readiness event from the poller.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Event {
  pub key: u64,
  pub interest: Interest,
}

type NativeEvent = <Poller as ReadinessPoll>::NativeEvent;

/// Reusable buffer the OS writes events into.
pub(crate) struct Events {
  events: Vec<NativeEvent>,
}

// SAFETY: kevent carries a udata pointer that is only ever used as an integer
// key, never dereferenced.
unsafe impl Send for Events {}

impl Events {
  pub(crate) fn with_capacity(capacity: usize) -> Self {
    // SAFETY: epoll_event and kevent are C structs for which all-zero is a
    // valid value.
    Self { events: vec![unsafe { std::mem::zeroed() }; capacity] }
  }

  /// Waits on `poller` and keeps the first `n` written events.
  pub(crate) fn fill(
    &mut self,
    poller: &Poller,
    timeout: Option<Duration>,
  ) -> io::Result<usize> {
    let capacity = self.events.capacity();
    self.events.clear();

    // SAFETY: the slice spans the vector's allocation; the elements are
    // plain old data and only the first `n`, written by the OS, are kept.
    let raw = unsafe {
      std::slice::from_raw_parts_mut(self.events.as_mut_ptr(), capacity)
    };
    let n = poller.wait(raw, timeout)?;
    assert!(n <= capacity, "poller returned more events than requested");

    // SAFETY: the OS initialized the first n elements.
    unsafe { self.events.set_len(n) };
    Ok(n)
  }

  /// Events for registered sources, skipping wake-ups.
  pub(crate) fn iter(&self) -> impl Iterator<Item = Event> + '_ {
    self
      .events
      .iter()
      .map(|native| Event {
        key: Poller::event_key(native),
        interest: Poller::event_interest(native),
      })
      .filter(|event| event.key != NOTIFY_KEY)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;
  use std::os::fd::AsRawFd;
  use std::os::unix::net::UnixStream;
  use std::sync::Arc;
  use std::thread;
  use std::time::Instant;

  #[test]
  fn wait_times_out_without_events() {
    let poller = Poller::new().unwrap();
    let mut events = Events::with_capacity(8);
    let n = events.fill(&poller, Some(Duration::from_millis(10))).unwrap();
    assert_eq!(n, 0);
  }

  #[test]
  fn readable_socket_is_reported_with_key() {
    let poller = Poller::new().unwrap();
    let (a, mut b) = UnixStream::pair().unwrap();
    a.set_nonblocking(true).unwrap();
    poller.add(a.as_raw_fd(), 7).unwrap();

    b.write_all(b"x").unwrap();

    let mut events = Events::with_capacity(8);
    let deadline = Instant::now() + Duration::from_secs(5);
    let readable = loop {
      events.fill(&poller, Some(Duration::from_millis(100))).unwrap();
      if let Some(event) = events
        .iter()
        .find(|event| event.key == 7 && event.interest.is_readable())
      {
        break event;
      }
      assert!(Instant::now() < deadline, "no readable event");
    };
    assert_eq!(readable.key, 7);

    poller.delete(a.as_raw_fd()).unwrap();
    assert_eq!(
      poller.delete(a.as_raw_fd()).unwrap_err().raw_os_error(),
      Some(libc::ENOENT)
    );
  }

  #[test]
  fn notify_wakes_blocked_wait() {
    let poller = Arc::new(Poller::new().unwrap());

    let waiter = {
      let poller = Arc::clone(&poller);
      thread::spawn(move || {
        let mut events = Events::with_capacity(8);
        events.fill(&poller, Some(Duration::from_secs(10))).unwrap();
        events.iter().count()
      })
    };

    thread::sleep(Duration::from_millis(20));
    poller.notify().unwrap();

    let started = Instant::now();
    let user_events = waiter.join().unwrap();
    assert_eq!(user_events, 0);
    assert!(started.elapsed() < Duration::from_secs(5));
  }
}
