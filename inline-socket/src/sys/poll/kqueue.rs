use super::{Interest, NOTIFY_KEY, ReadinessPoll};
use crate::sync::Mutex;

use std::collections::HashSet;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use std::{io, ptr};

/// Identifier of the `EVFILT_USER` wake-up event.
const NOTIFY_IDENT: libc::uintptr_t = 0;

/// Wrapper around a kqueue file descriptor.
pub(crate) struct OsPoller {
  kq_fd: OwnedFd,
  /// Track registered fds to match epoll's strict add/delete semantics.
  registered_fds: Mutex<HashSet<RawFd>>,
}

impl OsPoller {
  pub(crate) fn new() -> io::Result<Self> {
    // SAFETY: kqueue just returned this descriptor.
    let kq_fd = unsafe { OwnedFd::from_raw_fd(syscall!(kqueue())?) };
    syscall!(fcntl(kq_fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC))?;

    let poller = Self { kq_fd, registered_fds: Mutex::new(HashSet::new()) };
    poller.submit_changes(&[kevent(
      NOTIFY_IDENT,
      libc::EVFILT_USER,
      libc::EV_ADD | libc::EV_CLEAR,
      0,
      NOTIFY_KEY,
    )])?;

    Ok(poller)
  }

  /// Applies `changes`, reporting per-change failures through `EV_RECEIPT`.
  fn submit_changes(&self, changes: &[libc::kevent]) -> io::Result<()> {
    let mut changes = changes.to_vec();
    for change in &mut changes {
      change.flags |= libc::EV_RECEIPT;
    }
    let mut receipts = changes.clone();

    let n = syscall!(kevent(
      self.kq_fd.as_raw_fd(),
      changes.as_ptr(),
      changes.len() as libc::c_int,
      receipts.as_mut_ptr(),
      receipts.len() as libc::c_int,
      ptr::null(),
    ))?;

    for receipt in &receipts[..n as usize] {
      if receipt.flags & libc::EV_ERROR != 0 && receipt.data != 0 {
        return Err(io::Error::from_raw_os_error(receipt.data as i32));
      }
    }
    Ok(())
  }
}

fn kevent(
  ident: libc::uintptr_t,
  filter: i16,
  flags: u16,
  fflags: u32,
  key: u64,
) -> libc::kevent {
  // SAFETY: kevent is plain old data.
  let mut event: libc::kevent = unsafe { std::mem::zeroed() };
  event.ident = ident;
  event.filter = filter as _;
  event.flags = flags as _;
  event.fflags = fflags;
  event.udata = key as usize as *mut libc::c_void;
  event
}

impl ReadinessPoll for OsPoller {
  type NativeEvent = libc::kevent;

  fn add(&self, fd: RawFd, key: u64) -> io::Result<()> {
    let mut registered = self.registered_fds.lock();
    if !registered.insert(fd) {
      return Err(io::Error::from_raw_os_error(libc::EEXIST));
    }

    let flags = libc::EV_ADD | libc::EV_CLEAR;
    let result = self.submit_changes(&[
      kevent(fd as libc::uintptr_t, libc::EVFILT_READ, flags, 0, key),
      kevent(fd as libc::uintptr_t, libc::EVFILT_WRITE, flags, 0, key),
    ]);
    if result.is_err() {
      registered.remove(&fd);
    }
    result
  }

  fn delete(&self, fd: RawFd) -> io::Result<()> {
    if !self.registered_fds.lock().remove(&fd) {
      return Err(io::Error::from_raw_os_error(libc::ENOENT));
    }

    let result = self.submit_changes(&[
      kevent(fd as libc::uintptr_t, libc::EVFILT_READ, libc::EV_DELETE, 0, 0),
      kevent(fd as libc::uintptr_t, libc::EVFILT_WRITE, libc::EV_DELETE, 0, 0),
    ]);
    match result {
      // Closing the descriptor already dropped its filters.
      Err(err) if err.raw_os_error() == Some(libc::ENOENT) => Ok(()),
      other => other,
    }
  }

  fn wait(
    &self,
    events: &mut [Self::NativeEvent],
    timeout: Option<Duration>,
  ) -> io::Result<usize> {
    let timeout = timeout.map(|t| libc::timespec {
      tv_sec: t.as_secs() as libc::time_t,
      tv_nsec: t.subsec_nanos() as libc::c_long,
    });
    let timeout_ptr =
      timeout.as_ref().map_or(ptr::null(), |ts| ts as *const libc::timespec);

    let n = syscall!(kevent(
      self.kq_fd.as_raw_fd(),
      ptr::null(),
      0,
      events.as_mut_ptr(),
      events.len() as libc::c_int,
      timeout_ptr,
    ))?;

    Ok(n as usize)
  }

  fn notify(&self) -> io::Result<()> {
    self.submit_changes(&[kevent(
      NOTIFY_IDENT,
      libc::EVFILT_USER,
      0,
      libc::NOTE_TRIGGER,
      NOTIFY_KEY,
    )])
  }

  fn event_key(event: &Self::NativeEvent) -> u64 {
    event.udata as usize as u64
  }

  fn event_interest(event: &Self::NativeEvent) -> Interest {
    let failed = event.flags & libc::EV_ERROR != 0;
    match event.filter {
      _ if failed => Interest::READ_AND_WRITE,
      libc::EVFILT_READ => Interest::READ,
      libc::EVFILT_WRITE => Interest::WRITE,
      _ => Interest::NONE,
    }
  }
}
