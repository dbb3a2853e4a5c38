use super::{Interest, NOTIFY_KEY, ReadinessPoll};
use std::mem::MaybeUninit;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use std::{io, ptr};

/// Wrapper around an epoll file descriptor.
pub(crate) struct OsPoller {
  epoll_fd: OwnedFd,
  /// Registered level-triggered under [`NOTIFY_KEY`].
  notifier: Notifier,
}

impl OsPoller {
  pub(crate) fn new() -> io::Result<Self> {
    let epoll_fd = {
      let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
      // SAFETY: epoll_create1 just returned this descriptor.
      unsafe { OwnedFd::from_raw_fd(fd) }
    };
    let notifier = Notifier::new()?;

    let poller = Self { epoll_fd, notifier };
    poller.ctl(
      libc::EPOLL_CTL_ADD,
      poller.notifier.as_fd().as_raw_fd(),
      libc::EPOLLIN as u32,
      NOTIFY_KEY,
    )?;

    Ok(poller)
  }

  fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, key: u64) -> io::Result<()> {
    let mut event = libc::epoll_event { events, u64: key };
    syscall!(epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut event))?;
    Ok(())
  }
}

impl ReadinessPoll for OsPoller {
  type NativeEvent = libc::epoll_event;

  fn add(&self, fd: RawFd, key: u64) -> io::Result<()> {
    let events = libc::EPOLLIN
      | libc::EPOLLOUT
      | libc::EPOLLRDHUP
      | libc::EPOLLET;
    self.ctl(libc::EPOLL_CTL_ADD, fd, events as u32, key)
  }

  fn delete(&self, fd: RawFd) -> io::Result<()> {
    // For EPOLL_CTL_DEL, event pointer can be NULL in Linux 2.6.9+
    match syscall!(epoll_ctl(
      self.epoll_fd.as_raw_fd(),
      libc::EPOLL_CTL_DEL,
      fd,
      ptr::null_mut(),
    )) {
      Ok(_) => Ok(()),
      Err(err) => Err(match err.raw_os_error() {
        Some(libc::EBADF) => io::Error::from_raw_os_error(libc::ENOENT),
        _ => err,
      }),
    }
  }

  fn wait(
    &self,
    events: &mut [Self::NativeEvent],
    timeout: Option<Duration>,
  ) -> io::Result<usize> {
    let timeout_ms = match timeout {
      None => -1,
      Some(t) => {
        // Round up so a sub-millisecond timeout doesn't become a busy poll.
        let ms = t.as_nanos().div_ceil(1_000_000);
        ms.min(libc::c_int::MAX as u128) as libc::c_int
      }
    };

    let n = syscall!(epoll_wait(
      self.epoll_fd.as_raw_fd(),
      events.as_mut_ptr(),
      events.len() as libc::c_int,
      timeout_ms,
    ))? as usize;

    if events[..n].iter().any(|event| Self::event_key(event) == NOTIFY_KEY) {
      self.notifier.clear();
    }

    Ok(n)
  }

  fn notify(&self) -> io::Result<()> {
    self.notifier.notify()
  }

  fn event_key(event: &Self::NativeEvent) -> u64 {
    event.u64
  }

  fn event_interest(event: &Self::NativeEvent) -> Interest {
    let flags = event.events;

    // Errors and hang-ups are delivered to both directions so the pending
    // syscalls observe them.
    if flags & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
      return Interest::READ_AND_WRITE;
    }

    let mut interest = Interest::NONE;
    if flags & (libc::EPOLLIN | libc::EPOLLRDHUP) as u32 != 0 {
      interest = interest | Interest::READ;
    }
    if flags & libc::EPOLLOUT as u32 != 0 {
      interest = interest | Interest::WRITE;
    }
    interest
  }
}

enum Notifier {
  /// The primary notifier, using eventfd.
  EventFd(OwnedFd),

  /// The fallback notifier, using a pipe.
  Pipe {
    read_pipe: OwnedFd,
    write_pipe: OwnedFd,
  },
}

impl AsFd for Notifier {
  fn as_fd(&self) -> BorrowedFd<'_> {
    match self {
      Notifier::EventFd(fd) => fd.as_fd(),
      Notifier::Pipe { read_pipe, .. } => read_pipe.as_fd(),
    }
  }
}

impl Notifier {
  fn new() -> io::Result<Self> {
    if let Ok(fd) = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK)) {
      // SAFETY: eventfd just returned this descriptor.
      return Ok(Notifier::EventFd(unsafe { OwnedFd::from_raw_fd(fd) }));
    }

    let mut fds = MaybeUninit::<[libc::c_int; 2]>::uninit();
    syscall!(pipe2(
      fds.as_mut_ptr().cast::<libc::c_int>(),
      libc::O_CLOEXEC | libc::O_NONBLOCK
    ))?;
    // SAFETY: pipe2 succeeded and wrote both descriptors.
    let [read, write] = unsafe { fds.assume_init() };
    // SAFETY: both descriptors are fresh and owned by nobody else.
    let (read_pipe, write_pipe) =
      unsafe { (OwnedFd::from_raw_fd(read), OwnedFd::from_raw_fd(write)) };

    Ok(Notifier::Pipe { read_pipe, write_pipe })
  }

  fn notify(&self) -> io::Result<()> {
    let result = match self {
      Self::EventFd(fd) => {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        syscall!(write(
          fd.as_raw_fd(),
          buf.as_ptr().cast::<libc::c_void>(),
          buf.len()
        ))
      }
      Self::Pipe { write_pipe, .. } => {
        let buf = [0u8; 1];
        syscall!(write(
          write_pipe.as_raw_fd(),
          buf.as_ptr().cast::<libc::c_void>(),
          buf.len()
        ))
      }
    };

    match result {
      Ok(_) => Ok(()),
      // A full counter or pipe already guarantees a wake-up.
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
      Err(err) => Err(err),
    }
  }

  fn clear(&self) {
    match self {
      Self::EventFd(fd) => {
        let mut buf = [0u8; 8];
        let _ = syscall!(read(
          fd.as_raw_fd(),
          buf.as_mut_ptr().cast::<libc::c_void>(),
          buf.len()
        ));
      }
      Self::Pipe { read_pipe, .. } => {
        let mut buf = [0u8; 64];
        while syscall!(read(
          read_pipe.as_raw_fd(),
          buf.as_mut_ptr().cast::<libc::c_void>(),
          buf.len()
        ))
        .is_ok_and(|n| n > 0)
        {}
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs::File;

  #[test]
  fn duplicate_add_is_rejected() {
    let poller = OsPoller::new().unwrap();
    let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
    poller.add(a.as_raw_fd(), 1).unwrap();
    let err = poller.add(a.as_raw_fd(), 2).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EEXIST));
  }

  #[test]
  fn regular_files_cannot_be_polled() {
    let poller = OsPoller::new().unwrap();
    let file = File::open("/proc/self/exe")
      .or_else(|_| File::open(std::env::current_exe().unwrap()))
      .unwrap();
    let err = poller.add(file.as_raw_fd(), 1).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EPERM));
  }

  #[test]
  fn hang_up_reports_both_directions() {
    let event = libc::epoll_event { events: libc::EPOLLHUP as u32, u64: 3 };
    let interest = OsPoller::event_interest(&event);
    assert!(interest.is_readable());
    assert!(interest.is_writable());
  }
}
