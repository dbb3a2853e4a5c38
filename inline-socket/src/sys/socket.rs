use std::io;
use std::net::Shutdown;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use super::SockAddr;
use crate::address::Address;

/// An owned, non-blocking stream socket.
///
/// Move-only: there is never more than one owner, and the descriptor is closed
/// exactly once, when the handle is dropped. Inside this crate a handle is
/// owned by its dispatcher registration, which only releases it once no
/// operation can touch it anymore.
#[derive(Debug)]
pub struct SocketHandle(OwnedFd);

impl SocketHandle {
  /// Creates a non-blocking, close-on-exec stream socket.
  pub(crate) fn stream(domain: libc::c_int) -> io::Result<Self> {
    #[cfg(linux)]
    {
      let fd = syscall!(socket(
        domain,
        libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        0
      ))?;
      // SAFETY: socket(2) just returned this descriptor.
      Ok(Self(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    #[cfg(not(linux))]
    {
      let fd = syscall!(socket(domain, libc::SOCK_STREAM, 0))?;
      // SAFETY: socket(2) just returned this descriptor.
      let handle = Self(unsafe { OwnedFd::from_raw_fd(fd) });
      handle.prepare()?;
      Ok(handle)
    }
  }

  /// Applies the flags that `SOCK_NONBLOCK`/`SOCK_CLOEXEC` set atomically on
  /// Linux.
  #[cfg(not(linux))]
  fn prepare(&self) -> io::Result<()> {
    let fd = self.as_raw_fd();
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    let flags = syscall!(fcntl(fd, libc::F_GETFD))?;
    syscall!(fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC))?;

    #[cfg(apple)]
    self.set_option(libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1)?;

    Ok(())
  }

  fn set_option(
    &self,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
  ) -> io::Result<()> {
    syscall!(setsockopt(
      self.as_raw_fd(),
      level,
      name,
      (&raw const value).cast::<libc::c_void>(),
      std::mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))?;
    Ok(())
  }

  pub(crate) fn set_reuse_address(&self) -> io::Result<()> {
    self.set_option(libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
  }

  pub(crate) fn bind(&self, addr: &SockAddr) -> io::Result<()> {
    syscall!(bind(self.as_raw_fd(), addr.as_ptr(), addr.len()))?;
    Ok(())
  }

  pub(crate) fn listen(&self, backlog: i32) -> io::Result<()> {
    syscall!(listen(self.as_raw_fd(), backlog))?;
    Ok(())
  }

  /// Accepts one queued peer. Fails with `WouldBlock` if none is queued.
  pub(crate) fn accept(&self) -> io::Result<SocketHandle> {
    #[cfg(linux)]
    {
      let fd = syscall!(accept4(
        self.as_raw_fd(),
        std::ptr::null_mut(),
        std::ptr::null_mut(),
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
      ))?;
      // SAFETY: accept4(2) just returned this descriptor.
      Ok(Self(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    #[cfg(not(linux))]
    {
      let fd = syscall!(accept(
        self.as_raw_fd(),
        std::ptr::null_mut(),
        std::ptr::null_mut()
      ))?;
      // SAFETY: accept(2) just returned this descriptor.
      let handle = Self(unsafe { OwnedFd::from_raw_fd(fd) });
      handle.prepare()?;
      Ok(handle)
    }
  }

  /// # Safety
  ///
  /// `ptr` must be valid for writes of `len` bytes.
  pub(crate) unsafe fn recv(&self, ptr: *mut u8, len: usize) -> io::Result<usize> {
    let n = syscall!(recv(self.as_raw_fd(), ptr.cast::<libc::c_void>(), len, 0))?;
    Ok(n as usize)
  }

  pub(crate) fn send(&self, bytes: &[u8]) -> io::Result<usize> {
    #[cfg(linux)]
    const FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
    #[cfg(not(linux))]
    const FLAGS: libc::c_int = 0;

    let n = syscall!(send(
      self.as_raw_fd(),
      bytes.as_ptr().cast::<libc::c_void>(),
      bytes.len(),
      FLAGS
    ))?;
    Ok(n as usize)
  }

  /// Half-closes the socket. A peer that is already gone is not an error.
  pub(crate) fn shutdown(&self, how: Shutdown) -> io::Result<()> {
    let how = match how {
      Shutdown::Read => libc::SHUT_RD,
      Shutdown::Write => libc::SHUT_WR,
      Shutdown::Both => libc::SHUT_RDWR,
    };
    match syscall!(shutdown(self.as_raw_fd(), how)) {
      Ok(_) => Ok(()),
      Err(err) if err.raw_os_error() == Some(libc::ENOTCONN) => Ok(()),
      Err(err) => Err(err),
    }
  }

  pub(crate) fn local_address(&self) -> io::Result<Address> {
    let mut addr = SockAddr::empty();
    syscall!(getsockname(self.as_raw_fd(), addr.as_mut_ptr(), addr.len_mut()))?;
    addr.to_address()
  }

  pub(crate) fn peer_address(&self) -> io::Result<Address> {
    let mut addr = SockAddr::empty();
    syscall!(getpeername(self.as_raw_fd(), addr.as_mut_ptr(), addr.len_mut()))?;
    addr.to_address()
  }
}

impl From<OwnedFd> for SocketHandle {
  fn from(fd: OwnedFd) -> Self {
    Self(fd)
  }
}

impl From<SocketHandle> for OwnedFd {
  fn from(handle: SocketHandle) -> Self {
    handle.0
  }
}

impl AsFd for SocketHandle {
  fn as_fd(&self) -> BorrowedFd<'_> {
    self.0.as_fd()
  }
}

impl AsRawFd for SocketHandle {
  fn as_raw_fd(&self) -> RawFd {
    self.0.as_raw_fd()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::{Read, Write};
  use std::net::TcpStream;

  #[test]
  fn loopback_listener_round_trip() {
    let address: Address = "127.0.0.1:0".parse().unwrap();
    let listener = SocketHandle::stream(libc::AF_INET).unwrap();
    listener.set_reuse_address().unwrap();
    listener.bind(&SockAddr::from_address(&address).unwrap()).unwrap();
    listener.listen(8).unwrap();

    let bound = listener.local_address().unwrap();
    assert_ne!(bound.port(), Some(0));

    let err = listener.accept().unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

    let mut client = TcpStream::connect(bound.as_ip().unwrap()).unwrap();
    let accepted = loop {
      match listener.accept() {
        Ok(handle) => break handle,
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
          std::thread::yield_now()
        }
        Err(err) => panic!("accept failed: {err}"),
      }
    };

    assert_eq!(
      accepted.peer_address().unwrap(),
      Address::Ip(client.local_addr().unwrap())
    );

    assert_eq!(accepted.send(b"ping").unwrap(), 4);
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");

    client.write_all(b"pong").unwrap();
    let mut buf = [0u8; 8];
    let n = loop {
      // SAFETY: buf is a live eight byte array.
      match unsafe { accepted.recv(buf.as_mut_ptr(), buf.len()) } {
        Ok(n) => break n,
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
          std::thread::yield_now()
        }
        Err(err) => panic!("recv failed: {err}"),
      }
    };
    assert_eq!(&buf[..n], b"pong");

    accepted.shutdown(Shutdown::Both).unwrap();
  }
}
