use std::ffi::OsStr;
use std::mem::{self, offset_of};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::{io, ptr};

use crate::address::Address;
use crate::error::{Error, Result};

/// A `sockaddr_storage` together with the length the kernel reads or wrote.
pub(crate) struct SockAddr {
  storage: libc::sockaddr_storage,
  len: libc::socklen_t,
}

impl SockAddr {
  /// Zeroed storage with full length, ready for `getsockname`/`getpeername`.
  pub(crate) fn empty() -> Self {
    Self {
      // SAFETY: sockaddr_storage is plain old data.
      storage: unsafe { mem::zeroed() },
      len: mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
    }
  }

  pub(crate) fn from_address(address: &Address) -> Result<Self> {
    let mut addr = Self::empty();

    match address {
      Address::Ip(SocketAddr::V4(v4)) => {
        addr.write(into_sockaddr_in(v4));
      }
      Address::Ip(SocketAddr::V6(v6)) => {
        addr.write(into_sockaddr_in6(v6));
      }
      Address::Local(path) => {
        address.validate()?;
        let bytes = path.as_os_str().as_bytes();

        // SAFETY: sockaddr_un is plain old data.
        let mut un: libc::sockaddr_un = unsafe { mem::zeroed() };
        un.sun_family = libc::AF_UNIX as libc::sa_family_t;
        if bytes.len() >= un.sun_path.len() {
          return Err(Error::InvalidAddress(format!(
            "local socket path too long: {}",
            path.display()
          )));
        }
        for (dst, src) in un.sun_path.iter_mut().zip(bytes) {
          *dst = *src as libc::c_char;
        }
        let len = offset_of!(libc::sockaddr_un, sun_path) + bytes.len() + 1;
        #[cfg(apple)]
        {
          un.sun_len = len as u8;
        }

        addr.write(un);
        addr.len = len as libc::socklen_t;
      }
    }

    Ok(addr)
  }

  fn write<T>(&mut self, value: T) {
    assert!(mem::size_of::<T>() <= mem::size_of::<libc::sockaddr_storage>());
    // SAFETY: T is one of the sockaddr_* types, all of which fit in and are
    // no more aligned than sockaddr_storage.
    unsafe { ptr::write((&raw mut self.storage).cast::<T>(), value) };
    self.len = mem::size_of::<T>() as libc::socklen_t;
  }

  pub(crate) fn family(&self) -> libc::c_int {
    self.storage.ss_family as libc::c_int
  }

  pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
    (&raw const self.storage).cast()
  }

  pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::sockaddr {
    (&raw mut self.storage).cast()
  }

  pub(crate) fn len(&self) -> libc::socklen_t {
    self.len
  }

  pub(crate) fn len_mut(&mut self) -> &mut libc::socklen_t {
    &mut self.len
  }

  /// Decodes what the kernel wrote.
  ///
  /// Unnamed and abstract Unix-domain addresses decode to an empty local
  /// path.
  pub(crate) fn to_address(&self) -> io::Result<Address> {
    match self.family() {
      libc::AF_INET => {
        // SAFETY: family is AF_INET, so storage holds a sockaddr_in.
        let sin = unsafe { *(&raw const self.storage).cast::<libc::sockaddr_in>() };
        let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
        let port = u16::from_be(sin.sin_port);
        Ok(Address::Ip(SocketAddr::V4(SocketAddrV4::new(ip, port))))
      }
      libc::AF_INET6 => {
        // SAFETY: family is AF_INET6, so storage holds a sockaddr_in6.
        let sin6 =
          unsafe { *(&raw const self.storage).cast::<libc::sockaddr_in6>() };
        let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
        let port = u16::from_be(sin6.sin6_port);
        Ok(Address::Ip(SocketAddr::V6(SocketAddrV6::new(
          ip,
          port,
          sin6.sin6_flowinfo,
          sin6.sin6_scope_id,
        ))))
      }
      libc::AF_UNIX => {
        // SAFETY: family is AF_UNIX, so storage holds a sockaddr_un.
        let un = unsafe { &*(&raw const self.storage).cast::<libc::sockaddr_un>() };
        let offset = offset_of!(libc::sockaddr_un, sun_path);
        let path_len = (self.len as usize)
          .saturating_sub(offset)
          .min(un.sun_path.len());

        let raw = &un.sun_path[..path_len];
        if raw.first().is_none_or(|b| *b == 0) {
          return Ok(Address::Local(PathBuf::new()));
        }

        let bytes: Vec<u8> = raw
          .iter()
          .map(|c| *c as u8)
          .take_while(|b| *b != 0)
          .collect();
        Ok(Address::Local(PathBuf::from(OsStr::from_bytes(&bytes))))
      }
      _ => Err(io::Error::from_raw_os_error(libc::EAFNOSUPPORT)),
    }
  }
}

fn into_sockaddr_in(addr: &SocketAddrV4) -> libc::sockaddr_in {
  // SAFETY: sockaddr_in is plain old data.
  let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
  sin.sin_family = libc::AF_INET as libc::sa_family_t;
  sin.sin_port = addr.port().to_be();
  sin.sin_addr = libc::in_addr { s_addr: u32::from_ne_bytes(addr.ip().octets()) };
  #[cfg(apple)]
  {
    sin.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
  }
  sin
}

fn into_sockaddr_in6(addr: &SocketAddrV6) -> libc::sockaddr_in6 {
  // SAFETY: sockaddr_in6 is plain old data.
  let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
  sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
  sin6.sin6_port = addr.port().to_be();
  sin6.sin6_addr = libc::in6_addr { s6_addr: addr.ip().octets() };
  sin6.sin6_flowinfo = addr.flowinfo();
  sin6.sin6_scope_id = addr.scope_id();
  #[cfg(apple)]
  {
    sin6.sin6_len = mem::size_of::<libc::sockaddr_in6>() as u8;
  }
  sin6
}
