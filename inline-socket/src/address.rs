//! Endpoint addresses.
//!
//! An [`Address`] is either an IP socket address or the filesystem path of a
//! Unix-domain socket. The text form accepted by [`str::parse`] is
//! `ip:port`, `[ipv6]:port`, `unix:/abs/path` or a bare `/abs/path`.

use std::fmt;
use std::net::SocketAddr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};

const LOCAL_PREFIX: &str = "unix:";

/// A listener or connection endpoint.
///
/// Equality is structural. A [`Address::Local`] with an empty path stands for
/// an unnamed peer, i.e. a client socket that never bound to a path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
  Ip(SocketAddr),
  Local(PathBuf),
}

/// Socket family of an [`Address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
  Ipv4,
  Ipv6,
  Local,
}

impl Address {
  pub fn ip(addr: impl Into<SocketAddr>) -> Self {
    Address::Ip(addr.into())
  }

  pub fn local(path: impl Into<PathBuf>) -> Self {
    Address::Local(path.into())
  }

  pub fn family(&self) -> AddressFamily {
    match self {
      Address::Ip(SocketAddr::V4(_)) => AddressFamily::Ipv4,
      Address::Ip(SocketAddr::V6(_)) => AddressFamily::Ipv6,
      Address::Local(_) => AddressFamily::Local,
    }
  }

  pub fn as_ip(&self) -> Option<SocketAddr> {
    match self {
      Address::Ip(addr) => Some(*addr),
      Address::Local(_) => None,
    }
  }

  pub fn as_local(&self) -> Option<&Path> {
    match self {
      Address::Local(path) => Some(path),
      Address::Ip(_) => None,
    }
  }

  /// Port of an IP address.
  pub fn port(&self) -> Option<u16> {
    self.as_ip().map(|addr| addr.port())
  }

  /// `true` for a local address captured from a peer that never bound.
  pub fn is_unnamed(&self) -> bool {
    matches!(self, Address::Local(path) if path.as_os_str().is_empty())
  }

  /// Checks that the address can be bound.
  ///
  /// IP addresses are always valid. Local paths must be absolute, must not
  /// contain NUL bytes and must fit the platform's `sun_path` (including the
  /// terminating NUL).
  pub fn validate(&self) -> Result<()> {
    let Address::Local(path) = self else {
      return Ok(());
    };

    let bytes = path.as_os_str().as_bytes();
    if bytes.is_empty() {
      return Err(Error::InvalidAddress("empty local socket path".into()));
    }
    if !path.is_absolute() {
      return Err(Error::InvalidAddress(format!(
        "local socket path must be absolute: {}",
        path.display()
      )));
    }
    if bytes.contains(&0) {
      return Err(Error::InvalidAddress(format!(
        "local socket path contains a NUL byte: {}",
        path.display()
      )));
    }
    let max = max_local_path_len();
    if bytes.len() > max {
      return Err(Error::InvalidAddress(format!(
        "local socket path is {} bytes, the limit is {max}: {}",
        bytes.len(),
        path.display()
      )));
    }
    Ok(())
  }
}

/// Longest local socket path, in bytes, that `bind(2)` accepts.
pub(crate) fn max_local_path_len() -> usize {
  // SAFETY: sockaddr_un is plain old data.
  let addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
  addr.sun_path.len() - 1
}

impl From<SocketAddr> for Address {
  fn from(addr: SocketAddr) -> Self {
    Address::Ip(addr)
  }
}

impl From<PathBuf> for Address {
  fn from(path: PathBuf) -> Self {
    Address::Local(path)
  }
}

impl From<&Path> for Address {
  fn from(path: &Path) -> Self {
    Address::Local(path.to_path_buf())
  }
}

impl fmt::Display for Address {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Address::Ip(addr) => write!(f, "{addr}"),
      Address::Local(path) if path.as_os_str().is_empty() => {
        write!(f, "{LOCAL_PREFIX}(unnamed)")
      }
      Address::Local(path) => write!(f, "{LOCAL_PREFIX}{}", path.display()),
    }
  }
}

impl FromStr for Address {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    let address = if let Some(path) = s.strip_prefix(LOCAL_PREFIX) {
      Address::Local(PathBuf::from(path))
    } else if s.starts_with('/') {
      Address::Local(PathBuf::from(s))
    } else {
      let addr = s
        .parse::<SocketAddr>()
        .map_err(|err| Error::InvalidAddress(format!("{s}: {err}")))?;
      Address::Ip(addr)
    };

    address.validate()?;
    Ok(address)
  }
}
