//! Listening sockets.

use std::sync::Arc;

use tracing::debug;

use crate::address::Address;
use crate::cancel::CancellationToken;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::op::AcceptOp;
use crate::progress::{Completion, Progress};
use crate::source::{Side, Source, SourceKind};
use crate::sync::Mutex;
use crate::sys::{SockAddr, SocketHandle};
use crate::transport::Transport;

/// Lifecycle of a [`Listener`].
///
/// `Created → Bound → Listening → Unbinding → Closed`. `Bound` only exists
/// while [`Listener::bind`] runs; a successful bind leaves the listener
/// `Listening`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
  Created,
  Bound,
  Listening,
  Unbinding,
  Closed,
}

struct Inner {
  state: ListenerState,
  source: Option<Arc<Source>>,
  local: Option<Address>,
}

/// Binds an [`Address`] and hands out accepted [`Connection`]s.
///
/// ```ignore
/// let transport = Transport::new(Config::default())?;
/// let listener = transport.listener();
/// listener.bind(&"127.0.0.1:0".parse()?, &transport.token())?;
///
/// let connection = listener.accept(&transport.token()).wait()?;
/// ```
pub struct Listener {
  transport: Transport,
  inner: Mutex<Inner>,
}

impl Listener {
  pub fn new(transport: &Transport) -> Self {
    Self {
      transport: transport.clone(),
      inner: Mutex::new(Inner {
        state: ListenerState::Created,
        source: None,
        local: None,
      }),
    }
  }

  pub fn state(&self) -> ListenerState {
    self.inner.lock().state
  }

  /// The bound address, with the port the OS picked when binding port 0.
  pub fn local_address(&self) -> Option<Address> {
    self.inner.lock().local.clone()
  }

  /// Binds `address` and starts listening.
  ///
  /// A local address whose path already exists fails with
  /// [`Error::AddressInUse`]: stale socket files are never removed here.
  /// On failure the listener stays `Created` and can be bound again.
  pub fn bind(&self, address: &Address, token: &CancellationToken) -> Result<()> {
    let mut inner = self.inner.lock();
    if inner.state != ListenerState::Created {
      return Err(Error::InvalidState { op: "bind", state: inner.state });
    }
    if token.is_cancelled() {
      return Err(Error::Cancelled);
    }

    address.validate()?;
    let path_taken = address
      .as_local()
      .is_some_and(|path| std::fs::symlink_metadata(path).is_ok());
    if path_taken {
      return Err(Error::AddressInUse(address.clone()));
    }

    let sockaddr = SockAddr::from_address(address)?;
    let handle = SocketHandle::stream(sockaddr.family())?;
    if address.as_ip().is_some() && self.transport.config().reuse_address {
      handle.set_reuse_address()?;
    }
    handle.bind(&sockaddr).map_err(|err| Error::from_bind(err, address))?;
    inner.state = ListenerState::Bound;

    let listening = self.listen(handle, address);
    match listening {
      Ok((source, local)) => {
        debug!(address = %local, dispatcher = source.dispatcher().id(), "listening");
        inner.source = Some(source);
        inner.local = Some(local);
        inner.state = ListenerState::Listening;
        Ok(())
      }
      Err(err) => {
        inner.state = ListenerState::Created;
        Err(err)
      }
    }
  }

  fn listen(&self, handle: SocketHandle, address: &Address) -> Result<(Arc<Source>, Address)> {
    handle
      .listen(self.transport.config().backlog)
      .map_err(|err| Error::from_bind(err, address))?;
    let local = handle.local_address()?;

    let source = self
      .transport
      .next_dispatcher()
      .register(handle, SourceKind::Listener)?;
    Ok((source, local))
  }

  /// Accepts one connection.
  ///
  /// Completes right away if a peer is already waiting in the backlog.
  /// Concurrent calls are each given a distinct connection, oldest call
  /// first.
  pub fn accept(&self, token: &CancellationToken) -> Progress<Result<Connection>> {
    let source = {
      let inner = self.inner.lock();
      match inner.state {
        ListenerState::Listening => inner.source.clone(),
        ListenerState::Unbinding | ListenerState::Closed => None,
        state => {
          return Progress::ready(Err(Error::InvalidState { op: "accept", state }));
        }
      }
    };
    let Some(source) = source else {
      return Progress::ready(Err(Error::ListenerClosed));
    };

    let completion = Completion::new();
    let progress = Progress::new(Arc::clone(&completion));
    let op = AcceptOp::new(self.transport.clone(), completion);
    source.submit(Side::Read, Box::new(op), token, None);
    progress
  }

  /// Stops listening and closes the listening socket.
  ///
  /// Pending accepts resolve with [`Error::ListenerClosed`]. For a local
  /// address the socket file is left in place. Calling this again does
  /// nothing.
  pub fn unbind(&self) {
    let (source, local) = {
      let mut inner = self.inner.lock();
      match inner.state {
        ListenerState::Unbinding | ListenerState::Closed => return,
        ListenerState::Listening => inner.state = ListenerState::Unbinding,
        _ => inner.state = ListenerState::Closed,
      }
      (inner.source.take(), inner.local.clone())
    };

    if let Some(source) = source {
      source.close();
      debug!(address = ?local, "unbound");
    }
    self.inner.lock().state = ListenerState::Closed;
  }

  /// Releases the listener. Same as [`Listener::unbind`]; also run on drop.
  pub fn dispose(&self) {
    self.unbind();
  }
}

impl Drop for Listener {
  fn drop(&mut self) {
    self.dispose();
  }
}

impl std::fmt::Debug for Listener {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let inner = self.inner.lock();
    f.debug_struct("Listener")
      .field("state", &inner.state)
      .field("local", &inner.local)
      .finish()
  }
}
