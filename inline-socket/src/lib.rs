#![cfg_attr(docsrs, feature(doc_cfg))]

//! # inline-socket
//!
//! A low-latency TCP and Unix-domain socket transport that runs I/O
//! completions inline on the thread that observed them.
//!
//! Each [`Dispatcher`] owns an edge-triggered readiness context (`epoll` on
//! Linux, `kqueue` on macOS and the BSDs). When a socket becomes ready, the
//! thread draining its dispatcher performs the syscall, copies the bytes into
//! the caller's buffer and runs the continuation itself. There is no hop to a
//! worker pool between readiness and application code.
//!
//! ## Features
//! - **Synchronous fast path**: `accept`, `receive` and `send` first try the
//!   syscall on the calling thread and only queue when it would block.
//! - **Per-connection ordering**: every socket is registered with exactly one
//!   dispatcher, so its completions are resolved by one thread, in order.
//! - **Cancellation**: a [`CancellationToken`] resolves a pending operation
//!   with [`Error::Cancelled`]; completion and cancellation never both win.
//! - **Pooled buffers**: fixed-size [`Segment`]s from a [`BufferPool`] that
//!   return to the pool when dropped. [`BufferPool::try_get`] never allocates;
//!   [`BufferPool::get`] allocates once the pool is exhausted.
//!
//! ## Quick Start
//!
//! ```ignore
//! use inline_socket::{Config, Transport};
//!
//! let transport = Transport::new(Config::default())?;
//! let listener = transport.listener();
//! listener.bind(&"127.0.0.1:8080".parse()?, &transport.token())?;
//!
//! let connection = listener.accept(&transport.token()).wait()?;
//!
//! // Blocking.
//! let (read, segment) = connection.receive(transport.pool().get(), &transport.token()).wait();
//!
//! // Inline callback on the dispatcher thread.
//! connection.send(segment, &transport.token()).when_done(|(result, _segment)| {
//!   if let Err(err) = result {
//!     eprintln!("send failed: {err}");
//!   }
//! });
//! ```
//!
//! **Note**: a [`Progress`] is consumed by exactly one of `.await`, `wait`,
//! `when_done` or `send`.
//!
//! ## Platform support
//!
//! | Platform          | I/O Mechanism | Status |
//! |-------------------|---------------|--------|
//! | Linux             | epoll         | Yes    |
//! | macOS / FreeBSD   | kqueue        | Yes    |
//! | Windows           | -             | No     |

#[macro_use]
mod macros;

mod address;
pub mod buf;
mod cancel;
mod config;
mod connection;
mod dispatcher;
mod error;
mod listener;
mod op;
mod progress;
mod source;
mod store;
mod sync;
mod sys;
mod transport;

pub use address::{Address, AddressFamily};
pub use buf::{BufResult, BufferPool, IoBuf, IoBufMut, Segment};
pub use cancel::CancellationToken;
pub use config::Config;
pub use connection::{Connection, ConnectionState};
pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
pub use listener::{Listener, ListenerState};
pub use progress::Progress;
pub use sys::SocketHandle;
pub use transport::Transport;
