#![allow(dead_code)]

use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use inline_socket::{Address, Config, Connection, Listener, Transport};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Set `RUST_LOG=inline_socket=trace` to see the transport's logs.
pub fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

pub fn config() -> Config {
  Config::default().with_dispatcher_threads(2).with_segment_count(16)
}

pub fn transport() -> Transport {
  init_tracing();
  Transport::new(config()).unwrap()
}

/// A listener bound to an ephemeral loopback port.
pub fn tcp_listener(transport: &Transport) -> (Listener, SocketAddr) {
  let listener = transport.listener();
  listener.bind(&"127.0.0.1:0".parse().unwrap(), &transport.token()).unwrap();
  let addr = listener
    .local_address()
    .and_then(|address| address.as_ip())
    .expect("tcp listener has an ip address");
  (listener, addr)
}

pub fn accept(listener: &Listener, transport: &Transport) -> Connection {
  listener
    .accept(&transport.token())
    .wait_timeout(TIMEOUT)
    .expect("accept timed out")
    .expect("accept failed")
}

/// A connected pair: the accepted connection and its std peer.
pub fn tcp_pair(transport: &Transport) -> (Connection, TcpStream) {
  let (listener, addr) = tcp_listener(transport);
  let peer = TcpStream::connect(addr).unwrap();
  peer.set_read_timeout(Some(TIMEOUT)).unwrap();
  (accept(&listener, transport), peer)
}

/// Unique socket path under the temp dir, removed on drop.
pub struct SocketPath(PathBuf);

impl SocketPath {
  pub fn new() -> Self {
    let name = format!("inline-socket-{}-{:016x}.sock", std::process::id(), fastrand::u64(..));
    Self(std::env::temp_dir().join(name))
  }

  pub fn path(&self) -> &Path {
    &self.0
  }

  pub fn address(&self) -> Address {
    Address::local(&self.0)
  }
}

impl Drop for SocketPath {
  fn drop(&mut self) {
    let _ = std::fs::remove_file(&self.0);
  }
}
