mod common;

use std::collections::HashSet;
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::thread;
use std::time::Duration;

use common::{TIMEOUT, accept, tcp_listener, transport};
use inline_socket::{CancellationToken, Error};

#[test]
fn test_accept_stays_pending_until_peer_connects() {
  let transport = transport();
  let (listener, addr) = tcp_listener(&transport);

  let pending = listener.accept(&transport.token());
  let pending = pending.wait_timeout(Duration::from_millis(50)).unwrap_err();
  assert!(!pending.is_complete());

  let peer = TcpStream::connect(addr).unwrap();
  let connection = pending.wait_timeout(TIMEOUT).unwrap().unwrap();
  assert_eq!(connection.remote_address().port(), Some(peer.local_addr().unwrap().port()));
}

#[test]
fn test_accept_completes_inline_when_peer_is_queued() {
  let transport = transport();
  let (listener, addr) = tcp_listener(&transport);
  let _peer = TcpStream::connect(addr).unwrap();
  thread::sleep(Duration::from_millis(10));

  let progress = listener.accept(&transport.token());
  assert!(progress.is_complete());

  let caller = thread::current().id();
  let (tx, rx) = crossbeam_channel::bounded(1);
  progress.when_done(move |result| {
    tx.send((result.is_ok(), thread::current().id())).unwrap();
  });
  assert_eq!(rx.try_recv().unwrap(), (true, caller));
}

#[test]
fn test_cancelled_accept_leaves_listener_usable() {
  let transport = transport();
  let (listener, addr) = tcp_listener(&transport);

  let token = CancellationToken::new();
  let pending = listener.accept(&token);
  token.cancel();

  let result = pending.wait_timeout(TIMEOUT).unwrap();
  assert!(matches!(result, Err(Error::Cancelled)));

  // The cancelled call must not swallow the next peer.
  let _peer = TcpStream::connect(addr).unwrap();
  let connection = accept(&listener, &transport);
  assert!(connection.remote_address().port().is_some());
}

#[test]
fn test_fired_token_fails_accept_immediately() {
  let transport = transport();
  let (listener, _addr) = tcp_listener(&transport);

  let token = CancellationToken::new();
  token.cancel();
  let progress = listener.accept(&token);
  assert!(progress.is_complete());
  assert!(progress.wait().unwrap_err().is_cancelled());
}

#[test]
fn test_accept_times_out_with_cancel_after() {
  let transport = transport();
  let (listener, _addr) = tcp_listener(&transport);

  let token = CancellationToken::new();
  token.cancel_after(Duration::from_millis(20));

  let result = listener.accept(&token).wait_timeout(TIMEOUT).unwrap();
  assert!(matches!(result, Err(Error::Cancelled)));
}

#[test]
fn test_unbind_fails_pending_accepts() {
  let transport = transport();
  let (listener, _addr) = tcp_listener(&transport);

  let first = listener.accept(&transport.token());
  let second = listener.accept(&transport.token());
  listener.unbind();

  for pending in [first, second] {
    let result = pending.wait_timeout(TIMEOUT).unwrap();
    assert!(matches!(result, Err(Error::ListenerClosed)));
  }
  assert!(matches!(listener.accept(&transport.token()).wait(), Err(Error::ListenerClosed)));
}

#[test]
fn test_dropping_listener_fails_pending_accept() {
  let transport = transport();
  let (listener, _addr) = tcp_listener(&transport);

  let receiver = listener.accept(&transport.token()).send();
  drop(listener);

  let result = receiver.recv_timeout(TIMEOUT).unwrap();
  assert!(matches!(result, Err(Error::ListenerClosed)));
}

#[test]
fn test_concurrent_accepts_yield_distinct_connections() {
  const PEERS: usize = 8;

  let transport = transport();
  let (listener, addr) = tcp_listener(&transport);

  let pending: Vec<_> = (0..PEERS).map(|_| listener.accept(&transport.token())).collect();

  let peers: Vec<_> = (0..PEERS).map(|_| TcpStream::connect(addr).unwrap()).collect();
  let expected: HashSet<_> = peers.iter().map(|peer| peer.local_addr().unwrap().port()).collect();

  let mut seen = HashSet::new();
  for progress in pending {
    let connection = progress.wait_timeout(TIMEOUT).unwrap().unwrap();
    let port = connection.remote_address().port().unwrap();
    assert!(seen.insert(port), "connection from port {port} delivered twice");
  }
  assert_eq!(seen, expected);
}

#[test]
fn test_accepts_from_many_threads() {
  const THREADS: usize = 4;

  let transport = transport();
  let (listener, addr) = tcp_listener(&transport);

  let ports = thread::scope(|scope| {
    let acceptors: Vec<_> = (0..THREADS)
      .map(|_| {
        let listener = &listener;
        let transport = &transport;
        scope.spawn(move || accept(listener, transport).remote_address().port())
      })
      .collect();

    let _peers: Vec<_> = (0..THREADS).map(|_| TcpStream::connect(addr).unwrap()).collect();
    acceptors
      .into_iter()
      .map(|acceptor| acceptor.join().unwrap())
      .collect::<HashSet<_>>()
  });
  assert_eq!(ports.len(), THREADS);
}

/// Connects and then drops the stream with a zero linger, so the listener's
/// backlog holds a connection that was reset before it was accepted.
fn connect_and_reset(addr: std::net::SocketAddr) {
  let peer = TcpStream::connect(addr).unwrap();
  let linger = libc::linger { l_onoff: 1, l_linger: 0 };
  // SAFETY: valid socket and a correctly sized option value.
  let rc = unsafe {
    libc::setsockopt(
      peer.as_raw_fd(),
      libc::SOL_SOCKET,
      libc::SO_LINGER,
      &linger as *const libc::linger as *const libc::c_void,
      std::mem::size_of::<libc::linger>() as libc::socklen_t,
    )
  };
  assert_eq!(rc, 0);
  drop(peer);
}

#[test]
fn test_peer_reset_before_accept_is_skipped() {
  let transport = transport();
  let (listener, addr) = tcp_listener(&transport);

  connect_and_reset(addr);
  thread::sleep(Duration::from_millis(20));
  let good = TcpStream::connect(addr).unwrap();
  let good_port = good.local_addr().unwrap().port();
  thread::sleep(Duration::from_millis(10));

  // Where the reset peer is still handed out, it is as an established
  // connection; the failure never surfaces as an accept error.
  let mut connection = listener
    .accept(&transport.token())
    .wait_timeout(TIMEOUT)
    .unwrap()
    .unwrap();
  if connection.remote_address().port() != Some(good_port) {
    connection = accept(&listener, &transport);
  }
  assert_eq!(connection.remote_address().port(), Some(good_port));

  let pending = listener.accept(&transport.token());
  let pending = pending.wait_timeout(Duration::from_millis(50)).unwrap_err();
  let _next = TcpStream::connect(addr).unwrap();
  pending.wait_timeout(TIMEOUT).unwrap().unwrap();
}
