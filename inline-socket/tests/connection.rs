mod common;

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

use common::{SocketPath, TIMEOUT, accept, tcp_pair, transport};
use inline_socket::{CancellationToken, Connection, ConnectionState, Error, Transport};

fn payload(len: usize) -> Vec<u8> {
  let mut rng = fastrand::Rng::with_seed(len as u64);
  std::iter::repeat_with(|| rng.u8(..)).take(len).collect()
}

/// Receives pooled segments until the peer shuts down its side.
fn receive_to_end(connection: &Connection, transport: &Transport) -> Vec<u8> {
  let mut received = Vec::new();
  loop {
    let segment = transport.pool().get();
    let (result, segment) = connection
      .receive(segment, &transport.token())
      .wait_timeout(TIMEOUT)
      .expect("receive timed out");
    match result.unwrap() {
      0 => return received,
      read => received.extend_from_slice(&segment[..read]),
    }
  }
}

#[test]
fn test_round_trip_sizes() {
  let transport = transport();
  let segment_size = transport.pool().segment_size();

  for len in [0, 1, segment_size, segment_size + 1] {
    let (connection, mut peer) = tcp_pair(&transport);
    let data = payload(len);

    peer.write_all(&data).unwrap();
    peer.shutdown(Shutdown::Write).unwrap();
    assert_eq!(receive_to_end(&connection, &transport), data, "inbound, len {len}");

    let (result, returned) = connection
      .send(data.clone(), &transport.token())
      .wait_timeout(TIMEOUT)
      .unwrap();
    result.unwrap();
    assert_eq!(returned, data);
    connection.shutdown(Shutdown::Write).unwrap();

    let mut echoed = Vec::new();
    peer.read_to_end(&mut echoed).unwrap();
    assert_eq!(echoed, data, "outbound, len {len}");
  }
}

#[test]
fn test_unix_round_trip() {
  let transport = transport();
  let socket = SocketPath::new();
  let listener = transport.listener();
  listener.bind(&socket.address(), &transport.token()).unwrap();

  let mut peer = UnixStream::connect(socket.path()).unwrap();
  peer.set_read_timeout(Some(TIMEOUT)).unwrap();
  let connection = accept(&listener, &transport);

  peer.write_all(b"ping").unwrap();
  let (result, buf) = connection.receive(Vec::with_capacity(16), &transport.token()).wait();
  assert_eq!(result.unwrap(), 4);
  assert_eq!(buf, b"ping");

  let (result, _) = connection.send(&b"pong"[..], &transport.token()).wait();
  result.unwrap();
  let mut reply = [0u8; 4];
  peer.read_exact(&mut reply).unwrap();
  assert_eq!(&reply, b"pong");
}

#[test]
fn test_receive_is_bounded_by_capacity() {
  let transport = transport();
  let (connection, mut peer) = tcp_pair(&transport);
  peer.write_all(b"abcdef").unwrap();

  let (result, buf) = connection.receive(Vec::with_capacity(3), &transport.token()).wait();
  let read = result.unwrap();
  assert!((1..=3).contains(&read));
  assert_eq!(buf, b"abcdef"[..read]);
}

#[test]
fn test_large_send_completes_across_partial_writes() {
  let transport = transport();
  let (connection, mut peer) = tcp_pair(&transport);
  let data = payload(8 * 1024 * 1024);

  let reader = thread::spawn(move || {
    let mut received = Vec::new();
    peer.read_to_end(&mut received).unwrap();
    received
  });

  let (result, data) = connection.send(data, &transport.token()).wait_timeout(TIMEOUT).unwrap();
  result.unwrap();
  connection.shutdown(Shutdown::Write).unwrap();

  assert!(reader.join().unwrap() == data, "peer received different bytes");
}

#[test]
fn test_dispose_fails_pending_receive() {
  let transport = transport();
  let (connection, mut peer) = tcp_pair(&transport);

  let pending = connection.receive(transport.pool().get(), &transport.token());
  let pending = pending.wait_timeout(Duration::from_millis(20)).unwrap_err();

  connection.dispose();
  let (result, segment) = pending.wait_timeout(TIMEOUT).unwrap();
  assert!(matches!(result, Err(Error::ConnectionClosed)));
  assert_eq!(segment.capacity(), transport.pool().segment_size());
  assert_eq!(connection.state(), ConnectionState::Closed);

  let mut buf = [0u8; 1];
  assert_eq!(peer.read(&mut buf).unwrap(), 0, "peer should see the socket closed");

  let (result, _) = connection.receive(vec![0u8; 8], &transport.token()).wait();
  assert!(matches!(result, Err(Error::ConnectionClosed)));
}

#[test]
fn test_dropped_segments_return_to_pool() {
  let transport = transport();
  let (connection, mut peer) = tcp_pair(&transport);
  let available = transport.pool().available();

  let pending = connection.receive(transport.pool().get(), &transport.token());
  assert_eq!(transport.pool().available(), available - 1);

  peer.write_all(b"x").unwrap();
  let (result, segment) = pending.wait_timeout(TIMEOUT).unwrap();
  assert_eq!(result.unwrap(), 1);
  drop(segment);
  assert_eq!(transport.pool().available(), available);

  // A detached operation releases its segment when the connection closes.
  drop(connection.receive(transport.pool().get(), &transport.token()));
  connection.dispose();
  assert_eq!(transport.pool().available(), available);
}

#[test]
fn test_second_receive_is_refused() {
  let transport = transport();
  let (connection, mut peer) = tcp_pair(&transport);

  let first = connection.receive(Vec::with_capacity(8), &transport.token());
  let (result, buf) = connection.receive(Vec::with_capacity(8), &transport.token()).wait();
  assert!(matches!(result, Err(Error::ConcurrentOperation("receive"))));
  assert!(buf.capacity() >= 8);

  peer.write_all(b"ok").unwrap();
  let (result, buf) = first.wait_timeout(TIMEOUT).unwrap();
  assert_eq!(result.unwrap(), 2);
  assert_eq!(buf, b"ok");
}

#[test]
fn test_cancelled_receive_leaves_connection_usable() {
  let transport = transport();
  let (connection, mut peer) = tcp_pair(&transport);

  let token = CancellationToken::new();
  let pending = connection.receive(Vec::with_capacity(8), &token);
  token.cancel();
  let (result, _) = pending.wait_timeout(TIMEOUT).unwrap();
  assert!(matches!(result, Err(Error::Cancelled)));

  peer.write_all(b"after").unwrap();
  let (result, buf) = connection.receive(Vec::with_capacity(8), &transport.token()).wait();
  assert_eq!(result.unwrap(), 5);
  assert_eq!(buf, b"after");
}

#[test]
fn test_read_shutdown_fails_pending_receive() {
  let transport = transport();
  let (connection, _peer) = tcp_pair(&transport);

  let pending = connection.receive(Vec::with_capacity(8), &transport.token());
  connection.shutdown(Shutdown::Read).unwrap();
  assert_eq!(connection.state(), ConnectionState::ShuttingDown(Shutdown::Read));

  let (result, _) = pending.wait_timeout(TIMEOUT).unwrap();
  assert!(matches!(result, Err(Error::ConnectionClosed)));

  let (result, _) = connection.send(b"still open".to_vec(), &transport.token()).wait();
  result.unwrap();
}

#[test]
fn test_abortive_close_is_connection_reset() {
  let transport = transport();
  let (connection, peer) = tcp_pair(&transport);

  let pending = connection.receive(Vec::with_capacity(8), &transport.token());

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

  let (result, _) = pending.wait_timeout(TIMEOUT).unwrap();
  assert!(matches!(result, Err(Error::ConnectionReset)), "{result:?}");
}

#[test]
fn test_completion_runs_on_dispatcher_thread() {
  let transport = transport();
  let prefix = transport.config().thread_name.clone();
  let (connection, mut peer) = tcp_pair(&transport);

  let (tx, rx) = crossbeam_channel::bounded(1);
  connection.receive(Vec::with_capacity(8), &transport.token()).when_done(move |(result, _)| {
    let name = thread::current().name().map(str::to_owned);
    tx.send((result.is_ok(), name)).unwrap();
  });

  peer.write_all(b"x").unwrap();
  let (ok, name) = rx.recv_timeout(TIMEOUT).unwrap();
  assert!(ok);
  let expected = format!("{prefix}-{}", connection.dispatcher_id());
  assert_eq!(name.as_deref(), Some(expected.as_str()));
}

#[test]
fn test_peer_close_is_orderly_eof() {
  let transport = transport();
  let (connection, peer) = tcp_pair(&transport);
  drop(peer);

  let (result, _) = connection.receive(Vec::with_capacity(8), &transport.token()).wait();
  assert_eq!(result.unwrap(), 0);
}

#[test]
fn test_empty_receive_buffer_is_refused() {
  let transport = transport();
  let (connection, mut peer) = tcp_pair(&transport);
  peer.write_all(b"kept").unwrap();

  let (result, buf) = connection.receive(Vec::new(), &transport.token()).wait();
  assert!(matches!(result, Err(Error::EmptyBuffer)), "{result:?}");
  assert!(buf.is_empty());

  // The refused receive consumed nothing and did not occupy the slot.
  let (result, buf) = connection.receive(Vec::with_capacity(8), &transport.token()).wait();
  assert_eq!(result.unwrap(), 4);
  assert_eq!(buf, b"kept");
}

#[test]
fn test_cancelled_send_leaves_connection_usable() {
  let transport = transport();
  let (connection, mut peer) = tcp_pair(&transport);

  // Far more than the socket buffers hold while the peer is not reading.
  let token = CancellationToken::new();
  let pending = connection.send(vec![7u8; 32 * 1024 * 1024], &token);
  let pending = pending.wait_timeout(Duration::from_millis(50)).unwrap_err();
  token.cancel();

  let (result, buf) = pending.wait_timeout(TIMEOUT).unwrap();
  assert!(matches!(result, Err(Error::Cancelled)), "{result:?}");
  assert_eq!(buf.len(), 32 * 1024 * 1024);

  let reader = thread::spawn(move || {
    let mut received = Vec::new();
    peer.read_to_end(&mut received).unwrap();
    received
  });

  let (result, _) = connection.send(b"tail".to_vec(), &transport.token()).wait_timeout(TIMEOUT).unwrap();
  result.unwrap();
  connection.shutdown(Shutdown::Write).unwrap();

  let received = reader.join().unwrap();
  assert!(received.ends_with(b"tail"));
}

#[test]
fn test_continuation_can_issue_next_receive() {
  let transport = transport();
  let (connection, mut peer) = tcp_pair(&transport);
  let connection = std::sync::Arc::new(connection);

  let (tx, rx) = crossbeam_channel::bounded(1);
  {
    let next = std::sync::Arc::clone(&connection);
    let token = transport.token();
    connection.receive(Vec::with_capacity(1), &transport.token()).when_done(move |(result, first)| {
      result.unwrap();
      next.receive(Vec::with_capacity(1), &token).when_done(move |(result, second)| {
        tx.send((result.map(|_| second), first)).unwrap();
      });
    });
  }

  peer.write_all(b"AB").unwrap();
  let (second, first) = rx.recv_timeout(TIMEOUT).unwrap();
  assert_eq!(first, b"A");
  assert_eq!(second.unwrap(), b"B");
}
