//! Buffers lent to receive and send operations.
//!
//! A receive or send takes ownership of its buffer for as long as the
//! operation is pending and hands it back inside a [`BufResult`], on success
//! and on failure alike. Anything implementing [`IoBufMut`] can be received
//! into and anything implementing [`IoBuf`] can be sent.
//!
//! # Buffer Pool
//!
//! [`BufferPool`] keeps a fixed set of equally sized [`Segment`]s. A segment
//! is checked out by value and returns to its pool when dropped, wherever
//! that happens: after the caller is done with a completed receive, when a
//! cancelled or disposed operation releases it, or when the caller discards
//! it.
//!
//! [`BufferPool::try_get`] only ever hands out segments from that set and
//! never allocates. [`BufferPool::get`] falls back to allocating a fresh
//! segment once the set is exhausted; such a segment is freed on drop unless
//! the pool has room for it, so the pool never grows past `segment_count`.
//!
//! ```ignore
//! let pool = transport.pool();
//! let segment = pool.get();
//! let (result, segment) = connection.receive(segment, &token).wait();
//! let read = result?;
//! process(&segment[..read]);
//! // `segment` goes back to the pool here.
//! ```

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

use crossbeam_channel::{Receiver, Sender};

use crate::error::Result;

/// Result of an operation that lent out a buffer.
///
/// The buffer is always returned, whether the operation succeeded or not.
pub type BufResult<T, B> = (Result<T>, B);

/// Bytes that can be written to a connection.
pub trait IoBuf: Send + 'static {
  /// The bytes to send, all of which are written before the send completes.
  fn as_bytes(&self) -> &[u8];
}

/// Space that a connection can receive into.
///
/// # Rules of implementation
/// The implementor exposes a region of `recv_capacity()` writable bytes at
/// `recv_ptr()`. After the OS filled `n` of them, [`IoBufMut::deinit`] is
/// called with `n` so the implementor can record the filled length.
pub trait IoBufMut: Send + 'static {
  /// Called before every receive attempt, e.g. to clear stale data.
  fn init(&mut self) {}

  /// Start of the writable region.
  fn recv_ptr(&mut self) -> *mut u8;

  /// Length of the writable region.
  fn recv_capacity(&self) -> usize;

  /// Records that the first `filled` bytes of the region were written.
  ///
  /// # Safety
  ///
  /// The first `filled` bytes at `recv_ptr()` must be initialized and
  /// `filled <= recv_capacity()`.
  unsafe fn deinit(&mut self, filled: usize);
}

impl IoBuf for Vec<u8> {
  fn as_bytes(&self) -> &[u8] {
    self
  }
}

impl IoBuf for Box<[u8]> {
  fn as_bytes(&self) -> &[u8] {
    self
  }
}

impl IoBuf for &'static [u8] {
  fn as_bytes(&self) -> &[u8] {
    self
  }
}

impl IoBuf for String {
  fn as_bytes(&self) -> &[u8] {
    str::as_bytes(self)
  }
}

/// Receives into the spare capacity; the vector's length becomes the number
/// of bytes read.
impl IoBufMut for Vec<u8> {
  fn init(&mut self) {
    self.clear();
  }

  fn recv_ptr(&mut self) -> *mut u8 {
    self.as_mut_ptr()
  }

  fn recv_capacity(&self) -> usize {
    self.capacity()
  }

  unsafe fn deinit(&mut self, filled: usize) {
    // SAFETY: upheld by the caller.
    unsafe { self.set_len(filled) };
  }
}

/// Receives into the whole slice; the byte count is only reported through the
/// operation result.
impl IoBufMut for Box<[u8]> {
  fn recv_ptr(&mut self) -> *mut u8 {
    self.as_mut_ptr()
  }

  fn recv_capacity(&self) -> usize {
    self.len()
  }

  unsafe fn deinit(&mut self, _filled: usize) {}
}

#[cfg(feature = "bytes")]
impl IoBuf for bytes::Bytes {
  fn as_bytes(&self) -> &[u8] {
    self
  }
}

#[cfg(feature = "bytes")]
impl IoBuf for bytes::BytesMut {
  fn as_bytes(&self) -> &[u8] {
    self
  }
}

struct PoolShared {
  free_tx: Sender<Box<[u8]>>,
  free_rx: Receiver<Box<[u8]>>,
  segment_size: usize,
  segment_count: usize,
}

/// A pool of fixed-size [`Segment`]s.
///
/// Cloning is cheap; all clones hand out segments from the same pool.
#[derive(Clone)]
pub struct BufferPool {
  shared: Arc<PoolShared>,
}

impl BufferPool {
  /// Preallocates `segment_count` segments of `segment_size` bytes.
  pub fn new(segment_size: usize, segment_count: usize) -> Self {
    let (free_tx, free_rx) = crossbeam_channel::bounded(segment_count);
    for _ in 0..segment_count {
      let _ = free_tx.try_send(vec![0u8; segment_size].into_boxed_slice());
    }

    Self {
      shared: Arc::new(PoolShared {
        free_tx,
        free_rx,
        segment_size,
        segment_count,
      }),
    }
  }

  /// Checks out a segment, or `None` if every segment is in use. Never
  /// allocates.
  pub fn try_get(&self) -> Option<Segment> {
    let data = self.shared.free_rx.try_recv().ok()?;
    Some(Segment::new(data, Arc::downgrade(&self.shared)))
  }

  /// Checks out a segment, allocating a fresh one if the pool is exhausted.
  ///
  /// Use [`BufferPool::try_get`] where allocating is not acceptable. A fresh
  /// segment joins the pool on drop if there is room for it and is freed
  /// otherwise.
  pub fn get(&self) -> Segment {
    match self.try_get() {
      Some(segment) => segment,
      None => Segment::new(
        vec![0u8; self.shared.segment_size].into_boxed_slice(),
        Arc::downgrade(&self.shared),
      ),
    }
  }

  /// Segments currently sitting in the pool.
  pub fn available(&self) -> usize {
    self.shared.free_rx.len()
  }

  pub fn segment_size(&self) -> usize {
    self.shared.segment_size
  }

  pub fn segment_count(&self) -> usize {
    self.shared.segment_count
  }
}

impl fmt::Debug for BufferPool {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BufferPool")
      .field("segment_size", &self.segment_size())
      .field("segment_count", &self.segment_count())
      .field("available", &self.available())
      .finish()
  }
}

/// A buffer checked out of a [`BufferPool`].
///
/// Dereferences to its filled bytes. Goes back to the pool when dropped.
pub struct Segment {
  data: Box<[u8]>,
  len: usize,
  #[cfg(feature = "bytes")]
  pos: usize,
  pool: Weak<PoolShared>,
}

impl Segment {
  fn new(data: Box<[u8]>, pool: Weak<PoolShared>) -> Self {
    Self {
      data,
      len: 0,
      #[cfg(feature = "bytes")]
      pos: 0,
      pool,
    }
  }

  pub fn capacity(&self) -> usize {
    self.data.len()
  }

  pub fn clear(&mut self) {
    self.len = 0;
    #[cfg(feature = "bytes")]
    {
      self.pos = 0;
    }
  }

  /// Appends as much of `bytes` as fits and returns how many were copied.
  pub fn extend_from_slice(&mut self, bytes: &[u8]) -> usize {
    let n = bytes.len().min(self.data.len() - self.len);
    self.data[self.len..self.len + n].copy_from_slice(&bytes[..n]);
    self.len += n;
    n
  }
}

impl Deref for Segment {
  type Target = [u8];

  fn deref(&self) -> &[u8] {
    &self.data[..self.len]
  }
}

impl DerefMut for Segment {
  fn deref_mut(&mut self) -> &mut [u8] {
    &mut self.data[..self.len]
  }
}

impl fmt::Debug for Segment {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Segment")
      .field("len", &self.len)
      .field("capacity", &self.capacity())
      .finish()
  }
}

impl Drop for Segment {
  fn drop(&mut self) {
    if let Some(pool) = self.pool.upgrade() {
      let data = std::mem::take(&mut self.data);
      let _ = pool.free_tx.try_send(data);
    }
  }
}

impl IoBuf for Segment {
  fn as_bytes(&self) -> &[u8] {
    self
  }
}

impl IoBufMut for Segment {
  fn init(&mut self) {
    self.clear();
  }

  fn recv_ptr(&mut self) -> *mut u8 {
    self.data.as_mut_ptr()
  }

  fn recv_capacity(&self) -> usize {
    self.data.len()
  }

  unsafe fn deinit(&mut self, filled: usize) {
    assert!(
      filled <= self.data.len(),
      "Segment::deinit: filled ({filled}) exceeds capacity ({})",
      self.data.len()
    );
    self.len = filled;
  }
}

#[cfg(feature = "bytes")]
impl bytes::Buf for Segment {
  fn remaining(&self) -> usize {
    self.len - self.pos
  }

  fn chunk(&self) -> &[u8] {
    &self.data[self.pos..self.len]
  }

  fn advance(&mut self, cnt: usize) {
    assert!(
      cnt <= self.remaining(),
      "Segment::advance: cannot advance past the filled region"
    );
    self.pos += cnt;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn segments_return_to_pool_on_drop() {
    let pool = BufferPool::new(64, 2);
    assert_eq!(pool.available(), 2);

    let a = pool.try_get().unwrap();
    let b = pool.try_get().unwrap();
    assert!(pool.try_get().is_none());
    assert_eq!(pool.available(), 0);

    drop(a);
    assert_eq!(pool.available(), 1);
    drop(b);
    assert_eq!(pool.available(), 2);
  }

  #[test]
  fn get_allocates_when_exhausted() {
    let pool = BufferPool::new(16, 1);
    let held = pool.get();
    assert!(pool.try_get().is_none());
    let extra = pool.get();
    assert_eq!(extra.capacity(), 16);
    assert!(pool.try_get().is_none());

    drop(held);
    drop(extra);
    // Only one slot in the pool; the extra segment is freed.
    assert_eq!(pool.available(), 1);
  }

  #[test]
  fn segment_outliving_pool_is_freed() {
    let pool = BufferPool::new(8, 1);
    let segment = pool.get();
    drop(pool);
    drop(segment);
  }

  #[test]
  fn extend_truncates_at_capacity() {
    let pool = BufferPool::new(4, 1);
    let mut segment = pool.get();
    assert_eq!(segment.extend_from_slice(b"abc"), 3);
    assert_eq!(segment.extend_from_slice(b"def"), 1);
    assert_eq!(&segment[..], b"abcd");

    segment.clear();
    assert!(segment.is_empty());
  }

  #[test]
  fn vec_receive_sets_len() {
    let mut buf = Vec::with_capacity(8);
    buf.extend_from_slice(b"stale");
    buf.init();
    assert!(buf.is_empty());
    assert_eq!(buf.recv_capacity(), 8);

    let ptr = buf.recv_ptr();
    // SAFETY: three bytes of an eight byte allocation.
    unsafe {
      std::ptr::copy_nonoverlapping(b"new".as_ptr(), ptr, 3);
      buf.deinit(3);
    }
    assert_eq!(buf, b"new");
  }

  #[test]
  fn reused_segment_starts_empty() {
    let pool = BufferPool::new(8, 1);
    let mut segment = pool.get();
    segment.extend_from_slice(b"hello");
    drop(segment);

    let segment = pool.get();
    assert!(segment.is_empty());
    assert_eq!(segment.capacity(), 8);
  }

  #[cfg(feature = "bytes")]
  #[test]
  fn segment_is_a_bytes_buf() {
    use bytes::Buf;

    let pool = BufferPool::new(8, 1);
    let mut segment = pool.get();
    segment.extend_from_slice(b"abcdef");
    segment.advance(2);
    assert_eq!(segment.chunk(), b"cdef");
    assert_eq!(segment.remaining(), 4);
  }
}
