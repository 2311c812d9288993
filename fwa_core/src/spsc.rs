//! Lock-free single-producer single-consumer byte ring.
//!
//! Provides a realtime-safe channel for moving byte runs between
//! threads, suitable for MIDI traffic between a user thread and the
//! isochronous callback where blocking is unacceptable. Unlike an
//! element-typed queue, reads and writes transfer whole slices so a
//! multi-byte MIDI message costs one head/tail update per run.

use core::cell::UnsafeCell;
#[cfg(not(loom))]
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

#[cfg(loom)]
use loom::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

/// Cache-line padded wrapper to prevent false sharing.
///
/// Padding head and tail to separate cache lines prevents false
/// sharing between producer and consumer threads.
#[repr(align(64))]
struct CachePadded<T>(T);

impl<T> CachePadded<T> {
    const fn new(value: T) -> Self {
        CachePadded(value)
    }
}

impl<T> core::ops::Deref for CachePadded<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Internal shared state for the byte ring.
struct ByteRingInner {
    buffer: Box<[UnsafeCell<u8>]>,
    capacity: usize,
    mask: usize,
    head: CachePadded<AtomicUsize>, // Write position (producer)
    tail: CachePadded<AtomicUsize>, // Read position (consumer)
}

// SAFETY: ByteRingInner can be shared between threads because every
// slot is touched by exactly one side at a time, synchronized through
// the head/tail atomics.
unsafe impl Send for ByteRingInner {}
unsafe impl Sync for ByteRingInner {}

impl ByteRingInner {
    fn new(capacity: usize) -> Self {
        // Round up to next power of 2
        let capacity = capacity.next_power_of_two().max(1);
        let mask = capacity - 1;

        let buffer: Vec<UnsafeCell<u8>> = (0..capacity).map(|_| UnsafeCell::new(0)).collect();

        Self {
            buffer: buffer.into_boxed_slice(),
            capacity,
            mask,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }
}

/// Factory for creating writer/reader pairs.
pub struct ByteRing;

impl ByteRing {
    /// Creates a new SPSC byte ring with the given capacity.
    ///
    /// The actual capacity will be rounded up to the next power of 2.
    /// Returns a `(ByteWriter, ByteReader)` pair for inter-thread use.
    ///
    /// # Examples
    ///
    /// ```
    /// use fwa_core::spsc::ByteRing;
    ///
    /// let (mut writer, mut reader) = ByteRing::new(16);
    ///
    /// assert_eq!(writer.write(&[0x90, 60, 100]), 3);
    /// let mut buf = [0u8; 3];
    /// assert_eq!(reader.read(&mut buf), 3);
    /// assert_eq!(buf, [0x90, 60, 100]);
    /// ```
    #[allow(clippy::new_ret_no_self)]
    pub fn new(capacity: usize) -> (ByteWriter, ByteReader) {
        let inner = Arc::new(ByteRingInner::new(capacity));
        (
            ByteWriter {
                inner: Arc::clone(&inner),
            },
            ByteReader { inner },
        )
    }
}

/// Producer handle for writing bytes into the ring.
///
/// This type is `Send` but not `Clone` - only one writer should exist.
pub struct ByteWriter {
    inner: Arc<ByteRingInner>,
}

impl ByteWriter {
    /// Write as many bytes from `bytes` as fit, returning the count written.
    ///
    /// This operation is lock-free and will never block.
    #[inline]
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let head = self.inner.head.load(Ordering::Relaxed);
        let tail = self.inner.tail.load(Ordering::Acquire);

        let space = self.inner.capacity - head.wrapping_sub(tail);
        let count = space.min(bytes.len());

        for (i, &byte) in bytes[..count].iter().enumerate() {
            let index = head.wrapping_add(i) & self.inner.mask;
            // SAFETY: Slots between head and tail + capacity are free, and
            // only the producer writes to them.
            unsafe {
                *self.inner.buffer[index].get() = byte;
            }
        }

        self.inner.head.store(head.wrapping_add(count), Ordering::Release);
        count
    }

    /// Returns the number of bytes currently in the ring.
    ///
    /// This is an approximate count and may be stale by the time it's used.
    #[inline]
    pub fn len(&self) -> usize {
        let head = self.inner.head.load(Ordering::Relaxed);
        let tail = self.inner.tail.load(Ordering::Relaxed);
        head.wrapping_sub(tail)
    }

    /// Returns `true` if the ring is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if the ring is full.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= self.inner.capacity
    }

    /// Returns the capacity of the ring.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

/// Consumer handle for reading bytes from the ring.
///
/// This type is `Send` but not `Clone` - only one reader should exist.
pub struct ByteReader {
    inner: Arc<ByteRingInner>,
}

impl ByteReader {
    /// Read up to `buf.len()` bytes into `buf`, returning the count read.
    ///
    /// This operation is lock-free and will never block.
    #[inline]
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let tail = self.inner.tail.load(Ordering::Relaxed);
        let head = self.inner.head.load(Ordering::Acquire);

        let available = head.wrapping_sub(tail);
        let count = available.min(buf.len());

        for (i, slot) in buf[..count].iter_mut().enumerate() {
            let index = tail.wrapping_add(i) & self.inner.mask;
            // SAFETY: Slots between tail and head hold written bytes, and
            // only the consumer reads from them.
            *slot = unsafe { *self.inner.buffer[index].get() };
        }

        self.inner.tail.store(tail.wrapping_add(count), Ordering::Release);
        count
    }

    /// Returns the number of bytes currently in the ring.
    ///
    /// This is an approximate count and may be stale by the time it's used.
    #[inline]
    pub fn len(&self) -> usize {
        let head = self.inner.head.load(Ordering::Relaxed);
        let tail = self.inner.tail.load(Ordering::Relaxed);
        head.wrapping_sub(tail)
    }

    /// Returns `true` if the ring is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the capacity of the ring.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}


#[cfg(loom)]
mod loom_tests {
    use loom::thread;

    use super::*;

    #[test]
    fn loom_concurrent_write_read() {
        loom::model(|| {
            let (mut writer, mut reader) = ByteRing::new(2);

            let producer = thread::spawn(move || {
                let _ = writer.write(&[1]);
                let _ = writer.write(&[2]);
            });

            let consumer = thread::spawn(move || {
                let mut buf = [0u8; 2];
                let mut received = Vec::new();
                for _ in 0..2 {
                    let n = reader.read(&mut buf);
                    received.extend_from_slice(&buf[..n]);
                }
                received
            });

            producer.join().unwrap();
            let received = consumer.join().unwrap();

            // Whatever was observed must be a prefix of what was written.
            assert!(received.len() <= 2);
            for (i, &byte) in received.iter().enumerate() {
                assert_eq!(byte, (i + 1) as u8);
            }
        });
    }
}
