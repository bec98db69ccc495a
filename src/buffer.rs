//! `CycleBuffer`: a bounded, growable, mutex-protected ring buffer with
//! blocking read/write and a length-prefixed "one frame" read mode.
//!
//! Grounded in the teacher's habit of wrapping shared per-peer state in a
//! lock (`futures::lock::Mutex` around `NodeTxData.sock`); here the lock
//! is `parking_lot::{Mutex, Condvar}` since `conduit`'s concurrency model
//! is blocking OS threads rather than futures.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, ErrorKind, Result};
use crate::framing;

/// How often a blocked reader re-checks its deadline and the buffer's
/// `closed` flag, per the distilled spec's "wait-with-period = 1s" rule.
const POLL_PERIOD: Duration = Duration::from_secs(1);

struct Inner {
    data: Vec<u8>,
    capacity: usize,
    r_pos: usize,
    w_pos: usize,
    used: usize,
    closed: bool,
}

impl Inner {
    fn free(&self) -> usize {
        self.capacity - self.used
    }

    /// Copies `bytes` into the ring at `w_pos`, wrapping as needed.
    /// Caller must have already ensured there is enough free space.
    fn write_ring(&mut self, bytes: &[u8]) {
        let n = bytes.len();
        let first = (self.capacity - self.w_pos).min(n);
        self.data[self.w_pos..self.w_pos + first].copy_from_slice(&bytes[..first]);
        if first < n {
            self.data[..n - first].copy_from_slice(&bytes[first..]);
        }
        self.w_pos = (self.w_pos + n) % self.capacity;
        self.used += n;
    }

    /// Copies `n` bytes out of the ring at `r_pos` into `out`, wrapping as
    /// needed. Does not advance `r_pos` (used by both `read` and `peek`).
    fn copy_out(&self, out: &mut [u8], n: usize) {
        let first = (self.capacity - self.r_pos).min(n);
        out[..first].copy_from_slice(&self.data[self.r_pos..self.r_pos + first]);
        if first < n {
            out[first..n].copy_from_slice(&self.data[..n - first]);
        }
    }

    fn advance_read(&mut self, n: usize) {
        self.r_pos = (self.r_pos + n) % self.capacity;
        self.used -= n;
    }

    /// Grows the ring to at least `capacity * ceil(min_extra / capacity + 2)`,
    /// per the distilled spec's realloc rule, preserving logical contents
    /// starting at offset 0.
    fn grow_for(&mut self, min_extra: usize) {
        let needed = self.used + min_extra;
        let mut new_capacity = self.capacity;
        while new_capacity < needed || new_capacity <= self.used {
            new_capacity += self.capacity.max(1);
        }
        // Make sure we at least double, matching "capacity * ceil(len/capacity + 2)".
        new_capacity = new_capacity.max(self.capacity * 2);

        let mut new_data = vec![0u8; new_capacity];
        let used = self.used;
        if used > 0 {
            let first = (self.capacity - self.r_pos).min(used);
            new_data[..first].copy_from_slice(&self.data[self.r_pos..self.r_pos + first]);
            if first < used {
                new_data[first..used].copy_from_slice(&self.data[..used - first]);
            }
        }
        self.data = new_data;
        self.capacity = new_capacity;
        self.r_pos = 0;
        self.w_pos = used % new_capacity;
    }
}

/// A bounded, growable byte ring with blocking I/O.
///
/// One `CycleBuffer` instance backs each of a `Connection`'s raw-receive
/// ring, raw-send ring, and every per-message-id demultiplexed ring (see
/// `conduit::connection::Connection`).
pub struct CycleBuffer {
    inner: Mutex<Inner>,
    readable: Condvar,
    writable: Condvar,
}

impl CycleBuffer {
    /// Creates a new, empty buffer with the given initial `capacity`.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        CycleBuffer {
            inner: Mutex::new(Inner {
                data: vec![0u8; capacity],
                capacity,
                r_pos: 0,
                w_pos: 0,
                used: 0,
                closed: false,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
        }
    }

    /// Appends `bytes` to the buffer, growing it first if there isn't
    /// enough free space. Never fails, never blocks.
    pub fn write(&self, bytes: &[u8]) -> usize {
        if bytes.is_empty() {
            return 0;
        }
        let mut inner = self.inner.lock();
        if inner.free() < bytes.len() {
            inner.grow_for(bytes.len());
        }
        inner.write_ring(bytes);
        self.readable.notify_all();
        bytes.len()
    }

    /// Blocks until at least `n` bytes are available (or `timeout`
    /// elapses, or the buffer is closed), then copies them out and
    /// advances the read cursor.
    pub fn read(&self, out: &mut [u8], n: usize, timeout: Option<Duration>) -> Result<usize> {
        debug_assert!(out.len() >= n);
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut inner = self.inner.lock();
        loop {
            if inner.used >= n {
                inner.copy_out(out, n);
                inner.advance_read(n);
                self.writable.notify_all();
                return Ok(n);
            }
            if inner.closed {
                return Err(Error::simple(ErrorKind::Disconnected));
            }
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::simple(ErrorKind::Timeout));
                }
                let wait = (deadline - now).min(POLL_PERIOD);
                self.readable.wait_for(&mut inner, wait);
            } else {
                self.readable.wait_for(&mut inner, POLL_PERIOD);
            }
        }
    }

    /// Same as [`CycleBuffer::read`], but does not advance the read
    /// cursor.
    pub fn peek(&self, out: &mut [u8], n: usize, timeout: Option<Duration>) -> Result<usize> {
        debug_assert!(out.len() >= n);
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut inner = self.inner.lock();
        loop {
            if inner.used >= n {
                inner.copy_out(out, n);
                return Ok(n);
            }
            if inner.closed {
                return Err(Error::simple(ErrorKind::Disconnected));
            }
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::simple(ErrorKind::Timeout));
                }
                let wait = (deadline - now).min(POLL_PERIOD);
                self.readable.wait_for(&mut inner, wait);
            } else {
                self.readable.wait_for(&mut inner, POLL_PERIOD);
            }
        }
    }

    /// Blocks for up to `timeout` or until bytes arrive or the buffer is
    /// closed, without consuming anything. Used by the reader/writer
    /// pumps to avoid busy-spinning while waiting for the next frame.
    pub fn wait_readable(&self, timeout: Duration) {
        let mut inner = self.inner.lock();
        if inner.used == 0 && !inner.closed {
            self.readable.wait_for(&mut inner, timeout);
        }
    }

    /// Blocks for up to `timeout` or until a complete frame is available
    /// or the buffer is closed, without consuming anything. Unlike
    /// `wait_readable`, which wakes on any byte, this only wakes once a
    /// full frame is buffered (or never wakes on a partial one), so a
    /// reader pump waiting on it doesn't spin re-checking a sub-frame
    /// chunk on every wakeup.
    pub fn wait_frame_readable(&self, timeout: Duration) {
        let mut inner = self.inner.lock();
        if !Self::frame_ready(&inner) && !inner.closed {
            self.readable.wait_for(&mut inner, timeout);
        }
    }

    /// Non-blocking: true iff a complete frame is currently available.
    pub fn can_read(&self) -> bool {
        let inner = self.inner.lock();
        Self::frame_ready(&inner)
    }

    fn frame_ready(inner: &Inner) -> bool {
        if inner.used < framing::PREFIX_LEN {
            return false;
        }
        let mut prefix = [0u8; 8];
        inner.copy_out(&mut prefix, 8);
        match framing::peek_total_len(&prefix) {
            Some(total_len) => inner.used as u64 >= total_len,
            None => false,
        }
    }

    /// Non-blocking: if a complete frame is buffered, strips and returns
    /// it as `(id, payload)`. Never partially consumes a frame — on any
    /// decode failure the buffer is left untouched and the error bubbles
    /// up so the caller can mark the connection non-reusable.
    pub fn read_record(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut inner = self.inner.lock();
        if !Self::frame_ready(&inner) {
            return Ok(None);
        }

        let mut prefix = [0u8; 8];
        inner.copy_out(&mut prefix, 8);
        let total_len = framing::peek_total_len(&prefix).unwrap() as usize;

        let mut record = vec![0u8; total_len];
        inner.copy_out(&mut record, total_len);
        let (id, payload) = framing::decode(&record)?;

        inner.advance_read(total_len);
        drop(inner);
        self.writable.notify_all();
        Ok(Some((id, payload)))
    }

    /// Marks the buffer closed, waking every blocked reader with
    /// `ErrorKind::Disconnected`.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        drop(inner);
        self.readable.notify_all();
        self.writable.notify_all();
    }

    /// Number of bytes currently buffered (not yet read).
    pub fn len(&self) -> usize {
        self.inner.lock().used
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current backing capacity (grows over time, never shrinks).
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn write_then_read_round_trips() {
        let buf = CycleBuffer::new(16);
        buf.write(b"hello world");
        let mut out = [0u8; 11];
        let n = buf.read(&mut out, 11, Some(Duration::from_millis(100))).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&out, b"hello world");
    }

    #[test]
    fn used_plus_free_equals_capacity_after_every_op() {
        let buf = CycleBuffer::new(8);
        for round in 0..20 {
            buf.write(&[round as u8; 3]);
            let inner = buf.inner.lock();
            assert_eq!(inner.used + inner.free(), inner.capacity);
            drop(inner);
            let mut out = [0u8; 3];
            buf.read(&mut out, 3, Some(Duration::from_millis(50))).unwrap();
            let inner = buf.inner.lock();
            assert_eq!(inner.used + inner.free(), inner.capacity);
        }
    }

    #[test]
    fn grows_when_written_past_capacity() {
        let buf = CycleBuffer::new(4);
        let payload = vec![7u8; 200];
        buf.write(&payload);
        assert!(buf.capacity() >= 204);
        let mut out = vec![0u8; 200];
        buf.read(&mut out, 200, Some(Duration::from_millis(50))).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn wraps_around_ring_boundary() {
        let buf = CycleBuffer::new(8);
        buf.write(b"123456");
        let mut out = [0u8; 4];
        buf.read(&mut out, 4, Some(Duration::from_millis(50))).unwrap();
        assert_eq!(&out, b"1234");
        // w_pos is at 6, r_pos at 4; writing 5 more bytes wraps past the end.
        buf.write(b"abcde");
        let mut out2 = [0u8; 7];
        buf.read(&mut out2, 7, Some(Duration::from_millis(50))).unwrap();
        assert_eq!(&out2, b"56abcde");
    }

    #[test]
    fn read_times_out_with_no_data() {
        let buf = CycleBuffer::new(8);
        let mut out = [0u8; 4];
        let err = buf.read(&mut out, 4, Some(Duration::from_millis(0))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn read_record_never_partially_consumes() {
        let buf = CycleBuffer::new(32);
        let frame = framing::encode(b"id", b"payload");
        buf.write(&frame[..frame.len() - 1]); // incomplete
        assert!(buf.read_record().unwrap().is_none());
        assert_eq!(buf.len(), frame.len() - 1);
        buf.write(&frame[frame.len() - 1..]); // complete it
        let (id, payload) = buf.read_record().unwrap().unwrap();
        assert_eq!(id, b"id");
        assert_eq!(payload, b"payload");
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn can_read_reflects_frame_availability() {
        let buf = CycleBuffer::new(32);
        assert!(!buf.can_read());
        buf.write(&framing::encode(b"a", b"bc"));
        assert!(buf.can_read());
    }

    #[test]
    fn closing_wakes_blocked_reader_with_disconnected() {
        let buf = Arc::new(CycleBuffer::new(8));
        let reader = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || {
                let mut out = [0u8; 4];
                buf.read(&mut out, 4, None)
            })
        };
        thread::sleep(Duration::from_millis(50));
        buf.close();
        let result = reader.join().unwrap();
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Disconnected);
    }
}
