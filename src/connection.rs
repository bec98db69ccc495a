//! `Connection`: one TCP (or TLS) socket shared across every logical task
//! talking to the same peer, with a raw receive ring, a raw send ring,
//! per-message-id demultiplex rings, a reader/writer pump pair, and a
//! reference-counted lifecycle.
//!
//! Grounded in the teacher's `Node`/`NodeTxData` shape (an `Arc` around a
//! per-peer socket, locked for the duration of a write) — adapted from
//! futures-based locking to `parking_lot::{Mutex, Condvar}` plus two
//! dedicated OS threads, per the distilled spec's §4.3/§5.

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::buffer::CycleBuffer;
use crate::error::{Error, ErrorKind, Result};
use crate::framing;
use crate::socket::Socket;

/// Initial capacity of a `Connection`'s raw receive ring (grows on
/// demand), per the distilled spec's §4.3.
pub const RAW_RECV_CAPACITY: usize = 10 * 1024 * 1024;
/// Initial capacity of a `Connection`'s raw send ring (grows on demand).
pub const RAW_SEND_CAPACITY: usize = 128 * 1024 * 1024;
/// Default capacity of a freshly created per-message-id demultiplex ring.
pub const PER_ID_CAPACITY: usize = 8 * 1024;

/// Payload carried by the `"lock:" + task_id` rendezvous frame. Must be
/// non-empty: a zero-byte `recv` is satisfied the instant the per-id ring
/// exists, so it would never actually wait for the peer's frame.
const RENDEZVOUS_SENTINEL: [u8; 1] = [1u8];

/// `Connection`'s lifecycle, per the distilled spec's §3 state machine:
/// `Invalid -> Handshaking -> Handshaked -> Connected -> Closing -> Closed`,
/// terminal `Failed` reachable from any earlier state.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnState {
    Invalid,
    Handshaking,
    Handshaked,
    Connected,
    Closing,
    Closed,
    Failed,
}

/// Why a `Connection` stopped being `Connected`, used by
/// [`crate::channel::Channel::recv`] to decide between returning `Ok(0)`
/// (a clean peer shutdown observed mid-`Recv`) and
/// `Err(ChannelError::Unconnected)` (anything else), per the distilled
/// spec's §9 Open Question about this ambiguity.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CloseReason {
    PeerEof,
    IoError,
    Requested,
}

/// Invoked from I/O paths on non-recoverable peer errors, matching the
/// distilled spec's §6 signature (minus the opaque `userData`, which Rust
/// closures capture naturally).
pub type ErrorCallback = Arc<dyn Fn(&str, &str, i32, &str) + Send + Sync>;

pub struct Connection {
    local_node_id: String,
    peer_node_id: String,
    is_server: bool,
    fd: RawFd,
    sock: Mutex<Socket>,
    state: Mutex<ConnState>,
    state_cv: Condvar,
    close_reason: Mutex<Option<CloseReason>>,
    raw_recv: CycleBuffer,
    raw_send: CycleBuffer,
    per_id_recv: Mutex<HashMap<Vec<u8>, Arc<CycleBuffer>>>,
    reusable: AtomicBool,
    task_ref_count: AtomicUsize,
    stop_reader: AtomicBool,
    stop_writer: AtomicBool,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
    error_callback: Option<ErrorCallback>,
}

impl Connection {
    pub fn new(
        local_node_id: String,
        peer_node_id: String,
        is_server: bool,
        sock: Socket,
        error_callback: Option<ErrorCallback>,
    ) -> Arc<Connection> {
        let fd = sock.as_raw_fd();
        Arc::new(Connection {
            local_node_id,
            peer_node_id,
            is_server,
            fd,
            sock: Mutex::new(sock),
            state: Mutex::new(ConnState::Connected),
            state_cv: Condvar::new(),
            close_reason: Mutex::new(None),
            raw_recv: CycleBuffer::new(RAW_RECV_CAPACITY),
            raw_send: CycleBuffer::new(RAW_SEND_CAPACITY),
            per_id_recv: Mutex::new(HashMap::new()),
            reusable: AtomicBool::new(true),
            task_ref_count: AtomicUsize::new(0),
            stop_reader: AtomicBool::new(false),
            stop_writer: AtomicBool::new(false),
            reader_handle: Mutex::new(None),
            writer_handle: Mutex::new(None),
            error_callback,
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Locks and returns the underlying socket, for the shared reactor's
    /// read loop. Never held across a blocking call other than the read
    /// itself — the socket is non-blocking once handed to a `Connection`.
    pub fn socket_guard(&self) -> parking_lot::MutexGuard<'_, Socket> {
        self.sock.lock()
    }

    pub fn peer_node_id(&self) -> &str {
        &self.peer_node_id
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock()
    }

    pub fn is_reusable(&self) -> bool {
        self.reusable.load(Ordering::Acquire) && self.state() == ConnState::Connected
    }

    /// Bytes buffered but not yet delivered to any `Recv` caller, summed
    /// across every per-id ring plus the raw receive ring. Used by pool
    /// teardown to decide whether draining can finish.
    pub fn unrecv_size(&self) -> usize {
        let per_id = self.per_id_recv.lock();
        let per_id_total: usize = per_id.values().map(|b| b.len()).sum();
        per_id_total + self.raw_recv.len()
    }

    fn set_state(&self, s: ConnState) {
        let mut state = self.state.lock();
        *state = s;
        self.state_cv.notify_all();
    }

    /// Flips `reusable` to `false` and closes every buffer so that
    /// blocked `Recv` callers wake up. Buffers that still hold undelivered
    /// bytes keep delivering them first — `CycleBuffer::read` only
    /// returns an error once it can no longer satisfy the request, which
    /// resolves the distilled spec's §9 Open Question about this
    /// interaction explicitly.
    pub fn mark_non_reusable(&self, reason: CloseReason) {
        self.reusable.store(false, Ordering::Release);
        *self.close_reason.lock() = Some(reason);
        self.raw_recv.close();
        self.raw_send.close();
        for buf in self.per_id_recv.lock().values() {
            buf.close();
        }
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Failed);
        }
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    fn per_id_buffer(&self, id: &[u8]) -> Arc<CycleBuffer> {
        let mut map = self.per_id_recv.lock();
        map.entry(id.to_vec())
            .or_insert_with(|| Arc::new(CycleBuffer::new(PER_ID_CAPACITY)))
            .clone()
    }

    /// Called by the shared epoll reactor (or, on non-Linux fallback, by
    /// a per-connection read loop) whenever raw bytes arrive on the
    /// socket. Never blocks.
    pub fn push_raw(&self, chunk: &[u8]) {
        self.raw_recv.write(chunk);
    }

    /// Encodes `(id, payload)` into a frame and appends it to the send
    /// ring; the writer pump drains it to the socket. Never blocks on the
    /// socket itself — back-pressure is implicit via ring growth, per the
    /// distilled spec's §4.3.
    pub fn send(&self, id: &[u8], payload: &[u8]) -> Result<usize> {
        if self.state() != ConnState::Connected {
            return Err(Error::simple(ErrorKind::Disconnected));
        }
        let frame = framing::encode(id, payload);
        self.raw_send.write(&frame);
        Ok(payload.len())
    }

    /// Blocks until `n` bytes tagged with `id` are available (or
    /// `timeout` elapses), then copies them out.
    pub fn recv(&self, id: &[u8], out: &mut [u8], n: usize, timeout: Option<Duration>) -> Result<usize> {
        let buf = self.per_id_buffer(id);
        buf.read(out, n, timeout)
    }

    /// Bumps the task reference count and, for the first caller, spawns
    /// the reader and writer pumps. Then performs the `"lock:" + task_id`
    /// rendezvous frame round-trip described in the distilled spec's
    /// §4.3, so both peers agree the task is entering before any
    /// task-specific messages flow. The frame carries a non-empty
    /// sentinel payload — `recv`ing zero bytes would be satisfied the
    /// instant the ring is created, peer frame or not, so the wait has to
    /// be for at least one real byte to actually block on it arriving.
    pub fn start(self: &Arc<Self>, task_id: &str) -> Result<()> {
        if self.task_ref_count.fetch_add(1, Ordering::AcqRel) == 0 {
            self.spawn_pumps();
        }
        let lock_id = rendezvous_id(task_id);
        self.send(&lock_id, &RENDEZVOUS_SENTINEL)?;
        let mut scratch = [0u8; RENDEZVOUS_SENTINEL.len()];
        self.recv(&lock_id, &mut scratch, RENDEZVOUS_SENTINEL.len(), Some(Duration::from_secs(30)))
            .wrapped_msg(ErrorKind::Handshake, "task start rendezvous timed out")?;
        Ok(())
    }

    /// Mirror of [`Connection::start`]: performs the matching rendezvous
    /// round-trip, then decrements the task reference count. The caller
    /// is responsible for checking whether the count reached zero and
    /// tearing the connection down via [`Connection::close`].
    pub fn stop(self: &Arc<Self>, task_id: &str) -> Result<usize> {
        let lock_id = rendezvous_id(task_id);
        // Best-effort: a peer that already died shouldn't wedge shutdown.
        let _ = self.send(&lock_id, &RENDEZVOUS_SENTINEL);
        let mut scratch = [0u8; RENDEZVOUS_SENTINEL.len()];
        let _ = self.recv(&lock_id, &mut scratch, RENDEZVOUS_SENTINEL.len(), Some(Duration::from_secs(5)));
        Ok(self.task_ref_count.fetch_sub(1, Ordering::AcqRel) - 1)
    }

    fn spawn_pumps(self: &Arc<Self>) {
        let reader_conn = Arc::clone(self);
        let reader = thread::Builder::new()
            .name(format!("conduit-reader-{}", self.peer_node_id))
            .spawn(move || reader_pump(reader_conn))
            .expect("failed to spawn reader pump thread");
        *self.reader_handle.lock() = Some(reader);

        let writer_conn = Arc::clone(self);
        let writer = thread::Builder::new()
            .name(format!("conduit-writer-{}", self.peer_node_id))
            .spawn(move || writer_pump(writer_conn))
            .expect("failed to spawn writer pump thread");
        *self.writer_handle.lock() = Some(writer);
    }

    /// Transitions `Connected`/`Connecting` to `Closing`, flushes the
    /// send buffer, stops both pumps, closes the socket, and transitions
    /// to `Closed`.
    pub fn close(&self) {
        self.set_state(ConnState::Closing);
        self.stop_writer.store(true, Ordering::Release);
        self.raw_send.write(&[]); // nudge the writer pump's wait loop
        if let Some(handle) = self.writer_handle.lock().take() {
            let _ = handle.join();
        }

        self.stop_reader.store(true, Ordering::Release);
        self.raw_recv.close();
        if let Some(handle) = self.reader_handle.lock().take() {
            let _ = handle.join();
        }

        let _ = self.sock.lock().shutdown(std::net::Shutdown::Both);
        self.set_state(ConnState::Closed);
        tracing::debug!(peer = %self.peer_node_id, "connection closed");
    }

    fn report_error(&self, errno: i32, message: &str) {
        tracing::warn!(peer = %self.peer_node_id, errno, message, "connection error");
        if let Some(cb) = &self.error_callback {
            cb(&self.local_node_id, &self.peer_node_id, errno, message);
        }
    }
}

fn rendezvous_id(task_id: &str) -> Vec<u8> {
    format!("lock:{}", task_id).into_bytes()
}

fn reader_pump(conn: Arc<Connection>) {
    tracing::debug!(peer = %conn.peer_node_id, "reader pump started");
    loop {
        match conn.raw_recv.read_record() {
            Ok(Some((id, payload))) => {
                let buf = conn.per_id_buffer(&id);
                buf.write(&payload);
            }
            Ok(None) => {
                if conn.stop_reader.load(Ordering::Acquire) && conn.raw_recv.is_empty() {
                    break;
                }
                conn.raw_recv.wait_frame_readable(Duration::from_secs(1));
            }
            Err(e) => {
                conn.report_error(-1, &format!("frame decode error: {}", e));
                conn.mark_non_reusable(CloseReason::IoError);
                break;
            }
        }
    }
    tracing::debug!(peer = %conn.peer_node_id, "reader pump stopped");
}

fn writer_pump(conn: Arc<Connection>) {
    tracing::debug!(peer = %conn.peer_node_id, "writer pump started");
    loop {
        conn.raw_send.wait_readable(Duration::from_secs(1));
        let available = conn.raw_send.len();
        if available == 0 {
            if conn.stop_writer.load(Ordering::Acquire) {
                break;
            }
            continue;
        }
        let mut chunk = vec![0u8; available];
        if conn
            .raw_send
            .read(&mut chunk, available, Some(Duration::from_millis(0)))
            .is_err()
        {
            continue;
        }
        let write_result = { conn.sock.lock().write_all(&chunk) };
        if let Err(e) = write_result {
            conn.report_error(e.raw_os_error().unwrap_or(-1), &format!("write failed: {}", e));
            conn.mark_non_reusable(CloseReason::IoError);
            break;
        }
        if conn.stop_writer.load(Ordering::Acquire) && conn.raw_send.is_empty() {
            break;
        }
    }
    tracing::debug!(peer = %conn.peer_node_id, "writer pump stopped");
}

use crate::error::ResultWrappedExt;

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    use crate::runtime::Runtime;

    /// Plain, non-blocking TCP socket pair. `Runtime`'s reactor (Linux
    /// epoll, or the fallback reader thread elsewhere) assumes its
    /// registered sockets are non-blocking.
    fn socket_pair() -> (Socket, Socket) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        server.set_nonblocking(true).unwrap();
        (Socket::Plain(client), Socket::Plain(server))
    }

    /// Builds two `Connection`s over a real socket pair and registers
    /// both with a `Runtime`, so incoming bytes actually reach each
    /// `Connection::push_raw` the way they would in production — a bare
    /// `Connection::new` never gets fed anything, since only a `Runtime`
    /// bridges the socket into `raw_recv`.
    fn connected_pair() -> (Runtime, Arc<Connection>, Arc<Connection>) {
        let (a_sock, b_sock) = socket_pair();
        let a = Connection::new("A".into(), "B".into(), false, a_sock, None);
        let b = Connection::new("B".into(), "A".into(), true, b_sock, None);
        let runtime = Runtime::new().unwrap();
        runtime.register_connection(Arc::clone(&a)).unwrap();
        runtime.register_connection(Arc::clone(&b)).unwrap();
        (runtime, a, b)
    }

    #[test]
    fn send_then_recv_round_trips_payload() {
        let (_runtime, a, b) = connected_pair();
        a.start("t1").unwrap();
        b.start("t1").unwrap();

        a.send(b"f00d", b"hello").unwrap();
        let mut out = [0u8; 5];
        let n = b.recv(b"f00d", &mut out, 5, Some(Duration::from_secs(2))).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&out, b"hello");

        a.stop("t1").unwrap();
        b.stop("t1").unwrap();
        a.close();
        b.close();
    }

    #[test]
    fn recv_times_out_with_no_sender() {
        let (_runtime, a, b) = connected_pair();
        a.start("t1").unwrap();
        b.start("t1").unwrap();

        let mut out = [0u8; 4];
        let err = b
            .recv(b"dead", &mut out, 4, Some(Duration::from_millis(200)))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        a.stop("t1").unwrap();
        b.stop("t1").unwrap();
        a.close();
        b.close();
    }

    #[test]
    fn non_reusable_unblocks_waiting_recv_with_disconnected() {
        let (_runtime, a, b) = connected_pair();
        a.start("t1").unwrap();
        b.start("t1").unwrap();

        let b2 = Arc::clone(&b);
        let handle = thread::spawn(move || {
            let mut out = [0u8; 1024];
            b2.recv(b"dead", &mut out, 1024, None)
        });
        thread::sleep(Duration::from_millis(100));
        b.mark_non_reusable(CloseReason::IoError);
        let result = handle.join().unwrap();
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Disconnected);

        a.close();
    }
}
