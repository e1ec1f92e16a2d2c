//! Virtual channel: one ordered message stream over N TCP connections.
//!
//! # Architecture
//!
//! ```text
//!            send(payload)
//!                 │  ids reserved with one fetch_add, framed
//!                 ▼
//!         ┌───────────────┐
//!         │  send queue   │  shared by every writer
//!         └───────────────┘
//!          │      │      │
//!       uvt-tx-0 uvt-tx-1 ...          ◄── send timeout re-enqueues the frame
//!          │      │      │
//!        conn 0 conn 1 ...  (TCP)
//!          │      │      │
//!       uvt-rx-0 uvt-rx-1 ...
//!          └──────┼──────┘
//!                 ▼
//!         ┌───────────────┐
//!         │ reorder stage │  one mutex: dedup, buffer, deliver in id order
//!         └───────────────┘
//!                 │
//!            on_receive(id, payload)
//! ```
//!
//! A connection failure disconnects that connection and fires
//! `on_disconnect` once; the channel stays open. Deciding whether to tear
//! the channel down is up to its owner.

pub mod pump;
pub mod reorder;

use std::io;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

use crate::buffer::{BufferPool, PooledBuffer};
use crate::codec::{FRAME_HEADER_LEN, FrameError, MAX_FRAME_PAYLOAD, MessageId, encode_frame};
use crate::net::{Connection, ConnectionOptions};
use crate::sync::{BlockingQueue, Worker};
use crate::trace::{debug, info, trace, warn};

pub use reorder::{InsertResult, ReorderBuffer};

/// Default size of each reader's socket read.
pub const DEFAULT_READ_CHUNK: usize = 64 * 1024;

/// Called with each message, in id order.
pub type ReceiveHandler = Box<dyn FnMut(MessageId, PooledBuffer) + Send>;

/// Called once per lost connection.
pub type DisconnectHandler = Arc<dyn Fn(ConnectionLoss) + Send + Sync>;

/// Callbacks wired into a channel at open time.
pub struct ChannelHandlers {
    pub on_receive: ReceiveHandler,
    pub on_disconnect: DisconnectHandler,
}

/// Channel tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub connection: ConnectionOptions,
    pub read_chunk: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionOptions::default(),
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }
}

/// Why a connection left the channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LossReason {
    #[error("stream closed")]
    Closed,
    #[error("corrupt frame: {0}")]
    Corrupt(FrameError),
    /// A send timed out mid-frame, so the byte stream cannot be resynchronised.
    #[error("send timed out after {written} of {len} bytes")]
    PartialWrite { written: usize, len: usize },
    #[error("i/o error: {0}")]
    Io(io::ErrorKind),
}

/// Reported through [`ChannelHandlers::on_disconnect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionLoss {
    pub index: usize,
    pub reason: LossReason,
}

/// Errors from channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("a channel needs at least one connection")]
    NoConnections,
    #[error("empty payload")]
    EmptyPayload,
    #[error("channel is closed")]
    Closed,
    #[error(transparent)]
    Frame(#[from] FrameError),
    /// Socket setup or thread creation failed.
    #[error("channel setup failed: {0}")]
    Setup(#[from] io::Error),
}

/// Point-in-time channel counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub retransmits: u64,
    /// Frames dropped because their id was already buffered or delivered.
    pub duplicates: u64,
    pub delivered: u64,
    pub reorder_depth: usize,
    pub connections_up: usize,
}

#[derive(Default)]
struct Counters {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    retransmits: AtomicU64,
    duplicates: AtomicU64,
    delivered: AtomicU64,
}

struct ReorderStage {
    buffer: ReorderBuffer<PooledBuffer>,
    on_receive: ReceiveHandler,
}

/// State shared between the channel handle and its pumps.
pub(crate) struct Shared {
    label: String,
    pool: BufferPool,
    send_queue: BlockingQueue<PooledBuffer>,
    reorder: Mutex<ReorderStage>,
    closing: AtomicBool,
    counters: Counters,
    on_disconnect: DisconnectHandler,
}

impl Shared {
    fn new(label: String, pool: BufferPool, handlers: ChannelHandlers) -> Self {
        Self {
            label,
            pool,
            send_queue: BlockingQueue::new(),
            reorder: Mutex::new(ReorderStage {
                buffer: ReorderBuffer::new(),
                on_receive: handlers.on_receive,
            }),
            closing: AtomicBool::new(false),
            counters: Counters::default(),
            on_disconnect: handlers.on_disconnect,
        }
    }

    pub(crate) fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub(crate) fn send_queue(&self) -> &BlockingQueue<PooledBuffer> {
        &self.send_queue
    }

    /// Reorder stage entry point for every decoded frame.
    pub(crate) fn accept(&self, id: MessageId, payload: PooledBuffer) {
        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.reorder.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.buffer.insert(id, payload) {
            InsertResult::Accepted => {}
            InsertResult::Duplicate | InsertResult::TooOld => {
                trace!(channel = %self.label, id = %id, "duplicate frame dropped");
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        let ReorderStage { buffer, on_receive } = &mut *guard;
        let delivered = buffer.drain_ready(|id, payload| on_receive(id, payload));
        self.counters
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
    }

    /// Puts a timed-out frame back for any writer to pick up.
    pub(crate) fn retransmit(&self, frame: PooledBuffer) {
        if self.send_queue.enqueue(frame).is_ok() {
            self.counters.retransmits.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Disconnects `conn` and reports the loss, once per connection and
    /// never while the channel itself is closing.
    pub(crate) fn connection_lost(&self, conn: &Connection, reason: LossReason) {
        if !conn.disconnect() || self.closing.load(Ordering::Acquire) {
            return;
        }
        warn!(
            channel = %self.label,
            connection = conn.index(),
            reason = %reason,
            "connection lost"
        );
        (self.on_disconnect)(ConnectionLoss {
            index: conn.index(),
            reason,
        });
    }
}

/// Ordered message channel over several TCP connections.
///
/// Dropping the channel closes it.
pub struct VirtualChannel {
    shared: Arc<Shared>,
    connections: Vec<Arc<Connection>>,
    next_id: AtomicU64,
    workers: Mutex<Vec<Worker>>,
    closed: AtomicBool,
}

impl VirtualChannel {
    /// Wraps `streams` and starts one reader and one writer per connection.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::NoConnections`] if `streams` is empty
    /// - [`ChannelError::Setup`] if a socket option or thread spawn fails;
    ///   anything already started is torn down
    pub fn open(
        label: impl Into<String>,
        streams: Vec<TcpStream>,
        config: &ChannelConfig,
        pool: BufferPool,
        handlers: ChannelHandlers,
    ) -> Result<Self, ChannelError> {
        if streams.is_empty() {
            return Err(ChannelError::NoConnections);
        }
        let shared = Arc::new(Shared::new(label.into(), pool, handlers));

        let connections = streams
            .into_iter()
            .enumerate()
            .map(|(index, stream)| {
                let conn = Connection::new(index, stream, &config.connection)?;
                let retransmit_to = Arc::clone(&shared);
                conn.set_on_send_timeout(Box::new(move |frame| retransmit_to.retransmit(frame)));
                Ok(Arc::new(conn))
            })
            .collect::<io::Result<Vec<_>>>()?;

        let channel = Self {
            shared,
            connections,
            next_id: AtomicU64::new(MessageId::ZERO.as_u64()),
            workers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        };
        // On error `channel` drops here and closes what was started.
        channel.start_pumps(config.read_chunk)?;

        info!(
            channel = %channel.shared.label,
            connections = channel.connections.len(),
            "virtual channel open"
        );
        Ok(channel)
    }

    fn start_pumps(&self, read_chunk: usize) -> io::Result<()> {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for conn in &self.connections {
            let index = conn.index();
            let (c, s) = (Arc::clone(conn), Arc::clone(&self.shared));
            workers.push(Worker::spawn(format!("uvt-rx-{index}"), move |stop| {
                pump::run_reader(&c, &s, &stop, read_chunk);
            })?);
            let (c, s) = (Arc::clone(conn), Arc::clone(&self.shared));
            workers.push(Worker::spawn(format!("uvt-tx-{index}"), move |_| {
                pump::run_writer(&c, &s);
            })?);
        }
        Ok(())
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Queues `payload` for transmission.
    ///
    /// Payloads longer than [`MAX_FRAME_PAYLOAD`] are split into consecutive
    /// frames whose ids are reserved in one step, so the receiver delivers
    /// them back to back. Returns the number of frames queued.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::EmptyPayload`] for an empty payload
    /// - [`ChannelError::Closed`] once the channel is closed
    pub fn send(&self, payload: &[u8]) -> Result<usize, ChannelError> {
        if payload.is_empty() {
            return Err(ChannelError::EmptyPayload);
        }
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let frames = payload.len().div_ceil(MAX_FRAME_PAYLOAD);
        let first = self.next_id.fetch_add(frames as u64, Ordering::AcqRel);
        for (offset, chunk) in (0u64..).zip(payload.chunks(MAX_FRAME_PAYLOAD)) {
            let mut frame = self
                .shared
                .pool
                .checkout_empty(FRAME_HEADER_LEN + chunk.len());
            encode_frame(MessageId(first + offset), chunk, frame.as_mut_vec())?;
            self.shared
                .send_queue
                .enqueue(frame)
                .map_err(|_| ChannelError::Closed)?;
            self.shared
                .counters
                .frames_sent
                .fetch_add(1, Ordering::Relaxed);
        }
        Ok(frames)
    }

    /// Stops the channel: cancels the send queue, disconnects every
    /// connection and joins every pump. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.closing.store(true, Ordering::Release);
        self.shared.send_queue.cancel();
        for conn in &self.connections {
            conn.disconnect();
        }

        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for mut worker in workers {
            worker.stop();
        }
        let unsent = self.shared.send_queue.drain().len();
        debug!(channel = %self.shared.label, unsent, "virtual channel closed");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stats(&self) -> ChannelStats {
        let c = &self.shared.counters;
        let reorder_depth = self
            .shared
            .reorder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .buffer
            .len();
        ChannelStats {
            frames_sent: c.frames_sent.load(Ordering::Relaxed),
            frames_received: c.frames_received.load(Ordering::Relaxed),
            retransmits: c.retransmits.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            reorder_depth,
            connections_up: self
                .connections
                .iter()
                .filter(|c| c.is_connected())
                .count(),
        }
    }
}

impl Drop for VirtualChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for VirtualChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualChannel")
            .field("label", &self.shared.label)
            .field("connections", &self.connections.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn collecting() -> (ChannelHandlers, mpsc::Receiver<(u64, Vec<u8>)>) {
        let (tx, rx) = mpsc::channel();
        let handlers = ChannelHandlers {
            on_receive: Box::new(move |id, payload| {
                let _ = tx.send((id.as_u64(), payload.to_vec()));
            }),
            on_disconnect: Arc::new(|_| {}),
        };
        (handlers, rx)
    }

    fn loopback_pairs(n: usize) -> (Vec<TcpStream>, Vec<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut near = Vec::new();
        let mut far = Vec::new();
        for _ in 0..n {
            near.push(TcpStream::connect(addr).unwrap());
            far.push(listener.accept().unwrap().0);
        }
        (near, far)
    }

    #[test]
    fn reorder_stage_delivers_in_id_order() {
        let (handlers, rx) = collecting();
        let shared = Shared::new("test".into(), BufferPool::default(), handlers);
        for id in [2u64, 0, 3, 1] {
            shared.accept(MessageId(id), PooledBuffer::detached(vec![id as u8]));
        }
        let got: Vec<u64> = rx.try_iter().map(|(id, _)| id).collect();
        assert_eq!(got, vec![0, 1, 2, 3]);
        assert_eq!(shared.counters.delivered.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn redelivered_id_produces_no_callback() {
        let (handlers, rx) = collecting();
        let shared = Shared::new("test".into(), BufferPool::default(), handlers);
        shared.accept(MessageId(0), PooledBuffer::detached(b"a".to_vec()));
        shared.accept(MessageId(0), PooledBuffer::detached(b"a".to_vec()));
        shared.accept(MessageId(2), PooledBuffer::detached(b"c".to_vec()));
        shared.accept(MessageId(2), PooledBuffer::detached(b"c".to_vec()));
        assert_eq!(rx.try_iter().count(), 1);
        assert_eq!(shared.counters.duplicates.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn concurrent_duplicates_forward_each_payload_once() {
        const MESSAGES: u64 = 2_000;
        const THREADS: u64 = 6;

        let (handlers, rx) = collecting();
        let shared = Arc::new(Shared::new("dup".into(), BufferPool::default(), handlers));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    // Each thread walks the ids from a different starting point.
                    for k in 0..MESSAGES {
                        let id = (k + t * 331) % MESSAGES;
                        shared.accept(
                            MessageId(id),
                            PooledBuffer::detached(id.to_be_bytes().to_vec()),
                        );
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let got: Vec<(u64, Vec<u8>)> = rx.try_iter().collect();
        assert_eq!(got.len() as u64, MESSAGES);
        for (expected, (id, payload)) in got.iter().enumerate() {
            assert_eq!(*id, expected as u64);
            assert_eq!(payload.as_slice(), &id.to_be_bytes());
        }
        assert_eq!(
            shared.counters.duplicates.load(Ordering::Relaxed),
            MESSAGES * (THREADS - 1)
        );
    }

    #[test]
    fn open_requires_connections() {
        let (handlers, _rx) = collecting();
        let err = VirtualChannel::open(
            "none",
            Vec::new(),
            &ChannelConfig::default(),
            BufferPool::default(),
            handlers,
        )
        .unwrap_err();
        assert!(matches!(err, ChannelError::NoConnections));
    }

    #[test]
    fn large_payload_splits_into_consecutive_frames() {
        let (near, far) = loopback_pairs(2);
        let (h_near, _) = collecting();
        let (h_far, rx) = collecting();
        let cfg = ChannelConfig::default();
        let sender = VirtualChannel::open("near", near, &cfg, BufferPool::default(), h_near).unwrap();
        let _receiver = VirtualChannel::open("far", far, &cfg, BufferPool::default(), h_far).unwrap();

        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 256) as u8).collect();
        assert_eq!(sender.send(&payload).unwrap(), 3);
        assert!(matches!(sender.send(&[]), Err(ChannelError::EmptyPayload)));

        let mut joined = Vec::new();
        for expected in 0..3u64 {
            let (id, chunk) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(id, expected);
            joined.extend(chunk);
        }
        assert_eq!(joined, payload);
        assert_eq!(sender.stats().frames_sent, 3);
    }

    #[test]
    fn close_is_idempotent_and_rejects_sends() {
        let (near, _far) = loopback_pairs(2);
        let (handlers, _) = collecting();
        let channel = VirtualChannel::open(
            "close",
            near,
            &ChannelConfig::default(),
            BufferPool::default(),
            handlers,
        )
        .unwrap();
        channel.close();
        channel.close();
        assert!(channel.is_closed());
        assert_eq!(channel.stats().connections_up, 0);
        assert!(matches!(channel.send(b"late"), Err(ChannelError::Closed)));
    }
}
