//! UDP side of a session.
//!
//! - Uplink: UDP socket → coalescer → virtual channel.
//! - Downlink: channel deliveries → queue → UVT reassembly → UDP socket.
//!
//! Both directions share one UDP socket. Where the downlink sends depends on
//! the side: the server replies to its fixed forward address, the client to
//! whichever local application last sent it a datagram.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use minstant::Instant;

use crate::buffer::PooledBuffer;
use crate::channel::{ChannelError, ReceiveHandler, VirtualChannel};
use crate::codec::UvtStream;
use crate::codec::uvt::UvtError;
use crate::config::CoalesceOptions;
use crate::monitor::PerformanceMonitor;
use crate::net::{Endpoint, UdpSocket};
use crate::sync::{InstrumentedQueue, QueueStats, Worker};
use crate::trace::{debug, trace, warn};

use super::coalesce::Coalescer;

/// Largest UDP datagram.
const MAX_DATAGRAM: usize = 65_535;

/// Upper bound on a single socket wait, so stop requests are noticed.
const MAX_POLL_WAIT: Duration = Duration::from_millis(100);

/// Backoff after a failed receive.
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Destination of downlink datagrams.
#[derive(Debug)]
pub enum ReplyRoute {
    Fixed(Endpoint),
    /// Learned from the source of uplink datagrams.
    LastSource(Mutex<Option<Endpoint>>),
}

impl ReplyRoute {
    #[must_use]
    pub const fn fixed(endpoint: Endpoint) -> Self {
        Self::Fixed(endpoint)
    }

    #[must_use]
    pub const fn learned() -> Self {
        Self::LastSource(Mutex::new(None))
    }

    /// Notes the source of an uplink datagram.
    pub fn observe(&self, source: Endpoint) {
        if let Self::LastSource(last) = self {
            let mut last = last.lock().unwrap_or_else(PoisonError::into_inner);
            if *last != Some(source) {
                debug!(source = %source, "reply address learned");
                *last = Some(source);
            }
        }
    }

    #[must_use]
    pub fn target(&self) -> Option<Endpoint> {
        match self {
            Self::Fixed(endpoint) => Some(*endpoint),
            Self::LastSource(last) => *last.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

/// Starts the uplink thread.
///
/// # Errors
///
/// Returns an error if the thread cannot be spawned.
pub fn spawn_uplink(
    socket: Arc<UdpSocket>,
    channel: Arc<VirtualChannel>,
    coalesce: &CoalesceOptions,
    route: Arc<ReplyRoute>,
    perf: Arc<PerformanceMonitor>,
) -> std::io::Result<Worker> {
    let mut coalescer = Coalescer::new(coalesce);
    let wait = coalesce.flush_interval().clamp(Duration::from_millis(1), MAX_POLL_WAIT);

    Worker::spawn("uvt-udp-rx", move |stop| {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        while !stop.is_stopped() {
            let batch = match socket.recv_timeout(&mut buf, wait) {
                Ok(Some((n, source))) => {
                    let started = Instant::now();
                    route.observe(source);
                    let batch = match coalescer.push(&buf[..n]) {
                        Ok(batch) => batch,
                        Err(e) => {
                            warn!(error = %e, "datagram dropped");
                            None
                        }
                    };
                    perf.record_packet(n, started.elapsed());
                    batch
                }
                Ok(None) => coalescer.flush_expired(),
                Err(e) => {
                    // e.g. ICMP port unreachable reported on the next receive
                    debug!(error = %e, "udp receive failed");
                    stop.sleep(RECV_ERROR_BACKOFF);
                    None
                }
            };

            let Some(batch) = batch else { continue };
            match channel.send(&batch) {
                Ok(frames) => trace!(bytes = batch.len(), frames, "batch sent"),
                Err(ChannelError::Closed) => break,
                Err(e) => warn!(error = %e, "batch dropped"),
            }
        }
        if let Some(rest) = coalescer.take() {
            debug!(bytes = rest.len(), "unsent batch discarded at stop");
        }
    })
}

/// Receives channel deliveries and re-emits them as UDP datagrams.
pub struct Downlink {
    queue: Arc<InstrumentedQueue<PooledBuffer>>,
    worker: Worker,
}

impl Downlink {
    /// Starts the emitter thread.
    ///
    /// `on_corrupt` is called once if a checksum mismatch is found; the
    /// emitter stops afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn<F>(
        socket: Arc<UdpSocket>,
        route: Arc<ReplyRoute>,
        perf: Arc<PerformanceMonitor>,
        on_corrupt: F,
    ) -> std::io::Result<Self>
    where
        F: FnOnce(UvtError) + Send + 'static,
    {
        let queue: Arc<InstrumentedQueue<PooledBuffer>> = Arc::new(InstrumentedQueue::new());
        let inbox = Arc::clone(&queue);
        let worker = Worker::spawn("uvt-udp-tx", move |_| {
            let mut stream = UvtStream::new();
            while let Some(payload) = inbox.dequeue() {
                let started = Instant::now();
                stream.push(&payload);
                drop(payload);

                let emitted = stream.drain(|datagram| {
                    let Some(dest) = route.target() else {
                        debug!(len = datagram.payload.len(), "no reply address yet, datagram dropped");
                        return;
                    };
                    match socket.send_to(datagram.payload, dest) {
                        Ok(_) => perf.record_packet(datagram.payload.len(), started.elapsed()),
                        Err(e) => warn!(dest = %dest, error = %e, "udp send failed"),
                    }
                });
                if let Err(e) = emitted {
                    warn!(error = %e, "corrupt datagram stream");
                    on_corrupt(e);
                    return;
                }
            }
        })?;
        Ok(Self { queue, worker })
    }

    /// Channel receive handler feeding this downlink.
    #[must_use]
    pub fn receive_handler(&self) -> ReceiveHandler {
        let queue = Arc::clone(&self.queue);
        Box::new(move |_, payload| {
            // Rejected only after stop; the payload is recycled.
            let _ = queue.enqueue(payload);
        })
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Cancels the queue and joins the emitter. Undelivered payloads are
    /// recycled.
    pub fn stop(&mut self) {
        self.queue.cancel();
        self.worker.stop();
        self.queue.drain();
    }
}

impl Drop for Downlink {
    fn drop(&mut self) {
        self.stop();
    }
}
