//! UDP transmitter: rate-limited, coalescing sender of pixel strips

use super::wire::{Encoder, WireError};
use crate::config::{ConfigError, Endpoint, Protocol, MAX_LED_COUNT};
use crate::effects::Rgb;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Consecutive send failures that raise the transmit error flag
pub const FAILURE_THRESHOLD: u64 = 3;

/// Transmitter errors
#[derive(Error, Debug)]
pub enum TransmitError {
    #[error("Failed to resolve endpoint: {0}")]
    Resolve(#[from] ConfigError),

    #[error("Socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("Encoding failed: {0}")]
    Wire(#[from] WireError),
}

/// Counters shared with the engine's diagnostics
#[derive(Debug, Default)]
pub struct TransmitStats {
    send_failures: AtomicU64,
    consecutive_failures: AtomicU64,
    transmit_error: AtomicBool,
    datagrams_sent: AtomicU64,
    frames_sent: AtomicU64,
    frames_coalesced: AtomicU64,
}

impl TransmitStats {
    pub fn send_failures(&self) -> u64 {
        self.send_failures.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Set after three consecutive failures, cleared by the next good send
    pub fn transmit_error(&self) -> bool {
        self.transmit_error.load(Ordering::Relaxed)
    }

    pub fn datagrams_sent(&self) -> u64 {
        self.datagrams_sent.load(Ordering::Relaxed)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Frames replaced by a newer one before they could be sent
    pub fn frames_coalesced(&self) -> u64 {
        self.frames_coalesced.load(Ordering::Relaxed)
    }

    fn record_failure(&self) -> u64 {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
        let consecutive = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if consecutive >= FAILURE_THRESHOLD {
            self.transmit_error.store(true, Ordering::Relaxed);
        }
        consecutive
    }

    fn record_success(&self, datagrams: usize) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.transmit_error.store(false, Ordering::Relaxed);
        self.datagrams_sent
            .fetch_add(datagrams as u64, Ordering::Relaxed);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }
}

/// What happened to the pending frame on this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// All datagrams of the frame went out; carries the frame's arrival stamp
    Sent { newest_ns: u64 },

    /// Held back by the rate limit
    Deferred,

    /// Send failed; the frame stays pending for the next tick
    Failed,

    /// Nothing to send
    Idle,
}

/// Owns the socket and the pending-frame slot
pub struct Transmitter {
    socket: UdpSocket,
    target: SocketAddr,
    endpoint: Endpoint,
    encoder: Encoder,
    min_interval: Duration,
    last_attempt: Option<Instant>,
    pending: Vec<Rgb>,
    pending_ns: u64,
    has_pending: bool,
    stats: Arc<TransmitStats>,
}

fn bind_for(target: &SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = if target.is_ipv4() {
        UdpSocket::bind("0.0.0.0:0")?
    } else {
        UdpSocket::bind("[::]:0")?
    };
    socket.set_nonblocking(true)?;
    Ok(socket)
}

impl Transmitter {
    /// Open a non-blocking socket towards `endpoint`
    pub fn open(
        endpoint: &Endpoint,
        protocol: Protocol,
        timeout_secs: u8,
        max_fps: u32,
        stats: Arc<TransmitStats>,
    ) -> Result<Self, TransmitError> {
        let target = endpoint.resolve()?;
        let socket = bind_for(&target)?;
        log::info!("Transmitter opened towards {} ({:?})", target, protocol);

        Ok(Self {
            socket,
            target,
            endpoint: endpoint.clone(),
            encoder: Encoder::new(protocol, timeout_secs),
            min_interval: Duration::from_secs_f64(1.0 / max_fps.max(1) as f64),
            last_attempt: None,
            pending: Vec::with_capacity(MAX_LED_COUNT),
            pending_ns: 0,
            has_pending: false,
            stats,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn protocol(&self) -> Protocol {
        self.encoder.protocol()
    }

    pub fn set_protocol(&mut self, protocol: Protocol) {
        self.encoder.set_protocol(protocol);
    }

    pub fn stats(&self) -> &Arc<TransmitStats> {
        &self.stats
    }

    /// Point the transmitter at a new endpoint, re-opening the socket
    pub fn set_endpoint(&mut self, endpoint: &Endpoint) -> Result<(), TransmitError> {
        let target = endpoint.resolve()?;
        self.socket = bind_for(&target)?;
        self.target = target;
        self.endpoint = endpoint.clone();
        log::info!("Transmitter re-opened towards {}", target);
        Ok(())
    }

    /// Queue a frame and send it if the rate limit allows.
    ///
    /// A frame still pending from an earlier tick is replaced.
    pub fn submit(&mut self, pixels: &[Rgb], newest_ns: u64, now: Instant) -> SendOutcome {
        if self.has_pending {
            self.stats.frames_coalesced.fetch_add(1, Ordering::Relaxed);
        }
        self.pending.clear();
        self.pending.extend_from_slice(pixels);
        self.pending_ns = newest_ns;
        self.has_pending = true;
        self.flush(now)
    }

    /// Send the pending frame if one is waiting and the rate limit allows
    pub fn flush(&mut self, now: Instant) -> SendOutcome {
        if !self.has_pending {
            return SendOutcome::Idle;
        }
        if let Some(last) = self.last_attempt {
            if now.saturating_duration_since(last) < self.min_interval {
                return SendOutcome::Deferred;
            }
        }
        self.last_attempt = Some(now);

        let count = match self.encoder.encode(&self.pending) {
            Ok(count) => count,
            Err(e) => {
                log::error!("Dropping frame that cannot be encoded: {}", e);
                self.has_pending = false;
                return SendOutcome::Failed;
            }
        };

        for datagram in self.encoder.datagrams() {
            if let Err(e) = self.socket.send_to(datagram, self.target) {
                let consecutive = self.stats.record_failure();
                if consecutive == FAILURE_THRESHOLD {
                    log::warn!(
                        "{} consecutive sends to {} failed: {}",
                        consecutive,
                        self.target,
                        e
                    );
                } else {
                    log::debug!("Send to {} failed: {}", self.target, e);
                }
                return SendOutcome::Failed;
            }
        }

        self.stats.record_success(count);
        self.has_pending = false;
        SendOutcome::Sent {
            newest_ns: self.pending_ns,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.has_pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire::decode_into;

    fn receiver() -> (UdpSocket, Endpoint) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, Endpoint::new("127.0.0.1", port))
    }

    fn strip(n: usize, value: u8) -> Vec<Rgb> {
        vec![Rgb::new(value, value, value); n]
    }

    fn recv_strip(socket: &UdpSocket) -> Vec<Rgb> {
        let mut buf = [0u8; 2048];
        let n = socket.recv(&mut buf).unwrap();
        let mut pixels = Vec::new();
        decode_into(&buf[..n], &mut pixels).unwrap();
        pixels
    }

    #[test]
    fn sends_a_frame() {
        let (rx, endpoint) = receiver();
        let stats = Arc::new(TransmitStats::default());
        let mut tx = Transmitter::open(&endpoint, Protocol::Drgb, 2, 90, stats.clone()).unwrap();

        let outcome = tx.submit(&strip(10, 7), 42, Instant::now());
        assert_eq!(outcome, SendOutcome::Sent { newest_ns: 42 });
        assert_eq!(recv_strip(&rx), strip(10, 7));
        assert_eq!(stats.frames_sent(), 1);
        assert_eq!(stats.datagrams_sent(), 1);
    }

    #[test]
    fn rate_limit_coalesces_to_the_newest_frame() {
        let (rx, endpoint) = receiver();
        let stats = Arc::new(TransmitStats::default());
        let mut tx = Transmitter::open(&endpoint, Protocol::Drgb, 2, 90, stats.clone()).unwrap();

        let start = Instant::now();
        assert!(matches!(tx.submit(&strip(4, 1), 1, start), SendOutcome::Sent { .. }));
        assert_eq!(tx.submit(&strip(4, 2), 2, start), SendOutcome::Deferred);
        assert_eq!(tx.submit(&strip(4, 3), 3, start), SendOutcome::Deferred);
        assert_eq!(stats.frames_coalesced(), 1);

        let later = start + Duration::from_millis(12);
        assert_eq!(tx.flush(later), SendOutcome::Sent { newest_ns: 3 });
        assert_eq!(tx.flush(later), SendOutcome::Idle);

        assert_eq!(recv_strip(&rx), strip(4, 1));
        assert_eq!(recv_strip(&rx), strip(4, 3));
        assert_eq!(stats.frames_sent(), 2);
    }

    #[test]
    fn large_strips_go_out_as_ordered_segments() {
        let (rx, endpoint) = receiver();
        let stats = Arc::new(TransmitStats::default());
        let mut tx = Transmitter::open(&endpoint, Protocol::Dnrgb, 2, 90, stats.clone()).unwrap();

        let pixels: Vec<Rgb> = (0..1000).map(|i| Rgb::new(i as u8, 0, 0)).collect();
        tx.submit(&pixels, 0, Instant::now());
        assert_eq!(stats.datagrams_sent(), 3);

        let mut received = Vec::new();
        let mut buf = [0u8; 2048];
        for _ in 0..3 {
            let n = rx.recv(&mut buf).unwrap();
            assert!(n <= 1400);
            decode_into(&buf[..n], &mut received).unwrap();
        }
        assert_eq!(received, pixels);
    }

    #[test]
    fn endpoint_change_reopens_socket() {
        let (_first_rx, first) = receiver();
        let (second_rx, second) = receiver();
        let stats = Arc::new(TransmitStats::default());
        let mut tx = Transmitter::open(&first, Protocol::Drgb, 2, 90, stats).unwrap();

        tx.set_endpoint(&second).unwrap();
        assert_eq!(tx.endpoint(), &second);
        tx.submit(&strip(3, 9), 0, Instant::now());
        assert_eq!(recv_strip(&second_rx), strip(3, 9));
    }

    #[test]
    fn failed_sends_keep_the_frame_for_retry() {
        let stats = Arc::new(TransmitStats::default());
        // Broadcast without SO_BROADCAST is refused by the OS
        let refused = Endpoint::new("255.255.255.255", 21324);
        let mut tx = Transmitter::open(&refused, Protocol::Drgb, 2, 90, stats.clone()).unwrap();

        let start = Instant::now();
        assert_eq!(tx.submit(&strip(5, 4), 7, start), SendOutcome::Failed);
        assert!(tx.has_pending());
        assert_eq!(stats.consecutive_failures(), 1);
        assert!(!stats.transmit_error());

        assert_eq!(tx.flush(start), SendOutcome::Deferred);
        assert_eq!(tx.flush(start + Duration::from_millis(12)), SendOutcome::Failed);
        assert!(!stats.transmit_error());
        assert_eq!(tx.flush(start + Duration::from_millis(24)), SendOutcome::Failed);
        assert!(stats.transmit_error());
        assert_eq!(stats.send_failures(), 3);
        assert_eq!(stats.frames_sent(), 0);
        assert!(tx.has_pending());

        let (rx, endpoint) = receiver();
        tx.set_endpoint(&endpoint).unwrap();
        assert_eq!(
            tx.flush(start + Duration::from_millis(36)),
            SendOutcome::Sent { newest_ns: 7 }
        );
        assert_eq!(recv_strip(&rx), strip(5, 4));
        assert!(!stats.transmit_error());
        assert_eq!(stats.send_failures(), 3);
    }

    #[test]
    fn three_consecutive_failures_raise_the_flag() {
        let stats = TransmitStats::default();
        stats.record_failure();
        stats.record_failure();
        assert!(!stats.transmit_error());
        stats.record_failure();
        assert!(stats.transmit_error());
        assert_eq!(stats.send_failures(), 3);

        stats.record_success(1);
        assert!(!stats.transmit_error());
        assert_eq!(stats.consecutive_failures(), 0);
        assert_eq!(stats.send_failures(), 3);
    }
}
