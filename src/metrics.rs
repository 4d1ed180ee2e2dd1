//! In-process transport metrics.
//!
//! Mirrors the atomics-based counter style used elsewhere in this codebase:
//! no external metrics dependency, just `AtomicU64` counters and a `Copy`
//! snapshot for tests and diagnostics.

use std::sync::atomic::{AtomicU64, Ordering};

static CONNECTIONS_OPENED: AtomicU64 = AtomicU64::new(0);
static CONNECTIONS_CLOSED: AtomicU64 = AtomicU64::new(0);
static STREAMS_OPENED: AtomicU64 = AtomicU64::new(0);
static STREAMS_CLOSED: AtomicU64 = AtomicU64::new(0);
static DATAGRAMS_SENT: AtomicU64 = AtomicU64::new(0);
static DATAGRAMS_SENT_BYTES: AtomicU64 = AtomicU64::new(0);
static DATAGRAMS_RECEIVED: AtomicU64 = AtomicU64::new(0);
static DATAGRAMS_RECEIVED_BYTES: AtomicU64 = AtomicU64::new(0);
static HANDSHAKE_RETRANSMITS: AtomicU64 = AtomicU64::new(0);
static CONGESTION_EVENTS: AtomicU64 = AtomicU64::new(0);
static FAST_CONVERGENCE_EVENTS: AtomicU64 = AtomicU64::new(0);
static TLP_FIRINGS: AtomicU64 = AtomicU64::new(0);
static PACKETS_LOST: AtomicU64 = AtomicU64::new(0);
static ACKS_SENT: AtomicU64 = AtomicU64::new(0);

/// Marker type exposing the counter-recording associated functions. Kept as
/// a unit struct (rather than free functions) to match the call-site style
/// `Metrics::record_...` used throughout the rest of the crate.
pub struct Metrics;

impl Metrics {
    /// A new transport entered `Established` (or `Listen`, for the accept side).
    #[inline]
    pub fn record_connection_open() {
        CONNECTIONS_OPENED.fetch_add(1, Ordering::Relaxed);
    }

    /// A transport was torn down.
    #[inline]
    pub fn record_connection_close() {
        CONNECTIONS_CLOSED.fetch_add(1, Ordering::Relaxed);
    }

    /// A stream was created (first `enqueue` or first inbound DATA).
    #[inline]
    pub fn record_stream_open() {
        STREAMS_OPENED.fetch_add(1, Ordering::Relaxed);
    }

    /// A stream reached a terminal state and was removed.
    #[inline]
    pub fn record_stream_close() {
        STREAMS_CLOSED.fetch_add(1, Ordering::Relaxed);
    }

    /// A datagram was handed to the socket.
    #[inline]
    pub fn record_datagram_sent(len: usize) {
        DATAGRAMS_SENT.fetch_add(1, Ordering::Relaxed);
        DATAGRAMS_SENT_BYTES.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// A datagram arrived from the socket.
    #[inline]
    pub fn record_datagram_received(len: usize) {
        DATAGRAMS_RECEIVED.fetch_add(1, Ordering::Relaxed);
        DATAGRAMS_RECEIVED_BYTES.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// DIAL/DIALCONF/CLOSE was retransmitted by its state timer.
    #[inline]
    pub fn record_handshake_retransmit() {
        HANDSHAKE_RETRANSMITS.fetch_add(1, Ordering::Relaxed);
    }

    /// The congestion controller registered a loss event.
    #[inline]
    pub fn record_congestion_event(fast_convergence: bool) {
        CONGESTION_EVENTS.fetch_add(1, Ordering::Relaxed);
        if fast_convergence {
            FAST_CONVERGENCE_EVENTS.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// The tail-loss-probe timer fired.
    #[inline]
    pub fn record_tlp_firing() {
        TLP_FIRINGS.fetch_add(1, Ordering::Relaxed);
    }

    /// One or more packets were moved into `lost_packets`.
    #[inline]
    pub fn record_packets_lost(count: u64) {
        PACKETS_LOST.fetch_add(count, Ordering::Relaxed);
    }

    /// An ACK frame was sent.
    #[inline]
    pub fn record_ack_sent() {
        ACKS_SENT.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot every counter.
    #[must_use]
    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            connections_opened: CONNECTIONS_OPENED.load(Ordering::Relaxed),
            connections_closed: CONNECTIONS_CLOSED.load(Ordering::Relaxed),
            streams_opened: STREAMS_OPENED.load(Ordering::Relaxed),
            streams_closed: STREAMS_CLOSED.load(Ordering::Relaxed),
            datagrams_sent: DATAGRAMS_SENT.load(Ordering::Relaxed),
            datagrams_sent_bytes: DATAGRAMS_SENT_BYTES.load(Ordering::Relaxed),
            datagrams_received: DATAGRAMS_RECEIVED.load(Ordering::Relaxed),
            datagrams_received_bytes: DATAGRAMS_RECEIVED_BYTES.load(Ordering::Relaxed),
            handshake_retransmits: HANDSHAKE_RETRANSMITS.load(Ordering::Relaxed),
            congestion_events: CONGESTION_EVENTS.load(Ordering::Relaxed),
            fast_convergence_events: FAST_CONVERGENCE_EVENTS.load(Ordering::Relaxed),
            tlp_firings: TLP_FIRINGS.load(Ordering::Relaxed),
            packets_lost: PACKETS_LOST.load(Ordering::Relaxed),
            acks_sent: ACKS_SENT.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of every counter, for tests and diagnostics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Transports that reached an active state.
    pub connections_opened: u64,
    /// Transports torn down.
    pub connections_closed: u64,
    /// Streams opened.
    pub streams_opened: u64,
    /// Streams closed.
    pub streams_closed: u64,
    /// Datagrams sent.
    pub datagrams_sent: u64,
    /// Bytes sent across all datagrams.
    pub datagrams_sent_bytes: u64,
    /// Datagrams received.
    pub datagrams_received: u64,
    /// Bytes received across all datagrams.
    pub datagrams_received_bytes: u64,
    /// Handshake retransmissions.
    pub handshake_retransmits: u64,
    /// Congestion events (losses).
    pub congestion_events: u64,
    /// Congestion events resolved via fast convergence (`cwnd < w_max`).
    pub fast_convergence_events: u64,
    /// Tail-loss-probe timer firings.
    pub tlp_firings: u64,
    /// Packets declared lost.
    pub packets_lost: u64,
    /// ACK frames sent.
    pub acks_sent: u64,
}
