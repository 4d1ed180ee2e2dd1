//! Runtime configuration for the transport.
//!
//! A single [`TransportConfig`] groups every tunable named in the design
//! document so construction sites don't thread a dozen loose constants
//! through `StreamTransport::new` / `TransportFactory::bind`.

use std::time::Duration;

/// Fragment size chosen to keep ciphertext within a safe MTU after the
/// 10-byte envelope, the 18 bytes of DATA-specific header fields, the
/// 16-byte GCM tag, and the 12-byte nonce trailer.
pub const DEFAULT_FRAGMENT_SIZE: usize = 1350;

/// Byte budget served by a single pacing timer invocation before it
/// reschedules itself rather than looping further.
pub const DEFAULT_PACING_LIMIT_BYTES: usize = 400_000;

/// Initial congestion window, in bytes.
pub const DEFAULT_INITIAL_CWND: u64 = 100_000;

/// Floor below which the congestion window is never allowed to shrink.
pub const DEFAULT_CWND_FLOOR: u64 = 10_000;

/// Delay before a batched ACK frame is sent after the first newly-received DATA.
pub const DEFAULT_ACK_DELAY: Duration = Duration::from_millis(25);

/// Ack-driven loss threshold: a sent packet older than this relative to the
/// most recently sent packet is declared lost.
pub const DEFAULT_LOSS_THRESHOLD: Duration = Duration::from_millis(50);

/// Initial tail-loss-probe interval.
pub const DEFAULT_TLP_INITIAL: Duration = Duration::from_secs(1);

/// Cap on the tail-loss-probe backoff; reaching it declares the peer dead.
pub const DEFAULT_TLP_CAP: Duration = Duration::from_secs(25);

/// Cap on the handshake (DIAL/DIALCONF) retry backoff.
pub const DEFAULT_HANDSHAKE_CAP: Duration = Duration::from_secs(64);

/// Cap on the close (CLOSE/CLOSECONF) retry backoff.
pub const DEFAULT_CLOSE_CAP: Duration = Duration::from_secs(8);

/// Per-stream send-queue backpressure limit.
pub const DEFAULT_MAX_SEND_QUEUE_BYTES: u64 = 20_000_000;

/// Maximum number of run-length entries retained by `AckRanges`.
pub const DEFAULT_MAX_ACK_RANGES: usize = 1001;

/// Maximum number of run-length entries serialized into a single ACK frame.
pub const DEFAULT_MAX_SERIALIZED_ACK_RANGES: usize = 171;

/// Construction-time configuration for a [`crate::transport::StreamTransport`]
/// or [`crate::factory::TransportFactory`].
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransportConfig {
    /// Maximum plaintext bytes per DATA fragment.
    pub fragment_size: usize,
    /// Byte budget per pacing timer invocation.
    pub pacing_limit_bytes: usize,
    /// Initial congestion window.
    pub initial_cwnd: u64,
    /// Floor for the congestion window.
    pub cwnd_floor: u64,
    /// Delay before sending a batched ACK.
    #[cfg_attr(feature = "serde", serde(with = "duration_millis"))]
    pub ack_delay: Duration,
    /// Ack-driven loss detection threshold.
    #[cfg_attr(feature = "serde", serde(with = "duration_millis"))]
    pub loss_threshold: Duration,
    /// Initial TLP timer interval.
    #[cfg_attr(feature = "serde", serde(with = "duration_millis"))]
    pub tlp_initial: Duration,
    /// TLP backoff cap; reaching it declares the connection dead.
    #[cfg_attr(feature = "serde", serde(with = "duration_millis"))]
    pub tlp_cap: Duration,
    /// Handshake retry backoff cap.
    #[cfg_attr(feature = "serde", serde(with = "duration_millis"))]
    pub handshake_cap: Duration,
    /// Close retry backoff cap.
    #[cfg_attr(feature = "serde", serde(with = "duration_millis"))]
    pub close_cap: Duration,
    /// Per-stream send-queue backpressure limit, in bytes.
    pub max_send_queue_bytes: u64,
    /// Maximum AckRanges run-length entries retained.
    pub max_ack_ranges: usize,
    /// Maximum AckRanges run-length entries serialized per ACK frame.
    pub max_serialized_ack_ranges: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            pacing_limit_bytes: DEFAULT_PACING_LIMIT_BYTES,
            initial_cwnd: DEFAULT_INITIAL_CWND,
            cwnd_floor: DEFAULT_CWND_FLOOR,
            ack_delay: DEFAULT_ACK_DELAY,
            loss_threshold: DEFAULT_LOSS_THRESHOLD,
            tlp_initial: DEFAULT_TLP_INITIAL,
            tlp_cap: DEFAULT_TLP_CAP,
            handshake_cap: DEFAULT_HANDSHAKE_CAP,
            close_cap: DEFAULT_CLOSE_CAP,
            max_send_queue_bytes: DEFAULT_MAX_SEND_QUEUE_BYTES,
            max_ack_ranges: DEFAULT_MAX_ACK_RANGES,
            max_serialized_ack_ranges: DEFAULT_MAX_SERIALIZED_ACK_RANGES,
        }
    }
}

#[cfg(feature = "serde")]
mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
