//! A reliable, encrypted, multi-stream transport protocol carried over
//! unreliable datagrams.
//!
//! A connection performs a sealed-box X25519 handshake (DIAL/DIALCONF/CONF),
//! then multiplexes any number of independently-ordered byte streams over
//! AES-256-GCM-framed DATA packets, with NewReno congestion control, a
//! tail-loss-probe timer for fast loss recovery, and a cooperative
//! SKIP/FLUSH protocol for abandoning a stream's unread prefix without
//! tearing down the connection.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::time::Instant;
//! use bytes::Bytes;
//! use streamline::config::TransportConfig;
//! use streamline::crypto::StaticKeypair;
//! use streamline::transport::{StreamTransport, TransportDelegate};
//!
//! #[derive(Default)]
//! struct Echo;
//! impl TransportDelegate for Echo {
//!     fn did_recv(&mut self, stream_id: u16, data: Bytes) {
//!         println!("stream {stream_id}: {} bytes", data.len());
//!     }
//! }
//!
//! let local = StaticKeypair::generate();
//! let mut transport = StreamTransport::new(TransportConfig::default(), local, Echo);
//! let now = Instant::now();
//! transport.poll_timers(now);
//! ```
//!
//! The core never touches a socket or the wall clock on its own: the
//! application (or [`factory::TransportFactory`]) feeds it datagrams via
//! `on_datagram` and drives its timers via `poll_timers`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod ack;
pub mod backoff;
pub mod buffer;
pub mod config;
pub mod congestion;
pub mod crypto;
pub mod error;
pub mod factory;
pub mod loss;
pub mod metrics;
pub mod socket;
pub mod stream;
pub mod transport;
pub mod wire;

pub use config::TransportConfig;
pub use error::{Error, Result, SendError};
pub use factory::{ListenDelegate, TransportFactory};
pub use transport::{ConnectionState, StreamTransport, TransportDelegate};

/// Crate version, exposed for diagnostics and handshake-compatibility checks.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
