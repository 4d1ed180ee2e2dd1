//! Per-stream state machines multiplexed inside a single connection.

mod recv;
mod send;

pub use recv::{RecvState, RecvStream};
pub use send::{Fragment, SendState, SendStream, SentRange};
