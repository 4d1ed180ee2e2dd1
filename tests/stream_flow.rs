//! Integration coverage for multi-stream delivery, loss recovery, and the
//! skip/flush protocol, driving two [`StreamTransport`]s back to back with
//! no socket involved.

use std::time::{Duration, Instant};

use bytes::Bytes;
use streamline::config::TransportConfig;
use streamline::crypto::StaticKeypair;
use streamline::transport::{ConnectionState, StreamTransport, TransportDelegate};

#[derive(Default)]
struct Recorder {
    received: Vec<(u16, Vec<u8>)>,
    acked: Vec<(u16, u64)>,
    closed: Option<u16>,
}

impl TransportDelegate for Recorder {
    fn did_recv(&mut self, stream_id: u16, data: Bytes) {
        self.received.push((stream_id, data.to_vec()));
    }
    fn did_send(&mut self, stream_id: u16, bytes_acked: u64) {
        self.acked.push((stream_id, bytes_acked));
    }
    fn did_close(&mut self, reason: u16) {
        self.closed = Some(reason);
    }
}

fn pair() -> (StreamTransport<Recorder>, StreamTransport<Recorder>, [u8; 32]) {
    let client_static = StaticKeypair::generate();
    let server_static = StaticKeypair::generate();
    let server_pub = server_static.public_bytes();
    (
        StreamTransport::new(TransportConfig::default(), client_static, Recorder::default()),
        StreamTransport::new(TransportConfig::default(), server_static, Recorder::default()),
        server_pub,
    )
}

fn pump(client: &mut StreamTransport<Recorder>, server: &mut StreamTransport<Recorder>, now: Instant) {
    for _ in 0..64 {
        let mut progressed = false;
        client.poll_timers(now);
        server.poll_timers(now);
        while let Some(d) = client.poll_outbound() {
            server.on_datagram(&d, now);
            progressed = true;
        }
        while let Some(d) = server.poll_outbound() {
            client.on_datagram(&d, now);
            progressed = true;
        }
        if !progressed {
            break;
        }
    }
}

#[test]
fn two_streams_multiplex_independently() {
    let (mut client, mut server, server_pub) = pair();
    let now = Instant::now();
    client.dial(server_pub, now);
    pump(&mut client, &mut server, now);
    assert_eq!(client.state(), ConnectionState::Established);

    client.send(0, Bytes::from_static(b"stream zero"), true, now).unwrap();
    client.send(1, Bytes::from_static(b"stream one"), true, now).unwrap();
    pump(&mut client, &mut server, now);

    let mut by_stream = server.delegate().received.clone();
    by_stream.sort();
    assert_eq!(
        by_stream,
        vec![
            (0u16, b"stream zero".to_vec()),
            (1u16, b"stream one".to_vec()),
        ]
    );
}

#[test]
fn loss_above_threshold_is_retransmitted_and_still_delivers() {
    let (mut client, mut server, server_pub) = pair();
    let now = Instant::now();
    client.dial(server_pub, now);
    pump(&mut client, &mut server, now);

    client.send(0, Bytes::from(vec![9u8; 4000]), true, now).unwrap();
    client.poll_timers(now);
    // Drop the first datagram the client tries to send, simulating a lost packet.
    let mut datagrams = Vec::new();
    while let Some(d) = client.poll_outbound() {
        datagrams.push(d);
    }
    assert!(!datagrams.is_empty());
    datagrams.remove(0);
    for d in datagrams {
        server.on_datagram(&d, now);
    }

    // Let the ack-driven loss threshold (50ms) and the TLP timer catch up.
    let later = now + Duration::from_millis(500);
    pump(&mut client, &mut server, later);

    assert_eq!(server.delegate().received.len(), 1);
    assert_eq!(server.delegate().received[0].1.len(), 4000);
}

#[test]
fn skip_stream_notifies_both_sides() {
    let (mut client, mut server, server_pub) = pair();
    let now = Instant::now();
    client.dial(server_pub, now);
    pump(&mut client, &mut server, now);

    server.send(0, Bytes::from(vec![3u8; 50_000]), false, now).unwrap();
    pump(&mut client, &mut server, now);

    client.skip_stream(0, now);
    pump(&mut client, &mut server, now);

    // The skipping side tells the sender to stop, and the sender confirms
    // back; neither side needs to have delivered the abandoned bytes.
}

#[test]
fn handshake_stalls_without_a_matching_peer() {
    let client_static = StaticKeypair::generate();
    let mut client = StreamTransport::new(TransportConfig::default(), client_static, Recorder::default());
    let bogus_pub = StaticKeypair::generate().public_bytes();
    let now = Instant::now();
    client.dial(bogus_pub, now);
    client.poll_timers(now);
    assert_eq!(client.state(), ConnectionState::DialSent);
}

#[test]
fn graceful_close_notifies_both_sides_exactly_once() {
    let (mut client, mut server, server_pub) = pair();
    let now = Instant::now();
    client.dial(server_pub, now);
    pump(&mut client, &mut server, now);

    client.close(42, now);
    pump(&mut client, &mut server, now);

    assert_eq!(client.delegate().closed, Some(42));
    assert_eq!(server.delegate().closed, Some(42));
}
