//! `StreamTransport`: one connection's handshake, data plane, and close state
//! machine.
//!
//! A transport never touches a socket directly — it decodes inbound
//! datagrams handed to it by [`crate::factory::TransportFactory`], and
//! queues outbound datagrams for the factory to actually send. This keeps
//! the whole state machine single-threaded and cooperative: every method
//! here runs to completion without suspending. The application (or the
//! factory, on its behalf) drives the transport by calling `on_datagram`
//! when bytes arrive and `poll_timers` periodically — a granularity around
//! half the ack delay (a few milliseconds) is enough to keep pacing and
//! retransmission timely without busy-polling.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, instrument, trace, warn};

use crate::ack::{expand_ack_ranges, AckRanges};
use crate::backoff::BackoffTimer;
use crate::config::TransportConfig;
use crate::congestion::CongestionController;
use crate::crypto::{CryptoSession, EphemeralKeypair, StaticKeypair};
use crate::error::{SendError, StreamError};
use crate::loss::{RttEstimator, TlpTimer};
use crate::metrics::Metrics;
use crate::stream::{Fragment, RecvStream, SendState, SendStream};
use crate::wire::{self, AckFrameBody, DataFrame, Frame, MessageBody};

/// Sentinel close reason used internally for resets (handshake timeout, TLP
/// timeout, peer RST, decrypt failure) as opposed to an application-supplied
/// code. Real application reasons are expected to stay well below this.
pub const CLOSE_REASON_RESET: u16 = u16::MAX;

/// Lifecycle of a [`StreamTransport`] connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No handshake activity yet.
    Listen,
    /// We sent DIAL and are waiting for DIALCONF.
    DialSent,
    /// We received DIAL (or sent DIALCONF) and are waiting for confirmation.
    DialRcvd,
    /// Handshake complete; the data plane is open.
    Established,
    /// Graceful close in progress.
    Closing,
}

/// Application-facing callbacks a [`StreamTransport`] invokes as protocol
/// events occur. All methods have no-op defaults except [`did_recv`], which
/// is how delivered bytes actually reach the application.
#[allow(unused_variables)]
pub trait TransportDelegate {
    /// Called once, after a transport we dialled reaches `Established`.
    fn did_dial(&mut self) {}
    /// In-order, deduplicated bytes delivered for `stream_id`.
    fn did_recv(&mut self, stream_id: u16, data: Bytes);
    /// A previously queued send has been fully acknowledged.
    fn did_send(&mut self, stream_id: u16, bytes_acked: u64) {}
    /// The connection has fully closed; fires exactly once.
    fn did_close(&mut self, reason: u16) {}
    /// Peer asked us to stop sending before `stream_id`'s current offset.
    fn did_recv_skip_stream(&mut self, stream_id: u16) {}
    /// Peer told us it will never send bytes before `new_offset`.
    fn did_recv_flush_stream(&mut self, stream_id: u16, old_offset: u64, new_offset: u64) {}
    /// Peer acknowledged our FLUSHSTREAM.
    fn did_recv_flush_conf(&mut self, stream_id: u16) {}
}

struct SentPacketMeta {
    stream_id: u16,
    offset: u64,
    length: u64,
    sent_time: Instant,
}

/// One instance per peer: the connection state machine, its streams, and
/// every timer that drives retransmission and pacing.
pub struct StreamTransport<D: TransportDelegate> {
    config: TransportConfig,
    delegate: D,

    state: ConnectionState,
    dialled: bool,
    dial_notified: bool,
    closed_notified: bool,

    src_conn_id: u32,
    dst_conn_id: u32,
    local_static: StaticKeypair,
    remote_static_pk: Option<[u8; 32]>,
    /// Held only on the dialling side, between `dial()` and the DIALCONF
    /// that completes the DH. The accepting side derives its session inline
    /// within `handle_dial` and never needs to park it here.
    handshake_ephemeral: Option<EphemeralKeypair>,
    /// The public half of whichever ephemeral keypair we last sent in a
    /// DIAL/DIALCONF, kept around (separately from the consumable secret
    /// above) so a retransmit-tolerant reply in `Established` can resend it.
    local_ephemeral_pub: Option<[u8; 32]>,
    crypto: Option<CryptoSession>,

    send_streams: HashMap<u16, SendStream>,
    recv_streams: HashMap<u16, RecvStream>,
    send_queue: VecDeque<u16>,

    ack_ranges: AckRanges,
    ack_deadline: Option<Instant>,

    congestion: CongestionController,
    rtt: RttEstimator,
    tlp: TlpTimer,

    next_packet_number: u64,
    sent_packets: BTreeMap<u64, SentPacketMeta>,
    lost_packets: BTreeMap<u64, SentPacketMeta>,
    /// Fragments moved out of `sent_packets` by loss detection, awaiting
    /// retransmission by the pacer: `(stream_id, offset, length)`.
    lost_queue: VecDeque<(u16, u64, u64)>,
    congestion_epoch: Option<Instant>,
    pacing_deadline: Option<Instant>,

    handshake_timer: BackoffTimer,
    close_timer: BackoffTimer,
    skip_timers: HashMap<u16, BackoffTimer>,
    flush_timers: HashMap<u16, BackoffTimer>,

    close_reason: u16,
    outbound: VecDeque<Bytes>,
}

impl<D: TransportDelegate> StreamTransport<D> {
    /// Build a transport in `Listen`, with a freshly chosen connection id
    /// reserved lazily (ids are only meaningful once a handshake starts).
    #[must_use]
    pub fn new(config: TransportConfig, local_static: StaticKeypair, delegate: D) -> Self {
        Self {
            handshake_timer: BackoffTimer::new(Duration::from_secs(1), config.handshake_cap),
            close_timer: BackoffTimer::new(Duration::from_secs(1), config.close_cap),
            config,
            delegate,
            state: ConnectionState::Listen,
            dialled: false,
            dial_notified: false,
            closed_notified: false,
            src_conn_id: 0,
            dst_conn_id: 0,
            local_static,
            remote_static_pk: None,
            handshake_ephemeral: None,
            local_ephemeral_pub: None,
            crypto: None,
            send_streams: HashMap::new(),
            recv_streams: HashMap::new(),
            send_queue: VecDeque::new(),
            ack_ranges: AckRanges::new(config.max_ack_ranges, config.max_serialized_ack_ranges),
            ack_deadline: None,
            congestion: CongestionController::new(config.initial_cwnd, config.cwnd_floor),
            rtt: RttEstimator::new(),
            tlp: TlpTimer::new(config.tlp_initial, config.tlp_cap),
            next_packet_number: 0,
            sent_packets: BTreeMap::new(),
            lost_packets: BTreeMap::new(),
            lost_queue: VecDeque::new(),
            congestion_epoch: None,
            pacing_deadline: None,
            skip_timers: HashMap::new(),
            flush_timers: HashMap::new(),
            close_reason: 0,
            outbound: VecDeque::new(),
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the data plane is open for `send`.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == ConnectionState::Established
    }

    /// Whether `did_close` has already fired. A [`crate::factory::TransportFactory`]
    /// polls this after every call into the transport to know when to drop
    /// its map entry.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed_notified
    }

    /// Smoothed round-trip time, once at least one sample has landed.
    #[must_use]
    pub fn rtt(&self) -> Option<Duration> {
        self.rtt.get()
    }

    /// Our connection id, once the handshake has assigned one.
    #[must_use]
    pub fn src_conn_id(&self) -> u32 {
        self.src_conn_id
    }

    /// The delegate this transport was constructed with.
    #[must_use]
    pub fn delegate(&self) -> &D {
        &self.delegate
    }

    /// Mutable access to the delegate, e.g. to reset recorded state between
    /// assertions in a test.
    pub fn delegate_mut(&mut self) -> &mut D {
        &mut self.delegate
    }

    /// Pull the next queued outbound datagram, if any.
    pub fn poll_outbound(&mut self) -> Option<Bytes> {
        let datagram = self.outbound.pop_front();
        if let Some(ref bytes) = datagram {
            Metrics::record_datagram_sent(bytes.len());
        }
        datagram
    }

    fn queue_frame(&mut self, body: MessageBody) {
        let frame = Frame {
            src_conn_id: self.src_conn_id,
            dst_conn_id: self.dst_conn_id,
            body,
        };
        let mut buf = Vec::new();
        wire::encode(&frame, &mut buf);
        self.outbound.push_back(Bytes::from(buf));
    }

    // ---- Dial / accept -------------------------------------------------

    /// Initiate a handshake to a peer identified by its static public key.
    #[instrument(level = "debug", skip(self, now))]
    pub fn dial(&mut self, remote_static_pk: [u8; 32], now: Instant) {
        self.dialled = true;
        self.remote_static_pk = Some(remote_static_pk);
        self.src_conn_id = u32::from_be_bytes(crate::crypto::random_bytes::<4>());
        self.dst_conn_id = 0;
        let ephemeral = EphemeralKeypair::generate();
        self.local_ephemeral_pub = Some(ephemeral.public_bytes());
        self.handshake_ephemeral = Some(ephemeral);
        self.send_dial();
        self.handshake_timer.arm(now);
        self.state = ConnectionState::DialSent;
    }

    fn send_dial(&mut self) {
        let Some(remote_pk) = self.remote_static_pk else {
            return;
        };
        let Some(our_ephemeral_pub) = self.local_ephemeral_pub else {
            return;
        };
        let mut payload = Vec::with_capacity(64);
        payload.extend_from_slice(&self.local_static.public_bytes());
        payload.extend_from_slice(&our_ephemeral_pub);
        let sealed_box = Bytes::from(crate::crypto::seal_box(&payload, &remote_pk));
        self.queue_frame(MessageBody::Dial { sealed_box });
    }

    fn send_dialconf(&mut self) {
        let Some(remote_pk) = self.remote_static_pk else {
            return;
        };
        let Some(our_ephemeral_pub) = self.local_ephemeral_pub else {
            return;
        };
        let sealed_box = Bytes::from(crate::crypto::seal_box(&our_ephemeral_pub, &remote_pk));
        self.queue_frame(MessageBody::DialConf { sealed_box });
    }

    fn send_conf(&mut self) {
        self.queue_frame(MessageBody::Conf);
    }

    fn send_rst(&mut self, src_conn_id: u32, dst_conn_id: u32) {
        let frame = Frame {
            src_conn_id,
            dst_conn_id,
            body: MessageBody::Rst,
        };
        let mut buf = Vec::new();
        wire::encode(&frame, &mut buf);
        self.outbound.push_back(Bytes::from(buf));
    }

    fn enter_established(&mut self, now: Instant) {
        if self.state == ConnectionState::Established {
            return;
        }
        self.state = ConnectionState::Established;
        Metrics::record_connection_open();
        self.tlp.arm(now);
        if self.dialled && !self.dial_notified {
            self.dial_notified = true;
            self.delegate.did_dial();
        }
        debug!(src = self.src_conn_id, dst = self.dst_conn_id, "connection established");
    }

    fn notify_close(&mut self, reason: u16) {
        if self.closed_notified {
            return;
        }
        self.closed_notified = true;
        self.close_reason = reason;
        Metrics::record_connection_close();
        self.delegate.did_close(reason);
    }

    /// Tear down all connection state and notify the application exactly
    /// once, used for both peer-initiated RST and any locally-detected
    /// irrecoverable condition (handshake timeout, TLP timeout, decrypt
    /// failure).
    fn reset_and_close(&mut self, reason: u16, _now: Instant) {
        self.handshake_timer.disarm();
        self.close_timer.disarm();
        self.tlp.disarm();
        for timer in self.skip_timers.values_mut() {
            timer.disarm();
        }
        for timer in self.flush_timers.values_mut() {
            timer.disarm();
        }
        self.skip_timers.clear();
        self.flush_timers.clear();
        self.send_streams.clear();
        self.recv_streams.clear();
        self.send_queue.clear();
        self.sent_packets.clear();
        self.lost_packets.clear();
        self.lost_queue.clear();
        self.ack_deadline = None;
        self.pacing_deadline = None;
        self.state = ConnectionState::Closing;
        self.notify_close(reason);
    }

    /// Close the connection gracefully: announce CLOSE and wait for
    /// CLOSECONF, escalating to a hard reset if the peer never answers.
    pub fn close(&mut self, reason: u16, now: Instant) {
        if self.closed_notified || self.state == ConnectionState::Closing {
            return;
        }
        self.close_reason = reason;
        self.state = ConnectionState::Closing;
        self.handshake_timer.disarm();
        self.tlp.disarm();
        for timer in self.skip_timers.values_mut() {
            timer.disarm();
        }
        for timer in self.flush_timers.values_mut() {
            timer.disarm();
        }
        self.queue_frame(MessageBody::Close { reason });
        self.close_timer.arm(now);
    }

    // ---- Inbound datagram dispatch --------------------------------------

    /// Feed one inbound datagram into the state machine.
    #[instrument(level = "trace", skip(self, bytes, now))]
    pub fn on_datagram(&mut self, bytes: &[u8], now: Instant) {
        Metrics::record_datagram_received(bytes.len());
        let frame = match wire::decode(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                trace!(error = %err, "dropping malformed frame");
                return;
            }
        };

        match &frame.body {
            MessageBody::Dial { .. } => self.handle_dial(&frame, now),
            MessageBody::DialConf { .. } => self.handle_dialconf(&frame, now),
            MessageBody::Conf => self.handle_conf(&frame, now),
            MessageBody::Rst => self.handle_rst(&frame, now),
            MessageBody::Data(data) => self.handle_data_ids_checked(&frame, data, now),
            MessageBody::Ack(ack) => self.handle_ack_ids_checked(&frame, ack, now),
            MessageBody::SkipStream { stream_id, offset } => {
                self.handle_skip_stream(&frame, *stream_id, *offset, now)
            }
            MessageBody::FlushStream { stream_id, offset } => {
                self.handle_flush_stream(&frame, *stream_id, *offset)
            }
            MessageBody::FlushConf { stream_id } => self.handle_flush_conf(&frame, *stream_id),
            MessageBody::Close { reason } => self.handle_close(&frame, *reason, now),
            MessageBody::CloseConf => self.handle_closeconf(&frame, now),
        }
    }

    fn ids_match(&self, frame: &Frame) -> bool {
        frame.src_conn_id == self.dst_conn_id && frame.dst_conn_id == self.src_conn_id
    }

    fn handle_dial(&mut self, frame: &Frame, now: Instant) {
        let MessageBody::Dial { sealed_box } = &frame.body else {
            return;
        };
        if frame.dst_conn_id != 0 {
            return;
        }

        match self.state {
            ConnectionState::Listen | ConnectionState::DialSent => {}
            ConnectionState::Established => {
                if frame.src_conn_id == self.dst_conn_id {
                    self.send_dialconf();
                }
                return;
            }
            _ => return,
        }

        let payload = match self.local_static.open(sealed_box) {
            Ok(payload) if payload.len() == 64 => payload,
            _ => {
                debug!("dropping DIAL with unreadable sealed box");
                return;
            }
        };
        let mut remote_static_pk = [0u8; 32];
        remote_static_pk.copy_from_slice(&payload[..32]);
        let mut remote_ephemeral_pk = [0u8; 32];
        remote_ephemeral_pk.copy_from_slice(&payload[32..]);

        self.dst_conn_id = frame.src_conn_id;
        self.src_conn_id = u32::from_be_bytes(crate::crypto::random_bytes::<4>());
        self.remote_static_pk = Some(remote_static_pk);

        let ephemeral = EphemeralKeypair::generate();
        let our_ephemeral_pub = ephemeral.public_bytes();
        match ephemeral.into_session(&remote_ephemeral_pk) {
            Ok(session) => self.crypto = Some(session),
            Err(err) => {
                warn!(error = %err, "handshake key derivation failed");
                return;
            }
        }
        self.local_ephemeral_pub = Some(our_ephemeral_pub);

        self.send_dialconf();
        self.handshake_timer.arm(now);
        self.state = ConnectionState::DialRcvd;
        debug!(src = self.src_conn_id, dst = self.dst_conn_id, "accepted dial, sent dialconf");
    }

    fn handle_dialconf(&mut self, frame: &Frame, now: Instant) {
        let MessageBody::DialConf { sealed_box } = &frame.body else {
            return;
        };
        if frame.dst_conn_id != self.src_conn_id {
            return;
        }

        match self.state {
            ConnectionState::DialSent => {
                let payload = match self.local_static.open(sealed_box) {
                    Ok(payload) if payload.len() == 32 => payload,
                    _ => {
                        debug!("dropping DIALCONF with unreadable sealed box");
                        return;
                    }
                };
                let mut remote_ephemeral_pk = [0u8; 32];
                remote_ephemeral_pk.copy_from_slice(&payload);

                if self.dst_conn_id != 0 && self.dst_conn_id != frame.src_conn_id {
                    self.send_rst(frame.dst_conn_id, frame.src_conn_id);
                    return;
                }
                self.dst_conn_id = frame.src_conn_id;

                let Some(ephemeral) = self.handshake_ephemeral.take() else {
                    return;
                };
                match ephemeral.into_session(&remote_ephemeral_pk) {
                    Ok(session) => self.crypto = Some(session),
                    Err(err) => {
                        warn!(error = %err, "handshake key derivation failed");
                        return;
                    }
                }

                self.send_conf();
                self.handshake_timer.disarm();
                self.enter_established(now);
            }
            ConnectionState::DialRcvd => {
                if frame.src_conn_id != self.dst_conn_id {
                    self.send_rst(frame.dst_conn_id, frame.src_conn_id);
                    return;
                }
                self.send_conf();
                self.handshake_timer.disarm();
                self.enter_established(now);
            }
            ConnectionState::Established => {
                if self.ids_match(frame) {
                    self.send_conf();
                }
            }
            _ => {}
        }
    }

    fn handle_conf(&mut self, frame: &Frame, now: Instant) {
        if !self.ids_match(frame) {
            return;
        }
        if self.state == ConnectionState::DialRcvd {
            self.handshake_timer.disarm();
            self.enter_established(now);
        }
    }

    fn handle_rst(&mut self, frame: &Frame, now: Instant) {
        if self.ids_match(frame) {
            self.reset_and_close(CLOSE_REASON_RESET, now);
        }
    }

    // ---- Data plane ------------------------------------------------------

    fn handle_data_ids_checked(&mut self, frame: &Frame, data: &DataFrame, now: Instant) {
        if !self.ids_match(frame) {
            self.send_rst(frame.dst_conn_id, frame.src_conn_id);
            return;
        }

        match self.state {
            ConnectionState::DialRcvd => {
                self.handshake_timer.disarm();
                self.enter_established(now);
            }
            ConnectionState::Established => {}
            _ => return,
        }

        self.ack_ranges.add(data.packet_number);
        if self.ack_deadline.is_none() {
            self.ack_deadline = Some(now + self.config.ack_delay);
        }

        let Some(crypto) = self.crypto.as_ref() else {
            return;
        };
        let aad = data_aad(frame.src_conn_id, frame.dst_conn_id, data);
        let plaintext = match crypto.open(&data.ciphertext, &data.tag, &data.nonce, &aad) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                warn!(error = %err, "DATA decrypt failed, resetting connection");
                self.send_rst(self.dst_conn_id, self.src_conn_id);
                self.reset_and_close(CLOSE_REASON_RESET, now);
                return;
            }
        };

        let stream = self.recv_streams.entry(data.stream_id).or_insert_with(|| {
            Metrics::record_stream_open();
            RecvStream::new(data.stream_id)
        });

        if stream.waiting_on_flush() {
            trace!(stream_id = data.stream_id, "dropping data for stream awaiting flush");
            return;
        }

        stream.receive(data.offset, Bytes::from(plaintext), data.fin);
        self.deliver_readable(data.stream_id);
    }

    fn deliver_readable(&mut self, stream_id: u16) {
        while let Some(stream) = self.recv_streams.get_mut(&stream_id) {
            let Some(chunk) = stream.read(usize::MAX) else {
                break;
            };
            let fully_read = stream.is_fully_read();
            if !chunk.is_empty() || fully_read {
                self.delegate.did_recv(stream_id, chunk);
            }
            if fully_read {
                self.recv_streams.remove(&stream_id);
                Metrics::record_stream_close();
                break;
            }
        }
    }

    fn handle_ack_ids_checked(&mut self, frame: &Frame, ack: &AckFrameBody, now: Instant) {
        if !self.ids_match(frame) {
            self.send_rst(frame.dst_conn_id, frame.src_conn_id);
            return;
        }
        match self.state {
            ConnectionState::DialRcvd => {
                self.handshake_timer.disarm();
                self.enter_established(now);
            }
            ConnectionState::Established => {}
            _ => return,
        }

        let was_window_limited = self.congestion.is_window_limited(self.total_bytes_in_flight());
        let mut newest_acked_sent_time: Option<Instant> = None;
        let mut completed_streams = Vec::new();

        for pn in expand_ack_ranges(ack) {
            let Some(meta) = self.sent_packets.remove(&pn) else {
                // A late ack can still recover a packet we'd already given
                // up on and moved to lost_packets.
                self.lost_packets.remove(&pn);
                continue;
            };
            if newest_acked_sent_time.is_none_or(|t| meta.sent_time > t) {
                newest_acked_sent_time = Some(meta.sent_time);
            }

            let sent_after_epoch = match self.congestion_epoch {
                Some(epoch) => meta.sent_time > epoch,
                None => true,
            };
            if sent_after_epoch {
                self.congestion.on_ack(meta.length, was_window_limited);
            }

            if let Some(stream) = self.send_streams.get_mut(&meta.stream_id) {
                let completed_items = stream.on_ack(meta.offset, meta.length);
                for bytes_acked in completed_items {
                    self.delegate.did_send(meta.stream_id, bytes_acked);
                }
                if stream.state() == SendState::Acked {
                    completed_streams.push(meta.stream_id);
                }
            }
        }

        for stream_id in completed_streams {
            self.send_streams.remove(&stream_id);
            self.send_queue.retain(|&id| id != stream_id);
            Metrics::record_stream_close();
        }

        if let Some(sent_time) = newest_acked_sent_time {
            self.rtt.sample(now.saturating_duration_since(sent_time));
            self.tlp.reset(now);
        }

        self.detect_losses(now);
        self.schedule_pace(now);
    }

    fn total_bytes_in_flight(&self) -> u64 {
        self.send_streams.values().map(SendStream::bytes_in_flight).sum()
    }

    fn register_congestion_event(&mut self, now: Instant) {
        let response = self.congestion.on_loss();
        self.congestion_epoch = Some(now);
        Metrics::record_congestion_event(response.fast_convergence);
    }

    fn forget_in_flight(&mut self, meta: &SentPacketMeta) {
        if let Some(stream) = self.send_streams.get_mut(&meta.stream_id) {
            stream.forget_outstanding(meta.offset);
        }
        self.lost_queue.push_back((meta.stream_id, meta.offset, meta.length));
    }

    fn detect_losses(&mut self, now: Instant) {
        let Some(reference) = self.sent_packets.values().next_back().map(|meta| meta.sent_time)
        else {
            return;
        };
        let threshold = self.config.loss_threshold;
        let lost_pns: Vec<u64> = self
            .sent_packets
            .iter()
            .filter(|(_, meta)| reference.saturating_duration_since(meta.sent_time) >= threshold)
            .map(|(&pn, _)| pn)
            .collect();
        if lost_pns.is_empty() {
            return;
        }
        for pn in &lost_pns {
            if let Some(meta) = self.sent_packets.remove(pn) {
                self.forget_in_flight(&meta);
                self.lost_packets.insert(*pn, meta);
            }
        }
        Metrics::record_packets_lost(lost_pns.len() as u64);
        self.register_congestion_event(now);
        self.schedule_pace(now);
    }

    fn on_tlp_timer(&mut self, now: Instant) {
        if self.state != ConnectionState::Established {
            self.tlp.disarm();
            return;
        }
        let has_work =
            !self.sent_packets.is_empty() || self.send_streams.values().any(SendStream::has_pending);
        if !has_work {
            self.tlp.reset(now);
            return;
        }

        let dead = self.tlp.on_expiry(now);
        Metrics::record_tlp_firing();
        if dead {
            self.reset_and_close(CLOSE_REASON_RESET, now);
            return;
        }

        if !self.sent_packets.is_empty() {
            let pns: Vec<u64> = self.sent_packets.keys().copied().collect();
            for pn in pns {
                if let Some(meta) = self.sent_packets.remove(&pn) {
                    self.forget_in_flight(&meta);
                    self.lost_packets.insert(pn, meta);
                }
            }
            Metrics::record_packets_lost(self.lost_queue.len() as u64);
            self.register_congestion_event(now);
        }
        self.schedule_pace(now);
    }

    // ---- Stream skip/flush protocol ---------------------------------------

    /// Ask the peer to stop sending bytes before the stream's current
    /// buffered-or-read horizon, e.g. because a higher application layer
    /// has already seen this data through another path.
    pub fn skip_stream(&mut self, stream_id: u16, now: Instant) {
        let Some(stream) = self.recv_streams.get_mut(&stream_id) else {
            return;
        };
        if stream.waiting_on_flush() {
            return;
        }
        let offset = stream.read_offset().max(stream.buffered_end());
        stream.mark_waiting_on_flush();
        self.queue_frame(MessageBody::SkipStream { stream_id, offset });
        self.skip_timers
            .entry(stream_id)
            .or_insert_with(|| BackoffTimer::new(Duration::from_secs(1), self.config.handshake_cap))
            .arm(now);
    }

    fn handle_skip_stream(&mut self, frame: &Frame, stream_id: u16, offset: u64, now: Instant) {
        if !self.ids_match(frame) {
            return;
        }
        let Some(stream) = self.send_streams.get(&stream_id) else {
            self.queue_frame(MessageBody::FlushStream { stream_id, offset });
            return;
        };
        if offset < stream.acked_offset() {
            let acked_offset = stream.acked_offset();
            self.queue_frame(MessageBody::FlushStream {
                stream_id,
                offset: acked_offset,
            });
            return;
        }
        self.delegate.did_recv_skip_stream(stream_id);
        self.flush_stream(stream_id, now);
    }

    /// Drop queued/outstanding data for `stream_id` and announce the new
    /// floor to the peer, retrying until FLUSHCONF arrives.
    pub fn flush_stream(&mut self, stream_id: u16, now: Instant) {
        let Some(stream) = self.send_streams.get_mut(&stream_id) else {
            return;
        };
        let new_offset = stream.sent_offset();
        stream.reset_to(new_offset);
        self.send_queue.retain(|&id| id != stream_id);

        let lost_pns: Vec<u64> = self
            .sent_packets
            .iter()
            .filter(|(_, meta)| meta.stream_id == stream_id)
            .map(|(&pn, _)| pn)
            .collect();
        for pn in lost_pns {
            self.sent_packets.remove(&pn);
        }
        self.lost_packets.retain(|_, meta| meta.stream_id != stream_id);
        self.lost_queue.retain(|&(id, _, _)| id != stream_id);

        self.queue_frame(MessageBody::FlushStream {
            stream_id,
            offset: new_offset,
        });
        self.flush_timers
            .entry(stream_id)
            .or_insert_with(|| BackoffTimer::new(Duration::from_secs(1), self.config.handshake_cap))
            .arm(now);
    }

    fn handle_flush_stream(&mut self, frame: &Frame, stream_id: u16, offset: u64) {
        if !self.ids_match(frame) {
            return;
        }
        let stream = self
            .recv_streams
            .entry(stream_id)
            .or_insert_with(|| RecvStream::new(stream_id));
        if offset <= stream.read_offset() {
            return;
        }
        let old_offset = stream.read_offset();
        stream.flush_to(offset);
        stream.clear_wait_flush();
        self.delegate.did_recv_flush_stream(stream_id, old_offset, offset);
        self.deliver_readable(stream_id);
        self.queue_frame(MessageBody::FlushConf { stream_id });
    }

    fn handle_flush_conf(&mut self, frame: &Frame, stream_id: u16) {
        if !self.ids_match(frame) {
            return;
        }
        self.flush_timers.remove(&stream_id);
        self.delegate.did_recv_flush_conf(stream_id);
    }

    fn on_skip_timer(&mut self, stream_id: u16, now: Instant) {
        let Some(timer) = self.skip_timers.get_mut(&stream_id) else {
            return;
        };
        if timer.on_expiry(now) {
            self.reset_and_close(CLOSE_REASON_RESET, now);
            return;
        }
        Metrics::record_handshake_retransmit();
        let Some(stream) = self.recv_streams.get(&stream_id) else {
            self.skip_timers.remove(&stream_id);
            return;
        };
        let offset = stream.read_offset().max(stream.buffered_end());
        self.queue_frame(MessageBody::SkipStream { stream_id, offset });
    }

    fn on_flush_timer(&mut self, stream_id: u16, now: Instant) {
        let Some(timer) = self.flush_timers.get_mut(&stream_id) else {
            return;
        };
        if timer.on_expiry(now) {
            self.reset_and_close(CLOSE_REASON_RESET, now);
            return;
        }
        Metrics::record_handshake_retransmit();
        let Some(stream) = self.send_streams.get(&stream_id) else {
            self.flush_timers.remove(&stream_id);
            return;
        };
        let offset = stream.sent_offset();
        self.queue_frame(MessageBody::FlushStream { stream_id, offset });
    }

    // ---- Close -------------------------------------------------------

    fn handle_close(&mut self, frame: &Frame, reason: u16, now: Instant) {
        if !self.ids_match(frame) {
            return;
        }
        match self.state {
            ConnectionState::Established | ConnectionState::DialRcvd | ConnectionState::Closing => {
                self.queue_frame(MessageBody::CloseConf);
                self.reset_and_close(reason, now);
            }
            _ => {}
        }
    }

    fn handle_closeconf(&mut self, frame: &Frame, now: Instant) {
        if !self.ids_match(frame) {
            return;
        }
        if self.state == ConnectionState::Closing {
            let reason = self.close_reason;
            self.reset_and_close(reason, now);
        }
    }

    fn on_close_timer(&mut self, now: Instant) {
        let exhausted = self.close_timer.on_expiry(now);
        if exhausted {
            let reason = self.close_reason;
            self.reset_and_close(reason, now);
            return;
        }
        Metrics::record_handshake_retransmit();
        self.queue_frame(MessageBody::Close {
            reason: self.close_reason,
        });
    }

    fn on_handshake_timer(&mut self, now: Instant) {
        let exhausted = self.handshake_timer.on_expiry(now);
        if exhausted {
            self.reset_and_close(CLOSE_REASON_RESET, now);
            return;
        }
        Metrics::record_handshake_retransmit();
        match self.state {
            ConnectionState::DialSent => self.send_dial(),
            ConnectionState::DialRcvd => self.send_dialconf(),
            _ => {}
        }
    }

    // ---- Application send path --------------------------------------------

    /// Queue `data` for transmission on `stream_id`. `fin` marks the last
    /// byte the application will ever enqueue on this stream.
    pub fn send(&mut self, stream_id: u16, data: Bytes, fin: bool, now: Instant) -> Result<(), SendError> {
        if self.state != ConnectionState::Established {
            return Err(SendError::NotEstablished);
        }
        let max_queue_bytes = self.config.max_send_queue_bytes;
        let stream = self.send_streams.entry(stream_id).or_insert_with(|| {
            Metrics::record_stream_open();
            SendStream::new(stream_id, max_queue_bytes)
        });
        stream.queue(data).map_err(|err| match err {
            StreamError::Backpressure { stream_id, limit } => SendError::Backpressure { stream_id, limit },
            StreamError::UnknownStream { .. } => SendError::NotEstablished,
        })?;
        if fin {
            stream.finish();
        }
        if !self.send_queue.contains(&stream_id) {
            self.send_queue.push_back(stream_id);
        }
        self.schedule_pace(now);
        Ok(())
    }

    // ---- Pacing -------------------------------------------------------

    fn schedule_pace(&mut self, now: Instant) {
        if self.pacing_deadline.is_none() {
            self.pacing_deadline = Some(now);
        }
    }

    fn emit_data_frame(&mut self, stream_id: u16, packet_number: u64, fragment: Fragment, now: Instant) {
        let Some(crypto) = self.crypto.as_mut() else {
            return;
        };
        let mut data_frame = DataFrame {
            stream_id,
            packet_number,
            offset: fragment.offset,
            fin: fragment.fin,
            ciphertext: Bytes::new(),
            tag: [0u8; 16],
            nonce: [0u8; 12],
        };
        let aad = data_aad(self.src_conn_id, self.dst_conn_id, &data_frame);
        let (ciphertext, tag, nonce) = match crypto.seal(&fragment.data, &aad) {
            Ok(sealed) => sealed,
            Err(err) => {
                warn!(error = %err, "failed to seal outbound data fragment");
                return;
            }
        };
        data_frame.ciphertext = Bytes::from(ciphertext);
        data_frame.tag = tag;
        data_frame.nonce = nonce;

        self.sent_packets.insert(
            packet_number,
            SentPacketMeta {
                stream_id,
                offset: fragment.offset,
                length: fragment.data.len() as u64,
                sent_time: now,
            },
        );
        trace!(stream_id, packet_number, "sending data fragment");
        self.queue_frame(MessageBody::Data(data_frame));
    }

    /// Drive the pacer: retransmit lost fragments first, then packetize new
    /// data, until the per-invocation byte budget or the congestion window
    /// is exhausted.
    fn pace(&mut self, now: Instant) {
        if self.state != ConnectionState::Established {
            return;
        }

        let mut sent_bytes = 0usize;
        loop {
            if sent_bytes >= self.config.pacing_limit_bytes {
                self.pacing_deadline = Some(now + Duration::from_millis(1));
                return;
            }
            if self.total_bytes_in_flight() >= self.congestion.cwnd() {
                self.pacing_deadline = None;
                return;
            }

            if let Some((stream_id, offset, length)) = self.lost_queue.pop_front() {
                let Some(stream) = self.send_streams.get_mut(&stream_id) else {
                    continue;
                };
                let pn = self.next_packet_number;
                let Some(fragment) = stream.retransmit(offset, length, pn, now) else {
                    continue;
                };
                self.next_packet_number += 1;
                let frag_len = fragment.data.len();
                self.emit_data_frame(stream_id, pn, fragment, now);
                sent_bytes += frag_len;
                continue;
            }

            let Some(stream_id) = self.send_queue.pop_front() else {
                self.pacing_deadline = None;
                return;
            };
            let Some(stream) = self.send_streams.get_mut(&stream_id) else {
                continue;
            };
            if !stream.has_pending() {
                continue;
            }
            let pn = self.next_packet_number;
            let Some(fragment) = stream.next_fragment(self.config.fragment_size, pn, now) else {
                continue;
            };
            self.next_packet_number += 1;
            if stream.has_pending() {
                self.send_queue.push_back(stream_id);
            }
            let frag_len = fragment.data.len();
            self.emit_data_frame(stream_id, pn, fragment, now);
            sent_bytes += frag_len;
        }
    }

    // ---- Timer driver -----------------------------------------------------

    fn flush_ack(&mut self) {
        self.ack_deadline = None;
        let body = self.ack_ranges.to_frame_body();
        self.queue_frame(MessageBody::Ack(body));
        Metrics::record_ack_sent();
    }

    /// Check every timer against `now` and run whichever have expired. The
    /// application should call this regularly (e.g. on its own tick, or
    /// after any `send`/`on_datagram` call) since this crate does not run
    /// an internal event loop.
    pub fn poll_timers(&mut self, now: Instant) {
        if self.handshake_timer.is_expired(now) {
            self.on_handshake_timer(now);
        }
        if self.close_timer.is_expired(now) {
            self.on_close_timer(now);
        }
        if let Some(deadline) = self.ack_deadline {
            if now >= deadline {
                self.flush_ack();
            }
        }
        if self.state == ConnectionState::Established && self.tlp.is_expired(now) {
            self.on_tlp_timer(now);
        }

        let expired_skip: Vec<u16> = self
            .skip_timers
            .iter()
            .filter(|(_, timer)| timer.is_expired(now))
            .map(|(&stream_id, _)| stream_id)
            .collect();
        for stream_id in expired_skip {
            self.on_skip_timer(stream_id, now);
        }

        let expired_flush: Vec<u16> = self
            .flush_timers
            .iter()
            .filter(|(_, timer)| timer.is_expired(now))
            .map(|(&stream_id, _)| stream_id)
            .collect();
        for stream_id in expired_flush {
            self.on_flush_timer(stream_id, now);
        }

        if let Some(deadline) = self.pacing_deadline {
            if now >= deadline {
                self.pacing_deadline = None;
                self.pace(now);
            }
        }
    }
}

/// The 20-byte AEAD associated data for a DATA frame: the constant version
/// byte, the type byte (which carries the FIN flag), both connection ids,
/// the stream id, and the packet number. The stream offset is deliberately
/// excluded; binding the packet number is enough to rule out cut-and-paste
/// of a ciphertext into a different packet.
fn data_aad(src_conn_id: u32, dst_conn_id: u32, data: &DataFrame) -> [u8; 20] {
    let mut aad = [0u8; 20];
    aad[0] = 0;
    aad[1] = if data.fin { wire::TYPE_DATA_FIN } else { wire::TYPE_DATA };
    aad[2..6].copy_from_slice(&src_conn_id.to_be_bytes());
    aad[6..10].copy_from_slice(&dst_conn_id.to_be_bytes());
    aad[10..12].copy_from_slice(&data.stream_id.to_be_bytes());
    aad[12..20].copy_from_slice(&data.packet_number.to_be_bytes());
    aad
}
