//! `TransportFactory`: the datagram endpoint and the peer-address to
//! [`StreamTransport`] map that demultiplexes inbound traffic onto it.
//!
//! A factory is the thing an application actually binds and drives; each
//! [`StreamTransport`] it creates shares the factory's static identity and
//! [`TransportConfig`], and is addressed by the peer's [`SocketAddr`].

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, instrument, trace};

use crate::buffer::BufferPool;
use crate::config::TransportConfig;
use crate::crypto::StaticKeypair;
use crate::socket::{Socket, SocketError};
use crate::transport::{StreamTransport, TransportDelegate};

/// Default MTU-sized scratch buffer used for `recv_from`.
const RECV_BUFFER_SIZE: usize = 65_536;

/// Gates whether a never-seen peer address is allowed to open a connection,
/// and mints the per-connection delegate for it.
pub trait ListenDelegate<D: TransportDelegate> {
    /// Whether a first DIAL from `addr` should be accepted.
    fn should_accept(&mut self, addr: SocketAddr) -> bool {
        let _ = addr;
        true
    }

    /// Build the delegate for a transport just created for `addr`, either
    /// because it dialled us or because we dialled it.
    fn make_delegate(&mut self, addr: SocketAddr) -> D;

    /// Called once a transport has been created and inserted into the map,
    /// before any datagram has been routed to it.
    fn did_create_transport(&mut self, addr: SocketAddr) {
        let _ = addr;
    }
}

/// Owns a datagram endpoint and every [`StreamTransport`] keyed by peer
/// address. The application drives it by calling [`TransportFactory::poll_datagram`]
/// (non-blocking; returns as soon as the socket has nothing ready) and
/// [`TransportFactory::poll_timers`] on a regular tick.
pub struct TransportFactory<S: Socket, D: TransportDelegate, L: ListenDelegate<D>> {
    socket: S,
    config: TransportConfig,
    local_static: StaticKeypair,
    transports: HashMap<SocketAddr, StreamTransport<D>>,
    listen_delegate: L,
    buffers: BufferPool,
}

impl<S: Socket, D: TransportDelegate, L: ListenDelegate<D>> TransportFactory<S, D, L> {
    /// Wrap an already-bound socket with a listen delegate and configuration.
    #[must_use]
    pub fn new(socket: S, local_static: StaticKeypair, config: TransportConfig, listen_delegate: L) -> Self {
        Self {
            socket,
            config,
            local_static,
            transports: HashMap::new(),
            listen_delegate,
            buffers: BufferPool::new(RECV_BUFFER_SIZE, 16),
        }
    }

    /// The local address the datagram endpoint is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        self.socket.local_addr()
    }

    /// An established-or-handshaking transport for `addr`, if one exists.
    pub fn get_transport(&mut self, addr: SocketAddr) -> Option<&mut StreamTransport<D>> {
        self.transports.get_mut(&addr)
    }

    /// Every transport currently tracked, keyed by peer address.
    pub fn transports_mut(&mut self) -> impl Iterator<Item = (&SocketAddr, &mut StreamTransport<D>)> {
        self.transports.iter_mut()
    }

    /// Initiate an outbound connection to `addr`, whose static identity key
    /// is `remote_static_pk`. Returns the newly created transport.
    #[instrument(level = "debug", skip(self, remote_static_pk))]
    pub fn dial(
        &mut self,
        addr: SocketAddr,
        remote_static_pk: [u8; 32],
        now: Instant,
    ) -> &mut StreamTransport<D> {
        let delegate = self.listen_delegate.make_delegate(addr);
        let mut transport = StreamTransport::new(self.config, self.local_static.clone(), delegate);
        transport.dial(remote_static_pk, now);
        self.listen_delegate.did_create_transport(addr);
        debug!(%addr, "dialing peer");
        self.transports.insert(addr, transport);
        self.drain_outbound(addr);
        self.transports.get_mut(&addr).expect("just inserted")
    }

    /// Drain every datagram currently queued on the socket (non-blocking —
    /// the caller is expected to have put the socket in non-blocking mode,
    /// or be driving it from a dedicated I/O thread) into the matching
    /// transport, accepting a new peer if the listen delegate allows it.
    pub fn poll_datagram(&mut self, now: Instant) -> Result<usize, SocketError> {
        let mut handled = 0usize;
        loop {
            let mut buffer = self.buffers.acquire();
            let (len, addr) = match self.socket.recv_from(buffer.as_mut_slice()) {
                Ok(pair) => pair,
                Err(SocketError::Io(err)) if would_block(&err) => break,
                Err(err) => return Err(err),
            };
            buffer.set_len(len);
            self.on_datagram(addr, buffer.as_slice(), now);
            handled += 1;
        }
        Ok(handled)
    }

    /// Feed one already-received datagram from `addr` into the matching
    /// transport, creating one if `addr` is unseen and accepted.
    #[instrument(level = "trace", skip(self, bytes, now))]
    pub fn on_datagram(&mut self, addr: SocketAddr, bytes: &[u8], now: Instant) {
        if !self.transports.contains_key(&addr) {
            if !self.listen_delegate.should_accept(addr) {
                trace!(%addr, "dropping datagram from unaccepted peer");
                return;
            }
            let delegate = self.listen_delegate.make_delegate(addr);
            let transport = StreamTransport::new(self.config, self.local_static.clone(), delegate);
            self.transports.insert(addr, transport);
            self.listen_delegate.did_create_transport(addr);
            debug!(%addr, "accepted new peer");
        }

        if let Some(transport) = self.transports.get_mut(&addr) {
            transport.on_datagram(bytes, now);
            self.drain_outbound(addr);
            self.reap_if_closed(addr);
        }
    }

    /// Drive every tracked transport's timers, flushing any datagrams each
    /// produces and dropping transports that have fully closed.
    pub fn poll_timers(&mut self, now: Instant) -> Result<(), SocketError> {
        let addrs: Vec<SocketAddr> = self.transports.keys().copied().collect();
        for addr in addrs {
            if let Some(transport) = self.transports.get_mut(&addr) {
                transport.poll_timers(now);
            }
            self.drain_outbound(addr);
            self.reap_if_closed(addr);
        }
        Ok(())
    }

    fn drain_outbound(&mut self, addr: SocketAddr) {
        let Some(transport) = self.transports.get_mut(&addr) else {
            return;
        };
        while let Some(datagram) = transport.poll_outbound() {
            if let Err(err) = self.socket.send_to(&datagram, addr) {
                trace!(%addr, error = %err, "failed to send datagram");
            }
        }
    }

    fn reap_if_closed(&mut self, addr: SocketAddr) {
        let closed = self.transports.get(&addr).is_some_and(StreamTransport::is_closed);
        if closed {
            self.transports.remove(&addr);
            debug!(%addr, "removed closed transport");
        }
    }
}

fn would_block(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportDelegate;
    use bytes::Bytes;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct NullDelegate;
    impl TransportDelegate for NullDelegate {
        fn did_recv(&mut self, _stream_id: u16, _data: Bytes) {}
    }

    struct AcceptAll {
        created: Arc<Mutex<Vec<SocketAddr>>>,
    }

    impl ListenDelegate<NullDelegate> for AcceptAll {
        fn should_accept(&mut self, _addr: SocketAddr) -> bool {
            true
        }
        fn make_delegate(&mut self, _addr: SocketAddr) -> NullDelegate {
            NullDelegate
        }
        fn did_create_transport(&mut self, addr: SocketAddr) {
            self.created.lock().unwrap().push(addr);
        }
    }

    #[derive(Debug, Default)]
    struct LoopbackSocket {
        sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    }

    impl Socket for LoopbackSocket {
        fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize, SocketError> {
            self.sent.lock().unwrap().push((addr, buf.to_vec()));
            Ok(buf.len())
        }
        fn recv_from(&self, _buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError> {
            Err(SocketError::Io(io::Error::new(io::ErrorKind::WouldBlock, "empty")))
        }
        fn local_addr(&self) -> Result<SocketAddr, SocketError> {
            Ok("127.0.0.1:0".parse().unwrap())
        }
    }

    #[test]
    fn dial_creates_tracked_transport_and_queues_a_dial_datagram() {
        let created = Arc::new(Mutex::new(Vec::new()));
        let local_static = StaticKeypair::generate();
        let remote_static = StaticKeypair::generate();
        let remote_pub = remote_static.public_bytes();

        let mut factory = TransportFactory::new(
            LoopbackSocket::default(),
            local_static,
            TransportConfig::default(),
            AcceptAll {
                created: Arc::clone(&created),
            },
        );

        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let now = Instant::now();
        factory.dial(addr, remote_pub, now);

        assert!(factory.get_transport(addr).is_some());
        assert_eq!(created.lock().unwrap().as_slice(), &[addr]);
        assert!(!factory.socket.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn unaccepted_peer_never_gets_a_transport() {
        struct RejectAll;
        impl ListenDelegate<NullDelegate> for RejectAll {
            fn should_accept(&mut self, _addr: SocketAddr) -> bool {
                false
            }
            fn make_delegate(&mut self, _addr: SocketAddr) -> NullDelegate {
                NullDelegate
            }
        }

        let local_static = StaticKeypair::generate();
        let mut factory = TransportFactory::new(
            LoopbackSocket::default(),
            local_static,
            TransportConfig::default(),
            RejectAll,
        );

        let addr: SocketAddr = "127.0.0.1:4001".parse().unwrap();
        factory.on_datagram(addr, &[0u8; 20], Instant::now());
        assert!(factory.get_transport(addr).is_none());
    }
}
