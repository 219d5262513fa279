use std::collections::HashMap;
use std::sync::{Arc, Weak};

use libp2p_identity::PeerId;
use log::{debug, error};
use multiaddr::{Multiaddr, Protocol};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::address::{is_signal_address, P_WEBRTC_STAR};
use crate::address_book::AddressBook;
use crate::connection::Connection;
use crate::error::Error;
use crate::mux::Multiplexer;
use crate::peer_connection::{Options, WebRtcEngine};
use crate::relay::{RelayConnector, WebSocketConnector};
use crate::rtc::RtcEngine;
use crate::signal::{Signal, SignalConfig, SignalContext};

/// WebRTC-star transport: keeps one relay session per signaling address and dials or accepts
/// peer connections through it.
///
/// Cloning is cheap, clones share the same signals.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    local_peer: PeerId,
    ctx: SignalContext,
    signals: Mutex<HashMap<Multiaddr, Arc<Signal>>>,
}

/// Handle to a [Transport] which does not keep it alive.
#[derive(Clone, Default)]
pub(crate) struct WeakTransport(Weak<TransportInner>);

impl WeakTransport {
    pub fn upgrade(&self) -> Option<Transport> {
        self.0.upgrade().map(|inner| Transport { inner })
    }
}

impl Transport {
    pub fn builder(
        local_peer: PeerId,
        address_book: Arc<dyn AddressBook>,
        multiplexer: Arc<dyn Multiplexer>,
    ) -> TransportBuilder {
        TransportBuilder {
            local_peer,
            address_book,
            multiplexer,
            signal_config: SignalConfig::default(),
            rtc_options: Options::default(),
            engine: None,
            connector: None,
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.local_peer
    }

    /// Dials `peer` through the relay behind `addr`. The address may carry the peer identity
    /// suffix (`.../p2p/<peer>`) it was announced with.
    pub async fn dial(&self, addr: &Multiaddr, peer: PeerId) -> Result<Connection, Error> {
        self.dial_with_cancel(addr, peer, CancellationToken::new())
            .await
    }

    pub async fn dial_with_cancel(
        &self,
        addr: &Multiaddr,
        peer: PeerId,
        cancel: CancellationToken,
    ) -> Result<Connection, Error> {
        debug!("Dial peer (ID: {}, address: {})", peer, addr);
        let addr = signal_address(addr, peer)?;
        let signal = self.signal(&addr)?;
        signal.dial_with_cancel(peer, cancel).await
    }

    /// Joins the relay behind `addr` and returns a listener for connections from other peers.
    /// Must be called within a tokio runtime.
    pub fn listen(&self, addr: &Multiaddr) -> Result<Listener, Error> {
        debug!("Listen on address: {}", addr);
        let signal = self.signal(addr)?;
        Ok(Listener {
            addr: addr.clone(),
            signal,
            transport: self.clone(),
        })
    }

    /// Checks if `addr` has the shape of a webrtc-star signaling address.
    pub fn can_dial(&self, addr: &Multiaddr) -> bool {
        is_signal_address(addr)
    }

    pub fn protocols(&self) -> Vec<u32> {
        vec![P_WEBRTC_STAR]
    }

    pub fn proxy(&self) -> bool {
        false
    }

    /// Addresses with a running relay session.
    pub fn signal_addresses(&self) -> Vec<Multiaddr> {
        self.inner.signals.lock().keys().cloned().collect()
    }

    fn signal(&self, addr: &Multiaddr) -> Result<Arc<Signal>, Error> {
        let mut signals = self.inner.signals.lock();
        if let Some(signal) = signals.get(addr) {
            return Ok(signal.clone());
        }
        let mut ctx = self.inner.ctx.clone();
        ctx.transport = WeakTransport(Arc::downgrade(&self.inner));
        let signal = Arc::new(Signal::start(addr, ctx)?);
        signals.insert(addr.clone(), signal.clone());
        Ok(signal)
    }

    async fn unregister(&self, addr: &Multiaddr) -> Result<(), Error> {
        let signal = self.inner.signals.lock().remove(addr);
        match signal {
            Some(signal) => {
                if let Err(e) = signal.close().await {
                    error!("Error while closing signal: {}", e);
                }
                Ok(())
            }
            None => Err(Error::NoSignal(addr.clone())),
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("local_peer", &self.inner.local_peer)
            .field("signals", &self.signal_addresses())
            .finish()
    }
}

/// Strips the identity suffix of a dialed address, checking it names the dialed peer.
fn signal_address(addr: &Multiaddr, peer: PeerId) -> Result<Multiaddr, Error> {
    let mut signal_addr = addr.clone();
    match signal_addr.pop() {
        Some(Protocol::P2p(id)) if id == peer => Ok(signal_addr),
        Some(Protocol::P2p(_)) => Err(Error::invalid_address(addr, "peer identity mismatch")),
        _ => Ok(addr.clone()),
    }
}

pub struct TransportBuilder {
    local_peer: PeerId,
    address_book: Arc<dyn AddressBook>,
    multiplexer: Arc<dyn Multiplexer>,
    signal_config: SignalConfig,
    rtc_options: Options,
    engine: Option<Arc<dyn RtcEngine>>,
    connector: Option<Arc<dyn RelayConnector>>,
}

impl TransportBuilder {
    pub fn signal_config(mut self, config: SignalConfig) -> Self {
        self.signal_config = config;
        self
    }

    /// Options of the default webrtc-rs engine. Ignored when [TransportBuilder::engine] is set.
    pub fn rtc_options(mut self, options: Options) -> Self {
        self.rtc_options = options;
        self
    }

    pub fn engine(mut self, engine: Arc<dyn RtcEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn RelayConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn build(self) -> Result<Transport, Error> {
        let engine: Arc<dyn RtcEngine> = match self.engine {
            Some(engine) => engine,
            None => Arc::new(WebRtcEngine::new(self.rtc_options)?),
        };
        let connector: Arc<dyn RelayConnector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(WebSocketConnector::new(self.signal_config.max_message_size)),
        };
        let ctx = SignalContext {
            local_peer: self.local_peer,
            address_book: self.address_book,
            engine,
            multiplexer: self.multiplexer,
            connector,
            config: self.signal_config,
            transport: WeakTransport::default(),
        };
        Ok(Transport {
            inner: Arc::new(TransportInner {
                local_peer: self.local_peer,
                ctx,
                signals: Mutex::new(HashMap::new()),
            }),
        })
    }
}

/// Accepts connections from peers dialing this one through a relay.
pub struct Listener {
    addr: Multiaddr,
    signal: Arc<Signal>,
    transport: Transport,
}

impl Listener {
    pub async fn accept(&self) -> Result<Connection, Error> {
        debug!("Accept connection on {}", self.addr);
        self.signal.accept().await
    }

    /// Leaves the relay. Dials through the same address made by this transport are affected
    /// too, as they share the relay session.
    pub async fn close(&self) -> Result<(), Error> {
        debug!("Close listener: {}", self.addr);
        self.transport.unregister(&self.addr).await
    }

    pub fn multiaddr(&self) -> &Multiaddr {
        &self.addr
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").field("addr", &self.addr).finish()
    }
}
