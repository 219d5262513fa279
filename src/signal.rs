use std::sync::Arc;
use std::time::Duration;

use libp2p_identity::PeerId;
use log::{debug, warn};
use multiaddr::Multiaddr;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::address::{peer_address, relay_url, split_peer_address};
use crate::address_book::{AddressBook, SelfIgnoringAddressBook};
use crate::client::SessionClient;
use crate::connection::{Connection, ConnectionConfig};
use crate::error::Error;
use crate::handshake::HandshakeCoordinator;
use crate::message::{HandshakeMessage, SdpKind};
use crate::mux::Multiplexer;
use crate::relay::RelayConnector;
use crate::rtc::RtcEngine;
use crate::transport::WeakTransport;

/// Settings of the relay session and the handshakes made over it.
#[derive(Debug, Clone)]
pub struct SignalConfig {
    /// Path and query appended to the relay's `ws://host:port`.
    pub url_path: String,
    /// How long a dial waits for the answer to its offer.
    pub handshake_timeout: Duration,
    /// Pause between failed relay connection attempts.
    pub reconnect_delay: Duration,
    /// How long the relay may take to send its session-open frames.
    pub session_open_timeout: Duration,
    /// Lifetime of addresses learned from peer discovery notices.
    pub peer_ttl: Duration,
    /// Largest relay frame accepted.
    pub max_message_size: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        SignalConfig {
            url_path: "/socket.io/?EIO=3&transport=websocket".to_owned(),
            handshake_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(3),
            session_open_timeout: Duration::from_secs(10),
            peer_ttl: Duration::from_secs(60),
            max_message_size: 64 * 1024,
        }
    }
}

/// Collaborators shared by every signal of a transport.
#[derive(Clone)]
pub(crate) struct SignalContext {
    pub local_peer: PeerId,
    pub address_book: Arc<dyn AddressBook>,
    pub engine: Arc<dyn RtcEngine>,
    pub multiplexer: Arc<dyn Multiplexer>,
    pub connector: Arc<dyn RelayConnector>,
    pub config: SignalConfig,
    pub transport: WeakTransport,
}

/// Relay session for a single signaling address, together with the handshakes made over it.
pub(crate) struct Signal {
    addr: Multiaddr,
    self_addr: Multiaddr,
    ctx: SignalContext,
    handshakes: Arc<HandshakeCoordinator>,
    outgoing: mpsc::UnboundedSender<HandshakeMessage>,
    stop: CancellationToken,
    client: Mutex<Option<JoinHandle<()>>>,
}

impl Signal {
    /// Starts a relay session for `addr`. Must be called within a tokio runtime.
    pub fn start(addr: &Multiaddr, ctx: SignalContext) -> Result<Self, Error> {
        let url = relay_url(addr, &ctx.config.url_path)?;
        let self_addr = peer_address(addr, ctx.local_peer);
        let handshakes = HandshakeCoordinator::new();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();

        let client = SessionClient {
            url,
            self_addr: self_addr.clone(),
            connector: ctx.connector.clone(),
            address_book: Arc::new(SelfIgnoringAddressBook::new(
                ctx.address_book.clone(),
                ctx.local_peer,
            )),
            handshakes: handshakes.clone(),
            outgoing: outgoing_rx,
            reconnect_delay: ctx.config.reconnect_delay,
            session_open_timeout: ctx.config.session_open_timeout,
            peer_ttl: ctx.config.peer_ttl,
            stop: stop.clone(),
        }
        .spawn();

        Ok(Signal {
            addr: addr.clone(),
            self_addr,
            ctx,
            handshakes,
            outgoing,
            stop,
            client: Mutex::new(Some(client)),
        })
    }

    pub fn addr(&self) -> &Multiaddr {
        &self.addr
    }

    pub(crate) fn handshakes(&self) -> &Arc<HandshakeCoordinator> {
        &self.handshakes
    }

    pub async fn dial(&self, peer: PeerId) -> Result<Connection, Error> {
        self.dial_with_cancel(peer, CancellationToken::new()).await
    }

    /// Dials `peer`, giving up with [Error::HandshakeCancelled] once `cancel` fires.
    pub async fn dial_with_cancel(
        &self,
        peer: PeerId,
        cancel: CancellationToken,
    ) -> Result<Connection, Error> {
        if self.stop.is_cancelled() {
            return Err(Error::SignalClosed);
        }
        let remote_addr = peer_address(&self.addr, peer);
        let (link, offer) = self.ctx.engine.offer().await?;
        let offer = HandshakeMessage {
            intent_id: crate::random_id("intent"),
            src_multiaddr: self.self_addr.to_string(),
            dst_multiaddr: remote_addr.to_string(),
            signal: offer,
            answer: false,
        };

        let res = match self.do_handshake(offer, &cancel).await {
            Ok(answer) => link.apply_answer(answer.signal).await,
            Err(e) => Err(e),
        };
        if let Err(e) = res {
            if let Err(close_err) = link.close().await {
                warn!("Can't close peer connection: {}", close_err);
            }
            return Err(e);
        }

        let config = ConnectionConfig {
            local_peer: self.ctx.local_peer,
            local_addr: self.self_addr.clone(),
            remote_peer: peer,
            remote_addr,
            is_server: false,
        };
        Ok(Connection::with_transport(
            config,
            link,
            self.ctx.multiplexer.clone(),
            None,
            self.ctx.transport.clone(),
        ))
    }

    async fn do_handshake(
        &self,
        offer: HandshakeMessage,
        cancel: &CancellationToken,
    ) -> Result<HandshakeMessage, Error> {
        let intent_id = offer.intent_id.clone();
        let subscription = self.handshakes.subscribe(&intent_id);
        debug!("Send handshake offer: {}", offer);
        self.outgoing.send(offer).map_err(|_| Error::SignalClosed)?;

        tokio::select! {
            res = subscription => {
                let answer = res?;
                debug!("Handshake answer received (intentID: {})", intent_id);
                Ok(answer)
            }
            _ = cancel.cancelled() => {
                self.handshakes.cancel(&intent_id);
                Err(Error::HandshakeCancelled(intent_id))
            }
            _ = tokio::time::sleep(self.ctx.config.handshake_timeout) => {
                self.handshakes.cancel(&intent_id);
                Err(Error::HandshakeTimeout(intent_id))
            }
        }
    }

    /// Waits for the next offer from a remote peer and answers it.
    ///
    /// Fails with [Error::ConnectionClosed] once the signal is closed.
    pub async fn accept(&self) -> Result<Connection, Error> {
        loop {
            let offer = match self.handshakes.next_unsubscribed().await {
                Some(offer) => offer,
                None => return Err(Error::ConnectionClosed),
            };
            debug!("Accept handshake offer: {}", offer);
            if offer.signal.kind != SdpKind::Offer {
                warn!("Ignore unsolicited {:?} (intentID: {})", offer.signal.kind, offer.intent_id);
                continue;
            }
            let (remote_peer, remote_addr) = match split_peer_address(&offer.src_multiaddr) {
                Ok((peer, signal_addr)) => (peer, peer_address(&signal_addr, peer)),
                Err(e) => {
                    warn!("Ignore handshake offer (intentID: {}): {}", offer.intent_id, e);
                    continue;
                }
            };

            let (link, answer) = self.ctx.engine.answer(&offer.signal).await?;
            let answer = HandshakeMessage {
                intent_id: offer.intent_id,
                src_multiaddr: self.self_addr.to_string(),
                dst_multiaddr: offer.src_multiaddr,
                signal: answer,
                answer: true,
            };
            debug!("Send handshake answer: {}", answer);
            if self.outgoing.send(answer).is_err() {
                if let Err(e) = link.close().await {
                    warn!("Can't close peer connection: {}", e);
                }
                return Err(Error::ConnectionClosed);
            }

            let config = ConnectionConfig {
                local_peer: self.ctx.local_peer,
                local_addr: self.self_addr.clone(),
                remote_peer,
                remote_addr,
                is_server: true,
            };
            return Ok(Connection::with_transport(
                config,
                link,
                self.ctx.multiplexer.clone(),
                None,
                self.ctx.transport.clone(),
            ));
        }
    }

    /// Stops the relay session and waits for its client to finish. Pending dials and accepts
    /// fail.
    pub async fn close(&self) -> Result<(), Error> {
        debug!("Close signal: {}", self.addr);
        self.stop.cancel();
        self.handshakes.close();
        let client = self.client.lock().take();
        if let Some(client) = client {
            if let Err(e) = client.await {
                warn!("Signal client of {} failed: {}", self.addr, e);
            }
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.stop.is_cancelled()
    }
}

impl Drop for Signal {
    fn drop(&mut self) {
        self.stop.cancel();
        self.handshakes.close();
    }
}
