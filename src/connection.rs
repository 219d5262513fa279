use std::fmt::Formatter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use libp2p_identity::{Keypair, PeerId, PublicKey};
use log::{debug, warn};
use multiaddr::Multiaddr;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::mux::{Multiplexer, MuxedConn, MuxedStream};
use crate::rtc::{PeerLink, RawChannel};
use crate::stream::DataStream;
use crate::transport::{Transport, WeakTransport};

/// Static description of a [Connection].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub local_peer: PeerId,
    pub local_addr: Multiaddr,
    pub remote_peer: PeerId,
    pub remote_addr: Multiaddr,
    /// `true` on the side which accepted the offer.
    pub is_server: bool,
}

/// Negotiated peer connection exposed as a multiplexed connection.
///
/// The multiplexed connection is built on first use, by whichever of [Connection::open_stream]
/// and [Connection::accept_stream] comes first. The dialing side opens a data channel for it,
/// the accepting side waits for that channel to arrive. Concurrent callers wait for the single
/// build in progress and share its result.
pub struct Connection {
    id: String,
    config: ConnectionConfig,
    link: Arc<dyn PeerLink>,
    initial: Mutex<Option<Arc<dyn RawChannel>>>,
    multiplexer: Arc<dyn Multiplexer>,
    muxed: OnceCell<Arc<dyn MuxedConn>>,
    transport: WeakTransport,
    closing: AtomicBool,
    closed: CancellationToken,
}

impl Connection {
    pub fn new(
        config: ConnectionConfig,
        link: Arc<dyn PeerLink>,
        multiplexer: Arc<dyn Multiplexer>,
    ) -> Self {
        Self::with_transport(config, link, multiplexer, None, WeakTransport::default())
    }

    /// Creates a connection whose multiplexed connection will be built over an already open
    /// `channel` instead of a newly negotiated one.
    pub fn with_channel(
        config: ConnectionConfig,
        link: Arc<dyn PeerLink>,
        multiplexer: Arc<dyn Multiplexer>,
        channel: Arc<dyn RawChannel>,
    ) -> Self {
        Self::with_transport(config, link, multiplexer, Some(channel), WeakTransport::default())
    }

    pub(crate) fn with_transport(
        config: ConnectionConfig,
        link: Arc<dyn PeerLink>,
        multiplexer: Arc<dyn Multiplexer>,
        initial: Option<Arc<dyn RawChannel>>,
        transport: WeakTransport,
    ) -> Self {
        let conn = Connection {
            id: crate::random_id("connection"),
            config,
            link,
            initial: Mutex::new(initial),
            multiplexer,
            muxed: OnceCell::new(),
            transport,
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
        };
        debug!("{}: New connection", conn);
        conn
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn open_stream(&self) -> Result<Box<dyn MuxedStream>, Error> {
        debug!("{}: Open stream", self.id);
        let muxed = self.muxed().await?;
        muxed.open_stream().await
    }

    pub async fn accept_stream(&self) -> Result<Box<dyn MuxedStream>, Error> {
        debug!("{}: Accept stream", self.id);
        let muxed = self.muxed().await?;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(Error::ConnectionClosed),
            res = muxed.accept_stream() => res,
        }
    }

    async fn muxed(&self) -> Result<&Arc<dyn MuxedConn>, Error> {
        if self.closed.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(Error::ConnectionClosed),
            res = self.muxed.get_or_try_init(|| self.establish()) => res,
        }
    }

    async fn establish(&self) -> Result<Arc<dyn MuxedConn>, Error> {
        let initial = self.initial.lock().take();
        let channel = match initial {
            Some(channel) => channel,
            None if self.config.is_server => {
                debug!("{}: Wait for the data channel", self.id);
                self.link.accept_channel().await?
            }
            None => {
                debug!("{}: Open data channel", self.id);
                self.link.open_channel().await?
            }
        };
        let stream = DataStream::new(channel);
        debug!("{}: Build muxed connection over {}", self.id, stream.id());
        self.multiplexer.new_conn(stream, self.config.is_server)
    }

    /// Closes the peer connection. Streams being opened or accepted concurrently fail with
    /// [Error::ConnectionClosed].
    pub async fn close(&self) -> Result<(), Error> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("{}: Close connection", self.id);
        self.closed.cancel();
        if let Some(muxed) = self.muxed.get() {
            if let Err(e) = muxed.close().await {
                warn!("{}: Can't close muxed connection: {}", self.id, e);
            }
        }
        self.link.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn local_peer(&self) -> PeerId {
        self.config.local_peer
    }

    pub fn remote_peer(&self) -> PeerId {
        self.config.remote_peer
    }

    pub fn local_multiaddr(&self) -> &Multiaddr {
        &self.config.local_addr
    }

    pub fn remote_multiaddr(&self) -> &Multiaddr {
        &self.config.remote_addr
    }

    pub fn is_server(&self) -> bool {
        self.config.is_server
    }

    /// Transport which created this connection, if it's still alive.
    pub fn transport(&self) -> Option<Transport> {
        self.transport.upgrade()
    }

    /// Data channels are not bound to any peer key.
    pub fn local_private_key(&self) -> Result<Keypair, Error> {
        warn!("{}: Local private key undefined", self.id);
        Err(Error::Unsupported("local private key"))
    }

    pub fn remote_public_key(&self) -> Result<PublicKey, Error> {
        warn!("{}: Remote public key undefined", self.id);
        Err(Error::Unsupported("remote public key"))
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "WebRTC connection (ID: {}, localPeerID: {}, localPeerMultiaddr: {}, remotePeerID: {}, remotePeerMultiaddr: {})",
            self.id,
            self.config.local_peer,
            self.config.local_addr,
            self.config.remote_peer,
            self.config.remote_addr
        )
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("muxed", &self.muxed.initialized())
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}
