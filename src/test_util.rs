//! In-memory doubles of the relay, the media layer and the multiplexer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, SinkExt};
use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, PollSender};
use url::Url;

use crate::address_book::AddressBook;
use crate::error::Error;
use crate::message::{payload, HandshakeMessage, SdpKind, SessionDescription};
use crate::mux::{DirectMultiplexer, Multiplexer, MuxedConn, MuxedStream};
use crate::relay::{Frame, RelayConnector, RelaySink, RelayStream};
use crate::rtc::{PeerLink, RawChannel, RtcEngine};
use crate::stream::DataStream;

/// Polls `cond` until it holds, panicking after a second.
pub async fn eventually<F: FnMut() -> bool>(mut cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// --- raw channels -------------------------------------------------------------------------

struct MemoryChannel {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    closed: CancellationToken,
}

/// Two connected ends of an in-memory data channel. Closing either end closes both.
pub fn memory_channel_pair() -> (Arc<dyn RawChannel>, Arc<dyn RawChannel>) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    let closed = CancellationToken::new();
    let a = MemoryChannel {
        tx: a_tx,
        rx: tokio::sync::Mutex::new(a_rx),
        closed: closed.clone(),
    };
    let b = MemoryChannel {
        tx: b_tx,
        rx: tokio::sync::Mutex::new(b_rx),
        closed,
    };
    (Arc::new(a), Arc::new(b))
}

#[async_trait]
impl RawChannel for MemoryChannel {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut rx = self.rx.lock().await;
        let msg = tokio::select! {
            biased;
            msg = rx.recv() => msg,
            _ = self.closed.cancelled() => None,
        };
        match msg {
            None => Err(Error::channel_closed()),
            Some(msg) if msg.len() > buf.len() => Err(Error::protocol("buffer too short")),
            Some(msg) => {
                buf[..msg.len()].copy_from_slice(&msg);
                Ok(msg.len())
            }
        }
    }

    async fn write(&self, data: Bytes) -> Result<usize, Error> {
        if self.closed.is_cancelled() {
            return Err(Error::channel_closed());
        }
        let n = data.len();
        self.tx.send(data).map_err(|_| Error::channel_closed())?;
        Ok(n)
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.cancel();
        Ok(())
    }
}

// --- media engine -------------------------------------------------------------------------

pub struct MemoryLink {
    outbox: mpsc::UnboundedSender<Arc<dyn RawChannel>>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<dyn RawChannel>>>,
    closed: CancellationToken,
}

impl MemoryLink {
    fn pair() -> (Arc<MemoryLink>, Arc<MemoryLink>) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let a = MemoryLink {
            outbox: a_tx,
            inbox: tokio::sync::Mutex::new(a_rx),
            closed: CancellationToken::new(),
        };
        let b = MemoryLink {
            outbox: b_tx,
            inbox: tokio::sync::Mutex::new(b_rx),
            closed: CancellationToken::new(),
        };
        (Arc::new(a), Arc::new(b))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl PeerLink for MemoryLink {
    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), Error> {
        if answer.kind != SdpKind::Answer {
            return Err(Error::protocol("answer expected"));
        }
        Ok(())
    }

    async fn open_channel(&self) -> Result<Arc<dyn RawChannel>, Error> {
        if self.closed.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        let (local, remote) = memory_channel_pair();
        self.outbox
            .send(remote)
            .map_err(|_| Error::ConnectionClosed)?;
        Ok(local)
    }

    async fn accept_channel(&self) -> Result<Arc<dyn RawChannel>, Error> {
        let mut inbox = self.inbox.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(Error::ConnectionClosed),
            ch = inbox.recv() => ch.ok_or(Error::ConnectionClosed),
        }
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.cancel();
        Ok(())
    }
}

/// Engine whose offers are answered by pairing in-memory links. Both peers have to share the
/// same engine.
#[derive(Default)]
pub struct MemoryEngine {
    pending: Mutex<HashMap<String, Arc<MemoryLink>>>,
    links: Mutex<Vec<Arc<MemoryLink>>>,
    counter: AtomicU64,
}

impl MemoryEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn links(&self) -> Vec<Arc<MemoryLink>> {
        self.links.lock().clone()
    }
}

#[async_trait]
impl RtcEngine for MemoryEngine {
    async fn offer(&self) -> Result<(Arc<dyn PeerLink>, SessionDescription), Error> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let sdp = format!("offer-{}", n);
        let (local, remote) = MemoryLink::pair();
        self.pending.lock().insert(sdp.clone(), remote);
        self.links.lock().push(local.clone());
        Ok((local as Arc<dyn PeerLink>, SessionDescription::offer(sdp)))
    }

    async fn answer(
        &self,
        offer: &SessionDescription,
    ) -> Result<(Arc<dyn PeerLink>, SessionDescription), Error> {
        let link = self
            .pending
            .lock()
            .remove(&offer.sdp)
            .ok_or_else(|| Error::protocol("unknown offer"))?;
        self.links.lock().push(link.clone());
        let sdp = offer.sdp.replacen("offer", "answer", 1);
        Ok((link as Arc<dyn PeerLink>, SessionDescription::answer(sdp)))
    }
}

// --- multiplexer --------------------------------------------------------------------------

#[async_trait]
impl MuxedStream for DuplexStream {
    async fn reset(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Wraps [DirectMultiplexer], counting connection builds. The first stream of a connection is
/// the data stream, every later one a detached in-memory stream.
#[derive(Default)]
pub struct CountingMultiplexer {
    builds: AtomicUsize,
    server_builds: AtomicUsize,
    conns: Mutex<Vec<Arc<CountingConn>>>,
}

impl CountingMultiplexer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn server_builds(&self) -> usize {
        self.server_builds.load(Ordering::SeqCst)
    }

    /// Number of streams requested from every connection built so far.
    pub fn stream_calls(&self) -> Vec<usize> {
        self.conns
            .lock()
            .iter()
            .map(|c| c.calls.load(Ordering::SeqCst))
            .collect()
    }
}

impl Multiplexer for CountingMultiplexer {
    fn new_conn(&self, stream: DataStream, is_server: bool) -> Result<Arc<dyn MuxedConn>, Error> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if is_server {
            self.server_builds.fetch_add(1, Ordering::SeqCst);
        }
        let conn = Arc::new(CountingConn {
            inner: DirectMultiplexer.new_conn(stream, is_server)?,
            calls: AtomicUsize::new(0),
        });
        self.conns.lock().push(conn.clone());
        Ok(conn as Arc<dyn MuxedConn>)
    }
}

struct CountingConn {
    inner: Arc<dyn MuxedConn>,
    calls: AtomicUsize,
}

impl CountingConn {
    fn fallback(
        res: Result<Box<dyn MuxedStream>, Error>,
    ) -> Result<Box<dyn MuxedStream>, Error> {
        match res {
            Err(Error::Unsupported(_)) => Ok(Box::new(tokio::io::duplex(64).0)),
            other => other,
        }
    }
}

#[async_trait]
impl MuxedConn for CountingConn {
    async fn open_stream(&self) -> Result<Box<dyn MuxedStream>, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Self::fallback(self.inner.open_stream().await)
    }

    async fn accept_stream(&self) -> Result<Box<dyn MuxedStream>, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Self::fallback(self.inner.accept_stream().await)
    }

    async fn close(&self) -> Result<(), Error> {
        self.inner.close().await
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

// --- address book -------------------------------------------------------------------------

/// Address book remembering every call made to it.
#[derive(Default)]
pub struct RecordingAddressBook {
    calls: Mutex<Vec<(PeerId, Multiaddr, Duration)>>,
}

impl RecordingAddressBook {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<(PeerId, Multiaddr, Duration)> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, peer: &PeerId) -> usize {
        self.calls.lock().iter().filter(|(p, _, _)| p == peer).count()
    }
}

impl AddressBook for RecordingAddressBook {
    fn add_addr(&self, peer: &PeerId, addr: Multiaddr, ttl: Duration) {
        self.calls.lock().push((*peer, addr, ttl));
    }
}

// --- relay --------------------------------------------------------------------------------

/// Relay side of a single in-memory relay connection.
pub struct RelayEnd {
    to_client: mpsc::UnboundedSender<Result<Frame, Error>>,
    from_client: mpsc::Receiver<Frame>,
}

fn relay_connection() -> (RelaySink, RelayStream, RelayEnd) {
    let (to_client, to_client_rx) = mpsc::unbounded_channel();
    let (from_client_tx, from_client) = mpsc::channel(64);
    let sink = PollSender::new(from_client_tx).sink_map_err(|_| Error::ConnectionClosed);
    let stream = stream::unfold(to_client_rx, |mut rx| async move {
        let item = rx.recv().await?;
        Some((item, rx))
    });
    let end = RelayEnd {
        to_client,
        from_client,
    };
    (Box::pin(sink), Box::pin(stream), end)
}

fn session_open_frame(sid: &str, ping_interval_millis: u64, ping_timeout_millis: u64) -> String {
    format!(
        r#"0{{"sid":"{}","upgrades":[],"pingInterval":{},"pingTimeout":{}}}"#,
        sid, ping_interval_millis, ping_timeout_millis
    )
}

fn is_keepalive(frame: &Frame) -> bool {
    match frame {
        Frame::Ping(_) | Frame::Pong(_) => true,
        Frame::Text(text) => text == r#"42["ping"]"#,
        Frame::Close => false,
    }
}

impl RelayEnd {
    pub fn send_text(&self, text: &str) {
        let _ = self.to_client.send(Ok(Frame::Text(text.to_owned())));
    }

    pub fn send_frame(&self, frame: Frame) {
        let _ = self.to_client.send(Ok(frame));
    }

    /// Breaks the connection with a read error on the client side.
    pub fn fail(&self) {
        let err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "relay gone");
        let _ = self.to_client.send(Err(err.into()));
    }

    /// Sends the session-open frame followed by the empty frame.
    pub fn open_session(&self, sid: &str, ping_interval_millis: u64, ping_timeout_millis: u64) {
        self.send_text(&session_open_frame(sid, ping_interval_millis, ping_timeout_millis));
        self.send_text("40");
    }

    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.from_client.recv().await
    }

    /// Next text frame which is not a keepalive message.
    pub async fn next_message(&mut self) -> Option<String> {
        loop {
            match self.from_client.recv().await? {
                frame if is_keepalive(&frame) => continue,
                Frame::Text(text) => return Some(text),
                _ => continue,
            }
        }
    }

    /// Waits until the client drops its side of the connection.
    pub async fn closed(&mut self) {
        while self.from_client.recv().await.is_some() {}
    }
}

/// Connector handing the relay side of every connection over to the test.
pub struct ScriptedConnector {
    ends: mpsc::UnboundedSender<RelayEnd>,
    attempts: AtomicUsize,
    refuse: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RelayEnd>) {
        let (ends, rx) = mpsc::unbounded_channel();
        let connector = ScriptedConnector {
            ends,
            attempts: AtomicUsize::new(0),
            refuse: AtomicUsize::new(0),
        };
        (Arc::new(connector), rx)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Makes the next `n` connection attempts fail.
    pub fn refuse(&self, n: usize) {
        self.refuse.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl RelayConnector for ScriptedConnector {
    async fn connect(&self, _url: &Url) -> Result<(RelaySink, RelayStream), Error> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            let err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
            return Err(err.into());
        }
        let (sink, stream, end) = relay_connection();
        let _ = self.ends.send(end);
        Ok((sink, stream))
    }
}

#[derive(Default)]
struct HubState {
    next_id: u64,
    /// Joined address of every open connection, if it joined already.
    peers: HashMap<u64, (mpsc::UnboundedSender<Result<Frame, Error>>, Option<String>)>,
    handshakes: Vec<HandshakeMessage>,
}

/// Relay server routing handshakes between in-memory connections by destination address.
#[derive(Default)]
pub struct RelayHub {
    state: Arc<Mutex<HubState>>,
    connections: AtomicUsize,
}

impl RelayHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of connections ever opened.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn joined(&self) -> usize {
        let state = self.state.lock();
        state.peers.values().filter(|(_, a)| a.is_some()).count()
    }

    /// Handshake messages received so far.
    pub fn handshakes(&self) -> Vec<HandshakeMessage> {
        self.state.lock().handshakes.clone()
    }

    /// Breaks every open connection.
    pub fn disconnect_all(&self) {
        let peers = std::mem::take(&mut self.state.lock().peers);
        for (tx, _) in peers.values() {
            let err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "relay restart");
            let _ = tx.send(Err(err.into()));
        }
    }

    fn handle(state: &Mutex<HubState>, id: u64, text: &str) {
        let Ok(body) = payload(text) else { return };
        let Ok(Value::Array(parts)) = serde_json::from_str::<Value>(body) else {
            return;
        };
        let mut state = state.lock();
        match (parts.first().and_then(Value::as_str), parts.get(1)) {
            (Some("ss-join"), Some(Value::String(addr))) => {
                let existing: Vec<String> =
                    state.peers.values().filter_map(|(_, a)| a.clone()).collect();
                if let Some((tx, joined)) = state.peers.get_mut(&id) {
                    *joined = Some(addr.clone());
                    for other in existing {
                        let _ = tx.send(Ok(Frame::Text(peer_frame(&other))));
                    }
                }
                let announcement = peer_frame(addr);
                for (tx, joined) in state.peers.values() {
                    if joined.is_some() {
                        let _ = tx.send(Ok(Frame::Text(announcement.clone())));
                    }
                }
            }
            (Some("ss-handshake"), Some(data)) => {
                let Ok(msg) = serde_json::from_value::<HandshakeMessage>(data.clone()) else {
                    return;
                };
                state.handshakes.push(msg.clone());
                let frame = format!(
                    "42{}",
                    serde_json::to_string(&("ws-handshake", &msg)).unwrap_or_default()
                );
                for (tx, joined) in state.peers.values() {
                    if joined.as_deref() == Some(msg.dst_multiaddr.as_str()) {
                        let _ = tx.send(Ok(Frame::Text(frame.clone())));
                    }
                }
            }
            _ => {}
        }
    }
}

fn peer_frame(addr: &str) -> String {
    format!(
        "42{}",
        serde_json::to_string(&("ws-peer", addr)).unwrap_or_default()
    )
}

#[async_trait]
impl RelayConnector for RelayHub {
    async fn connect(&self, _url: &Url) -> Result<(RelaySink, RelayStream), Error> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        let (sink, stream, mut end) = relay_connection();
        let id = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.peers.insert(id, (end.to_client.clone(), None));
            id
        };
        end.open_session(&format!("sid-{}", id), 25_000, 5_000);

        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(frame) = end.next_frame().await {
                match frame {
                    Frame::Ping(data) => end.send_frame(Frame::Pong(data)),
                    Frame::Text(text) => Self::handle(&state, id, &text),
                    Frame::Pong(_) => {}
                    Frame::Close => break,
                }
            }
            state.lock().peers.remove(&id);
        });
        Ok((sink, stream))
    }
}
