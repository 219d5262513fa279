//! Long-lived client of the relay.
//!
//! The client keeps exactly one relay session alive at a time. Every session runs two helper
//! tasks (keepalive and outgoing handshake sender) bound to a child cancellation token; the
//! read loop joins both of them before a new session is opened, so no task outlives the
//! session generation it was started for.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, warn};
use multiaddr::Multiaddr;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::address::split_peer_address;
use crate::address_book::AddressBook;
use crate::error::Error;
use crate::handshake::HandshakeCoordinator;
use crate::message::{ensure_empty, HandshakeMessage, Inbound, Outbound, SessionProperties};
use crate::relay::{Frame, RelayConnector, RelaySink, RelayStream};

type SharedSink = Arc<Mutex<RelaySink>>;

/// How long a session waits for its close frame to be written before dropping the connection.
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);
type OutgoingQueue = Arc<Mutex<mpsc::UnboundedReceiver<HandshakeMessage>>>;

pub(crate) struct SessionClient {
    pub url: Url,
    pub self_addr: Multiaddr,
    pub connector: Arc<dyn RelayConnector>,
    pub address_book: Arc<dyn AddressBook>,
    pub handshakes: Arc<HandshakeCoordinator>,
    pub outgoing: mpsc::UnboundedReceiver<HandshakeMessage>,
    pub reconnect_delay: Duration,
    pub session_open_timeout: Duration,
    pub peer_ttl: Duration,
    pub stop: CancellationToken,
}

/// One open relay session and the tasks serving it.
struct Session {
    properties: SessionProperties,
    sink: SharedSink,
    deadline: watch::Receiver<Option<Instant>>,
    deadline_tx: Arc<watch::Sender<Option<Instant>>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    async fn shutdown(self) {
        let sid = self.properties.sid;
        debug!("{}: Stop active session threads", sid);
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("{}: Session task failed: {}", sid, e);
            }
        }
        let mut sink = self.sink.lock().await;
        let closed = timeout(CLOSE_TIMEOUT, async {
            sink.send(Frame::Close).await?;
            sink.close().await
        })
        .await;
        match closed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("{}: Can't close relay connection: {}", sid, e),
            Err(_) => warn!("{}: Relay connection not closed in time, dropping it", sid),
        }
    }
}

enum ReadOutcome {
    Stopped,
    Broken,
}

impl SessionClient {
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        debug!("Use signal server: {}", self.url);
        let outgoing: OutgoingQueue = Arc::new(Mutex::new(self.outgoing));
        let mut generation = 0u64;
        let this = Runner {
            url: self.url,
            self_addr: self.self_addr,
            connector: self.connector,
            address_book: self.address_book,
            handshakes: self.handshakes,
            outgoing,
            session_open_timeout: self.session_open_timeout,
            peer_ttl: self.peer_ttl,
            stop: self.stop,
        };

        loop {
            if this.stop.is_cancelled() {
                debug!("Stop signal received. Closing");
                return;
            }

            let connected = tokio::select! {
                biased;
                _ = this.stop.cancelled() => continue,
                res = this.connector.connect(&this.url) => res,
            };
            let (sink, mut stream) = match connected {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Can't establish connection: {}", e);
                    this.backoff(self.reconnect_delay).await;
                    continue;
                }
            };
            debug!("Connection to signal server established");

            generation += 1;
            let opened = tokio::select! {
                biased;
                _ = this.stop.cancelled() => continue,
                res = this.open_session(generation, sink, &mut stream) => res,
            };
            let session = match opened {
                Ok(session) => session,
                Err(e) => {
                    error!("Can't open session: {}", e);
                    this.backoff(self.reconnect_delay).await;
                    continue;
                }
            };

            let outcome = this.read_loop(&session, &mut stream).await;
            session.shutdown().await;
            if let ReadOutcome::Stopped = outcome {
                debug!("Stop signal received. Closing");
                return;
            }
        }
    }
}

struct Runner {
    url: Url,
    self_addr: Multiaddr,
    connector: Arc<dyn RelayConnector>,
    address_book: Arc<dyn AddressBook>,
    handshakes: Arc<HandshakeCoordinator>,
    outgoing: OutgoingQueue,
    session_open_timeout: Duration,
    peer_ttl: Duration,
    stop: CancellationToken,
}

impl Runner {
    async fn backoff(&self, delay: Duration) {
        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = sleep(delay) => {}
        }
    }

    async fn open_session(
        &self,
        generation: u64,
        sink: RelaySink,
        stream: &mut RelayStream,
    ) -> Result<Session, Error> {
        let open = timeout(self.session_open_timeout, async {
            let first = next_text(stream).await?;
            let properties = SessionProperties::parse(&first)?;
            let second = next_text(stream).await?;
            ensure_empty(&second)?;
            Ok::<_, Error>(properties)
        });
        let properties = match open.await {
            Ok(res) => res?,
            Err(_) => return Err(Error::protocol("relay did not open the session in time")),
        };
        let sid = properties.sid.clone();
        debug!(
            "{}: Session generation {} (ping interval: {:?}, ping timeout: {:?})",
            sid,
            generation,
            properties.ping_interval(),
            properties.ping_timeout()
        );

        let (deadline_tx, deadline) = watch::channel(None);
        let deadline_tx = Arc::new(deadline_tx);
        let sink: SharedSink = Arc::new(Mutex::new(sink));
        let cancel = self.stop.child_token();
        let mut session = Session {
            properties,
            sink: sink.clone(),
            deadline,
            deadline_tx: deadline_tx.clone(),
            cancel: cancel.clone(),
            tasks: Vec::with_capacity(2),
        };

        let ping_interval = session.properties.ping_interval();
        if ping_interval.is_zero() {
            warn!("{}: Relay disabled pings, keepalive not started", sid);
        } else {
            session.tasks.push(tokio::spawn(keepalive(
                sid.clone(),
                sink.clone(),
                deadline_tx,
                ping_interval,
                session.properties.ping_timeout(),
                cancel.clone(),
            )));
        }

        debug!("{}: Join peer network (peerID: {})", sid, self.self_addr);
        let join = send(&sink, Outbound::Join(&self.self_addr));
        let joined = match timeout(self.session_open_timeout, join).await {
            Ok(res) => res,
            Err(_) => Err(Error::protocol("join announcement not sent in time")),
        };
        if let Err(e) = joined {
            session.shutdown().await;
            return Err(e);
        }

        session.tasks.push(tokio::spawn(forward_handshakes(
            sid,
            sink,
            self.outgoing.clone(),
            cancel,
        )));
        Ok(session)
    }

    async fn read_loop(&self, session: &Session, stream: &mut RelayStream) -> ReadOutcome {
        let sid = &session.properties.sid;
        let mut deadline = session.deadline.clone();
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return ReadOutcome::Stopped,
                _ = expired(&mut deadline) => {
                    error!("{}: Can't read message: pong not received in time", sid);
                    return ReadOutcome::Broken;
                }
                frame = stream.next() => frame,
            };
            let text = match frame {
                Some(Ok(Frame::Text(text))) => text,
                Some(Ok(Frame::Pong(_))) => {
                    debug!("{}: Pong message received", sid);
                    let interval = session.properties.ping_interval();
                    let extended = Instant::now() + interval + session.properties.ping_timeout();
                    session.deadline_tx.send_replace(Some(extended));
                    continue;
                }
                Some(Ok(Frame::Ping(_))) => continue,
                Some(Ok(Frame::Close)) | None => {
                    error!("{}: Can't read message: connection closed by relay", sid);
                    return ReadOutcome::Broken;
                }
                Some(Err(e)) => {
                    error!("{}: Can't read message: {}", sid, e);
                    return ReadOutcome::Broken;
                }
            };
            debug!("{}: Received message: {}", sid, text);

            let message = match Inbound::decode(&text) {
                Ok(message) => message,
                Err(e) => {
                    warn!("{}: Can't process message: {}", sid, e);
                    continue;
                }
            };
            match message {
                Inbound::PeerDiscovered(addr) => {
                    if let Err(e) = self.register_peer(&addr) {
                        warn!("{}: Can't process message: {}", sid, e);
                    }
                }
                Inbound::Handshake(handshake) => {
                    tokio::select! {
                        biased;
                        _ = self.stop.cancelled() => return ReadOutcome::Stopped,
                        _ = self.handshakes.emit(handshake) => {}
                    }
                }
            }
        }
    }

    fn register_peer(&self, addr: &str) -> Result<(), Error> {
        let (peer, signal_addr) = split_peer_address(addr)?;
        self.address_book.add_addr(&peer, signal_addr, self.peer_ttl);
        Ok(())
    }
}

/// Reads frames until the next text frame.
async fn next_text(stream: &mut RelayStream) -> Result<String, Error> {
    loop {
        match stream.next().await {
            Some(Ok(Frame::Text(text))) => return Ok(text),
            Some(Ok(Frame::Ping(_))) | Some(Ok(Frame::Pong(_))) => continue,
            Some(Ok(Frame::Close)) | None => return Err(Error::ConnectionClosed),
            Some(Err(e)) => return Err(e),
        }
    }
}

/// Resolves once the current read deadline passes. Never resolves while no deadline is set.
async fn expired(deadline: &mut watch::Receiver<Option<Instant>>) {
    loop {
        let current = *deadline.borrow_and_update();
        match current {
            Some(at) => {
                tokio::select! {
                    _ = sleep_until(at) => return,
                    res = deadline.changed() => {
                        if res.is_err() {
                            sleep_until(at).await;
                            return;
                        }
                    }
                }
            }
            None => {
                if deadline.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }
    }
}

async fn send(sink: &SharedSink, message: Outbound<'_>) -> Result<(), Error> {
    let frame = message.encode()?;
    send_frame(sink, Frame::Text(frame)).await
}

async fn send_frame(sink: &SharedSink, frame: Frame) -> Result<(), Error> {
    let mut sink = sink.lock().await;
    sink.send(frame).await
}

async fn keepalive(
    sid: String,
    sink: SharedSink,
    deadline: Arc<watch::Sender<Option<Instant>>>,
    interval: Duration,
    ping_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("{}: Stop signal received. Close ping ticker", sid);
                return;
            }
            _ = ticker.tick() => {}
        }

        debug!("{}: Send ping message", sid);
        // a pending deadline is only ever moved by a pong
        let at = Instant::now() + ping_timeout;
        deadline.send_if_modified(|current| match current {
            Some(_) => false,
            None => {
                *current = Some(at);
                true
            }
        });

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            res = send(&sink, Outbound::Ping) => res,
        };
        if let Err(e) = sent {
            error!("{}: Can't send ping message: {}", sid, e);
            continue;
        }
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            res = send_frame(&sink, Frame::Ping(b"ping".to_vec())) => res,
        };
        if let Err(e) = sent {
            error!("{}: Can't send ping control frame: {}", sid, e);
        }
    }
}

async fn forward_handshakes(
    sid: String,
    sink: SharedSink,
    outgoing: OutgoingQueue,
    cancel: CancellationToken,
) {
    let mut outgoing = tokio::select! {
        _ = cancel.cancelled() => return,
        queue = outgoing.lock() => queue,
    };
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("{}: Stop signal received. Close handshake sender", sid);
                return;
            }
            message = outgoing.recv() => match message {
                Some(message) => message,
                None => return,
            },
        };
        debug!("{}: Send handshake message: {}", sid, message);
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(
                    "{}: Session closed before handshake was sent (intentID: {})",
                    sid, message.intent_id
                );
                return;
            }
            res = send(&sink, Outbound::Handshake(&message)) => res,
        };
        if let Err(e) = sent {
            error!("{}: Can't send handshake message: {}", sid, e);
        }
    }
}
