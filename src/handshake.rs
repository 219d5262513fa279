use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use log::debug;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::message::HandshakeMessage;

/// Correlates outgoing offers with their answers and hands unsolicited offers over to the
/// accepting side.
///
/// Unmatched offers are forwarded through a single-slot queue: [HandshakeCoordinator::emit]
/// does not return until the previous offer has been taken by
/// [HandshakeCoordinator::next_unsubscribed].
#[derive(Debug)]
pub struct HandshakeCoordinator {
    subscribers: Mutex<HashMap<String, Pending>>,
    next_token: AtomicU64,
    sink_tx: mpsc::Sender<HandshakeMessage>,
    sink_rx: tokio::sync::Mutex<mpsc::Receiver<HandshakeMessage>>,
    closed: CancellationToken,
}

#[derive(Debug)]
struct Pending {
    token: u64,
    sender: oneshot::Sender<HandshakeMessage>,
}

impl HandshakeCoordinator {
    pub fn new() -> Arc<Self> {
        let (sink_tx, sink_rx) = mpsc::channel(1);
        Arc::new(HandshakeCoordinator {
            subscribers: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
            sink_tx,
            sink_rx: tokio::sync::Mutex::new(sink_rx),
            closed: CancellationToken::new(),
        })
    }

    /// Registers interest in the answer for `intent_id`, replacing any previous registration.
    /// Dropping the returned [Subscription] before it resolves withdraws it.
    pub fn subscribe(self: &Arc<Self>, intent_id: &str) -> Subscription {
        debug!("Subscribe to the specific handshake (intentID: {})", intent_id);
        let (sender, receiver) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        if !self.closed.is_cancelled() {
            let mut subscribers = self.subscribers.lock();
            subscribers.insert(intent_id.to_owned(), Pending { token, sender });
        }
        Subscription {
            intent_id: intent_id.to_owned(),
            token,
            receiver,
            coordinator: Arc::downgrade(self),
            done: false,
        }
    }

    /// Delivers `message` to its subscriber. Offers nobody subscribed to go to the
    /// unsubscribed queue, answers nobody waits for anymore are dropped.
    pub async fn emit(&self, message: HandshakeMessage) {
        debug!("Emit handshake message: {}", message);
        let pending = self.subscribers.lock().remove(&message.intent_id);
        if let Some(pending) = pending {
            if let Err(message) = pending.sender.send(message) {
                debug!(
                    "Subscriber left before delivery (intentID: {})",
                    message.intent_id
                );
            }
            return;
        }

        if message.answer {
            debug!(
                "Received answer to a probably cancelled handshake (intentID: {})",
                message.intent_id
            );
            return;
        }

        if self.closed.is_cancelled() {
            debug!("Drop handshake offer, coordinator closed (intentID: {})", message.intent_id);
            return;
        }

        let intent_id = message.intent_id.clone();
        tokio::select! {
            _ = self.closed.cancelled() => {
                debug!("Drop handshake offer, coordinator closed (intentID: {})", intent_id);
            }
            res = self.sink_tx.send(message) => {
                if res.is_err() {
                    debug!("Drop handshake offer, nobody listens (intentID: {})", intent_id);
                }
            }
        }
    }

    /// Withdraws the subscription for `intent_id`, if any.
    pub fn cancel(&self, intent_id: &str) {
        debug!("Cancel handshake subscription (intentID: {})", intent_id);
        self.subscribers.lock().remove(intent_id);
    }

    /// Waits for the next offer that did not match any subscription. Returns `None` once the
    /// coordinator is closed.
    pub async fn next_unsubscribed(&self) -> Option<HandshakeMessage> {
        if self.closed.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            msg = async { self.sink_rx.lock().await.recv().await } => msg,
        }
    }

    /// Number of subscriptions still waiting for an answer.
    pub fn pending(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_subscribed(&self, intent_id: &str) -> bool {
        self.subscribers.lock().contains_key(intent_id)
    }

    /// Fails all pending subscriptions and releases everyone waiting for unsubscribed offers.
    pub fn close(&self) {
        self.closed.cancel();
        self.subscribers.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn withdraw(&self, intent_id: &str, token: u64) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.get(intent_id).map(|p| p.token) == Some(token) {
            debug!("Withdraw handshake subscription (intentID: {})", intent_id);
            subscribers.remove(intent_id);
        }
    }
}

/// Pending answer for a single intent. Resolves once, with the answer or with
/// [Error::SignalClosed] if the registration was cancelled or the coordinator closed.
#[derive(Debug)]
pub struct Subscription {
    intent_id: String,
    token: u64,
    receiver: oneshot::Receiver<HandshakeMessage>,
    coordinator: Weak<HandshakeCoordinator>,
    done: bool,
}

impl Subscription {
    pub fn intent_id(&self) -> &str {
        &self.intent_id
    }
}

impl Future for Subscription {
    type Output = Result<HandshakeMessage, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let res = std::task::ready!(Pin::new(&mut self.receiver).poll(cx));
        self.done = true;
        Poll::Ready(res.map_err(|_| Error::SignalClosed))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.done {
            if let Some(coordinator) = self.coordinator.upgrade() {
                coordinator.withdraw(&self.intent_id, self.token);
            }
        }
    }
}
