use crate::error::Error;
use crate::rtc::RawChannel;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use std::sync::Arc;
use tokio::sync::Notify;
use webrtc::data::data_channel::DataChannel as DetachedDataChannel;
use webrtc::data_channel::RTCDataChannel;

/// WebRTC data channel waiting to be detached into a [RawChannel].
///
/// Peer connections used by this crate run with data channel detaching enabled, so messages are
/// never delivered through callbacks: once the channel opens, it's detached and read from
/// directly.
pub struct DataChannel {
    dc: Arc<RTCDataChannel>,
    status: Arc<ArcSwap<DataChannelState>>,
}

impl DataChannel {
    pub fn new(dc: Arc<RTCDataChannel>) -> Self {
        let status = Arc::new(ArcSwap::new(DataChannelState::waiting()));
        let s = Arc::downgrade(&status);
        dc.on_open(Box::new(move || {
            let s = s.clone();
            Box::pin(async move {
                if let Some(status) = s.upgrade() {
                    status.rcu(|old| match &**old {
                        DataChannelState::Waiting { ready } => {
                            ready.notify_waiters();
                            DataChannelState::open()
                        }
                        _ => old.clone(),
                    });
                }
            })
        }));
        let s = Arc::downgrade(&status);
        dc.on_close(Box::new(move || {
            let s = s.clone();
            Box::pin(async move {
                if let Some(status) = s.upgrade() {
                    let old = status.swap(DataChannelState::closed_gracefully());
                    if let DataChannelState::Waiting { ready } = &*old {
                        ready.notify_waiters();
                    }
                }
            })
        }));
        let s = Arc::downgrade(&status);
        dc.on_error(Box::new(move |e| {
            let s = s.clone();
            Box::pin(async move {
                if let Some(status) = s.upgrade() {
                    let old = status.swap(DataChannelState::failed(e.into()));
                    if let DataChannelState::Waiting { ready } = &*old {
                        ready.notify_waiters();
                    }
                }
            })
        }));
        DataChannel { dc, status }
    }

    pub fn label(&self) -> &str {
        self.dc.label()
    }

    pub fn id(&self) -> u16 {
        self.dc.id()
    }

    pub fn is_open(&self) -> bool {
        self.status.load().is_open()
    }

    pub fn is_closed(&self) -> bool {
        self.status.load().is_closed()
    }

    /// Resolves once the channel leaves the waiting state: `Ok(true)` when it opened,
    /// `Ok(false)` when it closed before opening and `Err` with the failure that closed it.
    pub async fn ready(&self) -> Result<bool, Error> {
        loop {
            // register interest before checking the state, so that a notification sent in
            // between is not lost
            let status = self.status.load_full();
            match &*status {
                DataChannelState::Open => return Ok(true),
                DataChannelState::Closed { reason: None } => return Ok(false),
                DataChannelState::Closed { reason: Some(e) } => return Err(e.clone()),
                DataChannelState::Waiting { ready } => {
                    let notified = ready.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    if self.status.load().is_waiting() {
                        notified.await;
                    }
                }
            }
        }
    }

    /// Waits for the channel to open and detaches it from the peer connection.
    pub async fn detach(self) -> Result<Arc<dyn RawChannel>, Error> {
        if !self.ready().await? {
            return Err(Error::channel_closed());
        }
        let raw = self.dc.detach().await?;
        debug!("Data channel detached (label: {}, id: {})", self.label(), self.id());
        Ok(Arc::new(DetachedChannel {
            raw,
            dc: self.dc.clone(),
        }))
    }
}

impl std::fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannel")
            .field("label", &self.dc.label())
            .field("state", &self.status)
            .finish()
    }
}

impl AsRef<RTCDataChannel> for DataChannel {
    fn as_ref(&self) -> &RTCDataChannel {
        &self.dc
    }
}

/// Data channel detached from its peer connection.
struct DetachedChannel {
    raw: Arc<DetachedDataChannel>,
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl RawChannel for DetachedChannel {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let received = self.raw.messages_received();
        let n = self.raw.read(buf).await.map_err(webrtc::Error::from)?;
        if n == 0 && self.raw.messages_received() == received {
            // zero bytes without a message means the stream was reset
            return Err(Error::channel_closed());
        }
        Ok(n)
    }

    async fn write(&self, data: Bytes) -> Result<usize, Error> {
        let n = self.raw.write(&data).await.map_err(webrtc::Error::from)?;
        Ok(n)
    }

    async fn close(&self) -> Result<(), Error> {
        self.raw.close().await.map_err(webrtc::Error::from)?;
        self.dc.close().await?;
        Ok(())
    }
}

#[derive(Debug)]
enum DataChannelState {
    /// Negotiated, not open yet.
    Waiting {
        /// Woken on the first transition out of this state.
        ready: Notify,
    },
    Open,
    Closed {
        /// `None` after a graceful close.
        reason: Option<Error>,
    },
}

impl DataChannelState {
    fn waiting() -> Arc<Self> {
        Arc::new(DataChannelState::Waiting {
            ready: Notify::new(),
        })
    }

    fn open() -> Arc<Self> {
        Arc::new(DataChannelState::Open)
    }

    fn closed_gracefully() -> Arc<Self> {
        Arc::new(DataChannelState::Closed { reason: None })
    }

    fn failed(reason: Error) -> Arc<Self> {
        Arc::new(DataChannelState::Closed {
            reason: Some(reason),
        })
    }

    fn is_waiting(&self) -> bool {
        matches!(self, DataChannelState::Waiting { .. })
    }

    fn is_open(&self) -> bool {
        matches!(self, DataChannelState::Open)
    }

    fn is_closed(&self) -> bool {
        matches!(self, DataChannelState::Closed { .. })
    }
}
