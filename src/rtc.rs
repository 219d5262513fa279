//! Seams towards the real-time media layer. The default implementation lives in
//! [crate::peer_connection] and is backed by webrtc-rs.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Error;
use crate::message::SessionDescription;

/// A data channel detached from its peer connection: a plain message pipe.
#[async_trait]
pub trait RawChannel: Send + Sync + 'static {
    /// Reads a single message into `buf`, returning its length.
    async fn read(&self, buf: &mut [u8]) -> Result<usize, Error>;

    /// Sends `data` as a single message.
    async fn write(&self, data: Bytes) -> Result<usize, Error>;

    async fn close(&self) -> Result<(), Error>;
}

/// One negotiated (or negotiating) peer connection.
#[async_trait]
pub trait PeerLink: Send + Sync + 'static {
    /// Completes the negotiation started by [RtcEngine::offer].
    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), Error>;

    /// Opens a data channel from this side and waits until it can be used.
    async fn open_channel(&self) -> Result<Arc<dyn RawChannel>, Error>;

    /// Waits for the next data channel opened by the remote side.
    async fn accept_channel(&self) -> Result<Arc<dyn RawChannel>, Error>;

    async fn close(&self) -> Result<(), Error>;
}

/// Factory of peer connections.
#[async_trait]
pub trait RtcEngine: Send + Sync + 'static {
    /// Creates a new peer connection on the initiating side together with its offer.
    async fn offer(&self) -> Result<(Arc<dyn PeerLink>, SessionDescription), Error>;

    /// Creates a new peer connection for a remote `offer` together with the local answer.
    async fn answer(
        &self,
        offer: &SessionDescription,
    ) -> Result<(Arc<dyn PeerLink>, SessionDescription), Error>;
}
