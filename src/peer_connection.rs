use crate::data_channel::DataChannel;
use crate::error::Error;
use crate::message::{SdpKind, SessionDescription};
use crate::rtc::{PeerLink, RawChannel, RtcEngine};
use async_trait::async_trait;
use log::debug;
use std::fmt::Formatter;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// [RtcEngine] backed by webrtc-rs.
///
/// Session descriptions are exchanged only once per connection, so every offer and answer is
/// produced after ICE gathering completes and carries all local candidates.
pub struct WebRtcEngine {
    api: API,
    options: Options,
}

impl WebRtcEngine {
    pub fn new(options: Options) -> Result<Self, Error> {
        // no media tracks are ever negotiated, default codecs only keep the SDP well formed
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        // data channels are read as plain byte pipes, not through on_message callbacks
        let mut settings = SettingEngine::default();
        settings.detach_data_channels();

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(settings)
            .build();
        Ok(WebRtcEngine { api, options })
    }

    async fn negotiate<F, Fut>(&self, f: F) -> Result<(Arc<dyn PeerLink>, SessionDescription), Error>
    where
        F: FnOnce(Arc<PeerConnection>) -> Fut,
        Fut: std::future::Future<Output = Result<SessionDescription, Error>>,
    {
        let pc = Arc::new(PeerConnection::start(&self.api, &self.options).await?);
        match f(pc.clone()).await {
            Ok(sdp) => Ok((pc as Arc<dyn PeerLink>, sdp)),
            Err(e) => {
                let _ = pc.close().await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl RtcEngine for WebRtcEngine {
    async fn offer(&self) -> Result<(Arc<dyn PeerLink>, SessionDescription), Error> {
        self.negotiate(|pc| async move {
            // an offer without any data channel would not negotiate SCTP at all
            let dc = pc.pc.create_data_channel(&pc.label, None).await?;
            *pc.initial.lock().await = Some(DataChannel::new(dc));

            let offer = pc.pc.create_offer(None).await?;
            pc.set_local_description(offer).await
        })
        .await
    }

    async fn answer(
        &self,
        offer: &SessionDescription,
    ) -> Result<(Arc<dyn PeerLink>, SessionDescription), Error> {
        let offer = to_rtc(offer)?;
        self.negotiate(|pc| async move {
            pc.pc.set_remote_description(offer).await?;
            let answer = pc.pc.create_answer(None).await?;
            pc.set_local_description(answer).await
        })
        .await
    }
}

/// webrtc-rs peer connection negotiated by [WebRtcEngine].
pub struct PeerConnection {
    pc: Arc<RTCPeerConnection>,
    label: String,
    /// Channel created together with the offer, handed out by the first [PeerLink::open_channel].
    initial: Mutex<Option<DataChannel>>,
    data_channels: PeerConnectionDataChannels,
    closed: CancellationToken,
}

impl PeerConnection {
    async fn start(api: &API, options: &Options) -> Result<Self, Error> {
        let peer_connection = Arc::new(api.new_peer_connection(options.rtc_config.clone()).await?);
        let (data_channels_tx, data_channels) = unbounded_channel();
        let closed = CancellationToken::new();
        {
            let closed = closed.clone();
            peer_connection.on_peer_connection_state_change(Box::new(move |s| {
                debug!("Peer connection state changed: {}", s);
                match s {
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                        closed.cancel()
                    }
                    _ => {}
                }
                Box::pin(async move {})
            }));
        }
        peer_connection.on_data_channel(Box::new(move |dc| {
            let _ = data_channels_tx.send(DataChannel::new(dc));
            Box::pin(async move {})
        }));

        Ok(PeerConnection {
            pc: peer_connection,
            label: options.label.clone(),
            initial: Mutex::new(None),
            data_channels: PeerConnectionDataChannels::new(data_channels),
            closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Applies a local description and waits for ICE gathering, returning the description with
    /// all gathered candidates.
    async fn set_local_description(
        &self,
        desc: RTCSessionDescription,
    ) -> Result<SessionDescription, Error> {
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(desc).await?;
        tokio::select! {
            _ = self.closed.cancelled() => return Err(Error::ConnectionClosed),
            _ = gathered.recv() => {}
        }
        match self.pc.local_description().await {
            Some(desc) => from_rtc(desc),
            None => Err(Error::protocol("local description not set")),
        }
    }

    async fn detach(&self, dc: DataChannel) -> Result<Arc<dyn RawChannel>, Error> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(Error::ConnectionClosed),
            res = dc.detach() => res,
        }
    }
}

#[async_trait]
impl PeerLink for PeerConnection {
    async fn apply_answer(&self, answer: SessionDescription) -> Result<(), Error> {
        self.pc.set_remote_description(to_rtc(&answer)?).await?;
        Ok(())
    }

    async fn open_channel(&self) -> Result<Arc<dyn RawChannel>, Error> {
        let initial = self.initial.lock().await.take();
        let dc = match initial {
            Some(dc) => dc,
            None => DataChannel::new(self.pc.create_data_channel(&self.label, None).await?),
        };
        self.detach(dc).await
    }

    async fn accept_channel(&self) -> Result<Arc<dyn RawChannel>, Error> {
        let dc = tokio::select! {
            _ = self.closed.cancelled() => None,
            dc = self.data_channels.next() => dc,
        };
        match dc {
            Some(dc) => self.detach(dc).await,
            None => Err(Error::ConnectionClosed),
        }
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.cancel();
        // the future of RTCPeerConnection::close is not Send, so it runs on a blocking thread
        let pc = self.pc.clone();
        let runtime = Handle::current();
        spawn_blocking(move || runtime.block_on(pc.close()))
            .await
            .map_err(std::io::Error::from)??;
        Ok(())
    }
}

impl AsRef<RTCPeerConnection> for PeerConnection {
    fn as_ref(&self) -> &RTCPeerConnection {
        &self.pc
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("state", &self.pc.connection_state())
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

#[derive(Clone)]
pub struct Options {
    pub rtc_config: RTCConfiguration,
    /// Label of the data channel carrying the multiplexed connection.
    pub label: String,
}

impl Options {
    pub fn with_label(label: &str) -> Self {
        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_owned()],
                ..Default::default()
            }],
            ..Default::default()
        };
        Options {
            rtc_config,
            label: label.to_owned(),
        }
    }

    /// Options gathering host candidates only.
    pub fn without_ice_servers() -> Self {
        Options {
            rtc_config: RTCConfiguration::default(),
            ..Options::default()
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Options::with_label("data")
    }
}

#[derive(Debug)]
struct PeerConnectionDataChannels(Mutex<UnboundedReceiver<DataChannel>>);

impl PeerConnectionDataChannels {
    fn new(receiver: UnboundedReceiver<DataChannel>) -> Self {
        PeerConnectionDataChannels(Mutex::new(receiver))
    }

    async fn next(&self) -> Option<DataChannel> {
        let mut guard = self.0.lock().await;
        guard.recv().await
    }
}

fn to_rtc(desc: &SessionDescription) -> Result<RTCSessionDescription, Error> {
    let sdp = desc.sdp.clone();
    let desc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(sdp)?,
        SdpKind::Pranswer => RTCSessionDescription::pranswer(sdp)?,
        SdpKind::Rollback => return Err(Error::Unsupported("rollback session description")),
    };
    Ok(desc)
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, Error> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(Error::protocol("unspecified session description type"))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}
