use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use log::{debug, warn};
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::error::Error;

/// Websocket level frame exchanged with the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

pub type RelaySink = Pin<Box<dyn Sink<Frame, Error = Error> + Send>>;
pub type RelayStream = Pin<Box<dyn Stream<Item = Result<Frame, Error>> + Send>>;

/// Opens physical connections to the relay.
#[async_trait]
pub trait RelayConnector: Send + Sync + 'static {
    async fn connect(&self, url: &Url) -> Result<(RelaySink, RelayStream), Error>;
}

/// [RelayConnector] over tungstenite websockets.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    max_message_size: usize,
}

impl WebSocketConnector {
    pub fn new(max_message_size: usize) -> Self {
        WebSocketConnector { max_message_size }
    }
}

#[async_trait]
impl RelayConnector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<(RelaySink, RelayStream), Error> {
        debug!("Open new connection: {}", url);
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_message_size);

        let (ws, _) = connect_async_with_config(url.as_str(), Some(config), false).await?;
        let (sink, stream) = ws.split();
        let sink = sink
            .sink_map_err(Error::from)
            .with(|frame: Frame| future::ready(Ok::<_, Error>(Message::from(frame))));
        let stream = stream.filter_map(|msg| {
            future::ready(match msg {
                Ok(msg) => Frame::from_message(msg).map(Ok),
                Err(e) => Some(Err(Error::from(e))),
            })
        });
        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

impl Frame {
    fn from_message(msg: Message) -> Option<Self> {
        match msg {
            Message::Text(text) => Some(Frame::Text(text)),
            Message::Ping(data) => Some(Frame::Ping(data)),
            Message::Pong(data) => Some(Frame::Pong(data)),
            Message::Close(_) => Some(Frame::Close),
            Message::Binary(data) => {
                warn!("Ignore binary relay frame ({} bytes)", data.len());
                None
            }
            Message::Frame(_) => None,
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
            Frame::Close => Message::Close(None),
        }
    }
}
