use std::sync::Arc;

use multiaddr::Multiaddr;

/// Errors produced by the transport. Cheap to clone, so a single failure can be
/// reported to every waiter that observes it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("webrtc: {0}")]
    Rtc(Arc<webrtc::Error>),
    #[error("relay connection: {0}")]
    Relay(Arc<tokio_tungstenite::tungstenite::Error>),
    #[error("json: {0}")]
    Json(Arc<serde_json::Error>),
    #[error("io: {0}")]
    Io(Arc<std::io::Error>),
    #[error("invalid relay url: {0}")]
    Url(#[from] url::ParseError),
    #[error("relay protocol violation: {0}")]
    Protocol(String),
    #[error("tried to process unknown message: {0}")]
    UnknownMessage(String),
    #[error("invalid address `{addr}`: {reason}")]
    InvalidAddress { addr: String, reason: &'static str },
    #[error("handshake answer timeout (intentID: {0})")]
    HandshakeTimeout(String),
    #[error("handshake cancelled (intentID: {0})")]
    HandshakeCancelled(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("signal closed")]
    SignalClosed,
    #[error("no signal registered for `{0}`")]
    NoSignal(Multiaddr),
    #[error("not supported: {0}")]
    Unsupported(&'static str),
}

impl Error {
    pub fn channel_closed() -> Self {
        Error::Rtc(Arc::new(webrtc::Error::ErrDataChannelNotOpen))
    }

    pub(crate) fn protocol<S: Into<String>>(reason: S) -> Self {
        Error::Protocol(reason.into())
    }

    pub(crate) fn invalid_address<A: ToString>(addr: A, reason: &'static str) -> Self {
        Error::InvalidAddress {
            addr: addr.to_string(),
            reason,
        }
    }
}

impl From<webrtc::Error> for Error {
    fn from(value: webrtc::Error) -> Self {
        Error::Rtc(Arc::new(value))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Relay(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Json(Arc::new(value))
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(Arc::new(value))
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::ConnectionClosed | Error::SignalClosed => {
                std::io::Error::new(std::io::ErrorKind::NotConnected, value)
            }
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}
