//! Relay wire format.
//!
//! Every frame sent to the relay is a literal [MESSAGE_PREFIX] followed by a JSON array of
//! `[type, payload?]`. Inbound frames may carry arbitrary transport framing in front of the
//! JSON document; it is skipped up to the first `[` or `{`.

use multiaddr::Multiaddr;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::Error;

pub const MESSAGE_PREFIX: &str = "42";

const PING_MESSAGE_TYPE: &str = "ping";
const JOIN_MESSAGE_TYPE: &str = "ss-join";
const HANDSHAKE_MESSAGE_TYPE: &str = "ss-handshake";
const RELAYED_HANDSHAKE_MESSAGE_TYPE: &str = "ws-handshake";
const PEER_MESSAGE_TYPE: &str = "ws-peer";

/// Attributes of a single relay session, announced by the relay in its first frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionProperties {
    pub sid: String,
    #[serde(rename = "pingInterval")]
    pub ping_interval_millis: u64,
    #[serde(rename = "pingTimeout")]
    pub ping_timeout_millis: u64,
}

impl SessionProperties {
    pub fn parse(frame: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(payload(frame)?)?)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_millis)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_millis)
    }
}

/// Kind of the session description, serialized the same way browsers do.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Opaque session description exchanged during a handshake. The SDP body is never
/// inspected by the signaling layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer<S: Into<String>>(sdp: S) -> Self {
        SessionDescription {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer<S: Into<String>>(sdp: S) -> Self {
        SessionDescription {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Unit of the offer/answer exchange carried over the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeMessage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub intent_id: String,
    pub src_multiaddr: String,
    pub dst_multiaddr: String,
    pub signal: SessionDescription,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub answer: bool,
}

impl std::fmt::Display for HandshakeMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (intentID: {}, {} -> {})",
            if self.answer { "answer" } else { "offer" },
            self.intent_id,
            self.src_multiaddr,
            self.dst_multiaddr
        )
    }
}

/// Messages this peer sends to the relay.
#[derive(Debug, Clone, Copy)]
pub enum Outbound<'a> {
    /// Application level keepalive.
    Ping,
    /// Announces this peer's address to the relay's peer directory.
    Join(&'a Multiaddr),
    Handshake(&'a HandshakeMessage),
}

impl<'a> Outbound<'a> {
    pub fn encode(&self) -> Result<String, Error> {
        let body = match self {
            Outbound::Ping => serde_json::to_string(&(PING_MESSAGE_TYPE,))?,
            Outbound::Join(addr) => serde_json::to_string(&(JOIN_MESSAGE_TYPE, addr.to_string()))?,
            Outbound::Handshake(msg) => serde_json::to_string(&(HANDSHAKE_MESSAGE_TYPE, msg))?,
        };
        let mut frame = String::with_capacity(MESSAGE_PREFIX.len() + body.len());
        frame.push_str(MESSAGE_PREFIX);
        frame.push_str(&body);
        Ok(frame)
    }
}

/// Messages the relay delivers to this peer once a session is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Another peer joined the relay. Carries its address, including the `/p2p/<id>` suffix.
    PeerDiscovered(String),
    Handshake(HandshakeMessage),
}

impl Inbound {
    pub fn decode(frame: &str) -> Result<Self, Error> {
        let body = payload(frame)?;
        let mut parts: Vec<Value> = serde_json::from_str(body)
            .map_err(|_| Error::UnknownMessage(body.to_owned()))?;
        if parts.is_empty() {
            return Err(Error::UnknownMessage(body.to_owned()));
        }
        let data = if parts.len() > 1 {
            parts.swap_remove(1)
        } else {
            Value::Null
        };
        match parts[0].as_str() {
            Some(PEER_MESSAGE_TYPE) => match data {
                Value::String(addr) => Ok(Inbound::PeerDiscovered(addr)),
                _ => Err(Error::protocol("missing peer information")),
            },
            Some(RELAYED_HANDSHAKE_MESSAGE_TYPE) | Some(HANDSHAKE_MESSAGE_TYPE) => {
                Ok(Inbound::Handshake(serde_json::from_value(data)?))
            }
            _ => Err(Error::UnknownMessage(body.to_owned())),
        }
    }
}

/// Strips the transport framing in front of the JSON document.
pub fn payload(frame: &str) -> Result<&str, Error> {
    match frame.find(|c: char| c == '[' || c == '{') {
        Some(i) => Ok(&frame[i..]),
        None => Err(Error::protocol("message token not found")),
    }
}

/// Validates a frame the relay sends without any payload.
pub fn ensure_empty(frame: &str) -> Result<(), Error> {
    if frame.contains(|c: char| c == '[' || c == '{') {
        Err(Error::protocol("empty message expected"))
    } else {
        Ok(())
    }
}
