//! `wrtc-star` is a WebRTC-star transport: two peers which can only reach a shared signaling
//! relay negotiate a direct WebRTC data channel through it and use that channel as a
//! multiplexed byte-stream connection.
//!
//! - The relay connection is kept alive and transparently re-established when it breaks.
//! - Many concurrent offer/answer handshakes share one relay connection; every offer is
//!   correlated with its answer by a random intent identifier.
//! - Connections build their multiplexed connection lazily, on the first stream opened or
//!   accepted.
//!
//! The relay speaks the same message format as the `libp2p-webrtc-star` signaling server, so
//! peers built with this crate can meet peers built with other implementations of it.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use libp2p_identity::PeerId;
//! use multiaddr::Multiaddr;
//! use tokio::io::AsyncWriteExt;
//! use wrtc_star::{DirectMultiplexer, Error, MemoryAddressBook, Transport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let relay: Multiaddr = "/dns4/localhost/tcp/9090/ws/p2p-webrtc-star".parse().unwrap();
//!     let transport = Transport::builder(
//!         PeerId::random(),
//!         Arc::new(MemoryAddressBook::new()),
//!         Arc::new(DirectMultiplexer),
//!     )
//!     .build()?;
//!
//!     // announce ourselves on the relay and accept incoming connections
//!     let listener = transport.listen(&relay)?;
//!     tokio::spawn(async move {
//!         while let Ok(conn) = listener.accept().await {
//!             println!("accepted {}", conn);
//!         }
//!     });
//!
//!     // dial a peer known to the same relay
//!     let remote = PeerId::random();
//!     let conn = transport.dial(&relay, remote).await?;
//!     let mut stream = conn.open_stream().await?;
//!     stream.write_all(b"Hello world!").await?;
//!     conn.close().await?;
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod address_book;
mod client;
pub mod connection;
pub mod data_channel;
pub mod error;
pub mod handshake;
pub mod message;
pub mod mux;
pub mod peer_connection;
pub mod relay;
pub mod rtc;
pub mod signal;
pub mod stream;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_util;

pub use address_book::{AddressBook, MemoryAddressBook};
pub use connection::{Connection, ConnectionConfig};
pub use data_channel::DataChannel;
pub use error::Error;
pub use message::{HandshakeMessage, SessionDescription};
pub use mux::{DirectMultiplexer, Multiplexer, MuxedConn, MuxedStream};
pub use peer_connection::{Options, PeerConnection, WebRtcEngine};
pub use relay::{RelayConnector, WebSocketConnector};
pub use rtc::{PeerLink, RawChannel, RtcEngine};
pub use signal::SignalConfig;
pub use stream::DataStream;
pub use transport::{Listener, Transport, TransportBuilder};

use rand::Rng;

/// Random identifier used to correlate log lines and handshakes, e.g. `intent-1f0c...`.
pub(crate) fn random_id(namespace: &str) -> String {
    let n: u128 = rand::thread_rng().gen();
    format!("{}-{:032x}", namespace, n)
}
