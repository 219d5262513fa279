//! Multiaddress shapes understood by the transport.
//!
//! A signaling address looks like `/dns4/relay.example.com/tcp/443/wss/p2p-webrtc-star`: a TCP
//! endpoint of the relay, the websocket flavour and the transport marker. A peer address is a
//! signaling address with the peer identity appended (`.../p2p-webrtc-star/p2p/<peer-id>`).

use libp2p_identity::PeerId;
use multiaddr::{Multiaddr, Protocol};
use url::Url;

use crate::error::Error;

/// Multicodec of the `p2p-webrtc-star` protocol.
pub const P_WEBRTC_STAR: u32 = 0x0113;

/// Checks if `addr` is a signaling address this transport can listen on or dial through.
pub fn is_signal_address(addr: &Multiaddr) -> bool {
    let mut iter = addr.iter();
    matches!(
        (iter.next(), iter.next(), iter.next(), iter.next(), iter.next()),
        (
            Some(
                Protocol::Dns(_)
                    | Protocol::Dns4(_)
                    | Protocol::Dns6(_)
                    | Protocol::Ip4(_)
                    | Protocol::Ip6(_)
            ),
            Some(Protocol::Tcp(_)),
            Some(Protocol::Ws(_) | Protocol::Wss(_)),
            Some(Protocol::P2pWebRtcStar),
            None,
        )
    )
}

/// Builds the websocket URL of the relay behind a signaling address.
pub fn relay_url(addr: &Multiaddr, url_path: &str) -> Result<Url, Error> {
    if !is_signal_address(addr) {
        return Err(Error::invalid_address(addr, "not a webrtc-star signaling address"));
    }

    let mut host = None;
    let mut port = None;
    let mut secure = false;
    for protocol in addr.iter() {
        match protocol {
            Protocol::Dns(name) | Protocol::Dns4(name) | Protocol::Dns6(name) => {
                host = Some(name.to_string())
            }
            Protocol::Ip4(ip) => host = Some(ip.to_string()),
            Protocol::Ip6(ip) => host = Some(format!("[{}]", ip)),
            Protocol::Tcp(p) => port = Some(p),
            Protocol::Wss(_) => secure = true,
            _ => {}
        }
    }
    let (host, port) = match (host, port) {
        (Some(host), Some(port)) => (host, port),
        _ => return Err(Error::invalid_address(addr, "missing relay host or port")),
    };

    let scheme = if secure { "wss" } else { "ws" };
    let url = Url::parse(&format!("{}://{}:{}{}", scheme, host, port, url_path))?;
    Ok(url)
}

/// Address under which `peer` is reachable through the relay behind `signal_addr`.
pub fn peer_address(signal_addr: &Multiaddr, peer: PeerId) -> Multiaddr {
    signal_addr.clone().with(Protocol::P2p(peer))
}

/// Splits a peer address into the peer identity and the signaling address it was announced on.
pub fn split_peer_address(peer_addr: &str) -> Result<(PeerId, Multiaddr), Error> {
    let mut addr: Multiaddr = peer_addr
        .parse()
        .map_err(|_| Error::invalid_address(peer_addr, "malformed multiaddress"))?;
    match addr.pop() {
        Some(Protocol::P2p(peer)) => Ok((peer, addr)),
        _ => Err(Error::invalid_address(peer_addr, "missing peer identity")),
    }
}
