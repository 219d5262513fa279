use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use libp2p_identity::PeerId;
use log::debug;
use multiaddr::Multiaddr;
use parking_lot::Mutex;

/// Sink for peer addresses learned from the relay's peer directory.
pub trait AddressBook: Send + Sync {
    /// Records that `peer` is reachable under `addr` for the next `ttl`.
    fn add_addr(&self, peer: &PeerId, addr: Multiaddr, ttl: Duration);
}

/// Decorator which keeps the relay from echoing our own announcement into the address book.
pub(crate) struct SelfIgnoringAddressBook {
    inner: Arc<dyn AddressBook>,
    own_peer_id: PeerId,
}

impl SelfIgnoringAddressBook {
    pub(crate) fn new(inner: Arc<dyn AddressBook>, own_peer_id: PeerId) -> Self {
        SelfIgnoringAddressBook { inner, own_peer_id }
    }
}

impl AddressBook for SelfIgnoringAddressBook {
    fn add_addr(&self, peer: &PeerId, addr: Multiaddr, ttl: Duration) {
        if *peer == self.own_peer_id {
            debug!("Do not add own peer ID to the address book (ID: {})", peer);
            return;
        }
        self.inner.add_addr(peer, addr, ttl)
    }
}

/// In-memory address book with per-address expiry.
#[derive(Debug, Default)]
pub struct MemoryAddressBook {
    peers: Mutex<HashMap<PeerId, HashMap<Multiaddr, Instant>>>,
}

impl MemoryAddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Addresses of `peer` which did not expire yet.
    pub fn addrs(&self, peer: &PeerId) -> Vec<Multiaddr> {
        let now = Instant::now();
        let peers = self.peers.lock();
        match peers.get(peer) {
            None => Vec::new(),
            Some(addrs) => addrs
                .iter()
                .filter(|(_, expires)| **expires > now)
                .map(|(addr, _)| addr.clone())
                .collect(),
        }
    }

    /// Expiry of a single address, if it is known.
    pub fn expires_at(&self, peer: &PeerId, addr: &Multiaddr) -> Option<Instant> {
        self.peers.lock().get(peer)?.get(addr).copied()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.lock().keys().copied().collect()
    }
}

impl AddressBook for MemoryAddressBook {
    fn add_addr(&self, peer: &PeerId, addr: Multiaddr, ttl: Duration) {
        let expires = Instant::now() + ttl;
        let mut peers = self.peers.lock();
        let addrs = peers.entry(*peer).or_default();
        let entry = addrs.entry(addr).or_insert(expires);
        if *entry < expires {
            *entry = expires;
        }
    }
}
