//! Local (LAN) discovery table: a bounded, unauthenticated record of peers
//! advertised by beacon broadcasts on the local network (§4.C).
//!
//! Entries here are advisory only — nothing in this table has been
//! cryptographically verified, and a discovered peer must still go
//! through the full handshake before it is trusted for anything.

use linked_hash_map::LinkedHashMap;

use crate::transport::Beacon;

/// Default capacity of a `DiscoveryTable` (§6).
pub const DEFAULT_CAPACITY: usize = 4;

/// One LAN-advertised peer, as last seen.
#[derive(Clone, Debug)]
pub struct DiscoveredPeer {
    pub alias: String,
    pub ruid: [u8; 32],
    pub rhid: [u8; 32],
    pub pubkey: [u8; 32],
    pub transport_addr: String,
    pub transport_port: u16,
}

impl From<Beacon> for DiscoveredPeer {
    fn from(b: Beacon) -> Self {
        DiscoveredPeer {
            alias: b.alias,
            ruid: b.ruid,
            rhid: b.rhid,
            pubkey: b.pubkey,
            transport_addr: b.transport_addr,
            transport_port: b.transport_port,
        }
    }
}

type PeerKey = ([u8; 32], [u8; 32]);

/// A fixed-capacity ring of discovered peers, keyed by `(ruid, rhid)`.
/// Once full, inserting a peer not already present evicts the
/// least-recently-inserted entry (§4.C, Non-goals: this table is not
/// persisted and carries no authentication).
///
/// Backed by a `LinkedHashMap` so eviction and refresh-in-place are both
/// O(1); a plain `Vec` would make eviction a linear scan for every insert
/// once the table is warm.
pub struct DiscoveryTable {
    capacity: usize,
    entries: LinkedHashMap<PeerKey, DiscoveredPeer>,
}

impl DiscoveryTable {
    pub fn new(capacity: usize) -> Self {
        DiscoveryTable {
            capacity: capacity.max(1),
            entries: LinkedHashMap::new(),
        }
    }

    /// Records a beacon sighting. If the peer (identified by `ruid`+`rhid`)
    /// is already known, its entry is refreshed in place; otherwise it is
    /// inserted, evicting the oldest entry first if the table is full.
    pub fn insert(&mut self, peer: DiscoveredPeer) {
        let key = (peer.ruid, peer.rhid);
        if self.entries.contains_key(&key) {
            self.entries.insert(key, peer);
            return;
        }
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.insert(key, peer);
    }

    pub fn find(&self, ruid: &[u8; 32], rhid: &[u8; 32]) -> Option<&DiscoveredPeer> {
        self.entries.get(&(*ruid, *rhid))
    }

    pub fn list(&self) -> Vec<&DiscoveredPeer> {
        self.entries.values().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for DiscoveryTable {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
