//! Peer roster — every node this node has seen on the bus.
//!
//! The roster is kept sorted by address so that ring order falls out of a
//! linear scan, and the fingerprint of two rosters holding the same set of
//! addresses is the same regardless of the order they were learned in.

use std::fmt;

use crate::address::Address;

/// A node seen on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub address: Address,

    /// Sequence of the last packet this peer was seen in. `clean` compares
    /// against it to drop peers that missed the current warm boot session.
    pub seen_seq: u8,
}

/// BLAKE3 digest over the ordered roster addresses.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RosterFingerprint(pub [u8; 32]);

impl fmt::Debug for RosterFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RosterFingerprint({})", hex::encode(&self.0[..8]))
    }
}

#[derive(Debug, Clone)]
pub struct PeerRoster {
    local: Address,
    peers: Vec<Peer>,
}

impl PeerRoster {
    /// A roster holding only the local node.
    pub fn new(local: Address) -> Self {
        Self {
            local,
            peers: vec![Peer {
                address: local,
                seen_seq: 0,
            }],
        }
    }

    pub fn local(&self) -> Address {
        self.local
    }

    /// Insert or restamp a peer. Returns true if the address was new.
    ///
    /// Reserved addresses are ignored.
    pub fn insort(&mut self, address: Address, seen_seq: u8) -> bool {
        if address.is_reserved() {
            return false;
        }
        match self.peers.binary_search_by(|p| p.address.cmp(&address)) {
            Ok(i) => {
                self.peers[i].seen_seq = seen_seq;
                false
            }
            Err(i) => {
                self.peers.insert(i, Peer { address, seen_seq });
                true
            }
        }
    }

    /// Drop every peer not seen in session `seq`. The local node stays and
    /// is restamped with `seq`.
    pub fn clean(&mut self, seq: u8) {
        let local = self.local;
        self.peers
            .retain(|p| p.address == local || p.seen_seq == seq);
        if let Some(me) = self.peers.iter_mut().find(|p| p.address == local) {
            me.seen_seq = seq;
        }
    }

    /// Forget everyone but the local node.
    pub fn reset(&mut self, seq: u8) {
        self.peers.clear();
        self.peers.push(Peer {
            address: self.local,
            seen_seq: seq,
        });
    }

    /// Ring successor of `address`: the next strictly greater address,
    /// wrapping to the smallest. A lone node is its own successor.
    pub fn next(&self, address: &Address) -> Address {
        self.peers
            .iter()
            .map(|p| p.address)
            .find(|a| a > address)
            .or_else(|| self.peers.first().map(|p| p.address))
            .unwrap_or(self.local)
    }

    pub fn fingerprint(&self) -> RosterFingerprint {
        let mut hasher = blake3::Hasher::new();
        for peer in &self.peers {
            hasher.update(peer.address.as_bytes());
        }
        RosterFingerprint(*hasher.finalize().as_bytes())
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.peers
            .binary_search_by(|p| p.address.cmp(address))
            .is_ok()
    }

    pub fn get(&self, address: &Address) -> Option<&Peer> {
        self.peers
            .binary_search_by(|p| p.address.cmp(address))
            .ok()
            .map(|i| &self.peers[i])
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Never true; the local node is always present.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.peers.iter().map(|p| p.address).collect()
    }
}
