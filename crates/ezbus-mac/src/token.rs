//! Token arbiter — who may transmit.
//!
//! Exactly one token exists on a healthy bus. `acquired` records whether
//! this node holds it; handing it on clears the flag before the receiver has
//! acknowledged, so at no point do two nodes believe they hold it.

use ezbus_core::wire::{Packet, PacketType};
use ezbus_core::{Address, PeerRoster};

use crate::mac::NodeIdentity;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GiveOutcome {
    /// This node is its own successor and keeps the token. Nothing is sent.
    SelfRetained,
    /// Send this give-token packet to the successor.
    Pass(Packet),
}

#[derive(Debug, Default)]
pub struct TokenArbiter {
    acquired: bool,
    token_seq: u8,
    /// Sender and sequence of the last give-token accepted.
    last_accepted: Option<(Address, u8)>,
    /// Times the token has come back around the ring to this node.
    ring_count: u32,
}

impl TokenArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn held(&self) -> bool {
        self.acquired
    }

    /// Returns true if the token was not already held.
    pub fn acquire(&mut self) -> bool {
        let fresh = !self.acquired;
        self.acquired = true;
        if fresh {
            tracing::info!("token acquired");
        }
        fresh
    }

    pub fn relinquish(&mut self) -> bool {
        let had = self.acquired;
        self.acquired = false;
        if had {
            tracing::debug!("token relinquished");
        }
        had
    }

    /// Hand the token to the ring successor.
    pub fn give(&mut self, identity: &NodeIdentity, roster: &PeerRoster) -> GiveOutcome {
        let next = roster.next(&identity.address);
        if next == identity.address {
            return GiveOutcome::SelfRetained;
        }
        self.token_seq = self.token_seq.wrapping_add(1);
        self.acquired = false;
        tracing::trace!(to = %next, seq = self.token_seq, "giving token");
        GiveOutcome::Pass(
            Packet::new(PacketType::GiveToken, self.token_seq, identity.address).to(next),
        )
    }

    /// A give-token was received. Returns true if it was for this node.
    pub fn accept(&mut self, packet: &Packet, identity: &NodeIdentity) -> bool {
        if packet.dst != identity.address {
            return false;
        }
        self.acquired = true;
        self.last_accepted = Some((packet.src, packet.seq));
        if packet.src > identity.address {
            self.ring_count = self.ring_count.wrapping_add(1);
        }
        tracing::trace!(from = %packet.src, seq = packet.seq, "token accepted");
        true
    }

    /// A take-token was received. Any other node claiming the bus voids our
    /// claim.
    pub fn take(&mut self, packet: &Packet, identity: &NodeIdentity) {
        if packet.dst != identity.address {
            self.relinquish();
        }
    }

    pub fn last_accepted(&self) -> Option<(Address, u8)> {
        self.last_accepted
    }

    pub fn ring_count(&self) -> u32 {
        self.ring_count
    }

    pub fn reset_ring_count(&mut self) {
        self.ring_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ezbus_core::ADDRESS_SIZE;

    fn addr(last: u8) -> Address {
        let mut bytes = [0x50; ADDRESS_SIZE];
        bytes[ADDRESS_SIZE - 1] = last;
        Address::from_bytes(bytes)
    }

    fn node(last: u8) -> NodeIdentity {
        NodeIdentity::new(addr(last))
    }

    #[test]
    fn lone_node_keeps_token() {
        let me = node(4);
        let roster = PeerRoster::new(me.address);
        let mut token = TokenArbiter::new();
        token.acquire();

        for _ in 0..3 {
            assert_eq!(token.give(&me, &roster), GiveOutcome::SelfRetained);
            assert!(token.held());
        }
    }

    #[test]
    fn give_targets_ring_successor_and_clears_flag() {
        let me = node(4);
        let mut roster = PeerRoster::new(me.address);
        roster.insort(addr(2), 0);
        roster.insort(addr(8), 0);

        let mut token = TokenArbiter::new();
        token.acquire();
        let GiveOutcome::Pass(packet) = token.give(&me, &roster) else {
            panic!("expected a hand-off");
        };
        assert_eq!(packet.packet_type, PacketType::GiveToken);
        assert_eq!(packet.src, addr(4));
        assert_eq!(packet.dst, addr(8));
        assert!(packet.requires_ack());
        assert!(!token.held());
    }

    #[test]
    fn highest_node_wraps_to_lowest() {
        let me = node(8);
        let mut roster = PeerRoster::new(me.address);
        roster.insort(addr(2), 0);
        roster.insort(addr(4), 0);

        let mut token = TokenArbiter::new();
        token.acquire();
        let GiveOutcome::Pass(packet) = token.give(&me, &roster) else {
            panic!("expected a hand-off");
        };
        assert_eq!(packet.dst, addr(2));
    }

    #[test]
    fn token_sequence_advances_per_hand_off() {
        let me = node(1);
        let mut roster = PeerRoster::new(me.address);
        roster.insort(addr(2), 0);
        let mut token = TokenArbiter::new();

        let seqs: Vec<u8> = (0..3)
            .map(|_| match token.give(&me, &roster) {
                GiveOutcome::Pass(p) => p.seq,
                GiveOutcome::SelfRetained => panic!("not alone"),
            })
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn accept_only_when_addressed() {
        let me = node(4);
        let mut token = TokenArbiter::new();

        let elsewhere = Packet::new(PacketType::GiveToken, 9, addr(2)).to(addr(6));
        assert!(!token.accept(&elsewhere, &me));
        assert!(!token.held());

        let mine = Packet::new(PacketType::GiveToken, 9, addr(2)).to(addr(4));
        assert!(token.accept(&mine, &me));
        assert!(token.held());
        assert_eq!(token.last_accepted(), Some((addr(2), 9)));
        assert_eq!(token.ring_count(), 0);
    }

    #[test]
    fn ring_pass_counted_when_token_wraps_back() {
        let me = node(2);
        let mut token = TokenArbiter::new();
        let from_top = Packet::new(PacketType::GiveToken, 1, addr(9)).to(addr(2));
        token.accept(&from_top, &me);
        token.accept(&from_top, &me);
        assert_eq!(token.ring_count(), 2);
        token.reset_ring_count();
        assert_eq!(token.ring_count(), 0);
    }

    #[test]
    fn take_token_from_elsewhere_relinquishes() {
        let me = node(4);
        let mut token = TokenArbiter::new();
        token.acquire();

        let claim = Packet::new(PacketType::TakeToken, 1, addr(2));
        token.take(&claim, &me);
        assert!(!token.held());
    }

    #[test]
    fn take_token_addressed_here_is_kept() {
        let me = node(4);
        let mut token = TokenArbiter::new();
        token.acquire();

        let claim = Packet::new(PacketType::TakeToken, 1, addr(2)).to(addr(4));
        token.take(&claim, &me);
        assert!(token.held());
    }
}
