//! Receive dispatcher — routes each decoded packet to its handler.
//!
//! Every packet, whatever its type, is also sniffed into the roster and
//! counts as bus activity for the silence watchdog. Outside warm boot, a
//! packet from a more dominant node also ends a cold boot contest.

use ezbus_core::wire::{Packet, PacketType};

use crate::bootstrap::{BootEvent, BootHooks};
use crate::mac::{Mac, Parcel};
use crate::port::Port;
use crate::transceiver::AckOutcome;

impl<P: Port, H: BootHooks> Mac<P, H> {
    pub(crate) fn dispatch(&mut self, packet: Packet) {
        tracing::trace!(
            packet_type = ?packet.packet_type,
            src = %packet.src,
            dst = %packet.dst,
            seq = packet.seq,
            "rx"
        );

        match packet.packet_type {
            PacketType::Reset => self.on_reset(&packet),
            PacketType::TakeToken => self.on_take_token(&packet),
            PacketType::GiveToken => self.on_give_token(&packet),
            PacketType::Parcel => self.on_parcel(&packet),
            PacketType::Speed => self.on_speed(&packet),
            PacketType::Ack => self.on_ack(&packet),
            PacketType::Nack => self.on_nack(&packet),
            PacketType::Hello => {}
            PacketType::Coldboot => self.boot_event(BootEvent::ColdbootSeen(&packet)),
            PacketType::WarmbootRequest | PacketType::WarmbootReply | PacketType::WarmbootAck => {
                self.boot_event(BootEvent::WarmbootSeen(&packet))
            }
        }

        self.sniff(&packet);
        self.boot_event(BootEvent::PeerSeen(&packet));
    }

    fn sniff(&mut self, packet: &Packet) {
        for address in [packet.src, packet.dst] {
            if self.roster.insort(address, packet.seq) {
                tracing::debug!(peer = %address, peers = self.roster.len(), "new peer");
            }
        }
    }

    fn on_reset(&mut self, packet: &Packet) {
        tracing::info!(from = %packet.src, "bus reset");
        self.reset_local();
    }

    fn on_take_token(&mut self, packet: &Packet) {
        self.token.take(packet, &self.identity);
        self.boot_event(BootEvent::TokenSeen(packet));
    }

    fn on_give_token(&mut self, packet: &Packet) {
        if packet.dst == self.identity.address {
            self.ack(packet);
            self.token.accept(packet, &self.identity);
        }
        self.boot_event(BootEvent::TokenSeen(packet));
    }

    fn on_parcel(&mut self, packet: &Packet) {
        if packet.dst != self.identity.address {
            return;
        }
        if self.inbox.is_some() {
            tracing::debug!(from = %packet.src, seq = packet.seq, "inbox full, refusing parcel");
            if let Err(e) = self.receiver.send_nack(&mut self.port, packet) {
                tracing::debug!(error = %e, "nack failed");
            }
            return;
        }
        self.ack(packet);
        self.inbox = Some(Parcel {
            peer: packet.src,
            payload: packet.payload.clone(),
        });
    }

    fn on_speed(&mut self, packet: &Packet) {
        let Ok(raw) = <[u8; 4]>::try_from(packet.payload.as_ref()) else {
            tracing::debug!(len = packet.payload.len(), "malformed speed change");
            return;
        };
        match u32::from_le_bytes(raw) {
            0 => tracing::debug!("ignoring speed change to zero"),
            baud => self.apply_speed(baud),
        }
    }

    fn on_ack(&mut self, packet: &Packet) {
        if packet.dst != self.identity.address {
            return;
        }
        match self.transmitter.ack(packet) {
            AckOutcome::Delivered(sent) => {
                self.timers.stop(self.ack_timer);
                tracing::trace!(packet_type = ?sent.packet_type, seq = sent.seq, "delivered");
            }
            AckOutcome::Mismatch => {
                tracing::debug!(from = %packet.src, seq = packet.seq, "ack does not match packet in flight");
            }
            AckOutcome::Unexpected => {
                tracing::debug!(from = %packet.src, seq = packet.seq, "unexpected ack");
            }
            AckOutcome::Resend | AckOutcome::Exhausted(_) => {}
        }
    }

    fn on_nack(&mut self, packet: &Packet) {
        if packet.dst != self.identity.address {
            return;
        }
        match self.transmitter.nack(packet) {
            AckOutcome::Resend => {
                self.timers.stop(self.ack_timer);
                tracing::debug!(from = %packet.src, "nacked, resending");
            }
            AckOutcome::Exhausted(sent) => self.retries_exhausted(sent),
            AckOutcome::Mismatch => {
                tracing::debug!(from = %packet.src, seq = packet.seq, "nack does not match packet in flight");
            }
            AckOutcome::Unexpected => {
                tracing::debug!(from = %packet.src, seq = packet.seq, "unexpected nack");
            }
            AckOutcome::Delivered(_) => {}
        }
    }

    fn ack(&mut self, packet: &Packet) {
        if let Err(e) = self.receiver.send_ack(&mut self.port, packet) {
            tracing::debug!(error = %e, "ack failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::BootState;
    use crate::mac::NodeIdentity;
    use crate::sim::{SimBus, SimPort};
    use crate::transceiver::{ReceiveOutcome, Receiver, TransmitState};
    use bytes::Bytes;
    use ezbus_core::config::TimingConfig;
    use ezbus_core::{Address, ADDRESS_SIZE};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn addr(last: u8) -> Address {
        let mut bytes = [0x80; ADDRESS_SIZE];
        bytes[ADDRESS_SIZE - 1] = last;
        Address::from_bytes(bytes)
    }

    /// A node under test plus a raw port standing in for a peer.
    fn setup() -> (Mac<SimPort>, SimPort) {
        let bus = SimBus::new();
        let mac = Mac::new(
            NodeIdentity::new(addr(5)),
            TimingConfig::default(),
            bus.attach(115_200),
            StdRng::seed_from_u64(3),
        );
        let peer = bus.attach(115_200);
        (mac, peer)
    }

    fn heard(peer: &mut SimPort) -> Option<Packet> {
        match Receiver::new().poll(peer, addr(9)) {
            ReceiveOutcome::Packet(p) => Some(p),
            _ => None,
        }
    }

    fn give_to_mac(seq: u8) -> Packet {
        Packet::new(PacketType::GiveToken, seq, addr(9)).to(addr(5))
    }

    #[test]
    fn every_packet_is_sniffed() {
        let (mut mac, _peer) = setup();
        let hello = Packet::new(PacketType::Hello, 1, addr(9)).to(addr(7));
        mac.dispatch(hello);
        assert_eq!(mac.roster().addresses(), vec![addr(5), addr(7), addr(9)]);
    }

    #[test]
    fn give_token_is_acked_and_accepted() {
        let (mut mac, mut peer) = setup();
        mac.dispatch(give_to_mac(4));
        assert!(mac.token_held());

        let ack = heard(&mut peer).expect("ack sent");
        assert_eq!(ack.packet_type, PacketType::Ack);
        assert!(give_to_mac(4).is_answered_by(&ack));
    }

    #[test]
    fn give_token_elsewhere_is_only_evidence() {
        let (mut mac, mut peer) = setup();
        let give = Packet::new(PacketType::GiveToken, 4, addr(9)).to(addr(7));
        mac.dispatch(give);
        assert!(!mac.token_held());
        assert!(heard(&mut peer).is_none());
        assert!(mac.roster().contains(&addr(7)));
    }

    #[test]
    fn take_token_from_another_node_drops_claim() {
        let (mut mac, _peer) = setup();
        mac.dispatch(give_to_mac(1));
        assert!(mac.token_held());

        mac.dispatch(Packet::new(PacketType::TakeToken, 2, addr(2)));
        assert!(!mac.token_held());
    }

    #[test]
    fn parcel_delivered_then_refused_while_inbox_full() {
        let (mut mac, mut peer) = setup();
        let parcel = |seq| {
            Packet::new(PacketType::Parcel, seq, addr(9))
                .to(addr(5))
                .with_payload(Bytes::from_static(b"hi"))
        };

        mac.dispatch(parcel(1));
        assert_eq!(heard(&mut peer).unwrap().packet_type, PacketType::Ack);

        mac.dispatch(parcel(2));
        assert_eq!(heard(&mut peer).unwrap().packet_type, PacketType::Nack);

        let delivered = mac.poll_parcel().unwrap();
        assert_eq!(delivered.peer, addr(9));
        assert_eq!(delivered.payload, Bytes::from_static(b"hi"));
        assert!(mac.poll_parcel().is_none());
    }

    #[test]
    fn speed_change_applies_to_port_and_timing() {
        let (mut mac, _peer) = setup();
        let speed = Packet::new(PacketType::Speed, 0, addr(9))
            .with_payload(Bytes::copy_from_slice(&9600u32.to_le_bytes()));
        mac.dispatch(speed);
        assert_eq!(mac.baud(), 9600);
        assert_eq!(mac.port().speed(), 9600);

        let bogus = Packet::new(PacketType::Speed, 0, addr(9))
            .with_payload(Bytes::from_static(b"xy"));
        mac.dispatch(bogus);
        assert_eq!(mac.baud(), 9600);
    }

    #[test]
    fn mismatched_ack_leaves_transmitter_waiting() {
        let (mut mac, _peer) = setup();
        let sent = Packet::new(PacketType::Parcel, 3, addr(5))
            .to(addr(9))
            .with_payload(Bytes::from_static(b"x"));
        mac.transmitter.put(sent.clone()).unwrap();
        mac.transmitter.run(&mut mac.port);
        assert_eq!(mac.transmitter.state(), TransmitState::WaitAck);

        let mut wrong = sent.ack();
        wrong.seq = 4;
        mac.dispatch(wrong);
        assert_eq!(mac.transmitter.state(), TransmitState::WaitAck);

        mac.dispatch(sent.ack());
        assert!(mac.transmitter.is_empty());
    }

    #[test]
    fn reset_drops_token_and_restarts_silence() {
        let (mut mac, _peer) = setup();
        mac.dispatch(give_to_mac(1));
        mac.dispatch(Packet::new(PacketType::Reset, 0, addr(9)));
        assert!(!mac.token_held());
        assert!(mac.transmitter.is_empty());
        assert_eq!(mac.boot_state(), BootState::SilentContinue);
    }
}
