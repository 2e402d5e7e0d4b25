//! Packet transceiver: one in-flight packet per direction.
//!
//! The transmitter owns a single slot. Packets that need an acknowledgment
//! stay in the slot until a matching ack arrives or the retry budget runs
//! out. The receiver turns the port's byte stream back into packets, one per
//! poll, and answers the ones addressed to this node.

use bytes::{Buf, BytesMut};
use ezbus_core::wire::{Packet, PacketType, WireError, MAX_FRAME, PACKET_MARK};
use ezbus_core::Address;

use crate::port::{Port, PortError};

// ── Transmitter ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitState {
    Empty,
    /// A packet is queued.
    Full,
    /// A token hand-off is queued.
    GiveToken,
    /// On the wire.
    Send,
    /// Sent before and queued again for a resend.
    TransitFull,
    WaitAck,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransmitFault {
    #[error("{packet_type:?} to {dst} unanswered after {tries} resends")]
    RetriesExhausted {
        packet_type: PacketType,
        dst: Address,
        tries: u32,
    },

    #[error("encode failed: {0}")]
    Encode(#[from] WireError),

    #[error("port failed: {0}")]
    Port(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransmitEvent {
    Sent {
        packet_type: PacketType,
        awaiting_ack: bool,
    },
    /// The medium was busy; the packet stays queued.
    Collision,
    Fault(TransmitFault),
}

/// Result of checking an ack or nack against the slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// Acknowledged; the slot is empty again and hands back what was sent.
    Delivered(Packet),
    /// Nacked; the packet is queued for a resend.
    Resend,
    /// Nacked with no resends left.
    Exhausted(Packet),
    /// Sequence or addresses do not match the packet in flight.
    Mismatch,
    /// Nothing is waiting for an ack.
    Unexpected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutOutcome {
    Resend,
    Exhausted(Packet),
    Idle,
}

#[derive(Debug)]
pub struct Transmitter {
    state: TransmitState,
    packet: Option<Packet>,
    resends: u32,
    max_resends: u32,
}

impl Transmitter {
    pub fn new(max_resends: u32) -> Self {
        Self {
            state: TransmitState::Empty,
            packet: None,
            resends: 0,
            max_resends,
        }
    }

    pub fn state(&self) -> TransmitState {
        self.state
    }

    pub fn is_empty(&self) -> bool {
        self.state == TransmitState::Empty
    }

    /// The packet in the slot, if any.
    pub fn packet(&self) -> Option<&Packet> {
        self.packet.as_ref()
    }

    /// Fill the slot. Hands the packet back if the slot is occupied.
    pub fn put(&mut self, packet: Packet) -> Result<(), Packet> {
        self.fill(packet, TransmitState::Full)
    }

    /// Queue a token hand-off.
    pub fn give_token(&mut self, packet: Packet) -> Result<(), Packet> {
        self.fill(packet, TransmitState::GiveToken)
    }

    fn fill(&mut self, packet: Packet, state: TransmitState) -> Result<(), Packet> {
        if !self.is_empty() {
            return Err(packet);
        }
        self.packet = Some(packet);
        self.resends = 0;
        self.state = state;
        Ok(())
    }

    /// Drop whatever is in the slot.
    pub fn reset(&mut self) {
        self.packet = None;
        self.resends = 0;
        self.state = TransmitState::Empty;
    }

    /// Send the queued packet, if there is one.
    pub fn run<P: Port + ?Sized>(&mut self, port: &mut P) -> Option<TransmitEvent> {
        let queued_as = self.state;
        if !matches!(
            queued_as,
            TransmitState::Full | TransmitState::GiveToken | TransmitState::TransitFull
        ) {
            return None;
        }
        let packet = self.packet.as_ref()?;

        let frame = match packet.encode() {
            Ok(frame) => frame,
            Err(e) => {
                self.reset();
                return Some(TransmitEvent::Fault(e.into()));
            }
        };
        let packet_type = packet.packet_type;
        let awaiting_ack = packet.requires_ack();

        self.state = TransmitState::Send;
        match port.send(&frame) {
            Ok(()) => {
                if awaiting_ack {
                    self.state = TransmitState::WaitAck;
                } else {
                    self.reset();
                }
                tracing::trace!(?packet_type, awaiting_ack, "sent");
                Some(TransmitEvent::Sent {
                    packet_type,
                    awaiting_ack,
                })
            }
            Err(PortError::NotReady) => {
                self.state = queued_as;
                None
            }
            Err(PortError::Collision) => {
                self.state = queued_as;
                Some(TransmitEvent::Collision)
            }
            Err(e) => {
                self.reset();
                Some(TransmitEvent::Fault(TransmitFault::Port(e.to_string())))
            }
        }
    }

    /// Match an incoming ack against the packet in flight.
    pub fn ack(&mut self, ack: &Packet) -> AckOutcome {
        match self.check(ack) {
            Some(outcome) => outcome,
            None => {
                let sent = self.packet.take();
                self.reset();
                match sent {
                    Some(packet) => AckOutcome::Delivered(packet),
                    None => AckOutcome::Unexpected,
                }
            }
        }
    }

    /// Match an incoming nack. A match costs one resend.
    pub fn nack(&mut self, nack: &Packet) -> AckOutcome {
        match self.check(nack) {
            Some(outcome) => outcome,
            None => match self.retry() {
                TimeoutOutcome::Exhausted(packet) => AckOutcome::Exhausted(packet),
                _ => AckOutcome::Resend,
            },
        }
    }

    fn check(&self, reply: &Packet) -> Option<AckOutcome> {
        if self.state != TransmitState::WaitAck {
            return Some(AckOutcome::Unexpected);
        }
        match &self.packet {
            Some(sent) if sent.is_answered_by(reply) => None,
            Some(_) => Some(AckOutcome::Mismatch),
            None => Some(AckOutcome::Unexpected),
        }
    }

    /// The ack timer ran out.
    pub fn ack_timeout(&mut self) -> TimeoutOutcome {
        if self.state != TransmitState::WaitAck {
            return TimeoutOutcome::Idle;
        }
        self.retry()
    }

    fn retry(&mut self) -> TimeoutOutcome {
        if self.resends >= self.max_resends {
            let packet = self.packet.take();
            self.reset();
            return match packet {
                Some(packet) => TimeoutOutcome::Exhausted(packet),
                None => TimeoutOutcome::Idle,
            };
        }
        self.resends += 1;
        self.state = TransmitState::TransitFull;
        TimeoutOutcome::Resend
    }

    pub fn resends(&self) -> u32 {
        self.resends
    }
}

// ── Receiver ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    Empty,
    /// A packet was decoded and is being dispatched.
    Full,
    /// Sending an ack or nack back.
    TransitToAck,
    WaitAckSent,
    ReceiveFault,
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiveFault {
    #[error("malformed frame: {0}")]
    Wire(#[from] WireError),
    #[error("port failed: {0}")]
    Port(#[from] PortError),
}

#[derive(Debug)]
pub enum ReceiveOutcome {
    Idle,
    Packet(Packet),
    /// A repeat of the last packet this node acknowledged. It has been
    /// answered again and must not be dispatched.
    Duplicate(Packet),
    Fault(ReceiveFault),
}

type PacketKey = (Address, PacketType, u8);

#[derive(Debug)]
pub struct Receiver {
    state: ReceiveState,
    stream: BytesMut,
    scratch: Box<[u8]>,
    /// Last packet acknowledged, for duplicate detection.
    last_acked: Option<PacketKey>,
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Receiver {
    pub fn new() -> Self {
        Self {
            state: ReceiveState::Empty,
            stream: BytesMut::with_capacity(MAX_FRAME * 2),
            scratch: vec![0u8; MAX_FRAME].into_boxed_slice(),
            last_acked: None,
        }
    }

    pub fn state(&self) -> ReceiveState {
        self.state
    }

    /// Bytes waiting to be decoded.
    pub fn buffered(&self) -> usize {
        self.stream.len()
    }

    /// Pull available bytes from the port and decode at most one packet.
    pub fn poll<P: Port + ?Sized>(&mut self, port: &mut P, local: Address) -> ReceiveOutcome {
        self.state = ReceiveState::Empty;
        match port.recv(&mut self.scratch) {
            Ok(n) => self.stream.extend_from_slice(&self.scratch[..n]),
            Err(PortError::NotReady) => {}
            Err(e) => {
                self.state = ReceiveState::ReceiveFault;
                return ReceiveOutcome::Fault(e.into());
            }
        }
        if self.stream.is_empty() {
            return ReceiveOutcome::Idle;
        }

        match Packet::decode_prefix(&self.stream) {
            Ok((packet, used)) => {
                self.stream.advance(used);
                self.state = ReceiveState::Full;
                if self.is_duplicate(&packet, local) {
                    ReceiveOutcome::Duplicate(packet)
                } else {
                    ReceiveOutcome::Packet(packet)
                }
            }
            Err(e) if e.is_incomplete() => ReceiveOutcome::Idle,
            Err(e) => {
                self.state = ReceiveState::ReceiveFault;
                self.resync();
                ReceiveOutcome::Fault(e.into())
            }
        }
    }

    /// Skip past the bad frame start to the next mark byte.
    fn resync(&mut self) {
        let skip = self.stream[1..]
            .iter()
            .position(|&b| b == PACKET_MARK)
            .map(|i| i + 1)
            .unwrap_or(self.stream.len());
        self.stream.advance(skip);
    }

    fn is_duplicate(&self, packet: &Packet, local: Address) -> bool {
        packet.requires_ack()
            && packet.dst == local
            && self.last_acked == Some((packet.src, packet.packet_type, packet.seq))
    }

    /// Acknowledge `received` and remember it for duplicate detection.
    pub fn send_ack<P: Port + ?Sized>(
        &mut self,
        port: &mut P,
        received: &Packet,
    ) -> Result<(), PortError> {
        self.last_acked = Some((received.src, received.packet_type, received.seq));
        self.reply(port, received.ack())
    }

    /// Refuse `received`. The sender will retry.
    pub fn send_nack<P: Port + ?Sized>(
        &mut self,
        port: &mut P,
        received: &Packet,
    ) -> Result<(), PortError> {
        self.reply(port, received.nack())
    }

    fn reply<P: Port + ?Sized>(&mut self, port: &mut P, reply: Packet) -> Result<(), PortError> {
        self.state = ReceiveState::TransitToAck;
        let frame = reply.encode().map_err(|e| {
            PortError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        let sent = port.send(&frame);
        self.state = ReceiveState::WaitAckSent;
        let flushed = sent.and_then(|()| port.flush());
        self.state = ReceiveState::Empty;
        flushed
    }

    /// Forget everything buffered and the duplicate history.
    pub fn reset(&mut self) {
        self.stream.clear();
        self.last_acked = None;
        self.state = ReceiveState::Empty;
    }
}
