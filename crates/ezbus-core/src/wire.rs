//! ezbus wire format — the on-wire packet layout.
//!
//! Every packet is a fixed 34-byte header followed by an optional payload.
//! The header is #[repr(C, packed)] with zerocopy derives so that encoding
//! and decoding never touch unsafe code. Only data parcels and speed changes
//! carry a payload; every other packet type is header-only.

use bytes::Bytes;
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::address::{Address, ADDRESS_SIZE};

// ── Header ────────────────────────────────────────────────────────────────────

/// Fixed packet header.
///
/// Wire size: 34 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct PacketHeader {
    /// Frame mark. Always PACKET_MARK; the receiver resynchronises on it.
    pub mark: u8,

    /// Wire format version. Currently 0x01.
    pub version: u8,

    /// PacketType discriminant.
    pub packet_type: u8,

    /// Sequence number. Wraps at 256.
    pub seq: u8,

    pub src: [u8; ADDRESS_SIZE],
    pub dst: [u8; ADDRESS_SIZE],

    /// Payload length in bytes, little-endian.
    pub length: [u8; 2],

    /// First four bytes of BLAKE3 over this header (with the checksum
    /// zeroed) followed by the payload.
    pub checksum: [u8; 4],
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(PacketHeader, [u8; 34]);

/// Size of PacketHeader on the wire.
pub const HEADER_SIZE: usize = 34;

/// First byte of every frame.
pub const PACKET_MARK: u8 = 0x55;

/// Current packet format version.
pub const PACKET_VERSION: u8 = 0x01;

/// Largest payload a single data parcel may carry.
pub const MAX_PAYLOAD: usize = 512;

/// Largest frame on the wire.
pub const MAX_FRAME: usize = HEADER_SIZE + MAX_PAYLOAD;

// ── Packet types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Reset = 0x00,
    TakeToken = 0x01,
    GiveToken = 0x02,
    Parcel = 0x03,
    Speed = 0x04,
    Ack = 0x05,
    Nack = 0x06,
    Hello = 0x07,
    Coldboot = 0x08,
    WarmbootRequest = 0x09,
    WarmbootReply = 0x0a,
    WarmbootAck = 0x0b,
}

impl PacketType {
    /// Packet types that may carry a payload.
    pub fn carries_payload(self) -> bool {
        matches!(self, PacketType::Parcel | PacketType::Speed)
    }

    /// Packet types that take part in the warm boot exchange.
    pub fn is_warmboot(self) -> bool {
        matches!(
            self,
            PacketType::WarmbootRequest | PacketType::WarmbootReply | PacketType::WarmbootAck
        )
    }
}

impl TryFrom<u8> for PacketType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => PacketType::Reset,
            0x01 => PacketType::TakeToken,
            0x02 => PacketType::GiveToken,
            0x03 => PacketType::Parcel,
            0x04 => PacketType::Speed,
            0x05 => PacketType::Ack,
            0x06 => PacketType::Nack,
            0x07 => PacketType::Hello,
            0x08 => PacketType::Coldboot,
            0x09 => PacketType::WarmbootRequest,
            0x0a => PacketType::WarmbootReply,
            0x0b => PacketType::WarmbootAck,
            other => return Err(WireError::UnknownPacketType(other)),
        })
    }
}

impl From<PacketType> for u8 {
    fn from(t: PacketType) -> u8 {
        t as u8
    }
}

// ── Packet ────────────────────────────────────────────────────────────────────

/// A decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub seq: u8,
    pub src: Address,
    pub dst: Address,
    pub payload: Bytes,
}

impl Packet {
    /// A header-only packet addressed to the broadcast address.
    pub fn new(packet_type: PacketType, seq: u8, src: Address) -> Self {
        Self {
            packet_type,
            seq,
            src,
            dst: Address::BROADCAST,
            payload: Bytes::new(),
        }
    }

    pub fn to(mut self, dst: Address) -> Self {
        self.dst = dst;
        self
    }

    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    /// The acknowledgment a receiver sends back for this packet.
    pub fn ack(&self) -> Packet {
        self.reply(PacketType::Ack)
    }

    /// The negative acknowledgment a receiver sends back for this packet.
    pub fn nack(&self) -> Packet {
        self.reply(PacketType::Nack)
    }

    fn reply(&self, packet_type: PacketType) -> Packet {
        Packet::new(packet_type, self.seq, self.dst).to(self.src)
    }

    /// Unicast data parcels and token hand-offs must be acknowledged.
    pub fn requires_ack(&self) -> bool {
        matches!(self.packet_type, PacketType::Parcel | PacketType::GiveToken)
            && !self.dst.is_reserved()
    }

    /// True if `ack` acknowledges this packet: same sequence, and the
    /// source/destination pair mirrored.
    pub fn is_answered_by(&self, ack: &Packet) -> bool {
        ack.seq == self.seq && ack.src == self.dst && ack.dst == self.src
    }

    /// Encode to a single frame.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge(self.payload.len()));
        }
        if !self.payload.is_empty() && !self.packet_type.carries_payload() {
            return Err(WireError::UnexpectedPayload(self.packet_type as u8));
        }

        let mut header = PacketHeader {
            mark: PACKET_MARK,
            version: PACKET_VERSION,
            packet_type: self.packet_type.into(),
            seq: self.seq,
            src: self.src.to_bytes(),
            dst: self.dst.to_bytes(),
            length: (self.payload.len() as u16).to_le_bytes(),
            checksum: [0u8; 4],
        };
        header.checksum = checksum(header.as_bytes(), &self.payload);

        let mut frame = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        frame.extend_from_slice(header.as_bytes());
        frame.extend_from_slice(&self.payload);
        Ok(frame)
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns the packet and the number of bytes it occupied.
    /// `WireError::Truncated` means the frame is not complete yet; any other
    /// error means the bytes at the front of `buf` are not a valid frame.
    pub fn decode_prefix(buf: &[u8]) -> Result<(Packet, usize), WireError> {
        match buf.first() {
            None => return Err(WireError::Truncated(HEADER_SIZE)),
            Some(&PACKET_MARK) => {}
            Some(&other) => return Err(WireError::BadMark(other)),
        }

        let mut header = PacketHeader::read_from_prefix(buf)
            .ok_or_else(|| WireError::Truncated(HEADER_SIZE - buf.len()))?;

        if header.version != PACKET_VERSION {
            return Err(WireError::UnknownVersion(header.version));
        }
        let packet_type = PacketType::try_from(header.packet_type)?;

        let length = u16::from_le_bytes(header.length) as usize;
        if length > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge(length));
        }
        if length > 0 && !packet_type.carries_payload() {
            return Err(WireError::UnexpectedPayload(header.packet_type));
        }

        let total = HEADER_SIZE + length;
        if buf.len() < total {
            return Err(WireError::Truncated(total - buf.len()));
        }
        let payload = &buf[HEADER_SIZE..total];

        let received = header.checksum;
        header.checksum = [0u8; 4];
        if checksum(header.as_bytes(), payload) != received {
            return Err(WireError::ChecksumMismatch);
        }

        let packet = Packet {
            packet_type,
            seq: header.seq,
            src: Address::from_bytes(header.src),
            dst: Address::from_bytes(header.dst),
            payload: Bytes::copy_from_slice(payload),
        };
        Ok((packet, total))
    }
}

fn checksum(header: &[u8], payload: &[u8]) -> [u8; 4] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(header);
    hasher.update(payload);
    let hash = hasher.finalize();
    let mut out = [0u8; 4];
    out.copy_from_slice(&hash.as_bytes()[..4]);
    out
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame incomplete, {0} more bytes needed")]
    Truncated(usize),

    #[error("bad frame mark: 0x{0:02x}")]
    BadMark(u8),

    #[error("unknown packet version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("unknown packet type: 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("payload length {0} exceeds maximum {}", MAX_PAYLOAD)]
    PayloadTooLarge(usize),

    #[error("packet type 0x{0:02x} cannot carry a payload")]
    UnexpectedPayload(u8),

    #[error("checksum mismatch")]
    ChecksumMismatch,
}

impl WireError {
    /// More bytes may still turn this into a valid frame.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, WireError::Truncated(_))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
