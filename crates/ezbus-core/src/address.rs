//! Node addresses.
//!
//! An address is a 12-byte opaque bit pattern. Addresses are totally ordered
//! by big-endian numeric comparison, and that order does double duty: it is
//! the ring order the token follows, and it decides every tie-break. A
//! numerically lower address is the more dominant one.

use std::fmt;
use std::str::FromStr;

use rand::Rng;

/// Width of an address on the wire.
pub const ADDRESS_SIZE: usize = 12;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address([u8; ADDRESS_SIZE]);

impl Address {
    /// Every node accepts packets sent here.
    pub const BROADCAST: Address = Address([0xff; ADDRESS_SIZE]);

    /// Stands in for the warm boot initiator. Requests and acks are sent
    /// from it, replies are sent to it.
    pub const WARMBOOT: Address = Address([0x00; ADDRESS_SIZE]);

    pub const fn from_bytes(bytes: [u8; ADDRESS_SIZE]) -> Self {
        Self(bytes)
    }

    pub const fn to_bytes(self) -> [u8; ADDRESS_SIZE] {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_SIZE] {
        &self.0
    }

    /// Draw a fresh node address. Never returns a reserved value.
    ///
    /// Two nodes drawing the same address is possible and accepted.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        loop {
            let mut bytes = [0u8; ADDRESS_SIZE];
            rng.fill_bytes(&mut bytes);
            let address = Address(bytes);
            if !address.is_reserved() {
                return address;
            }
        }
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_warmboot(&self) -> bool {
        *self == Self::WARMBOOT
    }

    pub fn is_reserved(&self) -> bool {
        self.is_broadcast() || self.is_warmboot()
    }

    /// True if `self` wins a tie-break against `other`.
    pub fn dominates(&self, other: &Address) -> bool {
        self < other
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            f.write_str("Address(broadcast)")
        } else if self.is_warmboot() {
            f.write_str("Address(warmboot)")
        } else {
            write!(f, "Address({})", hex::encode(self.0))
        }
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s.trim()).map_err(|_| AddressError::NotHex(s.to_string()))?;
        let bytes: [u8; ADDRESS_SIZE] = raw
            .as_slice()
            .try_into()
            .map_err(|_| AddressError::WrongLength(raw.len()))?;
        Ok(Address(bytes))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("address is not hex: {0:?}")]
    NotHex(String),

    #[error("address must be {} bytes, got {0}", ADDRESS_SIZE)]
    WrongLength(usize),
}
