//! ezbus-core — shared types for the ezbus MAC layer: addresses, the packet
//! wire format, the peer roster, and configuration.
//! All other ezbus crates depend on this one.

pub mod address;
pub mod config;
pub mod peer;
pub mod wire;

pub use address::{Address, AddressError, ADDRESS_SIZE};
pub use peer::{Peer, PeerRoster, RosterFingerprint};
pub use wire::{Packet, PacketType, WireError};
