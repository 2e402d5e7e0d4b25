//! ezbus-mac — media access control for a shared half-duplex bus.
//!
//! Nodes agree on a single token holder without a master: they boot through
//! silence, a cold boot contest and a warm boot membership round, then pass
//! the token around the ring of addresses. Everything runs from
//! `Mac::poll(now)` on the caller's thread.

pub mod bootstrap;
pub mod dispatch;
pub mod mac;
pub mod port;
pub mod sim;
pub mod timer;
pub mod timing;
pub mod token;
pub mod transceiver;

pub use bootstrap::{BootHooks, BootState, NoopHooks};
pub use mac::{Mac, MacError, NodeIdentity, Parcel};
pub use port::{Port, PortError};
pub use sim::{SimBus, SimPort};
pub use timer::Tick;
pub use transceiver::TransmitFault;
