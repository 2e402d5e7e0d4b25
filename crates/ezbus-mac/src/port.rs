//! The physical transport seam.
//!
//! A `Port` moves raw frame bytes on and off the shared medium. Opening is
//! the implementor's constructor. Every call is non-blocking.

#[derive(Debug, thiserror::Error)]
pub enum PortError {
    /// Nothing to read, or the line is busy. Not a fault.
    #[error("port not ready")]
    NotReady,

    /// Another node was transmitting at the same time.
    #[error("collision on the bus")]
    Collision,

    #[error("port closed")]
    Closed,

    #[error("port i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl PortError {
    pub fn is_not_ready(&self) -> bool {
        matches!(self, PortError::NotReady)
    }
}

pub trait Port {
    /// Put one whole frame on the bus.
    fn send(&mut self, frame: &[u8]) -> Result<(), PortError>;

    /// Read whatever bytes are available into `buf`.
    /// `PortError::NotReady` when there are none.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, PortError>;

    fn flush(&mut self) -> Result<(), PortError>;

    fn set_speed(&mut self, baud: u32) -> Result<(), PortError>;

    fn speed(&self) -> u32;

    fn close(&mut self);
}
