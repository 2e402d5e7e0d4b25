//! In-memory shared bus for tests and simulation.
//!
//! Every frame sent on a `SimPort` is appended to the receive stream of every
//! other attached port. A sender never hears its own frames. The bus can be
//! told to lose or collide upcoming frames, and ports can be detached to
//! model a node leaving.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::port::{Port, PortError};

#[derive(Debug, Default)]
struct Tap {
    rx: VecDeque<u8>,
    attached: bool,
}

#[derive(Debug, Default)]
struct BusInner {
    taps: Vec<Tap>,
    drop_frames: usize,
    collide_frames: usize,
    frames_sent: u64,
}

/// Handle to a simulated medium. Clones share the same bus.
#[derive(Debug, Clone, Default)]
pub struct SimBus {
    inner: Arc<Mutex<BusInner>>,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a new node.
    pub fn attach(&self, baud: u32) -> SimPort {
        let mut inner = self.lock();
        inner.taps.push(Tap {
            rx: VecDeque::new(),
            attached: true,
        });
        SimPort {
            bus: self.clone(),
            tap: inner.taps.len() - 1,
            baud,
        }
    }

    /// Cut a node off the bus. Its pending bytes are discarded.
    pub fn detach(&self, tap: usize) {
        if let Some(t) = self.lock().taps.get_mut(tap) {
            t.attached = false;
            t.rx.clear();
        }
    }

    /// Silently lose the next `n` frames.
    pub fn drop_next(&self, n: usize) {
        self.lock().drop_frames = n;
    }

    /// Fail the next `n` sends with `PortError::Collision`.
    pub fn collide_next(&self, n: usize) {
        self.lock().collide_frames = n;
    }

    /// Put raw bytes in front of every attached node, as line noise would.
    pub fn inject(&self, bytes: &[u8]) {
        for tap in self.lock().taps.iter_mut().filter(|t| t.attached) {
            tap.rx.extend(bytes);
        }
    }

    /// Frames delivered to the medium so far, lost ones included.
    pub fn frames_sent(&self) -> u64 {
        self.lock().frames_sent
    }
}

/// One node's connection to a `SimBus`.
#[derive(Debug)]
pub struct SimPort {
    bus: SimBus,
    tap: usize,
    baud: u32,
}

impl SimPort {
    /// Index to pass to `SimBus::detach`.
    pub fn tap(&self) -> usize {
        self.tap
    }

    fn attached(inner: &BusInner, tap: usize) -> bool {
        inner.taps.get(tap).is_some_and(|t| t.attached)
    }
}

impl Port for SimPort {
    fn send(&mut self, frame: &[u8]) -> Result<(), PortError> {
        let mut inner = self.bus.lock();
        if !Self::attached(&inner, self.tap) {
            return Err(PortError::Closed);
        }
        if inner.collide_frames > 0 {
            inner.collide_frames -= 1;
            return Err(PortError::Collision);
        }
        inner.frames_sent += 1;
        if inner.drop_frames > 0 {
            inner.drop_frames -= 1;
            return Ok(());
        }
        let me = self.tap;
        for (i, tap) in inner.taps.iter_mut().enumerate() {
            if i != me && tap.attached {
                tap.rx.extend(frame);
            }
        }
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, PortError> {
        let mut inner = self.bus.lock();
        if !Self::attached(&inner, self.tap) {
            return Err(PortError::Closed);
        }
        let rx = &mut inner.taps[self.tap].rx;
        if rx.is_empty() {
            return Err(PortError::NotReady);
        }
        let n = rx.len().min(buf.len());
        for (slot, byte) in buf.iter_mut().zip(rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn flush(&mut self) -> Result<(), PortError> {
        Ok(())
    }

    fn set_speed(&mut self, baud: u32) -> Result<(), PortError> {
        self.baud = baud;
        Ok(())
    }

    fn speed(&self) -> u32 {
        self.baud
    }

    fn close(&mut self) {
        self.bus.detach(self.tap);
    }
}
