//! Bus timing derived from the line speed.

use ezbus_core::config::TimingConfig;
use ezbus_core::wire::HEADER_SIZE;
use rand::{Rng, RngCore};

use crate::timer::Tick;

/// Start bit, eight data bits, stop bit.
pub const BITS_PER_BYTE: u64 = 10;

/// Time to put `bytes` on the wire at `baud`, rounded up, never zero.
pub fn packet_time_ms(baud: u32, bytes: usize) -> Tick {
    let baud = u64::from(baud.max(1));
    let bits = bytes as u64 * BITS_PER_BYTE;
    (bits * 1000).div_ceil(baud).max(1)
}

/// Microseconds per byte.
pub fn byte_time_us(baud: u32) -> u64 {
    (BITS_PER_BYTE * 1_000_000).div_ceil(u64::from(baud.max(1)))
}

/// Time for the token to visit `peers` nodes: one give and one ack each.
pub fn ring_time_ms(baud: u32, peers: usize) -> Tick {
    peers.max(1) as Tick * 2 * packet_time_ms(baud, HEADER_SIZE)
}

/// Timing constants bound to the current line speed.
#[derive(Debug, Clone)]
pub struct Timing {
    config: TimingConfig,
    baud: u32,
}

impl Timing {
    pub fn new(config: TimingConfig, baud: u32) -> Self {
        Self { config, baud }
    }

    pub fn config(&self) -> &TimingConfig {
        &self.config
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn set_baud(&mut self, baud: u32) {
        self.baud = baud;
    }

    pub fn ring_time(&self, peers: usize) -> Tick {
        ring_time_ms(self.baud, peers)
    }

    /// Four round trips of a frame carrying `payload_len` bytes and its ack,
    /// but never less than the configured floor.
    pub fn ack_timeout(&self, payload_len: usize) -> Tick {
        let round_trip = packet_time_ms(self.baud, HEADER_SIZE + payload_len)
            + packet_time_ms(self.baud, HEADER_SIZE);
        (4 * round_trip).max(self.config.ack_timeout_floor_ms)
    }

    /// Quiet period before a silent node joins the cold boot contest.
    pub fn silent_period(&self, peers: usize, rng: &mut dyn RngCore) -> Tick {
        self.ring_time(peers)
            + between(
                rng,
                self.config.silent_jitter_min_ms,
                self.config.silent_jitter_max_ms,
            )
    }

    pub fn emit_delay(&self, rng: &mut dyn RngCore) -> Tick {
        between(rng, self.config.emit_min_ms, self.config.emit_max_ms)
    }

    pub fn reply_delay(&self, rng: &mut dyn RngCore) -> Tick {
        between(rng, self.config.warmboot_min_ms, self.config.warmboot_max_ms)
    }

    /// Length of one warm boot reply window.
    pub fn reply_window(&self) -> Tick {
        self.config.warmboot_max_ms
    }

    pub fn collision_backoff(&self, rng: &mut dyn RngCore) -> Tick {
        between(
            rng,
            self.config.collision_backoff_min_ms,
            self.config.collision_backoff_max_ms,
        )
    }
}

/// Uniform in `min..=max`. An inverted range yields `min`.
fn between(rng: &mut dyn RngCore, min: Tick, max: Tick) -> Tick {
    if max <= min {
        min
    } else {
        rng.gen_range(min..=max)
    }
}
