//! ezbus integration test harness.
//!
//! Tests here run several complete MAC instances on one simulated bus and
//! drive them with a shared millisecond clock. Nothing touches the network:
//!
//!   cargo test --test integration
//!
//! Every step checks that no two attached nodes believe they hold the token.

mod membership;
mod ring;

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;

use ezbus_core::config::TimingConfig;
use ezbus_core::{Address, ADDRESS_SIZE};
use ezbus_mac::{Mac, NodeIdentity, Parcel, SimBus, SimPort, Tick};

// ── Harness ───────────────────────────────────────────────────────────────────

pub const BAUD: u32 = 115_200;

/// Test address whose last byte is `last`. Lower `last` dominates.
pub fn addr(last: u8) -> Address {
    let mut bytes = [0x42; ADDRESS_SIZE];
    bytes[ADDRESS_SIZE - 1] = last;
    Address::from_bytes(bytes)
}

pub struct Node {
    pub mac: Mac<SimPort>,
    pub attached: bool,
    /// Parcels delivered to this node, in arrival order.
    pub delivered: Vec<Parcel>,
}

pub struct Cluster {
    pub bus: SimBus,
    pub nodes: Vec<Node>,
    pub now: Tick,
}

impl Cluster {
    pub fn new(lasts: &[u8]) -> Self {
        let mut cluster = Self {
            bus: SimBus::new(),
            nodes: Vec::new(),
            now: 0,
        };
        for &last in lasts {
            cluster.add(last);
        }
        cluster
    }

    /// Power up a node with the default timing. Returns its index.
    pub fn add(&mut self, last: u8) -> usize {
        let mac = Mac::new(
            NodeIdentity::new(addr(last)),
            TimingConfig::default(),
            self.bus.attach(BAUD),
            StdRng::seed_from_u64(0xeb05 + u64::from(last)),
        );
        self.nodes.push(Node {
            mac,
            attached: true,
            delivered: Vec::new(),
        });
        self.nodes.len() - 1
    }

    /// Pull a node off the bus. It is no longer polled.
    pub fn detach(&mut self, index: usize) {
        let node = &mut self.nodes[index];
        self.bus.detach(node.mac.port().tap());
        node.attached = false;
    }

    pub fn live(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.attached)
    }

    /// Indices of attached nodes holding the token.
    pub fn holders(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.attached && n.mac.token_held())
            .map(|(i, _)| i)
            .collect()
    }

    /// Advance the clock by one millisecond, polling every attached node.
    pub fn step(&mut self) -> Result<()> {
        for node in self.nodes.iter_mut().filter(|n| n.attached) {
            node.mac.poll(self.now);
            if let Some(parcel) = node.mac.poll_parcel() {
                node.delivered.push(parcel);
            }
        }
        let holders = self.holders();
        if holders.len() > 1 {
            bail!("at {} ms nodes {:?} all hold the token", self.now, holders);
        }
        self.now += 1;
        Ok(())
    }

    pub fn run_for(&mut self, ms: Tick) -> Result<()> {
        for _ in 0..ms {
            self.step()?;
        }
        Ok(())
    }

    /// Step until `done` holds. Fails after `limit` ms.
    pub fn run_until(&mut self, limit: Tick, done: impl Fn(&Cluster) -> bool) -> Result<Tick> {
        let deadline = self.now + limit;
        while self.now < deadline {
            self.step()?;
            if done(self) {
                return Ok(self.now);
            }
        }
        bail!("condition not reached within {limit} ms");
    }

    /// Addresses of every attached node, in roster order.
    pub fn live_addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = self.live().map(|n| n.mac.identity().address).collect();
        addresses.sort();
        addresses
    }

    /// Nobody booting and every roster lists exactly the attached nodes.
    ///
    /// A node that accepts the token usually hands it on within the same
    /// poll, so between steps the token is most often in flight and
    /// `holders()` is empty.
    pub fn converged(&self) -> bool {
        let expected = self.live_addresses();
        self.live().all(|n| {
            n.mac.boot_state().is_silent() && n.mac.roster().addresses() == expected
        })
    }

    pub fn converge(&mut self) -> Result<Tick> {
        self.run_until(30_000, Cluster::converged)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[test]
fn test_address_helper_orders_by_last_byte() {
    assert!(addr(1).dominates(&addr(2)));
    assert!(!addr(3).dominates(&addr(2)));
    assert!(!addr(1).is_reserved());
}
