//! ezbusd — runs one ezbus node on a multicast virtual bus.
//!
//! Lines read from stdin in the form `<address> <text>` are sent as parcels;
//! parcels addressed to this node are printed to stdout.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use ezbus_core::config::EzbusConfig;
use ezbus_core::{Address, PeerRoster};
use ezbus_mac::{BootHooks, Mac, NodeIdentity, Tick};

mod udp_port;

use udp_port::UdpBusPort;

/// Logs each membership the node confirms as warm boot initiator.
struct RosterLog;

impl BootHooks for RosterLog {
    fn on_roster_confirmed(&mut self, roster: &PeerRoster) {
        let peers: Vec<String> = roster.iter().map(|p| p.address.to_string()).collect();
        tracing::info!(count = peers.len(), peers = ?peers, "roster confirmed");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = EzbusConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = EzbusConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        EzbusConfig::default()
    });
    if let Some(interface) = std::env::args().nth(1) {
        config.port.interface = interface;
    }

    let mut rng = StdRng::from_entropy();
    let identity = match config.node_address()? {
        Some(address) => NodeIdentity::new(address),
        None => NodeIdentity::random(&mut rng),
    };
    tracing::info!(
        address = %identity.address,
        interface = %config.port.interface,
        "ezbusd starting"
    );

    let port = UdpBusPort::open(&config.port).context("failed to open virtual bus")?;
    let mut mac = Mac::with_hooks(identity, config.timing.clone(), port, rng, RosterLog);

    // Shutdown
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    // Outgoing parcels from stdin
    let (parcel_tx, mut parcel_rx) = mpsc::channel::<(Address, Bytes)>(16);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match parse_command(&line) {
                Ok(parcel) => {
                    if parcel_tx.send(parcel).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "expected: <address> <text>"),
            }
        }
    });

    let start = Instant::now();
    let mut tick = tokio::time::interval(Duration::from_millis(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut status = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                tracing::info!("shutting down");
                break;
            }
            _ = tick.tick() => {
                mac.poll(start.elapsed().as_millis() as Tick);
                if let Some(parcel) = mac.poll_parcel() {
                    println!("{} {}", parcel.peer, String::from_utf8_lossy(&parcel.payload));
                }
                if let Some(fault) = mac.take_fault() {
                    tracing::warn!(%fault, "delivery failed");
                }
            }
            Some((dst, payload)) = parcel_rx.recv() => {
                if let Err(e) = mac.submit_parcel(dst, payload) {
                    tracing::warn!(error = %e, peer = %dst, "parcel not queued");
                }
            }
            _ = status.tick() => {
                tracing::info!(
                    token = mac.token_held(),
                    peers = mac.roster().len(),
                    state = ?mac.boot_state(),
                    "status"
                );
            }
        }
    }

    mac.close();
    Ok(())
}

/// Parse `<address> <text>` into a parcel destination and payload.
fn parse_command(line: &str) -> Result<(Address, Bytes)> {
    let (address, text) = line
        .trim()
        .split_once(char::is_whitespace)
        .context("missing message text")?;
    let address: Address = address.parse().context("bad address")?;
    Ok((address, Bytes::copy_from_slice(text.trim_start().as_bytes())))
}
