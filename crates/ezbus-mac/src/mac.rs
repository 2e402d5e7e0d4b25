//! The MAC engine for one node.
//!
//! `Mac::poll(now)` is the whole scheduler. Each call sweeps the timers, takes
//! at most one packet off the port and dispatches it, lets the bootstrap
//! machine settle, and finally moves at most one packet onto the port.

use bytes::Bytes;
use ezbus_core::config::TimingConfig;
use ezbus_core::wire::{Packet, PacketType, MAX_PAYLOAD};
use ezbus_core::{Address, PeerRoster};
use rand::rngs::StdRng;
use rand::Rng;

use crate::bootstrap::{BootAction, BootContext, BootEvent, BootHooks, BootState, BootTimer, Bootstrap, NoopHooks};
use crate::port::Port;
use crate::timer::{Tick, TimerEngine, TimerId};
use crate::timing::Timing;
use crate::token::{GiveOutcome, TokenArbiter};
use crate::transceiver::{
    ReceiveOutcome, Receiver, TimeoutOutcome, TransmitEvent, TransmitFault, Transmitter,
};

/// Who this node is on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeIdentity {
    pub address: Address,
}

impl NodeIdentity {
    pub fn new(address: Address) -> Self {
        Self { address }
    }

    /// A fresh identity with a random, non-reserved address.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self::new(Address::random(rng))
    }
}

/// Application data crossing the MAC boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parcel {
    /// Destination when submitted, sender when received.
    pub peer: Address,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MacError {
    #[error("a parcel is already waiting to be sent")]
    Busy,

    #[error("payload of {0} bytes exceeds maximum {}", MAX_PAYLOAD)]
    PayloadTooLarge(usize),

    #[error("cannot send a parcel to reserved address {0:?}")]
    ReservedDestination(Address),

    #[error("bus speed must be non-zero")]
    InvalidSpeed,
}

pub struct Mac<P: Port, H: BootHooks = NoopHooks> {
    pub(crate) identity: NodeIdentity,
    pub(crate) timing: Timing,
    pub(crate) port: P,
    pub(crate) timers: TimerEngine,
    boot_timers: [TimerId; 4],
    pub(crate) ack_timer: TimerId,
    pub(crate) roster: PeerRoster,
    pub(crate) transmitter: Transmitter,
    pub(crate) receiver: Receiver,
    pub(crate) token: TokenArbiter,
    boot: Bootstrap,
    hooks: H,
    rng: StdRng,
    pub(crate) inbox: Option<Parcel>,
    outbox: Option<Parcel>,
    parcel_seq: u8,
    pending_speed: Option<u32>,
    speed_in_flight: Option<u32>,
    pub(crate) last_fault: Option<TransmitFault>,
    now: Tick,
    backoff_until: Option<Tick>,
    /// This node put something on the bus, or kept the token, this cycle.
    active: bool,
}

impl<P: Port> Mac<P, NoopHooks> {
    pub fn new(identity: NodeIdentity, config: TimingConfig, port: P, rng: StdRng) -> Self {
        Self::with_hooks(identity, config, port, rng, NoopHooks)
    }
}

impl<P: Port, H: BootHooks> Mac<P, H> {
    pub fn with_hooks(
        identity: NodeIdentity,
        config: TimingConfig,
        port: P,
        rng: StdRng,
        hooks: H,
    ) -> Self {
        let mut timers = TimerEngine::new();
        let boot_timers = BootTimer::ALL.map(|t| timers.add(t.key(), 0, true));
        let ack_timer = timers.add("ack", 0, true);
        let retransmit_tries = config.retransmit_tries;
        let timing = Timing::new(config, port.speed());

        tracing::info!(address = %identity.address, baud = timing.baud(), "mac starting");

        Self {
            identity,
            timing,
            port,
            timers,
            boot_timers,
            ack_timer,
            roster: PeerRoster::new(identity.address),
            transmitter: Transmitter::new(retransmit_tries),
            receiver: Receiver::new(),
            token: TokenArbiter::new(),
            boot: Bootstrap::new(identity.address),
            hooks,
            rng,
            inbox: None,
            outbox: None,
            parcel_seq: 0,
            pending_speed: None,
            speed_in_flight: None,
            last_fault: None,
            now: 0,
            backoff_until: None,
            active: false,
        }
    }

    // ── Upward API ────────────────────────────────────────────────────────────

    /// Queue a parcel for `dst`. It goes out the next time this node holds
    /// the token.
    pub fn submit_parcel(&mut self, dst: Address, payload: impl Into<Bytes>) -> Result<(), MacError> {
        let payload = payload.into();
        if dst.is_reserved() {
            return Err(MacError::ReservedDestination(dst));
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(MacError::PayloadTooLarge(payload.len()));
        }
        if self.outbox.is_some() {
            return Err(MacError::Busy);
        }
        self.outbox = Some(Parcel { peer: dst, payload });
        Ok(())
    }

    /// Take the parcel delivered to this node, if any.
    pub fn poll_parcel(&mut self) -> Option<Parcel> {
        self.inbox.take()
    }

    /// True while a submitted parcel has not been handed to the transmitter.
    pub fn outbox_full(&self) -> bool {
        self.outbox.is_some()
    }

    pub fn token_held(&self) -> bool {
        self.token.held()
    }

    /// Sender and sequence of the last give-token this node accepted.
    pub fn last_token(&self) -> Option<(Address, u8)> {
        self.token.last_accepted()
    }

    pub fn roster(&self) -> &PeerRoster {
        &self.roster
    }

    pub fn last_fault(&self) -> Option<&TransmitFault> {
        self.last_fault.as_ref()
    }

    pub fn take_fault(&mut self) -> Option<TransmitFault> {
        self.last_fault.take()
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn boot_state(&self) -> BootState {
        self.boot.state()
    }

    pub fn baud(&self) -> u32 {
        self.timing.baud()
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Announce a new bus speed. Sent the next time this node holds the
    /// token and applied locally once it is on the wire.
    pub fn change_speed(&mut self, baud: u32) -> Result<(), MacError> {
        if baud == 0 {
            return Err(MacError::InvalidSpeed);
        }
        self.pending_speed = Some(baud);
        Ok(())
    }

    /// Broadcast a reset and restart this node from silence. The reset is
    /// queued after the local restart, so a busy bus only delays it.
    pub fn reset_bus(&mut self) {
        self.reset_local();
        let reset = Packet::new(PacketType::Reset, 0, self.identity.address);
        self.emit(reset);
    }

    pub fn close(&mut self) {
        self.port.close();
    }

    // ── Scheduler ─────────────────────────────────────────────────────────────

    pub fn poll(&mut self, now: Tick) {
        self.now = now;
        self.active = false;
        if self.backoff_until.is_some_and(|until| now >= until) {
            self.backoff_until = None;
        }

        for id in self.timers.sweep(now) {
            if id == self.ack_timer {
                self.on_ack_timeout();
            } else if let Some(timer) = self.boot_timer_of(id) {
                self.boot_event(BootEvent::TimerExpired(timer));
            }
        }

        self.receive();
        self.boot_event(BootEvent::Tick);
        self.produce();
        self.transmit();

        if self.active {
            self.boot_event(BootEvent::BusActivity);
        }
    }

    fn receive(&mut self) {
        match self.receiver.poll(&mut self.port, self.identity.address) {
            ReceiveOutcome::Idle => {}
            ReceiveOutcome::Packet(packet) => self.dispatch(packet),
            ReceiveOutcome::Duplicate(packet) => {
                tracing::debug!(
                    peer = %packet.src,
                    seq = packet.seq,
                    packet_type = ?packet.packet_type,
                    "duplicate, acking again"
                );
                if let Err(e) = self.receiver.send_ack(&mut self.port, &packet) {
                    tracing::debug!(error = %e, "re-ack failed");
                }
                self.boot_event(BootEvent::BusActivity);
            }
            ReceiveOutcome::Fault(fault) => {
                tracing::debug!(error = %fault, "receive fault");
            }
        }
    }

    /// Hand the token holder's next packet to the transmitter.
    fn produce(&mut self) {
        if !self.token.held()
            || !self.transmitter.is_empty()
            || !self.boot.is_settled()
            || self.backoff_until.is_some()
        {
            return;
        }

        if let Some(baud) = self.pending_speed.take() {
            let packet = Packet::new(PacketType::Speed, 0, self.identity.address)
                .with_payload(Bytes::copy_from_slice(&baud.to_le_bytes()));
            self.speed_in_flight = Some(baud);
            self.put(packet);
            return;
        }

        if let Some(parcel) = self.outbox.take() {
            self.parcel_seq = self.parcel_seq.wrapping_add(1);
            let packet = Packet::new(PacketType::Parcel, self.parcel_seq, self.identity.address)
                .to(parcel.peer)
                .with_payload(parcel.payload);
            self.put(packet);
            return;
        }

        let refresh_rings = self.timing.config().refresh_rings;
        if refresh_rings > 0 && self.token.ring_count() >= refresh_rings {
            self.token.reset_ring_count();
            self.boot_event(BootEvent::Refresh);
            return;
        }

        match self.token.give(&self.identity, &self.roster) {
            GiveOutcome::SelfRetained => self.active = true,
            GiveOutcome::Pass(packet) => {
                if let Err(packet) = self.transmitter.give_token(packet) {
                    tracing::debug!(seq = packet.seq, "transmit slot busy, token kept");
                    self.token.acquire();
                }
            }
        }
    }

    fn put(&mut self, packet: Packet) {
        if let Err(packet) = self.transmitter.put(packet) {
            tracing::debug!(packet_type = ?packet.packet_type, "transmit slot busy, dropped");
        }
    }

    fn transmit(&mut self) {
        if self.backoff_until.is_some() {
            return;
        }
        match self.transmitter.run(&mut self.port) {
            None => {}
            Some(TransmitEvent::Sent {
                packet_type,
                awaiting_ack,
            }) => {
                self.active = true;
                if awaiting_ack {
                    let payload_len = self.transmitter.packet().map_or(0, |p| p.payload.len());
                    let timeout = self.timing.ack_timeout(payload_len);
                    self.timers.start_with(self.ack_timer, timeout);
                }
                if packet_type == PacketType::Speed {
                    if let Some(baud) = self.speed_in_flight.take() {
                        self.apply_speed(baud);
                    }
                }
            }
            Some(TransmitEvent::Collision) => {
                let backoff = self.timing.collision_backoff(&mut self.rng);
                tracing::debug!(backoff, "collision, backing off");
                self.backoff_until = Some(self.now + backoff);
                self.timers.request_pause_all(Some(backoff));
            }
            Some(TransmitEvent::Fault(fault)) => {
                tracing::warn!(%fault, "transmit fault");
                self.last_fault = Some(fault);
            }
        }
    }

    /// Send a control packet now. Dropped if the slot is taken.
    fn emit(&mut self, packet: Packet) {
        if !self.transmitter.is_empty() {
            tracing::debug!(packet_type = ?packet.packet_type, "transmit slot busy, control packet dropped");
            return;
        }
        self.put(packet);
        self.transmit();
    }

    fn on_ack_timeout(&mut self) {
        match self.transmitter.ack_timeout() {
            TimeoutOutcome::Resend => {
                tracing::debug!(resends = self.transmitter.resends(), "ack timeout, resending");
            }
            TimeoutOutcome::Exhausted(packet) => self.retries_exhausted(packet),
            TimeoutOutcome::Idle => {}
        }
    }

    pub(crate) fn retries_exhausted(&mut self, packet: Packet) {
        self.timers.stop(self.ack_timer);
        let fault = TransmitFault::RetriesExhausted {
            packet_type: packet.packet_type,
            dst: packet.dst,
            tries: self.timing.config().retransmit_tries,
        };
        tracing::warn!(%fault, "giving up");
        self.last_fault = Some(fault);
        if packet.packet_type == PacketType::GiveToken {
            self.boot_event(BootEvent::TokenLost);
        }
    }

    pub(crate) fn apply_speed(&mut self, baud: u32) {
        if let Err(e) = self.port.set_speed(baud) {
            tracing::warn!(error = %e, baud, "port rejected speed change");
            return;
        }
        self.timing.set_baud(baud);
        tracing::info!(baud, "bus speed changed");
    }

    pub(crate) fn reset_local(&mut self) {
        self.token.relinquish();
        self.transmitter.reset();
        self.timers.stop(self.ack_timer);
        self.boot_event(BootEvent::Reset);
    }

    // ── Bootstrap glue ────────────────────────────────────────────────────────

    pub(crate) fn boot_event(&mut self, event: BootEvent<'_>) {
        let mut ctx = BootContext {
            roster: &mut self.roster,
            timing: &self.timing,
            rng: &mut self.rng,
            hooks: &mut self.hooks,
        };
        let actions = self.boot.handle(event, &mut ctx);
        for action in actions {
            self.apply(action);
        }
    }

    fn apply(&mut self, action: BootAction) {
        match action {
            BootAction::StartTimer(timer, period) => {
                let id = self.boot_timer_id(timer);
                self.timers.start_with(id, period);
            }
            BootAction::StopTimer(timer) => {
                let id = self.boot_timer_id(timer);
                self.timers.stop(id);
            }
            BootAction::Emit(packet) => self.emit(packet),
            BootAction::AcquireToken => {
                self.token.acquire();
            }
            BootAction::RelinquishToken => {
                self.token.relinquish();
            }
        }
    }

    fn boot_timer_id(&self, timer: BootTimer) -> TimerId {
        match timer {
            BootTimer::Silent => self.boot_timers[0],
            BootTimer::Coldboot => self.boot_timers[1],
            BootTimer::WarmbootSend => self.boot_timers[2],
            BootTimer::WarmbootReply => self.boot_timers[3],
        }
    }

    fn boot_timer_of(&self, id: TimerId) -> Option<BootTimer> {
        BootTimer::ALL
            .into_iter()
            .find(|&t| self.boot_timer_id(t) == id)
    }
}
