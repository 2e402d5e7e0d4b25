//! Bootstrap state machine: silent, cold boot and warm boot.
//!
//! A node powers up silent. If the bus stays quiet for a ring time plus
//! jitter it starts a cold boot contest, broadcasting cold-boot packets; the
//! most dominant contender survives `emit_cycles` emissions and becomes the
//! warm boot initiator. The initiator opens reply windows until the roster
//! fingerprint holds steady for `emit_cycles` windows, then takes the token.
//!
//! `Bootstrap::handle` is pure with respect to the outside world: it mutates
//! only its own state and the roster it is lent, and describes everything
//! else (timers, packets, token changes) as a list of `BootAction`s for the
//! caller to carry out.

use ezbus_core::wire::{Packet, PacketType};
use ezbus_core::{Address, PeerRoster, RosterFingerprint};
use rand::RngCore;

use crate::timer::Tick;
use crate::timing::Timing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootState {
    SilentStart,
    SilentContinue,
    SilentStop,
    ColdbootStart,
    ColdbootContinue,
    ColdbootStop,
    WarmbootTxFirst,
    WarmbootTxStart,
    WarmbootTxRestart,
    WarmbootTxContinue,
    WarmbootTxStop,
    WarmbootRxStart,
    WarmbootRxContinue,
    WarmbootRxStop,
}

impl BootState {
    pub fn is_silent(self) -> bool {
        matches!(
            self,
            BootState::SilentStart | BootState::SilentContinue | BootState::SilentStop
        )
    }

    pub fn is_coldboot(self) -> bool {
        matches!(
            self,
            BootState::ColdbootStart | BootState::ColdbootContinue | BootState::ColdbootStop
        )
    }

    /// This node is running a warm boot.
    pub fn is_initiator(self) -> bool {
        matches!(
            self,
            BootState::WarmbootTxFirst
                | BootState::WarmbootTxStart
                | BootState::WarmbootTxRestart
                | BootState::WarmbootTxContinue
                | BootState::WarmbootTxStop
        )
    }

    pub fn is_replying(self) -> bool {
        matches!(
            self,
            BootState::WarmbootRxStart | BootState::WarmbootRxContinue | BootState::WarmbootRxStop
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootTimer {
    Silent,
    Coldboot,
    WarmbootSend,
    WarmbootReply,
}

impl BootTimer {
    pub const ALL: [BootTimer; 4] = [
        BootTimer::Silent,
        BootTimer::Coldboot,
        BootTimer::WarmbootSend,
        BootTimer::WarmbootReply,
    ];

    pub fn key(self) -> &'static str {
        match self {
            BootTimer::Silent => "silent",
            BootTimer::Coldboot => "coldboot",
            BootTimer::WarmbootSend => "warmboot_send",
            BootTimer::WarmbootReply => "warmboot_reply",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum BootEvent<'a> {
    /// Run any pending transitions.
    Tick,
    TimerExpired(BootTimer),
    ColdbootSeen(&'a Packet),
    /// A warm boot request, reply or ack.
    WarmbootSeen(&'a Packet),
    /// A give-token or take-token from another node.
    TokenSeen(&'a Packet),
    /// Anything at all crossed the bus.
    BusActivity,
    /// A packet from another node was dispatched. Counts as bus activity.
    PeerSeen(&'a Packet),
    /// A give-token went unanswered.
    TokenLost,
    /// The token holder wants to re-learn the membership.
    Refresh,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootAction {
    StartTimer(BootTimer, Tick),
    StopTimer(BootTimer),
    Emit(Packet),
    AcquireToken,
    RelinquishToken,
}

/// Observer for bootstrap milestones.
pub trait BootHooks {
    fn on_enter(&mut self, _state: BootState) {}
    fn on_roster_confirmed(&mut self, _roster: &PeerRoster) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl BootHooks for NoopHooks {}

/// What the state machine is lent for one call to `handle`.
pub struct BootContext<'a> {
    pub roster: &'a mut PeerRoster,
    pub timing: &'a Timing,
    pub rng: &'a mut dyn RngCore,
    pub hooks: &'a mut dyn BootHooks,
}

#[derive(Debug)]
pub struct Bootstrap {
    local: Address,
    state: BootState,
    /// Cold boot packets sent in the current contest.
    emit_count: u8,
    /// Session sequence of the warm boot this node runs.
    session_seq: u8,
    /// Consecutive reply windows with an unchanged roster.
    stable_windows: u32,
    snapshot: Option<RosterFingerprint>,
    /// Session the pending reply belongs to.
    reply_seq: Option<u8>,
    /// Last session this node's reply was acknowledged in.
    acked_seq: Option<u8>,
}

impl Bootstrap {
    pub fn new(local: Address) -> Self {
        Self {
            local,
            state: BootState::SilentStart,
            emit_count: 0,
            session_seq: 0,
            stable_windows: 0,
            snapshot: None,
            reply_seq: None,
            acked_seq: None,
        }
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    pub fn emit_count(&self) -> u8 {
        self.emit_count
    }

    pub fn session_seq(&self) -> u8 {
        self.session_seq
    }

    pub fn stable_windows(&self) -> u32 {
        self.stable_windows
    }

    /// Token traffic may flow.
    pub fn is_settled(&self) -> bool {
        self.state.is_silent()
    }

    pub fn handle(&mut self, event: BootEvent<'_>, ctx: &mut BootContext<'_>) -> Vec<BootAction> {
        let mut actions = Vec::new();
        match event {
            BootEvent::Tick => {}
            BootEvent::TimerExpired(timer) => self.on_timer(timer, ctx, &mut actions),
            BootEvent::ColdbootSeen(packet) => self.on_coldboot(packet, ctx, &mut actions),
            BootEvent::WarmbootSeen(packet) => self.on_warmboot(packet, ctx, &mut actions),
            BootEvent::TokenSeen(packet) => self.on_token(packet, ctx, &mut actions),
            BootEvent::BusActivity => self.on_activity(ctx),
            BootEvent::PeerSeen(packet) => {
                self.on_peer_seen(packet, ctx);
                self.on_activity(ctx);
            }
            BootEvent::TokenLost => {
                tracing::warn!("token lost, starting warm boot");
                self.enter(BootState::WarmbootTxFirst, ctx);
            }
            BootEvent::Refresh => {
                if self.state.is_silent() {
                    tracing::debug!("refreshing membership");
                    self.enter(BootState::WarmbootTxFirst, ctx);
                }
            }
            BootEvent::Reset => {
                self.reply_seq = None;
                self.acked_seq = None;
                actions.push(BootAction::RelinquishToken);
                self.enter(BootState::SilentStart, ctx);
            }
        }
        self.advance(ctx, &mut actions);
        actions
    }

    fn enter(&mut self, state: BootState, ctx: &mut BootContext<'_>) {
        if state != self.state {
            tracing::trace!(from = ?self.state, to = ?state, "boot state");
        }
        self.state = state;
        ctx.hooks.on_enter(state);
    }

    /// Run transitions that need no outside input until the machine rests.
    fn advance(&mut self, ctx: &mut BootContext<'_>, actions: &mut Vec<BootAction>) {
        loop {
            match self.state {
                BootState::SilentStart => {
                    actions.push(BootAction::StopTimer(BootTimer::Coldboot));
                    actions.push(BootAction::StopTimer(BootTimer::WarmbootSend));
                    actions.push(BootAction::StopTimer(BootTimer::WarmbootReply));
                    let period = ctx.timing.silent_period(ctx.roster.len(), ctx.rng);
                    actions.push(BootAction::StartTimer(BootTimer::Silent, period));
                    self.enter(BootState::SilentContinue, ctx);
                }
                BootState::SilentStop => {
                    actions.push(BootAction::RelinquishToken);
                    self.emit_count = 0;
                    tracing::debug!("bus silent, entering cold boot");
                    self.enter(BootState::ColdbootStart, ctx);
                }
                BootState::ColdbootStart => {
                    let delay = ctx.timing.emit_delay(ctx.rng);
                    actions.push(BootAction::StartTimer(BootTimer::Coldboot, delay));
                    self.enter(BootState::ColdbootContinue, ctx);
                }
                BootState::ColdbootContinue => {
                    if u32::from(self.emit_count) > ctx.timing.config().emit_cycles {
                        self.enter(BootState::ColdbootStop, ctx);
                    } else {
                        return;
                    }
                }
                BootState::ColdbootStop => {
                    actions.push(BootAction::StopTimer(BootTimer::Coldboot));
                    tracing::info!(emitted = self.emit_count, "cold boot won");
                    self.enter(BootState::WarmbootTxFirst, ctx);
                }
                BootState::WarmbootTxFirst => {
                    actions.push(BootAction::StopTimer(BootTimer::Silent));
                    actions.push(BootAction::StopTimer(BootTimer::Coldboot));
                    actions.push(BootAction::StopTimer(BootTimer::WarmbootReply));
                    let take = Packet::new(PacketType::TakeToken, self.next_session(), self.local);
                    actions.push(BootAction::Emit(take));
                    self.enter(BootState::WarmbootTxStart, ctx);
                }
                BootState::WarmbootTxStart => {
                    self.session_seq = self.next_session();
                    self.stable_windows = 0;
                    ctx.roster.reset(self.session_seq);
                    tracing::debug!(session = self.session_seq, "warm boot started");
                    self.enter(BootState::WarmbootTxRestart, ctx);
                }
                BootState::WarmbootTxRestart => {
                    self.snapshot = Some(ctx.roster.fingerprint());
                    let window = ctx.timing.reply_window();
                    actions.push(BootAction::StartTimer(BootTimer::WarmbootSend, window));
                    let request =
                        Packet::new(PacketType::WarmbootRequest, self.session_seq, Address::WARMBOOT);
                    actions.push(BootAction::Emit(request));
                    self.enter(BootState::WarmbootTxContinue, ctx);
                }
                BootState::WarmbootTxStop => {
                    if self.snapshot == Some(ctx.roster.fingerprint()) {
                        self.stable_windows += 1;
                        if self.stable_windows >= ctx.timing.config().emit_cycles {
                            tracing::info!(
                                session = self.session_seq,
                                peers = ctx.roster.len(),
                                "warm boot complete"
                            );
                            actions.push(BootAction::AcquireToken);
                            ctx.hooks.on_roster_confirmed(ctx.roster);
                            self.enter(BootState::SilentStart, ctx);
                            continue;
                        }
                    } else {
                        self.stable_windows = 0;
                    }
                    self.enter(BootState::WarmbootTxRestart, ctx);
                }
                BootState::WarmbootRxStart => {
                    actions.push(BootAction::StopTimer(BootTimer::Silent));
                    actions.push(BootAction::StopTimer(BootTimer::Coldboot));
                    let delay = ctx.timing.reply_delay(ctx.rng);
                    actions.push(BootAction::StartTimer(BootTimer::WarmbootReply, delay));
                    self.enter(BootState::WarmbootRxContinue, ctx);
                }
                BootState::WarmbootRxStop => {
                    self.enter(BootState::SilentStart, ctx);
                }
                BootState::SilentContinue
                | BootState::WarmbootTxContinue
                | BootState::WarmbootRxContinue => return,
            }
        }
    }

    fn next_session(&self) -> u8 {
        match self.session_seq.wrapping_add(1) {
            0 => 1,
            seq => seq,
        }
    }

    fn on_activity(&mut self, ctx: &mut BootContext<'_>) {
        if self.state == BootState::SilentContinue {
            self.enter(BootState::SilentStart, ctx);
        }
    }

    /// Outside warm boot context, any packet from a more dominant sender
    /// ends our cold boot contest.
    fn on_peer_seen(&mut self, packet: &Packet, ctx: &mut BootContext<'_>) {
        let warmboot_context = packet.packet_type.is_warmboot()
            || packet.src.is_warmboot()
            || packet.dst.is_warmboot();
        if warmboot_context || !self.state.is_coldboot() {
            return;
        }
        if packet.src.dominates(&self.local) {
            tracing::debug!(
                peer = %packet.src,
                packet_type = ?packet.packet_type,
                "dominant node on the bus, leaving cold boot"
            );
            self.enter(BootState::SilentStart, ctx);
        }
    }

    fn on_timer(
        &mut self,
        timer: BootTimer,
        ctx: &mut BootContext<'_>,
        actions: &mut Vec<BootAction>,
    ) {
        match (timer, self.state) {
            (BootTimer::Silent, BootState::SilentContinue) => {
                self.enter(BootState::SilentStop, ctx);
            }
            (BootTimer::Coldboot, BootState::ColdbootContinue) => {
                self.emit_count = self.emit_count.wrapping_add(1);
                let packet = Packet::new(PacketType::Coldboot, self.emit_count, self.local);
                actions.push(BootAction::Emit(packet));
                self.enter(BootState::ColdbootStart, ctx);
            }
            (BootTimer::WarmbootSend, BootState::WarmbootTxContinue) => {
                self.enter(BootState::WarmbootTxStop, ctx);
            }
            (BootTimer::WarmbootReply, BootState::WarmbootRxContinue) => {
                if let Some(seq) = self.reply_seq {
                    if self.acked_seq != Some(seq) {
                        let reply = Packet::new(PacketType::WarmbootReply, seq, self.local)
                            .to(Address::WARMBOOT);
                        actions.push(BootAction::Emit(reply));
                    }
                }
                self.enter(BootState::WarmbootRxStop, ctx);
            }
            (timer, state) => {
                tracing::trace!(timer = timer.key(), ?state, "stale boot timer");
            }
        }
    }

    fn on_coldboot(
        &mut self,
        packet: &Packet,
        ctx: &mut BootContext<'_>,
        actions: &mut Vec<BootAction>,
    ) {
        let sender = packet.src;
        ctx.roster.insort(sender, packet.seq);
        let outranked = sender.dominates(&self.local);

        if self.state.is_coldboot() || self.state.is_initiator() {
            if outranked {
                tracing::debug!(peer = %sender, "deferring to dominant node");
                self.enter(BootState::SilentStart, ctx);
            }
        } else if !outranked {
            // A weaker node is contesting; join in.
            if self.state.is_replying() {
                actions.push(BootAction::StopTimer(BootTimer::WarmbootReply));
            }
            self.enter(BootState::SilentStop, ctx);
        } else if self.state.is_replying() {
            actions.push(BootAction::StopTimer(BootTimer::WarmbootReply));
            self.enter(BootState::SilentStart, ctx);
        }
    }

    fn on_warmboot(
        &mut self,
        packet: &Packet,
        ctx: &mut BootContext<'_>,
        actions: &mut Vec<BootAction>,
    ) {
        let seq = packet.seq;
        match packet.packet_type {
            PacketType::WarmbootRequest => {
                if self.state.is_initiator() {
                    tracing::debug!(seq, "ignoring competing warm boot request");
                    return;
                }
                ctx.roster.clean(seq);
                if self.acked_seq == Some(seq) {
                    if self.state.is_replying() {
                        actions.push(BootAction::StopTimer(BootTimer::WarmbootReply));
                        self.enter(BootState::SilentStart, ctx);
                    }
                    return;
                }
                self.reply_seq = Some(seq);
                self.enter(BootState::WarmbootRxStart, ctx);
            }
            PacketType::WarmbootReply => {
                ctx.roster.clean(seq);
                ctx.roster.insort(packet.src, seq);
                if self.state.is_initiator() && seq == self.session_seq {
                    let ack = Packet::new(PacketType::WarmbootAck, seq, Address::WARMBOOT)
                        .to(packet.src);
                    actions.push(BootAction::Emit(ack));
                }
            }
            PacketType::WarmbootAck => {
                ctx.roster.clean(seq);
                ctx.roster.insort(packet.dst, seq);
                if packet.dst == self.local && self.acked_seq != Some(seq) {
                    self.acked_seq = Some(seq);
                    tracing::debug!(seq, "warm boot reply acknowledged");
                    if !self.state.is_initiator() {
                        actions.push(BootAction::StopTimer(BootTimer::WarmbootReply));
                        self.enter(BootState::SilentStart, ctx);
                    }
                }
            }
            other => {
                tracing::debug!(packet_type = ?other, "not a warm boot packet");
            }
        }
    }

    fn on_token(
        &mut self,
        packet: &Packet,
        ctx: &mut BootContext<'_>,
        actions: &mut Vec<BootAction>,
    ) {
        ctx.roster.insort(packet.src, packet.seq);
        if self.state.is_initiator() {
            let yields = packet.packet_type == PacketType::GiveToken
                || packet.src.dominates(&self.local);
            if !yields {
                return;
            }
            tracing::debug!(peer = %packet.src, "another node owns the bus, abandoning warm boot");
        }
        if self.state.is_replying() {
            actions.push(BootAction::StopTimer(BootTimer::WarmbootReply));
        }
        self.enter(BootState::SilentStart, ctx);
    }
}
