//! Zone ownership and motion-hold reconciliation.
//!
//! One [`EngineState`] per node. Every input (remote claim, mode command,
//! local motion, periodic tick) is an [`Event`] fed through [`transition`],
//! which mutates the state and returns the effects as an [`ActionSet`].
//! Nothing here touches hardware, the network, or a clock.
//!
//! ## Derived states
//!
//! ```text
//!              ┌──────────── manual Off/On (hold dropped) ─────────────┐
//!              ▼                                                       │
//!   ManualOff / ManualOn ──[override cleared, Auto]──▶ AutoIdle ◀──────┤
//!                                                     │  ▲             │
//!                          [local motion / accepted claim]  [deadline / off]
//!                                                     ▼  │             │
//!   PendingRestore ──[confirmed claim]──────────────▶ AutoActive ──────┘
//!        │
//!        └──[window elapsed]──▶ AutoIdle
//! ```

use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::action::{ActionSet, Outbound, PersistedState};
use crate::dedup::{ClaimKind, DedupCache};
use crate::model::{wire_millis, FsmState, Mode, NodeAddress, Timestamp, ZoneRecord};
use crate::overrides::{ModeScope, ModeSource, OverrideSet};
use crate::timing::{Timing, DEFAULT_HOLD};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Relay node; mode comes from the override hierarchy.
    Actuator,
    /// Has a physical mode switch that outranks every override.
    Controller,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub address: NodeAddress,
    pub zone_id: u8,
    pub role: Role,
    pub hold: Duration,
    pub timing: Timing,
}

impl EngineConfig {
    pub fn new(address: NodeAddress, zone_id: u8) -> Self {
        Self {
            address,
            zone_id,
            role: Role::Actuator,
            hold: DEFAULT_HOLD,
            timing: Timing::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    RemoteTrigger {
        epoch: u32,
        from: NodeAddress,
        remaining_ms: u32,
    },
    RemoteStateResponse {
        epoch: u32,
        from: NodeAddress,
        remaining_ms: u32,
        active: bool,
    },
    RemoteStateRequest {
        from: NodeAddress,
    },
    RemoteOff {
        epoch: u32,
    },
    ModeSet {
        scope: ModeScope,
        mode: Mode,
    },
    ModeClear {
        scope: ModeScope,
    },
    LocalModeSet {
        mode: Mode,
    },
    /// Controller role: the physical switch moved (or was read at boot).
    SwitchPosition {
        mode: Mode,
    },
    LocalTrigger {
        force_new_owner: bool,
    },
    EnterPendingRestore,
    ColdBoot,
    /// The last flush did not reach the store.
    PersistFailed,
    Tick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreKind {
    Wake,
    ColdBoot,
}

#[derive(Debug, Clone, Copy)]
struct RestoreWindow {
    kind: RestoreKind,
    deadline: Timestamp,
    retry_every: Duration,
    next_request: Timestamp,
}

impl RestoreWindow {
    fn open(kind: RestoreKind, now: Timestamp, length: Duration, retry_every: Duration) -> Self {
        Self {
            kind,
            deadline: now + length,
            retry_every,
            next_request: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    Stale,
    NotOwner,
    InactiveAtSameEpoch,
    WouldExtend,
    NotLater,
}

/// Snapshot for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub address: NodeAddress,
    pub zone_id: u8,
    pub role: Role,
    pub state: FsmState,
    pub mode: Mode,
    pub mode_source: ModeSource,
    pub epoch: u32,
    pub active: bool,
    pub remaining_ms: u32,
    pub owner: Option<NodeAddress>,
    pub is_owner: bool,
    pub pending_restore: bool,
    pub restore: Option<RestoreKind>,
    pub overrides: OverrideSet,
    pub relay_on: bool,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct EngineState {
    config: EngineConfig,
    record: ZoneRecord,
    overrides: OverrideSet,
    switch: Option<Mode>,
    dedup: DedupCache,
    last_local_trigger: Option<Timestamp>,
    restore: Option<RestoreWindow>,
    dirty_since: Option<Timestamp>,
    flush_requested: bool,
    indicated: Option<Mode>,
    relay_on: bool,
}

/// Feed one event through the engine.
pub fn transition(state: &mut EngineState, event: Event, now: Timestamp) -> ActionSet {
    state.apply(event, now)
}

impl EngineState {
    /// Build the engine from whatever the store returned. The loaded hold is
    /// taken at face value here; the boot event decides whether to trust it.
    pub fn new(config: EngineConfig, persisted: Option<PersistedState>) -> Self {
        let p = persisted.unwrap_or_default();
        Self {
            config,
            record: ZoneRecord {
                epoch: p.epoch,
                active: p.active,
                deadline: p.deadline,
                owner: p.owner,
                pending_restore: false,
            },
            overrides: p.overrides,
            switch: None,
            dedup: DedupCache::default(),
            last_local_trigger: None,
            restore: None,
            dirty_since: None,
            flush_requested: false,
            indicated: None,
            relay_on: false,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn record(&self) -> &ZoneRecord {
        &self.record
    }

    pub fn overrides(&self) -> &OverrideSet {
        &self.overrides
    }

    pub fn relay_on(&self) -> bool {
        self.relay_on
    }

    pub fn mode_source(&self) -> (ModeSource, Mode) {
        if self.config.role == Role::Controller {
            if let Some(sw) = self.switch {
                return (ModeSource::Switch, sw);
            }
        }
        self.overrides.resolve(self.config.zone_id)
    }

    pub fn effective_mode(&self) -> Mode {
        self.mode_source().1
    }

    pub fn fsm_state(&self) -> FsmState {
        FsmState::derive(self.effective_mode(), &self.record)
    }

    pub fn persisted(&self) -> PersistedState {
        PersistedState {
            epoch: self.record.epoch,
            active: self.record.active,
            deadline: self.record.deadline,
            owner: self.record.owner,
            overrides: self.overrides,
        }
    }

    /// What this node tells a peer that asks for the zone state. A node that
    /// distrusts its own memory never asserts it.
    pub fn state_response(&self, now: Timestamp) -> Outbound {
        let remaining = if self.record.pending_restore {
            0
        } else {
            wire_millis(self.record.remaining(now))
        };
        Outbound::StateResponse {
            epoch: self.record.epoch,
            owner: self.record.owner,
            remaining_ms: remaining,
            active: remaining > 0,
        }
    }

    pub fn status(&self, now: Timestamp) -> EngineStatus {
        let (mode_source, mode) = self.mode_source();
        EngineStatus {
            address: self.config.address,
            zone_id: self.config.zone_id,
            role: self.config.role,
            state: self.fsm_state(),
            mode,
            mode_source,
            epoch: self.record.epoch,
            active: self.record.active,
            remaining_ms: wire_millis(self.record.remaining(now)),
            owner: self.record.owner,
            is_owner: self.record.is_owned_by(self.config.address),
            pending_restore: self.record.pending_restore,
            restore: self.restore.map(|w| w.kind),
            overrides: self.overrides,
            relay_on: self.relay_on,
        }
    }

    pub fn apply(&mut self, event: Event, now: Timestamp) -> ActionSet {
        let before = self.fsm_state();
        let mut actions = ActionSet::default();

        match event {
            Event::RemoteTrigger {
                epoch,
                from,
                remaining_ms,
            } => self.on_claim(ClaimKind::Trigger, epoch, from, remaining_ms, true, now),
            Event::RemoteStateResponse {
                epoch,
                from,
                remaining_ms,
                active,
            } => self.on_claim(ClaimKind::StateResponse, epoch, from, remaining_ms, active, now),
            Event::RemoteStateRequest { from } => {
                if from != self.config.address {
                    actions.outbound.push(self.state_response(now));
                }
            }
            Event::RemoteOff { epoch } => self.on_remote_off(epoch, now),
            Event::ModeSet { scope, mode } => {
                self.overrides.set(scope, mode);
                self.after_mode_change(now);
            }
            Event::ModeClear { scope } => {
                if self.overrides.clear(scope) {
                    self.after_mode_change(now);
                }
            }
            Event::LocalModeSet { mode } => self.on_local_mode(mode, now, &mut actions),
            Event::SwitchPosition { mode } => self.on_switch(mode, now),
            Event::LocalTrigger { force_new_owner } => {
                self.on_local_trigger(force_new_owner, now, &mut actions)
            }
            Event::EnterPendingRestore => self.on_wake(now, &mut actions),
            Event::ColdBoot => self.on_cold_boot(now),
            Event::PersistFailed => self.mark_dirty(now),
            Event::Tick => self.on_tick(now, &mut actions),
        }

        self.settle(before, &mut actions);
        actions
    }

    // -- Remote claims -----------------------------------------------------

    fn on_claim(
        &mut self,
        kind: ClaimKind,
        epoch: u32,
        from: NodeAddress,
        remaining_ms: u32,
        active: bool,
        now: Timestamp,
    ) {
        let timing = self.config.timing;
        if self
            .dedup
            .is_duplicate(kind, epoch, from, remaining_ms, now, &timing)
        {
            debug!(?kind, epoch, %from, remaining_ms, "retransmission dropped");
            return;
        }

        let candidate = (active && remaining_ms > 0)
            .then(|| now + Duration::from_millis(u64::from(remaining_ms)));

        if let Err(reason) = self.judge(kind, epoch, from, candidate) {
            debug!(
                ?kind,
                epoch,
                stored_epoch = self.record.epoch,
                %from,
                remaining_ms,
                ?reason,
                "claim rejected"
            );
            return;
        }

        let rec = &mut self.record;
        rec.epoch = epoch;
        rec.pending_restore = false;
        match candidate {
            Some(deadline) => {
                rec.active = true;
                rec.deadline = deadline;
                rec.owner = Some(from);
            }
            // An inactive claim carries the epoch only; nobody owns it yet.
            None => rec.clear_hold(),
        }
        info!(?kind, epoch, %from, active = rec.active, remaining_ms, "claim accepted");

        self.dedup.record(kind, epoch, from, remaining_ms, now);
        self.mark_dirty(now);
    }

    /// Epoch/ownership acceptance rule shared by triggers and state responses.
    fn judge(
        &self,
        kind: ClaimKind,
        epoch: u32,
        from: NodeAddress,
        candidate: Option<Timestamp>,
    ) -> Result<(), Rejection> {
        let rec = &self.record;
        if epoch < rec.epoch {
            return Err(Rejection::Stale);
        }
        if epoch > rec.epoch {
            return Ok(());
        }
        if rec.owner.is_some_and(|owner| owner != from) {
            return Err(Rejection::NotOwner);
        }
        if rec.pending_restore {
            return Ok(());
        }
        // Only an explicit off at this epoch turns the zone off.
        let Some(deadline) = candidate else {
            return Err(Rejection::InactiveAtSameEpoch);
        };
        if !rec.active {
            return Ok(());
        }

        let guard = self.config.timing.guard_band;
        match kind {
            ClaimKind::StateResponse if deadline + guard < rec.deadline => Ok(()),
            ClaimKind::StateResponse => Err(Rejection::WouldExtend),
            ClaimKind::Trigger if deadline > rec.deadline + guard => Ok(()),
            ClaimKind::Trigger => Err(Rejection::NotLater),
        }
    }

    fn on_remote_off(&mut self, epoch: u32, now: Timestamp) {
        if epoch != self.record.epoch {
            debug!(epoch, stored_epoch = self.record.epoch, "off for another generation ignored");
            return;
        }
        if !self.record.active && self.record.owner.is_none() {
            return;
        }
        info!(epoch, "zone off accepted");
        self.record.clear_hold();
        self.mark_dirty(now);
    }

    // -- Modes -------------------------------------------------------------

    fn on_local_mode(&mut self, mode: Mode, now: Timestamp, actions: &mut ActionSet) {
        if self.overrides.local == mode {
            return;
        }
        self.overrides.local = mode;
        self.after_mode_change(now);
        if mode == Mode::Auto && self.effective_mode() == Mode::Auto {
            actions.outbound.push(Outbound::StateRequest);
        }
    }

    fn on_switch(&mut self, mode: Mode, now: Timestamp) {
        if self.config.role != Role::Controller {
            warn!(%mode, "switch position on a node without a switch ignored");
            return;
        }
        if self.switch == Some(mode) {
            return;
        }
        info!(%mode, "mode switch moved");
        self.switch = Some(mode);
        self.overrides.local = mode;
        self.after_mode_change(now);
    }

    fn after_mode_change(&mut self, now: Timestamp) {
        self.mark_dirty(now);
        let mode = self.effective_mode();
        if !mode.is_manual() {
            return;
        }
        if self.record.active || self.record.pending_restore {
            info!(%mode, epoch = self.record.epoch, "manual mode, dropping automatic hold");
        }
        self.record.reset();
    }

    // -- Local motion ------------------------------------------------------

    fn on_local_trigger(&mut self, force_new_owner: bool, now: Timestamp, actions: &mut ActionSet) {
        if self.effective_mode() != Mode::Auto {
            debug!("local motion ignored outside auto mode");
            return;
        }
        if let Some(last) = self.last_local_trigger {
            if now.saturating_since(last) < self.config.timing.local_trigger_debounce {
                return;
            }
        }
        self.last_local_trigger = Some(now);

        let me = self.config.address;
        let rec = &mut self.record;
        if force_new_owner || !(rec.active && rec.is_owned_by(me)) {
            rec.epoch = rec.epoch.saturating_add(1);
            rec.owner = Some(me);
            info!(epoch = rec.epoch, "local motion, claiming zone");
        } else {
            debug!(epoch = rec.epoch, "local motion, refreshing hold");
        }
        rec.active = true;
        rec.pending_restore = false;
        rec.deadline = now + self.config.hold;

        actions.outbound.push(Outbound::Trigger {
            epoch: rec.epoch,
            remaining_ms: wire_millis(rec.remaining(now)),
        });
        self.mark_dirty(now);
    }

    // -- Boot --------------------------------------------------------------

    fn on_wake(&mut self, now: Timestamp, actions: &mut ActionSet) {
        let timing = self.config.timing;
        let rec = &self.record;
        if self.effective_mode() == Mode::Auto && rec.active && rec.deadline > now {
            info!(
                epoch = rec.epoch,
                remaining_ms = wire_millis(rec.remaining(now)),
                "restart with a live hold, staying off until the zone confirms"
            );
            self.record.pending_restore = true;
            self.restore = Some(RestoreWindow::open(
                RestoreKind::Wake,
                now,
                timing.wake_restore_window,
                timing.wake_retry_interval,
            ));
            return;
        }

        if rec.active {
            info!(epoch = rec.epoch, "stored hold cannot be restored, clearing");
            self.record.clear_hold();
            self.flush_requested = true;
        }
        actions.outbound.push(Outbound::StateRequest);
    }

    fn on_cold_boot(&mut self, now: Timestamp) {
        let timing = self.config.timing;
        warn!(epoch = self.record.epoch, "cold boot, distrusting stored hold");
        self.record.clear_hold();
        self.record.pending_restore = true;
        self.restore = Some(RestoreWindow::open(
            RestoreKind::ColdBoot,
            now,
            timing.cold_boot_window,
            timing.cold_boot_retry_interval,
        ));
        self.flush_requested = true;
    }

    // -- Tick --------------------------------------------------------------

    fn on_tick(&mut self, now: Timestamp, actions: &mut ActionSet) {
        self.drive_restore(now, actions);
        self.expire_hold(now, actions);

        if let Some(since) = self.dirty_since {
            if now.saturating_since(since) >= self.config.timing.persist_debounce {
                self.flush_requested = true;
            }
        }

        // The only place the relay is driven.
        let on = self.fsm_state().relay_on();
        self.relay_on = on;
        actions.relay = Some(on);
    }

    fn drive_restore(&mut self, now: Timestamp, actions: &mut ActionSet) {
        if !self.record.pending_restore {
            return;
        }
        let Some(window) = self.restore.as_mut() else {
            return;
        };

        if now >= window.deadline {
            warn!(
                kind = ?window.kind,
                epoch = self.record.epoch,
                "no zone confirmation, staying off"
            );
            self.record.reset();
            self.restore = None;
            self.flush_requested = true;
            return;
        }

        if now >= window.next_request {
            window.next_request = now + window.retry_every;
            actions.outbound.push(Outbound::StateRequest);
        }
    }

    fn expire_hold(&mut self, now: Timestamp, actions: &mut ActionSet) {
        let rec = &self.record;
        if !rec.active || rec.pending_restore || now <= rec.deadline {
            return;
        }

        let epoch = rec.epoch;
        if rec.is_owned_by(self.config.address) {
            info!(epoch, "hold expired, announcing zone off");
            actions.outbound.push(Outbound::Off { epoch });
        } else {
            info!(epoch, "hold expired");
        }
        self.record.clear_hold();
        self.mark_dirty(now);
    }

    // -- Bookkeeping -------------------------------------------------------

    fn mark_dirty(&mut self, now: Timestamp) {
        self.dirty_since.get_or_insert(now);
    }

    fn settle(&mut self, before: FsmState, actions: &mut ActionSet) {
        if !self.record.pending_restore {
            self.restore = None;
        }

        let mode = self.effective_mode();
        if self.indicated != Some(mode) {
            self.indicated = Some(mode);
            actions.indicator = Some(mode);
        }

        let after = self.fsm_state();
        if after != before {
            actions.transition = Some((before, after));
        }

        if self.flush_requested {
            self.flush_requested = false;
            self.dirty_since = None;
            actions.flush = Some(self.persisted());
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
