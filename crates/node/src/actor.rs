//! The single task that owns the engine.
//!
//! Producers (MQTT, sensor, switch) only ever `post` onto a bounded queue.
//! The actor drains it, injects one tick per cycle, and carries out each
//! returned [`ActionSet`] against the ports below.

use anyhow::Result;
use std::future::Future;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use zonelight_engine::{
    transition, ActionSet, EngineState, Event, Mode, Outbound, PersistedState, Timestamp,
};

use crate::status::{NodeStatus, TransitionLog};

pub const QUEUE_CAPACITY: usize = 16;

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

pub trait Outputs {
    fn set_relay(&mut self, on: bool);
    fn set_indicator(&mut self, mode: Mode);
}

pub trait Transport {
    fn is_joined(&self) -> bool;
    /// Fire and forget.
    fn send(&self, out: &Outbound) -> Result<()>;
}

pub trait Store {
    fn save(
        &self,
        state: &PersistedState,
        now: Timestamp,
    ) -> impl Future<Output = Result<()>> + Send;
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Event>,
}

impl EventSink {
    /// Never blocks. A full queue drops the event.
    pub fn post(&self, event: Event) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(?event, "event queue full, dropping");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("event queue closed");
                false
            }
        }
    }
}

pub fn queue() -> (EventSink, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    (EventSink { tx }, rx)
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Monotonic milliseconds since process start.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    start: Instant,
}

impl Clock {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn now(&self) -> Timestamp {
        let ms = u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX);
        Timestamp::from_millis(ms)
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

pub struct Actor<O, T, S> {
    engine: EngineState,
    outputs: O,
    transport: T,
    store: S,
    clock: Clock,
    events: mpsc::Receiver<Event>,
    status: watch::Sender<NodeStatus>,
    log: TransitionLog,
}

impl<O, T, S> Actor<O, T, S>
where
    O: Outputs + Send,
    T: Transport + Send + Sync,
    S: Store + Send + Sync,
{
    pub fn new(
        engine: EngineState,
        outputs: O,
        transport: T,
        store: S,
        clock: Clock,
        events: mpsc::Receiver<Event>,
        status: watch::Sender<NodeStatus>,
    ) -> Self {
        Self {
            engine,
            outputs,
            transport,
            store,
            clock,
            events,
            status,
            log: TransitionLog::default(),
        }
    }

    /// Runs for the lifetime of the process.
    pub async fn run(mut self) {
        let mut ticker = time::interval(self.engine.config().timing.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            zone = self.engine.config().zone_id,
            address = %self.engine.config().address,
            "actor started"
        );

        loop {
            let next = tokio::select! {
                Some(event) = self.events.recv() => Some(event),
                _ = ticker.tick() => None,
            };
            match next {
                Some(event) => self.dispatch(event).await,
                None => self.cycle_at(self.clock.now()).await,
            }
        }
    }

    pub async fn dispatch(&mut self, event: Event) {
        let now = self.clock.now();
        self.dispatch_at(event, now).await;
    }

    /// Drain whatever is queued, then tick once and publish status.
    async fn cycle_at(&mut self, now: Timestamp) {
        while let Ok(event) = self.events.try_recv() {
            self.dispatch_at(event, now).await;
        }
        self.dispatch_at(Event::Tick, now).await;
        self.publish_status(now);
    }

    async fn dispatch_at(&mut self, event: Event, now: Timestamp) {
        let actions = transition(&mut self.engine, event, now);
        self.apply(actions, now).await;
    }

    async fn apply(&mut self, actions: ActionSet, now: Timestamp) {
        if let Some(mode) = actions.indicator {
            self.outputs.set_indicator(mode);
        }
        if let Some(on) = actions.relay {
            self.outputs.set_relay(on);
        }

        if !actions.outbound.is_empty() {
            if self.transport.is_joined() {
                for out in &actions.outbound {
                    if let Err(e) = self.transport.send(out) {
                        warn!(?out, "send failed: {e:#}");
                    }
                }
            } else {
                debug!(count = actions.outbound.len(), "not joined, outbound skipped");
            }
        }

        if let Some(snapshot) = actions.flush {
            match self.store.save(&snapshot, now).await {
                Ok(()) => debug!(epoch = snapshot.epoch, active = snapshot.active, "state flushed"),
                Err(e) => {
                    warn!("persist failed, keeping in-memory state: {e:#}");
                    // Only re-arms the debounce; carries no effects.
                    let retry = transition(&mut self.engine, Event::PersistFailed, now);
                    debug_assert_eq!(retry, ActionSet::default());
                }
            }
        }

        if let Some((from, to)) = actions.transition {
            let epoch = self.engine.record().epoch;
            info!(%from, %to, epoch, "state transition");
            self.log.push(from, to, epoch);
        }
    }

    fn publish_status(&self, now: Timestamp) {
        self.status.send_replace(NodeStatus {
            uptime_secs: now.as_millis() / 1_000,
            joined: self.transport.is_joined(),
            engine: Some(self.engine.status(now)),
            transitions: self.log.recent(),
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use zonelight_engine::{EngineConfig, FsmState, NodeAddress};

    #[derive(Default)]
    struct FakeOutputs {
        relay: Vec<bool>,
        indicator: Vec<Mode>,
    }

    impl Outputs for FakeOutputs {
        fn set_relay(&mut self, on: bool) {
            self.relay.push(on);
        }
        fn set_indicator(&mut self, mode: Mode) {
            self.indicator.push(mode);
        }
    }

    struct FakeTransport {
        joined: bool,
        sent: Mutex<Vec<Outbound>>,
    }

    impl Transport for FakeTransport {
        fn is_joined(&self) -> bool {
            self.joined
        }
        fn send(&self, out: &Outbound) -> Result<()> {
            self.sent.lock().unwrap().push(out.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeStore {
        fail: AtomicBool,
        saved: Mutex<Vec<PersistedState>>,
    }

    impl Store for FakeStore {
        async fn save(&self, state: &PersistedState, _now: Timestamp) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(anyhow!("disk full"));
            }
            self.saved.lock().unwrap().push(state.clone());
            Ok(())
        }
    }

    type TestActor = Actor<FakeOutputs, FakeTransport, FakeStore>;

    fn actor(joined: bool) -> (TestActor, EventSink, watch::Receiver<NodeStatus>) {
        let me: NodeAddress = "fd00::1".parse().unwrap();
        let engine = EngineState::new(EngineConfig::new(me, 1), None);
        let (sink, rx) = queue();
        let (status_tx, status_rx) = watch::channel(NodeStatus::starting());
        let actor = Actor::new(
            engine,
            FakeOutputs::default(),
            FakeTransport {
                joined,
                sent: Mutex::new(Vec::new()),
            },
            FakeStore::default(),
            Clock::start(),
            rx,
            status_tx,
        );
        (actor, sink, status_rx)
    }

    fn t(ms: u64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    fn local() -> Event {
        Event::LocalTrigger {
            force_new_owner: false,
        }
    }

    #[tokio::test]
    async fn local_trigger_drives_relay_and_sends_claim() {
        let (mut a, _sink, _status) = actor(true);
        a.dispatch_at(local(), t(0)).await;
        a.cycle_at(t(50)).await;

        assert_eq!(a.outputs.relay, vec![true]);
        assert_eq!(a.outputs.indicator, vec![Mode::Auto]);
        let sent = a.transport.sent.lock().unwrap();
        assert!(matches!(sent[0], Outbound::Trigger { epoch: 1, .. }));
    }

    #[tokio::test]
    async fn outbound_skipped_when_not_joined() {
        let (mut a, _sink, _status) = actor(false);
        a.dispatch_at(local(), t(0)).await;
        a.cycle_at(t(50)).await;

        assert!(a.transport.sent.lock().unwrap().is_empty());
        assert_eq!(a.outputs.relay, vec![true]);
    }

    #[tokio::test]
    async fn cycle_drains_queue_before_tick() {
        let (mut a, sink, _status) = actor(true);
        assert!(sink.post(local()));
        a.cycle_at(t(0)).await;
        assert_eq!(a.outputs.relay, vec![true]);
    }

    #[tokio::test]
    async fn failed_flush_is_retried() {
        let (mut a, _sink, _status) = actor(true);
        a.store.fail.store(true, Ordering::SeqCst);
        a.dispatch_at(local(), t(0)).await;
        a.cycle_at(t(1_000)).await;
        assert!(a.store.saved.lock().unwrap().is_empty());

        a.store.fail.store(false, Ordering::SeqCst);
        a.cycle_at(t(1_500)).await;
        assert!(a.store.saved.lock().unwrap().is_empty(), "debounce re-armed");
        a.cycle_at(t(2_000)).await;
        let saved = a.store.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].epoch, 1);
        assert!(saved[0].active);
    }

    #[tokio::test]
    async fn status_snapshot_published_each_cycle() {
        let (mut a, _sink, status) = actor(true);
        a.dispatch_at(local(), t(0)).await;
        a.cycle_at(t(2_000)).await;

        let snap = status.borrow();
        assert_eq!(snap.uptime_secs, 2);
        assert!(snap.joined);
        let engine = snap.engine.as_ref().unwrap();
        assert_eq!(engine.state, FsmState::AutoActive);
        assert_eq!(snap.transitions.len(), 1);
        assert_eq!(snap.transitions[0].to, FsmState::AutoActive);
    }

    #[tokio::test]
    async fn full_queue_drops_events() {
        let (_a, sink, _status) = actor(true);
        for _ in 0..QUEUE_CAPACITY {
            assert!(sink.post(Event::Tick));
        }
        assert!(!sink.post(Event::Tick));
    }
}
