//! Retransmission filter for remote claims.
//!
//! Remembers the last accepted claim per event class. A repeat of the same
//! (epoch, sender) inside the window whose remaining time is within the guard
//! band is a retransmission; passing it to the epoch rule would let it stretch
//! the deadline by however long it sat in the network.

use std::time::Duration;

use crate::model::{NodeAddress, Timestamp};
use crate::timing::Timing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimKind {
    Trigger,
    StateResponse,
}

#[derive(Debug, Clone, Copy)]
struct Seen {
    epoch: u32,
    peer: NodeAddress,
    remaining_ms: u32,
    at: Timestamp,
}

#[derive(Debug, Default)]
pub struct DedupCache {
    trigger: Option<Seen>,
    state_response: Option<Seen>,
}

impl DedupCache {
    fn slot(&self, kind: ClaimKind) -> &Option<Seen> {
        match kind {
            ClaimKind::Trigger => &self.trigger,
            ClaimKind::StateResponse => &self.state_response,
        }
    }

    pub fn is_duplicate(
        &self,
        kind: ClaimKind,
        epoch: u32,
        peer: NodeAddress,
        remaining_ms: u32,
        now: Timestamp,
        timing: &Timing,
    ) -> bool {
        let Some(seen) = self.slot(kind) else {
            return false;
        };
        if seen.epoch != epoch || seen.peer != peer {
            return false;
        }
        if now.saturating_since(seen.at) >= timing.dedup_window {
            return false;
        }
        let delta = Duration::from_millis(u64::from(seen.remaining_ms.abs_diff(remaining_ms)));
        delta < timing.guard_band
    }

    pub fn record(
        &mut self,
        kind: ClaimKind,
        epoch: u32,
        peer: NodeAddress,
        remaining_ms: u32,
        now: Timestamp,
    ) {
        let seen = Some(Seen {
            epoch,
            peer,
            remaining_ms,
            at: now,
        });
        match kind {
            ClaimKind::Trigger => self.trigger = seen,
            ClaimKind::StateResponse => self.state_response = seen,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
