use serde::Serialize;
use std::collections::VecDeque;
use time::OffsetDateTime;

use zonelight_engine::{EngineStatus, FsmState};

/// Maximum number of transitions retained in the ring buffer.
const MAX_TRANSITIONS: usize = 50;

// ---------------------------------------------------------------------------
// Transition log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct TransitionEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub from: FsmState,
    pub to: FsmState,
    pub epoch: u32,
}

#[derive(Debug, Default)]
pub struct TransitionLog {
    entries: VecDeque<TransitionEntry>,
}

impl TransitionLog {
    pub fn push(&mut self, from: FsmState, to: FsmState, epoch: u32) {
        if self.entries.len() >= MAX_TRANSITIONS {
            self.entries.pop_front();
        }
        self.entries.push_back(TransitionEntry {
            at: OffsetDateTime::now_utc(),
            from,
            to,
            epoch,
        });
    }

    /// Newest first.
    pub fn recent(&self) -> Vec<TransitionEntry> {
        self.entries.iter().rev().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub uptime_secs: u64,
    pub joined: bool,
    pub engine: Option<EngineStatus>,
    pub transitions: Vec<TransitionEntry>,
}

impl NodeStatus {
    /// Placeholder published before the actor has run its first cycle.
    pub fn starting() -> Self {
        Self {
            uptime_secs: 0,
            joined: false,
            engine: None,
            transitions: Vec::new(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_is_bounded_and_newest_first() {
        let mut log = TransitionLog::default();
        for epoch in 0..(MAX_TRANSITIONS as u32 + 5) {
            log.push(FsmState::AutoIdle, FsmState::AutoActive, epoch);
        }
        let recent = log.recent();
        assert_eq!(recent.len(), MAX_TRANSITIONS);
        assert_eq!(recent[0].epoch, MAX_TRANSITIONS as u32 + 4);
        assert_eq!(recent.last().unwrap().epoch, 5);
    }

    #[test]
    fn entry_serializes_rfc3339() {
        let mut log = TransitionLog::default();
        log.push(FsmState::PendingRestore, FsmState::AutoIdle, 3);
        let json = serde_json::to_value(&log.recent()[0]).unwrap();
        assert_eq!(json["from"], "pending_restore");
        assert_eq!(json["to"], "auto_idle");
        assert!(json["at"].as_str().unwrap().contains('T'));
    }
}
