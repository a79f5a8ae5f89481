//! Effects returned by a transition, plus the flat record handed to the store.

use serde::{Deserialize, Serialize};

use crate::model::{FsmState, Mode, NodeAddress, Timestamp};
use crate::overrides::OverrideSet;

/// Zone messages the engine asks the transport to send. All of them go to
/// the zone; none expects a reply the engine waits on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    StateRequest,
    StateResponse {
        epoch: u32,
        owner: Option<NodeAddress>,
        remaining_ms: u32,
        active: bool,
    },
    Trigger {
        epoch: u32,
        remaining_ms: u32,
    },
    Off {
        epoch: u32,
    },
}

/// Everything the store needs to bring a node back after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub epoch: u32,
    pub active: bool,
    pub deadline: Timestamp,
    pub owner: Option<NodeAddress>,
    pub overrides: OverrideSet,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            epoch: 0,
            active: false,
            deadline: Timestamp::ZERO,
            owner: None,
            overrides: OverrideSet::new(Mode::Auto),
        }
    }
}

/// Applied by the actor in field order: indicator, relay, outbound, flush,
/// transition log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionSet {
    pub indicator: Option<Mode>,
    pub relay: Option<bool>,
    pub outbound: Vec<Outbound>,
    pub flush: Option<PersistedState>,
    pub transition: Option<(FsmState, FsmState)>,
}

impl ActionSet {
    pub fn is_empty(&self) -> bool {
        self.indicator.is_none()
            && self.relay.is_none()
            && self.outbound.is_empty()
            && self.flush.is_none()
            && self.transition.is_none()
    }
}
