//! Zone ownership and motion-hold reconciliation for mesh lighting nodes.
//!
//! The crate is pure: no I/O, no clock. A node binary owns one
//! [`EngineState`], feeds it [`Event`]s with the current [`Timestamp`], and
//! carries out the returned [`ActionSet`].

pub mod action;
pub mod dedup;
pub mod fsm;
pub mod model;
pub mod overrides;
pub mod timing;

pub use action::{ActionSet, Outbound, PersistedState};
pub use fsm::{transition, EngineConfig, EngineState, EngineStatus, Event, RestoreKind, Role};
pub use model::{wire_millis, FsmState, Mode, NodeAddress, Timestamp, ZoneRecord};
pub use overrides::{ModeScope, ModeSource, OverrideSet, ZoneOverride};
pub use timing::Timing;
