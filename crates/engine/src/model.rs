//! Zone data model: timestamps, node addresses, modes, and the replicated
//! zone record every node in a zone converges on.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{AddrParseError, Ipv6Addr};
use std::ops::Add;
use std::str::FromStr;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Milliseconds on a monotonic clock local to this process.
///
/// The engine never reads a clock itself; every transition receives `now`
/// from the caller, which keeps the state machine replayable in tests.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    pub const fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn saturating_since(self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        let ms = u64::try_from(rhs.as_millis()).unwrap_or(u64::MAX);
        Timestamp(self.0.saturating_add(ms))
    }
}

/// Clamp a duration to the `u32` millisecond field carried on the wire.
pub fn wire_millis(d: Duration) -> u32 {
    u32::try_from(d.as_millis()).unwrap_or(u32::MAX)
}

// ---------------------------------------------------------------------------
// Addresses
// ---------------------------------------------------------------------------

/// Mesh-local address of a node. Carried on the wire as IPv6 text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeAddress(Ipv6Addr);

impl NodeAddress {
    pub const fn new(addr: Ipv6Addr) -> Self {
        Self(addr)
    }

    pub fn ip(&self) -> Ipv6Addr {
        self.0
    }

    /// `::` is what peers send when they know of no owner.
    pub fn is_unspecified(&self) -> bool {
        self.0.is_unspecified()
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeAddress {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<Ipv6Addr>().map(Self)
    }
}

// ---------------------------------------------------------------------------
// Modes
// ---------------------------------------------------------------------------

/// Lighting mode. The discriminants are the values used on the wire and in
/// the store (`m=0|1|2`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Off = 0,
    On = 1,
    Auto = 2,
}

impl Mode {
    pub fn from_wire(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Off),
            1 => Some(Self::On),
            2 => Some(Self::Auto),
            _ => None,
        }
    }

    pub fn as_wire(self) -> u8 {
        self as u8
    }

    /// Off and On own the relay outright; only Auto follows the zone hold.
    pub fn is_manual(self) -> bool {
        !matches!(self, Self::Auto)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::On => write!(f, "on"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

// ---------------------------------------------------------------------------
// Zone record
// ---------------------------------------------------------------------------

/// The replicated fact a zone agrees on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ZoneRecord {
    /// Generation of the current ownership claim. Never decreases.
    pub epoch: u32,
    /// Whether the automatic hold is in effect.
    pub active: bool,
    /// Instant the hold expires; meaningful only while `active`.
    pub deadline: Timestamp,
    /// Node that claimed the zone at `epoch`.
    pub owner: Option<NodeAddress>,
    /// Local memory of the hold is distrusted until the network confirms it.
    pub pending_restore: bool,
}

impl ZoneRecord {
    /// Drop the automatic hold. Leaves `epoch` and `pending_restore` alone.
    pub fn clear_hold(&mut self) {
        self.active = false;
        self.deadline = Timestamp::ZERO;
        self.owner = None;
    }

    /// Drop the hold and stop waiting for a restore.
    pub fn reset(&mut self) {
        self.clear_hold();
        self.pending_restore = false;
    }

    pub fn is_owned_by(&self, addr: NodeAddress) -> bool {
        self.owner == Some(addr)
    }

    /// Time left on the hold, zero when inactive or expired.
    pub fn remaining(&self, now: Timestamp) -> Duration {
        if self.active {
            self.deadline.saturating_since(now)
        } else {
            Duration::ZERO
        }
    }
}

/// Derived view of the engine, recomputed after every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FsmState {
    AutoIdle,
    AutoActive,
    ManualOn,
    ManualOff,
    PendingRestore,
}

impl FsmState {
    pub fn derive(mode: Mode, record: &ZoneRecord) -> Self {
        match mode {
            Mode::Off => Self::ManualOff,
            Mode::On => Self::ManualOn,
            Mode::Auto if record.pending_restore => Self::PendingRestore,
            Mode::Auto if record.active => Self::AutoActive,
            Mode::Auto => Self::AutoIdle,
        }
    }

    pub fn relay_on(self) -> bool {
        matches!(self, Self::ManualOn | Self::AutoActive)
    }
}

impl fmt::Display for FsmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AutoIdle => "auto-idle",
            Self::AutoActive => "auto-active",
            Self::ManualOn => "manual-on",
            Self::ManualOff => "manual-off",
            Self::PendingRestore => "pending-restore",
        };
        f.write_str(s)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
