//! Simulated distance sensor for development without a TFmini.
//!
//! An empty corridor reads as a noisy far wall. Visitors arrive at random,
//! stand within range for a while, then leave. The sensor occasionally
//! reports zero (no return), as the real one does.

use anyhow::Result;
use std::fmt;

use crate::sensor::DistanceSensor;

/// Far wall of the simulated corridor.
const EMPTY_CM: u16 = 420;
const EMPTY_NOISE_CM: u16 = 15;
/// Where a visitor stands.
const VISIT_CM: std::ops::RangeInclusive<u16> = 40..=150;

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured profiles selected by `sensor.scenario`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Someone passes every minute or so and lingers a few seconds.
    Quiet,
    /// Near-continuous traffic. Holds keep getting extended.
    Busy,
    /// Quiet traffic with frequent dropouts and spurious close readings.
    Flaky,
}

struct Profile {
    /// Chance per sample that a visitor arrives.
    arrive: f64,
    /// Visit length in samples.
    visit: std::ops::Range<u32>,
    /// Chance per sample of a zero reading.
    dropout: f64,
    /// Chance per sample of a spurious close reading while empty.
    ghost: f64,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "busy" => Self::Busy,
            "flaky" => Self::Flaky,
            _ => Self::Quiet, // default
        }
    }

    fn profile(self) -> Profile {
        match self {
            Self::Quiet => Profile {
                arrive: 0.001,
                visit: 40..120,
                dropout: 0.005,
                ghost: 0.0,
            },
            Self::Busy => Profile {
                arrive: 0.05,
                visit: 100..400,
                dropout: 0.005,
                ghost: 0.0,
            },
            Self::Flaky => Profile {
                arrive: 0.001,
                visit: 20..80,
                dropout: 0.08,
                ghost: 0.002,
            },
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Quiet => write!(f, "quiet"),
            Self::Busy => write!(f, "busy"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct PresenceSim {
    profile: Profile,
    rng: fastrand::Rng,
    /// Samples left in the current visit.
    visit_left: u32,
    standing_cm: u16,
}

impl PresenceSim {
    pub fn new(scenario: Scenario) -> Self {
        Self::with_rng(scenario, fastrand::Rng::new())
    }

    pub fn with_rng(scenario: Scenario, rng: fastrand::Rng) -> Self {
        Self {
            profile: scenario.profile(),
            rng,
            visit_left: 0,
            standing_cm: EMPTY_CM,
        }
    }

    pub fn sample(&mut self) -> u16 {
        let p = &self.profile;
        if self.visit_left == 0 && self.rng.f64() < p.arrive {
            self.visit_left = self.rng.u32(p.visit.clone());
            self.standing_cm = self.rng.u16(VISIT_CM);
        }

        if self.rng.f64() < p.dropout {
            return 0;
        }

        if self.visit_left > 0 {
            self.visit_left -= 1;
            // People sway a little.
            let sway = self.rng.u16(0..=6);
            return (self.standing_cm + sway).saturating_sub(3).max(1);
        }

        if self.rng.f64() < p.ghost {
            return self.rng.u16(VISIT_CM);
        }
        EMPTY_CM - EMPTY_NOISE_CM + self.rng.u16(0..=2 * EMPTY_NOISE_CM)
    }
}

impl DistanceSensor for PresenceSim {
    fn read_cm(&mut self) -> Result<Option<u16>> {
        Ok(Some(self.sample()))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
