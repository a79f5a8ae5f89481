//! Manual mode hierarchy: node > zone > global > local.

use serde::{Deserialize, Serialize};

use crate::model::Mode;

/// Which override slot a mode command targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeScope {
    Global,
    Zone(u8),
    Node,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneOverride {
    pub zone_id: u8,
    pub mode: Mode,
}

/// Where the effective mode came from, for the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeSource {
    Switch,
    Node,
    Zone,
    Global,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideSet {
    pub global: Option<Mode>,
    pub zone: Option<ZoneOverride>,
    pub node: Option<Mode>,
    /// Persisted base mode (switch position or last local command).
    pub local: Mode,
}

impl Default for OverrideSet {
    fn default() -> Self {
        Self::new(Mode::Auto)
    }
}

impl OverrideSet {
    pub fn new(local: Mode) -> Self {
        Self {
            global: None,
            zone: None,
            node: None,
            local,
        }
    }

    pub fn set(&mut self, scope: ModeScope, mode: Mode) {
        match scope {
            ModeScope::Global => self.global = Some(mode),
            ModeScope::Zone(zone_id) => self.zone = Some(ZoneOverride { zone_id, mode }),
            ModeScope::Node => self.node = Some(mode),
        }
    }

    /// Clear a slot. A zone clear only applies when it names the stored zone.
    /// Returns whether anything changed.
    pub fn clear(&mut self, scope: ModeScope) -> bool {
        match scope {
            ModeScope::Global => self.global.take().is_some(),
            ModeScope::Node => self.node.take().is_some(),
            ModeScope::Zone(zone_id) => match self.zone {
                Some(z) if z.zone_id == zone_id => {
                    self.zone = None;
                    true
                }
                _ => false,
            },
        }
    }

    /// Ordered override chain, highest priority first.
    fn chain(&self, my_zone: u8) -> [(ModeSource, Option<Mode>); 3] {
        let zone = self
            .zone
            .filter(|z| z.zone_id == my_zone)
            .map(|z| z.mode);
        [
            (ModeSource::Node, self.node),
            (ModeSource::Zone, zone),
            (ModeSource::Global, self.global),
        ]
    }

    pub fn resolve(&self, my_zone: u8) -> (ModeSource, Mode) {
        self.chain(my_zone)
            .into_iter()
            .find_map(|(source, mode)| mode.map(|m| (source, m)))
            .unwrap_or((ModeSource::Local, self.local))
    }

    pub fn effective(&self, my_zone: u8) -> Mode {
        self.resolve(my_zone).1
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_mode_when_no_override() {
        let o = OverrideSet::new(Mode::Off);
        assert_eq!(o.resolve(1), (ModeSource::Local, Mode::Off));
    }

    #[test]
    fn node_beats_zone_beats_global() {
        let mut o = OverrideSet::new(Mode::Auto);
        o.set(ModeScope::Global, Mode::Off);
        assert_eq!(o.effective(1), Mode::Off);

        o.set(ModeScope::Zone(1), Mode::On);
        assert_eq!(o.resolve(1), (ModeSource::Zone, Mode::On));

        o.set(ModeScope::Node, Mode::Auto);
        assert_eq!(o.resolve(1), (ModeSource::Node, Mode::Auto));
    }

    #[test]
    fn zone_override_for_other_zone_is_ignored() {
        let mut o = OverrideSet::new(Mode::Auto);
        o.set(ModeScope::Zone(4), Mode::Off);
        assert_eq!(o.effective(1), Mode::Auto);
        assert_eq!(o.effective(4), Mode::Off);
    }

    #[test]
    fn zone_clear_must_name_stored_zone() {
        let mut o = OverrideSet::new(Mode::Auto);
        o.set(ModeScope::Zone(2), Mode::On);
        assert!(!o.clear(ModeScope::Zone(3)));
        assert!(o.zone.is_some());
        assert!(o.clear(ModeScope::Zone(2)));
        assert!(o.zone.is_none());
    }

    #[test]
    fn clearing_empty_slot_reports_no_change() {
        let mut o = OverrideSet::default();
        assert!(!o.clear(ModeScope::Global));
        assert!(!o.clear(ModeScope::Node));
        o.set(ModeScope::Node, Mode::On);
        assert!(o.clear(ModeScope::Node));
    }
}
