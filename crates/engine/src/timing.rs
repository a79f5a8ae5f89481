//! Protocol timing constants.
//!
//! The magnitudes are what deployed peers already use. Change them only
//! through [`Timing`] overrides, never by editing the defaults.

use std::time::Duration;

/// Minimum same-epoch deadline change that is accepted.
pub const GUARD_BAND: Duration = Duration::from_millis(300);
/// Local sensor re-fires inside this window are ignored.
pub const LOCAL_TRIGGER_DEBOUNCE: Duration = Duration::from_millis(800);
/// How long an accepted (epoch, sender) pair suppresses retransmissions.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(2);
/// Restore window after a warm restart.
pub const WAKE_RESTORE_WINDOW: Duration = Duration::from_millis(1_200);
pub const WAKE_RETRY_INTERVAL: Duration = Duration::from_secs(1);
/// Restore window after a power-on or brownout.
pub const COLD_BOOT_WINDOW: Duration = Duration::from_secs(180);
pub const COLD_BOOT_RETRY_INTERVAL: Duration = Duration::from_secs(5);
/// Coalescing window for store writes.
pub const PERSIST_DEBOUNCE: Duration = Duration::from_secs(1);
pub const TICK_INTERVAL: Duration = Duration::from_millis(50);
/// Default automatic hold after motion.
pub const DEFAULT_HOLD: Duration = Duration::from_millis(300_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub guard_band: Duration,
    pub local_trigger_debounce: Duration,
    pub dedup_window: Duration,
    pub wake_restore_window: Duration,
    pub wake_retry_interval: Duration,
    pub cold_boot_window: Duration,
    pub cold_boot_retry_interval: Duration,
    pub persist_debounce: Duration,
    pub tick_interval: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            guard_band: GUARD_BAND,
            local_trigger_debounce: LOCAL_TRIGGER_DEBOUNCE,
            dedup_window: DEDUP_WINDOW,
            wake_restore_window: WAKE_RESTORE_WINDOW,
            wake_retry_interval: WAKE_RETRY_INTERVAL,
            cold_boot_window: COLD_BOOT_WINDOW,
            cold_boot_retry_interval: COLD_BOOT_RETRY_INTERVAL,
            persist_debounce: PERSIST_DEBOUNCE,
            tick_interval: TICK_INTERVAL,
        }
    }
}
