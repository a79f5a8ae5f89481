//! TOML node configuration: loading, environment overrides, and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

use zonelight_engine::{EngineConfig, NodeAddress, Role, Timing};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    pub node: NodeSection,
    #[serde(default)]
    pub sensor: SensorSection,
    #[serde(default)]
    pub gpio: GpioSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub web: WebSection,
    #[serde(default)]
    pub timing: TimingSection,
}

#[derive(Debug, Deserialize)]
pub struct NodeSection {
    /// Mesh-local IPv6 address this node is known by.
    pub address: String,
    #[serde(default = "default_zone_id")]
    pub zone_id: u32,
    #[serde(default)]
    pub role: RoleName,
    #[serde(default = "default_hold_ms")]
    pub hold_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleName {
    #[default]
    Actuator,
    Controller,
}

#[derive(Debug, Deserialize)]
pub struct SensorSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Anything closer than this counts as presence.
    #[serde(default = "default_trigger_cm")]
    pub trigger_cm: u16,
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
    #[serde(default = "default_uart")]
    pub uart: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Simulator profile when no real sensor is compiled in.
    #[serde(default)]
    pub scenario: String,
}

#[derive(Debug, Deserialize)]
pub struct GpioSection {
    #[serde(default = "default_relay_pin")]
    pub relay_pin: u8,
    /// Many common relay boards are active-low.
    #[serde(default = "default_true")]
    pub relay_active_low: bool,
    /// Red, green, blue.
    #[serde(default = "default_led_pins")]
    pub led_pins: [u8; 3],
    /// Two-pin mode switch, controller role only.
    #[serde(default = "default_switch_pins")]
    pub switch_pins: [u8; 2],
}

#[derive(Debug, Deserialize)]
pub struct MqttSection {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_sec: u64,
}

#[derive(Debug, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_db_url")]
    pub db_url: String,
}

#[derive(Debug, Deserialize)]
pub struct WebSection {
    #[serde(default = "default_web_port")]
    pub port: u16,
}

/// Optional overrides of the protocol timing, all in milliseconds.
#[derive(Debug, Default, Deserialize)]
pub struct TimingSection {
    pub guard_band_ms: Option<u64>,
    pub local_trigger_debounce_ms: Option<u64>,
    pub dedup_window_ms: Option<u64>,
    pub wake_restore_window_ms: Option<u64>,
    pub wake_retry_interval_ms: Option<u64>,
    pub cold_boot_window_ms: Option<u64>,
    pub cold_boot_retry_interval_ms: Option<u64>,
    pub persist_debounce_ms: Option<u64>,
    pub tick_interval_ms: Option<u64>,
}

fn default_zone_id() -> u32 {
    1
}
fn default_hold_ms() -> u64 {
    300_000
}
fn default_true() -> bool {
    true
}
fn default_trigger_cm() -> u16 {
    165
}
fn default_poll_ms() -> u64 {
    50
}
fn default_uart() -> String {
    "/dev/serial0".to_string()
}
fn default_baud() -> u32 {
    115_200
}
fn default_relay_pin() -> u8 {
    17
}
fn default_led_pins() -> [u8; 3] {
    [22, 23, 24]
}
fn default_switch_pins() -> [u8; 2] {
    [5, 6]
}
fn default_mqtt_host() -> String {
    "127.0.0.1".to_string()
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_keep_alive() -> u64 {
    30
}
fn default_db_url() -> String {
    "sqlite:zonelight.db?mode=rwc".to_string()
}
fn default_web_port() -> u16 {
    8080
}

impl Default for SensorSection {
    fn default() -> Self {
        Self {
            enabled: true,
            trigger_cm: default_trigger_cm(),
            poll_ms: default_poll_ms(),
            uart: default_uart(),
            baud: default_baud(),
            scenario: String::new(),
        }
    }
}

impl Default for GpioSection {
    fn default() -> Self {
        Self {
            relay_pin: default_relay_pin(),
            relay_active_low: true,
            led_pins: default_led_pins(),
            switch_pins: default_switch_pins(),
        }
    }
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            keep_alive_sec: default_keep_alive(),
        }
    }
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_url: default_db_url(),
        }
    }
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            port: default_web_port(),
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM; 14-15 carry the UART the
/// distance sensor sits on.
const VALID_GPIO_PINS: &[u8] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// TFmini range ceiling.
const MAX_TRIGGER_CM: u16 = 1_200;

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

impl Config {
    /// Apply `MQTT_HOST`, `MQTT_PORT`, `DB_URL`, `WEB_PORT`, `NODE_ADDRESS`
    /// and `RELAY_ACTIVE_LOW` on top of the file. Unparseable numbers are
    /// ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup("MQTT_PORT").and_then(|s| s.parse().ok()) {
            self.mqtt.port = port;
        }
        if let Some(url) = lookup("DB_URL") {
            self.storage.db_url = url;
        }
        if let Some(port) = lookup("WEB_PORT").and_then(|s| s.parse().ok()) {
            self.web.port = port;
        }
        if let Some(addr) = lookup("NODE_ADDRESS") {
            self.node.address = addr;
        }
        if let Some(v) = lookup("RELAY_ACTIVE_LOW") {
            self.gpio.relay_active_low = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_node(&mut errors);
        self.validate_sensor(&mut errors);
        self.validate_gpio(&mut errors);
        self.validate_transport(&mut errors);
        self.validate_timing(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_node(&self, errors: &mut Vec<String>) {
        let n = &self.node;
        match n.address.parse::<NodeAddress>() {
            Ok(addr) if addr.is_unspecified() => {
                errors.push("node: address must not be the unspecified address ::".to_string())
            }
            Ok(_) => {}
            Err(_) => errors.push(format!("node: address {:?} is not an IPv6 address", n.address)),
        }
        if !(1..=255).contains(&n.zone_id) {
            errors.push(format!("node: zone_id {} out of range [1, 255]", n.zone_id));
        }
        if n.hold_ms == 0 || n.hold_ms > u64::from(u32::MAX) {
            errors.push(format!(
                "node: hold_ms must be in [1, {}], got {}",
                u32::MAX,
                n.hold_ms
            ));
        }
    }

    fn validate_sensor(&self, errors: &mut Vec<String>) {
        let s = &self.sensor;
        if s.trigger_cm == 0 || s.trigger_cm > MAX_TRIGGER_CM {
            errors.push(format!(
                "sensor: trigger_cm {} out of range [1, {MAX_TRIGGER_CM}]",
                s.trigger_cm
            ));
        }
        if s.poll_ms == 0 {
            errors.push("sensor: poll_ms must be positive".to_string());
        }
        if s.uart.trim().is_empty() {
            errors.push("sensor: uart is empty".to_string());
        }
    }

    fn validate_gpio(&self, errors: &mut Vec<String>) {
        let g = &self.gpio;
        let mut pins: Vec<(&str, u8)> = vec![("relay_pin", g.relay_pin)];
        pins.extend(["led red", "led green", "led blue"].into_iter().zip(g.led_pins));
        if self.node.role == RoleName::Controller {
            pins.extend(["switch a", "switch b"].into_iter().zip(g.switch_pins));
        }

        let mut seen: HashSet<u8> = HashSet::new();
        for (name, pin) in pins {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "gpio: {name} pin {pin} is not a usable BCM GPIO pin"
                ));
            } else if !seen.insert(pin) {
                errors.push(format!("gpio: {name} pin {pin} is already in use"));
            }
        }
    }

    fn validate_transport(&self, errors: &mut Vec<String>) {
        if self.mqtt.host.trim().is_empty() {
            errors.push("mqtt: host is empty".to_string());
        }
        if self.mqtt.port == 0 {
            errors.push("mqtt: port must be non-zero".to_string());
        }
        if self.mqtt.keep_alive_sec < 5 {
            errors.push(format!(
                "mqtt: keep_alive_sec {} is below the 5 s minimum",
                self.mqtt.keep_alive_sec
            ));
        }
        if self.storage.db_url.trim().is_empty() {
            errors.push("storage: db_url is empty".to_string());
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        let t = &self.timing;
        let positive = [
            ("guard_band_ms", t.guard_band_ms),
            ("local_trigger_debounce_ms", t.local_trigger_debounce_ms),
            ("dedup_window_ms", t.dedup_window_ms),
            ("wake_restore_window_ms", t.wake_restore_window_ms),
            ("wake_retry_interval_ms", t.wake_retry_interval_ms),
            ("cold_boot_window_ms", t.cold_boot_window_ms),
            ("cold_boot_retry_interval_ms", t.cold_boot_retry_interval_ms),
            ("persist_debounce_ms", t.persist_debounce_ms),
            ("tick_interval_ms", t.tick_interval_ms),
        ];
        for (name, value) in positive {
            if value == Some(0) {
                errors.push(format!("timing: {name} must be positive"));
            }
        }

        let timing = self.timing();
        if timing.wake_retry_interval > timing.wake_restore_window {
            errors.push(
                "timing: wake_retry_interval_ms exceeds wake_restore_window_ms".to_string(),
            );
        }
        if timing.cold_boot_retry_interval > timing.cold_boot_window {
            errors.push(
                "timing: cold_boot_retry_interval_ms exceeds cold_boot_window_ms".to_string(),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Engine wiring
// ---------------------------------------------------------------------------

impl Config {
    pub fn timing(&self) -> Timing {
        let t = &self.timing;
        let ms = |v: Option<u64>, d: Duration| v.map(Duration::from_millis).unwrap_or(d);
        let base = Timing::default();
        Timing {
            guard_band: ms(t.guard_band_ms, base.guard_band),
            local_trigger_debounce: ms(t.local_trigger_debounce_ms, base.local_trigger_debounce),
            dedup_window: ms(t.dedup_window_ms, base.dedup_window),
            wake_restore_window: ms(t.wake_restore_window_ms, base.wake_restore_window),
            wake_retry_interval: ms(t.wake_retry_interval_ms, base.wake_retry_interval),
            cold_boot_window: ms(t.cold_boot_window_ms, base.cold_boot_window),
            cold_boot_retry_interval: ms(
                t.cold_boot_retry_interval_ms,
                base.cold_boot_retry_interval,
            ),
            persist_debounce: ms(t.persist_debounce_ms, base.persist_debounce),
            tick_interval: ms(t.tick_interval_ms, base.tick_interval),
        }
    }

    pub fn address(&self) -> Result<NodeAddress> {
        self.node
            .address
            .parse()
            .with_context(|| format!("invalid node address {:?}", self.node.address))
    }

    pub fn engine(&self) -> Result<EngineConfig> {
        let zone_id = u8::try_from(self.node.zone_id)
            .with_context(|| format!("zone_id {} out of range", self.node.zone_id))?;
        Ok(EngineConfig {
            address: self.address()?,
            zone_id,
            role: match self.node.role {
                RoleName::Actuator => Role::Actuator,
                RoleName::Controller => Role::Controller,
            },
            hold: Duration::from_millis(self.node.hold_ms),
            timing: self.timing(),
        })
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, apply process environment, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let mut config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config.apply_env(|key| std::env::var(key).ok());
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MINIMAL: &str = r#"
[node]
address = "fd00::1"
"#;

    fn minimal() -> Config {
        toml::from_str(MINIMAL).unwrap()
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = minimal();
        assert_eq!(cfg.node.zone_id, 1);
        assert_eq!(cfg.node.role, RoleName::Actuator);
        assert_eq!(cfg.node.hold_ms, 300_000);
        assert_eq!(cfg.sensor.trigger_cm, 165);
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.web.port, 8080);
        assert!(cfg.gpio.relay_active_low);
        cfg.validate().unwrap();
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[node]
address = "fd00::2"
zone_id = 4
role = "controller"
hold_ms = 60000

[sensor]
trigger_cm = 120
scenario = "busy"

[gpio]
relay_pin = 18
led_pins = [19, 20, 21]
switch_pins = [25, 26]

[mqtt]
host = "broker.local"
port = 1884

[storage]
db_url = "sqlite::memory:"

[timing]
guard_band_ms = 500
cold_boot_window_ms = 60000
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.node.role, RoleName::Controller);
        assert_eq!(cfg.gpio.switch_pins, [25, 26]);

        let engine = cfg.engine().unwrap();
        assert_eq!(engine.zone_id, 4);
        assert_eq!(engine.role, Role::Controller);
        assert_eq!(engine.hold, Duration::from_secs(60));
        assert_eq!(engine.timing.guard_band, Duration::from_millis(500));
        assert_eq!(engine.timing.cold_boot_window, Duration::from_secs(60));
        assert_eq!(engine.timing.dedup_window, Timing::default().dedup_window);
    }

    #[test]
    fn missing_node_section_is_parse_error() {
        assert!(toml::from_str::<Config>("").is_err());
    }

    #[test]
    fn unknown_role_is_parse_error() {
        let toml_str = "[node]\naddress = \"fd00::1\"\nrole = \"bridge\"\n";
        assert!(toml::from_str::<Config>(toml_str).is_err());
    }

    // -- Environment ------------------------------------------------------

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("MQTT_HOST", "10.0.0.5"),
            ("MQTT_PORT", "2883"),
            ("DB_URL", "sqlite::memory:"),
            ("WEB_PORT", "not-a-port"),
            ("RELAY_ACTIVE_LOW", "false"),
        ]
        .into_iter()
        .collect();

        let mut cfg = minimal();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.mqtt.host, "10.0.0.5");
        assert_eq!(cfg.mqtt.port, 2883);
        assert_eq!(cfg.storage.db_url, "sqlite::memory:");
        assert_eq!(cfg.web.port, 8080, "unparseable value ignored");
        assert!(!cfg.gpio.relay_active_low);
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn bad_address_rejected() {
        let mut cfg = minimal();
        cfg.node.address = "node-a".into();
        assert_validation_err(&cfg, "not an IPv6 address");
        cfg.node.address = "::".into();
        assert_validation_err(&cfg, "unspecified");
    }

    #[test]
    fn zone_id_range() {
        let mut cfg = minimal();
        cfg.node.zone_id = 0;
        assert_validation_err(&cfg, "zone_id 0 out of range");
        cfg.node.zone_id = 256;
        assert_validation_err(&cfg, "zone_id 256 out of range");
    }

    #[test]
    fn zero_hold_rejected() {
        let mut cfg = minimal();
        cfg.node.hold_ms = 0;
        assert_validation_err(&cfg, "hold_ms");
    }

    #[test]
    fn trigger_distance_bounds() {
        let mut cfg = minimal();
        cfg.sensor.trigger_cm = 0;
        assert_validation_err(&cfg, "trigger_cm 0");
        cfg.sensor.trigger_cm = 5_000;
        assert_validation_err(&cfg, "trigger_cm 5000");
    }

    #[test]
    fn reserved_gpio_pin_rejected() {
        let mut cfg = minimal();
        cfg.gpio.relay_pin = 14;
        assert_validation_err(&cfg, "relay_pin pin 14 is not a usable");
    }

    #[test]
    fn duplicate_gpio_pin_rejected() {
        let mut cfg = minimal();
        cfg.gpio.led_pins = [22, 17, 24];
        assert_validation_err(&cfg, "led green pin 17 is already in use");
    }

    #[test]
    fn switch_pins_checked_only_for_controller() {
        let mut cfg = minimal();
        cfg.gpio.switch_pins = [17, 17];
        cfg.validate().unwrap();
        cfg.node.role = RoleName::Controller;
        assert_validation_err(&cfg, "switch a pin 17 is already in use");
    }

    #[test]
    fn zero_timing_override_rejected() {
        let mut cfg = minimal();
        cfg.timing.tick_interval_ms = Some(0);
        assert_validation_err(&cfg, "tick_interval_ms must be positive");
    }

    #[test]
    fn retry_longer_than_window_rejected() {
        let mut cfg = minimal();
        cfg.timing.wake_retry_interval_ms = Some(5_000);
        assert_validation_err(&cfg, "wake_retry_interval_ms exceeds");
    }

    #[test]
    fn all_errors_reported_together() {
        let mut cfg = minimal();
        cfg.node.zone_id = 0;
        cfg.mqtt.host = String::new();
        cfg.storage.db_url = " ".into();
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "got: {msg}");
    }

    #[test]
    fn load_reports_missing_file() {
        let err = load("/nonexistent/zonelight.toml").unwrap_err();
        assert!(format!("{err:#}").contains("failed to read config"));
    }
}
