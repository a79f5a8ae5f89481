//! Relay, RGB indicator and mode switch. The `gpio` feature gates the real
//! rppal driver; without it, a mock implementation logs state changes.

use anyhow::Result;
use std::thread;
use std::time::Duration;
use tracing::info;

use zonelight_engine::{Event, Mode};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, InputPin, OutputPin};

use crate::actor::{EventSink, Outputs};
use crate::config::GpioSection;

const SWITCH_POLL: Duration = Duration::from_millis(100);

/// Indicator colour per mode: Off red, Auto green, On blue.
pub fn indicator_rgb(mode: Mode) -> [bool; 3] {
    match mode {
        Mode::Off => [true, false, false],
        Mode::Auto => [false, true, false],
        Mode::On => [false, false, true],
    }
}

/// Two-pin switch: both low is Off, only `b` high is On, anything else Auto.
pub fn switch_mode(a: bool, b: bool) -> Mode {
    match (a, b) {
        (false, false) => Mode::Off,
        (false, true) => Mode::On,
        _ => Mode::Auto,
    }
}

// ---------------------------------------------------------------------------
// Real GPIO board (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct IoBoard {
    relay: OutputPin,
    active_low: bool,
    led: [OutputPin; 3],
}

#[cfg(feature = "gpio")]
impl IoBoard {
    pub fn new(cfg: &GpioSection) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut relay = gpio.get(cfg.relay_pin)?.into_output();
        let [r, g, b] = cfg.led_pins;
        let led = [
            gpio.get(r)?.into_output_low(),
            gpio.get(g)?.into_output_low(),
            gpio.get(b)?.into_output_low(),
        ];

        // Fail-safe: relay off at startup.
        if cfg.relay_active_low {
            relay.set_high();
        } else {
            relay.set_low();
        }

        info!(relay = cfg.relay_pin, led = ?cfg.led_pins, "gpio board initialised");
        Ok(Self {
            relay,
            active_low: cfg.relay_active_low,
            led,
        })
    }
}

#[cfg(feature = "gpio")]
impl Outputs for IoBoard {
    fn set_relay(&mut self, on: bool) {
        // active-low relay: LOW = ON, HIGH = OFF
        if on != self.active_low {
            self.relay.set_high();
        } else {
            self.relay.set_low();
        }
        info!(on, "relay");
    }

    fn set_indicator(&mut self, mode: Mode) {
        for (pin, lit) in self.led.iter_mut().zip(indicator_rgb(mode)) {
            if lit {
                pin.set_high();
            } else {
                pin.set_low();
            }
        }
        info!(%mode, "indicator");
    }
}

#[cfg(feature = "gpio")]
pub struct ModeSwitch {
    a: InputPin,
    b: InputPin,
}

#[cfg(feature = "gpio")]
impl ModeSwitch {
    pub fn new(cfg: &GpioSection) -> Result<Self> {
        let gpio = Gpio::new()?;
        let [a, b] = cfg.switch_pins;
        Ok(Self {
            a: gpio.get(a)?.into_input_pullup(),
            b: gpio.get(b)?.into_input_pullup(),
        })
    }

    pub fn read(&self) -> Mode {
        switch_mode(self.a.is_high(), self.b.is_high())
    }
}

// ---------------------------------------------------------------------------
// Mock board (development, no hardware, logs state)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct IoBoard {
    pub(super) relay: bool,
    pub(super) indicator: Option<Mode>,
}

#[cfg(not(feature = "gpio"))]
impl IoBoard {
    pub fn new(cfg: &GpioSection) -> Result<Self> {
        info!(
            relay = cfg.relay_pin,
            led = ?cfg.led_pins,
            "[mock-gpio] io board initialised (no hardware)"
        );
        Ok(Self {
            relay: false,
            indicator: None,
        })
    }
}

#[cfg(not(feature = "gpio"))]
impl Outputs for IoBoard {
    fn set_relay(&mut self, on: bool) {
        if self.relay != on {
            info!(on, "[mock-gpio] relay");
        }
        self.relay = on;
    }

    fn set_indicator(&mut self, mode: Mode) {
        info!(%mode, rgb = ?indicator_rgb(mode), "[mock-gpio] indicator");
        self.indicator = Some(mode);
    }
}

#[cfg(not(feature = "gpio"))]
pub struct ModeSwitch {
    pub(super) position: Mode,
}

#[cfg(not(feature = "gpio"))]
impl ModeSwitch {
    pub fn new(cfg: &GpioSection) -> Result<Self> {
        info!(pins = ?cfg.switch_pins, "[mock-gpio] mode switch fixed at auto");
        Ok(Self {
            position: Mode::Auto,
        })
    }

    pub fn read(&self) -> Mode {
        self.position
    }
}

// ---------------------------------------------------------------------------
// Switch poller
// ---------------------------------------------------------------------------

/// Post a `SwitchPosition` whenever the switch moves. `last` is the
/// position already reported at boot.
pub fn spawn_switch_poller(switch: ModeSwitch, mut last: Mode, sink: EventSink) -> Result<()> {
    thread::Builder::new()
        .name("mode-switch".into())
        .spawn(move || loop {
            thread::sleep(SWITCH_POLL);
            let now = switch.read();
            // A dropped post leaves `last` alone so the next poll retries.
            if now != last && sink.post(Event::SwitchPosition { mode: now }) {
                info!(from = %last, to = %now, "mode switch moved");
                last = now;
            }
        })?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
