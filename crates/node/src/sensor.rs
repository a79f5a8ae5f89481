//! Distance sensing: the TFmini frame decoder, the UART driver behind the
//! `tfmini` feature, and the poller that turns presence into local triggers.

use anyhow::Result;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use zonelight_engine::Event;

#[cfg(feature = "tfmini")]
use rppal::uart::{Parity, Uart};

use crate::actor::EventSink;
use crate::config::SensorSection;

pub const FRAME_LEN: usize = 9;
const HEADER: u8 = 0x59;
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub trait DistanceSensor {
    /// Latest distance in centimetres, `None` when nothing new arrived.
    fn read_cm(&mut self) -> Result<Option<u16>>;
}

// ---------------------------------------------------------------------------
// TFmini frames
// ---------------------------------------------------------------------------

/// `59 59 Dist_L Dist_H Str_L Str_H Temp_L Temp_H Checksum`, checksum being
/// the low byte of the sum of the first eight bytes.
pub fn decode_frame(frame: &[u8; FRAME_LEN]) -> Option<u16> {
    if frame[0] != HEADER || frame[1] != HEADER {
        return None;
    }
    let sum = frame[..8].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum != frame[8] {
        return None;
    }
    Some(u16::from_le_bytes([frame[2], frame[3]]))
}

/// Reassembles frames from an unaligned byte stream.
#[derive(Debug, Default)]
pub struct FrameScanner {
    buf: [u8; FRAME_LEN],
    len: usize,
}

impl FrameScanner {
    pub fn push(&mut self, byte: u8) -> Option<u16> {
        if self.len < 2 && byte != HEADER {
            self.len = 0;
            return None;
        }
        self.buf[self.len] = byte;
        self.len += 1;
        if self.len < FRAME_LEN {
            return None;
        }
        self.len = 0;
        decode_frame(&self.buf)
    }
}

/// Zero means the sensor saw no return.
pub fn is_present(distance_cm: u16, trigger_cm: u16) -> bool {
    distance_cm > 0 && distance_cm <= trigger_cm
}

// ---------------------------------------------------------------------------
// UART driver (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "tfmini")]
pub struct TfMini {
    uart: Uart,
    scanner: FrameScanner,
}

#[cfg(feature = "tfmini")]
impl TfMini {
    pub fn open(path: &str, baud: u32) -> Result<Self> {
        let mut uart = Uart::with_path(path, baud, Parity::None, 8, 1)?;
        uart.set_read_mode(0, Duration::from_millis(20))?;
        info!(%path, baud, "tfmini opened");
        Ok(Self {
            uart,
            scanner: FrameScanner::default(),
        })
    }
}

#[cfg(feature = "tfmini")]
impl DistanceSensor for TfMini {
    fn read_cm(&mut self) -> Result<Option<u16>> {
        let mut bytes = [0u8; 4 * FRAME_LEN];
        let n = self.uart.read(&mut bytes)?;
        Ok(bytes[..n].iter().filter_map(|b| self.scanner.push(*b)).last())
    }
}

/// Pick the sensor the build supports. `Ok(None)` leaves the node without
/// local presence detection.
pub fn open(cfg: &SensorSection) -> Result<Option<Box<dyn DistanceSensor + Send>>> {
    if !cfg.enabled {
        info!("distance sensor disabled");
        return Ok(None);
    }

    #[cfg(feature = "tfmini")]
    {
        Ok(Some(Box::new(TfMini::open(&cfg.uart, cfg.baud)?)))
    }

    #[cfg(all(not(feature = "tfmini"), feature = "sim"))]
    {
        let scenario = crate::sim::Scenario::from_str_lossy(&cfg.scenario);
        info!(%scenario, "[sim] presence simulator");
        Ok(Some(Box::new(crate::sim::PresenceSim::new(scenario))))
    }

    #[cfg(not(any(feature = "tfmini", feature = "sim")))]
    {
        warn!("no distance sensor compiled in");
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

pub fn spawn_sensor_poller(
    mut sensor: Box<dyn DistanceSensor + Send>,
    cfg: &SensorSection,
    sink: EventSink,
) -> Result<()> {
    let trigger_cm = cfg.trigger_cm;
    let every = Duration::from_millis(cfg.poll_ms);
    thread::Builder::new()
        .name("distance-sensor".into())
        .spawn(move || loop {
            thread::sleep(every);
            match sensor.read_cm() {
                Ok(Some(d)) if is_present(d, trigger_cm) => {
                    debug!(distance_cm = d, "presence");
                    sink.post(Event::LocalTrigger {
                        force_new_owner: false,
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("sensor read failed: {e:#}");
                    thread::sleep(ERROR_BACKOFF);
                }
            }
        })?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(distance: u16) -> [u8; FRAME_LEN] {
        let [lo, hi] = distance.to_le_bytes();
        let mut f = [HEADER, HEADER, lo, hi, 0x10, 0x02, 0x00, 0x09, 0];
        f[8] = f[..8].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        f
    }

    // -- decode_frame -------------------------------------------------------

    #[test]
    fn decodes_distance_little_endian() {
        assert_eq!(decode_frame(&frame(165)), Some(165));
        assert_eq!(decode_frame(&frame(1_200)), Some(1_200));
    }

    #[test]
    fn rejects_bad_checksum() {
        let mut f = frame(100);
        f[8] = f[8].wrapping_add(1);
        assert_eq!(decode_frame(&f), None);
    }

    #[test]
    fn rejects_bad_header() {
        let mut f = frame(100);
        f[1] = 0x58;
        assert_eq!(decode_frame(&f), None);
    }

    // -- FrameScanner -------------------------------------------------------

    #[test]
    fn scanner_resyncs_after_noise() {
        let mut s = FrameScanner::default();
        let mut stream = vec![0x00, 0x13, HEADER, 0x42];
        stream.extend_from_slice(&frame(80));
        let got: Vec<u16> = stream.iter().filter_map(|b| s.push(*b)).collect();
        assert_eq!(got, vec![80]);
    }

    #[test]
    fn scanner_reads_back_to_back_frames() {
        let mut s = FrameScanner::default();
        let mut stream = frame(10).to_vec();
        stream.extend_from_slice(&frame(20));
        let got: Vec<u16> = stream.iter().filter_map(|b| s.push(*b)).collect();
        assert_eq!(got, vec![10, 20]);
    }

    // -- presence -----------------------------------------------------------

    #[test]
    fn presence_threshold_is_inclusive() {
        assert!(is_present(165, 165));
        assert!(is_present(1, 165));
        assert!(!is_present(166, 165));
        assert!(!is_present(0, 165));
    }

    // -- poller -------------------------------------------------------------

    struct Fixed(u16);

    impl DistanceSensor for Fixed {
        fn read_cm(&mut self) -> Result<Option<u16>> {
            Ok(Some(self.0))
        }
    }

    #[tokio::test]
    async fn poller_posts_local_trigger_on_presence() {
        let (sink, mut rx) = crate::actor::queue();
        let cfg = SensorSection {
            poll_ms: 5,
            ..SensorSection::default()
        };
        spawn_sensor_poller(Box::new(Fixed(100)), &cfg, sink).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(
            event,
            Some(Event::LocalTrigger {
                force_new_owner: false
            })
        );
    }

    #[test]
    fn disabled_sensor_opens_nothing() {
        let cfg = SensorSection {
            enabled: false,
            ..SensorSection::default()
        };
        assert!(open(&cfg).unwrap().is_none());
    }
}
