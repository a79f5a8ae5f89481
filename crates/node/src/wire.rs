//! Zone message codec and MQTT topic layout.
//!
//! Payloads are short `key=value` lists, the format deployed peers already
//! speak:
//!
//! | resource    | payload                                   |
//! |-------------|-------------------------------------------|
//! | `state_req` | `1`                                       |
//! | `state_rsp` | `e=<epoch>;a=<0|1>;r=<ms>;o=<owner ipv6>` |
//! | `trigger`   | `epoch=<epoch>&rem_ms=<ms>` (`e=`/`h=`)   |
//! | `off`       | `e=<epoch>`                               |
//! | `mode`      | `m=<0|1|2>[;z=<zone>]` or `clr=<n>[;z=..]`|
//!
//! Topics: `zone/<zone>/<resource>/<sender>` reaches the whole zone,
//! `node/<target>/mode/<sender>` reaches a single node.

use thiserror::Error;

use zonelight_engine::{Event, Mode, ModeScope, NodeAddress, Outbound};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8")]
    NotUtf8,
    #[error("{key}: {value:?} is not a decimal u32")]
    InvalidNumber { key: &'static str, value: String },
    #[error("{key}: {value} out of range")]
    OutOfRange { key: &'static str, value: u32 },
    #[error("o: {0:?} is not an IPv6 address")]
    InvalidAddress(String),
    #[error("required field {0} missing")]
    Missing(&'static str),
}

// ---------------------------------------------------------------------------
// Payload fields
// ---------------------------------------------------------------------------

/// Every field any zone message may carry.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Fields {
    pub epoch: Option<u32>,
    pub remaining_ms: Option<u32>,
    pub active: Option<bool>,
    pub mode: Option<Mode>,
    pub clear: Option<u32>,
    pub zone: Option<u8>,
    pub owner: Option<NodeAddress>,
}

impl Fields {
    /// Pairs are separated by `;` or `&`; whitespace around keys and values
    /// is ignored, as are unknown keys and pairs without `=`. A bad value for
    /// a known key rejects the whole payload.
    pub fn parse(payload: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(payload).map_err(|_| DecodeError::NotUtf8)?;
        let mut f = Fields::default();

        for pair in text.split([';', '&']) {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.is_empty() {
                continue;
            }

            match key {
                "epoch" | "e" => f.epoch = Some(number("epoch", value)?),
                "rem_ms" | "h" | "r" => f.remaining_ms = Some(number("rem_ms", value)?),
                "active" | "a" => {
                    f.active = Some(match number("active", value)? {
                        0 => false,
                        1 => true,
                        v => return Err(DecodeError::OutOfRange { key: "active", value: v }),
                    })
                }
                "mode" | "m" => {
                    let v = number("mode", value)?;
                    let mode = Mode::from_wire(v)
                        .ok_or(DecodeError::OutOfRange { key: "mode", value: v })?;
                    f.mode = Some(mode);
                }
                "clr" => f.clear = Some(number("clr", value)?),
                "z" => {
                    let v = number("z", value)?;
                    let zone = u8::try_from(v)
                        .map_err(|_| DecodeError::OutOfRange { key: "z", value: v })?;
                    f.zone = Some(zone);
                }
                "o" => {
                    let addr = value
                        .parse()
                        .map_err(|_| DecodeError::InvalidAddress(value.to_string()))?;
                    f.owner = Some(addr);
                }
                _ => {}
            }
        }

        Ok(f)
    }
}

fn number(key: &'static str, value: &str) -> Result<u32, DecodeError> {
    let invalid = || DecodeError::InvalidNumber {
        key,
        value: value.to_string(),
    };
    // `u32::from_str` would also take a leading `+`.
    if !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    value.parse().map_err(|_| invalid())
}

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    StateRequest,
    StateResponse,
    Trigger,
    Off,
    Mode,
}

impl Resource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StateRequest => "state_req",
            Self::StateResponse => "state_rsp",
            Self::Trigger => "trigger",
            Self::Off => "off",
            Self::Mode => "mode",
        }
    }

    pub fn from_segment(s: &str) -> Option<Self> {
        match s {
            "state_req" => Some(Self::StateRequest),
            "state_rsp" => Some(Self::StateResponse),
            "trigger" => Some(Self::Trigger),
            "off" => Some(Self::Off),
            "mode" => Some(Self::Mode),
            _ => None,
        }
    }
}

/// Who a message was addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Everyone subscribed to the zone (multicast).
    Zone(u8),
    /// A single node (unicast); only mode commands travel this way.
    Node(NodeAddress),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub resource: Resource,
    pub target: Target,
    pub sender: NodeAddress,
}

impl Route {
    pub fn is_multicast(&self) -> bool {
        matches!(self.target, Target::Zone(_))
    }
}

pub fn zone_topic(zone_id: u8, resource: Resource, sender: NodeAddress) -> String {
    format!("zone/{zone_id}/{}/{sender}", resource.as_str())
}

/// Filters a node subscribes to.
pub fn subscriptions(zone_id: u8, me: NodeAddress) -> [String; 2] {
    [format!("zone/{zone_id}/+/+"), format!("node/{me}/mode/+")]
}

/// Parse "zone/<zone>/<resource>/<sender>" or "node/<target>/mode/<sender>".
pub fn parse_topic(topic: &str) -> Option<Route> {
    let parts: Vec<&str> = topic.split('/').collect();
    let [kind, dest, resource, sender] = parts.as_slice() else {
        return None;
    };
    let resource = Resource::from_segment(resource)?;
    let sender: NodeAddress = sender.parse().ok()?;
    let target = match *kind {
        "zone" => Target::Zone(dest.parse().ok()?),
        "node" if resource == Resource::Mode => Target::Node(dest.parse().ok()?),
        _ => return None,
    };
    Some(Route {
        resource,
        target,
        sender,
    })
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Turn an inbound message into an engine event. `Ok(None)` means the
/// message was well formed but asks for nothing (a mode message with
/// neither `m` nor `clr`).
pub fn decode(route: &Route, payload: &[u8], default_hold_ms: u32) -> Result<Option<Event>, DecodeError> {
    let event = match route.resource {
        Resource::StateRequest => Event::RemoteStateRequest { from: route.sender },
        Resource::StateResponse => {
            let f = Fields::parse(payload)?;
            // The advertised owner is who the claim belongs to; the sender
            // may just be relaying what it knows.
            let from = f
                .owner
                .filter(|o| !o.is_unspecified())
                .unwrap_or(route.sender);
            Event::RemoteStateResponse {
                epoch: f.epoch.ok_or(DecodeError::Missing("e"))?,
                from,
                remaining_ms: f.remaining_ms.unwrap_or(0),
                active: f.active.ok_or(DecodeError::Missing("a"))?,
            }
        }
        Resource::Trigger => {
            let f = Fields::parse(payload)?;
            Event::RemoteTrigger {
                epoch: f.epoch.ok_or(DecodeError::Missing("epoch"))?,
                from: route.sender,
                remaining_ms: f.remaining_ms.unwrap_or(default_hold_ms),
            }
        }
        Resource::Off => {
            let f = Fields::parse(payload)?;
            Event::RemoteOff {
                epoch: f.epoch.ok_or(DecodeError::Missing("e"))?,
            }
        }
        Resource::Mode => {
            let f = Fields::parse(payload)?;
            let scope = match (route.target, f.zone) {
                (Target::Node(_), _) => ModeScope::Node,
                (Target::Zone(_), Some(z)) => ModeScope::Zone(z),
                (Target::Zone(_), None) => ModeScope::Global,
            };
            if f.clear.is_some() {
                Event::ModeClear { scope }
            } else if let Some(mode) = f.mode {
                Event::ModeSet { scope, mode }
            } else {
                return Ok(None);
            }
        }
    };
    Ok(Some(event))
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

pub fn encode(out: &Outbound) -> (Resource, String) {
    match out {
        Outbound::StateRequest => (Resource::StateRequest, "1".to_string()),
        Outbound::StateResponse {
            epoch,
            owner,
            remaining_ms,
            active,
        } => {
            let owner = owner.map_or_else(|| "::".to_string(), |o| o.to_string());
            (
                Resource::StateResponse,
                format!("e={epoch};a={};r={remaining_ms};o={owner}", u8::from(*active)),
            )
        }
        Outbound::Trigger {
            epoch,
            remaining_ms,
        } => (Resource::Trigger, format!("epoch={epoch}&rem_ms={remaining_ms}")),
        Outbound::Off { epoch } => (Resource::Off, format!("e={epoch}")),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> NodeAddress {
        s.parse().unwrap()
    }

    fn zone_route(resource: Resource) -> Route {
        Route {
            resource,
            target: Target::Zone(1),
            sender: addr("fd00::2"),
        }
    }

    // -- Fields::parse ------------------------------------------------------

    #[test]
    fn parses_basic_fields() {
        let f = Fields::parse(b"epoch=10;rem_ms=250;active=1;mode=2").unwrap();
        assert_eq!(f.epoch, Some(10));
        assert_eq!(f.remaining_ms, Some(250));
        assert_eq!(f.active, Some(true));
        assert_eq!(f.mode, Some(Mode::Auto));
    }

    #[test]
    fn parses_legacy_keys_and_spaces() {
        let f = Fields::parse(b" e = 7 & h = 42 ; a = 0 ").unwrap();
        assert_eq!(f.epoch, Some(7));
        assert_eq!(f.remaining_ms, Some(42));
        assert_eq!(f.active, Some(false));
    }

    #[test]
    fn ignores_unknown_keys_and_bare_words() {
        let f = Fields::parse(b"foo=bar;junk;epoch=3;;").unwrap();
        assert_eq!(f.epoch, Some(3));
    }

    #[test]
    fn empty_value_is_skipped() {
        let f = Fields::parse(b"e=;a=1").unwrap();
        assert_eq!(f.epoch, None);
        assert_eq!(f.active, Some(true));
    }

    #[test]
    fn rejects_overflow() {
        assert!(matches!(
            Fields::parse(b"epoch=999999999999"),
            Err(DecodeError::InvalidNumber { key: "epoch", .. })
        ));
    }

    #[test]
    fn rejects_non_decimal() {
        assert!(Fields::parse(b"epoch=12x").is_err());
        assert!(Fields::parse(b"epoch=+12").is_err());
        assert!(Fields::parse(b"epoch=-1").is_err());
    }

    #[test]
    fn rejects_active_out_of_range() {
        assert_eq!(
            Fields::parse(b"active=2"),
            Err(DecodeError::OutOfRange {
                key: "active",
                value: 2
            })
        );
    }

    #[test]
    fn rejects_mode_out_of_range() {
        assert!(Fields::parse(b"m=3").is_err());
    }

    #[test]
    fn rejects_zone_above_u8() {
        assert!(Fields::parse(b"m=1;z=300").is_err());
    }

    #[test]
    fn parses_owner_address() {
        let f = Fields::parse(b"o= fd00::9 ").unwrap();
        assert_eq!(f.owner, Some(addr("fd00::9")));
        assert!(matches!(
            Fields::parse(b"o=garbage"),
            Err(DecodeError::InvalidAddress(_))
        ));
    }

    #[test]
    fn rejects_invalid_utf8() {
        assert_eq!(Fields::parse(&[0x65, 0x3d, 0xff]), Err(DecodeError::NotUtf8));
    }

    // -- Topics -------------------------------------------------------------

    #[test]
    fn zone_topic_layout() {
        assert_eq!(
            zone_topic(3, Resource::Trigger, addr("fd00::1")),
            "zone/3/trigger/fd00::1"
        );
    }

    #[test]
    fn parse_zone_topic() {
        let r = parse_topic("zone/3/state_rsp/fd00::2").unwrap();
        assert_eq!(r.resource, Resource::StateResponse);
        assert_eq!(r.target, Target::Zone(3));
        assert_eq!(r.sender, addr("fd00::2"));
        assert!(r.is_multicast());
    }

    #[test]
    fn parse_node_mode_topic() {
        let r = parse_topic("node/fd00::1/mode/fd00::7").unwrap();
        assert_eq!(r.resource, Resource::Mode);
        assert_eq!(r.target, Target::Node(addr("fd00::1")));
        assert!(!r.is_multicast());
    }

    #[test]
    fn node_topic_only_carries_mode() {
        assert_eq!(parse_topic("node/fd00::1/trigger/fd00::2"), None);
    }

    #[test]
    fn parse_topic_rejects_malformed() {
        assert_eq!(parse_topic(""), None);
        assert_eq!(parse_topic("zone/1/trigger"), None);
        assert_eq!(parse_topic("zone/1/trigger/fd00::2/extra"), None);
        assert_eq!(parse_topic("zone/x/trigger/fd00::2"), None);
        assert_eq!(parse_topic("zone/1/bogus/fd00::2"), None);
        assert_eq!(parse_topic("zone/1/off/node-b"), None);
        assert_eq!(parse_topic("tele/1/off/fd00::2"), None);
    }

    #[test]
    fn subscriptions_cover_own_topics() {
        let me = addr("fd00::1");
        let [zone, node] = subscriptions(2, me);
        assert_eq!(zone, "zone/2/+/+");
        assert_eq!(node, "node/fd00::1/mode/+");
    }

    // -- decode -------------------------------------------------------------

    #[test]
    fn decode_trigger_defaults_hold() {
        let ev = decode(&zone_route(Resource::Trigger), b"e=4", 300_000).unwrap();
        assert_eq!(
            ev,
            Some(Event::RemoteTrigger {
                epoch: 4,
                from: addr("fd00::2"),
                remaining_ms: 300_000
            })
        );
    }

    #[test]
    fn decode_trigger_requires_epoch() {
        assert_eq!(
            decode(&zone_route(Resource::Trigger), b"rem_ms=5", 1),
            Err(DecodeError::Missing("epoch"))
        );
    }

    #[test]
    fn decode_state_response_uses_advertised_owner() {
        let ev = decode(
            &zone_route(Resource::StateResponse),
            b"e=5;a=1;r=1200;o=fd00::9",
            0,
        )
        .unwrap();
        assert_eq!(
            ev,
            Some(Event::RemoteStateResponse {
                epoch: 5,
                from: addr("fd00::9"),
                remaining_ms: 1_200,
                active: true
            })
        );
    }

    #[test]
    fn decode_state_response_unknown_owner_falls_back_to_sender() {
        let ev = decode(&zone_route(Resource::StateResponse), b"e=5;a=0;o=::", 0).unwrap();
        assert_eq!(
            ev,
            Some(Event::RemoteStateResponse {
                epoch: 5,
                from: addr("fd00::2"),
                remaining_ms: 0,
                active: false
            })
        );
    }

    #[test]
    fn decode_state_response_requires_active() {
        assert_eq!(
            decode(&zone_route(Resource::StateResponse), b"e=5;r=10", 0),
            Err(DecodeError::Missing("a"))
        );
    }

    #[test]
    fn decode_off() {
        assert_eq!(
            decode(&zone_route(Resource::Off), b"e=9", 0).unwrap(),
            Some(Event::RemoteOff { epoch: 9 })
        );
    }

    #[test]
    fn decode_state_request_ignores_payload() {
        assert_eq!(
            decode(&zone_route(Resource::StateRequest), b"anything", 0).unwrap(),
            Some(Event::RemoteStateRequest {
                from: addr("fd00::2")
            })
        );
    }

    #[test]
    fn decode_mode_scopes() {
        let zone = zone_route(Resource::Mode);
        assert_eq!(
            decode(&zone, b"m=0", 0).unwrap(),
            Some(Event::ModeSet {
                scope: ModeScope::Global,
                mode: Mode::Off
            })
        );
        assert_eq!(
            decode(&zone, b"m=1;z=3", 0).unwrap(),
            Some(Event::ModeSet {
                scope: ModeScope::Zone(3),
                mode: Mode::On
            })
        );

        let node = Route {
            target: Target::Node(addr("fd00::1")),
            ..zone
        };
        assert_eq!(
            decode(&node, b"m=2;z=3", 0).unwrap(),
            Some(Event::ModeSet {
                scope: ModeScope::Node,
                mode: Mode::Auto
            })
        );
    }

    #[test]
    fn decode_mode_clear_wins_over_set() {
        let zone = zone_route(Resource::Mode);
        assert_eq!(
            decode(&zone, b"clr=2;z=3;m=1", 0).unwrap(),
            Some(Event::ModeClear {
                scope: ModeScope::Zone(3)
            })
        );
        assert_eq!(
            decode(&zone, b"clr=1", 0).unwrap(),
            Some(Event::ModeClear {
                scope: ModeScope::Global
            })
        );
    }

    #[test]
    fn decode_mode_without_command_is_ignored() {
        assert_eq!(decode(&zone_route(Resource::Mode), b"z=3", 0).unwrap(), None);
    }

    // -- encode -------------------------------------------------------------

    #[test]
    fn encode_formats() {
        assert_eq!(encode(&Outbound::StateRequest), (Resource::StateRequest, "1".into()));
        assert_eq!(
            encode(&Outbound::Trigger {
                epoch: 3,
                remaining_ms: 300_000
            }),
            (Resource::Trigger, "epoch=3&rem_ms=300000".into())
        );
        assert_eq!(encode(&Outbound::Off { epoch: 3 }), (Resource::Off, "e=3".into()));
        assert_eq!(
            encode(&Outbound::StateResponse {
                epoch: 3,
                owner: None,
                remaining_ms: 0,
                active: false
            }),
            (Resource::StateResponse, "e=3;a=0;r=0;o=::".into())
        );
    }

    #[test]
    fn state_response_decodes_as_sent() {
        let (resource, payload) = encode(&Outbound::StateResponse {
            epoch: 8,
            owner: Some(addr("fd00::5")),
            remaining_ms: 4_000,
            active: true,
        });
        let ev = decode(&zone_route(resource), payload.as_bytes(), 0).unwrap();
        assert_eq!(
            ev,
            Some(Event::RemoteStateResponse {
                epoch: 8,
                from: addr("fd00::5"),
                remaining_ms: 4_000,
                active: true
            })
        );
    }
}
