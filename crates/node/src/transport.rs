//! MQTT side of the node: outbound publishes for the actor, and the event
//! loop that turns inbound publishes into engine events.

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event as MqttEvent, EventLoop, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use zonelight_engine::{NodeAddress, Outbound};

use crate::actor::{EventSink, Transport};
use crate::config::MqttSection;
use crate::wire::{self, Resource, Target};

const REQUEST_CAPACITY: usize = 20;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

fn qos(resource: Resource) -> QoS {
    match resource {
        // A lost request is simply asked again on the next retry.
        Resource::StateRequest => QoS::AtMostOnce,
        _ => QoS::AtLeastOnce,
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MqttTransport {
    client: AsyncClient,
    me: NodeAddress,
    zone_id: u8,
    joined: Arc<AtomicBool>,
}

impl Transport for MqttTransport {
    fn is_joined(&self) -> bool {
        self.joined.load(Ordering::Relaxed)
    }

    fn send(&self, out: &Outbound) -> Result<()> {
        let (resource, payload) = wire::encode(out);
        let topic = wire::zone_topic(self.zone_id, resource, self.me);
        debug!(%topic, %payload, "publish");
        self.client
            .try_publish(topic, qos(resource), false, payload)
            .context("mqtt request queue full")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Filters and decodes publishes for one node.
pub struct Inlet {
    me: NodeAddress,
    zone_id: u8,
    default_hold_ms: u32,
    sink: EventSink,
}

impl Inlet {
    pub fn new(me: NodeAddress, zone_id: u8, default_hold_ms: u32, sink: EventSink) -> Self {
        Self {
            me,
            zone_id,
            default_hold_ms,
            sink,
        }
    }

    /// Returns whether an event was queued.
    pub fn handle_publish(&self, topic: &str, payload: &[u8]) -> bool {
        let Some(route) = wire::parse_topic(topic) else {
            debug!(%topic, "unhandled topic");
            return false;
        };
        if route.sender == self.me {
            return false;
        }
        match route.target {
            Target::Zone(z) if z != self.zone_id => return false,
            Target::Node(n) if n != self.me => return false,
            _ => {}
        }

        match wire::decode(&route, payload, self.default_hold_ms) {
            Ok(Some(event)) => {
                debug!(%topic, multicast = route.is_multicast(), ?event, "inbound");
                self.sink.post(event)
            }
            Ok(None) => false,
            Err(e) => {
                warn!(
                    %topic,
                    payload = %String::from_utf8_lossy(payload),
                    "dropping malformed message: {e}"
                );
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

pub fn connect(cfg: &MqttSection, me: NodeAddress, zone_id: u8) -> (MqttTransport, EventLoop) {
    let client_id = format!("zonelight-{me}");
    let mut options = MqttOptions::new(client_id, cfg.host.clone(), cfg.port);
    options.set_keep_alive(Duration::from_secs(cfg.keep_alive_sec));

    let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
    let transport = MqttTransport {
        client,
        me,
        zone_id,
        joined: Arc::new(AtomicBool::new(false)),
    };
    (transport, eventloop)
}

/// Drive the connection forever. Every (re)connect subscribes again and
/// asks the zone for its state.
pub async fn run(mut eventloop: EventLoop, transport: MqttTransport, inlet: Inlet) {
    loop {
        match eventloop.poll().await {
            Ok(MqttEvent::Incoming(Packet::Publish(p))) => {
                inlet.handle_publish(&p.topic, &p.payload);
            }
            Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                info!(zone = transport.zone_id, "mqtt connected");
                for filter in wire::subscriptions(transport.zone_id, transport.me) {
                    let result = transport.client.try_subscribe(filter.clone(), QoS::AtLeastOnce);
                    if let Err(e) = result {
                        warn!(%filter, "subscribe failed: {e}");
                    }
                }
                transport.joined.store(true, Ordering::Relaxed);
                if let Err(e) = transport.send(&Outbound::StateRequest) {
                    warn!("state request failed: {e:#}");
                }
            }
            Ok(MqttEvent::Incoming(Packet::Disconnect)) => {
                info!("mqtt disconnected");
                transport.joined.store(false, Ordering::Relaxed);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                transport.joined.store(false, Ordering::Relaxed);
                sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
