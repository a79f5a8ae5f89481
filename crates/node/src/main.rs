mod actor;
mod config;
mod io;
mod sensor;
#[cfg(feature = "sim")]
mod sim;
mod status;
mod store;
mod transport;
mod web;
mod wire;

use anyhow::Result;
use std::env;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use zonelight_engine::{wire_millis, EngineState, Event, Role};

use actor::{Actor, Clock};
use io::{IoBoard, ModeSwitch};
use status::NodeStatus;
use store::{boot_kind, current_boot_id, BootKind, Db, ZoneStore};
use transport::Inlet;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "node.toml".to_string());
    let cfg = config::load(&config_path)?;
    let engine_cfg = cfg.engine()?;
    let me = engine_cfg.address;
    let zone_id = engine_cfg.zone_id;
    info!(%me, zone = zone_id, role = ?cfg.node.role, "zonelight node starting");

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&cfg.storage.db_url).await?;
    db.migrate().await?;

    let clock = Clock::start();
    let stored = db.load_state(clock.now(), OffsetDateTime::now_utc()).await?;
    let boot_id = current_boot_id();
    let kind = boot_kind(stored.as_ref(), boot_id.as_deref());
    match &stored {
        Some(s) => info!(
            epoch = s.state.epoch,
            active = s.state.active,
            ?kind,
            "restored zone state"
        ),
        None => info!("no stored zone state"),
    }

    let engine = EngineState::new(engine_cfg.clone(), stored.map(|s| s.state));
    let store = ZoneStore::new(db, boot_id);

    // ── IO board ────────────────────────────────────────────────────
    let board = IoBoard::new(&cfg.gpio)?;
    let switch = match engine_cfg.role {
        Role::Controller => Some(ModeSwitch::new(&cfg.gpio)?),
        Role::Actuator => None,
    };

    // ── MQTT ────────────────────────────────────────────────────────
    let (sink, events) = actor::queue();
    let (transport, eventloop) = transport::connect(&cfg.mqtt, me, zone_id);
    let inlet = Inlet::new(me, zone_id, wire_millis(engine_cfg.hold), sink.clone());
    tokio::spawn(transport::run(eventloop, transport.clone(), inlet));

    // ── Status endpoint ─────────────────────────────────────────────
    let (status_tx, status_rx) = watch::channel(NodeStatus::starting());
    let web_port = cfg.web.port;
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_port, status_rx).await {
            error!("{e:#}");
        }
    });

    // ── Engine ──────────────────────────────────────────────────────
    let mut actor = Actor::new(engine, board, transport, store, clock, events, status_tx);

    if let Some(switch) = switch {
        let position = switch.read();
        actor
            .dispatch(Event::SwitchPosition { mode: position })
            .await;
        io::spawn_switch_poller(switch, position, sink.clone())?;
    }

    match kind {
        BootKind::Cold => actor.dispatch(Event::ColdBoot).await,
        BootKind::Warm => actor.dispatch(Event::EnterPendingRestore).await,
    }

    match sensor::open(&cfg.sensor)? {
        Some(sensor) => sensor::spawn_sensor_poller(sensor, &cfg.sensor, sink)?,
        None => warn!("no local presence detection, following the zone only"),
    }

    actor.run().await;
    Ok(())
}
