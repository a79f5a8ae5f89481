use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::warn;

use zonelight_engine::{Mode, NodeAddress, OverrideSet, PersistedState, Timestamp, ZoneOverride};

use crate::actor::Store;

/// Where Linux publishes the per-boot random identifier.
const BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// What a previous run left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredState {
    pub state: PersistedState,
    pub boot_id: Option<String>,
}

#[derive(Debug, FromRow)]
struct ZoneStateRow {
    epoch: i64,
    active: i64,
    deadline_unix_ms: i64,
    owner: Option<String>,
    local_mode: i64,
    global_mode: Option<i64>,
    zone_override_id: Option<i64>,
    zone_override_mode: Option<i64>,
    node_mode: Option<i64>,
    boot_id: Option<String>,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/zonelight/zonelight.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // A single connection keeps in-memory databases coherent.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Zone state
    // ----------------------------

    /// `now` is the monotonic instant matching `wall`.
    pub async fn save_state(
        &self,
        state: &PersistedState,
        boot_id: Option<&str>,
        now: Timestamp,
        wall: OffsetDateTime,
    ) -> Result<()> {
        let o = &state.overrides;
        let deadline = if state.active {
            deadline_to_unix_ms(state.deadline, now, unix_ms(wall))
        } else {
            0
        };
        let updated_at = wall.format(&Rfc3339).context("format timestamp")?;

        sqlx::query(
            r#"
            INSERT INTO zone_state (
              id, epoch, active, deadline_unix_ms, owner,
              local_mode, global_mode, zone_override_id, zone_override_mode, node_mode,
              boot_id, updated_at
            ) VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              epoch=excluded.epoch,
              active=excluded.active,
              deadline_unix_ms=excluded.deadline_unix_ms,
              owner=excluded.owner,
              local_mode=excluded.local_mode,
              global_mode=excluded.global_mode,
              zone_override_id=excluded.zone_override_id,
              zone_override_mode=excluded.zone_override_mode,
              node_mode=excluded.node_mode,
              boot_id=excluded.boot_id,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(i64::from(state.epoch))
        .bind(i64::from(state.active))
        .bind(deadline)
        .bind(state.owner.map(|a| a.to_string()))
        .bind(i64::from(o.local.as_wire()))
        .bind(o.global.map(|m| i64::from(m.as_wire())))
        .bind(o.zone.map(|z| i64::from(z.zone_id)))
        .bind(o.zone.map(|z| i64::from(z.mode.as_wire())))
        .bind(o.node.map(|m| i64::from(m.as_wire())))
        .bind(boot_id)
        .bind(updated_at)
        .execute(&self.pool)
        .await
        .context("save_state failed")?;
        Ok(())
    }

    /// Rebuild the stored record on the current monotonic base. A deadline
    /// that passed while the node was down loads as `now`.
    pub async fn load_state(
        &self,
        now: Timestamp,
        wall: OffsetDateTime,
    ) -> Result<Option<StoredState>> {
        let row = sqlx::query_as::<_, ZoneStateRow>(
            r#"
            SELECT epoch, active, deadline_unix_ms, owner,
                   local_mode, global_mode, zone_override_id, zone_override_mode, node_mode,
                   boot_id
            FROM zone_state WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("load_state failed")?;

        Ok(row.map(|r| r.into_stored(now, unix_ms(wall))))
    }
}

impl ZoneStateRow {
    fn into_stored(self, now: Timestamp, wall_ms: i64) -> StoredState {
        let owner = self.owner.as_deref().and_then(|s| match s.parse::<NodeAddress>() {
            Ok(a) if !a.is_unspecified() => Some(a),
            Ok(_) => None,
            Err(_) => {
                warn!(owner = s, "stored owner is not an address, dropping");
                None
            }
        });
        let zone = match (self.zone_override_id, self.zone_override_mode.and_then(stored_mode)) {
            (Some(id), Some(mode)) => u8::try_from(id)
                .ok()
                .map(|zone_id| ZoneOverride { zone_id, mode }),
            _ => None,
        };
        let active = self.active != 0;

        StoredState {
            state: PersistedState {
                epoch: u32::try_from(self.epoch).unwrap_or(0),
                active,
                deadline: if active {
                    deadline_from_unix_ms(self.deadline_unix_ms, now, wall_ms)
                } else {
                    Timestamp::ZERO
                },
                owner,
                overrides: OverrideSet {
                    global: self.global_mode.and_then(stored_mode),
                    zone,
                    node: self.node_mode.and_then(stored_mode),
                    local: stored_mode(self.local_mode).unwrap_or(Mode::Auto),
                },
            },
            boot_id: self.boot_id,
        }
    }
}

fn stored_mode(v: i64) -> Option<Mode> {
    u32::try_from(v).ok().and_then(Mode::from_wire)
}

// ---------------------------------------------------------------------------
// Wall-clock conversion
// ---------------------------------------------------------------------------

fn unix_ms(wall: OffsetDateTime) -> i64 {
    i64::try_from(wall.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

fn deadline_to_unix_ms(deadline: Timestamp, now: Timestamp, wall_ms: i64) -> i64 {
    let remaining = i64::try_from(deadline.saturating_since(now).as_millis()).unwrap_or(i64::MAX);
    wall_ms.saturating_add(remaining)
}

fn deadline_from_unix_ms(deadline_ms: i64, now: Timestamp, wall_ms: i64) -> Timestamp {
    let remaining = u64::try_from(deadline_ms.saturating_sub(wall_ms)).unwrap_or(0);
    now + Duration::from_millis(remaining)
}

// ---------------------------------------------------------------------------
// Boot detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootKind {
    /// Host power-cycled; remembered holds cannot be trusted.
    Cold,
    /// Process restarted on the same boot.
    Warm,
}

pub fn current_boot_id() -> Option<String> {
    std::fs::read_to_string(BOOT_ID_PATH)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn boot_kind(stored: Option<&StoredState>, current: Option<&str>) -> BootKind {
    let (Some(stored), Some(current)) = (stored, current) else {
        return BootKind::Warm;
    };
    match stored.boot_id.as_deref() {
        Some(id) if id == current => BootKind::Warm,
        _ => BootKind::Cold,
    }
}

// ---------------------------------------------------------------------------
// Actor port
// ---------------------------------------------------------------------------

/// The database plus this boot's identity, stamped on every write.
pub struct ZoneStore {
    db: Db,
    boot_id: Option<String>,
}

impl ZoneStore {
    pub fn new(db: Db, boot_id: Option<String>) -> Self {
        Self { db, boot_id }
    }
}

impl Store for ZoneStore {
    async fn save(&self, state: &PersistedState, now: Timestamp) -> Result<()> {
        self.db
            .save_state(state, self.boot_id.as_deref(), now, OffsetDateTime::now_utc())
            .await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
