// =============================================================================
// Persistence adapter — durable sink with graceful self-disable
// =============================================================================
//
// Append-only event tables over bundled SQLite (WAL mode). Clients treat
// every write as best-effort: each `record_*` returns a bool and never
// propagates an error. On the first failed write the adapter logs the reason
// and flips to disabled; subsequent calls return false without touching the
// store until process restart.
//
// Schema migrations are embedded, applied in sorted filename order and
// tracked in a `schema_migrations(filename, checksum, applied_at)` ledger.
// An altered checksum for an applied migration is a hard startup failure.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::market_data::availability::AvailabilitySample;
use crate::market_data::metrics::ProviderMetric;

// ---------------------------------------------------------------------------
// Embedded migrations (sorted filename order)
// ---------------------------------------------------------------------------

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_feature_snapshots.sql",
        r#"
CREATE TABLE IF NOT EXISTS feature_snapshots (
    feature_hash TEXT NOT NULL,
    pair TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    payload TEXT NOT NULL,
    captured_at INTEGER NOT NULL,
    PRIMARY KEY (feature_hash, captured_at)
);
CREATE INDEX IF NOT EXISTS idx_feature_snapshots_pair
    ON feature_snapshots(pair, timeframe, captured_at DESC);
"#,
    ),
    (
        "0002_provider_metrics.sql",
        r#"
CREATE TABLE IF NOT EXISTS provider_metrics (
    provider TEXT NOT NULL,
    payload TEXT NOT NULL,
    captured_at INTEGER NOT NULL,
    PRIMARY KEY (provider, captured_at)
);
"#,
    ),
    (
        "0003_provider_availability.sql",
        r#"
CREATE TABLE IF NOT EXISTS provider_availability (
    captured_at INTEGER PRIMARY KEY,
    state TEXT NOT NULL,
    payload TEXT NOT NULL
);
"#,
    ),
    (
        "0004_data_quality.sql",
        r#"
CREATE TABLE IF NOT EXISTS data_quality_metrics (
    pair TEXT NOT NULL,
    captured_at INTEGER NOT NULL,
    overall_score REAL NOT NULL,
    status TEXT NOT NULL,
    payload TEXT NOT NULL,
    PRIMARY KEY (pair, captured_at)
);
"#,
    ),
    (
        "0005_news_events.sql",
        r#"
CREATE TABLE IF NOT EXISTS news_events (
    id TEXT PRIMARY KEY,
    pair TEXT NOT NULL,
    headline TEXT NOT NULL,
    payload TEXT NOT NULL,
    published_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_news_events_published
    ON news_events(published_at DESC);
"#,
    ),
];

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A news event to persist; `id` is the natural dedup key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewsRecord {
    pub id: String,
    pub pair: String,
    pub headline: String,
    pub payload: serde_json::Value,
    pub published_at: i64,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct PersistenceAdapter {
    conn: Mutex<Connection>,
    disabled: AtomicBool,
}

impl PersistenceAdapter {
    /// Open (or create) the database file and apply pending migrations.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {path}"))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL mode")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("failed to set synchronous mode")?;

        apply_migrations(&conn)?;
        info!(path, "persistence adapter ready");

        Ok(Self {
            conn: Mutex::new(conn),
            disabled: AtomicBool::new(false),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        apply_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            disabled: AtomicBool::new(false),
        })
    }

    /// True once a write has failed; writes are no-ops from then on.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    /// Run a write, converting the first error into permanent self-disable.
    fn write_guard<F>(&self, op: &'static str, f: F) -> bool
    where
        F: FnOnce(&Connection) -> rusqlite::Result<usize>,
    {
        if self.is_disabled() {
            return false;
        }
        let conn = self.conn.lock();
        match f(&conn) {
            Ok(_) => true,
            Err(e) => {
                // Logged once; the adapter stays disabled until restart.
                warn!(op, error = %e, "persistence write failed — adapter disabled");
                self.disabled.store(true, Ordering::Relaxed);
                false
            }
        }
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    pub fn record_feature_snapshot(
        &self,
        pair: &str,
        timeframe: &str,
        feature_hash: &str,
        payload: &serde_json::Value,
        captured_at: i64,
    ) -> bool {
        let payload = payload.to_string();
        self.write_guard("record_feature_snapshot", |conn| {
            conn.execute(
                "INSERT INTO feature_snapshots (feature_hash, pair, timeframe, payload, captured_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(feature_hash, captured_at) DO NOTHING",
                params![feature_hash, pair, timeframe, payload, captured_at],
            )
        })
    }

    pub fn record_provider_metric(&self, metric: &ProviderMetric, captured_at: i64) -> bool {
        let payload = match serde_json::to_string(metric) {
            Ok(p) => p,
            Err(_) => return false,
        };
        self.write_guard("record_provider_metric", |conn| {
            conn.execute(
                "INSERT INTO provider_metrics (provider, payload, captured_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(provider, captured_at) DO UPDATE SET payload = excluded.payload",
                params![metric.provider, payload, captured_at],
            )
        })
    }

    pub fn record_provider_availability_snapshot(&self, sample: &AvailabilitySample) -> bool {
        let payload = match serde_json::to_string(sample) {
            Ok(p) => p,
            Err(_) => return false,
        };
        self.write_guard("record_provider_availability_snapshot", |conn| {
            conn.execute(
                "INSERT INTO provider_availability (captured_at, state, payload)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(captured_at) DO NOTHING",
                params![sample.captured_at, sample.state.to_string(), payload],
            )
        })
    }

    pub fn record_data_quality_metric(
        &self,
        pair: &str,
        overall_score: f64,
        status: &str,
        payload: &serde_json::Value,
        captured_at: i64,
    ) -> bool {
        let payload = payload.to_string();
        self.write_guard("record_data_quality_metric", |conn| {
            conn.execute(
                "INSERT INTO data_quality_metrics (pair, captured_at, overall_score, status, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(pair, captured_at) DO NOTHING",
                params![pair, captured_at, overall_score, status, payload],
            )
        })
    }

    pub fn record_news_items(&self, items: &[NewsRecord]) -> bool {
        if items.is_empty() {
            return true;
        }
        self.write_guard("record_news_items", |conn| {
            let mut affected = 0;
            for item in items {
                affected += conn.execute(
                    "INSERT INTO news_events (id, pair, headline, payload, published_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(id) DO NOTHING",
                    params![
                        item.id,
                        item.pair,
                        item.headline,
                        item.payload.to_string(),
                        item.published_at
                    ],
                )?;
            }
            Ok(affected)
        })
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub fn get_recent_news(&self, limit: usize) -> Vec<NewsRecord> {
        let conn = self.conn.lock();
        let mut stmt = match conn.prepare(
            "SELECT id, pair, headline, payload, published_at
             FROM news_events ORDER BY published_at DESC LIMIT ?1",
        ) {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, "get_recent_news prepare failed");
                return Vec::new();
            }
        };

        let rows = stmt.query_map(params![limit as i64], |row| {
            let payload_raw: String = row.get(3)?;
            Ok(NewsRecord {
                id: row.get(0)?,
                pair: row.get(1)?,
                headline: row.get(2)?,
                payload: serde_json::from_str(&payload_raw)
                    .unwrap_or(serde_json::Value::Null),
                published_at: row.get(4)?,
            })
        });

        match rows {
            Ok(iter) => iter.filter_map(|r| r.ok()).collect(),
            Err(e) => {
                debug!(error = %e, "get_recent_news query failed");
                Vec::new()
            }
        }
    }

    pub fn get_provider_availability_history(&self, limit: usize) -> Vec<serde_json::Value> {
        self.read_payload_column(
            "SELECT payload FROM provider_availability ORDER BY captured_at DESC LIMIT ?1",
            limit,
        )
    }

    /// Latest persisted metric per provider.
    pub fn get_latest_provider_metrics(&self) -> Vec<serde_json::Value> {
        self.read_payload_column(
            "SELECT payload FROM provider_metrics pm
             WHERE captured_at = (
                 SELECT MAX(captured_at) FROM provider_metrics WHERE provider = pm.provider
             )
             ORDER BY provider LIMIT ?1",
            64,
        )
    }

    fn read_payload_column(&self, sql: &str, limit: usize) -> Vec<serde_json::Value> {
        let conn = self.conn.lock();
        let mut stmt = match conn.prepare(sql) {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, "payload query prepare failed");
                return Vec::new();
            }
        };
        let rows = stmt.query_map(params![limit as i64], |row| {
            let payload: String = row.get(0)?;
            Ok(serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null))
        });
        match rows {
            Ok(iter) => iter.filter_map(|r| r.ok()).collect(),
            Err(e) => {
                debug!(error = %e, "payload query failed");
                Vec::new()
            }
        }
    }
}

impl std::fmt::Debug for PersistenceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceAdapter")
            .field("disabled", &self.is_disabled())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

fn apply_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            filename TEXT PRIMARY KEY,
            checksum TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        );",
    )
    .context("failed to create schema_migrations ledger")?;

    // MIGRATIONS is kept sorted by filename; assert the invariant in debug.
    debug_assert!(MIGRATIONS.windows(2).all(|w| w[0].0 < w[1].0));

    for (filename, sql) in MIGRATIONS {
        let checksum = hex::encode(Sha256::digest(sql.as_bytes()));

        let applied: Option<String> = conn
            .query_row(
                "SELECT checksum FROM schema_migrations WHERE filename = ?1",
                params![filename],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .with_context(|| format!("failed to read migration ledger for {filename}"))?;

        match applied {
            Some(existing) if existing == checksum => {
                debug!(filename, "migration already applied");
            }
            Some(existing) => {
                bail!(
                    "migration {filename} checksum mismatch: ledger has {existing}, embedded is {checksum}"
                );
            }
            None => {
                conn.execute_batch(sql)
                    .with_context(|| format!("failed to apply migration {filename}"))?;
                conn.execute(
                    "INSERT INTO schema_migrations (filename, checksum, applied_at)
                     VALUES (?1, ?2, ?3)",
                    params![filename, checksum, crate::types::now_ms()],
                )
                .with_context(|| format!("failed to record migration {filename}"))?;
                info!(filename, "migration applied");
            }
        }
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::Severity;
    use crate::market_data::availability::AvailabilityState;
    use crate::market_data::metrics::BreakerState;

    fn sample_availability(at: i64) -> AvailabilitySample {
        AvailabilitySample {
            captured_at: at,
            state: AvailabilityState::Operational,
            severity: Severity::Info,
            reason: "ok".into(),
            aggregate_quality: 95.0,
            normalized_quality: 0.95,
            unavailable_providers: vec![],
            breaker_providers: vec![],
            blocked_timeframes: vec![],
        }
    }

    fn sample_metric(provider: &str) -> ProviderMetric {
        ProviderMetric {
            provider: provider.to_string(),
            success: 10,
            failed: 1,
            rate_limited: 0,
            avg_latency_ms: 120.0,
            success_rate_pct: 90.9,
            quality_score: 88.0,
            normalized_quality: 0.88,
            last_success_at: Some(1_000),
            last_failure_at: None,
            circuit_breaker_state: BreakerState::Closed,
            remaining_quota: 7,
            backoff_seconds: 0,
        }
    }

    #[test]
    fn migrations_apply_idempotently() {
        let adapter = PersistenceAdapter::open_in_memory().unwrap();
        // Re-applying against the same connection is a no-op.
        let conn = adapter.conn.lock();
        apply_migrations(&conn).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as i64);
    }

    #[test]
    fn checksum_mismatch_is_hard_failure() {
        let adapter = PersistenceAdapter::open_in_memory().unwrap();
        let conn = adapter.conn.lock();
        conn.execute(
            "UPDATE schema_migrations SET checksum = 'tampered' WHERE filename = ?1",
            params![MIGRATIONS[0].0],
        )
        .unwrap();
        assert!(apply_migrations(&conn).is_err());
    }

    #[test]
    fn feature_snapshot_roundtrip_and_dedup() {
        let adapter = PersistenceAdapter::open_in_memory().unwrap();
        let payload = serde_json::json!({"rsi": 55.0});
        assert!(adapter.record_feature_snapshot("EURUSD", "M15", "abc123", &payload, 1_000));
        // Same natural key is deduplicated, still a successful write.
        assert!(adapter.record_feature_snapshot("EURUSD", "M15", "abc123", &payload, 1_000));

        let conn = adapter.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM feature_snapshots", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn availability_history_read_back() {
        let adapter = PersistenceAdapter::open_in_memory().unwrap();
        for i in 0..5 {
            assert!(adapter.record_provider_availability_snapshot(&sample_availability(i)));
        }
        let history = adapter.get_provider_availability_history(3);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0]["capturedAt"], 4);
    }

    #[test]
    fn latest_provider_metrics_dedups_by_provider() {
        let adapter = PersistenceAdapter::open_in_memory().unwrap();
        assert!(adapter.record_provider_metric(&sample_metric("finnhub"), 1_000));
        assert!(adapter.record_provider_metric(&sample_metric("finnhub"), 2_000));
        assert!(adapter.record_provider_metric(&sample_metric("polygon"), 1_500));

        let latest = adapter.get_latest_provider_metrics();
        assert_eq!(latest.len(), 2);
    }

    #[test]
    fn news_dedup_on_id() {
        let adapter = PersistenceAdapter::open_in_memory().unwrap();
        let record = NewsRecord {
            id: "n1".into(),
            pair: "EURUSD".into(),
            headline: "ECB holds rates".into(),
            payload: serde_json::json!({"impact": "high"}),
            published_at: 5_000,
        };
        assert!(adapter.record_news_items(&[record.clone(), record]));
        let news = adapter.get_recent_news(10);
        assert_eq!(news.len(), 1);
        assert_eq!(news[0].headline, "ECB holds rates");
    }

    // Invariant 8: after the first failed write, record* returns false until
    // restart.
    #[test]
    fn first_write_error_disables_adapter() {
        let adapter = PersistenceAdapter::open_in_memory().unwrap();
        {
            let conn = adapter.conn.lock();
            conn.execute_batch("DROP TABLE feature_snapshots;").unwrap();
        }
        let payload = serde_json::json!({});
        assert!(!adapter.record_feature_snapshot("EURUSD", "M15", "h", &payload, 1));
        assert!(adapter.is_disabled());

        // A write that would otherwise succeed now short-circuits.
        assert!(!adapter.record_provider_metric(&sample_metric("finnhub"), 1_000));
        assert!(!adapter.record_provider_availability_snapshot(&sample_availability(1)));
    }
}
