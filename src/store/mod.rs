//! SQLite persistence: schema-versioned, single-writer, many-readers.
//!
//! Opened with WAL journalling, `synchronous=NORMAL`, a sized page cache
//! and memory-mapped reads. Writes go through a bounded retry loop that
//! reopens the pool between attempts; only migration failure is permanent.
//! Reads run concurrently against the same pool.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::StorageConfig;
use crate::devices::{ConnectionQuality, Device};
use crate::error::{backoff_delay, StoreError};
use crate::flow::{ConnectionState, FlowRecord, FlowStatus};
use crate::threat::{Severity, Threat};

pub const CURRENT_SCHEMA_VERSION: i64 = 2;

/// Ordered migrations, each applied inside its own transaction.
const MIGRATIONS: &[(i64, &str)] = &[
    (1, include_str!("migrations/001_init.sql")),
    (2, include_str!("migrations/002_device_behaviour.sql")),
];

const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(10);
const CLEANUP_BATCH: i64 = 1_000;

/// Filter set for `query_flows`. Unset fields do not constrain.
#[derive(Debug, Clone, Default)]
pub struct FlowQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub device_id: Option<String>,
    pub status: Option<String>,
    pub protocol: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub source_ip: Option<String>,
    pub dest_ip: Option<String>,
    pub threat_level: Option<String>,
    pub min_bytes: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupStats {
    pub flows_deleted: u64,
    pub threats_deleted: u64,
    pub cutoff: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceStats {
    pub devices: i64,
    pub flows: i64,
    pub threats: i64,
    pub active_threats: i64,
    pub db_size_bytes: i64,
    pub schema_version: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    pub latency_ms: f64,
    pub errors: u64,
}

pub struct Store {
    path: String,
    cfg: StorageConfig,
    pool: RwLock<SqlitePool>,
    write_errors: AtomicU64,
    last_write_us: AtomicU64,
}

impl Store {
    /// Open (creating if missing), tune, and migrate. A migration failure
    /// is permanent and refuses startup.
    pub async fn open(path: &str, cfg: StorageConfig) -> Result<Self, StoreError> {
        let pool = Self::connect(path, &cfg).await?;
        let store = Self {
            path: path.to_string(),
            cfg,
            pool: RwLock::new(pool),
            write_errors: AtomicU64::new(0),
            last_write_us: AtomicU64::new(0),
        };
        store.migrate().await?;
        {
            let pool = store.pool.read().await.clone();
            // One-time planner statistics refresh.
            sqlx::query("PRAGMA optimize").execute(&pool).await?;
        }
        Ok(store)
    }

    async fn connect(path: &str, cfg: &StorageConfig) -> Result<SqlitePool, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::InvalidArgument(format!("bad database path {path:?}: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .pragma("cache_size", format!("-{}", cfg.page_cache_kb))
            .pragma("mmap_size", cfg.mmap_size_bytes.to_string());

        // A pooled in-memory database is one database per connection; keep
        // a single connection so tests see one schema.
        let max_connections = if path.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Transient {
                attempts: 1,
                source: e,
            })?;
        Ok(pool)
    }

    /// Walk from the persisted schema version to [`CURRENT_SCHEMA_VERSION`].
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let pool = self.pool.read().await.clone();

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (\
             version INTEGER PRIMARY KEY, \
             applied_at TEXT NOT NULL DEFAULT (datetime('now')))",
        )
        .execute(&pool)
        .await
        .map_err(|e| StoreError::Permanent(format!("schema_version table: {e}")))?;

        let current: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_one(&pool)
            .await
            .map_err(|e| StoreError::Permanent(format!("read schema version: {e}")))?;
        let current = current.unwrap_or(0);

        for (version, sql) in MIGRATIONS {
            if *version <= current {
                continue;
            }
            let mut tx = pool
                .begin()
                .await
                .map_err(|e| StoreError::Permanent(format!("migration {version} begin: {e}")))?;
            for statement in sql.split(';') {
                // Drop comment lines so a leading comment cannot swallow
                // the statement that follows it.
                let stmt = statement
                    .lines()
                    .filter(|line| !line.trim_start().starts_with("--"))
                    .collect::<Vec<_>>()
                    .join("\n");
                let stmt = stmt.trim();
                if stmt.is_empty() {
                    continue;
                }
                sqlx::query(stmt).execute(&mut *tx).await.map_err(|e| {
                    StoreError::Permanent(format!("migration {version} failed: {e}"))
                })?;
            }
            sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
                .bind(version)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Permanent(format!("migration {version} record: {e}")))?;
            tx.commit()
                .await
                .map_err(|e| StoreError::Permanent(format!("migration {version} commit: {e}")))?;
            info!(version, "Applied schema migration");
        }
        Ok(())
    }

    pub async fn schema_version(&self) -> Result<i64, StoreError> {
        let pool = self.pool.read().await.clone();
        let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_one(&pool)
            .await?;
        Ok(version.unwrap_or(0))
    }

    pub async fn pool(&self) -> SqlitePool {
        self.pool.read().await.clone()
    }

    pub async fn close(&self) {
        self.pool.read().await.close().await;
    }

    pub fn health(&self) -> StoreHealth {
        StoreHealth {
            latency_ms: self.last_write_us.load(Ordering::Relaxed) as f64 / 1000.0,
            errors: self.write_errors.load(Ordering::Relaxed),
        }
    }

    /// Write path: run `op`, retrying with exponential backoff and a pool
    /// reopen between attempts, up to the configured budget.
    async fn with_retry<T, F, Fut>(&self, name: &'static str, op: F) -> Result<T, StoreError>
    where
        F: Fn(SqlitePool) -> Fut,
        Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let pool = self.pool.read().await.clone();
            let started = Instant::now();
            match op(pool).await {
                Ok(value) => {
                    self.last_write_us
                        .store(started.elapsed().as_micros() as u64, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(e) => {
                    self.write_errors.fetch_add(1, Ordering::Relaxed);
                    attempt += 1;
                    if attempt > self.cfg.retry_limit {
                        return Err(StoreError::Transient {
                            attempts: attempt,
                            source: e,
                        });
                    }
                    let delay = backoff_delay(
                        Duration::from_millis(self.cfg.retry_base_delay_ms),
                        attempt - 1,
                        RETRY_BACKOFF_CAP,
                    );
                    warn!(op = name, attempt, error = %e, delay_ms = delay.as_millis() as u64,
                          "Store write failed; retrying");
                    tokio::time::sleep(delay).await;
                    self.reopen().await;
                }
            }
        }
    }

    /// Replace the pool with a fresh one. Best effort; an in-memory
    /// database is never reopened (that would discard it).
    async fn reopen(&self) {
        if self.path.contains(":memory:") {
            return;
        }
        match Self::connect(&self.path, &self.cfg).await {
            Ok(fresh) => {
                let mut guard = self.pool.write().await;
                let old = std::mem::replace(&mut *guard, fresh);
                old.close().await;
                info!("Reopened database after write failure");
            }
            Err(e) => warn!(error = %e, "Database reopen failed"),
        }
    }

    // -----------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------

    /// Insert a batch of finalised flows in one transaction. Idempotent:
    /// replaying a batch inserts nothing new (unique id). Returns the
    /// number of rows actually inserted.
    pub async fn insert_flows(&self, flows: &[FlowRecord]) -> Result<u64, StoreError> {
        if flows.is_empty() {
            return Ok(0);
        }
        self.with_retry("insert_flows", |pool| {
            let flows = flows.to_vec();
            async move {
                let mut tx = pool.begin().await?;
                let mut inserted = 0u64;
                for flow in &flows {
                    let result = sqlx::query(
                        r#"INSERT OR IGNORE INTO flows (
                            id, device_id, source_ip, source_port, dest_ip, dest_port,
                            protocol, bytes_in, bytes_out, packets_in, packets_out,
                            first_seen, last_seen, duration_ms, status, domain, sni,
                            application, http_method, url, user_agent, dns_query_type,
                            dns_response_code, country, city, asn, tcp_flags, ttl,
                            connection_state, rtt, jitter, retransmissions, threat_level
                        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                                  ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
                    )
                    .bind(&flow.id)
                    .bind(&flow.device_id)
                    .bind(flow.src_ip.to_string())
                    .bind(flow.src_port as i64)
                    .bind(flow.dst_ip.to_string())
                    .bind(flow.dst_port as i64)
                    .bind(&flow.protocol)
                    .bind(flow.bytes_in as i64)
                    .bind(flow.bytes_out as i64)
                    .bind(flow.packets_in as i64)
                    .bind(flow.packets_out as i64)
                    .bind(flow.first_seen.to_rfc3339())
                    .bind(flow.last_seen.to_rfc3339())
                    .bind(flow.duration_ms)
                    .bind(flow.status.as_str())
                    .bind(&flow.domain)
                    .bind(&flow.sni)
                    .bind(&flow.application)
                    .bind(&flow.http_method)
                    .bind(&flow.url)
                    .bind(&flow.user_agent)
                    .bind(&flow.dns_query_type)
                    .bind(&flow.dns_response_code)
                    .bind(&flow.country)
                    .bind(&flow.city)
                    .bind(flow.asn.map(|a| a as i64))
                    .bind(flow.tcp_flags as i64)
                    .bind(flow.ttl.map(|t| t as i64))
                    .bind(flow.connection_state.as_str())
                    .bind(flow.rtt_ms)
                    .bind(flow.jitter_ms)
                    .bind(flow.retransmissions as i64)
                    .bind(&flow.threat_level)
                    .execute(&mut *tx)
                    .await?;
                    inserted += result.rows_affected();
                }
                tx.commit().await?;
                Ok(inserted)
            }
        })
        .await
    }

    pub async fn upsert_device(&self, device: &Device) -> Result<(), StoreError> {
        self.with_retry("upsert_device", |pool| {
            let device = device.clone();
            async move {
                let applications = serde_json::to_string(&device.applications)
                    .unwrap_or_else(|_| "[]".to_string());
                let behavioural = serde_json::to_string(&device.behavioural)
                    .unwrap_or_else(|_| "{}".to_string());
                sqlx::query(
                    r#"INSERT INTO devices (
                        id, name, type, vendor, ip, mac, first_seen, last_seen,
                        total_bytes, connection_count, threat_score, notes, os,
                        ipv6_support, avg_rtt, connection_quality,
                        applications_json, behavioural_json
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(id) DO UPDATE SET
                        name = excluded.name,
                        type = excluded.type,
                        vendor = excluded.vendor,
                        ip = excluded.ip,
                        mac = excluded.mac,
                        last_seen = MAX(devices.last_seen, excluded.last_seen),
                        total_bytes = MAX(devices.total_bytes, excluded.total_bytes),
                        connection_count = excluded.connection_count,
                        threat_score = excluded.threat_score,
                        notes = excluded.notes,
                        os = excluded.os,
                        ipv6_support = excluded.ipv6_support,
                        avg_rtt = excluded.avg_rtt,
                        connection_quality = excluded.connection_quality,
                        applications_json = excluded.applications_json,
                        behavioural_json = excluded.behavioural_json"#,
                )
                .bind(&device.id)
                .bind(&device.name)
                .bind(&device.device_type)
                .bind(&device.vendor)
                .bind(&device.ip)
                .bind(&device.mac)
                .bind(device.first_seen.to_rfc3339())
                .bind(device.last_seen.to_rfc3339())
                .bind(device.total_bytes as i64)
                .bind(device.connection_count as i64)
                .bind(device.threat_score)
                .bind(&device.notes)
                .bind(&device.os)
                .bind(device.ipv6_support as i64)
                .bind(device.avg_rtt)
                .bind(device.connection_quality.map(|q| q.as_str()))
                .bind(applications)
                .bind(behavioural)
                .execute(&pool)
                .await?;
                Ok(())
            }
        })
        .await
    }

    pub async fn upsert_threat(&self, threat: &Threat) -> Result<(), StoreError> {
        self.with_retry("upsert_threat", |pool| {
            let threat = threat.clone();
            async move {
                let evidence = serde_json::to_string(&threat.evidence)
                    .unwrap_or_else(|_| "{}".to_string());
                sqlx::query(
                    r#"INSERT INTO threats (
                        id, kind, severity, score, device_id, flow_id, description,
                        first_seen, last_seen, active, evidence_json
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(id) DO UPDATE SET
                        severity = excluded.severity,
                        score = excluded.score,
                        last_seen = MAX(threats.last_seen, excluded.last_seen),
                        description = excluded.description,
                        evidence_json = excluded.evidence_json"#,
                )
                .bind(&threat.id)
                .bind(&threat.kind)
                .bind(threat.severity.as_str())
                .bind(threat.score)
                .bind(&threat.device_id)
                .bind(&threat.flow_id)
                .bind(&threat.description)
                .bind(threat.first_seen.to_rfc3339())
                .bind(threat.last_seen.to_rfc3339())
                .bind(threat.active as i64)
                .bind(evidence)
                .execute(&pool)
                .await?;
                Ok(())
            }
        })
        .await
    }

    /// Flip a threat inactive. Idempotent; the row is preserved.
    pub async fn dismiss_threat(&self, id: &str) -> Result<(), StoreError> {
        let affected = self
            .with_retry("dismiss_threat", |pool| {
                let id = id.to_string();
                async move {
                    let result = sqlx::query("UPDATE threats SET active = 0 WHERE id = ?")
                        .bind(&id)
                        .execute(&pool)
                        .await?;
                    Ok(result.rows_affected())
                }
            })
            .await?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Delete flows and threats older than the retention cutoff, in
    /// batches with one transaction each.
    pub async fn cleanup(&self, older_than_days: u64) -> Result<CleanupStats, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::days(older_than_days as i64);
        let cutoff_str = cutoff.to_rfc3339();

        let mut flows_deleted = 0u64;
        loop {
            let batch = self
                .with_retry("cleanup_flows", |pool| {
                    let cutoff = cutoff_str.clone();
                    async move {
                        let mut tx = pool.begin().await?;
                        let result = sqlx::query(
                            "DELETE FROM flows WHERE id IN \
                             (SELECT id FROM flows WHERE last_seen < ? LIMIT ?)",
                        )
                        .bind(&cutoff)
                        .bind(CLEANUP_BATCH)
                        .execute(&mut *tx)
                        .await?;
                        tx.commit().await?;
                        Ok(result.rows_affected())
                    }
                })
                .await?;
            flows_deleted += batch;
            if batch < CLEANUP_BATCH as u64 {
                break;
            }
        }

        let mut threats_deleted = 0u64;
        loop {
            let batch = self
                .with_retry("cleanup_threats", |pool| {
                    let cutoff = cutoff_str.clone();
                    async move {
                        let mut tx = pool.begin().await?;
                        let result = sqlx::query(
                            "DELETE FROM threats WHERE id IN \
                             (SELECT id FROM threats WHERE last_seen < ? LIMIT ?)",
                        )
                        .bind(&cutoff)
                        .bind(CLEANUP_BATCH)
                        .execute(&mut *tx)
                        .await?;
                        tx.commit().await?;
                        Ok(result.rows_affected())
                    }
                })
                .await?;
            threats_deleted += batch;
            if batch < CLEANUP_BATCH as u64 {
                break;
            }
        }

        if flows_deleted + threats_deleted > 0 {
            let pool = self.pool.read().await.clone();
            if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(&pool).await {
                warn!(error = %e, "WAL checkpoint after cleanup failed");
            }
            info!(flows_deleted, threats_deleted, "Retention cleanup completed");
        }

        Ok(CleanupStats {
            flows_deleted,
            threats_deleted,
            cutoff,
        })
    }

    // -----------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------

    pub async fn get_device(&self, id: &str) -> Result<Device, StoreError> {
        let pool = self.pool.read().await.clone();
        let row = sqlx::query("SELECT * FROM devices WHERE id = ?")
            .bind(id)
            .fetch_optional(&pool)
            .await?
            .ok_or(StoreError::NotFound)?;
        Ok(device_from_row(&row))
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
        let pool = self.pool.read().await.clone();
        let rows = sqlx::query("SELECT * FROM devices ORDER BY last_seen DESC")
            .fetch_all(&pool)
            .await?;
        Ok(rows.iter().map(device_from_row).collect())
    }

    pub async fn get_flow(&self, id: &str) -> Result<FlowRecord, StoreError> {
        let pool = self.pool.read().await.clone();
        let row = sqlx::query("SELECT * FROM flows WHERE id = ?")
            .bind(id)
            .fetch_optional(&pool)
            .await?
            .ok_or(StoreError::NotFound)?;
        Ok(flow_from_row(&row))
    }

    pub async fn query_flows(&self, query: &FlowQuery) -> Result<Vec<FlowRecord>, StoreError> {
        let limit = query.limit.unwrap_or(100).clamp(1, 10_000);
        let offset = query.offset.unwrap_or(0).max(0);

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM flows WHERE 1=1");
        if let Some(device_id) = &query.device_id {
            qb.push(" AND device_id = ").push_bind(device_id);
        }
        if let Some(status) = &query.status {
            qb.push(" AND status = ").push_bind(status);
        }
        if let Some(protocol) = &query.protocol {
            qb.push(" AND protocol = ").push_bind(protocol);
        }
        if let Some(start) = &query.start_time {
            qb.push(" AND last_seen >= ").push_bind(start.to_rfc3339());
        }
        if let Some(end) = &query.end_time {
            qb.push(" AND last_seen <= ").push_bind(end.to_rfc3339());
        }
        if let Some(source_ip) = &query.source_ip {
            qb.push(" AND source_ip = ").push_bind(source_ip);
        }
        if let Some(dest_ip) = &query.dest_ip {
            qb.push(" AND dest_ip = ").push_bind(dest_ip);
        }
        if let Some(threat_level) = &query.threat_level {
            qb.push(" AND threat_level = ").push_bind(threat_level);
        }
        if let Some(min_bytes) = query.min_bytes {
            qb.push(" AND (bytes_in + bytes_out) >= ").push_bind(min_bytes);
        }
        qb.push(" ORDER BY last_seen DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let pool = self.pool.read().await.clone();
        let rows = qb.build().fetch_all(&pool).await?;
        Ok(rows.iter().map(flow_from_row).collect())
    }

    pub async fn get_threat(&self, id: &str) -> Result<Threat, StoreError> {
        let pool = self.pool.read().await.clone();
        let row = sqlx::query("SELECT * FROM threats WHERE id = ?")
            .bind(id)
            .fetch_optional(&pool)
            .await?
            .ok_or(StoreError::NotFound)?;
        Ok(threat_from_row(&row))
    }

    pub async fn list_threats(&self, active: Option<bool>) -> Result<Vec<Threat>, StoreError> {
        let pool = self.pool.read().await.clone();
        let rows = match active {
            Some(active) => {
                sqlx::query("SELECT * FROM threats WHERE active = ? ORDER BY last_seen DESC")
                    .bind(active as i64)
                    .fetch_all(&pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM threats ORDER BY last_seen DESC")
                    .fetch_all(&pool)
                    .await?
            }
        };
        Ok(rows.iter().map(threat_from_row).collect())
    }

    /// Parameterised LIKE over threat description, kind and the owning
    /// device's name. Index-friendly: filters active rows first and never
    /// materialises the whole table.
    pub async fn search_threats(&self, needle: &str, limit: i64) -> Result<Vec<Threat>, StoreError> {
        let pattern = format!("%{}%", escape_like(needle));
        let pool = self.pool.read().await.clone();
        let rows = sqlx::query(
            r#"SELECT t.* FROM threats t
               LEFT JOIN devices d ON d.id = t.device_id
               WHERE t.description LIKE ? ESCAPE '\'
                  OR t.kind LIKE ? ESCAPE '\'
                  OR d.name LIKE ? ESCAPE '\'
               ORDER BY t.last_seen DESC
               LIMIT ?"#,
        )
        .bind(&pattern)
        .bind(&pattern)
        .bind(&pattern)
        .bind(limit.clamp(1, 1_000))
        .fetch_all(&pool)
        .await?;
        Ok(rows.iter().map(threat_from_row).collect())
    }

    pub async fn maintenance_stats(&self) -> Result<MaintenanceStats, StoreError> {
        let pool = self.pool.read().await.clone();
        let devices: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM devices")
            .fetch_one(&pool)
            .await?;
        let flows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM flows")
            .fetch_one(&pool)
            .await?;
        let threats: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM threats")
            .fetch_one(&pool)
            .await?;
        let active_threats: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM threats WHERE active = 1")
                .fetch_one(&pool)
                .await?;
        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count").fetch_one(&pool).await?;
        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size").fetch_one(&pool).await?;
        let schema_version = self.schema_version().await?;
        Ok(MaintenanceStats {
            devices,
            flows,
            threats,
            active_threats,
            db_size_bytes: page_count * page_size,
            schema_version,
        })
    }
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        // Timestamps are written by this process; epoch means corruption.
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn device_from_row(row: &SqliteRow) -> Device {
    let applications: std::collections::BTreeSet<String> =
        serde_json::from_str(&row.get::<String, _>("applications_json")).unwrap_or_default();
    let behavioural: std::collections::BTreeMap<String, String> =
        serde_json::from_str(&row.get::<String, _>("behavioural_json")).unwrap_or_default();
    Device {
        id: row.get("id"),
        name: row.get("name"),
        device_type: row.get("type"),
        vendor: row.get("vendor"),
        ip: row.get("ip"),
        mac: row.get("mac"),
        first_seen: parse_ts(&row.get::<String, _>("first_seen")),
        last_seen: parse_ts(&row.get::<String, _>("last_seen")),
        total_bytes: row.get::<i64, _>("total_bytes").max(0) as u64,
        connection_count: row.get::<i64, _>("connection_count").max(0) as u64,
        threat_score: row.get("threat_score"),
        notes: row.get("notes"),
        applications,
        os: row.get("os"),
        ipv6_support: row.get::<i64, _>("ipv6_support") != 0,
        avg_rtt: row.get("avg_rtt"),
        connection_quality: row
            .get::<Option<String>, _>("connection_quality")
            .as_deref()
            .and_then(ConnectionQuality::parse),
        behavioural,
    }
}

fn flow_from_row(row: &SqliteRow) -> FlowRecord {
    FlowRecord {
        id: row.get("id"),
        device_id: row.get("device_id"),
        src_ip: row
            .get::<String, _>("source_ip")
            .parse()
            .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)),
        src_port: row.get::<i64, _>("source_port") as u16,
        dst_ip: row
            .get::<String, _>("dest_ip")
            .parse()
            .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)),
        dst_port: row.get::<i64, _>("dest_port") as u16,
        protocol: row.get("protocol"),
        bytes_in: row.get::<i64, _>("bytes_in").max(0) as u64,
        bytes_out: row.get::<i64, _>("bytes_out").max(0) as u64,
        packets_in: row.get::<i64, _>("packets_in").max(0) as u64,
        packets_out: row.get::<i64, _>("packets_out").max(0) as u64,
        first_seen: parse_ts(&row.get::<String, _>("first_seen")),
        last_seen: parse_ts(&row.get::<String, _>("last_seen")),
        duration_ms: row.get("duration_ms"),
        status: FlowStatus::parse(&row.get::<String, _>("status")),
        domain: row.get("domain"),
        sni: row.get("sni"),
        application: row.get("application"),
        http_method: row.get("http_method"),
        url: row.get("url"),
        user_agent: row.get("user_agent"),
        dns_query_type: row.get("dns_query_type"),
        dns_response_code: row.get("dns_response_code"),
        country: row.get("country"),
        city: row.get("city"),
        asn: row.get::<Option<i64>, _>("asn").map(|a| a as u32),
        tcp_flags: row.get::<i64, _>("tcp_flags") as u8,
        ttl: row.get::<Option<i64>, _>("ttl").map(|t| t as u8),
        connection_state: ConnectionState::parse(&row.get::<String, _>("connection_state")),
        rtt_ms: row.get("rtt"),
        jitter_ms: row.get("jitter"),
        retransmissions: row.get::<i64, _>("retransmissions").max(0) as u32,
        threat_level: row.get("threat_level"),
    }
}

fn threat_from_row(row: &SqliteRow) -> Threat {
    let evidence: std::collections::BTreeMap<String, String> =
        serde_json::from_str(&row.get::<String, _>("evidence_json")).unwrap_or_default();
    Threat {
        id: row.get("id"),
        kind: row.get("kind"),
        severity: Severity::parse(&row.get::<String, _>("severity")).unwrap_or(Severity::Low),
        score: row.get("score"),
        device_id: row.get("device_id"),
        flow_id: row.get("flow_id"),
        description: row.get("description"),
        first_seen: parse_ts(&row.get::<String, _>("first_seen")),
        last_seen: parse_ts(&row.get::<String, _>("last_seen")),
        active: row.get::<i64, _>("active") != 0,
        evidence,
    }
}

#[cfg(test)]
pub mod testutil {
    use super::*;
    use crate::config::StorageConfig;

    pub async fn memory_store() -> Store {
        Store::open(":memory:", StorageConfig::default())
            .await
            .expect("in-memory store init failed")
    }

    pub fn sample_flow(id: &str, src: &str, dst_port: u16) -> FlowRecord {
        let now = Utc::now();
        FlowRecord {
            id: id.to_string(),
            device_id: None,
            src_ip: src.parse().unwrap(),
            src_port: 50000,
            dst_ip: "93.184.216.34".parse().unwrap(),
            dst_port,
            protocol: "TCP".to_string(),
            bytes_in: 2_000,
            bytes_out: 1_000,
            packets_in: 12,
            packets_out: 10,
            first_seen: now - chrono::Duration::seconds(3),
            last_seen: now,
            duration_ms: 3_000,
            status: FlowStatus::Closed,
            domain: Some("example.com".to_string()),
            sni: Some("example.com".to_string()),
            application: Some("HTTPS".to_string()),
            http_method: None,
            url: None,
            user_agent: None,
            dns_query_type: None,
            dns_response_code: None,
            country: Some("US".to_string()),
            city: None,
            asn: Some(15133),
            tcp_flags: 0x12,
            ttl: Some(64),
            connection_state: ConnectionState::Closed,
            rtt_ms: Some(23.5),
            jitter_ms: Some(1.2),
            retransmissions: 0,
            threat_level: None,
        }
    }
}
