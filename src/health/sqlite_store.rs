use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::OptionalExtension;

use super::{
    Alert, AlertConfig, AlertStatus, HealthSample, HealthStore, NewAlert, StoreError, TargetType,
};

/// Persists samples, alerts and alert configs in one SQLite file.
#[derive(Clone, Debug)]
pub struct SqliteHealthStore {
    path: PathBuf,
}

impl SqliteHealthStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    async fn with_conn<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            work(&mut conn)
        })
        .await?
    }
}

type AlertRow = (
    i64,
    String,
    String,
    String,
    String,
    String,
    i64,
    Option<i64>,
    Option<i64>,
);

const ALERT_COLUMNS: &str = "id, target_type, target_id, alert_type, message, status, \
                             created_at_ms, acknowledged_at_ms, resolved_at_ms";

fn read_alert_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AlertRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn alert_from_row(row: AlertRow) -> Result<Alert, StoreError> {
    let (id, target_type, target_id, alert_type, message, status, created, acked, resolved) = row;
    Ok(Alert {
        id: i64_to_u64(id),
        target_type: parse_target_type(&target_type)?,
        target_id,
        alert_type,
        message,
        status: AlertStatus::parse(&status)
            .ok_or_else(|| StoreError::Invalid(format!("alert status {status:?}")))?,
        created_at_ms: i64_to_u64(created),
        acknowledged_at_ms: acked.map(i64_to_u64),
        resolved_at_ms: resolved.map(i64_to_u64),
    })
}

fn parse_target_type(raw: &str) -> Result<TargetType, StoreError> {
    TargetType::parse(raw).ok_or_else(|| StoreError::Invalid(format!("target type {raw:?}")))
}

#[async_trait]
impl HealthStore for SqliteHealthStore {
    async fn append_sample(&self, sample: HealthSample) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO health_samples
                    (target_type, target_id, healthy, response_time_ms, error, checked_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    sample.target_type.as_str(),
                    sample.target_id,
                    sample.healthy,
                    u64_to_i64(sample.response_time_ms),
                    sample.error,
                    u64_to_i64(sample.checked_at_ms),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn recent_samples(
        &self,
        target_type: TargetType,
        target_id: &str,
        limit: usize,
    ) -> Result<Vec<HealthSample>, StoreError> {
        let target_id = target_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT healthy, response_time_ms, error, checked_at_ms FROM health_samples
                 WHERE target_type = ?1 AND target_id = ?2
                 ORDER BY checked_at_ms DESC, id DESC
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![target_type.as_str(), target_id, u64_to_i64(limit as u64)],
                |row| {
                    Ok((
                        row.get::<_, bool>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )?;
            let mut samples = Vec::new();
            for row in rows {
                let (healthy, response_time_ms, error, checked_at_ms) = row?;
                samples.push(HealthSample {
                    target_type,
                    target_id: target_id.clone(),
                    healthy,
                    response_time_ms: i64_to_u64(response_time_ms),
                    error,
                    checked_at_ms: i64_to_u64(checked_at_ms),
                });
            }
            Ok(samples)
        })
        .await
    }

    async fn insert_alert(&self, alert: NewAlert) -> Result<Alert, StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO alerts (target_type, target_id, alert_type, message, status, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    alert.target_type.as_str(),
                    alert.target_id,
                    alert.alert_type,
                    alert.message,
                    AlertStatus::Active.as_str(),
                    u64_to_i64(alert.created_at_ms),
                ],
            )?;
            Ok(Alert {
                id: i64_to_u64(conn.last_insert_rowid()),
                target_type: alert.target_type,
                target_id: alert.target_id,
                alert_type: alert.alert_type,
                message: alert.message,
                status: AlertStatus::Active,
                created_at_ms: alert.created_at_ms,
                acknowledged_at_ms: None,
                resolved_at_ms: None,
            })
        })
        .await
    }

    async fn alert(&self, id: u64) -> Result<Option<Alert>, StoreError> {
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = ?1"),
                    rusqlite::params![u64_to_i64(id)],
                    read_alert_row,
                )
                .optional()?;
            row.map(alert_from_row).transpose()
        })
        .await
    }

    async fn update_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        let alert = alert.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE alerts SET status = ?2, message = ?3, acknowledged_at_ms = ?4, resolved_at_ms = ?5
                 WHERE id = ?1",
                rusqlite::params![
                    u64_to_i64(alert.id),
                    alert.status.as_str(),
                    alert.message,
                    alert.acknowledged_at_ms.map(u64_to_i64),
                    alert.resolved_at_ms.map(u64_to_i64),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound {
                    kind: "alert",
                    id: alert.id.to_string(),
                });
            }
            Ok(())
        })
        .await
    }

    async fn list_alerts(
        &self,
        status: Option<AlertStatus>,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<Alert>, u64), StoreError> {
        self.with_conn(move |conn| {
            let status = status.map(AlertStatus::as_str);
            let total: i64 = conn.query_row(
                "SELECT COUNT(*) FROM alerts WHERE ?1 IS NULL OR status = ?1",
                rusqlite::params![status],
                |row| row.get(0),
            )?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {ALERT_COLUMNS} FROM alerts
                 WHERE ?1 IS NULL OR status = ?1
                 ORDER BY id DESC
                 LIMIT ?2 OFFSET ?3"
            ))?;
            let rows = stmt.query_map(
                rusqlite::params![
                    status,
                    u64_to_i64(limit as u64),
                    u64_to_i64(offset as u64)
                ],
                read_alert_row,
            )?;
            let mut alerts = Vec::new();
            for row in rows {
                alerts.push(alert_from_row(row?)?);
            }
            Ok((alerts, i64_to_u64(total)))
        })
        .await
    }

    async fn alert_config(
        &self,
        target_type: TargetType,
        target_id: &str,
    ) -> Result<Option<AlertConfig>, StoreError> {
        let target_id = target_id.to_string();
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value_json FROM alert_configs WHERE target_type = ?1 AND target_id = ?2",
                    rusqlite::params![target_type.as_str(), target_id],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|raw| serde_json::from_str(&raw).map_err(StoreError::from))
                .transpose()
        })
        .await
    }

    async fn upsert_alert_config(&self, config: AlertConfig) -> Result<(), StoreError> {
        let value_json = serde_json::to_string(&config)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO alert_configs (target_type, target_id, value_json)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(target_type, target_id) DO UPDATE SET value_json = excluded.value_json",
                rusqlite::params![config.target_type.as_str(), config.target_id, value_json],
            )?;
            Ok(())
        })
        .await
    }
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS health_samples (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            target_type TEXT NOT NULL,
            target_id TEXT NOT NULL,
            healthy INTEGER NOT NULL,
            response_time_ms INTEGER NOT NULL,
            error TEXT,
            checked_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_health_samples_target
            ON health_samples(target_type, target_id, checked_at_ms);

        CREATE TABLE IF NOT EXISTS alerts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            target_type TEXT NOT NULL,
            target_id TEXT NOT NULL,
            alert_type TEXT NOT NULL,
            message TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL,
            acknowledged_at_ms INTEGER,
            resolved_at_ms INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_alerts_status ON alerts(status);

        CREATE TABLE IF NOT EXISTS alert_configs (
            target_type TEXT NOT NULL,
            target_id TEXT NOT NULL,
            value_json TEXT NOT NULL,
            PRIMARY KEY (target_type, target_id)
        );",
    )
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}
