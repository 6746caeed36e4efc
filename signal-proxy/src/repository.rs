use anyhow::{Context, Result};
use chrono::{Duration, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

use crate::models::{Alert, DecisionRecord, GeoInfo, StoredAlert};

/// One alert headed for persistence, annotated with its filter outcome and
/// GeoIP enrichment.
#[derive(Debug)]
pub struct AlertInsert {
    pub alert: Alert,
    pub filtered: bool,
    pub filter_reasons: Option<Vec<String>>,
    pub geo: Option<GeoInfo>,
}

#[derive(Debug, Default)]
pub struct AlertQuery {
    pub since: Option<String>,
    pub until: Option<String>,
    pub scenario: Option<String>,
    pub machine_id: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct NamedCount {
    pub name: String,
    pub count: i64,
}

#[derive(Debug, Serialize)]
pub struct AlertStats {
    pub total: i64,
    pub filtered: i64,
    pub forwarded: i64,
    pub first_received_at: Option<String>,
    pub last_received_at: Option<String>,
    pub top_scenarios: Vec<NamedCount>,
    pub top_countries: Vec<NamedCount>,
}

#[derive(Debug, Serialize)]
pub struct AlertDistribution {
    pub by_day_of_week: Vec<NamedCount>,
    pub by_hour_of_day: Vec<NamedCount>,
    pub daily: Vec<NamedCount>,
}

/// Append-only store for intercepted and synthesized alerts, plus the
/// decision records pushed to LAPI servers. Backed by the embedded SQLite
/// pool; writes are observability, so callers log failures instead of
/// failing the forwarded request.
#[derive(Clone)]
pub struct AlertRepository {
    pool: SqlitePool,
}

impl AlertRepository {
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .context("Invalid sqlite URL for alert repository")?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to open alert repository")?;
        let repo = Self { pool };
        repo.ensure_schema().await?;
        Ok(repo)
    }

    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS stored_alerts (
                id TEXT PRIMARY KEY,
                machine_id TEXT,
                scenario TEXT NOT NULL,
                source_scope TEXT,
                source_value TEXT,
                events_count INTEGER NOT NULL DEFAULT 0,
                payload TEXT NOT NULL,
                received_at TEXT NOT NULL,
                filtered INTEGER NOT NULL DEFAULT 0,
                filter_reasons TEXT,
                geo_country_code TEXT,
                geo_country_name TEXT,
                geo_city TEXT,
                geo_region TEXT,
                geo_latitude REAL,
                geo_longitude REAL,
                geo_timezone TEXT
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_stored_alerts_received ON stored_alerts (received_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_stored_alerts_scenario ON stored_alerts (scenario)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS decisions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                server_url TEXT NOT NULL,
                scope TEXT NOT NULL,
                value TEXT NOT NULL,
                dec_type TEXT NOT NULL,
                duration TEXT NOT NULL,
                scenario TEXT,
                created_at TEXT NOT NULL,
                expires_at TEXT,
                UNIQUE (server_url, scope, value)
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Writes one request's batch (survivors and suppressed alike) in a
    /// single transaction. Idempotent on alert UUID so an agent retry does
    /// not double-record.
    pub async fn insert_batch(&self, batch: &[AlertInsert]) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let received_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;
        for item in batch {
            let id = item
                .alert
                .uuid
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let payload = serde_json::to_string(&item.alert)?;
            let reasons = item
                .filter_reasons
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let geo = item.geo.as_ref();
            let result = sqlx::query(
                "INSERT INTO stored_alerts
                     (id, machine_id, scenario, source_scope, source_value, events_count,
                      payload, received_at, filtered, filter_reasons,
                      geo_country_code, geo_country_name, geo_city, geo_region,
                      geo_latitude, geo_longitude, geo_timezone)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (id) DO NOTHING",
            )
            .bind(&id)
            .bind(&item.alert.machine_id)
            .bind(&item.alert.scenario)
            .bind(&item.alert.source.scope)
            .bind(&item.alert.source.value)
            .bind(item.alert.events_count)
            .bind(&payload)
            .bind(&received_at)
            .bind(item.filtered)
            .bind(&reasons)
            .bind(geo.and_then(|g| g.country_code.as_deref()))
            .bind(geo.and_then(|g| g.country_name.as_deref()))
            .bind(geo.and_then(|g| g.city.as_deref()))
            .bind(geo.and_then(|g| g.region.as_deref()))
            .bind(geo.and_then(|g| g.latitude))
            .bind(geo.and_then(|g| g.longitude))
            .bind(geo.and_then(|g| g.timezone.as_deref()))
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn list(&self, query: &AlertQuery) -> Result<Vec<StoredAlert>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM stored_alerts WHERE 1=1");
        if let Some(since) = &query.since {
            builder.push(" AND received_at >= ").push_bind(since);
        }
        if let Some(until) = &query.until {
            builder.push(" AND received_at <= ").push_bind(until);
        }
        if let Some(scenario) = &query.scenario {
            builder.push(" AND scenario = ").push_bind(scenario);
        }
        if let Some(machine_id) = &query.machine_id {
            builder.push(" AND machine_id = ").push_bind(machine_id);
        }
        builder.push(" ORDER BY received_at DESC LIMIT ");
        builder.push_bind(query.limit.unwrap_or(100).clamp(1, 1000));

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_stored_alert).collect()
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<StoredAlert>> {
        let row = sqlx::query("SELECT * FROM stored_alerts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_stored_alert).transpose()
    }

    pub async fn stats(&self, top_n: i64) -> Result<AlertStats> {
        let totals = sqlx::query(
            "SELECT COUNT(*) AS total,
                    COALESCE(SUM(filtered), 0) AS filtered,
                    MIN(received_at) AS first_received_at,
                    MAX(received_at) AS last_received_at
               FROM stored_alerts",
        )
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = totals.get("total");
        let filtered: i64 = totals.get("filtered");

        let top_scenarios = sqlx::query(
            "SELECT scenario AS name, COUNT(*) AS count FROM stored_alerts
              GROUP BY scenario ORDER BY count DESC LIMIT ?",
        )
        .bind(top_n)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| NamedCount { name: row.get("name"), count: row.get("count") })
        .collect();

        let top_countries = sqlx::query(
            "SELECT geo_country_code AS name, COUNT(*) AS count FROM stored_alerts
              WHERE geo_country_code IS NOT NULL
              GROUP BY geo_country_code ORDER BY count DESC LIMIT ?",
        )
        .bind(top_n)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| NamedCount { name: row.get("name"), count: row.get("count") })
        .collect();

        Ok(AlertStats {
            total,
            filtered,
            forwarded: total - filtered,
            first_received_at: totals.get("first_received_at"),
            last_received_at: totals.get("last_received_at"),
            top_scenarios,
            top_countries,
        })
    }

    pub async fn distribution(&self, days: i64) -> Result<AlertDistribution> {
        let cutoff = (Utc::now() - Duration::days(days.max(1)))
            .to_rfc3339_opts(SecondsFormat::Millis, true);

        let by_day_of_week = self.bucketed("strftime('%w', received_at)", &cutoff).await?;
        let by_hour_of_day = self.bucketed("strftime('%H', received_at)", &cutoff).await?;
        let daily = self.bucketed("date(received_at)", &cutoff).await?;

        Ok(AlertDistribution { by_day_of_week, by_hour_of_day, daily })
    }

    async fn bucketed(&self, bucket_expr: &str, cutoff: &str) -> Result<Vec<NamedCount>> {
        let sql = format!(
            "SELECT {bucket_expr} AS name, COUNT(*) AS count FROM stored_alerts
              WHERE received_at >= ? GROUP BY name ORDER BY name"
        );
        Ok(sqlx::query(&sql)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| NamedCount { name: row.get("name"), count: row.get("count") })
            .collect())
    }

    /// Upserts a pushed decision; the unique `(server, scope, value)` key
    /// keeps one active record per remediation target.
    pub async fn upsert_decision(
        &self,
        server_url: &str,
        scope: &str,
        value: &str,
        decision_type: &str,
        duration: &str,
        scenario: Option<&str>,
        expires_at: Option<&str>,
    ) -> Result<()> {
        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        sqlx::query(
            "INSERT INTO decisions
                 (server_url, scope, value, dec_type, duration, scenario, created_at, expires_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (server_url, scope, value) DO UPDATE SET
                 dec_type = excluded.dec_type,
                 duration = excluded.duration,
                 scenario = excluded.scenario,
                 created_at = excluded.created_at,
                 expires_at = excluded.expires_at",
        )
        .bind(server_url)
        .bind(scope)
        .bind(value)
        .bind(decision_type)
        .bind(duration)
        .bind(scenario)
        .bind(created_at)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_decisions(&self) -> Result<Vec<DecisionRecord>> {
        let rows = sqlx::query("SELECT * FROM decisions ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| DecisionRecord {
                id: row.get("id"),
                server_url: row.get("server_url"),
                scope: row.get("scope"),
                value: row.get("value"),
                decision_type: row.get("dec_type"),
                duration: row.get("duration"),
                scenario: row.get("scenario"),
                created_at: row.get("created_at"),
                expires_at: row.get("expires_at"),
            })
            .collect())
    }

    pub async fn delete_decision(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM decisions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn row_to_stored_alert(row: &sqlx::sqlite::SqliteRow) -> Result<StoredAlert> {
    let payload: String = row.get("payload");
    let alert: Alert = serde_json::from_str(&payload).context("Corrupt alert payload")?;
    let reasons: Option<String> = row.get("filter_reasons");
    let filter_reasons = reasons
        .map(|raw| serde_json::from_str::<Vec<String>>(&raw))
        .transpose()
        .context("Corrupt filter reasons")?;

    let country_code: Option<String> = row.get("geo_country_code");
    let latitude: Option<f64> = row.get("geo_latitude");
    let geo = if country_code.is_some() || latitude.is_some() {
        Some(GeoInfo {
            country_code,
            country_name: row.get("geo_country_name"),
            city: row.get("geo_city"),
            region: row.get("geo_region"),
            latitude,
            longitude: row.get("geo_longitude"),
            timezone: row.get("geo_timezone"),
        })
    } else {
        None
    };

    Ok(StoredAlert {
        id: row.get("id"),
        alert,
        received_at: row.get("received_at"),
        filtered: row.get::<i64, _>("filtered") != 0,
        filter_reasons,
        geo,
    })
}
