use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{PgPool, Row, SqlitePool};
use std::str::FromStr;

use crate::models::ValidatedClient;

/// Durable tier of the validation cache. Two backends with identical
/// semantics: the embedded SQLite store (default) and a remote Postgres
/// store for deployments that share validation state.
#[derive(Clone)]
pub enum ValidationStore {
    Sqlite(SqlitePool),
    Postgres(PgPool),
}

impl ValidationStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let store = if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .context("Failed to connect validation store (postgres)")?;
            ValidationStore::Postgres(pool)
        } else {
            let options = SqliteConnectOptions::from_str(url)
                .context("Invalid sqlite URL for validation store")?
                .create_if_missing(true);
            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await
                .context("Failed to open validation store (sqlite)")?;
            ValidationStore::Sqlite(pool)
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        let ddl = "CREATE TABLE IF NOT EXISTS validated_clients (
                token_hash TEXT PRIMARY KEY,
                machine_id TEXT,
                validated_at BIGINT NOT NULL,
                expires_at BIGINT NOT NULL,
                last_accessed_at BIGINT NOT NULL,
                access_count BIGINT NOT NULL DEFAULT 0
            )";
        match self {
            ValidationStore::Sqlite(pool) => {
                sqlx::query(ddl).execute(pool).await?;
            }
            ValidationStore::Postgres(pool) => {
                sqlx::query(ddl).execute(pool).await?;
            }
        }
        Ok(())
    }

    /// Atomically bumps the access bookkeeping, then returns the row.
    pub async fn lookup(&self, token_hash: &str) -> Result<Option<ValidatedClient>> {
        let now = Utc::now().timestamp();
        let client = match self {
            ValidationStore::Sqlite(pool) => sqlx::query(
                "UPDATE validated_clients
                    SET access_count = access_count + 1, last_accessed_at = ?
                  WHERE token_hash = ?
                  RETURNING machine_id, validated_at, expires_at, last_accessed_at, access_count",
            )
            .bind(now)
            .bind(token_hash)
            .fetch_optional(pool)
            .await?
            .map(|row| ValidatedClient {
                machine_id: row.get("machine_id"),
                validated_at: from_epoch(row.get("validated_at")),
                expires_at: from_epoch(row.get("expires_at")),
                last_accessed_at: from_epoch(row.get("last_accessed_at")),
                access_count: row.get("access_count"),
            }),
            ValidationStore::Postgres(pool) => sqlx::query(
                "UPDATE validated_clients
                    SET access_count = access_count + 1, last_accessed_at = $1
                  WHERE token_hash = $2
                  RETURNING machine_id, validated_at, expires_at, last_accessed_at, access_count",
            )
            .bind(now)
            .bind(token_hash)
            .fetch_optional(pool)
            .await?
            .map(|row| ValidatedClient {
                machine_id: row.get("machine_id"),
                validated_at: from_epoch(row.get("validated_at")),
                expires_at: from_epoch(row.get("expires_at")),
                last_accessed_at: from_epoch(row.get("last_accessed_at")),
                access_count: row.get("access_count"),
            }),
        };

        Ok(client)
    }

    /// Upserts a validated entry; a conflict refreshes the validation window
    /// and increments the access count.
    pub async fn store(
        &self,
        token_hash: &str,
        ttl_seconds: u64,
        machine_id: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let expires_at = now + ttl_seconds as i64;
        match self {
            ValidationStore::Sqlite(pool) => {
                sqlx::query(
                    "INSERT INTO validated_clients
                         (token_hash, machine_id, validated_at, expires_at, last_accessed_at, access_count)
                     VALUES (?, ?, ?, ?, ?, 1)
                     ON CONFLICT (token_hash) DO UPDATE SET
                         machine_id = COALESCE(excluded.machine_id, validated_clients.machine_id),
                         validated_at = excluded.validated_at,
                         expires_at = excluded.expires_at,
                         last_accessed_at = excluded.last_accessed_at,
                         access_count = validated_clients.access_count + 1",
                )
                .bind(token_hash)
                .bind(machine_id)
                .bind(now)
                .bind(expires_at)
                .bind(now)
                .execute(pool)
                .await?;
            }
            ValidationStore::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO validated_clients
                         (token_hash, machine_id, validated_at, expires_at, last_accessed_at, access_count)
                     VALUES ($1, $2, $3, $4, $5, 1)
                     ON CONFLICT (token_hash) DO UPDATE SET
                         machine_id = COALESCE(excluded.machine_id, validated_clients.machine_id),
                         validated_at = excluded.validated_at,
                         expires_at = excluded.expires_at,
                         last_accessed_at = excluded.last_accessed_at,
                         access_count = validated_clients.access_count + 1",
                )
                .bind(token_hash)
                .bind(machine_id)
                .bind(now)
                .bind(expires_at)
                .bind(now)
                .execute(pool)
                .await?;
            }
        }
        Ok(())
    }

    /// Bulk-deletes expired entries and returns the count.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let now = Utc::now().timestamp();
        let result = match self {
            ValidationStore::Sqlite(pool) => {
                sqlx::query("DELETE FROM validated_clients WHERE expires_at < ?")
                    .bind(now)
                    .execute(pool)
                    .await?
                    .rows_affected()
            }
            ValidationStore::Postgres(pool) => {
                sqlx::query("DELETE FROM validated_clients WHERE expires_at < $1")
                    .bind(now)
                    .execute(pool)
                    .await?
                    .rows_affected()
            }
        };
        Ok(result)
    }
}

fn from_epoch(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
}
