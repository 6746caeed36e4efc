use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::ValidationConfig;
use crate::memory_cache::MemoryCache;
use crate::metrics::ProxyMetrics;
use crate::models::ValidatedClient;
use crate::validation_store::ValidationStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationReason {
    NoAuthHeader,
    CachedMemory,
    CachedSqlite,
    Validated,
    InvalidCredentials,
    CapiErrorFailClosed,
    CapiErrorFailOpen,
}

impl ValidationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationReason::NoAuthHeader => "no_auth_header",
            ValidationReason::CachedMemory => "cached_memory",
            ValidationReason::CachedSqlite => "cached_sqlite",
            ValidationReason::Validated => "validated",
            ValidationReason::InvalidCredentials => "invalid_credentials",
            ValidationReason::CapiErrorFailClosed => "capi_error_failclosed",
            ValidationReason::CapiErrorFailOpen => "capi_error_failopen",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub reason: ValidationReason,
    pub machine_id: Option<String>,
}

impl ValidationOutcome {
    fn rejected(reason: ValidationReason) -> Self {
        Self { valid: false, reason, machine_id: None }
    }

    fn accepted(reason: ValidationReason, machine_id: Option<String>) -> Self {
        Self { valid: true, reason, machine_id }
    }
}

pub fn fingerprint(auth_header: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(auth_header.as_bytes());
    hex::encode(hasher.finalize())
}

/// Authenticates inbound agents by their Authorization header: memory tier,
/// then durable tier, then a lightweight HEAD probe against CAPI. The probe
/// outcome is cached so a CAPI outage does not stampede every inbound
/// request into an upstream call.
#[derive(Clone)]
pub struct ClientValidator {
    config: ValidationConfig,
    capi_url: String,
    memory: MemoryCache,
    store: ValidationStore,
    http: reqwest::Client,
    metrics: Arc<ProxyMetrics>,
}

impl ClientValidator {
    pub fn new(
        config: ValidationConfig,
        capi_url: impl Into<String>,
        memory: MemoryCache,
        store: ValidationStore,
        http: reqwest::Client,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        Self {
            config,
            capi_url: capi_url.into(),
            memory,
            store,
            http,
            metrics,
        }
    }

    pub fn memory(&self) -> &MemoryCache {
        &self.memory
    }

    pub async fn validate(&self, auth_header: Option<&str>) -> ValidationOutcome {
        let outcome = self.validate_inner(auth_header).await;
        self.metrics.record_validation(outcome.reason.as_str());
        outcome
    }

    async fn validate_inner(&self, auth_header: Option<&str>) -> ValidationOutcome {
        let Some(header) = auth_header else {
            return ValidationOutcome::rejected(ValidationReason::NoAuthHeader);
        };
        let hash = fingerprint(header);
        let now = Utc::now();

        if let Some(entry) = self.memory.get(&hash) {
            if !entry.is_expired(now) {
                return ValidationOutcome::accepted(ValidationReason::CachedMemory, entry.machine_id);
            }
            self.memory.remove(&hash);
        }

        match self.store.lookup(&hash).await {
            Ok(Some(entry)) if !entry.is_expired(now) => {
                self.memory.set(hash.clone(), entry.clone());
                return ValidationOutcome::accepted(
                    ValidationReason::CachedSqlite,
                    entry.machine_id,
                );
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, fingerprint = &hash[..12], "Validation store lookup failed");
            }
        }

        self.probe_capi(header, &hash).await
    }

    async fn probe_capi(&self, header: &str, hash: &str) -> ValidationOutcome {
        let url = format!("{}/v2/decisions/stream?startup=true", self.capi_url);
        let result = self
            .http
            .head(&url)
            .header(reqwest::header::AUTHORIZATION, header)
            .timeout(Duration::from_millis(self.config.validation_timeout_ms))
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                self.cache_validated(hash, self.config.cache_ttl_seconds).await;
                debug!(fingerprint = &hash[..12], "Client validated against CAPI");
                ValidationOutcome::accepted(ValidationReason::Validated, None)
            }
            Ok(resp) if resp.status().as_u16() == 401 || resp.status().as_u16() == 403 => {
                debug!(fingerprint = &hash[..12], status = resp.status().as_u16(), "CAPI rejected credentials");
                ValidationOutcome::rejected(ValidationReason::InvalidCredentials)
            }
            Ok(resp) => {
                warn!(
                    fingerprint = &hash[..12],
                    status = resp.status().as_u16(),
                    "CAPI validation probe returned unexpected status"
                );
                self.capi_error_outcome(hash).await
            }
            Err(err) => {
                warn!(fingerprint = &hash[..12], error = %err, "CAPI validation probe failed");
                self.capi_error_outcome(hash).await
            }
        }
    }

    async fn capi_error_outcome(&self, hash: &str) -> ValidationOutcome {
        if self.config.fail_closed {
            return ValidationOutcome::rejected(ValidationReason::CapiErrorFailClosed);
        }
        // Short-TTL cache so we re-probe soon without stampeding.
        self.cache_validated(hash, self.config.cache_ttl_error_seconds).await;
        ValidationOutcome::accepted(ValidationReason::CapiErrorFailOpen, None)
    }

    async fn cache_validated(&self, hash: &str, ttl_seconds: u64) {
        let now = Utc::now();
        let entry = ValidatedClient {
            machine_id: None,
            validated_at: now,
            expires_at: now + chrono::Duration::seconds(ttl_seconds as i64),
            last_accessed_at: now,
            access_count: 1,
        };
        self.memory.set(hash.to_string(), entry);
        if let Err(err) = self.store.store(hash, ttl_seconds, None).await {
            warn!(error = %err, fingerprint = &hash[..12], "Failed to persist validated client");
        }
    }

    /// Sweeps both cache tiers; returns (memory_removed, store_removed).
    pub async fn cleanup_expired(&self) -> (usize, u64) {
        let memory_removed = self.memory.cleanup_expired();
        let store_removed = match self.store.cleanup_expired().await {
            Ok(count) => count,
            Err(err) => {
                warn!(error = %err, "Validation store cleanup failed");
                0
            }
        };
        (memory_removed, store_removed)
    }

    pub fn spawn_cleanup_task(&self) {
        let validator = self.clone();
        let period = Duration::from_secs(self.config.cleanup_seconds);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let (memory_removed, store_removed) = validator.cleanup_expired().await;
                debug!(memory_removed, store_removed, "Expired validation entries removed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use httpmock::Method::HEAD;
    use sqlx::sqlite::SqlitePoolOptions;

    fn test_config(fail_closed: bool) -> ValidationConfig {
        ValidationConfig {
            enabled: true,
            cache_ttl_seconds: 3600,
            cache_ttl_error_seconds: 30,
            validation_timeout_ms: 1000,
            max_memory_entries: 16,
            fail_closed,
            cleanup_seconds: 300,
        }
    }

    async fn memory_store() -> ValidationStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = ValidationStore::Sqlite(pool);
        store.ensure_schema().await.unwrap();
        store
    }

    async fn validator_for(server: &MockServer, fail_closed: bool) -> ClientValidator {
        ClientValidator::new(
            test_config(fail_closed),
            server.base_url(),
            MemoryCache::new(16),
            memory_store().await,
            reqwest::Client::new(),
            Arc::new(ProxyMetrics::new().unwrap()),
        )
    }

    #[tokio::test]
    async fn missing_header_is_rejected_without_upstream_call() {
        let server = MockServer::start();
        let probe = server.mock(|when, then| {
            when.method(HEAD).path("/v2/decisions/stream");
            then.status(200);
        });
        let validator = validator_for(&server, false).await;
        let outcome = validator.validate(None).await;
        assert!(!outcome.valid);
        assert_eq!(outcome.reason, ValidationReason::NoAuthHeader);
        probe.assert_hits(0);
    }

    #[tokio::test]
    async fn cache_miss_then_memory_hit() {
        let server = MockServer::start();
        let probe = server.mock(|when, then| {
            when.method(HEAD)
                .path("/v2/decisions/stream")
                .query_param("startup", "true")
                .header("authorization", "Bearer X");
            then.status(200);
        });
        let validator = validator_for(&server, false).await;

        let first = validator.validate(Some("Bearer X")).await;
        assert!(first.valid);
        assert_eq!(first.reason, ValidationReason::Validated);
        assert_eq!(validator.memory().len(), 1);

        let second = validator.validate(Some("Bearer X")).await;
        assert!(second.valid);
        assert_eq!(second.reason, ValidationReason::CachedMemory);
        probe.assert_hits(1);
    }

    #[tokio::test]
    async fn store_hit_promotes_to_memory() {
        let server = MockServer::start();
        let probe = server.mock(|when, then| {
            when.method(HEAD).path("/v2/decisions/stream");
            then.status(200);
        });
        let store = memory_store().await;
        let hash = fingerprint("Bearer warm");
        store.store(&hash, 3600, Some("machine-7")).await.unwrap();

        let validator = ClientValidator::new(
            test_config(false),
            server.base_url(),
            MemoryCache::new(16),
            store,
            reqwest::Client::new(),
            Arc::new(ProxyMetrics::new().unwrap()),
        );

        let first = validator.validate(Some("Bearer warm")).await;
        assert_eq!(first.reason, ValidationReason::CachedSqlite);
        assert_eq!(first.machine_id.as_deref(), Some("machine-7"));
        assert_eq!(validator.memory().len(), 1);

        let second = validator.validate(Some("Bearer warm")).await;
        assert_eq!(second.reason, ValidationReason::CachedMemory);
        probe.assert_hits(0);
    }

    #[tokio::test]
    async fn invalid_credentials_are_not_cached() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(HEAD).path("/v2/decisions/stream");
            then.status(401);
        });
        let validator = validator_for(&server, false).await;
        let outcome = validator.validate(Some("Bearer bad")).await;
        assert!(!outcome.valid);
        assert_eq!(outcome.reason, ValidationReason::InvalidCredentials);
        assert!(validator.memory().is_empty());
    }

    #[tokio::test]
    async fn outage_fails_open_with_error_ttl() {
        let server = MockServer::start();
        let probe = server.mock(|when, then| {
            when.method(HEAD).path("/v2/decisions/stream");
            then.status(503);
        });
        let validator = validator_for(&server, false).await;

        let outcome = validator.validate(Some("Bearer X")).await;
        assert!(outcome.valid);
        assert_eq!(outcome.reason, ValidationReason::CapiErrorFailOpen);

        let entry = validator.memory().get(&fingerprint("Bearer X")).unwrap();
        let ttl = entry.expires_at - entry.validated_at;
        assert_eq!(ttl.num_seconds(), 30);

        // Cached: no further probe within the error TTL.
        let again = validator.validate(Some("Bearer X")).await;
        assert_eq!(again.reason, ValidationReason::CachedMemory);
        probe.assert_hits(1);
    }

    #[tokio::test]
    async fn outage_fails_closed_when_configured() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(HEAD).path("/v2/decisions/stream");
            then.status(503);
        });
        let validator = validator_for(&server, true).await;
        let outcome = validator.validate(Some("Bearer X")).await;
        assert!(!outcome.valid);
        assert_eq!(outcome.reason, ValidationReason::CapiErrorFailClosed);
        assert!(validator.memory().is_empty());
    }
}
