use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;

use crate::analyzers::AnalyzerDef;
use crate::filters::FilterDef;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub capi_url: String,
    pub proxy_timeout_ms: u64,
    pub validation: ValidationConfig,
    pub database_url: String,
    pub validation_database_url: Option<String>,
    pub geoip_path: Option<String>,
    pub admin_api_key: Option<String>,
    pub rules_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ValidationConfig {
    pub enabled: bool,
    pub cache_ttl_seconds: u64,
    pub cache_ttl_error_seconds: u64,
    pub validation_timeout_ms: u64,
    pub max_memory_entries: usize,
    pub fail_closed: bool,
    pub cleanup_seconds: u64,
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self> {
        let capi_url = env::var("CAPI_URL")
            .unwrap_or_else(|_| "https://api.crowdsec.net".to_string())
            .trim_end_matches('/')
            .to_string();
        let proxy_timeout_ms = u64_from_env("PROXY_TIMEOUT_MS").unwrap_or(30_000);

        let validation = ValidationConfig {
            enabled: bool_from_env("VALIDATION_ENABLED").unwrap_or(true),
            cache_ttl_seconds: u64_from_env("VALIDATION_CACHE_TTL_SECONDS").unwrap_or(3600),
            cache_ttl_error_seconds: u64_from_env("VALIDATION_CACHE_TTL_ERROR_SECONDS").unwrap_or(60),
            validation_timeout_ms: u64_from_env("VALIDATION_TIMEOUT_MS").unwrap_or(5_000),
            max_memory_entries: u64_from_env("VALIDATION_MAX_MEMORY_ENTRIES").unwrap_or(1_000) as usize,
            fail_closed: bool_from_env("VALIDATION_FAIL_CLOSED").unwrap_or(false),
            cleanup_seconds: u64_from_env("VALIDATION_CLEANUP_SECONDS").unwrap_or(300).max(10),
        };

        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:signal-proxy.db".to_string());
        let validation_database_url = env::var("VALIDATION_DATABASE_URL")
            .ok()
            .and_then(|value| normalize_optional(&value));
        let geoip_path = env::var("GEOIP_PATH").ok().and_then(|value| normalize_optional(&value));
        let admin_api_key =
            env::var("ADMIN_API_KEY").ok().and_then(|value| normalize_optional(&value));
        let rules_path =
            env::var("PROXY_RULES_PATH").ok().and_then(|value| normalize_optional(&value));

        Ok(Self {
            capi_url,
            proxy_timeout_ms: proxy_timeout_ms.max(1),
            validation,
            database_url,
            validation_database_url,
            geoip_path,
            admin_api_key,
            rules_path,
        })
    }
}

/// Structured definitions too rich for flat env vars: filter rules,
/// analyzers, and the LAPI servers decisions are pushed to.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RulesFile {
    #[serde(default)]
    pub filters: Vec<FilterDef>,
    #[serde(default)]
    pub analyzers: Vec<AnalyzerDef>,
    #[serde(default)]
    pub lapi_servers: Vec<LapiServer>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LapiServer {
    pub url: String,
    pub token: String,
}

impl RulesFile {
    pub fn load(path: Option<&str>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read rules file {path}"))?;
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse rules file {path}"))
    }
}

fn bool_from_env(key: &str) -> Option<bool> {
    env::var(key).ok().map(|value| {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn u64_from_env(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.parse::<u64>().ok())
}

fn normalize_optional(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_from_env_parses() {
        std::env::set_var("PROXY_TEST_BOOL_TRUE", "true");
        std::env::set_var("PROXY_TEST_BOOL_ONE", "1");
        std::env::set_var("PROXY_TEST_BOOL_FALSE", "no");
        assert_eq!(bool_from_env("PROXY_TEST_BOOL_TRUE"), Some(true));
        assert_eq!(bool_from_env("PROXY_TEST_BOOL_ONE"), Some(true));
        assert_eq!(bool_from_env("PROXY_TEST_BOOL_FALSE"), Some(false));
        assert_eq!(bool_from_env("PROXY_TEST_BOOL_UNSET"), None);
    }

    #[test]
    fn rules_file_parses_all_sections() {
        let raw = r#"{
            "filters": [
                {"name": "drop-probing", "enabled": true,
                 "rule": {"type": "scenario", "patterns": ["crowdsecurity/http-probing"]}}
            ],
            "analyzers": [
                {"id": "ssh-bf", "name": "SSH bruteforce", "enabled": true,
                 "interval_ms": 60000, "lookback": "15m",
                 "source": {"grafana_url": "http://grafana:3000", "token": "t", "datasource_uid": "loki"},
                 "query": {"expr": "{job=\"sshd\"}", "max_lines": 500},
                 "extraction": {"format": "json", "fields": {"remoteIP": "log.remote_ip"}},
                 "detection": {"type": "threshold", "group_by": "remoteIP", "min_count": 10,
                               "scenario": "proxy/ssh-bf",
                               "decision": {"type": "ban", "duration": "4h", "scope": "ip"}}}
            ],
            "lapi_servers": [{"url": "http://lapi:8080", "token": "secret"}]
        }"#;
        let rules: RulesFile = serde_json::from_str(raw).unwrap();
        assert_eq!(rules.filters.len(), 1);
        assert_eq!(rules.analyzers.len(), 1);
        assert_eq!(rules.lapi_servers.len(), 1);
        assert_eq!(rules.analyzers[0].interval_ms, 60_000);
    }

    #[test]
    fn missing_rules_path_defaults_empty() {
        let rules = RulesFile::load(None).unwrap();
        assert!(rules.filters.is_empty());
        assert!(rules.analyzers.is_empty());
        assert!(rules.lapi_servers.is_empty());
    }
}
