use chrono::{DateTime, SecondsFormat};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct LogSourceDef {
    pub grafana_url: String,
    #[serde(default)]
    pub token: String,
    pub datasource_uid: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogQueryDef {
    pub expr: String,
    #[serde(default = "default_max_lines")]
    pub max_lines: u32,
}

fn default_max_lines() -> u32 {
    1_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionDef {
    /// Only "json" lines are parsed; anything else keeps raw lines only.
    #[serde(default)]
    pub format: String,
    /// Output field name → dotted path into the parsed line.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

/// A parsed log line. Loki timestamps arrive in nanoseconds; they are
/// normalized to ISO-8601 here so downstream arithmetic is uniform.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub raw: String,
    pub timestamp: String,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Default)]
pub struct LogFetchResult {
    pub logs: Vec<LogEntry>,
    pub error: Option<String>,
}

/// Structured query client for Grafana-fronted Loki datasources.
#[derive(Clone)]
pub struct LokiClient {
    http: reqwest::Client,
}

impl LokiClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Fetch errors never propagate as `Err`: the scheduler records them on
    /// the run, so they come back inside the result.
    pub async fn fetch(
        &self,
        source: &LogSourceDef,
        query: &LogQueryDef,
        extraction: &ExtractionDef,
        lookback: &str,
    ) -> LogFetchResult {
        let url = format!("{}/api/ds/query", source.grafana_url.trim_end_matches('/'));
        let body = json!({
            "queries": [{
                "refId": "A",
                "expr": query.expr,
                "maxLines": query.max_lines,
                "datasource": {"uid": source.datasource_uid},
                "queryType": "range"
            }],
            "from": format!("now-{lookback}"),
            "to": "now"
        });

        let mut request = self
            .http
            .post(&url)
            .timeout(Duration::from_millis(source.timeout_ms))
            .json(&body);
        if !source.token.is_empty() {
            request = request.bearer_auth(&source.token);
        }

        let response = match request.send().await {
            Ok(resp) => resp,
            Err(err) if err.is_timeout() => {
                warn!(%url, "Log source query timed out");
                return LogFetchResult { logs: Vec::new(), error: Some("Request timeout".into()) };
            }
            Err(err) => {
                warn!(%url, error = %err, "Log source query failed");
                return LogFetchResult { logs: Vec::new(), error: Some(err.to_string()) };
            }
        };

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            warn!(%url, status = status.as_u16(), "Log source returned error");
            return LogFetchResult {
                logs: Vec::new(),
                error: Some(format!("HTTP {status}: {detail}")),
            };
        }

        let payload: Value = match response.json().await {
            Ok(value) => value,
            Err(err) => {
                return LogFetchResult {
                    logs: Vec::new(),
                    error: Some(format!("Invalid response body: {err}")),
                }
            }
        };

        let logs = parse_frames(&payload, extraction);
        debug!(%url, count = logs.len(), "Fetched log lines");
        LogFetchResult { logs, error: None }
    }
}

/// The first frame's `data.values` is a `(timestamps[ns], labels[],
/// lines[])` triple.
fn parse_frames(payload: &Value, extraction: &ExtractionDef) -> Vec<LogEntry> {
    let values = payload
        .get("results")
        .and_then(|r| r.get("A"))
        .and_then(|a| a.get("frames"))
        .and_then(|f| f.get(0))
        .and_then(|frame| frame.get("data"))
        .and_then(|data| data.get("values"));
    let Some(values) = values else {
        return Vec::new();
    };

    let timestamps = values.get(0).and_then(Value::as_array);
    let lines = values.get(2).and_then(Value::as_array);
    let (Some(timestamps), Some(lines)) = (timestamps, lines) else {
        return Vec::new();
    };

    let mut entries = Vec::with_capacity(lines.len());
    for (index, line) in lines.iter().enumerate() {
        let Some(raw) = line.as_str() else { continue };
        let timestamp = timestamps
            .get(index)
            .and_then(Value::as_i64)
            .map(nanos_to_iso)
            .unwrap_or_default();

        let mut fields = Map::new();
        if extraction.format == "json" {
            // Unparseable lines are skipped, not fatal.
            match serde_json::from_str::<Value>(raw) {
                Ok(parsed) => {
                    for (name, path) in &extraction.fields {
                        if let Some(value) = dotted_get(&parsed, path) {
                            if !value.is_null() {
                                fields.insert(name.clone(), value.clone());
                            }
                        }
                    }
                }
                Err(_) => continue,
            }
        }

        entries.push(LogEntry { raw: raw.to_string(), timestamp, fields });
    }
    entries
}

fn nanos_to_iso(nanos: i64) -> String {
    DateTime::from_timestamp_nanos(nanos).to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Dotted-path navigation; a missing or null step short-circuits.
fn dotted_get<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, part| current.get(part))
}
