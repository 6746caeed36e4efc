use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::loki::{ExtractionDef, LogEntry, LogQueryDef, LogSourceDef};
use crate::models::{Alert, Event, MetaItem, Source};

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzerDef {
    pub id: String,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub interval_ms: u64,
    #[serde(default = "default_lookback")]
    pub lookback: String,
    pub source: LogSourceDef,
    pub query: LogQueryDef,
    pub extraction: ExtractionDef,
    pub detection: DetectionRule,
}

fn default_enabled() -> bool {
    true
}

fn default_lookback() -> String {
    "15m".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DetectionRule {
    /// Groups entries by a projected field; a group reaching `min_count`
    /// emits one alert and one decision for the group key.
    Threshold {
        group_by: String,
        min_count: usize,
        scenario: String,
        decision: DecisionTemplate,
    },
    /// Every entry whose field matches the pattern emits an alert; one
    /// decision per distinct value.
    FieldMatch {
        field: String,
        pattern: String,
        scenario: String,
        decision: DecisionTemplate,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecisionTemplate {
    #[serde(rename = "type", default = "default_decision_type")]
    pub decision_type: String,
    #[serde(default = "default_duration")]
    pub duration: String,
    #[serde(default = "default_scope")]
    pub scope: String,
}

fn default_decision_type() -> String {
    "ban".to_string()
}

fn default_duration() -> String {
    "4h".to_string()
}

fn default_scope() -> String {
    "ip".to_string()
}

/// A decision an analyzer wants pushed to every configured LAPI server.
#[derive(Debug, Clone)]
pub struct DecisionPush {
    pub scope: String,
    pub value: String,
    pub decision_type: String,
    pub duration: String,
    pub scenario: String,
}

#[derive(Debug, Default)]
pub struct Detection {
    pub alerts: Vec<Alert>,
    pub decisions: Vec<DecisionPush>,
}

impl DetectionRule {
    pub fn detect(&self, analyzer_id: &str, entries: &[LogEntry]) -> Detection {
        match self {
            DetectionRule::Threshold { group_by, min_count, scenario, decision } => {
                let mut groups: BTreeMap<String, Vec<&LogEntry>> = BTreeMap::new();
                for entry in entries {
                    if let Some(value) = entry.fields.get(group_by).map(stringify) {
                        groups.entry(value).or_default().push(entry);
                    }
                }

                let mut detection = Detection::default();
                for (key, group) in groups {
                    if group.len() < *min_count {
                        continue;
                    }
                    detection.alerts.push(synthesize_alert(
                        analyzer_id,
                        scenario,
                        &decision.scope,
                        &key,
                        &group,
                    ));
                    detection.decisions.push(DecisionPush {
                        scope: decision.scope.clone(),
                        value: key,
                        decision_type: decision.decision_type.clone(),
                        duration: decision.duration.clone(),
                        scenario: scenario.clone(),
                    });
                }
                detection
            }
            DetectionRule::FieldMatch { field, pattern, scenario, decision } => {
                let mut detection = Detection::default();
                let mut seen = BTreeMap::new();
                for entry in entries {
                    let Some(value) = entry.fields.get(field).map(stringify) else {
                        continue;
                    };
                    let hit = match pattern.strip_suffix('*') {
                        Some(prefix) => value.starts_with(prefix),
                        None => value == *pattern,
                    };
                    if !hit {
                        continue;
                    }
                    detection.alerts.push(synthesize_alert(
                        analyzer_id,
                        scenario,
                        &decision.scope,
                        &value,
                        &[entry],
                    ));
                    if seen.insert(value.clone(), ()).is_none() {
                        detection.decisions.push(DecisionPush {
                            scope: decision.scope.clone(),
                            value,
                            decision_type: decision.decision_type.clone(),
                            duration: decision.duration.clone(),
                            scenario: scenario.clone(),
                        });
                    }
                }
                detection
            }
        }
    }
}

fn synthesize_alert(
    analyzer_id: &str,
    scenario: &str,
    scope: &str,
    value: &str,
    entries: &[&LogEntry],
) -> Alert {
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let start_at = entries
        .iter()
        .map(|e| e.timestamp.as_str())
        .filter(|ts| !ts.is_empty())
        .min()
        .unwrap_or(now.as_str())
        .to_string();
    let stop_at = entries
        .iter()
        .map(|e| e.timestamp.as_str())
        .filter(|ts| !ts.is_empty())
        .max()
        .unwrap_or(now.as_str())
        .to_string();

    let events = entries
        .iter()
        .map(|entry| Event {
            timestamp: Some(entry.timestamp.clone()),
            meta: entry
                .fields
                .iter()
                .map(|(key, val)| MetaItem { key: key.clone(), value: stringify(val) })
                .collect(),
            extra: Default::default(),
        })
        .collect::<Vec<_>>();

    Alert {
        uuid: Some(Uuid::new_v4().to_string()),
        machine_id: Some(format!("analyzer/{analyzer_id}")),
        scenario: scenario.to_string(),
        scenario_hash: None,
        scenario_version: None,
        message: Some(format!(
            "{scenario}: {count} matching log entries for {value}",
            count = entries.len()
        )),
        events_count: entries.len() as i64,
        start_at: Some(start_at),
        stop_at: Some(stop_at),
        events,
        source: Source {
            scope: scope.to_string(),
            value: value.to_string(),
            ip: scope.eq_ignore_ascii_case("ip").then(|| value.to_string()),
            ..Default::default()
        },
        decisions: Vec::new(),
        extra: Default::default(),
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parses decision durations of the form `90s`, `30m`, `4h`, `1d`.
pub fn duration_seconds(duration: &str) -> Option<u64> {
    let duration = duration.trim();
    let (number, unit) = duration.split_at(duration.len().checked_sub(1)?);
    let factor = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        _ => return duration.parse::<u64>().ok(),
    };
    number.parse::<u64>().ok().map(|n| n * factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn entry(ts: &str, fields: &[(&str, Value)]) -> LogEntry {
        let mut map = Map::new();
        for (key, value) in fields {
            map.insert(key.to_string(), value.clone());
        }
        LogEntry { raw: "{}".into(), timestamp: ts.into(), fields: map }
    }

    fn template() -> DecisionTemplate {
        DecisionTemplate { decision_type: "ban".into(), duration: "4h".into(), scope: "ip".into() }
    }

    #[test]
    fn threshold_groups_and_emits_above_min_count() {
        let rule = DetectionRule::Threshold {
            group_by: "remoteIP".into(),
            min_count: 2,
            scenario: "proxy/ssh-bf".into(),
            decision: template(),
        };
        let entries = vec![
            entry("2026-08-01T10:00:00.000Z", &[("remoteIP", Value::from("203.0.113.5"))]),
            entry("2026-08-01T10:01:00.000Z", &[("remoteIP", Value::from("203.0.113.5"))]),
            entry("2026-08-01T10:02:00.000Z", &[("remoteIP", Value::from("198.51.100.1"))]),
        ];
        let detection = rule.detect("ssh-bf", &entries);
        assert_eq!(detection.alerts.len(), 1);
        assert_eq!(detection.decisions.len(), 1);

        let alert = &detection.alerts[0];
        assert_eq!(alert.scenario, "proxy/ssh-bf");
        assert_eq!(alert.source.value, "203.0.113.5");
        assert_eq!(alert.source.ip.as_deref(), Some("203.0.113.5"));
        assert_eq!(alert.events_count, 2);
        assert_eq!(alert.start_at.as_deref(), Some("2026-08-01T10:00:00.000Z"));
        assert_eq!(alert.stop_at.as_deref(), Some("2026-08-01T10:01:00.000Z"));
        assert_eq!(alert.machine_id.as_deref(), Some("analyzer/ssh-bf"));
        assert!(alert.uuid.is_some());

        assert_eq!(detection.decisions[0].value, "203.0.113.5");
        assert_eq!(detection.decisions[0].decision_type, "ban");
    }

    #[test]
    fn field_match_dedupes_decisions_per_value() {
        let rule = DetectionRule::FieldMatch {
            field: "path".into(),
            pattern: "/admin*".into(),
            scenario: "proxy/admin-scan".into(),
            decision: template(),
        };
        let entries = vec![
            entry("2026-08-01T10:00:00.000Z", &[("path", Value::from("/admin/login"))]),
            entry("2026-08-01T10:00:10.000Z", &[("path", Value::from("/admin/login"))]),
            entry("2026-08-01T10:00:20.000Z", &[("path", Value::from("/index.html"))]),
        ];
        let detection = rule.detect("admin-scan", &entries);
        assert_eq!(detection.alerts.len(), 2);
        assert_eq!(detection.decisions.len(), 1);
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(duration_seconds("90s"), Some(90));
        assert_eq!(duration_seconds("30m"), Some(1800));
        assert_eq!(duration_seconds("4h"), Some(14_400));
        assert_eq!(duration_seconds("1d"), Some(86_400));
        assert_eq!(duration_seconds("300"), Some(300));
        assert_eq!(duration_seconds("soon"), None);
        assert_eq!(duration_seconds(""), None);
    }
}
