use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Alert as pushed by agents to `POST /v2/signals`. Fields the proxy never
/// inspects are kept in `extra` so re-serialized survivors stay
/// wire-compatible with what the agent sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    #[serde(default)]
    pub scenario: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub events_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_at: Option<String>,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub source: Source,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub decisions: Vec<Decision>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub meta: Vec<MetaItem>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaItem {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Source {
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Source {
    /// The address used for GeoIP enrichment and IP-range filters. `ip`
    /// scoped sources carry the address in `value`; some agents also fill
    /// the dedicated `ip` field.
    pub fn address(&self) -> Option<&str> {
        if let Some(ip) = self.ip.as_deref() {
            return Some(ip);
        }
        if self.scope.eq_ignore_ascii_case("ip") {
            return Some(self.value.as_str());
        }
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(rename = "type", default)]
    pub decision_type: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub duration: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulated: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// GeoIP enrichment attached to a stored alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

/// Alert as persisted by the repository and served to the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct StoredAlert {
    pub id: String,
    pub alert: Alert,
    pub received_at: String,
    pub filtered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_reasons: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo: Option<GeoInfo>,
}

/// Decision record persisted when an analyzer (or the admin API) pushes a
/// remediation to a LAPI server.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    pub id: i64,
    pub server_url: String,
    pub scope: String,
    pub value: String,
    #[serde(rename = "type")]
    pub decision_type: String,
    pub duration: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

/// Validated-client cache entry, keyed by the SHA-256 fingerprint of the
/// full Authorization header value.
#[derive(Debug, Clone)]
pub struct ValidatedClient {
    pub machine_id: Option<String>,
    pub validated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: i64,
}

impl ValidatedClient {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_roundtrip_preserves_unknown_fields() {
        let raw = serde_json::json!({
            "uuid": "422cd875-a316-4304-a241-3814c9694830",
            "machine_id": "m1",
            "scenario": "crowdsecurity/ssh-bf",
            "events_count": 6,
            "source": { "scope": "ip", "value": "203.0.113.9", "cn": "FR" },
            "labels": ["manual"],
            "capacity": 5
        });
        let alert: Alert = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(alert.scenario, "crowdsecurity/ssh-bf");
        assert_eq!(alert.source.address(), Some("203.0.113.9"));
        let back = serde_json::to_value(&alert).unwrap();
        assert_eq!(back.get("labels"), raw.get("labels"));
        assert_eq!(back.get("capacity"), raw.get("capacity"));
    }

    #[test]
    fn source_address_prefers_ip_field() {
        let source = Source {
            scope: "range".into(),
            value: "203.0.113.0/24".into(),
            ip: Some("203.0.113.7".into()),
            ..Default::default()
        };
        assert_eq!(source.address(), Some("203.0.113.7"));

        let non_ip = Source { scope: "username".into(), value: "root".into(), ..Default::default() };
        assert_eq!(non_ip.address(), None);
    }
}
