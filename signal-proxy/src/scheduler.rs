use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::analyzers::{duration_seconds, AnalyzerDef, DecisionPush};
use crate::config::LapiServer;
use crate::geoip::GeoIpResolver;
use crate::loki::LokiClient;
use crate::metrics::ProxyMetrics;
use crate::repository::{AlertInsert, AlertRepository};

const RUN_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyzerState {
    Idle,
    Running,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Error,
}

impl RunStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyzerRun {
    pub started_at: String,
    pub completed_at: String,
    pub status: RunStatus,
    pub logs_fetched: usize,
    pub alerts_generated: usize,
    pub decisions_pushed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyzerSnapshot {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub interval_ms: u64,
    pub state: AnalyzerState,
    pub next_run: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<AnalyzerRun>,
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("unknown analyzer")]
    NotFound,
    #[error("analyzer is already running")]
    AlreadyRunning,
}

struct AnalyzerEntry {
    def: AnalyzerDef,
    state: AnalyzerState,
    next_run: DateTime<Utc>,
    history: VecDeque<AnalyzerRun>,
}

struct SchedulerInner {
    entries: Mutex<HashMap<String, AnalyzerEntry>>,
    repository: AlertRepository,
    geoip: Option<Arc<GeoIpResolver>>,
    loki: LokiClient,
    http: reqwest::Client,
    lapi_servers: Vec<LapiServer>,
    metrics: Arc<ProxyMetrics>,
}

/// Periodic per-analyzer runner. Each analyzer moves through
/// idle → running → {idle | errored}; at most one run per analyzer is
/// active, runs of different analyzers are independent, and scheduler
/// failures never reach the forwarding path.
#[derive(Clone)]
pub struct AnalyzerScheduler {
    inner: Arc<SchedulerInner>,
}

impl AnalyzerScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        defs: Vec<AnalyzerDef>,
        repository: AlertRepository,
        geoip: Option<Arc<GeoIpResolver>>,
        loki: LokiClient,
        http: reqwest::Client,
        lapi_servers: Vec<LapiServer>,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        let now = Utc::now();
        let entries = defs
            .into_iter()
            .map(|def| {
                let id = def.id.clone();
                let entry = AnalyzerEntry {
                    def,
                    state: AnalyzerState::Idle,
                    next_run: now,
                    history: VecDeque::new(),
                };
                (id, entry)
            })
            .collect();
        Self {
            inner: Arc::new(SchedulerInner {
                entries: Mutex::new(entries),
                repository,
                geoip,
                loki,
                http,
                lapi_servers,
                metrics,
            }),
        }
    }

    pub fn spawn_driver(&self) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for id in scheduler.due_analyzers() {
                    let runner = scheduler.clone();
                    tokio::spawn(async move { runner.run_analyzer(&id).await });
                }
            }
        });
    }

    fn due_analyzers(&self) -> Vec<String> {
        let now = Utc::now();
        let guard = self.inner.entries.lock().expect("scheduler lock poisoned");
        guard
            .values()
            .filter(|entry| {
                entry.def.enabled && entry.state != AnalyzerState::Running && now >= entry.next_run
            })
            .map(|entry| entry.def.id.clone())
            .collect()
    }

    /// Out-of-band run request from the admin surface. Rejected while the
    /// analyzer is mid-run.
    pub fn try_trigger(&self, id: &str) -> Result<(), TriggerError> {
        {
            let guard = self.inner.entries.lock().expect("scheduler lock poisoned");
            let entry = guard.get(id).ok_or(TriggerError::NotFound)?;
            if entry.state == AnalyzerState::Running {
                return Err(TriggerError::AlreadyRunning);
            }
        }
        let scheduler = self.clone();
        let id = id.to_string();
        tokio::spawn(async move { scheduler.run_analyzer(&id).await });
        Ok(())
    }

    pub fn snapshots(&self) -> Vec<AnalyzerSnapshot> {
        let guard = self.inner.entries.lock().expect("scheduler lock poisoned");
        let mut snapshots: Vec<AnalyzerSnapshot> = guard
            .values()
            .map(|entry| AnalyzerSnapshot {
                id: entry.def.id.clone(),
                name: entry.def.name.clone(),
                enabled: entry.def.enabled,
                interval_ms: entry.def.interval_ms,
                state: entry.state,
                next_run: entry.next_run.to_rfc3339_opts(SecondsFormat::Millis, true),
                last_run: entry.history.back().cloned(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    pub fn runs(&self, id: &str) -> Option<Vec<AnalyzerRun>> {
        let guard = self.inner.entries.lock().expect("scheduler lock poisoned");
        guard
            .get(id)
            .map(|entry| entry.history.iter().rev().cloned().collect())
    }

    async fn run_analyzer(&self, id: &str) {
        // Claim the run; bail if a concurrent trigger won the race.
        let def = {
            let mut guard = self.inner.entries.lock().expect("scheduler lock poisoned");
            let Some(entry) = guard.get_mut(id) else { return };
            if entry.state == AnalyzerState::Running {
                return;
            }
            entry.state = AnalyzerState::Running;
            entry.def.clone()
        };
        let started_at = Utc::now();
        debug!(analyzer = id, "Analyzer run started");

        let fetched = self
            .inner
            .loki
            .fetch(&def.source, &def.query, &def.extraction, &def.lookback)
            .await;
        if let Some(error) = fetched.error {
            warn!(analyzer = id, error = %error, "Analyzer log fetch failed");
            self.finish_run(id, started_at, RunStatus::Error, 0, 0, 0, Some(error));
            return;
        }
        let logs_fetched = fetched.logs.len();

        let detection = def.detection.detect(id, &fetched.logs);
        let alerts_generated = detection.alerts.len();

        let batch: Vec<AlertInsert> = detection
            .alerts
            .into_iter()
            .map(|alert| {
                let geo = self.inner.geoip.as_ref().and_then(|resolver| {
                    alert.source.address().and_then(|ip| resolver.lookup(ip))
                });
                AlertInsert { alert, filtered: false, filter_reasons: None, geo }
            })
            .collect();
        if let Err(err) = self.inner.repository.insert_batch(&batch).await {
            warn!(analyzer = id, error = %err, "Failed to persist analyzer alerts");
        }

        let mut decisions_pushed = 0usize;
        for decision in &detection.decisions {
            decisions_pushed += self.push_to_all(decision).await;
        }

        info!(
            analyzer = id,
            logs_fetched, alerts_generated, decisions_pushed, "Analyzer run completed"
        );
        self.finish_run(
            id,
            started_at,
            RunStatus::Success,
            logs_fetched,
            alerts_generated,
            decisions_pushed,
            None,
        );
    }

    /// Pushes one decision to every configured LAPI server, recording each
    /// success. Returns the number of successful pushes; partial failures
    /// are counted, not propagated.
    pub async fn push_to_all(&self, decision: &DecisionPush) -> usize {
        let mut pushed = 0usize;
        for server in &self.inner.lapi_servers {
            if self.push_decision(server, decision).await {
                pushed += 1;
                self.record_decision(server, decision).await;
            }
        }
        pushed
    }

    async fn push_decision(&self, server: &LapiServer, decision: &DecisionPush) -> bool {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let body = serde_json::json!([{
            "machine_id": "signal-proxy",
            "scenario": decision.scenario,
            "message": format!("{} on {} {}", decision.decision_type, decision.scope, decision.value),
            "events_count": 1,
            "start_at": now,
            "stop_at": now,
            "events": [],
            "source": {"scope": decision.scope, "value": decision.value},
            "decisions": [{
                "origin": "signal-proxy",
                "type": decision.decision_type,
                "scope": decision.scope,
                "value": decision.value,
                "duration": decision.duration,
                "scenario": decision.scenario
            }]
        }]);

        let url = format!("{}/v1/alerts", server.url.trim_end_matches('/'));
        let result = self
            .inner
            .http
            .post(&url)
            .timeout(Duration::from_secs(10))
            .bearer_auth(&server.token)
            .json(&body)
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(%url, status = resp.status().as_u16(), "LAPI rejected decision push");
                false
            }
            Err(err) => {
                warn!(%url, error = %err, "LAPI decision push failed");
                false
            }
        }
    }

    async fn record_decision(&self, server: &LapiServer, decision: &DecisionPush) {
        let expires_at = duration_seconds(&decision.duration).map(|secs| {
            (Utc::now() + ChronoDuration::seconds(secs as i64))
                .to_rfc3339_opts(SecondsFormat::Millis, true)
        });
        if let Err(err) = self
            .inner
            .repository
            .upsert_decision(
                &server.url,
                &decision.scope,
                &decision.value,
                &decision.decision_type,
                &decision.duration,
                Some(&decision.scenario),
                expires_at.as_deref(),
            )
            .await
        {
            warn!(error = %err, "Failed to record pushed decision");
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_run(
        &self,
        id: &str,
        started_at: DateTime<Utc>,
        status: RunStatus,
        logs_fetched: usize,
        alerts_generated: usize,
        decisions_pushed: usize,
        error: Option<String>,
    ) {
        self.inner.metrics.record_analyzer_run(status.as_str());
        let completed_at = Utc::now();
        let mut guard = self.inner.entries.lock().expect("scheduler lock poisoned");
        let Some(entry) = guard.get_mut(id) else { return };
        entry.state = match status {
            RunStatus::Success => AnalyzerState::Idle,
            RunStatus::Error => AnalyzerState::Errored,
        };
        entry.next_run = completed_at + ChronoDuration::milliseconds(entry.def.interval_ms as i64);
        entry.history.push_back(AnalyzerRun {
            started_at: started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            completed_at: completed_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            status,
            logs_fetched,
            alerts_generated,
            decisions_pushed,
            error,
        });
        while entry.history.len() > RUN_HISTORY_LIMIT {
            entry.history.pop_front();
        }
    }
}
