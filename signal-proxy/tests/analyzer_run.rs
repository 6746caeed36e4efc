//! Analyzer runs end to end: mocked Grafana/Loki source, mocked LAPI,
//! triggered through the admin surface.

mod support;

use httpmock::prelude::*;
use std::collections::BTreeMap;
use std::time::Duration;
use support::{spawn_proxy, ProxyOptions, TestProxy};

use signal_proxy::analyzers::{AnalyzerDef, DecisionTemplate, DetectionRule};
use signal_proxy::config::LapiServer;
use signal_proxy::loki::{ExtractionDef, LogQueryDef, LogSourceDef};
use signal_proxy::repository::AlertQuery;
use signal_proxy::scheduler::RunStatus;

fn analyzer(id: &str, grafana_url: &str) -> AnalyzerDef {
    AnalyzerDef {
        id: id.into(),
        name: "SSH bruteforce".into(),
        enabled: true,
        interval_ms: 60_000,
        lookback: "15m".into(),
        source: LogSourceDef {
            grafana_url: grafana_url.into(),
            token: "grafana-token".into(),
            datasource_uid: "loki".into(),
            timeout_ms: 2_000,
        },
        query: LogQueryDef { expr: "{job=\"sshd\"}".into(), max_lines: 500 },
        extraction: ExtractionDef {
            format: "json".into(),
            fields: BTreeMap::from([("remoteIP".to_string(), "remote_ip".to_string())]),
        },
        detection: DetectionRule::Threshold {
            group_by: "remoteIP".into(),
            min_count: 2,
            scenario: "proxy/ssh-bf".into(),
            decision: DecisionTemplate {
                decision_type: "ban".into(),
                duration: "4h".into(),
                scope: "ip".into(),
            },
        },
    }
}

fn loki_frames() -> serde_json::Value {
    serde_json::json!({
        "results": {"A": {"frames": [{"data": {"values": [
            [1700000000000000000i64, 1700000001000000000i64, 1700000002000000000i64],
            [{}, {}, {}],
            [
                "{\"remote_ip\": \"203.0.113.5\"}",
                "{\"remote_ip\": \"203.0.113.5\"}",
                "{\"remote_ip\": \"198.51.100.9\"}"
            ]
        ]}}]}}
    })
}

async fn wait_for_run(proxy: &TestProxy, id: &str) -> signal_proxy::scheduler::AnalyzerRun {
    for _ in 0..100 {
        if let Some(runs) = proxy.state.scheduler.runs(id) {
            if let Some(run) = runs.first() {
                return run.clone();
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("analyzer {id} never completed a run");
}

#[tokio::test(flavor = "multi_thread")]
async fn triggered_run_persists_alerts_and_pushes_decisions() {
    let capi = MockServer::start();
    let backend = MockServer::start();
    let grafana = backend.mock(|when, then| {
        when.method(POST)
            .path("/api/ds/query")
            .header("authorization", "Bearer grafana-token");
        then.status(200).json_body(loki_frames());
    });
    let lapi = backend.mock(|when, then| {
        when.method(POST)
            .path("/v1/alerts")
            .header("authorization", "Bearer lapi-token")
            .body_contains("203.0.113.5");
        then.status(201).body("[\"1\"]");
    });

    let options = ProxyOptions {
        validation_enabled: false,
        analyzers: vec![analyzer("ssh-bf", &backend.base_url())],
        lapi_servers: vec![LapiServer { url: backend.base_url(), token: "lapi-token".into() }],
        ..Default::default()
    };
    let proxy = spawn_proxy(&capi.base_url(), options).await;
    let client = reqwest::Client::new();

    let triggered = client
        .post(proxy.url("/api/analyzers/ssh-bf/trigger"))
        .header("X-API-Key", "test-admin-key")
        .send()
        .await
        .unwrap();
    assert_eq!(triggered.status().as_u16(), 202);

    let run = wait_for_run(&proxy, "ssh-bf").await;
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.logs_fetched, 3);
    assert_eq!(run.alerts_generated, 1);
    assert_eq!(run.decisions_pushed, 1);
    assert!(run.error.is_none());
    grafana.assert_hits(1);
    lapi.assert_hits(1);

    // One synthesized alert, persisted unfiltered.
    let alerts = proxy.state.repository.list(&AlertQuery::default()).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert!(!alerts[0].filtered);
    assert_eq!(alerts[0].alert.scenario, "proxy/ssh-bf");
    assert_eq!(alerts[0].alert.source.value, "203.0.113.5");

    // The pushed decision is recorded against the LAPI server.
    let decisions = proxy.state.repository.list_decisions().await.unwrap();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].value, "203.0.113.5");
    assert_eq!(decisions[0].decision_type, "ban");
    assert!(decisions[0].expires_at.is_some());

    // The next scheduled run moved past the run start by the interval.
    let snapshot = proxy
        .state
        .scheduler
        .snapshots()
        .into_iter()
        .find(|s| s.id == "ssh-bf")
        .unwrap();
    assert!(snapshot.next_run >= run.started_at);

    // Admin surface reflects the run history.
    let runs: Vec<serde_json::Value> = client
        .get(proxy.url("/api/analyzers/ssh-bf/runs"))
        .header("X-API-Key", "test-admin-key")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["status"], "success");
    assert_eq!(runs[0]["decisions_pushed"], 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn trigger_while_running_conflicts() {
    let capi = MockServer::start();
    let backend = MockServer::start();
    backend.mock(|when, then| {
        when.method(POST).path("/api/ds/query");
        then.status(200)
            .delay(Duration::from_millis(500))
            .json_body(loki_frames());
    });

    let options = ProxyOptions {
        validation_enabled: false,
        analyzers: vec![analyzer("slow", &backend.base_url())],
        ..Default::default()
    };
    let proxy = spawn_proxy(&capi.base_url(), options).await;
    let client = reqwest::Client::new();

    let first = client
        .post(proxy.url("/api/analyzers/slow/trigger"))
        .header("X-API-Key", "test-admin-key")
        .send()
        .await
        .unwrap();
    assert_eq!(first.status().as_u16(), 202);

    // The first run is still fetching logs.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = client
        .post(proxy.url("/api/analyzers/slow/trigger"))
        .header("X-API-Key", "test-admin-key")
        .send()
        .await
        .unwrap();
    assert_eq!(second.status().as_u16(), 409);
    let body: serde_json::Value = second.json().await.unwrap();
    assert_eq!(body["error"], "analyzer_running");

    let run = wait_for_run(&proxy, "slow").await;
    assert_eq!(run.status, RunStatus::Success);

    let missing = client
        .post(proxy.url("/api/analyzers/unknown/trigger"))
        .header("X-API-Key", "test-admin-key")
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status().as_u16(), 404);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_fetch_ends_run_in_error_without_pushes() {
    let capi = MockServer::start();
    let backend = MockServer::start();
    backend.mock(|when, then| {
        when.method(POST).path("/api/ds/query");
        then.status(500).body("datasource exploded");
    });
    let lapi = backend.mock(|when, then| {
        when.method(POST).path("/v1/alerts");
        then.status(201);
    });

    let options = ProxyOptions {
        validation_enabled: false,
        analyzers: vec![analyzer("broken", &backend.base_url())],
        lapi_servers: vec![LapiServer { url: backend.base_url(), token: "lapi-token".into() }],
        ..Default::default()
    };
    let proxy = spawn_proxy(&capi.base_url(), options).await;

    let triggered = reqwest::Client::new()
        .post(proxy.url("/api/analyzers/broken/trigger"))
        .header("X-API-Key", "test-admin-key")
        .send()
        .await
        .unwrap();
    assert_eq!(triggered.status().as_u16(), 202);

    let run = wait_for_run(&proxy, "broken").await;
    assert_eq!(run.status, RunStatus::Error);
    assert!(run.error.as_deref().unwrap().contains("500"));
    assert_eq!(run.decisions_pushed, 0);
    lapi.assert_hits(0);

    let alerts = proxy.state.repository.list(&AlertQuery::default()).await.unwrap();
    assert!(alerts.is_empty());
}
