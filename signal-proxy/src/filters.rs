use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::Deserialize;
use std::net::IpAddr;

use crate::models::Alert;

#[derive(Debug, Clone, Deserialize)]
pub struct FilterDef {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub rule: FilterRule,
}

fn default_enabled() -> bool {
    true
}

/// One predicate variant per configured filter entry. Rules are pure: no
/// I/O on the hot path; enrichment that needs I/O runs before the engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterRule {
    /// Scenario name match, exact or trailing-`*` prefix.
    Scenario { patterns: Vec<String> },
    /// Source address inside any of the CIDR ranges.
    IpRange { ranges: Vec<IpNetwork> },
    /// Originating machine identifier match.
    MachineId { machine_ids: Vec<String> },
    /// All sub-rules must match.
    Composite { all: Vec<FilterRule> },
}

pub struct FilterCtx<'a> {
    pub machine_id: Option<&'a str>,
    pub now: DateTime<Utc>,
}

impl FilterRule {
    fn matches(&self, alert: &Alert, ctx: &FilterCtx) -> Option<String> {
        match self {
            FilterRule::Scenario { patterns } => patterns.iter().find_map(|pattern| {
                let hit = match pattern.strip_suffix('*') {
                    Some(prefix) => alert.scenario.starts_with(prefix),
                    None => alert.scenario == *pattern,
                };
                hit.then(|| format!("scenario {} matches {}", alert.scenario, pattern))
            }),
            FilterRule::IpRange { ranges } => {
                let addr: IpAddr = alert.source.address()?.parse().ok()?;
                ranges
                    .iter()
                    .find(|range| range.contains(addr))
                    .map(|range| format!("source {addr} in {range}"))
            }
            FilterRule::MachineId { machine_ids } => {
                let observed = alert.machine_id.as_deref().or(ctx.machine_id)?;
                machine_ids
                    .iter()
                    .any(|id| id == observed)
                    .then(|| format!("machine {observed}"))
            }
            FilterRule::Composite { all } => {
                let mut reasons = Vec::with_capacity(all.len());
                for rule in all {
                    reasons.push(rule.matches(alert, ctx)?);
                }
                Some(reasons.join(" and "))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct FilterMatch {
    pub filter_name: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct AlertFilterResult {
    pub suppressed: bool,
    pub matched: Vec<FilterMatch>,
}

#[derive(Debug)]
pub struct FilterOutcome {
    pub original_count: usize,
    pub filtered_count: usize,
    pub passed_count: usize,
    pub surviving: Vec<Alert>,
    /// Per input alert, in input order.
    pub results: Vec<AlertFilterResult>,
}

pub struct FilterEngine {
    filters: Vec<FilterDef>,
}

impl FilterEngine {
    pub fn new(filters: Vec<FilterDef>) -> Self {
        Self { filters }
    }

    pub fn filter_count(&self) -> usize {
        self.filters.iter().filter(|f| f.enabled).count()
    }

    /// Evaluates every enabled filter against every alert. No short-circuit:
    /// multi-cause suppression is fully attributed in the result.
    pub fn evaluate(&self, alerts: &[Alert], ctx: &FilterCtx) -> FilterOutcome {
        let mut surviving = Vec::with_capacity(alerts.len());
        let mut results = Vec::with_capacity(alerts.len());

        for alert in alerts {
            let matched: Vec<FilterMatch> = self
                .filters
                .iter()
                .filter(|filter| filter.enabled)
                .filter_map(|filter| {
                    filter.rule.matches(alert, ctx).map(|reason| FilterMatch {
                        filter_name: filter.name.clone(),
                        reason,
                    })
                })
                .collect();

            let suppressed = !matched.is_empty();
            if !suppressed {
                surviving.push(alert.clone());
            }
            results.push(AlertFilterResult { suppressed, matched });
        }

        FilterOutcome {
            original_count: alerts.len(),
            filtered_count: results.iter().filter(|r| r.suppressed).count(),
            passed_count: surviving.len(),
            surviving,
            results,
        }
    }
}
