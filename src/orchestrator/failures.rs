//! Failure history.
//!
//! Bounded, in-memory record of probe/launch/restart failures. Records are
//! resolved the next time their engine becomes HEALTHY. Long-term retention is
//! an external store's concern.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ProbeTimeout,
    ProbeError,
    Unhealthy,
    ReadinessTimeout,
    DependencyNotReady,
    LaunchFailed,
    RestartFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureRecord {
    pub engine: String,
    pub kind: FailureKind,
    pub message: String,
    pub at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FailureReport {
    pub window_hours: i64,
    pub total: usize,
    pub by_kind: BTreeMap<FailureKind, usize>,
    pub by_engine: BTreeMap<String, usize>,
    pub unresolved: usize,
    pub average_resolution_secs: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct FailureLog {
    capacity: usize,
    records: VecDeque<FailureRecord>,
}

impl FailureLog {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), records: VecDeque::new() }
    }

    pub fn record(&mut self, engine: &str, kind: FailureKind, message: impl Into<String>, at: DateTime<Utc>) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(FailureRecord {
            engine: engine.to_string(),
            kind,
            message: message.into(),
            at,
            resolved_at: None,
        });
    }

    /// Close every open record for `engine`.
    pub fn resolve(&mut self, engine: &str, at: DateTime<Utc>) -> usize {
        let mut closed = 0;
        for r in self.records.iter_mut().filter(|r| r.engine == engine && r.resolved_at.is_none()) {
            r.resolved_at = Some(at);
            closed += 1;
        }
        closed
    }

    pub fn records(&self) -> impl Iterator<Item = &FailureRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Summarise records newer than `hours` before `now`.
pub fn failure_report<'a>(
    records: impl IntoIterator<Item = &'a FailureRecord>,
    hours: i64,
    now: DateTime<Utc>,
) -> FailureReport {
    let cutoff = now - Duration::hours(hours);
    let mut report = FailureReport { window_hours: hours, ..Default::default() };
    let mut resolution_secs = Vec::new();

    for r in records.into_iter().filter(|r| r.at >= cutoff) {
        report.total += 1;
        *report.by_kind.entry(r.kind).or_default() += 1;
        *report.by_engine.entry(r.engine.clone()).or_default() += 1;
        match r.resolved_at {
            Some(done) => resolution_secs.push((done - r.at).num_milliseconds() as f64 / 1000.0),
            None => report.unresolved += 1,
        }
    }

    if !resolution_secs.is_empty() {
        report.average_resolution_secs = Some(resolution_secs.iter().sum::<f64>() / resolution_secs.len() as f64);
    }
    report
}

/// Share of time since the first recorded failure during which no failure
/// was open, as a percentage. Overlapping outages count once; an unresolved
/// failure is still open at `now`.
pub fn uptime_percentage<'a>(records: impl IntoIterator<Item = &'a FailureRecord>, now: DateTime<Utc>) -> f64 {
    let mut outages: Vec<(DateTime<Utc>, DateTime<Utc>)> = records
        .into_iter()
        .map(|r| (r.at, r.resolved_at.unwrap_or(now).min(now)))
        .collect();
    let Some(since) = outages.iter().map(|(start, _)| *start).min() else {
        return 100.0;
    };
    let total = (now - since).num_milliseconds();
    if total <= 0 {
        return 100.0;
    }

    outages.sort_by_key(|(start, _)| *start);
    let mut down = 0i64;
    let mut open: Option<(DateTime<Utc>, DateTime<Utc>)> = None;
    for (start, end) in outages {
        open = match open {
            Some((s, e)) if start <= e => Some((s, e.max(end))),
            Some((s, e)) => {
                down += (e - s).num_milliseconds().max(0);
                Some((start, end))
            }
            None => Some((start, end)),
        };
    }
    if let Some((s, e)) = open {
        down += (e - s).num_milliseconds().max(0);
    }

    ((total - down) as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}
