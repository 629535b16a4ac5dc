use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::store::Caller;

/// Distinguishes the bookkeeping record written when a request enters the
/// pipeline from the record carrying a response's token figure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageKind {
    Request,
    Tokens,
}

impl UsageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Tokens => "tokens",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub caller_id: Option<i64>,
    pub endpoint: String,
    pub tokens: u64,
    pub kind: UsageKind,
    pub created_at: DateTime<Utc>,
}

impl UsageRecord {
    pub fn request(caller_id: Option<i64>, endpoint: impl Into<String>) -> Self {
        Self {
            caller_id,
            endpoint: endpoint.into(),
            tokens: 0,
            kind: UsageKind::Request,
            created_at: Utc::now(),
        }
    }

    pub fn tokens(caller_id: i64, endpoint: impl Into<String>, tokens: u64) -> Self {
        Self {
            caller_id: Some(caller_id),
            endpoint: endpoint.into(),
            tokens,
            kind: UsageKind::Tokens,
            created_at: Utc::now(),
        }
    }
}

/// Canonical text form for stored timestamps. Fixed precision keeps the
/// strings lexicographically ordered, which `MAX(created_at)` relies on.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Reads `usage.total_tokens` from a buffered completion body.
///
/// `Ok(None)` means the body is JSON but carries no token figure; `Err` means
/// the body is not JSON at all. Callers treat both as "nothing to record".
pub fn extract_total_tokens(body: &[u8]) -> Result<Option<u64>, serde_json::Error> {
    if body.is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_slice(body)?;
    Ok(value
        .get("usage")
        .and_then(|usage| usage.get("total_tokens"))
        .and_then(token_count))
}

/// Counts arrive as integers, but some servers emit them as `42.0`.
fn token_count(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= 0.0 && *f <= u64::MAX as f64)
            .map(|f| f as u64)
    })
}

/// One (caller, endpoint) group as produced by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAggregate {
    pub caller_id: i64,
    pub endpoint: String,
    pub request_count: u64,
    pub total_tokens: u64,
    pub last_request: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CallerUsage {
    pub total_requests: u64,
    pub total_tokens: u64,
    pub last_request: Option<String>,
    pub endpoints: BTreeMap<String, u64>,
}

pub type UsageReport = BTreeMap<String, CallerUsage>;

/// Folds per-endpoint aggregates into the per-caller-name report.
///
/// Every known caller appears, even without usage. Aggregates for callers
/// that no longer exist are dropped.
pub fn build_report(callers: &[Caller], aggregates: &[EndpointAggregate]) -> UsageReport {
    let names: HashMap<i64, &str> = callers.iter().map(|c| (c.id, c.name.as_str())).collect();
    let mut report = UsageReport::new();
    let mut last_seen: HashMap<&str, DateTime<Utc>> = HashMap::new();
    for caller in callers {
        report.entry(caller.name.clone()).or_default();
    }

    for agg in aggregates {
        let Some(name) = names.get(&agg.caller_id).copied() else {
            continue;
        };
        let entry = report.entry(name.to_string()).or_default();
        entry.total_requests += agg.request_count;
        entry.total_tokens += agg.total_tokens;
        *entry.endpoints.entry(agg.endpoint.clone()).or_insert(0) += agg.request_count;
        if let Some(ts) = agg.last_request {
            let slot = last_seen.entry(name).or_insert(ts);
            if ts > *slot {
                *slot = ts;
            }
        }
    }

    for (name, ts) in last_seen {
        if let Some(entry) = report.get_mut(name) {
            entry.last_request = Some(format_timestamp(ts));
        }
    }
    report
}

/// Groups raw records the same way the SQL aggregate query does.
pub fn aggregate_records(records: &[UsageRecord]) -> Vec<EndpointAggregate> {
    let mut groups: BTreeMap<(i64, String), EndpointAggregate> = BTreeMap::new();
    for record in records {
        let Some(caller_id) = record.caller_id else {
            continue;
        };
        let agg = groups
            .entry((caller_id, record.endpoint.clone()))
            .or_insert_with(|| EndpointAggregate {
                caller_id,
                endpoint: record.endpoint.clone(),
                request_count: 0,
                total_tokens: 0,
                last_request: None,
            });
        if record.kind == UsageKind::Request {
            agg.request_count += 1;
        }
        agg.total_tokens = agg.total_tokens.saturating_add(record.tokens);
        agg.last_request = match agg.last_request {
            Some(ts) if ts >= record.created_at => Some(ts),
            _ => Some(record.created_at),
        };
    }
    groups.into_values().collect()
}
