//! Row types shared by the repositories and the query layer.
//!
//! Timestamps are Unix epoch seconds throughout, matching the stored
//! representation; byte counts on raw samples are per-interval deltas.

use serde::Serialize;

/// An interned process identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub app_id: i64,
    pub process_name: String,
    pub bundle_id: Option<String>,
    pub first_seen: i64,
    pub last_seen: i64,
}

/// An interned domain with its derived parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Domain {
    pub domain_id: i64,
    pub fqdn: String,
    pub parent_domain: String,
    pub first_seen: i64,
    pub last_seen: i64,
}

/// One sampler interval for one application. `ts` is the interval end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSample {
    pub ts: i64,
    pub app_id: i64,
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub packets_out: u64,
    pub packets_in: u64,
    pub active_connections: u32,
}

/// One active-tab observation. Byte fields exist for schema symmetry and
/// are always written as zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserDomainSample {
    pub ts: i64,
    pub domain_id: i64,
    pub app_id: i64,
    pub bytes_out: u64,
    pub bytes_in: u64,
}

/// A rolled-up hour for one application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HourlyAggregate {
    pub hour_start: i64,
    pub app_id: i64,
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub packets_out: u64,
    pub packets_in: u64,
    pub max_active_connections: u32,
    pub sample_count: u64,
}

/// A rolled-up day for one application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyAggregate {
    pub day_start: i64,
    pub app_id: i64,
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub packets_out: u64,
    pub packets_in: u64,
    pub max_active_connections: u32,
    pub sample_count: u64,
}

/// Audit entry written by the aggregator and retention scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionLogEntry {
    pub log_id: i64,
    pub operation: String,
    pub ts: i64,
    pub records_affected: i64,
    pub details: Option<String>,
}

/// Per-application usage over a query window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppUsage {
    pub app_id: i64,
    pub process_name: String,
    pub bundle_id: Option<String>,
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub total_bytes: u64,
    pub first_seen: i64,
    pub last_seen: i64,
}

/// Per-domain usage over a query window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainUsage {
    pub domain_id: i64,
    pub fqdn: String,
    pub parent_domain: String,
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub total_bytes: u64,
    pub first_seen: i64,
    pub last_seen: i64,
}

/// One bucket of a timeline. Buckets with no data are zero-valued, never
/// absent, so clients can render without gap detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelinePoint {
    pub ts: i64,
    pub bytes_out: u64,
    pub bytes_in: u64,
}

impl TimelinePoint {
    pub fn zero(ts: i64) -> Self {
        Self {
            ts,
            bytes_out: 0,
            bytes_in: 0,
        }
    }
}
