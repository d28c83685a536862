//! Aggregation-aware read side.
//!
//! Every request picks the cheapest storage tier that still covers the
//! requested window: raw rows while the window fits inside the raw TTL,
//! then hourly, then daily. Timelines always come back as exactly N
//! zero-padded points.

use std::sync::Arc;

use chrono::{Datelike, TimeZone, Utc};
use serde::Serialize;

use crate::config::RuntimeSettings;
use crate::error::MonitorError;
use crate::store::apps::{AppRepository, SortKey, SortOrder, Tier};
use crate::store::domains::DomainRepository;
use crate::store::models::{AppUsage, Application, Domain, DomainUsage, TimelinePoint};
use crate::store::samples::SampleRepository;
use crate::store::Database;

const MAX_LIST_LIMIT: u32 = 1000;
const DEFAULT_LIST_LIMIT: u32 = 100;

/// Named query periods accepted by the HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    OneHour,
    Day,
    Week,
    Month,
    Quarter,
}

impl Period {
    pub fn parse(s: &str) -> Result<Self, MonitorError> {
        match s {
            "1h" => Ok(Self::OneHour),
            "24h" => Ok(Self::Day),
            "7d" => Ok(Self::Week),
            "30d" => Ok(Self::Month),
            "90d" => Ok(Self::Quarter),
            other => Err(MonitorError::validation(format!(
                "period must be one of 1h/24h/7d/30d/90d, got {other:?}"
            ))),
        }
    }

    pub fn secs(self) -> i64 {
        match self {
            Self::OneHour => 3_600,
            Self::Day => 86_400,
            Self::Week => 7 * 86_400,
            Self::Month => 30 * 86_400,
            Self::Quarter => 90 * 86_400,
        }
    }
}

/// Default bucket count for a window, capped so a 90-day chart does not
/// return half a million raw points.
pub fn bucket_cap(window_secs: i64) -> u32 {
    if window_secs <= 3_600 {
        60
    } else if window_secs <= 86_400 {
        288
    } else if window_secs <= 7 * 86_400 {
        168
    } else {
        720
    }
}

/// Picks the cheapest tier that covers a window, given the live TTLs.
pub fn tier_for_window(window_secs: i64, raw_ttl_days: u32, hour_ttl_days: u32) -> Tier {
    if window_secs <= i64::from(raw_ttl_days) * 86_400 {
        Tier::Raw
    } else if window_secs <= i64::from(hour_ttl_days) * 86_400 {
        Tier::Hourly
    } else {
        Tier::Daily
    }
}

/// Current transfer rate over the last two sampler ticks.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bandwidth {
    pub bytes_per_second: f64,
    pub window_seconds: u64,
}

/// Totals for the summary endpoint.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total_bytes_out: u64,
    pub total_bytes_in: u64,
    pub total_bytes_today: u64,
    pub total_bytes_week: u64,
    pub total_bytes_month: u64,
    pub top_app: Option<String>,
    pub top_domain: Option<String>,
    pub monitoring_since: Option<i64>,
}

/// Application detail plus lifetime usage.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDetail {
    #[serde(flatten)]
    pub application: Application,
    pub usage: AppUsage,
}

/// Domain detail plus lifetime usage.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainDetail {
    #[serde(flatten)]
    pub domain: Domain,
    pub usage: DomainUsage,
}

/// Timeline request: a named period or an explicit window, plus an
/// optional bucket-count override.
#[derive(Debug, Clone, Default)]
pub struct TimelineRequest {
    pub period: Option<String>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub buckets: Option<u32>,
}

/// List parameters shared by the apps and domains endpoints.
#[derive(Debug, Clone, Default)]
pub struct ListParams {
    pub limit: Option<u32>,
    pub since: Option<i64>,
    pub sort_by: Option<String>,
    pub order: Option<String>,
}

pub struct QueryEngine {
    db: Database,
    settings: Arc<RuntimeSettings>,
}

impl QueryEngine {
    pub fn new(db: Database, settings: Arc<RuntimeSettings>) -> Self {
        Self { db, settings }
    }

    fn transient(e: anyhow::Error) -> MonitorError {
        MonitorError::TransientIo(e.to_string())
    }

    /// Current rate from the last two adjacent raw ticks only. More ticks
    /// would double-count delta semantics; fewer than two yields zero.
    pub async fn bandwidth(&self, now: i64) -> Result<Bandwidth, MonitorError> {
        let interval = self.settings.snapshot().daemon.sampling_interval_seconds as i64;
        let window = 2 * interval;
        let since = now - window;

        let ticks = self
            .db
            .execute(move |conn| SampleRepository::new(conn).tick_totals(since, now + 1))
            .await
            .map_err(Self::transient)?;

        let rate = match ticks.as_slice() {
            [.., (prev_ts, _, _), (last_ts, out, r#in)] if last_ts > prev_ts => {
                (out + r#in) as f64 / (last_ts - prev_ts) as f64
            }
            _ => 0.0,
        };

        Ok(Bandwidth {
            bytes_per_second: rate,
            window_seconds: window as u64,
        })
    }

    /// Bucketed timeline across all applications.
    pub async fn timeline(
        &self,
        request: &TimelineRequest,
        now: i64,
    ) -> Result<Vec<TimelinePoint>, MonitorError> {
        self.timeline_inner(request, None, now).await
    }

    /// Bucketed timeline for a single application.
    pub async fn app_timeline(
        &self,
        app_id: i64,
        request: &TimelineRequest,
        now: i64,
    ) -> Result<Vec<TimelinePoint>, MonitorError> {
        self.app_get(app_id).await?;
        self.timeline_inner(request, Some(app_id), now).await
    }

    async fn timeline_inner(
        &self,
        request: &TimelineRequest,
        app_id: Option<i64>,
        now: i64,
    ) -> Result<Vec<TimelinePoint>, MonitorError> {
        let (since, until) = self.resolve_window(request, now)?;
        let window = until - since;

        let cap = bucket_cap(window);
        let buckets = match request.buckets {
            Some(0) => return Err(MonitorError::validation("buckets must be >= 1")),
            Some(n) => n.min(cap),
            None => cap,
        };
        let width = (window + i64::from(buckets) - 1) / i64::from(buckets);
        let width = width.max(1);

        let cfg = self.settings.snapshot();
        let tier = tier_for_window(window, cfg.retention.raw_ttl_days, cfg.retention.hour_ttl_days);

        let rows = self
            .db
            .execute(move |conn| SampleRepository::new(conn).timeline_rows(tier, since, until, app_id))
            .await
            .map_err(Self::transient)?;

        let mut points: Vec<TimelinePoint> = (0..buckets)
            .map(|i| TimelinePoint::zero(since + i64::from(i) * width))
            .collect();

        for (ts, out, r#in) in rows {
            let idx = ((ts - since) / width).clamp(0, i64::from(buckets) - 1) as usize;
            points[idx].bytes_out += out;
            points[idx].bytes_in += r#in;
        }

        Ok(points)
    }

    fn resolve_window(
        &self,
        request: &TimelineRequest,
        now: i64,
    ) -> Result<(i64, i64), MonitorError> {
        if let Some(period) = &request.period {
            let period = Period::parse(period)?;
            return Ok((now - period.secs(), now));
        }

        let since = request
            .since
            .ok_or_else(|| MonitorError::validation("either period or since is required"))?;
        let until = request.until.unwrap_or(now);
        if since >= until {
            return Err(MonitorError::validation("since must be before until"));
        }
        Ok((since, until))
    }

    /// Headline totals and top app/domain over the requested window
    /// (default: today), plus today / week / month totals, all read in a
    /// single transaction so the numbers are mutually consistent.
    pub async fn summary(
        &self,
        window: Option<(i64, Option<i64>)>,
        now: i64,
    ) -> Result<Summary, MonitorError> {
        let cfg = self.settings.snapshot();
        let raw_ttl = cfg.retention.raw_ttl_days;
        let hour_ttl = cfg.retention.hour_ttl_days;

        let today_start = crate::clock::day_start(now);
        let (week_start, month_start) = calendar_window_starts(now);

        let (head_since, head_until) = match window {
            Some((since, until)) => {
                let until = until.unwrap_or(now);
                if since >= until {
                    return Err(MonitorError::validation("since must be before until"));
                }
                (since, until + 1)
            }
            None => (today_start, now + 1),
        };

        self.db
            .execute(move |conn| {
                let tx = conn.transaction()?;
                let summary = {
                    let samples = SampleRepository::new(&tx);

                    let head_tier =
                        tier_for_window(head_until - head_since, raw_ttl, hour_ttl);
                    let today_tier = tier_for_window(now - today_start, raw_ttl, hour_ttl);
                    let week_tier = tier_for_window(now - week_start, raw_ttl, hour_ttl);
                    let month_tier = tier_for_window(now - month_start, raw_ttl, hour_ttl);

                    let (out_head, in_head) =
                        samples.sum_window(head_tier, head_since, head_until)?;
                    let (out_today, in_today) =
                        samples.sum_window(today_tier, today_start, now + 1)?;
                    let (out_week, in_week) = samples.sum_window(week_tier, week_start, now + 1)?;
                    let (out_month, in_month) =
                        samples.sum_window(month_tier, month_start, now + 1)?;

                    let top_app = samples.top_app(head_tier, head_since, head_until)?;
                    let top_domain = samples.top_domain(head_tier, head_since, head_until)?;

                    let monitoring_since: Option<i64> = tx
                        .query_row("SELECT MIN(first_seen) FROM applications", [], |row| {
                            row.get(0)
                        })
                        .unwrap_or(None);

                    Summary {
                        total_bytes_out: out_head,
                        total_bytes_in: in_head,
                        total_bytes_today: out_today + in_today,
                        total_bytes_week: out_week + in_week,
                        total_bytes_month: out_month + in_month,
                        top_app,
                        top_domain,
                        monitoring_since,
                    }
                };
                tx.commit()?;
                Ok(summary)
            })
            .await
            .map_err(Self::transient)
    }

    /// Applications with usage over the window, sorted by a closed key.
    pub async fn apps_list(
        &self,
        params: &ListParams,
        now: i64,
    ) -> Result<Vec<AppUsage>, MonitorError> {
        let (limit, sort, order) = parse_list_params(params)?;
        let since = params.since.unwrap_or(0);
        let tier = self.tier_for_since(since, now);

        self.db
            .execute(move |conn| {
                AppRepository::new(conn).list_usage(tier, since, now + 1, limit, sort, order)
            })
            .await
            .map_err(Self::transient)
    }

    pub async fn app_get(&self, app_id: i64) -> Result<AppDetail, MonitorError> {
        let detail = self
            .db
            .execute(move |conn| {
                let Some(application) = AppRepository::new(conn).get(app_id)? else {
                    return Ok(None);
                };
                let usage = AppRepository::new(conn)
                    .list_usage(
                        Tier::Raw,
                        0,
                        i64::MAX,
                        MAX_LIST_LIMIT,
                        SortKey::TotalBytes,
                        SortOrder::Desc,
                    )?
                    .into_iter()
                    .find(|u| u.app_id == app_id);
                Ok(usage.map(|usage| AppDetail { application, usage }))
            })
            .await
            .map_err(Self::transient)?;

        detail.ok_or(MonitorError::not_found("application", app_id))
    }

    /// Domains with usage over the window; `parent_only` restricts the
    /// list to registrable domains.
    pub async fn domains_list(
        &self,
        params: &ListParams,
        parent_only: bool,
        now: i64,
    ) -> Result<Vec<DomainUsage>, MonitorError> {
        let (limit, sort, order) = parse_list_params(params)?;
        let since = params.since.unwrap_or(0);
        let tier = self.tier_for_since(since, now);

        self.db
            .execute(move |conn| {
                DomainRepository::new(conn)
                    .list_usage(tier, since, now + 1, limit, parent_only, sort, order)
            })
            .await
            .map_err(Self::transient)
    }

    pub async fn domain_get(&self, domain_id: i64) -> Result<DomainDetail, MonitorError> {
        let detail = self
            .db
            .execute(move |conn| {
                let Some(domain) = DomainRepository::new(conn).get(domain_id)? else {
                    return Ok(None);
                };
                let usage = DomainRepository::new(conn)
                    .list_usage(
                        Tier::Raw,
                        0,
                        i64::MAX,
                        MAX_LIST_LIMIT,
                        false,
                        SortKey::TotalBytes,
                        SortOrder::Desc,
                    )?
                    .into_iter()
                    .find(|u| u.domain_id == domain_id);
                Ok(usage.map(|usage| DomainDetail { domain, usage }))
            })
            .await
            .map_err(Self::transient)?;

        detail.ok_or(MonitorError::not_found("domain", domain_id))
    }

    /// Top-N domains over a named period, ranked by visits.
    pub async fn domains_top(
        &self,
        n: u32,
        period: Period,
        now: i64,
    ) -> Result<Vec<DomainUsage>, MonitorError> {
        if n == 0 || n > MAX_LIST_LIMIT {
            return Err(MonitorError::validation(format!(
                "top-N limit must be in 1-{MAX_LIST_LIMIT}"
            )));
        }

        let since = now - period.secs();
        let tier = self.tier_for_since(since, now);

        let mut rows = self
            .db
            .execute(move |conn| {
                DomainRepository::new(conn).list_usage(
                    tier,
                    since,
                    now + 1,
                    n,
                    false,
                    SortKey::TotalBytes,
                    SortOrder::Desc,
                )
            })
            .await
            .map_err(Self::transient)?;
        rows.truncate(n as usize);
        Ok(rows)
    }

    fn tier_for_since(&self, since: i64, now: i64) -> Tier {
        let cfg = self.settings.snapshot();
        tier_for_window(
            now.saturating_sub(since),
            cfg.retention.raw_ttl_days,
            cfg.retention.hour_ttl_days,
        )
    }
}

fn parse_list_params(params: &ListParams) -> Result<(u32, SortKey, SortOrder), MonitorError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    if limit == 0 || limit > MAX_LIST_LIMIT {
        return Err(MonitorError::validation(format!(
            "limit must be in 1-{MAX_LIST_LIMIT}"
        )));
    }

    let sort = match &params.sort_by {
        None => SortKey::default(),
        Some(raw) => SortKey::parse(raw)
            .ok_or_else(|| MonitorError::validation(format!("unknown sort key {raw:?}")))?,
    };
    let order = match &params.order {
        None => SortOrder::default(),
        Some(raw) => SortOrder::parse(raw)
            .ok_or_else(|| MonitorError::validation(format!("unknown sort order {raw:?}")))?,
    };

    Ok((limit, sort, order))
}

/// Calendar week (Monday) and month (first day) starts containing `now`,
/// in UTC epoch seconds.
fn calendar_window_starts(now: i64) -> (i64, i64) {
    let dt = Utc
        .timestamp_opt(now, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().expect("epoch"));
    let date = dt.date_naive();

    let week_date = date - chrono::Days::new(u64::from(date.weekday().num_days_from_monday()));
    let month_date = date.with_day(1).unwrap_or(date);

    let to_epoch = |d: chrono::NaiveDate| {
        d.and_hms_opt(0, 0, 0)
            .map(|ndt| ndt.and_utc().timestamp())
            .unwrap_or(0)
    };
    (to_epoch(week_date), to_epoch(month_date))
}
