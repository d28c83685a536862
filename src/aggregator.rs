//! Raw → hourly → daily rollups.

use anyhow::Result;

use crate::store::aggregates::AggregateRepository;
use crate::store::Database;

/// What one aggregation pass touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregationOutcome {
    pub hour_buckets: usize,
    pub day_buckets: usize,
    pub records_affected: usize,
}

/// Rolls finalized-or-stale buckets up one tier at a time. Upserts
/// replace whole rows, so running a pass twice with no intervening
/// writes changes nothing and logs nothing.
pub struct Aggregator {
    db: Database,
}

impl Aggregator {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// One full pass: hours first, then days built from the fresh hourly
    /// rows. Each bucket commits in its own transaction.
    pub async fn run(&self, now: i64) -> Result<AggregationOutcome> {
        let outcome = self
            .db
            .execute(move |conn| {
                let hours = AggregateRepository::new(conn).pending_hours(now)?;
                let mut hour_records = 0usize;
                for hour_start in &hours {
                    hour_records += AggregateRepository::aggregate_hour(conn, *hour_start)?;
                }
                if !hours.is_empty() {
                    AggregateRepository::new(conn).log(
                        "aggregate-hour",
                        now,
                        hour_records as i64,
                        Some(&format!("buckets={}", hours.len())),
                    )?;
                }

                let days = AggregateRepository::new(conn).pending_days(now)?;
                let mut day_records = 0usize;
                for day_start in &days {
                    day_records += AggregateRepository::aggregate_day(conn, *day_start)?;
                }
                if !days.is_empty() {
                    AggregateRepository::new(conn).log(
                        "aggregate-day",
                        now,
                        day_records as i64,
                        Some(&format!("buckets={}", days.len())),
                    )?;
                }

                Ok(AggregationOutcome {
                    hour_buckets: hours.len(),
                    day_buckets: days.len(),
                    records_affected: hour_records + day_records,
                })
            })
            .await?;

        if outcome.hour_buckets > 0 || outcome.day_buckets > 0 {
            tracing::info!(
                hour_buckets = outcome.hour_buckets,
                day_buckets = outcome.day_buckets,
                records = outcome.records_affected,
                "aggregation pass complete",
            );
        } else {
            tracing::debug!("aggregation pass found nothing pending");
        }

        Ok(outcome)
    }
}
