//! Tiered retention. Always runs after aggregation within a scheduler
//! tick; never deletes data the next tier has not absorbed.

use anyhow::Result;

use crate::store::aggregates::AggregateRepository;
use crate::store::Database;

const DAY_SECS: i64 = 86_400;

/// Effective TTLs for one retention pass. Re-read from config each tick
/// so `config.reload` takes effect without a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub raw_ttl_days: u32,
    pub hour_ttl_days: u32,
}

/// What one retention pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionOutcome {
    pub raw_deleted: usize,
    pub raw_deferred: usize,
    pub hourly_deleted: usize,
    pub hourly_deferred: usize,
}

pub struct Retention {
    db: Database,
}

impl Retention {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// One pruning pass. Deletes are guarded per bucket: a raw hour goes
    /// away only once its hourly rollup matches, an hourly day only once
    /// its daily rollup matches. Daily aggregates are never touched.
    /// Idempotent: a second pass with no intervening writes deletes zero
    /// rows.
    pub async fn run(&self, policy: RetentionPolicy, now: i64) -> Result<RetentionOutcome> {
        let raw_cutoff = now - i64::from(policy.raw_ttl_days) * DAY_SECS;
        let hour_cutoff = now - i64::from(policy.hour_ttl_days) * DAY_SECS;

        let outcome = self
            .db
            .execute(move |conn| {
                let repo = AggregateRepository::new(conn);

                let (raw_deleted, raw_deferred) = repo.prune_raw(raw_cutoff)?;
                if raw_deleted > 0 {
                    repo.log(
                        "cleanup-raw",
                        now,
                        raw_deleted as i64,
                        Some(&format!("cutoff={raw_cutoff}")),
                    )?;
                }

                let (hourly_deleted, hourly_deferred) = repo.prune_hourly(hour_cutoff)?;
                if hourly_deleted > 0 {
                    repo.log(
                        "cleanup-hourly",
                        now,
                        hourly_deleted as i64,
                        Some(&format!("cutoff={hour_cutoff}")),
                    )?;
                }

                Ok(RetentionOutcome {
                    raw_deleted,
                    raw_deferred,
                    hourly_deleted,
                    hourly_deferred,
                })
            })
            .await?;

        if outcome.raw_deferred > 0 {
            tracing::warn!(
                deferred = outcome.raw_deferred,
                "stale raw samples kept back: their hours are not aggregated yet",
            );
        }
        if outcome.hourly_deferred > 0 {
            tracing::warn!(
                deferred = outcome.hourly_deferred,
                "stale hourly aggregates kept back: their days are not aggregated yet",
            );
        }
        if outcome.raw_deleted > 0 || outcome.hourly_deleted > 0 {
            tracing::info!(
                raw_deleted = outcome.raw_deleted,
                hourly_deleted = outcome.hourly_deleted,
                "retention pass complete",
            );
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::Aggregator;
    use crate::store::apps::AppRepository;
    use crate::store::models::RawSample;
    use crate::store::samples::SampleRepository;

    fn sample(ts: i64, app_id: i64, out: u64) -> RawSample {
        RawSample {
            ts,
            app_id,
            bytes_out: out,
            bytes_in: 0,
            packets_out: 0,
            packets_in: 0,
            active_connections: 0,
        }
    }

    async fn seed(db: &Database, rows: Vec<RawSample>) {
        db.execute(move |conn| {
            let app = AppRepository::new(conn).intern("a", None, 0)?;
            let rows: Vec<RawSample> = rows
                .into_iter()
                .map(|mut s| {
                    s.app_id = app;
                    s
                })
                .collect();
            SampleRepository::insert_raw_batch(conn, &rows)
        })
        .await
        .expect("seed");
    }

    #[tokio::test]
    async fn test_retention_defers_until_aggregated() {
        let db = Database::open_in_memory().expect("open");
        seed(&db, vec![sample(100, 0, 10), sample(4_000, 0, 20)]).await;

        let retention = Retention::new(db.clone());
        let policy = RetentionPolicy {
            raw_ttl_days: 1,
            hour_ttl_days: 90,
        };
        // Everything is stale at this "now", but nothing is aggregated.
        let now = 90 * 86_400;
        let first = retention.run(policy, now).await.expect("run");
        assert_eq!(first.raw_deleted, 0);
        assert_eq!(first.raw_deferred, 2);

        Aggregator::new(db.clone()).run(now).await.expect("aggregate");

        let second = retention.run(policy, now).await.expect("run");
        assert_eq!(second.raw_deleted, 2);
        assert_eq!(second.raw_deferred, 0);

        // Idempotence: one more pass deletes nothing.
        let third = retention.run(policy, now).await.expect("run");
        assert_eq!(third, RetentionOutcome::default());
    }

    #[tokio::test]
    async fn test_retention_never_deletes_daily() {
        let db = Database::open_in_memory().expect("open");
        seed(&db, vec![sample(100, 0, 10)]).await;

        let now = 400 * 86_400;
        Aggregator::new(db.clone()).run(now).await.expect("aggregate");
        let policy = RetentionPolicy {
            raw_ttl_days: 1,
            hour_ttl_days: 1,
        };
        Retention::new(db.clone()).run(policy, now).await.expect("run");

        let (hourly, daily) = db
            .execute(|conn| {
                let repo = AggregateRepository::new(conn);
                Ok((repo.hourly_rows()?, repo.daily_rows()?))
            })
            .await
            .expect("rows");
        assert!(hourly.is_empty(), "hourly past TTL should be pruned");
        assert_eq!(daily.len(), 1, "daily rows are retained indefinitely");
    }
}
