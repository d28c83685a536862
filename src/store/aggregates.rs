use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use super::models::{DailyAggregate, HourlyAggregate, RetentionLogEntry};

const HOUR: i64 = 3600;
const DAY: i64 = 86_400;

/// Rollup and retention SQL. Aggregation upserts replace whole rows so a
/// re-run is a no-op; retention only ever deletes whole buckets whose
/// counts match the next tier, so pruning can never trigger a lossy
/// re-aggregation of a partially deleted bucket.
pub struct AggregateRepository<'a> {
    conn: &'a Connection,
}

impl<'a> AggregateRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Hour buckets (start ≤ now) whose hourly rollups are missing or
    /// whose sample counts no longer match the raw tier. Covers both the
    /// per-app and the browser-domain pipelines.
    pub fn pending_hours(&self, now: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT src.hour FROM
                 (SELECT (ts - ts % 3600) AS hour, COUNT(*) AS n
                  FROM raw_samples
                  WHERE (ts - ts % 3600) <= ?1
                  GROUP BY 1) src
             LEFT JOIN
                 (SELECT hour_start, SUM(sample_count) AS n
                  FROM hourly_aggregates GROUP BY 1) agg
                 ON agg.hour_start = src.hour
             WHERE agg.n IS NULL OR agg.n != src.n
             UNION
             SELECT src.hour FROM
                 (SELECT (ts - ts % 3600) AS hour, COUNT(*) AS n
                  FROM browser_domain_samples
                  WHERE (ts - ts % 3600) <= ?1
                  GROUP BY 1) src
             LEFT JOIN
                 (SELECT hour_start, SUM(sample_count) AS n
                  FROM browser_domain_hourly GROUP BY 1) agg
                 ON agg.hour_start = src.hour
             WHERE agg.n IS NULL OR agg.n != src.n
             ORDER BY 1",
        )?;
        let hours = stmt
            .query_map(params![now], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(hours)
    }

    /// Day buckets (start ≤ now) whose daily rollups are missing or stale
    /// relative to the hourly tier.
    pub fn pending_days(&self, now: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT src.day FROM
                 (SELECT (hour_start - hour_start % 86400) AS day,
                         SUM(sample_count) AS n
                  FROM hourly_aggregates
                  WHERE (hour_start - hour_start % 86400) <= ?1
                  GROUP BY 1) src
             LEFT JOIN
                 (SELECT day_start, SUM(sample_count) AS n
                  FROM daily_aggregates GROUP BY 1) agg
                 ON agg.day_start = src.day
             WHERE agg.n IS NULL OR agg.n != src.n
             UNION
             SELECT src.day FROM
                 (SELECT (hour_start - hour_start % 86400) AS day,
                         SUM(sample_count) AS n
                  FROM browser_domain_hourly
                  WHERE (hour_start - hour_start % 86400) <= ?1
                  GROUP BY 1) src
             LEFT JOIN
                 (SELECT day_start, SUM(sample_count) AS n
                  FROM browser_domain_daily GROUP BY 1) agg
                 ON agg.day_start = src.day
             WHERE agg.n IS NULL OR agg.n != src.n
             ORDER BY 1",
        )?;
        let days = stmt
            .query_map(params![now], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(days)
    }

    /// Rolls one hour of raw samples into the hourly tables, replacing any
    /// previous rollup of the same hour. One transaction per bucket.
    pub fn aggregate_hour(conn: &mut Connection, hour_start: i64) -> Result<usize> {
        let hour_end = hour_start + HOUR;
        let tx = conn.transaction().context("opening hour rollup transaction")?;

        let apps = tx.execute(
            "INSERT INTO hourly_aggregates
             (hour_start, app_id, bytes_out, bytes_in, packets_out, packets_in,
              max_active_connections, sample_count)
             SELECT ?1, app_id, SUM(bytes_out), SUM(bytes_in), SUM(packets_out),
                    SUM(packets_in), MAX(active_connections), COUNT(*)
             FROM raw_samples
             WHERE ts >= ?1 AND ts < ?2
             GROUP BY app_id
             ON CONFLICT (hour_start, app_id) DO UPDATE SET
                 bytes_out = excluded.bytes_out,
                 bytes_in = excluded.bytes_in,
                 packets_out = excluded.packets_out,
                 packets_in = excluded.packets_in,
                 max_active_connections = excluded.max_active_connections,
                 sample_count = excluded.sample_count",
            params![hour_start, hour_end],
        )?;

        let browser = tx.execute(
            "INSERT INTO browser_domain_hourly
             (hour_start, domain_id, app_id, bytes_out, bytes_in, sample_count)
             SELECT ?1, domain_id, app_id, SUM(bytes_out), SUM(bytes_in), COUNT(*)
             FROM browser_domain_samples
             WHERE ts >= ?1 AND ts < ?2
             GROUP BY domain_id, app_id
             ON CONFLICT (hour_start, domain_id, app_id) DO UPDATE SET
                 bytes_out = excluded.bytes_out,
                 bytes_in = excluded.bytes_in,
                 sample_count = excluded.sample_count",
            params![hour_start, hour_end],
        )?;

        tx.commit().context("committing hour rollup")?;
        Ok(apps + browser)
    }

    /// Rolls one day of hourly aggregates into the daily tables.
    pub fn aggregate_day(conn: &mut Connection, day_start: i64) -> Result<usize> {
        let day_end = day_start + DAY;
        let tx = conn.transaction().context("opening day rollup transaction")?;

        let apps = tx.execute(
            "INSERT INTO daily_aggregates
             (day_start, app_id, bytes_out, bytes_in, packets_out, packets_in,
              max_active_connections, sample_count)
             SELECT ?1, app_id, SUM(bytes_out), SUM(bytes_in), SUM(packets_out),
                    SUM(packets_in), MAX(max_active_connections), SUM(sample_count)
             FROM hourly_aggregates
             WHERE hour_start >= ?1 AND hour_start < ?2
             GROUP BY app_id
             ON CONFLICT (day_start, app_id) DO UPDATE SET
                 bytes_out = excluded.bytes_out,
                 bytes_in = excluded.bytes_in,
                 packets_out = excluded.packets_out,
                 packets_in = excluded.packets_in,
                 max_active_connections = excluded.max_active_connections,
                 sample_count = excluded.sample_count",
            params![day_start, day_end],
        )?;

        let browser = tx.execute(
            "INSERT INTO browser_domain_daily
             (day_start, domain_id, app_id, bytes_out, bytes_in, sample_count)
             SELECT ?1, domain_id, app_id, SUM(bytes_out), SUM(bytes_in),
                    SUM(sample_count)
             FROM browser_domain_hourly
             WHERE hour_start >= ?1 AND hour_start < ?2
             GROUP BY domain_id, app_id
             ON CONFLICT (day_start, domain_id, app_id) DO UPDATE SET
                 bytes_out = excluded.bytes_out,
                 bytes_in = excluded.bytes_in,
                 sample_count = excluded.sample_count",
            params![day_start, day_end],
        )?;

        tx.commit().context("committing day rollup")?;
        Ok(apps + browser)
    }

    /// Deletes raw samples in hours that ended before `cutoff` AND whose
    /// hourly rollup counts match. Returns `(deleted, deferred)` where
    /// `deferred` counts stale rows kept back because their hour is not
    /// safely aggregated yet.
    pub fn prune_raw(&self, cutoff: i64) -> Result<(usize, usize)> {
        let deleted_app = self.conn.execute(
            "DELETE FROM raw_samples WHERE (ts - ts % 3600) IN (
                 SELECT s.hour FROM
                     (SELECT (ts - ts % 3600) AS hour, COUNT(*) AS n
                      FROM raw_samples
                      WHERE (ts - ts % 3600) + 3600 <= ?1
                      GROUP BY 1) s
                 JOIN
                     (SELECT hour_start, SUM(sample_count) AS n
                      FROM hourly_aggregates GROUP BY 1) h
                     ON h.hour_start = s.hour AND h.n = s.n)",
            params![cutoff],
        )?;

        let deleted_browser = self.conn.execute(
            "DELETE FROM browser_domain_samples WHERE (ts - ts % 3600) IN (
                 SELECT s.hour FROM
                     (SELECT (ts - ts % 3600) AS hour, COUNT(*) AS n
                      FROM browser_domain_samples
                      WHERE (ts - ts % 3600) + 3600 <= ?1
                      GROUP BY 1) s
                 JOIN
                     (SELECT hour_start, SUM(sample_count) AS n
                      FROM browser_domain_hourly GROUP BY 1) h
                     ON h.hour_start = s.hour AND h.n = s.n)",
            params![cutoff],
        )?;

        let deferred: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM raw_samples WHERE (ts - ts % 3600) + 3600 <= ?1",
            params![cutoff],
            |row| row.get(0),
        )?;
        let deferred_browser: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM browser_domain_samples
             WHERE (ts - ts % 3600) + 3600 <= ?1",
            params![cutoff],
            |row| row.get(0),
        )?;

        Ok((
            deleted_app + deleted_browser,
            (deferred + deferred_browser) as usize,
        ))
    }

    /// Deletes hourly aggregates in days that ended before `cutoff` AND
    /// whose daily rollup counts match. Daily rows are never deleted.
    pub fn prune_hourly(&self, cutoff: i64) -> Result<(usize, usize)> {
        let deleted_app = self.conn.execute(
            "DELETE FROM hourly_aggregates WHERE (hour_start - hour_start % 86400) IN (
                 SELECT s.day FROM
                     (SELECT (hour_start - hour_start % 86400) AS day,
                             SUM(sample_count) AS n
                      FROM hourly_aggregates
                      WHERE (hour_start - hour_start % 86400) + 86400 <= ?1
                      GROUP BY 1) s
                 JOIN
                     (SELECT day_start, SUM(sample_count) AS n
                      FROM daily_aggregates GROUP BY 1) d
                     ON d.day_start = s.day AND d.n = s.n)",
            params![cutoff],
        )?;

        let deleted_browser = self.conn.execute(
            "DELETE FROM browser_domain_hourly
             WHERE (hour_start - hour_start % 86400) IN (
                 SELECT s.day FROM
                     (SELECT (hour_start - hour_start % 86400) AS day,
                             SUM(sample_count) AS n
                      FROM browser_domain_hourly
                      WHERE (hour_start - hour_start % 86400) + 86400 <= ?1
                      GROUP BY 1) s
                 JOIN
                     (SELECT day_start, SUM(sample_count) AS n
                      FROM browser_domain_daily GROUP BY 1) d
                     ON d.day_start = s.day AND d.n = s.n)",
            params![cutoff],
        )?;

        let deferred: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM hourly_aggregates
             WHERE (hour_start - hour_start % 86400) + 86400 <= ?1",
            params![cutoff],
            |row| row.get(0),
        )?;

        Ok((deleted_app + deleted_browser, deferred as usize))
    }

    /// Appends one audit entry.
    pub fn log(
        &self,
        operation: &str,
        now: i64,
        records_affected: i64,
        details: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO retention_log (operation, ts, records_affected, details)
             VALUES (?1, ?2, ?3, ?4)",
            params![operation, now, records_affected, details],
        )?;
        Ok(())
    }

    pub fn retention_log(&self) -> Result<Vec<RetentionLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT log_id, operation, ts, records_affected, details
             FROM retention_log ORDER BY log_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RetentionLogEntry {
                    log_id: row.get(0)?,
                    operation: row.get(1)?,
                    ts: row.get(2)?,
                    records_affected: row.get(3)?,
                    details: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn hourly_rows(&self) -> Result<Vec<HourlyAggregate>> {
        let mut stmt = self.conn.prepare(
            "SELECT hour_start, app_id, bytes_out, bytes_in, packets_out,
                    packets_in, max_active_connections, sample_count
             FROM hourly_aggregates ORDER BY hour_start, app_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(HourlyAggregate {
                    hour_start: row.get(0)?,
                    app_id: row.get(1)?,
                    bytes_out: row.get::<_, i64>(2)? as u64,
                    bytes_in: row.get::<_, i64>(3)? as u64,
                    packets_out: row.get::<_, i64>(4)? as u64,
                    packets_in: row.get::<_, i64>(5)? as u64,
                    max_active_connections: row.get(6)?,
                    sample_count: row.get::<_, i64>(7)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn daily_rows(&self) -> Result<Vec<DailyAggregate>> {
        let mut stmt = self.conn.prepare(
            "SELECT day_start, app_id, bytes_out, bytes_in, packets_out,
                    packets_in, max_active_connections, sample_count
             FROM daily_aggregates ORDER BY day_start, app_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(DailyAggregate {
                    day_start: row.get(0)?,
                    app_id: row.get(1)?,
                    bytes_out: row.get::<_, i64>(2)? as u64,
                    bytes_in: row.get::<_, i64>(3)? as u64,
                    packets_out: row.get::<_, i64>(4)? as u64,
                    packets_in: row.get::<_, i64>(5)? as u64,
                    max_active_connections: row.get(6)?,
                    sample_count: row.get::<_, i64>(7)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn raw_count(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM raw_samples", [], |row| row.get(0))
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::apps::AppRepository;
    use crate::store::models::RawSample;
    use crate::store::samples::SampleRepository;
    use crate::store::Database;

    fn sample(ts: i64, app_id: i64, out: u64) -> RawSample {
        RawSample {
            ts,
            app_id,
            bytes_out: out,
            bytes_in: 0,
            packets_out: 0,
            packets_in: 0,
            active_connections: 1,
        }
    }

    #[tokio::test]
    async fn test_pending_hours_detects_missing_and_stale() {
        let db = Database::open_in_memory().expect("open");
        let (before, after_one, after_more) = db
            .execute(|conn| {
                let app = AppRepository::new(conn).intern("a", None, 0)?;
                SampleRepository::insert_raw_batch(
                    conn,
                    &[sample(100, app, 10), sample(3_700, app, 20)],
                )?;

                let before = AggregateRepository::new(conn).pending_hours(10_000)?;
                AggregateRepository::aggregate_hour(conn, 0)?;
                AggregateRepository::aggregate_hour(conn, 3_600)?;
                let after_one = AggregateRepository::new(conn).pending_hours(10_000)?;

                // A late row makes hour 0 stale again.
                SampleRepository::insert_raw_batch(conn, &[sample(200, app, 5)])?;
                let after_more = AggregateRepository::new(conn).pending_hours(10_000)?;
                Ok((before, after_one, after_more))
            })
            .await
            .expect("db");

        assert_eq!(before, vec![0, 3_600]);
        assert!(after_one.is_empty());
        assert_eq!(after_more, vec![0]);
    }

    #[tokio::test]
    async fn test_aggregate_hour_replaces_not_adds() {
        let db = Database::open_in_memory().expect("open");
        let rows = db
            .execute(|conn| {
                let app = AppRepository::new(conn).intern("a", None, 0)?;
                SampleRepository::insert_raw_batch(
                    conn,
                    &[sample(10, app, 100), sample(20, app, 50)],
                )?;
                AggregateRepository::aggregate_hour(conn, 0)?;
                AggregateRepository::aggregate_hour(conn, 0)?;
                AggregateRepository::new(conn).hourly_rows()
            })
            .await
            .expect("db");

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].bytes_out, 150);
        assert_eq!(rows[0].sample_count, 2);
    }

    #[tokio::test]
    async fn test_prune_raw_defers_unaggregated_hours() {
        let db = Database::open_in_memory().expect("open");
        let ((deleted, deferred), count) = db
            .execute(|conn| {
                let app = AppRepository::new(conn).intern("a", None, 0)?;
                SampleRepository::insert_raw_batch(conn, &[sample(10, app, 1)])?;
                let repo = AggregateRepository::new(conn);
                let result = repo.prune_raw(1_000_000)?;
                let count = repo.raw_count()?;
                Ok((result, count))
            })
            .await
            .expect("db");

        assert_eq!(deleted, 0);
        assert_eq!(deferred, 1);
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_prune_raw_deletes_whole_aggregated_hours_only() {
        let db = Database::open_in_memory().expect("open");
        let (result, remaining) = db
            .execute(|conn| {
                let app = AppRepository::new(conn).intern("a", None, 0)?;
                // One stale hour, one current hour.
                SampleRepository::insert_raw_batch(
                    conn,
                    &[sample(10, app, 1), sample(7_300, app, 2)],
                )?;
                AggregateRepository::aggregate_hour(conn, 0)?;
                AggregateRepository::aggregate_hour(conn, 7_200)?;

                // Cutoff inside hour 2: only hour 0 is wholly stale.
                let repo = AggregateRepository::new(conn);
                let result = repo.prune_raw(7_500)?;
                let remaining = repo.raw_count()?;
                Ok((result, remaining))
            })
            .await
            .expect("db");

        assert_eq!(result.0, 1);
        assert_eq!(result.1, 0);
        assert_eq!(remaining, 1);
    }
}
