use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use super::apps::Tier;
use super::models::{BrowserDomainSample, RawSample};

pub struct SampleRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SampleRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Writes one sampler tick's delta rows in a single transaction.
    /// A duplicate `(ts, app_id)` is ignored: at most one row per pair.
    pub fn insert_raw_batch(conn: &mut Connection, samples: &[RawSample]) -> Result<usize> {
        if samples.is_empty() {
            return Ok(0);
        }

        let tx = conn.transaction().context("opening sample transaction")?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO raw_samples
                 (ts, app_id, bytes_out, bytes_in, packets_out, packets_in, active_connections)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for sample in samples {
                inserted += stmt.execute(params![
                    sample.ts,
                    sample.app_id,
                    sample.bytes_out as i64,
                    sample.bytes_in as i64,
                    sample.packets_out as i64,
                    sample.packets_in as i64,
                    sample.active_connections,
                ])?;
            }
        }
        tx.commit().context("committing sample transaction")?;

        Ok(inserted)
    }

    /// Records one active-tab observation. Identical posts within the same
    /// second coalesce. Returns whether a new row was written.
    pub fn insert_browser_sample(&self, sample: &BrowserDomainSample) -> Result<bool> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO browser_domain_samples
             (ts, domain_id, app_id, bytes_out, bytes_in)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                sample.ts,
                sample.domain_id,
                sample.app_id,
                sample.bytes_out as i64,
                sample.bytes_in as i64,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Raw ticks in `[since, until)` summed across apps, ordered by time.
    /// Feeds the bandwidth calculation, which only ever uses the last two.
    pub fn tick_totals(&self, since: i64, until: i64) -> Result<Vec<(i64, u64, u64)>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT ts, SUM(bytes_out), SUM(bytes_in)
             FROM raw_samples
             WHERE ts >= ?1 AND ts < ?2
             GROUP BY ts
             ORDER BY ts",
        )?;
        let rows = stmt
            .query_map(params![since, until], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, i64>(2)? as u64,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Per-row (ts, bytes_out, bytes_in) triples in `[since, until)` from
    /// the given tier, optionally restricted to one application. The query
    /// layer buckets these into a fixed-width timeline.
    pub fn timeline_rows(
        &self,
        tier: Tier,
        since: i64,
        until: i64,
        app_id: Option<i64>,
    ) -> Result<Vec<(i64, u64, u64)>> {
        let (table, ts_col) = match tier {
            Tier::Raw => ("raw_samples", "ts"),
            Tier::Hourly => ("hourly_aggregates", "hour_start"),
            Tier::Daily => ("daily_aggregates", "day_start"),
        };
        let app_filter = if app_id.is_some() {
            "AND app_id = ?3"
        } else {
            ""
        };
        let sql = format!(
            "SELECT {ts_col}, SUM(bytes_out), SUM(bytes_in)
             FROM {table}
             WHERE {ts_col} >= ?1 AND {ts_col} < ?2 {app_filter}
             GROUP BY {ts_col}
             ORDER BY {ts_col}"
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)? as u64,
                row.get::<_, i64>(2)? as u64,
            ))
        };
        let rows = match app_id {
            Some(id) => stmt
                .query_map(params![since, until, id], map_row)?
                .collect::<Result<Vec<_>, _>>()?,
            None => stmt
                .query_map(params![since, until], map_row)?
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(rows)
    }

    /// Total (bytes_out, bytes_in) over `[since, until)` at the given tier.
    pub fn sum_window(&self, tier: Tier, since: i64, until: i64) -> Result<(u64, u64)> {
        let (table, ts_col) = match tier {
            Tier::Raw => ("raw_samples", "ts"),
            Tier::Hourly => ("hourly_aggregates", "hour_start"),
            Tier::Daily => ("daily_aggregates", "day_start"),
        };
        let sql = format!(
            "SELECT COALESCE(SUM(bytes_out), 0), COALESCE(SUM(bytes_in), 0)
             FROM {table}
             WHERE {ts_col} >= ?1 AND {ts_col} < ?2"
        );
        let totals = self.conn.query_row(&sql, params![since, until], |row| {
            Ok((
                row.get::<_, i64>(0)? as u64,
                row.get::<_, i64>(1)? as u64,
            ))
        })?;
        Ok(totals)
    }

    /// Process name of the top application by total bytes in the window.
    pub fn top_app(&self, tier: Tier, since: i64, until: i64) -> Result<Option<String>> {
        let (table, ts_col) = match tier {
            Tier::Raw => ("raw_samples", "ts"),
            Tier::Hourly => ("hourly_aggregates", "hour_start"),
            Tier::Daily => ("daily_aggregates", "day_start"),
        };
        let sql = format!(
            "SELECT a.process_name
             FROM applications a
             JOIN {table} s ON s.app_id = a.app_id
             WHERE s.{ts_col} >= ?1 AND s.{ts_col} < ?2
             GROUP BY a.app_id
             ORDER BY SUM(s.bytes_out + s.bytes_in) DESC
             LIMIT 1"
        );
        self.conn
            .query_row(&sql, params![since, until], |row| row.get(0))
            .optional()
            .map_err(Into::into)
    }

    /// Most-visited domain in the window (browser samples carry no bytes,
    /// so visit count is the ranking).
    pub fn top_domain(&self, tier: Tier, since: i64, until: i64) -> Result<Option<String>> {
        let (table, ts_col) = tier.browser_source();
        let sql = format!(
            "SELECT d.fqdn
             FROM domains d
             JOIN {table} s ON s.domain_id = d.domain_id
             WHERE s.{ts_col} >= ?1 AND s.{ts_col} < ?2
             GROUP BY d.domain_id
             ORDER BY COUNT(*) DESC, SUM(s.bytes_out + s.bytes_in) DESC
             LIMIT 1"
        );
        self.conn
            .query_row(&sql, params![since, until], |row| row.get(0))
            .optional()
            .map_err(Into::into)
    }
}
