use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::models::{Application, AppUsage};

/// Data tier an application usage query reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Raw,
    Hourly,
    Daily,
}

impl Tier {
    /// Sample table and its timestamp column for this tier.
    fn app_source(self) -> (&'static str, &'static str) {
        match self {
            Tier::Raw => ("raw_samples", "ts"),
            Tier::Hourly => ("hourly_aggregates", "hour_start"),
            Tier::Daily => ("daily_aggregates", "day_start"),
        }
    }

    /// Browser-domain table and its timestamp column for this tier.
    pub(crate) fn browser_source(self) -> (&'static str, &'static str) {
        match self {
            Tier::Raw => ("browser_domain_samples", "ts"),
            Tier::Hourly => ("browser_domain_hourly", "hour_start"),
            Tier::Daily => ("browser_domain_daily", "day_start"),
        }
    }
}

/// Closed set of sort keys accepted by list endpoints. Anything else is a
/// validation error well before SQL is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    TotalBytes,
    BytesIn,
    BytesOut,
    LastSeen,
    FirstSeen,
}

impl SortKey {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "totalBytes" => Some(Self::TotalBytes),
            "bytesIn" => Some(Self::BytesIn),
            "bytesOut" => Some(Self::BytesOut),
            "lastSeen" => Some(Self::LastSeen),
            "firstSeen" => Some(Self::FirstSeen),
            _ => None,
        }
    }

    fn column(self) -> &'static str {
        match self {
            Self::TotalBytes => "total_bytes",
            Self::BytesIn => "bytes_in",
            Self::BytesOut => "bytes_out",
            Self::LastSeen => "last_seen",
            Self::FirstSeen => "first_seen",
        }
    }
}

/// Sort direction, equally closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "asc" => Some(Self::Asc),
            "desc" => Some(Self::Desc),
            _ => None,
        }
    }

    fn keyword(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

pub struct AppRepository<'a> {
    conn: &'a Connection,
}

impl<'a> AppRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Returns the stable id for `(process_name, bundle_id)`, inserting a
    /// fresh row on first sighting. A NULL bundle id is matched with `IS`,
    /// so the identity stays unique despite SQLite treating NULLs as
    /// distinct in the UNIQUE index.
    pub fn intern(&self, process_name: &str, bundle_id: Option<&str>, now: i64) -> Result<i64> {
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT app_id FROM applications
                 WHERE process_name = ?1 AND bundle_id IS ?2",
                params![process_name, bundle_id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(app_id) = existing {
            return Ok(app_id);
        }

        self.conn.execute(
            "INSERT INTO applications (process_name, bundle_id, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?3)",
            params![process_name, bundle_id, now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Advances `last_seen` for a batch of apps. `last_seen` never moves
    /// backwards.
    pub fn touch_last_seen(&self, app_ids: &[i64], now: i64) -> Result<()> {
        if app_ids.is_empty() {
            return Ok(());
        }

        let placeholders = app_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "UPDATE applications SET last_seen = MAX(last_seen, ?)
             WHERE app_id IN ({placeholders})"
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let mut values: Vec<&dyn rusqlite::ToSql> = vec![&now];
        for id in app_ids {
            values.push(id);
        }
        stmt.execute(values.as_slice())?;
        Ok(())
    }

    pub fn get(&self, app_id: i64) -> Result<Option<Application>> {
        self.conn
            .query_row(
                "SELECT app_id, process_name, bundle_id, first_seen, last_seen
                 FROM applications WHERE app_id = ?1",
                params![app_id],
                application_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Per-application usage totals in `[since, until)` at the given tier,
    /// sorted by a closed sort key. Apps with no traffic in the window
    /// appear with zero totals.
    pub fn list_usage(
        &self,
        tier: Tier,
        since: i64,
        until: i64,
        limit: u32,
        sort: SortKey,
        order: SortOrder,
    ) -> Result<Vec<AppUsage>> {
        let (table, ts_col) = tier.app_source();
        let sql = format!(
            "SELECT
                 a.app_id,
                 a.process_name,
                 a.bundle_id,
                 COALESCE(SUM(s.bytes_out), 0) AS bytes_out,
                 COALESCE(SUM(s.bytes_in), 0) AS bytes_in,
                 COALESCE(SUM(s.bytes_out + s.bytes_in), 0) AS total_bytes,
                 a.first_seen,
                 a.last_seen
             FROM applications a
             LEFT JOIN {table} s
                 ON s.app_id = a.app_id AND s.{ts_col} >= ?1 AND s.{ts_col} < ?2
             GROUP BY a.app_id
             ORDER BY {sort_col} {dir}
             LIMIT ?3",
            sort_col = sort.column(),
            dir = order.keyword(),
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![since, until, limit], |row| {
                Ok(AppUsage {
                    app_id: row.get(0)?,
                    process_name: row.get(1)?,
                    bundle_id: row.get(2)?,
                    bytes_out: row.get::<_, i64>(3)? as u64,
                    bytes_in: row.get::<_, i64>(4)? as u64,
                    total_bytes: row.get::<_, i64>(5)? as u64,
                    first_seen: row.get(6)?,
                    last_seen: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }
}

fn application_from_row(row: &Row<'_>) -> rusqlite::Result<Application> {
    Ok(Application {
        app_id: row.get(0)?,
        process_name: row.get(1)?,
        bundle_id: row.get(2)?,
        first_seen: row.get(3)?,
        last_seen: row.get(4)?,
    })
}
