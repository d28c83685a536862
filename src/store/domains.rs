use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::apps::{SortKey, SortOrder, Tier};
use super::models::{Domain, DomainUsage};

pub struct DomainRepository<'a> {
    conn: &'a Connection,
}

impl<'a> DomainRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Interns a normalized fqdn, advancing `last_seen` on re-sighting.
    pub fn intern(&self, fqdn: &str, parent_domain: &str, now: i64) -> Result<i64> {
        let domain_id: i64 = self.conn.query_row(
            "INSERT INTO domains (fqdn, parent_domain, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT (fqdn) DO UPDATE SET
                 last_seen = MAX(domains.last_seen, excluded.last_seen)
             RETURNING domain_id",
            params![fqdn, parent_domain, now],
            |row| row.get(0),
        )?;
        Ok(domain_id)
    }

    pub fn get(&self, domain_id: i64) -> Result<Option<Domain>> {
        self.conn
            .query_row(
                "SELECT domain_id, fqdn, parent_domain, first_seen, last_seen
                 FROM domains WHERE domain_id = ?1",
                params![domain_id],
                domain_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Per-domain usage totals in `[since, until)` at the given tier.
    /// With `parent_only`, restricts to registrable domains
    /// (`fqdn == parent_domain`).
    pub fn list_usage(
        &self,
        tier: Tier,
        since: i64,
        until: i64,
        limit: u32,
        parent_only: bool,
        sort: SortKey,
        order: SortOrder,
    ) -> Result<Vec<DomainUsage>> {
        let (table, ts_col) = tier.browser_source();
        let parent_filter = if parent_only {
            "WHERE d.fqdn = d.parent_domain"
        } else {
            ""
        };
        let sql = format!(
            "SELECT
                 d.domain_id,
                 d.fqdn,
                 d.parent_domain,
                 COALESCE(SUM(s.bytes_out), 0) AS bytes_out,
                 COALESCE(SUM(s.bytes_in), 0) AS bytes_in,
                 COALESCE(SUM(s.bytes_out + s.bytes_in), 0) AS total_bytes,
                 COALESCE(COUNT(s.domain_id), 0) AS visits,
                 d.first_seen,
                 d.last_seen
             FROM domains d
             LEFT JOIN {table} s
                 ON s.domain_id = d.domain_id AND s.{ts_col} >= ?1 AND s.{ts_col} < ?2
             {parent_filter}
             GROUP BY d.domain_id
             ORDER BY {sort_col} {dir}, visits DESC, d.last_seen DESC
             LIMIT ?3",
            sort_col = sort_column(sort),
            dir = order_keyword(order),
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![since, until, limit], |row| {
                Ok(DomainUsage {
                    domain_id: row.get(0)?,
                    fqdn: row.get(1)?,
                    parent_domain: row.get(2)?,
                    bytes_out: row.get::<_, i64>(3)? as u64,
                    bytes_in: row.get::<_, i64>(4)? as u64,
                    total_bytes: row.get::<_, i64>(5)? as u64,
                    first_seen: row.get(7)?,
                    last_seen: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }

}

fn sort_column(sort: SortKey) -> &'static str {
    match sort {
        SortKey::TotalBytes => "total_bytes",
        SortKey::BytesIn => "bytes_in",
        SortKey::BytesOut => "bytes_out",
        SortKey::LastSeen => "d.last_seen",
        SortKey::FirstSeen => "d.first_seen",
    }
}

fn order_keyword(order: SortOrder) -> &'static str {
    match order {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    }
}

fn domain_from_row(row: &Row<'_>) -> rusqlite::Result<Domain> {
    Ok(Domain {
        domain_id: row.get(0)?,
        fqdn: row.get(1)?,
        parent_domain: row.get(2)?,
        first_seen: row.get(3)?,
        last_seen: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    #[tokio::test]
    async fn test_intern_advances_last_seen() {
        let db = Database::open_in_memory().expect("open");
        let (first, again, row) = db
            .execute(|conn| {
                let repo = DomainRepository::new(conn);
                let first = repo.intern("example.com", "example.com", 100)?;
                let again = repo.intern("example.com", "example.com", 250)?;
                let row = repo.get(first)?.expect("row");
                Ok((first, again, row))
            })
            .await
            .expect("db");

        assert_eq!(first, again);
        assert_eq!(row.first_seen, 100);
        assert_eq!(row.last_seen, 250);
    }

    #[tokio::test]
    async fn test_parent_only_filters_subdomains() {
        let db = Database::open_in_memory().expect("open");
        let rows = db
            .execute(|conn| {
                let repo = DomainRepository::new(conn);
                repo.intern("www.example.com", "example.com", 10)?;
                repo.intern("example.com", "example.com", 10)?;
                repo.intern("co.uk", "co.uk", 10)?;
                repo.list_usage(
                    Tier::Raw,
                    0,
                    100,
                    50,
                    true,
                    SortKey::TotalBytes,
                    SortOrder::Desc,
                )
            })
            .await
            .expect("db");

        let fqdns: Vec<_> = rows.iter().map(|d| d.fqdn.as_str()).collect();
        assert!(fqdns.contains(&"example.com"));
        assert!(fqdns.contains(&"co.uk"));
        assert!(!fqdns.contains(&"www.example.com"));
    }
}
