use anyhow::{bail, Context, Result};
use rusqlite::{Connection, Transaction};

/// Schema version the code expects. Gated on `PRAGMA user_version`.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Runs any pending migrations inside a single transaction.
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let mut version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("reading user_version pragma")?;

    if version > CURRENT_SCHEMA_VERSION {
        bail!(
            "database version ({version}) is newer than supported schema ({CURRENT_SCHEMA_VERSION})"
        );
    }

    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    tracing::info!(from = version, to = CURRENT_SCHEMA_VERSION, "running store migrations");

    let tx = conn
        .transaction()
        .context("opening migration transaction")?;

    while version < CURRENT_SCHEMA_VERSION {
        let next_version = version + 1;
        apply_migration(&tx, next_version)
            .with_context(|| format!("migration to version {next_version} failed"))?;
        version = next_version;
    }

    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)
        .context("updating user_version pragma")?;
    tx.commit().context("committing migrations")?;

    Ok(())
}

fn apply_migration(tx: &Transaction<'_>, version: i32) -> Result<()> {
    match version {
        1 => tx
            .execute_batch(include_str!("sql/schema_v1.sql"))
            .context("executing schema_v1.sql"),
        _ => bail!("unknown migration target version: {version}"),
    }
}
