use anyhow::{bail, Context, Result};
use rusqlite::Connection;

const CURRENT_SCHEMA_VERSION: i32 = 1;

pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let mut version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("could not read the store schema version")?;

    if version > CURRENT_SCHEMA_VERSION {
        bail!(
            "store schema version ({}) is newer than this build supports ({})",
            version,
            CURRENT_SCHEMA_VERSION
        );
    }

    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .context("failed to begin schema migration transaction")?;

    while version < CURRENT_SCHEMA_VERSION {
        version += 1;
        tx.execute_batch(schema_sql(version)?)
            .with_context(|| format!("failed to apply store schema v{version}"))?;
    }

    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)
        .context("failed to record the new store schema version")?;
    tx.commit().context("failed to commit schema migrations")?;

    Ok(())
}

fn schema_sql(version: i32) -> Result<&'static str> {
    match version {
        1 => Ok(include_str!("schemas/schema_v1.sql")),
        _ => bail!("no schema file for store version {version}"),
    }
}
