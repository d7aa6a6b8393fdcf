//! Versioned schema migrations.
//!
//! Migrations are embedded into the binary and applied in order. Every applied migration is
//! recorded in `schema_migrations`, so running [`migrate`] repeatedly only applies what is
//! missing.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashSet;

/// A single schema migration.
#[derive(Debug)]
pub struct Migration {
    pub version: &'static str,
    pub description: &'static str,
    sql: &'static str,
}

/// All known migrations, oldest first.
pub static MIGRATIONS: &[Migration] = &[
    Migration {
        version: "0.1.0",
        description: "Create base schema",
        sql: include_str!("../migrations/0.1.0_base_schema.sql"),
    },
    Migration {
        version: "1.0.0",
        description: "Add Google Calendar support",
        sql: include_str!("../migrations/1.0.0_google_calendar_support.sql"),
    },
    Migration {
        version: "1.0.1",
        description: "Add calendar type indexes",
        sql: include_str!("../migrations/1.0.1_calendar_type_indexes.sql"),
    },
];

/// A row of `schema_migrations`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AppliedMigration {
    pub version: String,
    pub description: String,
    pub executed_at: DateTime<Utc>,
}

async fn ensure_migrations_table(pool: &SqlitePool) -> Result<()> {
    const SQL: &str = "\
CREATE TABLE IF NOT EXISTS schema_migrations (
    version      TEXT PRIMARY KEY,
    description  TEXT NOT NULL,
    executed_at  TEXT NOT NULL
);
";

    sqlx::query(SQL).execute(pool).await?;
    Ok(())
}

/// Returns the migrations recorded as applied, in the order they were applied.
pub async fn applied(pool: &SqlitePool) -> Result<Vec<AppliedMigration>> {
    const SQL: &str = "\
SELECT version, description, executed_at
FROM schema_migrations
ORDER BY executed_at ASC, version ASC;
";

    ensure_migrations_table(pool).await?;

    let migrations = sqlx::query_as(SQL).fetch_all(pool).await?;
    Ok(migrations)
}

/// Returns the migrations not applied yet, oldest first.
pub async fn pending(pool: &SqlitePool) -> Result<Vec<&'static Migration>> {
    let applied: HashSet<String> = applied(pool)
        .await?
        .into_iter()
        .map(|migration| migration.version)
        .collect();

    Ok(MIGRATIONS
        .iter()
        .filter(|migration| !applied.contains(migration.version))
        .collect())
}

/// Returns the version of the newest applied migration, if any.
pub async fn current_version(pool: &SqlitePool) -> Result<Option<&'static str>> {
    let pending = pending(pool).await?;

    Ok(MIGRATIONS
        .iter()
        .rev()
        .find(|migration| !pending.iter().any(|p| p.version == migration.version))
        .map(|migration| migration.version))
}

/// Applies all pending migrations and returns the ones applied by this call.
///
/// Each migration runs in its own transaction together with its `schema_migrations` row. A
/// failing migration is rolled back and stops the run.
pub async fn migrate(pool: &SqlitePool) -> Result<Vec<&'static Migration>> {
    let pending = pending(pool).await?;

    if pending.is_empty() {
        log::debug!("database schema is up to date");
        return Ok(pending);
    }

    for migration in &pending {
        log::info!(
            "running migration {}: {}",
            migration.version,
            migration.description
        );

        apply(pool, migration)
            .await
            .map_err(|source| Error::Migration {
                version: migration.version,
                source,
            })?;
    }

    log::info!("applied {} migration(s)", pending.len());

    Ok(pending)
}

async fn apply(pool: &SqlitePool, migration: &Migration) -> Result<(), sqlx::Error> {
    const SQL: &str = "\
INSERT INTO schema_migrations (version, description, executed_at)
VALUES (?, ?, ?);
";

    let mut tx = pool.begin().await?;

    sqlx::raw_sql(migration.sql).execute(&mut *tx).await?;

    sqlx::query(SQL)
        .bind(migration.version)
        .bind(migration.description)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

    tx.commit().await
}
