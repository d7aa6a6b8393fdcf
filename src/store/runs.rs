use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::fmt;
use std::ops::AddAssign;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event counters of a sync run or of a single reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct SyncCounts {
    #[sqlx(rename = "events_processed")]
    pub processed: u32,
    #[sqlx(rename = "events_created")]
    pub created: u32,
    /// Events that already had a mirror.
    #[sqlx(rename = "events_updated")]
    pub updated: u32,
    #[sqlx(rename = "events_deleted")]
    pub deleted: u32,
    /// Changes of already mirrored events that were not propagated.
    pub updates_skipped: u32,
}

impl AddAssign for SyncCounts {
    fn add_assign(&mut self, other: SyncCounts) {
        self.processed += other.processed;
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.updates_skipped += other.updates_skipped;
    }
}

impl fmt::Display for SyncCounts {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} processed, {} created, {} updated, {} deleted",
            self.processed, self.created, self.updated, self.deleted
        )
    }
}

/// A row of the run log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct SyncRun {
    pub id: i64,
    pub sync_config_id: i64,
    pub sync_type: String,
    pub status: RunStatus,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub counts: SyncCounts,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A run joined with the calendars of its configuration, for listings.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RunOverview {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub run: SyncRun,
    pub source_email: String,
    pub target_email: String,
}

const COLUMNS: &str = "\
id, sync_config_id, sync_type, status, events_processed, events_created, events_updated, \
events_deleted, updates_skipped, error_message, started_at, completed_at";

#[derive(Debug, Clone)]
pub struct Runs {
    pool: SqlitePool,
}

impl Runs {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens a `running` incremental run with zero counts and returns its id.
    pub async fn open(&self, sync_config_id: i64) -> Result<i64> {
        const SQL: &str = "\
INSERT INTO sync_logs (sync_config_id, sync_type, status, started_at)
VALUES (?, 'incremental', ?, ?)
RETURNING id;
";

        let (id,): (i64,) = sqlx::query_as(SQL)
            .bind(sync_config_id)
            .bind(RunStatus::Running)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await?;

        Ok(id)
    }

    /// Closes a run with its final status and counts.
    pub async fn close(
        &self,
        id: i64,
        status: RunStatus,
        counts: &SyncCounts,
        error_message: Option<&str>,
    ) -> Result<()> {
        const SQL: &str = "\
UPDATE sync_logs
SET status = ?, events_processed = ?, events_created = ?, events_updated = ?,
    events_deleted = ?, updates_skipped = ?, error_message = ?, completed_at = ?
WHERE id = ?;
";

        sqlx::query(SQL)
            .bind(status)
            .bind(counts.processed)
            .bind(counts.created)
            .bind(counts.updated)
            .bind(counts.deleted)
            .bind(counts.updates_skipped)
            .bind(error_message)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn get(&self, id: i64) -> Result<Option<SyncRun>> {
        let sql = format!("SELECT {COLUMNS} FROM sync_logs WHERE id = ?;");

        let run = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(run)
    }

    /// Runs of one configuration, oldest first.
    pub async fn for_configuration(&self, sync_config_id: i64) -> Result<Vec<SyncRun>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM sync_logs WHERE sync_config_id = ? ORDER BY id ASC;"
        );

        let runs = sqlx::query_as(&sql)
            .bind(sync_config_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(runs)
    }

    /// The latest `limit` runs across all configurations, newest first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<RunOverview>> {
        const SQL: &str = "\
SELECT sl.id, sl.sync_config_id, sl.sync_type, sl.status, sl.events_processed,
       sl.events_created, sl.events_updated, sl.events_deleted, sl.updates_skipped,
       sl.error_message, sl.started_at, sl.completed_at, sc.source_email, sc.target_email
FROM sync_logs sl
JOIN sync_configurations sc ON sl.sync_config_id = sc.id
ORDER BY sl.started_at DESC, sl.id DESC
LIMIT ?;
";

        let runs = sqlx::query_as(SQL)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(runs)
    }
}
