use super::SyncDirection;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

/// A ledger row: an origin event and the mirror created for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct MirroredEvent {
    pub id: i64,
    pub sync_config_id: i64,
    pub origin_event_id: String,
    pub mirror_event_id: String,
    pub subject: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub is_all_day: bool,
    pub show_as: String,
    pub source_email: String,
    pub target_email: String,
    pub sync_direction: SyncDirection,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMirror<'a> {
    pub sync_config_id: i64,
    pub origin_event_id: &'a str,
    pub mirror_event_id: &'a str,
    pub subject: &'a str,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub is_all_day: bool,
    pub show_as: &'a str,
    /// Calendar the origin event was read from.
    pub source_email: &'a str,
    /// Calendar the mirror was written to.
    pub target_email: &'a str,
    pub sync_direction: SyncDirection,
}

/// Ledger of mirrored events. Rows are only ever inserted.
#[derive(Debug, Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Looks up the mirror of an origin event within a configuration and direction.
    pub async fn find(
        &self,
        origin_event_id: &str,
        sync_config_id: i64,
        sync_direction: SyncDirection,
    ) -> Result<Option<MirroredEvent>> {
        const SQL: &str = "\
SELECT id, sync_config_id, origin_event_id, mirror_event_id, subject, start_time, end_time,
       is_all_day, show_as, source_email, target_email, sync_direction, created_at
FROM calendar_events
WHERE origin_event_id = ? AND sync_config_id = ? AND sync_direction = ?;
";

        let mirror = sqlx::query_as(SQL)
            .bind(origin_event_id)
            .bind(sync_config_id)
            .bind(sync_direction)
            .fetch_optional(&self.pool)
            .await?;

        Ok(mirror)
    }

    /// Returns `true` if `event_id` is a mirror created for this configuration.
    pub async fn is_mirror(&self, event_id: &str, sync_config_id: i64) -> Result<bool> {
        const SQL: &str = "\
SELECT EXISTS (
    SELECT 1 FROM calendar_events WHERE mirror_event_id = ? AND sync_config_id = ?
);
";

        let (exists,): (bool,) = sqlx::query_as(SQL)
            .bind(event_id)
            .bind(sync_config_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(exists)
    }

    /// Records a mirror. Returns `false` if the origin event already had a ledger row.
    pub async fn record(&self, mirror: &NewMirror<'_>) -> Result<bool> {
        const SQL: &str = "\
INSERT INTO calendar_events
    (sync_config_id, origin_event_id, mirror_event_id, subject, start_time, end_time,
     is_all_day, show_as, source_email, target_email, sync_direction, created_at)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT (origin_event_id, sync_config_id, sync_direction) DO NOTHING;
";

        let result = sqlx::query(SQL)
            .bind(mirror.sync_config_id)
            .bind(mirror.origin_event_id)
            .bind(mirror.mirror_event_id)
            .bind(mirror.subject)
            .bind(mirror.start_time)
            .bind(mirror.end_time)
            .bind(mirror.is_all_day)
            .bind(mirror.show_as)
            .bind(mirror.source_email)
            .bind(mirror.target_email)
            .bind(mirror.sync_direction)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Number of ledger rows of a configuration.
    pub async fn count(&self, sync_config_id: i64) -> Result<i64> {
        const SQL: &str = "SELECT COUNT(*) FROM calendar_events WHERE sync_config_id = ?;";

        let (count,): (i64,) = sqlx::query_as(SQL)
            .bind(sync_config_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}
