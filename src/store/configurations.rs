use crate::identity::CalendarType;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::fmt;

/// Direction in which busy time is mirrored between the two calendars of a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SyncDirection {
    SourceToTarget,
    TargetToSource,
    Bidirectional,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::SourceToTarget => "source_to_target",
            SyncDirection::TargetToSource => "target_to_source",
            SyncDirection::Bidirectional => "bidirectional",
        }
    }

    /// The one-way passes a run in this direction consists of.
    pub fn passes(&self) -> &'static [SyncDirection] {
        match self {
            SyncDirection::SourceToTarget => &[SyncDirection::SourceToTarget],
            SyncDirection::TargetToSource => &[SyncDirection::TargetToSource],
            SyncDirection::Bidirectional => {
                &[SyncDirection::SourceToTarget, SyncDirection::TargetToSource]
            }
        }
    }
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pairing of two calendars whose busy time is kept in sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct SyncConfiguration {
    pub id: i64,
    pub user_id: i64,
    pub source_email: String,
    pub target_email: String,
    /// Type recorded at creation. Informational, endpoints are re-classified on every run.
    pub source_type: CalendarType,
    pub target_type: CalendarType,
    pub sync_direction: SyncDirection,
    pub is_active: bool,
    pub sync_frequency_minutes: i64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A configuration joined with its owner, for listings.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ConfigurationOverview {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub configuration: SyncConfiguration,
    pub user_email: String,
    pub display_name: String,
}

#[derive(Debug, Clone)]
pub struct NewConfiguration {
    pub user_id: i64,
    pub source_email: String,
    pub target_email: String,
    /// `None` classifies the source identity.
    pub source_type: Option<CalendarType>,
    /// `None` classifies the target identity.
    pub target_type: Option<CalendarType>,
    pub sync_direction: SyncDirection,
    pub sync_frequency_minutes: u32,
}

impl NewConfiguration {
    pub fn new(
        user_id: i64,
        source_email: impl Into<String>,
        target_email: impl Into<String>,
        sync_direction: SyncDirection,
    ) -> NewConfiguration {
        NewConfiguration {
            user_id,
            source_email: source_email.into(),
            target_email: target_email.into(),
            source_type: None,
            target_type: None,
            sync_direction,
            sync_frequency_minutes: 15,
        }
    }
}

const COLUMNS: &str = "\
id, user_id, source_email, target_email, source_type, target_type, sync_direction, is_active, \
sync_frequency_minutes, last_sync_at, created_at";

#[derive(Debug, Clone)]
pub struct Configurations {
    pool: SqlitePool,
}

impl Configurations {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Stores a new, active configuration.
    pub async fn add(&self, new: &NewConfiguration) -> Result<SyncConfiguration> {
        let sql = format!(
            "\
INSERT INTO sync_configurations
    (user_id, source_email, target_email, source_type, target_type, sync_direction,
     is_active, sync_frequency_minutes, created_at)
VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
RETURNING {COLUMNS};
"
        );

        let source_type = new
            .source_type
            .unwrap_or_else(|| CalendarType::classify(&new.source_email));
        let target_type = new
            .target_type
            .unwrap_or_else(|| CalendarType::classify(&new.target_email));

        let configuration = sqlx::query_as(&sql)
            .bind(new.user_id)
            .bind(&new.source_email)
            .bind(&new.target_email)
            .bind(source_type)
            .bind(target_type)
            .bind(new.sync_direction)
            .bind(new.sync_frequency_minutes)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await?;

        Ok(configuration)
    }

    pub async fn get(&self, id: i64) -> Result<Option<SyncConfiguration>> {
        let sql = format!("SELECT {COLUMNS} FROM sync_configurations WHERE id = ?;");

        let configuration = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(configuration)
    }

    /// Activates or deactivates a configuration.
    pub async fn set_active(&self, id: i64, active: bool) -> Result<()> {
        const SQL: &str = "UPDATE sync_configurations SET is_active = ? WHERE id = ?;";

        let result = sqlx::query(SQL)
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound {
                entity: "sync configuration",
                id,
            });
        }

        Ok(())
    }

    /// All configurations with `is_active = 1`, oldest first.
    pub async fn active(&self) -> Result<Vec<SyncConfiguration>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM sync_configurations WHERE is_active = 1 ORDER BY id ASC;"
        );

        let configurations = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(configurations)
    }

    /// All configurations with their owners, newest first.
    pub async fn list(&self) -> Result<Vec<ConfigurationOverview>> {
        const SQL: &str = "\
SELECT sc.id, sc.user_id, sc.source_email, sc.target_email, sc.source_type, sc.target_type,
       sc.sync_direction, sc.is_active, sc.sync_frequency_minutes, sc.last_sync_at,
       sc.created_at, u.email AS user_email, u.display_name
FROM sync_configurations sc
JOIN users u ON sc.user_id = u.id
ORDER BY sc.created_at DESC, sc.id DESC;
";

        let configurations = sqlx::query_as(SQL).fetch_all(&self.pool).await?;
        Ok(configurations)
    }

    pub async fn touch_last_sync(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        const SQL: &str = "UPDATE sync_configurations SET last_sync_at = ? WHERE id = ?;";

        sqlx::query(SQL)
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
