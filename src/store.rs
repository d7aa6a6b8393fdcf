//! Persistence of users, sync configurations, the mirror ledger and the run log.

mod configurations;
mod ledger;
mod runs;
mod users;

pub use configurations::{
    ConfigurationOverview, Configurations, NewConfiguration, SyncConfiguration, SyncDirection,
};
pub use ledger::{Ledger, MirroredEvent, NewMirror};
pub use runs::{RunOverview, RunStatus, Runs, SyncCounts, SyncRun};
pub use users::{User, Users};

use crate::{migrate, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

/// Handle to the relational store.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,

    pub users: Users,
    pub configurations: Configurations,
    pub ledger: Ledger,
    pub runs: Runs,
}

impl Store {
    /// Connects to the database at `url`, creating the file if it does not exist. Does not run
    /// migrations.
    pub async fn connect(url: &str) -> Result<Store> {
        log::info!("connecting to database {url}");

        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // A single connection serializes all writes of this process.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Ok(Store::from_pool(pool))
    }

    /// Opens a migrated in-memory database.
    pub async fn open_in_memory() -> Result<Store> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);

        // In-memory databases only live as long as their connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        migrate::migrate(&pool).await?;

        Ok(Store::from_pool(pool))
    }

    fn from_pool(pool: SqlitePool) -> Store {
        Store {
            users: Users::new(pool.clone()),
            configurations: Configurations::new(pool.clone()),
            ledger: Ledger::new(pool.clone()),
            runs: Runs::new(pool.clone()),
            pool,
        }
    }

    /// Returns the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        log::debug!("closing database connection");
        self.pool.close().await;
    }
}
