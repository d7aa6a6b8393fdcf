use chrono_tz::Tz;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

pub mod engine;
pub mod identity;
pub mod metrics;
pub mod migrate;
pub mod provider;
pub mod store;
pub mod web;

use identity::CalendarType;
use provider::ProviderError;

/// Result type used throughout this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type returned by all fallible operations within this crate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("no {0} calendar provider is configured")]
    ProviderUnavailable(CalendarType),
    #[error("database error: {0}")]
    Persistence(#[from] sqlx::Error),
    #[error("migration {version} failed: {source}")]
    Migration {
        version: &'static str,
        source: sqlx::Error,
    },
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: i64 },
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// Returns `true` if the error leaves the store in an unknown state. Without the ledger no
    /// dedup guarantee holds, so a batch must not continue after such an error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Persistence(_) | Error::Migration { .. })
    }
}

/// Web server configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ServerConfig {
    /// Address on which the web server will listen.
    pub listen_addr: SocketAddr,
    /// Automatically reload templates when they are modified.
    pub template_autoreload: bool,
    /// Directory containing the operator UI templates.
    pub template_dir: PathBuf,
}

/// Global application configuration.
///
/// Built once at process start and handed down to the store, the providers and the engine.
/// Keys are flat so that the usual environment variables (`DEFAULT_TIMEZONE`,
/// `MICROSOFT_CLIENT_ID`, ...) map onto them directly.
#[derive(Deserialize, Serialize, Clone)]
pub struct AppConfig {
    /// sqlx connection URL of the store, e.g. `sqlite://calsync.db`.
    pub database_url: String,
    /// IANA time zone used when writing mirror events.
    pub default_timezone: String,
    /// Length of the sync window in days, starting now.
    pub max_sync_range_days: u32,
    /// Prefix prepended to the subject of every mirror event.
    pub sync_subject_prefix: String,

    pub microsoft_tenant_id: Option<String>,
    pub microsoft_client_id: Option<String>,
    pub microsoft_client_secret: Option<String>,
    /// Base URL of the Microsoft Graph API.
    pub microsoft_graph_url: String,
    /// Base URL of the Microsoft identity platform.
    pub microsoft_authority_url: String,

    /// Path to a Google service account key file. Falls back to the default credential lookup
    /// (`GOOGLE_APPLICATION_CREDENTIALS`) when unset.
    pub google_credentials_path: Option<PathBuf>,
    /// Base URL of the Google Calendar API.
    pub google_calendar_url: String,

    /// Server configuration section.
    pub server: ServerConfig,
}

impl AppConfig {
    /// Loads the application configuration from files in the `config/` directory and environment
    /// variables.
    pub fn load() -> Result<AppConfig> {
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".into());

        log::info!("loading configuration using {} environment", app_env);

        let builder = AppConfig::defaults()?
            // Optional configuration from `config/default.toml`.
            .add_source(File::with_name("config/default").required(false))
            // Optional environment specific config overrides, e.g. `config/production.toml`.
            .add_source(File::with_name(&format!("config/{}", app_env)).required(false))
            // Optional local config overrides from `config/local.toml` (on .gitignore).
            .add_source(File::with_name("config/local").required(false))
            // Config from environment variables.
            .add_source(Environment::default().separator("__"))
            // Config from environment variables prefixed with `CALSYNC_`.
            .add_source(
                Environment::with_prefix("CALSYNC")
                    .prefix_separator("_")
                    .separator("__"),
            );

        AppConfig::from_builder(builder)
    }

    /// Returns a config builder pre-populated with the built-in defaults.
    pub fn defaults() -> Result<ConfigBuilder<DefaultState>> {
        let builder = Config::builder()
            .set_default("database_url", "sqlite://calsync.db")?
            .set_default("default_timezone", "UTC")?
            .set_default("max_sync_range_days", 30)?
            .set_default("sync_subject_prefix", "[SYNC] ")?
            .set_default("microsoft_graph_url", "https://graph.microsoft.com/v1.0")?
            .set_default(
                "microsoft_authority_url",
                "https://login.microsoftonline.com",
            )?
            .set_default(
                "google_calendar_url",
                "https://www.googleapis.com/calendar/v3",
            )?
            .set_default("server.listen_addr", "127.0.0.1:8080")?
            .set_default("server.template_autoreload", false)?
            .set_default("server.template_dir", "templates")?;

        Ok(builder)
    }

    /// Builds and validates the configuration from a builder.
    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<AppConfig> {
        let config: AppConfig = builder.build()?.try_deserialize()?;

        config.timezone()?;

        if config.max_sync_range_days == 0 {
            return Err(Error::Configuration(
                "MAX_SYNC_RANGE_DAYS must be at least 1".into(),
            ));
        }

        log::debug!(
            "loaded configuration: database {}, timezone {}, sync range {} days",
            config.database_url,
            config.default_timezone,
            config.max_sync_range_days
        );

        Ok(config)
    }

    /// Parses the configured default time zone.
    pub fn timezone(&self) -> Result<Tz> {
        self.default_timezone.parse().map_err(|err| {
            Error::Configuration(format!(
                "invalid DEFAULT_TIMEZONE `{}`: {err}",
                self.default_timezone
            ))
        })
    }
}
