//! Calendar provider adapters.
//!
//! Every provider implements [`CalendarProvider`], a small capability interface for listing,
//! creating and deleting events on a calendar identified by an identity string. The engine never
//! talks to provider APIs directly; it resolves an adapter for a [`CalendarType`] through
//! [`Providers`].

pub mod google;
pub mod microsoft;

use crate::identity::CalendarType;
use crate::{AppConfig, Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use google::GoogleCalendarClient;
use microsoft::MicrosoftGraphClient;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

/// Upper bound of pages followed by [`CalendarProvider::list_events`].
pub const MAX_PAGES: usize = 50;

/// Description attached to every mirror event.
pub const MIRROR_DESCRIPTION: &str = "Synced from external calendar";

/// Time window of a sync run, start inclusive and end exclusive.
pub type Window = Range<DateTime<Utc>>;

/// Errors returned by provider adapters.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Credentials are missing or malformed.
    #[error("missing or invalid {provider} credentials: {message}")]
    Configuration {
        provider: CalendarType,
        message: String,
    },

    /// Error while acquiring or refreshing an access token.
    #[error("failed to authenticate with {provider}: {message}")]
    Auth {
        provider: CalendarType,
        message: String,
    },

    /// The provider API answered with a non-2xx status.
    #[error("{provider} request failed with status {status}: {message}")]
    Api {
        provider: CalendarType,
        status: u16,
        message: String,
    },

    /// Error while making a http request.
    #[error("failure requesting remote resource: {0}")]
    Request(#[from] reqwest::Error),

    /// Error while executing some middleware code.
    #[error("request middleware failed with: {0}")]
    RequestMiddleware(reqwest_middleware::Error),

    /// The provider returned a payload we could not interpret.
    #[error("unexpected response from {provider}: {message}")]
    Decode {
        provider: CalendarType,
        message: String,
    },
}

impl ProviderError {
    pub(crate) fn configuration(provider: CalendarType, message: impl Into<String>) -> Self {
        ProviderError::Configuration {
            provider,
            message: message.into(),
        }
    }

    pub(crate) fn auth(provider: CalendarType, message: impl Into<String>) -> Self {
        ProviderError::Auth {
            provider,
            message: message.into(),
        }
    }

    pub(crate) fn decode(provider: CalendarType, message: impl Into<String>) -> Self {
        ProviderError::Decode {
            provider,
            message: message.into(),
        }
    }

    /// Builds an `Api` error from an unsuccessful response, consuming its body as message.
    pub(crate) async fn from_response(provider: CalendarType, response: reqwest::Response) -> Self {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();

        ProviderError::Api {
            provider,
            status,
            message,
        }
    }
}

impl From<ProviderError> for reqwest_middleware::Error {
    fn from(err: ProviderError) -> Self {
        reqwest_middleware::Error::Middleware(anyhow::Error::new(err))
    }
}

impl From<reqwest_middleware::Error> for ProviderError {
    fn from(err: reqwest_middleware::Error) -> Self {
        match err {
            reqwest_middleware::Error::Reqwest(err) => ProviderError::Request(err),
            // Auth middlewares smuggle our own errors through `anyhow`; unwrap them again.
            reqwest_middleware::Error::Middleware(err) => match err.downcast::<ProviderError>() {
                Ok(err) => err,
                Err(err) => {
                    ProviderError::RequestMiddleware(reqwest_middleware::Error::Middleware(err))
                }
            },
        }
    }
}

/// How an event blocks the time it covers.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BusyState {
    Free,
    Tentative,
    #[default]
    Busy,
    OutOfOffice,
    WorkingElsewhere,
    Unknown,
}

impl BusyState {
    /// Returns the busy state as a &str.
    pub fn as_str(&self) -> &'static str {
        match self {
            BusyState::Free => "free",
            BusyState::Tentative => "tentative",
            BusyState::Busy => "busy",
            BusyState::OutOfOffice => "out_of_office",
            BusyState::WorkingElsewhere => "working_elsewhere",
            BusyState::Unknown => "unknown",
        }
    }
}

/// A provider-neutral calendar event.
///
/// All-day events carry midnight UTC of their calendar dates, so `start.date_naive()` is the first
/// day of the event and `end.date_naive()` the (exclusive) day after its last day.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CalendarEvent {
    /// Provider assigned event id.
    pub id: String,
    /// The event subject.
    pub subject: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub all_day: bool,
    pub busy_state: BusyState,
}

impl fmt::Display for CalendarEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.subject, self.id)
    }
}

/// An event to be created on a calendar. Created events are always busy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub subject: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub all_day: bool,
}

/// One page of a listing.
#[derive(Debug, Default)]
pub struct EventPage {
    pub events: Vec<CalendarEvent>,
    /// Opaque token to fetch the following page, if any.
    pub next_page_token: Option<String>,
}

/// Trait that needs to be implemented by a calendar provider.
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    /// The calendar type served by this provider.
    fn kind(&self) -> CalendarType;

    /// Fetches one page of events of `identity` overlapping `window`.
    async fn list_events_page(
        &self,
        identity: &str,
        window: &Window,
        page_token: Option<&str>,
    ) -> Result<EventPage, ProviderError>;

    /// Fetches all events of `identity` overlapping `window`, following page tokens.
    async fn list_events(
        &self,
        identity: &str,
        window: &Window,
    ) -> Result<Vec<CalendarEvent>, ProviderError> {
        let mut events = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let page = self
                .list_events_page(identity, window, page_token.as_deref())
                .await?;
            events.extend(page.events);

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => return Ok(events),
            }
        }

        log::warn!(
            "stopped listing {} events of {identity} after {MAX_PAGES} pages",
            self.kind()
        );

        Ok(events)
    }

    /// Creates a busy event on `identity` and returns the id assigned by the provider.
    async fn create_event(&self, identity: &str, event: &NewEvent)
        -> Result<String, ProviderError>;

    /// Deletes the event `event_id` from `identity`.
    async fn delete_event(&self, identity: &str, event_id: &str) -> Result<(), ProviderError>;
}

#[async_trait]
impl<T> CalendarProvider for Arc<T>
where
    T: CalendarProvider + ?Sized,
{
    fn kind(&self) -> CalendarType {
        (**self).kind()
    }

    async fn list_events_page(
        &self,
        identity: &str,
        window: &Window,
        page_token: Option<&str>,
    ) -> Result<EventPage, ProviderError> {
        (**self).list_events_page(identity, window, page_token).await
    }

    async fn list_events(
        &self,
        identity: &str,
        window: &Window,
    ) -> Result<Vec<CalendarEvent>, ProviderError> {
        (**self).list_events(identity, window).await
    }

    async fn create_event(
        &self,
        identity: &str,
        event: &NewEvent,
    ) -> Result<String, ProviderError> {
        (**self).create_event(identity, event).await
    }

    async fn delete_event(&self, identity: &str, event_id: &str) -> Result<(), ProviderError> {
        (**self).delete_event(identity, event_id).await
    }
}

/// The set of configured providers, keyed by the calendar type they serve.
#[derive(Clone, Default)]
pub struct Providers {
    providers: HashMap<CalendarType, Arc<dyn CalendarProvider>>,
}

impl Providers {
    /// Creates an empty set of providers.
    pub fn new() -> Providers {
        Providers::default()
    }

    /// Adds a provider, replacing any provider previously registered for the same type.
    pub fn with<T>(mut self, provider: T) -> Providers
    where
        T: CalendarProvider + 'static,
    {
        self.providers.insert(provider.kind(), Arc::new(provider));
        self
    }

    /// Constructs every provider the configuration has credentials for. Providers without
    /// credentials are logged and left out; they resolve to `ProviderUnavailable` later.
    pub async fn from_config(config: &AppConfig) -> Result<Providers> {
        let mut providers = Providers::new();

        match MicrosoftGraphClient::from_config(config) {
            Ok(client) => providers = providers.with(client),
            Err(err @ ProviderError::Configuration { .. }) => {
                log::warn!("Microsoft calendars unavailable: {err}")
            }
            Err(err) => return Err(err.into()),
        }

        match GoogleCalendarClient::from_config(config).await {
            Ok(client) => providers = providers.with(client),
            Err(err @ ProviderError::Configuration { .. }) => {
                log::warn!("Google calendars unavailable: {err}")
            }
            Err(err) => return Err(err.into()),
        }

        Ok(providers)
    }

    /// Resolves the provider for a calendar type.
    pub fn get(&self, kind: CalendarType) -> Result<Arc<dyn CalendarProvider>> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or(Error::ProviderUnavailable(kind))
    }

    /// Returns `true` if no provider is configured at all.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Returns the configured calendar types.
    pub fn kinds(&self) -> Vec<CalendarType> {
        CalendarType::ALL
            .into_iter()
            .filter(|kind| self.providers.contains_key(kind))
            .collect()
    }
}
