pub mod models;

use super::{
    BusyState, CalendarEvent, CalendarProvider, EventPage, NewEvent, ProviderError, Window,
    MIRROR_DESCRIPTION,
};
use crate::identity::CalendarType;
use crate::AppConfig;
use async_trait::async_trait;
use chrono::{NaiveTime, SecondsFormat, Utc};
use chrono_tz::Tz;
use google_cloud_auth::credentials::CredentialsFile;
use google_cloud_auth::project::Config;
use google_cloud_auth::token::DefaultTokenSourceProvider;
use google_cloud_token::{TokenSource, TokenSourceProvider};
use http::Extensions;
use indexmap::IndexMap;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use reqwest::{Request, Response, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, Middleware, Next};
use std::sync::Arc;
use std::time::Duration;

const SCOPES: &[&str] = &["https://www.googleapis.com/auth/calendar"];

/// Page size requested from `events.list`.
const PAGE_SIZE: u32 = 250;

struct AuthMiddleware {
    token_source: Arc<dyn TokenSource>,
}

impl AuthMiddleware {
    fn new(token_source: Arc<dyn TokenSource>) -> AuthMiddleware {
        AuthMiddleware { token_source }
    }
}

#[async_trait]
impl Middleware for AuthMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let token = self
            .token_source
            .token()
            .await
            .map_err(|err| ProviderError::auth(CalendarType::Google, err.to_string()))?;

        let mut header = HeaderValue::try_from(token)
            .map_err(|err| ProviderError::auth(CalendarType::Google, err.to_string()))?;
        header.set_sensitive(true);
        req.headers_mut().insert(AUTHORIZATION, header);
        next.run(req, extensions).await
    }
}

/// Google calendar client for making requests to the google calendar api
#[derive(Debug)]
pub struct GoogleCalendarClient {
    client: ClientWithMiddleware,
    base_url: Url,
    timezone: Tz,
}

impl GoogleCalendarClient {
    /// Create a new google calendar client authenticated as a service account. The key file is
    /// taken from `google_credentials_path` or, when unset, from the default lookup via the
    /// `GOOGLE_APPLICATION_CREDENTIALS` environment variable. The calendars to sync have to be
    /// shared with the service account.
    pub async fn from_config(config: &AppConfig) -> Result<GoogleCalendarClient, ProviderError> {
        let timezone = config
            .timezone()
            .map_err(|err| ProviderError::configuration(CalendarType::Google, err.to_string()))?;

        let auth_config = Config::default().with_scopes(SCOPES);

        let provider = match &config.google_credentials_path {
            Some(path) => {
                if !path.is_file() {
                    return Err(ProviderError::configuration(
                        CalendarType::Google,
                        format!("credentials file {} not found", path.display()),
                    ));
                }

                log::info!("using Google service account from {}", path.display());

                let credentials = CredentialsFile::new_from_file(path.display().to_string())
                    .await
                    .map_err(|err| {
                        ProviderError::configuration(CalendarType::Google, err.to_string())
                    })?;

                DefaultTokenSourceProvider::new_with_credentials(
                    auth_config,
                    Box::new(credentials),
                )
                .await
            }
            None if has_ambient_credentials() => DefaultTokenSourceProvider::new(auth_config).await,
            None => {
                return Err(ProviderError::configuration(
                    CalendarType::Google,
                    "neither GOOGLE_CREDENTIALS_PATH nor GOOGLE_APPLICATION_CREDENTIALS is set",
                ))
            }
        }
        .map_err(|err| ProviderError::configuration(CalendarType::Google, err.to_string()))?;

        GoogleCalendarClient::new(
            provider.token_source(),
            &config.google_calendar_url,
            timezone,
        )
    }

    /// Create a new google calendar client from a token source.
    pub fn new(
        token_source: Arc<dyn TokenSource>,
        base_url: &str,
        timezone: Tz,
    ) -> Result<GoogleCalendarClient, ProviderError> {
        let base_url = parse_base_url(base_url)?;

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("calsync/", env!("CARGO_PKG_VERSION"))),
        );

        let client = ClientBuilder::new(
            reqwest::Client::builder()
                .default_headers(headers)
                .timeout(Duration::from_secs(30))
                .build()?,
        )
        .with(AuthMiddleware::new(token_source))
        .build();

        Ok(GoogleCalendarClient {
            client,
            base_url,
            timezone,
        })
    }

    /// Builds `{base}/calendars/{calendar_id}/events[/{event_id}]`.
    fn events_url(&self, calendar_id: &str, event_id: Option<&str>) -> Result<Url, ProviderError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|()| {
                ProviderError::configuration(CalendarType::Google, "API URL cannot be a base")
            })?;
            segments
                .pop_if_empty()
                .extend(["calendars", calendar_id, "events"]);
            if let Some(event_id) = event_id {
                segments.push(event_id);
            }
        }
        Ok(url)
    }

    fn event_time(&self, time: chrono::DateTime<Utc>, all_day: bool) -> models::EventDateTime {
        if all_day {
            models::EventDateTime {
                date: Some(time.date_naive()),
                ..Default::default()
            }
        } else {
            models::EventDateTime {
                date_time: Some(time),
                time_zone: Some(self.timezone.name().to_owned()),
                ..Default::default()
            }
        }
    }
}

#[async_trait]
impl CalendarProvider for GoogleCalendarClient {
    fn kind(&self) -> CalendarType {
        CalendarType::Google
    }

    async fn list_events_page(
        &self,
        calendar_id: &str,
        window: &Window,
        page_token: Option<&str>,
    ) -> Result<EventPage, ProviderError> {
        let query = build_query_parameters(&Some(window.clone()), &Some(PAGE_SIZE), &page_token);

        let response = self
            .client
            .get(self.events_url(calendar_id, None)?)
            .query(&query)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::from_response(CalendarType::Google, response).await);
        }

        let models::Events {
            items,
            next_page_token,
        } = response.json::<models::Events>().await?;

        log::debug!(
            "fetched {} events from Google Calendar {calendar_id}",
            items.len()
        );

        let events = items
            .into_iter()
            .filter(|event| event.status.as_deref() != Some("cancelled"))
            .map(CalendarEvent::try_from)
            .collect::<Result<_, _>>()?;

        Ok(EventPage {
            events,
            next_page_token,
        })
    }

    async fn create_event(
        &self,
        calendar_id: &str,
        event: &NewEvent,
    ) -> Result<String, ProviderError> {
        let body = models::EventInsert {
            summary: event.subject.clone(),
            description: MIRROR_DESCRIPTION.to_owned(),
            start: self.event_time(event.start, event.all_day),
            end: self.event_time(event.end, event.all_day),
            transparency: "opaque",
        };

        let response = self
            .client
            .post(self.events_url(calendar_id, None)?)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::from_response(CalendarType::Google, response).await);
        }

        let created = response.json::<models::Event>().await?;

        log::debug!("created Google Calendar event {} on {calendar_id}", created.id);

        Ok(created.id)
    }

    async fn delete_event(&self, calendar_id: &str, event_id: &str) -> Result<(), ProviderError> {
        let response = self
            .client
            .delete(self.events_url(calendar_id, Some(event_id))?)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::from_response(CalendarType::Google, response).await);
        }

        log::debug!("deleted Google Calendar event {event_id} from {calendar_id}");

        Ok(())
    }
}

impl TryFrom<models::Event> for CalendarEvent {
    type Error = ProviderError;

    fn try_from(ev: models::Event) -> Result<Self, Self::Error> {
        let all_day = ev.start.date.is_some();
        let start = to_utc(&ev.start)
            .ok_or_else(|| ProviderError::decode(CalendarType::Google, "event without start"))?;
        let end = to_utc(&ev.end)
            .ok_or_else(|| ProviderError::decode(CalendarType::Google, "event without end"))?;

        let busy_state = match (ev.transparency.as_deref(), ev.status.as_deref()) {
            (Some("transparent"), _) => BusyState::Free,
            (_, Some("tentative")) => BusyState::Tentative,
            _ => BusyState::Busy,
        };

        Ok(CalendarEvent {
            id: ev.id,
            subject: ev.summary.unwrap_or_default(),
            start,
            end,
            all_day,
            busy_state,
        })
    }
}

fn to_utc(time: &models::EventDateTime) -> Option<chrono::DateTime<Utc>> {
    match (time.date_time, time.date) {
        (Some(date_time), _) => Some(date_time),
        (None, Some(date)) => Some(date.and_time(NaiveTime::MIN).and_utc()),
        (None, None) => None,
    }
}

fn has_ambient_credentials() -> bool {
    ["GOOGLE_APPLICATION_CREDENTIALS", "GOOGLE_APPLICATION_CREDENTIALS_JSON"]
        .iter()
        .any(|var| std::env::var_os(var).is_some_and(|value| !value.is_empty()))
}

fn parse_base_url(base_url: &str) -> Result<Url, ProviderError> {
    let url = Url::parse(base_url).map_err(|err| {
        ProviderError::configuration(
            CalendarType::Google,
            format!("invalid API URL `{base_url}`: {err}"),
        )
    })?;

    if url.cannot_be_a_base() {
        return Err(ProviderError::configuration(
            CalendarType::Google,
            format!("API URL `{base_url}` cannot be a base"),
        ));
    }

    Ok(url)
}

fn build_query_parameters(
    date_range: &Option<Window>,
    event_count: &Option<u32>,
    next_page_token: &Option<&str>,
) -> IndexMap<&'static str, String> {
    // Google requires rfc3339 format for the times with a fixed offset
    // see: https://developers.google.com/calendar/api/v3/reference/events/list

    let mut query_parameters: IndexMap<&'static str, String> = IndexMap::from([
        // expand recurring events into single instances
        ("singleEvents", "true".to_owned()),
        // order ascending by start time
        ("orderBy", "startTime".to_owned()),
    ]);

    if let Some(range) = date_range {
        // limit the events by a time frame
        query_parameters.insert(
            "timeMin",
            range.start.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        query_parameters.insert(
            "timeMax",
            range.end.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
    }

    if let Some(count) = event_count {
        // limit the number of events to a specific count
        query_parameters.insert("maxResults", count.to_string());
    }

    if let Some(token) = next_page_token {
        // page token returned by previous request to fetch the next page
        query_parameters.insert("pageToken", token.to_string());
    }

    query_parameters
}
