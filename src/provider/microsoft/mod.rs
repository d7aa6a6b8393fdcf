pub mod models;

use super::{
    BusyState, CalendarEvent, CalendarProvider, EventPage, NewEvent, ProviderError, Window,
    MIRROR_DESCRIPTION,
};
use crate::identity::CalendarType;
use crate::AppConfig;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, NaiveTime, TimeDelta, Utc};
use chrono_tz::Tz;
use http::Extensions;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use reqwest::{Request, Response, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, Middleware, Next};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Tokens are refreshed once they are closer to expiry than this many minutes.
const REFRESH_MARGIN_MINUTES: i64 = 5;

/// Page size requested from the events endpoint.
const PAGE_SIZE: u32 = 100;

/// Graph's `dateTime` format. Fractional seconds are optional.
const GRAPH_DATE_TIME: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Credentials of an app registration with the `Calendars.ReadWrite` application permission.
#[derive(Clone)]
pub struct GraphCredentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

struct AccessToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// OAuth2 client credentials flow with an in-memory token cache.
struct ClientCredentials {
    http: reqwest::Client,
    token_url: Url,
    credentials: GraphCredentials,
    cached: Mutex<Option<AccessToken>>,
}

impl ClientCredentials {
    /// Returns a valid bearer token, acquiring a new one when the cached token is missing or about
    /// to expire.
    async fn token(&self) -> Result<String, ProviderError> {
        // Held across the request so that concurrent callers share a single refresh.
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if token.expires_at - Utc::now() > TimeDelta::minutes(REFRESH_MARGIN_MINUTES) {
                return Ok(token.value.clone());
            }
        }

        log::debug!("requesting Microsoft Graph access token");

        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("scope", GRAPH_SCOPE),
        ];

        let response = self
            .http
            .post(self.token_url.clone())
            .form(&params)
            .send()
            .await
            .map_err(|err| ProviderError::auth(CalendarType::Microsoft, err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::auth(
                CalendarType::Microsoft,
                format!("token endpoint answered {status}: {body}"),
            ));
        }

        let token = response
            .json::<models::TokenResponse>()
            .await
            .map_err(|err| ProviderError::auth(CalendarType::Microsoft, err.to_string()))?;

        let value = format!("Bearer {}", token.access_token);
        *cached = Some(AccessToken {
            value: value.clone(),
            expires_at: Utc::now() + TimeDelta::seconds(token.expires_in),
        });

        Ok(value)
    }
}

struct AuthMiddleware {
    credentials: Arc<ClientCredentials>,
}

#[async_trait]
impl Middleware for AuthMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let token = self.credentials.token().await?;

        let mut header = HeaderValue::try_from(token)
            .map_err(|err| ProviderError::auth(CalendarType::Microsoft, err.to_string()))?;
        header.set_sensitive(true);
        req.headers_mut().insert(AUTHORIZATION, header);
        next.run(req, extensions).await
    }
}

/// Microsoft Graph client for the calendars of the users of one tenant.
pub struct MicrosoftGraphClient {
    client: ClientWithMiddleware,
    graph_url: Url,
    timezone: Tz,
}

impl MicrosoftGraphClient {
    /// Creates a client from the `MICROSOFT_TENANT_ID`, `MICROSOFT_CLIENT_ID` and
    /// `MICROSOFT_CLIENT_SECRET` settings.
    pub fn from_config(config: &AppConfig) -> Result<MicrosoftGraphClient, ProviderError> {
        let setting = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_owned)
        };

        let (tenant_id, client_id, client_secret) = match (
            setting(&config.microsoft_tenant_id),
            setting(&config.microsoft_client_id),
            setting(&config.microsoft_client_secret),
        ) {
            (Some(tenant_id), Some(client_id), Some(client_secret)) => {
                (tenant_id, client_id, client_secret)
            }
            _ => {
                return Err(ProviderError::configuration(
                    CalendarType::Microsoft,
                    "MICROSOFT_TENANT_ID, MICROSOFT_CLIENT_ID and MICROSOFT_CLIENT_SECRET must be set",
                ))
            }
        };

        let timezone = config.timezone().map_err(|err| {
            ProviderError::configuration(CalendarType::Microsoft, err.to_string())
        })?;

        MicrosoftGraphClient::new(
            GraphCredentials {
                tenant_id,
                client_id,
                client_secret,
            },
            &config.microsoft_graph_url,
            &config.microsoft_authority_url,
            timezone,
        )
    }

    /// Creates a client against explicit Graph and identity platform base URLs.
    pub fn new(
        credentials: GraphCredentials,
        graph_url: &str,
        authority_url: &str,
        timezone: Tz,
    ) -> Result<MicrosoftGraphClient, ProviderError> {
        let graph_url = parse_base_url(graph_url)?;
        let mut token_url = parse_base_url(authority_url)?;
        push_segments(
            &mut token_url,
            &[&credentials.tenant_id, "oauth2", "v2.0", "token"],
        )?;

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("calsync/", env!("CARGO_PKG_VERSION"))),
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()?;

        let credentials = Arc::new(ClientCredentials {
            http: http.clone(),
            token_url,
            credentials,
            cached: Mutex::new(None),
        });

        let client = ClientBuilder::new(http)
            .with(AuthMiddleware { credentials })
            .build();

        Ok(MicrosoftGraphClient {
            client,
            graph_url,
            timezone,
        })
    }

    /// Builds `{graph}/users/{user}/events[/{event_id}]`.
    fn events_url(&self, user: &str, event_id: Option<&str>) -> Result<Url, ProviderError> {
        let mut url = self.graph_url.clone();
        push_segments(&mut url, &["users", user, "events"])?;
        if let Some(event_id) = event_id {
            push_segments(&mut url, &[event_id])?;
        }
        Ok(url)
    }

    fn convert(&self, ev: models::Event) -> Result<CalendarEvent, ProviderError> {
        let mut start = parse_date_time(&ev.start)?;
        let mut end = parse_date_time(&ev.end)?;

        if ev.is_all_day {
            start = midnight_utc(start, self.timezone);
            end = midnight_utc(end, self.timezone);
        }

        let busy_state = match ev.show_as.as_deref() {
            Some("free") => BusyState::Free,
            Some("tentative") => BusyState::Tentative,
            Some("busy") | None => BusyState::Busy,
            Some("oof") => BusyState::OutOfOffice,
            Some("workingElsewhere") => BusyState::WorkingElsewhere,
            Some(_) => BusyState::Unknown,
        };

        Ok(CalendarEvent {
            id: ev.id,
            subject: ev.subject.unwrap_or_default(),
            start,
            end,
            all_day: ev.is_all_day,
            busy_state,
        })
    }

    fn event_time(&self, time: DateTime<Utc>, all_day: bool) -> models::DateTimeTimeZone {
        if all_day {
            // All-day events must start and end at midnight in their own time zone.
            models::DateTimeTimeZone {
                date_time: time
                    .date_naive()
                    .and_time(NaiveTime::MIN)
                    .format("%Y-%m-%dT%H:%M:%S")
                    .to_string(),
                time_zone: Some(self.timezone.name().to_owned()),
            }
        } else {
            models::DateTimeTimeZone {
                date_time: time
                    .with_timezone(&self.timezone)
                    .naive_local()
                    .format("%Y-%m-%dT%H:%M:%S")
                    .to_string(),
                time_zone: Some(self.timezone.name().to_owned()),
            }
        }
    }
}

#[async_trait]
impl CalendarProvider for MicrosoftGraphClient {
    fn kind(&self) -> CalendarType {
        CalendarType::Microsoft
    }

    async fn list_events_page(
        &self,
        user: &str,
        window: &Window,
        page_token: Option<&str>,
    ) -> Result<EventPage, ProviderError> {
        let request = match page_token {
            // Next links already carry the query of the first request.
            Some(next_link) => self.client.get(next_link),
            None => self
                .client
                .get(self.events_url(user, None)?)
                .query(&build_query_parameters(window, PAGE_SIZE)),
        };

        let response = request
            .header("Prefer", r#"outlook.timezone="UTC""#)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::from_response(CalendarType::Microsoft, response).await);
        }

        let models::Events { value, next_link } = response.json::<models::Events>().await?;

        log::debug!("fetched {} events from Microsoft Graph for {user}", value.len());

        let events = value
            .into_iter()
            .filter(|event| !event.is_cancelled)
            .map(|event| self.convert(event))
            .collect::<Result<_, _>>()?;

        Ok(EventPage {
            events,
            next_page_token: next_link,
        })
    }

    async fn create_event(&self, user: &str, event: &NewEvent) -> Result<String, ProviderError> {
        let body = models::EventCreate {
            subject: event.subject.clone(),
            body: models::ItemBody {
                content_type: "text",
                content: MIRROR_DESCRIPTION.to_owned(),
            },
            start: self.event_time(event.start, event.all_day),
            end: self.event_time(event.end, event.all_day),
            is_all_day: event.all_day,
            show_as: "busy",
        };

        let response = self
            .client
            .post(self.events_url(user, None)?)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::from_response(CalendarType::Microsoft, response).await);
        }

        let created = response.json::<models::Event>().await?;

        log::debug!("created Microsoft Graph event {} for {user}", created.id);

        Ok(created.id)
    }

    async fn delete_event(&self, user: &str, event_id: &str) -> Result<(), ProviderError> {
        let response = self
            .client
            .delete(self.events_url(user, Some(event_id))?)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::from_response(CalendarType::Microsoft, response).await);
        }

        log::debug!("deleted Microsoft Graph event {event_id} for {user}");

        Ok(())
    }
}

fn build_query_parameters(window: &Window, page_size: u32) -> Vec<(&'static str, String)> {
    let format = |time: &DateTime<Utc>| time.naive_utc().format("%Y-%m-%dT%H:%M:%S").to_string();

    vec![
        (
            "$filter",
            format!(
                "end/dateTime gt '{}' and start/dateTime lt '{}'",
                format(&window.start),
                format(&window.end)
            ),
        ),
        ("$orderby", "start/dateTime".to_owned()),
        ("$top", page_size.to_string()),
        (
            "$select",
            "id,subject,start,end,isAllDay,isCancelled,showAs".to_owned(),
        ),
    ]
}

/// Parses a Graph `dateTime` requested with the `outlook.timezone="UTC"` preference.
fn parse_date_time(time: &models::DateTimeTimeZone) -> Result<DateTime<Utc>, ProviderError> {
    NaiveDateTime::parse_from_str(&time.date_time, GRAPH_DATE_TIME)
        .map(|time| time.and_utc())
        .map_err(|err| {
            ProviderError::decode(
                CalendarType::Microsoft,
                format!("invalid dateTime `{}`: {err}", time.date_time),
            )
        })
}

/// Maps the UTC rendering of a local midnight back to midnight UTC of the same calendar date.
fn midnight_utc(time: DateTime<Utc>, timezone: Tz) -> DateTime<Utc> {
    // Round to the closest day; the event's own time zone may differ from ours.
    (time.with_timezone(&timezone) + TimeDelta::hours(12))
        .date_naive()
        .and_time(NaiveTime::MIN)
        .and_utc()
}

fn parse_base_url(base_url: &str) -> Result<Url, ProviderError> {
    let url = Url::parse(base_url).map_err(|err| {
        ProviderError::configuration(
            CalendarType::Microsoft,
            format!("invalid URL `{base_url}`: {err}"),
        )
    })?;

    if url.cannot_be_a_base() {
        return Err(ProviderError::configuration(
            CalendarType::Microsoft,
            format!("URL `{base_url}` cannot be a base"),
        ));
    }

    Ok(url)
}

fn push_segments(url: &mut Url, segments: &[&str]) -> Result<(), ProviderError> {
    url.path_segments_mut()
        .map_err(|()| ProviderError::configuration(CalendarType::Microsoft, "URL cannot be a base"))?
        .pop_if_empty()
        .extend(segments);
    Ok(())
}
