use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Start or end of an event. All-day events set `date`, timed events `date_time`.
#[derive(Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EventDateTime {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all(deserialize = "camelCase"))]
pub struct Event {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub transparency: Option<String>,
    pub start: EventDateTime,
    pub end: EventDateTime,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all(deserialize = "camelCase"))]
pub struct Events {
    #[serde(default)]
    pub items: Vec<Event>,
    pub next_page_token: Option<String>,
}

/// Request body of `events.insert`.
#[derive(Debug, Serialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct EventInsert {
    pub summary: String,
    pub description: String,
    pub start: EventDateTime,
    pub end: EventDateTime,
    /// `opaque` blocks time, `transparent` does not.
    pub transparency: &'static str,
}
