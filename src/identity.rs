//! Classification of calendar identities.
//!
//! Sync configurations refer to calendars by a single identity string. Microsoft calendars are
//! addressed by the mailbox of their owner while Google calendars are addressed either by a
//! consumer mailbox or by an opaque calendar id.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Mailbox domains that always belong to Google.
const GOOGLE_DOMAINS: [&str; 2] = ["@gmail.com", "@googlemail.com"];

/// The provider that hosts a calendar.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum CalendarType {
    /// Google Calendar.
    Google,
    /// Microsoft 365 via Microsoft Graph.
    Microsoft,
}

impl CalendarType {
    /// All calendar types.
    pub const ALL: [CalendarType; 2] = [CalendarType::Google, CalendarType::Microsoft];

    /// Classifies a calendar identity.
    ///
    /// Identities containing `@gmail.com` or `@googlemail.com` and identities without any `@`
    /// (e.g. `primary`) are Google calendars. Every other identity is a Microsoft mailbox.
    pub fn classify(identity: &str) -> CalendarType {
        let google = !identity.contains('@')
            || GOOGLE_DOMAINS.iter().any(|domain| identity.contains(domain));

        if google {
            CalendarType::Google
        } else {
            CalendarType::Microsoft
        }
    }

    /// Returns the calendar type as a &str.
    pub fn as_str(&self) -> &'static str {
        match self {
            CalendarType::Google => "google",
            CalendarType::Microsoft => "microsoft",
        }
    }
}

impl fmt::Display for CalendarType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CalendarType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "google" => Ok(CalendarType::Google),
            "microsoft" => Ok(CalendarType::Microsoft),
            other => Err(format!("unknown calendar type `{other}`")),
        }
    }
}
