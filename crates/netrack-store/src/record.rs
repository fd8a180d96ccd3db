//! Request record model.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Placeholder text for a request without a query.
pub const NO_QUERY: &str = "No query";

/// Placeholder link for a request without a resolvable URL or host.
pub const NO_LINK: &str = "No link";

/// Unique identifier of a logged request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// One logged network request.
///
/// Records are immutable once created; the only mutation is deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Lookup and delete key
    pub id: RecordId,
    /// Query string, raw request text or [`NO_QUERY`]
    pub text: String,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// URL or host, never empty
    pub link: String,
}

impl RequestRecord {
    /// Create a record with a fresh id.
    ///
    /// Blank `text` becomes [`NO_QUERY`], blank `link` becomes [`NO_LINK`].
    /// The timestamp is truncated to the microsecond precision of the store.
    pub fn new(text: impl Into<String>, timestamp: DateTime<Utc>, link: impl Into<String>) -> Self {
        let text = text.into();
        let link = link.into();
        let micros = timestamp.timestamp_micros();

        Self {
            id: RecordId::new(),
            text: if text.trim().is_empty() { NO_QUERY.to_string() } else { text },
            timestamp: DateTime::from_timestamp_micros(micros).unwrap_or(timestamp),
            link: if link.trim().is_empty() { NO_LINK.to_string() } else { link },
        }
    }

    /// Timestamp in the viewer's display format, local time.
    pub fn display_date(&self) -> String {
        self.timestamp
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    }
}
