use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Recipient identity = directory user UUID, kept as the string the service issues
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecipientId(pub String);

impl RecipientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl std::fmt::Display for RecipientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecipientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RecipientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Kind of conversation a thread represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThreadType {
    #[default]
    Conversation,
    Announcement,
}

impl ThreadType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "conversation" => Some(Self::Conversation),
            "announcement" => Some(Self::Announcement),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conversation => "conversation",
            Self::Announcement => "announcement",
        }
    }
}

/// Fresh unique id for a record (UUID v4, lowercase hyphenated).
pub fn new_unique_id() -> String {
    Uuid::new_v4().to_string()
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    datetime_to_millis(Utc::now())
}

pub fn datetime_to_millis(dt: DateTime<Utc>) -> u64 {
    dt.timestamp_millis().max(0) as u64
}

pub fn millis_to_datetime(ms: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms.min(i64::MAX as u64) as i64)
        .single()
        .unwrap_or_default()
}
