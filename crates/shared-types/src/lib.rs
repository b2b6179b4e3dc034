use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

// ============================================================================
// Conversations
// ============================================================================

/// Identifier of a Teams chat, e.g. `19:8b1c2f0e@thread.v2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("'{0}' is not a valid conversation id")]
pub struct InvalidConversationId(pub String);

fn conversation_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\d+:[\w-]+@(([\w-]*)\.)+[\w-]*$").expect("conversation id pattern is valid")
    })
}

impl ConversationId {
    /// Parse and validate a raw chat id.
    pub fn parse(raw: &str) -> Result<Self, InvalidConversationId> {
        let raw = raw.trim();
        if conversation_id_pattern().is_match(raw) {
            Ok(ConversationId(raw.to_string()))
        } else {
            Err(InvalidConversationId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMember {
    pub user_id: Option<String>,
    pub display_name: String,
}

/// A chat as listed for the signed-in user. `members` may be empty when the
/// listing did not include them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSummary {
    pub id: ConversationId,
    pub topic: Option<String>,
    pub members: Vec<ChatMember>,
}

impl ChatSummary {
    /// Topic if set, else the other members' names, else the raw id.
    pub fn label(&self, me: Option<&str>) -> String {
        if let Some(topic) = self.topic.as_deref().filter(|t| !t.trim().is_empty()) {
            return topic.to_string();
        }

        let names: Vec<&str> = self
            .members
            .iter()
            .filter(|m| me.is_none() || m.user_id.as_deref() != me)
            .map(|m| m.display_name.as_str())
            .filter(|name| !name.is_empty())
            .collect();

        if names.is_empty() {
            self.id.to_string()
        } else {
            names.join(", ")
        }
    }

    pub fn needs_members(&self) -> bool {
        self.topic.as_deref().map_or(true, |t| t.trim().is_empty()) && self.members.is_empty()
    }
}

// ============================================================================
// Pagination
// ============================================================================

/// Opaque continuation token handed back by a paginated feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Cursor(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One page of a remote feed. `next == None` means the feed is exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<Cursor>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, next: Option<Cursor>) -> Self {
        Self { items, next }
    }

    pub fn last(items: Vec<T>) -> Self {
        Self { items, next: None }
    }
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            next: None,
        }
    }
}

// ============================================================================
// Chat messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    #[default]
    Normal,
    High,
    Urgent,
}

impl Importance {
    pub fn as_str(&self) -> &str {
        match self {
            Importance::Normal => "normal",
            Importance::High => "high",
            Importance::Urgent => "urgent",
        }
    }

    /// Unknown values are treated as normal importance.
    pub fn from_str(s: &str) -> Self {
        match s {
            "high" => Importance::High,
            "urgent" => Importance::Urgent,
            _ => Importance::Normal,
        }
    }
}

/// A fetched chat message. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub author: String,
    pub author_id: Option<String>,
    pub body: String,
    /// Authoritative ordering key
    pub created_at: DateTime<Utc>,
    pub importance: Importance,
    /// User ids mentioned in the message
    pub mentions: BTreeSet<String>,
}

impl ChatMessage {
    pub fn mentions_user(&self, user_id: &str) -> bool {
        self.mentions.contains(user_id)
    }

    pub fn is_important(&self) -> bool {
        self.importance != Importance::Normal
    }
}

// ============================================================================
// Calendar
// ============================================================================

/// A wall-clock time paired with the time zone it was reported in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTime {
    pub date_time: NaiveDateTime,
    pub time_zone: String,
}

impl EventTime {
    pub fn utc(instant: DateTime<Utc>) -> Self {
        Self {
            date_time: instant.naive_utc(),
            time_zone: "UTC".to_string(),
        }
    }

    /// Resolve to an instant. Zones chrono-tz does not know are read as UTC.
    pub fn to_utc(&self) -> DateTime<Utc> {
        match self.time_zone.parse::<chrono_tz::Tz>() {
            Ok(tz) => match tz.from_local_datetime(&self.date_time).earliest() {
                Some(local) => local.with_timezone(&Utc),
                None => {
                    tracing::warn!(
                        "Nonexistent local time {} in {}, reading as UTC",
                        self.date_time,
                        self.time_zone
                    );
                    Utc.from_utc_datetime(&self.date_time)
                }
            },
            Err(_) => {
                tracing::warn!("Unknown time zone '{}', reading as UTC", self.time_zone);
                Utc.from_utc_datetime(&self.date_time)
            }
        }
    }
}

impl fmt::Display for EventTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.date_time.format("%Y-%m-%d %H:%M"), self.time_zone)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingEvent {
    pub id: String,
    pub subject: String,
    pub organizer: String,
    pub start: EventTime,
    pub end: EventTime,
    pub attendees: Vec<String>,
}

/// A reminder for a calendar event. `event_id` refers to `MeetingEvent::id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderEntry {
    pub id: String,
    pub event_id: String,
    pub fire_time: EventTime,
}

impl ReminderEntry {
    pub fn fire_instant(&self) -> DateTime<Utc> {
        self.fire_time.to_utc()
    }
}
