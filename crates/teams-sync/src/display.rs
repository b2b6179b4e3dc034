//! Plain-text rendering for the terminal session.

use chrono::{DateTime, TimeZone};
use shared_types::ChatMessage;
use std::fmt::{Display, Write};

use crate::config::ChatConfig;
use crate::meetings::Meeting;

const FALLBACK_TIME_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Renders chat messages as single lines: `"@! [12:04] Ada: hello"`
#[derive(Debug, Clone)]
pub struct MessageFormatter {
    me: Option<String>,
    timestamps: bool,
    format_today: String,
    format_past: String,
}

impl MessageFormatter {
    pub fn new(me: Option<String>, config: &ChatConfig) -> Self {
        Self {
            me,
            timestamps: config.timestamps,
            format_today: config.timestamp_format_today.clone(),
            format_past: config.timestamp_format_past.clone(),
        }
    }

    /// `now` decides which messages count as "today" and the zone times are shown in
    pub fn line<Tz>(&self, message: &ChatMessage, now: &DateTime<Tz>) -> String
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        let mut modifiers = String::new();
        if let Some(me) = &self.me {
            if message.mentions_user(me) {
                modifiers.push('@');
            }
        }
        if message.is_important() {
            modifiers.push('!');
        }
        if !modifiers.is_empty() {
            modifiers.push(' ');
        }

        let mut time_tag = String::new();
        if self.timestamps {
            let sent = message.created_at.with_timezone(&now.timezone());
            let format = if sent.date_naive() == now.date_naive() {
                &self.format_today
            } else {
                &self.format_past
            };
            if write!(time_tag, "[{}] ", sent.format(format)).is_err() {
                tracing::debug!("Bad timestamp format '{}', using default", format);
                time_tag = format!("[{}] ", sent.format(FALLBACK_TIME_FORMAT));
            }
        }

        format!(
            "{}{}{}: {}",
            modifiers, time_tag, message.author, message.body
        )
    }
}

/// One line per meeting: start, subject, organizer and reminder state
pub fn meeting_line(meeting: &Meeting) -> String {
    let reminder = match meeting.fire_instant() {
        Some(fire) => format!("reminder {}", fire.format("%Y-%m-%d %H:%M UTC")),
        None => "no reminder".to_string(),
    };
    let mut line = format!(
        "{} - {} | {} ({}; {})",
        meeting.event.start,
        meeting.event.end.date_time.format("%H:%M"),
        meeting.subject(),
        meeting.organizer(),
        reminder
    );
    if meeting.dismissed {
        line.push_str(" [dismissed]");
    } else if let Some(until) = meeting.snoozed_until {
        line.push_str(&format!(" [snoozed until {}]", until.format("%H:%M UTC")));
    }
    line
}
