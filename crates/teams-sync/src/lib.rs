//! Synchronization engine for a Teams terminal client.
//!
//! Polls chat messages and calendar reminders from Microsoft Graph and keeps
//! a deduplicated local view of both.

pub mod chats;
pub mod config;
pub mod display;
pub mod error;
pub mod feed;
pub mod graph_client;
pub mod meetings;
pub mod messages;
pub mod poll_loop;
pub mod reminders;

#[cfg(test)]
pub(crate) mod testing;

pub use chats::{load_chat_list, resolve_chat};
pub use config::Config;
pub use error::{SyncError, SyncResult};
pub use feed::{drain, CalendarSource, CalendarWindow, ChatSource, PagedFeed};
pub use graph_client::GraphClient;
pub use meetings::{Meeting, MeetingReconciler, MeetingSet, NotificationState};
pub use messages::{ChatSession, MessageSync, MessageWindow};
pub use poll_loop::PollLoop;
pub use reminders::{
    ChannelNotifier, DueBatch, DueMeeting, DueNotification, ReminderNotifier, ReminderResponse,
    ReminderScheduler,
};
