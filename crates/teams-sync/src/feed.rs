//! Remote capability surface and paginated feed helpers.
//!
//! The engine never talks to a transport directly. It consumes the two
//! source traits below and walks their pages through [`PagedFeed`].

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use shared_types::{
    ChatMember, ChatMessage, ChatSummary, ConversationId, Cursor, MeetingEvent, Page, ReminderEntry,
};

use crate::error::{SyncError, SyncResult};

/// Chat backend: paginated message history plus posting.
#[async_trait]
pub trait ChatSource: Send + Sync {
    /// Newest messages first. `cursor == None` requests the first page.
    async fn fetch_messages_page(
        &self,
        conversation: &ConversationId,
        cursor: Option<&Cursor>,
        page_size: usize,
    ) -> SyncResult<Page<ChatMessage>>;

    async fn post_message(&self, conversation: &ConversationId, text: &str)
        -> SyncResult<ChatMessage>;

    /// Chats of the signed-in user, at most `limit`
    async fn list_chats(&self, limit: usize) -> SyncResult<Vec<ChatSummary>>;

    async fn chat_members(&self, conversation: &ConversationId) -> SyncResult<Vec<ChatMember>>;
}

/// Calendar backend: two independently paginated feeds plus single-event
/// lookup.
#[async_trait]
pub trait CalendarSource: Send + Sync {
    /// Events overlapping `window`, recurring series expanded into occurrences
    async fn fetch_events_page(
        &self,
        window: CalendarWindow,
        cursor: Option<&Cursor>,
    ) -> SyncResult<Page<MeetingEvent>>;

    /// `None` when the backend does not know the event
    async fn fetch_event(&self, event_id: &str) -> SyncResult<Option<MeetingEvent>>;

    async fn fetch_reminders_page(
        &self,
        window: CalendarWindow,
        cursor: Option<&Cursor>,
    ) -> SyncResult<Page<ReminderEntry>>;
}

/// Time range queried from the calendar feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl CalendarWindow {
    pub fn starting_at(start: DateTime<Utc>, lookahead_days: i64) -> Self {
        Self {
            start,
            end: start + Duration::days(lookahead_days),
        }
    }

    /// Same end, start moved back by `lead`
    pub fn reaching_back(self, lead: Duration) -> Self {
        Self {
            start: self.start - lead,
            end: self.end,
        }
    }
}

/// A remote query that yields a finite sequence of pages.
#[async_trait]
pub trait PagedFeed: Send + Sync {
    type Item: Send;

    async fn page(&self, cursor: Option<&Cursor>) -> SyncResult<Page<Self::Item>>;

    async fn first_page(&self) -> SyncResult<Page<Self::Item>> {
        self.page(None).await
    }

    async fn next_page(&self, cursor: &Cursor) -> SyncResult<Page<Self::Item>> {
        self.page(Some(cursor)).await
    }
}

/// Fetch every page of `feed`, oldest request first.
///
/// Fails as a whole if any page fails, if the feed hands back the cursor it
/// was just given, or if it runs past `max_pages`. Callers never see a
/// partially drained feed.
pub async fn drain<F>(feed: &F, max_pages: usize) -> SyncResult<Vec<F::Item>>
where
    F: PagedFeed + ?Sized,
{
    let mut items = Vec::new();
    let mut page = feed.first_page().await?;
    let mut pages = 1;

    loop {
        items.append(&mut page.items);

        let Some(cursor) = page.next.take() else {
            break;
        };

        if pages >= max_pages {
            return Err(SyncError::fetch(anyhow::anyhow!(
                "feed still paginating after {} pages",
                max_pages
            )));
        }

        page = feed.next_page(&cursor).await?;
        pages += 1;

        if page.next.as_ref() == Some(&cursor) {
            return Err(SyncError::fetch(anyhow::anyhow!(
                "feed returned the same cursor twice: {}",
                cursor.as_str()
            )));
        }
    }

    tracing::trace!("Drained {} items across {} pages", items.len(), pages);
    Ok(items)
}

/// Message history of one conversation
pub struct MessageFeed<'a, S: ?Sized> {
    pub source: &'a S,
    pub conversation: &'a ConversationId,
    pub page_size: usize,
}

#[async_trait]
impl<'a, S: ChatSource + ?Sized> PagedFeed for MessageFeed<'a, S> {
    type Item = ChatMessage;

    async fn page(&self, cursor: Option<&Cursor>) -> SyncResult<Page<ChatMessage>> {
        self.source
            .fetch_messages_page(self.conversation, cursor, self.page_size)
            .await
    }
}

pub struct EventFeed<'a, S: ?Sized> {
    pub source: &'a S,
    pub window: CalendarWindow,
}

#[async_trait]
impl<'a, S: CalendarSource + ?Sized> PagedFeed for EventFeed<'a, S> {
    type Item = MeetingEvent;

    async fn page(&self, cursor: Option<&Cursor>) -> SyncResult<Page<MeetingEvent>> {
        self.source.fetch_events_page(self.window, cursor).await
    }
}

pub struct ReminderFeed<'a, S: ?Sized> {
    pub source: &'a S,
    pub window: CalendarWindow,
}

#[async_trait]
impl<'a, S: CalendarSource + ?Sized> PagedFeed for ReminderFeed<'a, S> {
    type Item = ReminderEntry;

    async fn page(&self, cursor: Option<&Cursor>) -> SyncResult<Page<ReminderEntry>> {
        self.source.fetch_reminders_page(self.window, cursor).await
    }
}
