//! In-memory stand-ins for the remote collaborators, used by unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use shared_types::{
    ChatMember, ChatMessage, ChatSummary, ConversationId, Cursor, EventTime, Importance,
    MeetingEvent, Page, ReminderEntry,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use crate::error::{SyncError, SyncResult};
use crate::feed::{CalendarSource, CalendarWindow, ChatSource};

pub(crate) fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub(crate) fn message(id: &str, secs: i64) -> ChatMessage {
    ChatMessage {
        id: id.to_string(),
        author: "Ada Lovelace".to_string(),
        author_id: Some("user-ada".to_string()),
        body: format!("body of {}", id),
        created_at: ts(secs),
        importance: Importance::Normal,
        mentions: BTreeSet::new(),
    }
}

pub(crate) fn conversation(n: u32) -> ConversationId {
    ConversationId::parse(&format!("19:chat{}@thread.v2", n)).unwrap()
}

pub(crate) fn chat_summary(n: u32, topic: Option<&str>) -> ChatSummary {
    ChatSummary {
        id: conversation(n),
        topic: topic.map(str::to_string),
        members: Vec::new(),
    }
}

pub(crate) fn chat_member(id: &str, name: &str) -> ChatMember {
    ChatMember {
        user_id: Some(id.to_string()),
        display_name: name.to_string(),
    }
}

pub(crate) fn event(id: &str, subject: &str, start: DateTime<Utc>) -> MeetingEvent {
    MeetingEvent {
        id: id.to_string(),
        subject: subject.to_string(),
        organizer: "Grace Hopper".to_string(),
        start: EventTime::utc(start),
        end: EventTime::utc(start + Duration::minutes(30)),
        attendees: vec!["Ada Lovelace".to_string(), "Alan Turing".to_string()],
    }
}

pub(crate) fn reminder(event_id: &str, fire: DateTime<Utc>) -> ReminderEntry {
    ReminderEntry {
        id: format!("rem-{}", event_id),
        event_id: event_id.to_string(),
        fire_time: EventTime::utc(fire),
    }
}

fn paginate<T: Clone>(items: &[T], cursor: Option<&Cursor>, page_size: usize) -> Page<T> {
    let offset = cursor
        .and_then(|c| c.as_str().strip_prefix("offset:"))
        .and_then(|n| n.parse::<usize>().ok())
        .unwrap_or(0)
        .min(items.len());
    let end = (offset + page_size).min(items.len());
    let next = (end < items.len()).then(|| Cursor::new(format!("offset:{}", end)));
    Page::new(items[offset..end].to_vec(), next)
}

#[derive(Default)]
struct FakeChatState {
    /// Server-side history per conversation, newest first
    conversations: HashMap<ConversationId, Vec<ChatMessage>>,
    chats: Vec<ChatSummary>,
    members: HashMap<ConversationId, Vec<ChatMember>>,
    fail_fetch: bool,
    fail_members: bool,
    fail_post: bool,
    fetch_calls: usize,
    post_calls: usize,
}

/// Chat backend holding message history in memory
#[derive(Default)]
pub(crate) struct FakeChat {
    state: Mutex<FakeChatState>,
    /// Held by a test to park fetches mid-flight
    pub(crate) gate: tokio::sync::Mutex<()>,
}

impl FakeChat {
    /// Replace the server-side history; `messages` in server order (newest first)
    pub(crate) fn set_messages(&self, conversation: &ConversationId, messages: Vec<ChatMessage>) {
        self.state
            .lock()
            .unwrap()
            .conversations
            .insert(conversation.clone(), messages);
    }

    /// A new message arrives at the top of the history
    pub(crate) fn push(&self, conversation: &ConversationId, message: ChatMessage) {
        self.state
            .lock()
            .unwrap()
            .conversations
            .entry(conversation.clone())
            .or_default()
            .insert(0, message);
    }

    pub(crate) fn set_chats(&self, chats: Vec<ChatSummary>) {
        self.state.lock().unwrap().chats = chats;
    }

    pub(crate) fn set_members(&self, conversation: &ConversationId, members: Vec<ChatMember>) {
        self.state
            .lock()
            .unwrap()
            .members
            .insert(conversation.clone(), members);
    }

    pub(crate) fn fail_members(&self, fail: bool) {
        self.state.lock().unwrap().fail_members = fail;
    }

    pub(crate) fn fail_fetches(&self, fail: bool) {
        self.state.lock().unwrap().fail_fetch = fail;
    }

    pub(crate) fn fail_posts(&self, fail: bool) {
        self.state.lock().unwrap().fail_post = fail;
    }

    pub(crate) fn fetch_calls(&self) -> usize {
        self.state.lock().unwrap().fetch_calls
    }

    pub(crate) fn post_calls(&self) -> usize {
        self.state.lock().unwrap().post_calls
    }
}

#[async_trait]
impl ChatSource for FakeChat {
    async fn fetch_messages_page(
        &self,
        conversation: &ConversationId,
        cursor: Option<&Cursor>,
        page_size: usize,
    ) -> SyncResult<Page<ChatMessage>> {
        let _gate = self.gate.lock().await;

        let mut state = self.state.lock().unwrap();
        state.fetch_calls += 1;
        if state.fail_fetch {
            return Err(SyncError::fetch(anyhow::anyhow!("connection reset")));
        }

        let history = state
            .conversations
            .get(conversation)
            .cloned()
            .unwrap_or_default();
        Ok(paginate(&history, cursor, page_size))
    }

    async fn post_message(
        &self,
        conversation: &ConversationId,
        text: &str,
    ) -> SyncResult<ChatMessage> {
        let mut state = self.state.lock().unwrap();
        state.post_calls += 1;
        if state.fail_post {
            return Err(SyncError::post(anyhow::anyhow!("403 Forbidden")));
        }

        let n = state.post_calls as i64;
        let mut posted = message(&format!("posted-{}", n), 10_000 + n);
        posted.author = "Me".to_string();
        posted.body = text.to_string();

        state
            .conversations
            .entry(conversation.clone())
            .or_default()
            .insert(0, posted.clone());
        Ok(posted)
    }

    async fn list_chats(&self, limit: usize) -> SyncResult<Vec<ChatSummary>> {
        let state = self.state.lock().unwrap();
        if state.fail_fetch {
            return Err(SyncError::fetch(anyhow::anyhow!("chats unavailable")));
        }
        Ok(state.chats.iter().take(limit).cloned().collect())
    }

    async fn chat_members(&self, conversation: &ConversationId) -> SyncResult<Vec<ChatMember>> {
        let state = self.state.lock().unwrap();
        if state.fail_members {
            return Err(SyncError::fetch(anyhow::anyhow!("429 Too Many Requests")));
        }
        Ok(state.members.get(conversation).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
struct FakeCalendarState {
    events: Vec<MeetingEvent>,
    /// Reachable only through single-event lookup
    hidden_events: Vec<MeetingEvent>,
    reminders: Vec<ReminderEntry>,
    fail_events: bool,
    fail_reminders: bool,
    fail_lookups: bool,
    windows: Vec<CalendarWindow>,
    event_windows: Vec<CalendarWindow>,
    lookups: Vec<String>,
}

/// Calendar backend serving both feeds from memory in pages of `page_size`.
/// The event feed only lists events overlapping the requested window.
pub(crate) struct FakeCalendar {
    state: Mutex<FakeCalendarState>,
    page_size: usize,
}

impl FakeCalendar {
    pub(crate) fn new(page_size: usize) -> Self {
        Self {
            state: Mutex::new(FakeCalendarState::default()),
            page_size,
        }
    }

    pub(crate) fn set_events(&self, events: Vec<MeetingEvent>) {
        self.state.lock().unwrap().events = events;
    }

    /// Events the listing never returns but lookup by id finds
    pub(crate) fn set_hidden_events(&self, events: Vec<MeetingEvent>) {
        self.state.lock().unwrap().hidden_events = events;
    }

    pub(crate) fn fail_lookups(&self, fail: bool) {
        self.state.lock().unwrap().fail_lookups = fail;
    }

    pub(crate) fn lookups(&self) -> Vec<String> {
        self.state.lock().unwrap().lookups.clone()
    }

    pub(crate) fn event_windows(&self) -> Vec<CalendarWindow> {
        self.state.lock().unwrap().event_windows.clone()
    }

    pub(crate) fn set_reminders(&self, reminders: Vec<ReminderEntry>) {
        self.state.lock().unwrap().reminders = reminders;
    }

    pub(crate) fn fail_events(&self, fail: bool) {
        self.state.lock().unwrap().fail_events = fail;
    }

    pub(crate) fn fail_reminders(&self, fail: bool) {
        self.state.lock().unwrap().fail_reminders = fail;
    }

    pub(crate) fn requested_windows(&self) -> Vec<CalendarWindow> {
        self.state.lock().unwrap().windows.clone()
    }
}

#[async_trait]
impl CalendarSource for FakeCalendar {
    async fn fetch_events_page(
        &self,
        window: CalendarWindow,
        cursor: Option<&Cursor>,
    ) -> SyncResult<Page<MeetingEvent>> {
        let mut state = self.state.lock().unwrap();
        state.event_windows.push(window);
        if state.fail_events {
            return Err(SyncError::fetch(anyhow::anyhow!("events unavailable")));
        }
        let in_window: Vec<MeetingEvent> = state
            .events
            .iter()
            .filter(|e| e.start.to_utc() < window.end && e.end.to_utc() > window.start)
            .cloned()
            .collect();
        Ok(paginate(&in_window, cursor, self.page_size))
    }

    async fn fetch_event(&self, event_id: &str) -> SyncResult<Option<MeetingEvent>> {
        let mut state = self.state.lock().unwrap();
        state.lookups.push(event_id.to_string());
        if state.fail_lookups {
            return Err(SyncError::fetch(anyhow::anyhow!("lookup failed")));
        }
        Ok(state
            .events
            .iter()
            .chain(state.hidden_events.iter())
            .find(|e| e.id == event_id)
            .cloned())
    }

    async fn fetch_reminders_page(
        &self,
        window: CalendarWindow,
        cursor: Option<&Cursor>,
    ) -> SyncResult<Page<ReminderEntry>> {
        let mut state = self.state.lock().unwrap();
        state.windows.push(window);
        if state.fail_reminders {
            return Err(SyncError::fetch(anyhow::anyhow!("reminders unavailable")));
        }
        Ok(paginate(&state.reminders, cursor, self.page_size))
    }
}
