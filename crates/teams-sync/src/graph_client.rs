//! Microsoft Graph source.
//!
//! Implements both source traits against the Graph REST API. Auth is a
//! bearer token acquired outside this process. Continuation cursors are the
//! `@odata.nextLink` URLs returned by Graph.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use shared_types::{
    ChatMember, ChatMessage, ChatSummary, ConversationId, Cursor, EventTime, Importance,
    MeetingEvent, Page, ReminderEntry,
};
use std::time::Duration;
use tracing::instrument;

use crate::config::GraphConfig;
use crate::error::{SyncError, SyncResult};
use crate::feed::{CalendarSource, CalendarWindow, ChatSource};

const PREFER_UTC: &str = "outlook.timezone=\"UTC\"";
const EVENTS_PAGE_SIZE: usize = 50;
const GRAPH_DATE_TIME: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Deserialize)]
struct ODataPage<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphIdentity {
    id: Option<String>,
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphIdentitySet {
    user: Option<GraphIdentity>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphItemBody {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct GraphMention {
    mentioned: Option<GraphIdentitySet>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphChatMessage {
    id: String,
    created_date_time: DateTime<Utc>,
    importance: Option<String>,
    from: Option<GraphIdentitySet>,
    body: Option<GraphItemBody>,
    #[serde(default)]
    mentions: Vec<GraphMention>,
}

impl From<GraphChatMessage> for ChatMessage {
    fn from(msg: GraphChatMessage) -> Self {
        let sender = msg.from.and_then(|f| f.user);
        let author_id = sender.as_ref().and_then(|u| u.id.clone());
        let author = sender
            .and_then(|u| u.display_name)
            .unwrap_or_else(|| "System".to_string());

        ChatMessage {
            id: msg.id,
            author,
            author_id,
            body: msg.body.map(|b| b.content).unwrap_or_default(),
            created_at: msg.created_date_time,
            importance: msg
                .importance
                .as_deref()
                .map(Importance::from_str)
                .unwrap_or_default(),
            mentions: msg
                .mentions
                .into_iter()
                .filter_map(|m| m.mentioned.and_then(|s| s.user).and_then(|u| u.id))
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphDateTimeZone {
    date_time: String,
    time_zone: String,
}

impl GraphDateTimeZone {
    fn to_event_time(&self) -> anyhow::Result<EventTime> {
        let date_time = NaiveDateTime::parse_from_str(&self.date_time, "%Y-%m-%dT%H:%M:%S%.f")
            .with_context(|| format!("Invalid Graph dateTime '{}'", self.date_time))?;
        Ok(EventTime {
            date_time,
            time_zone: self.time_zone.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct GraphEmailAddress {
    name: Option<String>,
    address: Option<String>,
}

impl GraphEmailAddress {
    fn label(self) -> String {
        self.name.or(self.address).unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    email_address: Option<GraphEmailAddress>,
}

#[derive(Debug, Deserialize)]
struct GraphEvent {
    id: String,
    subject: Option<String>,
    organizer: Option<GraphRecipient>,
    start: GraphDateTimeZone,
    end: GraphDateTimeZone,
    #[serde(default)]
    attendees: Vec<GraphRecipient>,
}

impl TryFrom<GraphEvent> for MeetingEvent {
    type Error = anyhow::Error;

    fn try_from(event: GraphEvent) -> anyhow::Result<Self> {
        Ok(MeetingEvent {
            start: event.start.to_event_time()?,
            end: event.end.to_event_time()?,
            id: event.id,
            subject: event.subject.unwrap_or_default(),
            organizer: event
                .organizer
                .and_then(|o| o.email_address)
                .map(GraphEmailAddress::label)
                .unwrap_or_default(),
            attendees: event
                .attendees
                .into_iter()
                .filter_map(|a| a.email_address)
                .map(GraphEmailAddress::label)
                .collect(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphReminder {
    event_id: String,
    change_key: Option<String>,
    reminder_fire_time: GraphDateTimeZone,
}

impl TryFrom<GraphReminder> for ReminderEntry {
    type Error = anyhow::Error;

    fn try_from(reminder: GraphReminder) -> anyhow::Result<Self> {
        let fire_time = reminder.reminder_fire_time.to_event_time()?;
        let id = match reminder.change_key {
            Some(key) => format!("{}:{}", reminder.event_id, key),
            None => format!("{}@{}", reminder.event_id, fire_time.date_time),
        };
        Ok(ReminderEntry {
            id,
            event_id: reminder.event_id,
            fire_time,
        })
    }
}

#[derive(Debug, Deserialize)]
struct GraphChat {
    id: String,
    topic: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphChatMember {
    user_id: Option<String>,
    display_name: Option<String>,
}

impl From<GraphChatMember> for ChatMember {
    fn from(member: GraphChatMember) -> Self {
        ChatMember {
            user_id: member.user_id,
            display_name: member.display_name.unwrap_or_default(),
        }
    }
}

fn chat_summaries(chats: Vec<GraphChat>) -> Vec<ChatSummary> {
    chats
        .into_iter()
        .filter_map(|chat| match ConversationId::parse(&chat.id) {
            Ok(id) => Some(ChatSummary {
                id,
                topic: chat.topic,
                members: Vec::new(),
            }),
            Err(e) => {
                tracing::warn!("Skipping chat: {}", e);
                None
            }
        })
        .collect()
}

/// The signed-in user
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphUser {
    pub id: String,
    pub display_name: Option<String>,
}

#[derive(Debug, serde::Serialize)]
struct PostBody<'a> {
    body: PostContent<'a>,
}

#[derive(Debug, serde::Serialize)]
struct PostContent<'a> {
    content: &'a str,
}

/// Talks to Microsoft Graph.
#[derive(Clone)]
pub struct GraphClient {
    client: Client,
    base_url: String,
    token: String,
}

impl GraphClient {
    pub fn new(config: &GraphConfig) -> anyhow::Result<Self> {
        let token = config
            .access_token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .context("No Graph access token configured (set GRAPH_ACCESS_TOKEN)")?;

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn get(&self, url: &str) -> RequestBuilder {
        self.client
            .get(url)
            .bearer_auth(&self.token)
            .header("Prefer", PREFER_UTC)
    }

    async fn get_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> anyhow::Result<T> {
        let response = request.send().await.context("Graph request failed")?;
        decode(response).await
    }

    /// First page from `first`, later pages straight from the cursor URL
    async fn get_page<W: DeserializeOwned>(
        &self,
        first: impl FnOnce() -> RequestBuilder,
        cursor: Option<&Cursor>,
    ) -> SyncResult<ODataPage<W>> {
        let request = match cursor {
            Some(cursor) => self.get(cursor.as_str()),
            None => first(),
        };
        self.get_json(request).await.map_err(SyncError::fetch)
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn me(&self) -> SyncResult<GraphUser> {
        let url = format!("{}/me", self.base_url);
        self.get_json(self.get(&url))
            .await
            .map_err(SyncError::fetch)
    }

    fn chat_messages_url(&self, conversation: &ConversationId) -> String {
        format!("{}/chats/{}/messages", self.base_url, conversation)
    }

    fn reminder_view_url(&self, window: CalendarWindow) -> String {
        format!(
            "{}/me/reminderView(startDateTime='{}',endDateTime='{}')",
            self.base_url,
            window.start.format(GRAPH_DATE_TIME),
            window.end.format(GRAPH_DATE_TIME),
        )
    }

    fn event_url(&self, event_id: &str) -> anyhow::Result<Url> {
        let mut url = Url::parse(&format!("{}/me/events", self.base_url))
            .with_context(|| format!("Invalid Graph base URL '{}'", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Graph base URL cannot take a path"))?
            .push(event_id);
        Ok(url)
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> anyhow::Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("Graph returned {}: {}", status, body);
    }
    response.json().await.context("Failed to decode Graph response")
}

/// Query for occurrences overlapping `window`; series come back expanded
fn calendar_view_query(window: CalendarWindow) -> [(&'static str, String); 3] {
    [
        ("startDateTime", format!("{}Z", window.start.format(GRAPH_DATE_TIME))),
        ("endDateTime", format!("{}Z", window.end.format(GRAPH_DATE_TIME))),
        ("$top", EVENTS_PAGE_SIZE.to_string()),
    ]
}

fn next_cursor(next_link: Option<String>) -> Option<Cursor> {
    next_link.map(Cursor::new)
}

#[async_trait]
impl ChatSource for GraphClient {
    #[instrument(level = "debug", skip(self, cursor))]
    async fn fetch_messages_page(
        &self,
        conversation: &ConversationId,
        cursor: Option<&Cursor>,
        page_size: usize,
    ) -> SyncResult<Page<ChatMessage>> {
        let url = self.chat_messages_url(conversation);
        let page: ODataPage<GraphChatMessage> = self
            .get_page(
                || self.get(&url).query(&[("$top", page_size.to_string())]),
                cursor,
            )
            .await?;

        Ok(Page::new(
            page.value.into_iter().map(ChatMessage::from).collect(),
            next_cursor(page.next_link),
        ))
    }

    #[instrument(level = "debug", skip(self, text))]
    async fn post_message(
        &self,
        conversation: &ConversationId,
        text: &str,
    ) -> SyncResult<ChatMessage> {
        let response = self
            .client
            .post(self.chat_messages_url(conversation))
            .bearer_auth(&self.token)
            .json(&PostBody {
                body: PostContent { content: text },
            })
            .send()
            .await
            .map_err(SyncError::post)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::post(anyhow::anyhow!(
                "Graph returned {}: {}",
                status,
                body
            )));
        }

        let posted: GraphChatMessage = response.json().await.map_err(SyncError::post)?;
        Ok(posted.into())
    }

    #[instrument(level = "debug", skip(self))]
    async fn list_chats(&self, limit: usize) -> SyncResult<Vec<ChatSummary>> {
        let url = format!("{}/me/chats", self.base_url);
        let page: ODataPage<GraphChat> = self
            .get_json(self.get(&url).query(&[("$top", limit.to_string())]))
            .await
            .map_err(SyncError::fetch)?;

        let mut chats = chat_summaries(page.value);
        chats.truncate(limit);
        Ok(chats)
    }

    #[instrument(level = "debug", skip(self))]
    async fn chat_members(&self, conversation: &ConversationId) -> SyncResult<Vec<ChatMember>> {
        let url = format!("{}/chats/{}/members", self.base_url, conversation);
        let page: ODataPage<GraphChatMember> = self
            .get_json(self.get(&url))
            .await
            .map_err(SyncError::fetch)?;
        Ok(page.value.into_iter().map(ChatMember::from).collect())
    }
}

#[async_trait]
impl CalendarSource for GraphClient {
    #[instrument(level = "debug", skip(self, cursor))]
    async fn fetch_events_page(
        &self,
        window: CalendarWindow,
        cursor: Option<&Cursor>,
    ) -> SyncResult<Page<MeetingEvent>> {
        let url = format!("{}/me/calendarView", self.base_url);
        let page: ODataPage<GraphEvent> = self
            .get_page(|| self.get(&url).query(&calendar_view_query(window)), cursor)
            .await?;

        let events = page
            .value
            .into_iter()
            .map(MeetingEvent::try_from)
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(SyncError::fetch)?;
        Ok(Page::new(events, next_cursor(page.next_link)))
    }

    #[instrument(level = "debug", skip(self))]
    async fn fetch_event(&self, event_id: &str) -> SyncResult<Option<MeetingEvent>> {
        let url = self.event_url(event_id).map_err(SyncError::fetch)?;
        let response = self
            .get(url.as_str())
            .send()
            .await
            .map_err(SyncError::fetch)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let event: GraphEvent = decode(response).await.map_err(SyncError::fetch)?;
        MeetingEvent::try_from(event)
            .map(Some)
            .map_err(SyncError::fetch)
    }

    #[instrument(level = "debug", skip(self, cursor))]
    async fn fetch_reminders_page(
        &self,
        window: CalendarWindow,
        cursor: Option<&Cursor>,
    ) -> SyncResult<Page<ReminderEntry>> {
        let url = self.reminder_view_url(window);
        let page: ODataPage<GraphReminder> = self.get_page(|| self.get(&url), cursor).await?;

        let reminders = page
            .value
            .into_iter()
            .map(ReminderEntry::try_from)
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(SyncError::fetch)?;
        Ok(Page::new(reminders, next_cursor(page.next_link)))
    }
}
