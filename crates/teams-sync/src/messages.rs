//! Incremental chat message synchronization.
//!
//! `MessageSync` keeps one conversation's window of messages in step with the
//! backend. Refreshes re-read the first page (the backend returns newest
//! messages first) and prepend whatever is newer than the high-water mark.
//! Older history is paged in separately through the continuation cursor.
//!
//! `ChatSession` ties a `MessageSync` to its periodic refresh loop.

use chrono::{DateTime, Utc};
use shared_types::{ChatMessage, ConversationId, Cursor};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

use crate::config::ChatConfig;
use crate::error::{SyncError, SyncResult};
use crate::feed::{ChatSource, MessageFeed, PagedFeed};
use crate::poll_loop::PollLoop;

/// Ordered, deduplicated messages of one conversation, newest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageWindow {
    messages: Vec<ChatMessage>,
    older_cursor: Option<Cursor>,
}

impl MessageWindow {
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Oldest first, the order a chat pane renders top to bottom
    pub fn chronological(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter().rev()
    }

    pub fn newest(&self) -> Option<&ChatMessage> {
        self.messages.first()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.messages.iter().any(|m| m.id == message_id)
    }

    /// Whether older pages can still be loaded
    pub fn has_older(&self) -> bool {
        self.older_cursor.is_some()
    }

    fn replace(&mut self, batch: Vec<ChatMessage>, older_cursor: Option<Cursor>) {
        let mut seen = HashSet::new();
        let mut messages: Vec<ChatMessage> = batch
            .into_iter()
            .filter(|m| seen.insert(m.id.clone()))
            .collect();
        // Stable: ties keep fetch order
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        self.messages = messages;
        self.older_cursor = older_cursor;
    }

    /// Prepend messages strictly newer than `high_water`. Returns how many.
    fn prepend_newer(&mut self, batch: Vec<ChatMessage>, high_water: DateTime<Utc>) -> usize {
        let mut seen: HashSet<String> = self.messages.iter().map(|m| m.id.clone()).collect();
        let mut fresh: Vec<ChatMessage> = batch
            .into_iter()
            .filter(|m| m.created_at > high_water)
            .filter(|m| {
                let new = seen.insert(m.id.clone());
                if !new {
                    tracing::trace!("  Skipped (duplicate): {}", m.id);
                }
                new
            })
            .collect();

        if fresh.is_empty() {
            return 0;
        }

        fresh.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let count = fresh.len();
        fresh.append(&mut self.messages);
        self.messages = fresh;
        count
    }

    /// Append messages not already present at the tail. Returns how many.
    fn append_older(&mut self, batch: Vec<ChatMessage>) -> usize {
        let mut seen: HashSet<String> = self.messages.iter().map(|m| m.id.clone()).collect();
        let before = self.messages.len();

        self.messages
            .extend(batch.into_iter().filter(|m| seen.insert(m.id.clone())));
        self.messages
            .sort_by(|a, b| b.created_at.cmp(&a.created_at));

        self.messages.len() - before
    }
}

struct SyncState {
    conversation: ConversationId,
    /// Bumped on every initial load; results fetched under an older epoch are stale
    epoch: u64,
    window: MessageWindow,
    high_water: Option<DateTime<Utc>>,
}

impl SyncState {
    fn advance_high_water(&mut self) {
        let newest = self.window.newest().map(|m| m.created_at);
        self.high_water = match (self.high_water, newest) {
            (Some(current), Some(newest)) => Some(current.max(newest)),
            (current, newest) => current.or(newest),
        };
    }
}

/// Keeps the message window of the active conversation up to date.
///
/// The window lock is only taken around merges, never across a remote call,
/// so a result is always checked against the conversation that is active
/// when it arrives.
pub struct MessageSync {
    source: Arc<dyn ChatSource>,
    page_size: usize,
    state: Mutex<SyncState>,
    revision: watch::Sender<u64>,
}

impl MessageSync {
    pub fn new(source: Arc<dyn ChatSource>, conversation: ConversationId, page_size: usize) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            source,
            page_size,
            state: Mutex::new(SyncState {
                conversation,
                epoch: 0,
                window: MessageWindow::default(),
                high_water: None,
            }),
            revision,
        }
    }

    /// Receives a new revision whenever the window changes
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub async fn window(&self) -> MessageWindow {
        self.state.lock().await.window.clone()
    }

    pub async fn conversation(&self) -> ConversationId {
        self.state.lock().await.conversation.clone()
    }

    pub async fn high_water_mark(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.high_water
    }

    /// Make `conversation` active and replace the window with its first page.
    ///
    /// Any fetch still in flight for the previous conversation is discarded
    /// when it returns.
    pub async fn load_initial(&self, conversation: ConversationId) -> SyncResult<MessageWindow> {
        let epoch = {
            let mut state = self.state.lock().await;
            if state.conversation != conversation {
                tracing::debug!("Switching conversation {} -> {}", state.conversation, conversation);
                state.window = MessageWindow::default();
                state.high_water = None;
                self.bump_revision();
            }
            state.conversation = conversation.clone();
            state.epoch += 1;
            state.epoch
        };

        let feed = self.feed(&conversation);
        let page = feed.first_page().await?;

        let mut state = self.state.lock().await;
        if state.epoch != epoch {
            tracing::debug!("Discarding stale initial load for {}", conversation);
            return Ok(state.window.clone());
        }

        state.window.replace(page.items, page.next);
        state.high_water = state.window.newest().map(|m| m.created_at);
        self.bump_revision();

        tracing::info!(
            "Loaded {} messages for {} (more: {})",
            state.window.len(),
            conversation,
            state.window.has_older()
        );

        Ok(state.window.clone())
    }

    /// Re-read the first page and prepend anything newer than the high-water
    /// mark. Returns the number of messages added; 0 when nothing changed.
    pub async fn refresh(&self) -> SyncResult<usize> {
        let (conversation, epoch) = {
            let state = self.state.lock().await;
            (state.conversation.clone(), state.epoch)
        };

        let feed = self.feed(&conversation);
        let page = feed.first_page().await?;

        let mut state = self.state.lock().await;
        if state.epoch != epoch {
            tracing::debug!("Discarding stale refresh for {}", conversation);
            return Ok(0);
        }

        let high_water = state.high_water;
        let appended = match high_water {
            Some(high_water) => state.window.prepend_newer(page.items, high_water),
            None => {
                state.window.replace(page.items, page.next);
                state.window.len()
            }
        };

        if appended > 0 {
            state.advance_high_water();
            self.bump_revision();
            tracing::info!("Fetched {} new messages for {}", appended, conversation);
        } else {
            tracing::debug!("No new messages for {}", conversation);
        }

        Ok(appended)
    }

    /// Fetch the next page of older history and append it at the tail.
    /// Returns 0 once the cursor is exhausted.
    pub async fn load_older_page(&self) -> SyncResult<usize> {
        let (conversation, epoch, cursor) = {
            let state = self.state.lock().await;
            match &state.window.older_cursor {
                Some(cursor) => (state.conversation.clone(), state.epoch, cursor.clone()),
                None => return Ok(0),
            }
        };

        let feed = self.feed(&conversation);
        let page = feed.next_page(&cursor).await?;

        let mut state = self.state.lock().await;
        if state.epoch != epoch || state.window.older_cursor.as_ref() != Some(&cursor) {
            tracing::debug!("Discarding stale older page for {}", conversation);
            return Ok(0);
        }

        state.window.older_cursor = page.next;
        let appended = state.window.append_older(page.items);
        state.advance_high_water();

        if appended > 0 {
            self.bump_revision();
        }
        tracing::debug!(
            "Loaded {} older messages for {} (more: {})",
            appended,
            conversation,
            state.window.has_older()
        );

        Ok(appended)
    }

    /// Post a reply to the active conversation.
    ///
    /// Blank text is rejected without contacting the backend. The posted
    /// message is not inserted locally; a later refresh picks it up.
    pub async fn post_reply(&self, text: &str) -> SyncResult<ChatMessage> {
        if text.trim().is_empty() {
            return Err(SyncError::validation("reply text is empty"));
        }

        let conversation = self.conversation().await;
        let posted = self.source.post_message(&conversation, text).await?;
        tracing::info!("Posted message {} to {}", posted.id, conversation);

        Ok(posted)
    }

    fn feed<'a>(&'a self, conversation: &'a ConversationId) -> MessageFeed<'a, dyn ChatSource> {
        MessageFeed {
            source: self.source.as_ref(),
            conversation,
            page_size: self.page_size,
        }
    }

    fn bump_revision(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }
}

/// An open conversation with its background refresh.
pub struct ChatSession {
    sync: Arc<MessageSync>,
    refresh: PollLoop,
    post_refresh_delay: Duration,
}

impl ChatSession {
    /// Load the first page of `conversation` and start refreshing it.
    ///
    /// A failed initial load is logged; the refresh loop fills the window
    /// once the backend answers.
    pub async fn open(
        source: Arc<dyn ChatSource>,
        conversation: ConversationId,
        config: &ChatConfig,
    ) -> Self {
        let sync = Arc::new(MessageSync::new(
            source,
            conversation.clone(),
            config.page_size,
        ));

        if let Err(e) = sync.load_initial(conversation.clone()).await {
            tracing::warn!("Initial load of {} failed: {}", conversation, e);
        }

        let loop_sync = Arc::clone(&sync);
        let refresh = PollLoop::start("Chat refresh", config.refresh_interval(), move || {
            let sync = Arc::clone(&loop_sync);
            async move {
                if let Err(e) = sync.refresh().await {
                    tracing::warn!("Chat refresh failed: {}", e);
                }
            }
        });

        Self {
            sync,
            refresh,
            post_refresh_delay: config.post_refresh_delay(),
        }
    }

    pub fn sync(&self) -> &Arc<MessageSync> {
        &self.sync
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.sync.subscribe()
    }

    pub async fn window(&self) -> MessageWindow {
        self.sync.window().await
    }

    /// Switch to another conversation; the refresh timer restarts from now
    pub async fn switch_conversation(
        &self,
        conversation: ConversationId,
    ) -> SyncResult<MessageWindow> {
        self.refresh.reset();
        self.sync.load_initial(conversation).await
    }

    pub async fn load_older_page(&self) -> SyncResult<usize> {
        self.sync.load_older_page().await
    }

    /// Post a reply, then refresh shortly afterwards instead of waiting for
    /// the next periodic tick.
    pub async fn post_reply(&self, text: &str) -> SyncResult<ChatMessage> {
        let posted = self.sync.post_reply(text).await?;

        self.refresh.reset();
        self.refresh.trigger_after(self.post_refresh_delay);

        Ok(posted)
    }

    pub fn stop(&self) {
        self.refresh.stop();
    }
}
