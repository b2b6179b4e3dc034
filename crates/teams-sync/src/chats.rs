//! Chat list shown when picking a conversation.

use shared_types::{ChatSummary, ConversationId};

use crate::error::{SyncError, SyncResult};
use crate::feed::ChatSource;

/// List the signed-in user's chats, fetching members for chats that have no
/// topic so they can be labelled.
///
/// A failed member lookup is logged and the chat keeps its id as label.
pub async fn load_chat_list(source: &dyn ChatSource, limit: usize) -> SyncResult<Vec<ChatSummary>> {
    let mut chats = source.list_chats(limit).await?;

    for chat in chats.iter_mut().filter(|c| c.needs_members()) {
        match source.chat_members(&chat.id).await {
            Ok(members) => chat.members = members,
            Err(e) => tracing::warn!("Failed to load members of {}: {}", chat.id, e),
        }
    }

    tracing::debug!("Loaded {} chats", chats.len());
    Ok(chats)
}

/// Resolve a `/switch` argument: a 1-based position in `listed`, or a raw
/// chat id.
pub fn resolve_chat(arg: &str, listed: &[ChatSummary]) -> SyncResult<ConversationId> {
    let arg = arg.trim();
    if let Ok(position) = arg.parse::<usize>() {
        return position
            .checked_sub(1)
            .and_then(|i| listed.get(i))
            .map(|chat| chat.id.clone())
            .ok_or_else(|| {
                SyncError::validation(format!(
                    "No chat number {} ({} listed, see /chats)",
                    position,
                    listed.len()
                ))
            });
    }

    Ok(ConversationId::parse(arg)?)
}
