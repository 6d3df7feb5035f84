use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use snafu::OptionExt;

use super::ConversationStore;
use super::error::{NotFoundSnafu, StorageResult};
use super::ids::ConversationId;
use super::map::MessageMap;
use super::types::{
    ConversationRecord, ConversationSummary, MessageNode, NewConversation, ROOT_MESSAGE_ID,
    unix_timestamp_seconds,
};

/// Process-local store, used for ephemeral sessions and tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    conversations: RwLock<BTreeMap<ConversationId, ConversationRecord>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `record` as-is, bypassing the write-side link fix-ups. Handy for
    /// seeding imported or deliberately malformed trees.
    pub fn insert_record(&self, record: ConversationRecord) {
        let mut conversations = self
            .conversations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        conversations.insert(record.id, record);
    }
}

impl ConversationStore for MemoryStorage {
    fn create_conversation(&self, input: NewConversation) -> StorageResult<ConversationRecord> {
        let record = ConversationRecord {
            id: ConversationId::new_v7(),
            title: input.normalized_title(),
            bot_id: input.bot_id,
            last_message_id: ROOT_MESSAGE_ID.to_string(),
            message_map: MessageMap::with_root(),
            updated_at_unix_seconds: unix_timestamp_seconds(),
        };
        self.insert_record(record.clone());
        Ok(record)
    }

    fn list_conversations(&self) -> StorageResult<Vec<ConversationSummary>> {
        let conversations = self
            .conversations
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut summaries = conversations
            .values()
            .map(ConversationSummary::from)
            .collect::<Vec<_>>();
        summaries.sort_by(|left, right| {
            right
                .updated_at_unix_seconds
                .cmp(&left.updated_at_unix_seconds)
                .then_with(|| right.id.cmp(&left.id))
        });
        Ok(summaries)
    }

    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StorageResult<Option<ConversationRecord>> {
        let conversations = self
            .conversations
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(conversations.get(&conversation_id).cloned())
    }

    fn append_or_update(
        &self,
        conversation_id: ConversationId,
        node: MessageNode,
    ) -> StorageResult<ConversationRecord> {
        let mut conversations = self
            .conversations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let record = conversations
            .get_mut(&conversation_id)
            .context(NotFoundSnafu {
                stage: "memory-append-or-update",
                entity: "conversation",
                id: conversation_id.to_string(),
            })?;

        record.last_message_id = node.id.clone();
        record.message_map.upsert(node);
        record.updated_at_unix_seconds = unix_timestamp_seconds();
        Ok(record.clone())
    }

    fn set_last_message(
        &self,
        conversation_id: ConversationId,
        message_id: &str,
    ) -> StorageResult<()> {
        let mut conversations = self
            .conversations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let record = conversations
            .get_mut(&conversation_id)
            .context(NotFoundSnafu {
                stage: "memory-set-last-message",
                entity: "conversation",
                id: conversation_id.to_string(),
            })?;
        record.last_message_id = message_id.to_string();
        Ok(())
    }

    fn delete_conversation(&self, conversation_id: ConversationId) -> StorageResult<()> {
        let mut conversations = self
            .conversations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        conversations
            .remove(&conversation_id)
            .map(|_| ())
            .context(NotFoundSnafu {
                stage: "memory-delete-conversation",
                entity: "conversation",
                id: conversation_id.to_string(),
            })
    }
}
