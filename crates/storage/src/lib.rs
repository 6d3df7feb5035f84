pub mod error;
pub mod ids;
pub mod map;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{ConversationId, new_message_id};
pub use map::MessageMap;
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub use types::{
    ContentBlock, ConversationRecord, ConversationSummary, DEFAULT_CONVERSATION_TITLE,
    MessageNode, MessageRole, NewConversation, ROOT_MESSAGE_ID, TEXT_CONTENT_TYPE,
};

/// Persistence boundary for conversations and their message trees.
pub trait ConversationStore: Send + Sync {
    /// Creates a conversation seeded with the synthetic system root.
    fn create_conversation(&self, input: NewConversation) -> StorageResult<ConversationRecord>;
    /// Lists live conversations, most recently updated first.
    fn list_conversations(&self) -> StorageResult<Vec<ConversationSummary>>;
    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StorageResult<Option<ConversationRecord>>;
    /// Upserts `node`, links it under its parent and selects it.
    fn append_or_update(
        &self,
        conversation_id: ConversationId,
        node: MessageNode,
    ) -> StorageResult<ConversationRecord>;
    /// Persists the current selection without touching the tree.
    fn set_last_message(
        &self,
        conversation_id: ConversationId,
        message_id: &str,
    ) -> StorageResult<()>;
    fn delete_conversation(&self, conversation_id: ConversationId) -> StorageResult<()>;
}
