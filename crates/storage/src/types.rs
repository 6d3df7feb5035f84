use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::ids::ConversationId;
use super::map::MessageMap;

/// Default title used when a conversation is created without one.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";

/// Id of the synthetic root every stored conversation starts from.
pub const ROOT_MESSAGE_ID: &str = "system";

/// Content type tag of plain text blocks.
pub const TEXT_CONTENT_TYPE: &str = "text";

/// Storage-local message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentBlock {
    pub content_type: String,
    pub body: String,
}

impl ContentBlock {
    pub fn new(content_type: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            body: body.into(),
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self::new(TEXT_CONTENT_TYPE, body)
    }

    pub fn is_text(&self) -> bool {
        self.content_type == TEXT_CONTENT_TYPE
    }
}

/// One turn of a conversation and its links into the message tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageNode {
    pub id: String,
    pub role: MessageRole,
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub children: Vec<String>,
}

impl MessageNode {
    pub fn new(id: impl Into<String>, role: MessageRole, content: Vec<ContentBlock>) -> Self {
        Self {
            id: id.into(),
            role,
            content,
            model: None,
            parent: None,
            children: Vec::new(),
        }
    }

    pub fn text(id: impl Into<String>, role: MessageRole, body: impl Into<String>) -> Self {
        Self::new(id, role, vec![ContentBlock::text(body)])
    }

    /// The synthetic root a fresh conversation starts from.
    pub fn root() -> Self {
        Self::new(ROOT_MESSAGE_ID, MessageRole::System, Vec::new())
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_children<I, S>(mut self, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.children = children.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Joined bodies of all text blocks.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter(|block| block.is_text())
            .map(|block| block.body.as_str())
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub title: String,
    pub bot_id: Option<String>,
    /// Persisted selection handed to the linearizer.
    pub last_message_id: String,
    pub message_map: MessageMap,
    pub updated_at_unix_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub title: String,
    pub bot_id: Option<String>,
    pub updated_at_unix_seconds: u64,
}

impl From<&ConversationRecord> for ConversationSummary {
    fn from(record: &ConversationRecord) -> Self {
        Self {
            id: record.id,
            title: record.title.clone(),
            bot_id: record.bot_id.clone(),
            updated_at_unix_seconds: record.updated_at_unix_seconds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NewConversation {
    pub title: String,
    pub bot_id: Option<String>,
}

impl NewConversation {
    pub fn normalized_title(&self) -> String {
        let title = self.title.trim();
        if title.is_empty() {
            DEFAULT_CONVERSATION_TITLE.to_string()
        } else {
            title.to_string()
        }
    }
}

pub(crate) fn unix_timestamp_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}
