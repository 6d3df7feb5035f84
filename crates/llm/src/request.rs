use serde::Serialize;
use snafu::ResultExt;
use strand_storage::{ContentBlock, ConversationId, MessageRole};

use super::error::{SerializeRequestSnafu, StreamResult};

pub const DEFAULT_MODEL: &str = "claude-v3.5-sonnet";

/// The turn being sent, as the service expects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageInput {
    pub role: MessageRole,
    pub content: Vec<ContentBlock>,
    pub model: String,
    /// Node the new turn continues from; `None` starts from the root.
    pub parent_message_id: Option<String>,
}

/// One post to the streaming endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub conversation_id: ConversationId,
    pub message: MessageInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_id: Option<String>,
    pub continue_generate: bool,
    /// Whether the bot retrieves knowledge first; only drives the initial
    /// placeholder and is not sent.
    #[serde(skip)]
    pub needs_knowledge: bool,
}

impl SendRequest {
    pub fn user_text(
        conversation_id: ConversationId,
        text: impl Into<String>,
        model: impl Into<String>,
        parent_message_id: Option<String>,
    ) -> Self {
        Self {
            conversation_id,
            message: MessageInput {
                role: MessageRole::User,
                content: vec![ContentBlock::text(text)],
                model: model.into(),
                parent_message_id,
            },
            bot_id: None,
            continue_generate: false,
            needs_knowledge: false,
        }
    }

    pub fn with_bot(mut self, bot_id: impl Into<String>) -> Self {
        self.bot_id = Some(bot_id.into());
        self
    }

    pub fn with_knowledge(mut self, needs_knowledge: bool) -> Self {
        self.needs_knowledge = needs_knowledge;
        self
    }

    pub fn continuing(mut self) -> Self {
        self.continue_generate = true;
        self
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(flatten)]
    request: &'a SendRequest,
    token: &'a str,
}

/// Serializes `request` with the auth token into the string that gets chunked.
pub fn encode_payload(request: &SendRequest, token: &str) -> StreamResult<String> {
    serde_json::to_string(&Envelope { request, token }).context(SerializeRequestSnafu {
        stage: "encode-request-payload",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_carries_token_and_camel_case_fields() {
        let conversation_id = ConversationId::new_v7();
        let request = SendRequest::user_text(
            conversation_id,
            "hello",
            DEFAULT_MODEL,
            Some("system".to_string()),
        )
        .with_bot("bot-7")
        .with_knowledge(true);

        let payload = encode_payload(&request, "secret-token").expect("encode");
        let json: serde_json::Value = serde_json::from_str(&payload).expect("valid json");

        assert_eq!(json["token"], "secret-token");
        assert_eq!(json["conversationId"], conversation_id.to_string());
        assert_eq!(json["botId"], "bot-7");
        assert_eq!(json["continueGenerate"], false);
        assert_eq!(json["message"]["role"], "user");
        assert_eq!(json["message"]["parentMessageId"], "system");
        assert_eq!(json["message"]["content"][0]["contentType"], "text");
        assert_eq!(json["message"]["content"][0]["body"], "hello");
        assert!(json.get("needsKnowledge").is_none());
    }
}
