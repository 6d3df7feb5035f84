use std::sync::Arc;

use snafu::{OptionExt, ResultExt, ensure};
use strand_core::{DisplayMessage, ThinkingEvent, linearize, switch_branch, terminal_of};
use strand_llm::{ChatStreamClient, SendRequest, ThinkingTracker};
use strand_storage::{
    ConversationId, ConversationRecord, ConversationStore, ConversationSummary, MessageNode,
    MessageRole, NewConversation, ROOT_MESSAGE_ID, new_message_id,
};

use crate::error::{
    AppResult, BranchUnavailableSnafu, ConversationMissingSnafu, EmptyPromptSnafu,
    NothingToRegenerateSnafu, StorageSnafu, StreamSnafu,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Node to answer from; defaults to the end of the selected path.
    pub parent: Option<String>,
    pub needs_knowledge: bool,
    /// Drives the thinking indicator for agent bots.
    pub agent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub user_message_id: String,
    pub assistant_message_id: String,
    pub completion: String,
    pub messages: Vec<DisplayMessage>,
}

/// Conversation operations behind the CLI: the store, the linearizer and
/// the streaming client wired together.
pub struct ChatSession {
    store: Arc<dyn ConversationStore>,
    client: ChatStreamClient,
    model: String,
    thinking: ThinkingTracker,
}

impl ChatSession {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        client: ChatStreamClient,
        model: impl Into<String>,
    ) -> Self {
        Self {
            store,
            client,
            model: model.into(),
            thinking: ThinkingTracker::new(),
        }
    }

    pub fn thinking(&self) -> &ThinkingTracker {
        &self.thinking
    }

    pub fn create_conversation(
        &self,
        title: Option<String>,
        bot_id: Option<String>,
    ) -> AppResult<ConversationRecord> {
        let record = self
            .store
            .create_conversation(NewConversation {
                title: title.unwrap_or_default(),
                bot_id,
            })
            .context(StorageSnafu {
                stage: "chat-create-conversation",
            })?;
        tracing::info!(conversation_id = %record.id, title = %record.title, "created conversation");
        Ok(record)
    }

    pub fn list_conversations(&self) -> AppResult<Vec<ConversationSummary>> {
        self.store.list_conversations().context(StorageSnafu {
            stage: "chat-list-conversations",
        })
    }

    pub fn conversation(&self, conversation_id: ConversationId) -> AppResult<ConversationRecord> {
        self.store
            .get_conversation(conversation_id)
            .context(StorageSnafu {
                stage: "chat-load-conversation",
            })?
            .context(ConversationMissingSnafu {
                stage: "chat-load-conversation",
                conversation_id,
            })
    }

    /// Displayed path through `selected`, or through the persisted selection.
    pub fn display(
        &self,
        conversation_id: ConversationId,
        selected: Option<&str>,
    ) -> AppResult<Vec<DisplayMessage>> {
        let record = self.conversation(conversation_id)?;
        let selected = selected.unwrap_or(&record.last_message_id);
        Ok(linearize(&record.message_map, selected))
    }

    pub async fn send<P>(
        &self,
        conversation_id: ConversationId,
        text: &str,
        options: SendOptions,
        on_partial: P,
    ) -> AppResult<SendOutcome>
    where
        P: FnMut(&str),
    {
        let text = text.trim();
        ensure!(!text.is_empty(), EmptyPromptSnafu { stage: "chat-send" });

        let record = self.conversation(conversation_id)?;
        let parent = match options.parent {
            Some(parent) => parent,
            None => path_end(&record),
        };

        let user_node = MessageNode::text(new_message_id(), MessageRole::User, text)
            .with_parent(parent.clone())
            .with_model(self.model.clone());
        let user_message_id = user_node.id.clone();
        self.store
            .append_or_update(conversation_id, user_node)
            .context(StorageSnafu {
                stage: "chat-record-user-message",
            })?;

        let mut request =
            SendRequest::user_text(conversation_id, text, self.model.clone(), Some(parent))
                .with_knowledge(options.needs_knowledge);
        if let Some(bot_id) = &record.bot_id {
            request = request.with_bot(bot_id.clone());
        }

        self.complete(conversation_id, user_message_id, &request, options.agent, on_partial)
            .await
    }

    /// Streams a fresh reply to a user turn. `message_id` names either the
    /// user turn or an assistant reply to it. Without one, an unanswered user
    /// turn at the end of the displayed path is resent; otherwise the turn
    /// behind the last displayed reply is. The new reply becomes a sibling
    /// of any earlier one.
    pub async fn regenerate<P>(
        &self,
        conversation_id: ConversationId,
        message_id: Option<&str>,
        agent: bool,
        on_partial: P,
    ) -> AppResult<SendOutcome>
    where
        P: FnMut(&str),
    {
        let record = self.conversation(conversation_id)?;

        let user = regenerate_target(&record, message_id).context(NothingToRegenerateSnafu {
            stage: "chat-regenerate",
            conversation_id,
        })?;

        tracing::info!(
            conversation_id = %conversation_id,
            user_message_id = %user.id,
            "regenerating reply"
        );

        let mut request = SendRequest::user_text(
            conversation_id,
            user.text_content(),
            self.model.clone(),
            user.parent.clone(),
        );
        if let Some(bot_id) = &record.bot_id {
            request = request.with_bot(bot_id.clone());
        }

        self.complete(conversation_id, user.id.clone(), &request, agent, on_partial)
            .await
    }

    /// Moves the selection at display `index` by `offset` siblings and
    /// persists it.
    pub fn switch_branch(
        &self,
        conversation_id: ConversationId,
        index: usize,
        offset: isize,
    ) -> AppResult<Vec<DisplayMessage>> {
        let record = self.conversation(conversation_id)?;
        let current = linearize(&record.message_map, &record.last_message_id);
        let target = switch_branch(&current, index, offset).context(BranchUnavailableSnafu {
            stage: "chat-switch-branch",
            index,
            offset,
        })?;

        self.store
            .set_last_message(conversation_id, &target)
            .context(StorageSnafu {
                stage: "chat-persist-selection",
            })?;
        tracing::debug!(conversation_id = %conversation_id, selected = %target, "switched branch");

        Ok(linearize(&record.message_map, &target))
    }

    async fn complete<P>(
        &self,
        conversation_id: ConversationId,
        user_message_id: String,
        request: &SendRequest,
        agent: bool,
        on_partial: P,
    ) -> AppResult<SendOutcome>
    where
        P: FnMut(&str),
    {
        if agent {
            let _ = self.thinking.dispatch(ThinkingEvent::Wakeup);
        }

        let streamed = self
            .client
            .send(request, on_partial, |event| {
                let _ = self.thinking.dispatch(event);
            })
            .await;
        if agent && streamed.is_err() {
            // A failed agent turn still settles the indicator.
            let _ = self.thinking.dispatch(ThinkingEvent::Sleeping);
        }
        let completion = streamed.context(StreamSnafu {
            stage: "chat-stream-reply",
        })?;

        let assistant = MessageNode::text(new_message_id(), MessageRole::Assistant, &completion)
            .with_parent(user_message_id.clone())
            .with_model(self.model.clone());
        let assistant_message_id = assistant.id.clone();
        let record = self
            .store
            .append_or_update(conversation_id, assistant)
            .context(StorageSnafu {
                stage: "chat-record-assistant-message",
            })?;

        Ok(SendOutcome {
            user_message_id,
            assistant_message_id,
            completion,
            messages: linearize(&record.message_map, &record.last_message_id),
        })
    }
}

/// User turn a regenerate streams a reply to.
fn regenerate_target<'a>(
    record: &'a ConversationRecord,
    message_id: Option<&str>,
) -> Option<&'a MessageNode> {
    let map = &record.message_map;
    let node = match message_id {
        Some(id) => map.get(id)?,
        None => {
            let path = linearize(map, &record.last_message_id);
            let target = match path.last() {
                Some(last) if last.role() == MessageRole::User => last,
                _ => path
                    .iter()
                    .rev()
                    .find(|message| message.role() == MessageRole::Assistant)?,
            };
            map.get(target.id())?
        }
    };

    match node.role {
        MessageRole::User => Some(node),
        MessageRole::Assistant => node
            .parent
            .as_deref()
            .and_then(|parent| map.get(parent))
            .filter(|parent| parent.role == MessageRole::User),
        MessageRole::System => None,
    }
}

/// Where a new turn attaches when no parent is given: the end of the
/// selected path, else the root.
fn path_end(record: &ConversationRecord) -> String {
    let map = &record.message_map;
    terminal_of(map, &record.last_message_id)
        .map(str::to_string)
        .or_else(|| map.preferred_root().map(|root| root.id.clone()))
        .unwrap_or_else(|| ROOT_MESSAGE_ID.to_string())
}
