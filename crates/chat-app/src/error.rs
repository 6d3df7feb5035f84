use snafu::Snafu;
use strand_llm::StreamError;
use strand_storage::{ConversationId, StorageError};

use crate::settings::SettingsError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("settings failed on `{stage}`: {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("conversation store failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("streaming reply failed on `{stage}`: {source}"))]
    Stream {
        stage: &'static str,
        source: StreamError,
    },
    #[snafu(display("conversation {conversation_id} does not exist"))]
    ConversationMissing {
        stage: &'static str,
        conversation_id: ConversationId,
    },
    #[snafu(display("refusing to send an empty prompt on `{stage}`"))]
    EmptyPrompt { stage: &'static str },
    #[snafu(display("conversation {conversation_id} has no user turn to regenerate a reply for"))]
    NothingToRegenerate {
        stage: &'static str,
        conversation_id: ConversationId,
    },
    #[snafu(display("message {index} has no branch at offset {offset}"))]
    BranchUnavailable {
        stage: &'static str,
        index: usize,
        offset: isize,
    },
    #[snafu(display("failed to start async runtime on `{stage}`: {source}"))]
    RuntimeInit {
        stage: &'static str,
        source: std::io::Error,
    },
}

impl AppError {
    /// The stream failure behind this error, if any.
    pub fn stream_error(&self) -> Option<&StreamError> {
        match self {
            Self::Stream { source, .. } => Some(source),
            _ => None,
        }
    }
}
