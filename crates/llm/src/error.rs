use std::time::Duration;

use snafu::Snafu;
use tokio_tungstenite::tungstenite;

pub type StreamResult<T> = Result<T, StreamError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StreamError {
    #[snafu(display("failed to connect streaming endpoint '{url}' on `{stage}`: {source}"))]
    Connect {
        stage: &'static str,
        url: String,
        source: tungstenite::Error,
    },
    #[snafu(display("streaming transport failed on `{stage}`: {source}"))]
    Transport {
        stage: &'static str,
        source: tungstenite::Error,
    },
    #[snafu(display("failed to serialize request payload on `{stage}`: {source}"))]
    SerializeRequest {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to encode control frame on `{stage}`: {source}"))]
    EncodeFrame {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("invalid response frame on `{stage}`: {frame}"))]
    InvalidResponse { stage: &'static str, frame: String },
    #[snafu(display("server reported an error on `{stage}`: {frame}"))]
    ServerError { stage: &'static str, frame: String },
    #[snafu(display("streaming channel closed before the response finished on `{stage}`"))]
    ClosedBeforeEnd { stage: &'static str },
    #[snafu(display(
        "no handshake frame within {timeout:?} on `{stage}` ({received}/{expected} parts acknowledged)"
    ))]
    AckTimeout {
        stage: &'static str,
        timeout: Duration,
        received: usize,
        expected: usize,
    },
    #[snafu(display("streaming session cancelled on `{stage}`"))]
    Cancelled { stage: &'static str },
}

/// Coarse classification used to pick the user-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    InvalidResponse,
    PredictionFailed,
    Cancelled,
}

impl StreamError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::InvalidResponse { .. } | Self::ServerError { .. } => FailureKind::InvalidResponse,
            Self::Cancelled { .. } => FailureKind::Cancelled,
            Self::Connect { .. }
            | Self::Transport { .. }
            | Self::SerializeRequest { .. }
            | Self::EncodeFrame { .. }
            | Self::ClosedBeforeEnd { .. }
            | Self::AckTimeout { .. } => FailureKind::PredictionFailed,
        }
    }
}
