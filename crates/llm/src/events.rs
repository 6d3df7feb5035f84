use strand_core::ThinkingEvent;

/// Event surfaced to the caller while a streaming session runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Full text to display right now (not a delta).
    Partial(String),
    /// Input for the caller's thinking indicator.
    Thinking(ThinkingEvent),
}

/// User-facing strings the session emits or maps errors to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessages {
    pub retrieving_knowledge: String,
    /// Cursor appended while tokens are still arriving.
    pub waiting_glyph: String,
    pub invalid_response: String,
    pub prediction_failed: String,
    pub cancelled: String,
}

impl Default for StreamMessages {
    fn default() -> Self {
        Self {
            retrieving_knowledge: "Retrieving knowledge...".to_string(),
            waiting_glyph: "▍".to_string(),
            invalid_response: "Received an invalid response.".to_string(),
            prediction_failed: "An error occurred while generating the response.".to_string(),
            cancelled: "Response generation was stopped.".to_string(),
        }
    }
}

impl StreamMessages {
    pub fn describe(&self, error: &super::StreamError) -> &str {
        match error.failure_kind() {
            super::FailureKind::InvalidResponse => &self.invalid_response,
            super::FailureKind::PredictionFailed => &self.prediction_failed,
            super::FailureKind::Cancelled => &self.cancelled,
        }
    }
}
