//! Wire format of the chunked streaming endpoint and the client-side session
//! state machine that drives it.
//!
//! The exchange is:
//! 1. client `{"step":"START","token":..}`, server `"Session started."`
//! 2. client one `{"step":"BODY","index":i,"part":..}` per chunk, server one
//!    `"Message part received."` per chunk
//! 3. client `{"step":"END"}`, server JSON status frames until `STREAMING_END`
//!
//! [`SessionMachine`] performs no IO; it turns inbound frames into actions.

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use strand_core::ThinkingEvent;

use super::error::{EncodeFrameSnafu, InvalidResponseSnafu, ServerSnafu, StreamResult};
use super::events::{StreamEvent, StreamMessages};

/// Chunk size in UTF-16 code units of the serialized payload.
pub const CHUNK_SIZE: usize = 32 * 1024;

pub const MESSAGE_SENT: &str = "Message sent.";
pub const SESSION_STARTED: &str = "Session started.";
pub const PART_RECEIVED: &str = "Message part received.";
pub const ENDPOINT_TIMEOUT_PREFIX: &str = r#"{"message": "Endpoint request timed out","#;

/// Outbound control frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "step", rename_all = "UPPERCASE")]
pub enum ControlFrame<'a> {
    Start { token: &'a str },
    Body { index: usize, part: &'a str },
    End,
}

impl ControlFrame<'_> {
    pub fn encode(&self) -> StreamResult<String> {
        serde_json::to_string(self).context(EncodeFrameSnafu {
            stage: "encode-control-frame",
        })
    }
}

/// Inbound JSON frame after the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StatusFrame {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub completion: Option<String>,
}

pub const STATUS_FETCHING_KNOWLEDGE: &str = "FETCHING_KNOWLEDGE";
pub const STATUS_THINKING: &str = "THINKING";
pub const STATUS_STREAMING: &str = "STREAMING";
pub const STATUS_STREAMING_END: &str = "STREAMING_END";
pub const STATUS_ERROR: &str = "ERROR";

/// Splits `payload` into slices of at most `chunk_units` UTF-16 code units.
///
/// A surrogate pair is never split, so a slice may end one unit short. An
/// empty payload still yields one empty chunk.
pub fn chunk_payload(payload: &str, chunk_units: usize) -> Vec<String> {
    let limit = chunk_units.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut units = 0;

    for character in payload.chars() {
        let width = character.len_utf16();
        if units + width > limit && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            units = 0;
        }
        current.push(character);
        units += width;
    }

    if !current.is_empty() || chunks.is_empty() {
        chunks.push(current);
    }

    chunks
}

/// Work the transport loop performs for the session machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    Send(String),
    Emit(StreamEvent),
    /// Close the channel and resolve with this completion.
    Finish(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    AwaitingSession,
    AwaitingAcks,
    Streaming,
    Finished,
}

/// Per-send protocol state.
#[derive(Debug, Clone)]
pub struct SessionMachine {
    token: String,
    chunks: Vec<String>,
    messages: StreamMessages,
    phase: SessionPhase,
    received_count: usize,
    completion: String,
}

impl SessionMachine {
    pub fn new(token: impl Into<String>, chunks: Vec<String>, messages: StreamMessages) -> Self {
        Self {
            token: token.into(),
            chunks,
            messages,
            phase: SessionPhase::Connecting,
            received_count: 0,
            completion: String::new(),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn completion(&self) -> &str {
        &self.completion
    }

    pub fn received_count(&self) -> usize {
        self.received_count
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// True while the session waits on `Session started.` or part acks.
    pub fn awaiting_handshake(&self) -> bool {
        matches!(
            self.phase,
            SessionPhase::AwaitingSession | SessionPhase::AwaitingAcks
        )
    }

    /// Frame to send once the channel is open.
    pub fn start(&mut self) -> StreamResult<SessionAction> {
        self.phase = SessionPhase::AwaitingSession;
        let frame = ControlFrame::Start { token: &self.token }.encode()?;
        Ok(SessionAction::Send(frame))
    }

    /// Applies one inbound text frame.
    pub fn handle_frame(&mut self, text: &str) -> StreamResult<Vec<SessionAction>> {
        if text.is_empty() || text == MESSAGE_SENT || text.starts_with(ENDPOINT_TIMEOUT_PREFIX) {
            tracing::trace!(frame = %text, "ignoring no-op protocol frame");
            return Ok(Vec::new());
        }

        if text == SESSION_STARTED {
            return self.on_session_started();
        }

        if text == PART_RECEIVED {
            return self.on_part_received();
        }

        let frame = match serde_json::from_str::<StatusFrame>(text) {
            Ok(frame) => frame,
            Err(error) => {
                tracing::warn!(frame = %text, error = %error, "unparseable streaming frame");
                self.phase = SessionPhase::Finished;
                return InvalidResponseSnafu {
                    stage: "session-parse-frame",
                    frame: text,
                }
                .fail();
            }
        };

        let Some(status) = frame.status.as_deref() else {
            tracing::warn!(frame = %text, "streaming frame has no status");
            self.phase = SessionPhase::Finished;
            return InvalidResponseSnafu {
                stage: "session-frame-status",
                frame: text,
            }
            .fail();
        };

        match status {
            STATUS_FETCHING_KNOWLEDGE => Ok(vec![self.partial(
                self.messages.retrieving_knowledge.clone(),
            )]),
            STATUS_THINKING => Ok(vec![SessionAction::Emit(StreamEvent::Thinking(
                ThinkingEvent::Thinking,
            ))]),
            STATUS_STREAMING => Ok(self.on_streaming(frame.completion)),
            STATUS_STREAMING_END => Ok(self.on_streaming_end()),
            STATUS_ERROR => {
                tracing::warn!(frame = %text, "server reported streaming error");
                self.phase = SessionPhase::Finished;
                ServerSnafu {
                    stage: "session-status-error",
                    frame: text,
                }
                .fail()
            }
            other => {
                tracing::debug!(status = other, "unrecognized streaming status; treating as heartbeat");
                Ok(vec![self.partial(self.messages.waiting_glyph.clone())])
            }
        }
    }

    fn on_session_started(&mut self) -> StreamResult<Vec<SessionAction>> {
        if self.phase != SessionPhase::AwaitingSession {
            tracing::debug!(phase = ?self.phase, "duplicate session-started frame ignored");
            return Ok(Vec::new());
        }

        self.phase = SessionPhase::AwaitingAcks;
        tracing::debug!(chunk_count = self.chunks.len(), "session started; sending body");
        self.chunks
            .iter()
            .enumerate()
            .map(|(index, part)| {
                ControlFrame::Body {
                    index,
                    part: part.as_str(),
                }
                .encode()
                .map(SessionAction::Send)
            })
            .collect()
    }

    fn on_part_received(&mut self) -> StreamResult<Vec<SessionAction>> {
        if self.phase != SessionPhase::AwaitingAcks {
            tracing::debug!(phase = ?self.phase, "unexpected part acknowledgment ignored");
            return Ok(Vec::new());
        }

        self.received_count += 1;
        if self.received_count < self.chunks.len() {
            return Ok(Vec::new());
        }

        self.phase = SessionPhase::Streaming;
        Ok(vec![SessionAction::Send(ControlFrame::End.encode()?)])
    }

    fn on_streaming(&mut self, fragment: Option<String>) -> Vec<SessionAction> {
        let Some(fragment) = fragment else {
            return Vec::new();
        };

        self.strip_glyph();
        self.completion.push_str(&fragment);
        self.completion.push_str(&self.messages.waiting_glyph);
        vec![self.partial(self.completion.clone())]
    }

    fn on_streaming_end(&mut self) -> Vec<SessionAction> {
        self.phase = SessionPhase::Finished;
        let mut actions = vec![SessionAction::Emit(StreamEvent::Thinking(
            ThinkingEvent::Sleeping,
        ))];
        if self.strip_glyph() {
            actions.push(self.partial(self.completion.clone()));
        }
        actions.push(SessionAction::Finish(self.completion.clone()));
        actions
    }

    fn strip_glyph(&mut self) -> bool {
        let glyph = self.messages.waiting_glyph.as_str();
        if glyph.is_empty() || !self.completion.ends_with(glyph) {
            return false;
        }
        let keep = self.completion.len() - glyph.len();
        self.completion.truncate(keep);
        true
    }

    fn partial(&self, text: String) -> SessionAction {
        SessionAction::Emit(StreamEvent::Partial(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StreamError;

    fn machine(chunks: &[&str]) -> SessionMachine {
        SessionMachine::new(
            "token-1",
            chunks.iter().map(|chunk| chunk.to_string()).collect(),
            StreamMessages::default(),
        )
    }

    fn sent(actions: &[SessionAction]) -> Vec<serde_json::Value> {
        actions
            .iter()
            .filter_map(|action| match action {
                SessionAction::Send(frame) => serde_json::from_str(frame).ok(),
                _ => None,
            })
            .collect()
    }

    fn partials(actions: &[SessionAction]) -> Vec<&str> {
        actions
            .iter()
            .filter_map(|action| match action {
                SessionAction::Emit(StreamEvent::Partial(text)) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    fn handshake(machine: &mut SessionMachine) {
        machine.start().expect("start");
        machine.handle_frame(SESSION_STARTED).expect("session started");
        for _ in 0..machine.chunk_count() {
            machine.handle_frame(PART_RECEIVED).expect("ack");
        }
        assert_eq!(machine.phase(), SessionPhase::Streaming);
    }

    #[test]
    fn control_frames_match_wire_format() {
        assert_eq!(
            ControlFrame::Start { token: "t" }.encode().expect("start"),
            r#"{"step":"START","token":"t"}"#
        );
        assert_eq!(
            ControlFrame::Body {
                index: 2,
                part: "abc"
            }
            .encode()
            .expect("body"),
            r#"{"step":"BODY","index":2,"part":"abc"}"#
        );
        assert_eq!(ControlFrame::End.encode().expect("end"), r#"{"step":"END"}"#);
    }

    #[test]
    fn chunking_splits_on_utf16_units() {
        assert_eq!(chunk_payload("", CHUNK_SIZE), vec![String::new()]);

        let exact = "a".repeat(CHUNK_SIZE);
        assert_eq!(chunk_payload(&exact, CHUNK_SIZE).len(), 1);

        let over = "a".repeat(CHUNK_SIZE + 1);
        let chunks = chunk_payload(&over, CHUNK_SIZE);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), CHUNK_SIZE);
        assert_eq!(chunks[1], "a");
        assert_eq!(chunks.concat(), over);
    }

    #[test]
    fn chunking_keeps_surrogate_pairs_whole() {
        // Three units: 'a' then a pair; a limit of 2 must not split the pair.
        let chunks = chunk_payload("a😀b", 2);
        assert_eq!(chunks, vec!["a", "😀", "b"]);

        let wide = "é".repeat(5);
        assert_eq!(chunk_payload(&wide, 2), vec!["éé", "éé", "é"]);
    }

    #[test]
    fn handshake_sends_body_then_end_after_all_acks() {
        let mut machine = machine(&["part-0", "part-1"]);

        let start = machine.start().expect("start");
        assert_eq!(sent(&[start])[0]["token"], "token-1");

        assert!(machine.handle_frame("").expect("empty").is_empty());
        assert!(machine.handle_frame(MESSAGE_SENT).expect("sent").is_empty());
        assert!(
            machine
                .handle_frame(r#"{"message": "Endpoint request timed out", "connectionId": "x"}"#)
                .expect("timeout notice")
                .is_empty()
        );
        assert_eq!(machine.phase(), SessionPhase::AwaitingSession);

        let body = machine.handle_frame(SESSION_STARTED).expect("body");
        let frames = sent(&body);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["step"], "BODY");
        assert_eq!(frames[0]["index"], 0);
        assert_eq!(frames[1]["part"], "part-1");

        assert!(machine.handle_frame(SESSION_STARTED).expect("dup").is_empty());
        assert!(machine.handle_frame(PART_RECEIVED).expect("ack 1").is_empty());
        let end = machine.handle_frame(PART_RECEIVED).expect("ack 2");
        assert_eq!(sent(&end), vec![serde_json::json!({"step": "END"})]);
        assert!(machine.handle_frame(PART_RECEIVED).expect("extra ack").is_empty());
        assert!(!machine.awaiting_handshake());
    }

    #[test]
    fn streaming_fragments_accumulate_behind_cursor() {
        let mut machine = machine(&["payload"]);
        handshake(&mut machine);

        let first = machine
            .handle_frame(r#"{"status":"STREAMING","completion":"Hel"}"#)
            .expect("first");
        let empty = machine
            .handle_frame(r#"{"status":"STREAMING","completion":""}"#)
            .expect("empty fragment");
        let second = machine
            .handle_frame(r#"{"status":"STREAMING","completion":"lo"}"#)
            .expect("second");

        assert_eq!(partials(&first), vec!["Hel▍"]);
        assert_eq!(partials(&empty), vec!["Hel▍"]);
        assert_eq!(partials(&second), vec!["Hello▍"]);

        let end = machine
            .handle_frame(r#"{"status":"STREAMING_END"}"#)
            .expect("end");
        assert_eq!(
            end,
            vec![
                SessionAction::Emit(StreamEvent::Thinking(ThinkingEvent::Sleeping)),
                SessionAction::Emit(StreamEvent::Partial("Hello".to_string())),
                SessionAction::Finish("Hello".to_string()),
            ]
        );
    }

    #[test]
    fn status_frames_map_to_events() {
        let mut machine = machine(&["payload"]);
        handshake(&mut machine);

        assert_eq!(
            partials(
                &machine
                    .handle_frame(r#"{"status":"FETCHING_KNOWLEDGE"}"#)
                    .expect("knowledge")
            ),
            vec!["Retrieving knowledge..."]
        );
        assert_eq!(
            machine
                .handle_frame(r#"{"status":"THINKING"}"#)
                .expect("thinking"),
            vec![SessionAction::Emit(StreamEvent::Thinking(
                ThinkingEvent::Thinking
            ))]
        );
        assert_eq!(
            partials(
                &machine
                    .handle_frame(r#"{"status":"SOMETHING_NEW"}"#)
                    .expect("heartbeat")
            ),
            vec!["▍"]
        );
        assert!(
            machine
                .handle_frame(r#"{"status":"STREAMING"}"#)
                .expect("no completion")
                .is_empty()
        );
        assert_eq!(machine.completion(), "");
    }

    #[test]
    fn error_and_malformed_frames_fail() {
        let mut errored = machine(&["payload"]);
        handshake(&mut errored);
        let error = errored
            .handle_frame(r#"{"status":"ERROR","reason":"throttled"}"#)
            .expect_err("error status");
        assert!(matches!(error, StreamError::ServerError { .. }));
        assert_eq!(errored.phase(), SessionPhase::Finished);

        let mut statusless = machine(&["payload"]);
        handshake(&mut statusless);
        let error = statusless
            .handle_frame(r#"{"completion":"x"}"#)
            .expect_err("missing status");
        assert!(matches!(error, StreamError::InvalidResponse { .. }));

        let mut garbage = machine(&["payload"]);
        garbage.start().expect("start");
        let error = garbage.handle_frame("Forbidden").expect_err("not json");
        match error {
            StreamError::InvalidResponse { frame, .. } => assert_eq!(frame, "Forbidden"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
