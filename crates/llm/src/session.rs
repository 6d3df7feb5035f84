use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use strand_core::ThinkingEvent;
use tokio::sync::{mpsc, oneshot};

use super::channel::{ChannelConnector, StreamChannel, WebSocketConnector};
use super::error::{AckTimeoutSnafu, CancelledSnafu, ClosedBeforeEndSnafu, StreamError, StreamResult};
use super::events::{StreamEvent, StreamMessages};
use super::protocol::{CHUNK_SIZE, SessionAction, SessionMachine, chunk_payload};
use super::request::{SendRequest, encode_payload};

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

pub type SessionWorker = Pin<Box<dyn Future<Output = StreamResult<String>> + Send + 'static>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub token: String,
    /// Payload slice size in UTF-16 code units.
    pub chunk_size: usize,
    pub ack_timeout: Duration,
    pub messages: StreamMessages,
}

impl StreamConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            chunk_size: CHUNK_SIZE,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            messages: StreamMessages::default(),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    pub fn with_messages(mut self, messages: StreamMessages) -> Self {
        self.messages = messages;
        self
    }
}

/// Caller side of a running session. Dropping it cancels the session.
pub struct ChatEventStream {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct ChatStreamHandle {
    pub events: ChatEventStream,
    pub worker: SessionWorker,
}

impl ChatEventStream {
    fn new(events: mpsc::UnboundedReceiver<StreamEvent>, cancel_tx: oneshot::Sender<()>) -> Self {
        Self {
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.events.try_recv().ok()
    }

    /// Closes the channel early; returns false if the session already ended.
    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for ChatEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// Client for the chunked streaming endpoint.
#[derive(Clone)]
pub struct ChatStreamClient {
    connector: Arc<dyn ChannelConnector>,
    config: StreamConfig,
}

impl ChatStreamClient {
    pub fn new(connector: Arc<dyn ChannelConnector>, config: StreamConfig) -> Self {
        Self { connector, config }
    }

    pub fn websocket(endpoint: impl Into<String>, config: StreamConfig) -> Self {
        Self::new(Arc::new(WebSocketConnector::new(endpoint)), config)
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Prepares a session. The initial placeholder is already queued on the
    /// returned event stream; nothing touches the network until `worker` is
    /// polled.
    pub fn stream_chat(&self, request: &SendRequest) -> StreamResult<ChatStreamHandle> {
        let payload = encode_payload(request, &self.config.token)?;
        let chunks = chunk_payload(&payload, self.config.chunk_size);
        tracing::debug!(
            conversation_id = %request.conversation_id,
            payload_units = payload.encode_utf16().count(),
            chunk_count = chunks.len(),
            "prepared streaming payload"
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let messages = &self.config.messages;
        let placeholder = if request.needs_knowledge {
            messages.retrieving_knowledge.clone()
        } else {
            messages.waiting_glyph.clone()
        };
        let _ = event_tx.send(StreamEvent::Partial(placeholder));

        let machine = SessionMachine::new(self.config.token.clone(), chunks, messages.clone());
        let worker: SessionWorker = Box::pin(run_session(
            Arc::clone(&self.connector),
            machine,
            self.config.ack_timeout,
            event_tx,
            cancel_rx,
        ));

        Ok(ChatStreamHandle {
            events: ChatEventStream::new(event_rx, cancel_tx),
            worker,
        })
    }

    /// Streams one reply, invoking the callbacks as events arrive, and
    /// resolves with the final completion text.
    pub async fn send<P, T>(
        &self,
        request: &SendRequest,
        mut on_partial: P,
        mut on_thinking: T,
    ) -> StreamResult<String>
    where
        P: FnMut(&str),
        T: FnMut(ThinkingEvent),
    {
        let ChatStreamHandle { mut events, worker } = self.stream_chat(request)?;

        // Placeholder is delivered before the channel opens.
        while let Some(event) = events.try_recv() {
            deliver(event, &mut on_partial, &mut on_thinking);
        }

        let consumer = async {
            while let Some(event) = events.recv().await {
                deliver(event, &mut on_partial, &mut on_thinking);
            }
        };

        let (result, ()) = tokio::join!(worker, consumer);
        result
    }
}

fn deliver<P, T>(event: StreamEvent, on_partial: &mut P, on_thinking: &mut T)
where
    P: FnMut(&str),
    T: FnMut(ThinkingEvent),
{
    match event {
        StreamEvent::Partial(text) => on_partial(&text),
        StreamEvent::Thinking(event) => on_thinking(event),
    }
}

enum SessionEnd {
    Completed(String),
    /// Failure while the channel is still open; it gets closed.
    Failed(StreamError),
    /// The peer closed or the transport broke; nothing left to close.
    Lost(StreamError),
}

async fn run_session(
    connector: Arc<dyn ChannelConnector>,
    mut machine: SessionMachine,
    ack_timeout: Duration,
    events: mpsc::UnboundedSender<StreamEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
) -> StreamResult<String> {
    let mut channel = tokio::select! {
        _ = &mut cancel_rx => {
            tracing::debug!("streaming session cancelled before connect");
            return CancelledSnafu { stage: "session-connect" }.fail();
        }
        connected = connector.connect() => connected?,
    };

    let end = drive_session(
        channel.as_mut(),
        &mut machine,
        ack_timeout,
        &events,
        &mut cancel_rx,
    )
    .await;

    match end {
        SessionEnd::Completed(completion) => {
            close_channel(channel.as_mut()).await;
            tracing::debug!(
                completion_len = completion.len(),
                "streaming session completed"
            );
            Ok(completion)
        }
        SessionEnd::Failed(error) => {
            close_channel(channel.as_mut()).await;
            tracing::warn!(error = %error, "streaming session failed");
            Err(error)
        }
        SessionEnd::Lost(error) => {
            tracing::warn!(error = %error, "streaming channel lost");
            Err(error)
        }
    }
}

async fn drive_session(
    channel: &mut dyn StreamChannel,
    machine: &mut SessionMachine,
    ack_timeout: Duration,
    events: &mpsc::UnboundedSender<StreamEvent>,
    cancel_rx: &mut oneshot::Receiver<()>,
) -> SessionEnd {
    let start = match machine.start() {
        Ok(action) => action,
        Err(error) => return SessionEnd::Failed(error),
    };
    if let Some(end) = perform(channel, events, vec![start]).await {
        return end;
    }

    loop {
        let next = if machine.awaiting_handshake() {
            tokio::select! {
                _ = &mut *cancel_rx => return cancelled(),
                next = tokio::time::timeout(ack_timeout, channel.next_text()) => match next {
                    Ok(next) => next,
                    Err(_) => {
                        return SessionEnd::Failed(
                            AckTimeoutSnafu {
                                stage: "session-handshake",
                                timeout: ack_timeout,
                                received: machine.received_count(),
                                expected: machine.chunk_count(),
                            }
                            .build(),
                        );
                    }
                },
            }
        } else {
            tokio::select! {
                _ = &mut *cancel_rx => return cancelled(),
                next = channel.next_text() => next,
            }
        };

        let text = match next {
            Some(Ok(text)) => text,
            Some(Err(error)) => return SessionEnd::Lost(error),
            None => {
                return SessionEnd::Lost(
                    ClosedBeforeEndSnafu {
                        stage: "session-receive",
                    }
                    .build(),
                );
            }
        };

        match machine.handle_frame(&text) {
            Ok(actions) => {
                if let Some(end) = perform(channel, events, actions).await {
                    return end;
                }
            }
            Err(error) => return SessionEnd::Failed(error),
        }
    }
}

async fn perform(
    channel: &mut dyn StreamChannel,
    events: &mpsc::UnboundedSender<StreamEvent>,
    actions: Vec<SessionAction>,
) -> Option<SessionEnd> {
    for action in actions {
        match action {
            SessionAction::Send(frame) => {
                if let Err(error) = channel.send_text(frame).await {
                    return Some(SessionEnd::Lost(error));
                }
            }
            SessionAction::Emit(event) => {
                let _ = events.send(event);
            }
            SessionAction::Finish(completion) => return Some(SessionEnd::Completed(completion)),
        }
    }
    None
}

fn cancelled() -> SessionEnd {
    tracing::debug!("streaming session cancelled");
    SessionEnd::Failed(
        CancelledSnafu {
            stage: "session-receive",
        }
        .build(),
    )
}

async fn close_channel(channel: &mut dyn StreamChannel) {
    if let Err(error) = channel.close().await {
        tracing::debug!(error = %error, "failed to close streaming channel");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use strand_storage::ConversationId;

    use super::*;
    use crate::channel::BoxFuture;
    use crate::error::FailureKind;
    use crate::protocol::{PART_RECEIVED, SESSION_STARTED};
    use crate::request::DEFAULT_MODEL;

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Drain {
        Close,
        Hang,
        Reset,
    }

    fn connection_reset() -> StreamError {
        StreamError::Transport {
            stage: "scripted-channel",
            source: tokio_tungstenite::tungstenite::Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )),
        }
    }

    /// Server double: answers the handshake and replays `script` after END.
    #[derive(Clone)]
    struct ScriptedConnector {
        script: Vec<String>,
        answer_start: bool,
        drain: Drain,
        reject_step: Option<&'static str>,
        sent: Arc<Mutex<Vec<serde_json::Value>>>,
        closes: Arc<AtomicUsize>,
    }

    impl ScriptedConnector {
        fn new(script: &[&str]) -> Self {
            Self {
                script: script.iter().map(|frame| frame.to_string()).collect(),
                answer_start: true,
                drain: Drain::Close,
                reject_step: None,
                sent: Arc::default(),
                closes: Arc::default(),
            }
        }

        fn silent(mut self) -> Self {
            self.answer_start = false;
            self
        }

        fn hanging(mut self) -> Self {
            self.drain = Drain::Hang;
            self
        }

        fn resetting(mut self) -> Self {
            self.drain = Drain::Reset;
            self
        }

        fn rejecting(mut self, step: &'static str) -> Self {
            self.reject_step = Some(step);
            self
        }

        fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }

        fn steps(&self) -> Vec<String> {
            self.sent
                .lock()
                .expect("sent lock")
                .iter()
                .map(|frame| frame["step"].as_str().unwrap_or_default().to_string())
                .collect()
        }
    }

    struct ScriptedChannel {
        connector: ScriptedConnector,
        inbox: VecDeque<String>,
    }

    impl ChannelConnector for ScriptedConnector {
        fn connect<'a>(&'a self) -> BoxFuture<'a, StreamResult<Box<dyn StreamChannel>>> {
            let channel = ScriptedChannel {
                connector: self.clone(),
                inbox: VecDeque::new(),
            };
            Box::pin(async move { Ok(Box::new(channel) as Box<dyn StreamChannel>) })
        }
    }

    impl StreamChannel for ScriptedChannel {
        fn send_text<'a>(&'a mut self, text: String) -> BoxFuture<'a, StreamResult<()>> {
            Box::pin(async move {
                let frame: serde_json::Value = serde_json::from_str(&text).expect("json frame");
                if self.connector.reject_step.is_some()
                    && frame["step"].as_str() == self.connector.reject_step
                {
                    return Err(connection_reset());
                }
                match frame["step"].as_str() {
                    Some("START") if self.connector.answer_start => {
                        self.inbox.push_back("Message sent.".to_string());
                        self.inbox.push_back(SESSION_STARTED.to_string());
                    }
                    Some("BODY") => self.inbox.push_back(PART_RECEIVED.to_string()),
                    Some("END") => self.inbox.extend(self.connector.script.iter().cloned()),
                    _ => {}
                }
                self.connector.sent.lock().expect("sent lock").push(frame);
                Ok(())
            })
        }

        fn next_text<'a>(&'a mut self) -> BoxFuture<'a, Option<StreamResult<String>>> {
            Box::pin(async move {
                if let Some(frame) = self.inbox.pop_front() {
                    return Some(Ok(frame));
                }
                match self.connector.drain {
                    Drain::Close => None,
                    Drain::Hang => std::future::pending().await,
                    Drain::Reset => Some(Err(connection_reset())),
                }
            })
        }

        fn close<'a>(&'a mut self) -> BoxFuture<'a, StreamResult<()>> {
            self.connector.closes.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }

    fn request(text: &str) -> SendRequest {
        SendRequest::user_text(
            ConversationId::new_v7(),
            text,
            DEFAULT_MODEL,
            Some("system".to_string()),
        )
    }

    fn client(connector: &ScriptedConnector) -> ChatStreamClient {
        ChatStreamClient::new(Arc::new(connector.clone()), StreamConfig::new("token-1"))
    }

    #[tokio::test]
    async fn happy_path_streams_growing_partials() {
        let connector = ScriptedConnector::new(&[
            r#"{"status":"THINKING"}"#,
            r#"{"status":"STREAMING","completion":"Hel"}"#,
            r#"{"status":"STREAMING","completion":"lo"}"#,
            r#"{"status":"STREAMING_END"}"#,
        ]);
        let mut partials = Vec::new();
        let mut thinking = Vec::new();

        let completion = client(&connector)
            .send(
                &request("hi"),
                |text| partials.push(text.to_string()),
                |event| thinking.push(event),
            )
            .await
            .expect("completion");

        assert_eq!(completion, "Hello");
        assert_eq!(partials, vec!["▍", "Hel▍", "Hello▍", "Hello"]);
        assert!(partials.len() >= 3);
        assert_eq!(
            thinking,
            vec![ThinkingEvent::Thinking, ThinkingEvent::Sleeping]
        );
        assert_eq!(connector.steps(), vec!["START", "BODY", "END"]);
        assert_eq!(connector.closes(), 1);
    }

    #[tokio::test]
    async fn knowledge_requests_start_with_retrieval_placeholder() {
        let connector = ScriptedConnector::new(&[
            r#"{"status":"FETCHING_KNOWLEDGE"}"#,
            r#"{"status":"STREAMING","completion":"ok"}"#,
            r#"{"status":"STREAMING_END"}"#,
        ]);
        let mut partials = Vec::new();

        let completion = client(&connector)
            .send(
                &request("hi").with_knowledge(true),
                |text| partials.push(text.to_string()),
                |_| {},
            )
            .await
            .expect("completion");

        assert_eq!(completion, "ok");
        assert_eq!(partials[0], "Retrieving knowledge...");
        assert_eq!(partials[1], "Retrieving knowledge...");
        assert_eq!(partials.last().map(String::as_str), Some("ok"));
    }

    #[tokio::test]
    async fn large_payload_waits_for_every_ack_before_end() {
        let connector = ScriptedConnector::new(&[r#"{"status":"STREAMING_END"}"#]);
        let client = ChatStreamClient::new(
            Arc::new(connector.clone()),
            StreamConfig::new("token-1").with_chunk_size(64),
        );

        let completion = client
            .send(&request(&"x".repeat(300)), |_| {}, |_| {})
            .await
            .expect("completion");

        assert_eq!(completion, "");
        let steps = connector.steps();
        assert!(steps.len() > 3);
        assert_eq!(steps.first().map(String::as_str), Some("START"));
        assert_eq!(steps.last().map(String::as_str), Some("END"));
        assert!(steps[1..steps.len() - 1].iter().all(|step| step == "BODY"));

        let parts: String = connector
            .sent
            .lock()
            .expect("sent lock")
            .iter()
            .filter_map(|frame| frame["part"].as_str().map(str::to_string))
            .collect();
        let payload: serde_json::Value = serde_json::from_str(&parts).expect("reassembled");
        assert_eq!(payload["token"], "token-1");
    }

    #[tokio::test]
    async fn error_frame_fails_and_closes_once() {
        let connector = ScriptedConnector::new(&[
            r#"{"status":"STREAMING","completion":"partial"}"#,
            r#"{"status":"ERROR"}"#,
            r#"{"status":"STREAMING_END"}"#,
        ]);
        let messages = StreamMessages::default();

        let error = client(&connector)
            .send(&request("hi"), |_| {}, |_| {})
            .await
            .expect_err("error frame");

        assert!(matches!(error, StreamError::ServerError { .. }));
        assert_eq!(messages.describe(&error), messages.invalid_response);
        assert_eq!(connector.closes(), 1);
    }

    #[tokio::test]
    async fn peer_close_before_end_is_prediction_failure() {
        let connector =
            ScriptedConnector::new(&[r#"{"status":"STREAMING","completion":"Hel"}"#]);
        let messages = StreamMessages::default();

        let error = client(&connector)
            .send(&request("hi"), |_| {}, |_| {})
            .await
            .expect_err("closed early");

        assert!(matches!(error, StreamError::ClosedBeforeEnd { .. }));
        assert_eq!(messages.describe(&error), messages.prediction_failed);
        assert_eq!(connector.closes(), 0);
    }

    #[tokio::test]
    async fn transport_error_while_streaming_is_prediction_failure() {
        let connector =
            ScriptedConnector::new(&[r#"{"status":"STREAMING","completion":"Hel"}"#]).resetting();
        let messages = StreamMessages::default();
        let mut partials = Vec::new();

        let error = client(&connector)
            .send(&request("hi"), |text| partials.push(text.to_string()), |_| {})
            .await
            .expect_err("reset mid-stream");

        assert!(matches!(error, StreamError::Transport { .. }));
        assert_eq!(error.failure_kind(), FailureKind::PredictionFailed);
        assert_eq!(messages.describe(&error), messages.prediction_failed);
        assert_eq!(partials.last().map(String::as_str), Some("Hel▍"));
        assert_eq!(connector.closes(), 0);
    }

    #[tokio::test]
    async fn failed_frame_send_is_prediction_failure_without_close() {
        let connector = ScriptedConnector::new(&[r#"{"status":"STREAMING_END"}"#]).rejecting("END");

        let error = client(&connector)
            .send(&request("hi"), |_| {}, |_| {})
            .await
            .expect_err("END send fails");

        assert!(matches!(error, StreamError::Transport { .. }));
        assert_eq!(error.failure_kind(), FailureKind::PredictionFailed);
        assert_eq!(connector.steps(), vec!["START", "BODY"]);
        assert_eq!(connector.closes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_handshake_times_out() {
        let connector = ScriptedConnector::new(&[]).silent().hanging();
        let client = ChatStreamClient::new(
            Arc::new(connector.clone()),
            StreamConfig::new("token-1").with_ack_timeout(Duration::from_secs(5)),
        );

        let error = client
            .send(&request("hi"), |_| {}, |_| {})
            .await
            .expect_err("timeout");

        match error {
            StreamError::AckTimeout {
                timeout,
                received,
                expected,
                ..
            } => {
                assert_eq!(timeout, Duration::from_secs(5));
                assert_eq!(received, 0);
                assert_eq!(expected, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(connector.closes(), 1);
    }

    #[tokio::test]
    async fn cancel_closes_channel_and_fails_worker() {
        let connector =
            ScriptedConnector::new(&[r#"{"status":"STREAMING","completion":"Hel"}"#]).hanging();
        let ChatStreamHandle { mut events, worker } = client(&connector)
            .stream_chat(&request("hi"))
            .expect("handle");

        let consumer = async {
            let mut seen = Vec::new();
            while let Some(event) = events.recv().await {
                if event == StreamEvent::Partial("Hel▍".to_string()) {
                    assert!(events.cancel());
                }
                seen.push(event);
            }
            seen
        };

        let (result, seen) = tokio::join!(worker, consumer);

        assert!(matches!(result, Err(StreamError::Cancelled { .. })));
        assert_eq!(seen.len(), 2);
        assert_eq!(connector.closes(), 1);
    }
}
