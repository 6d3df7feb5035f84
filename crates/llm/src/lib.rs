//! Streaming client for the chunked WebSocket chat endpoint.

mod channel;
mod error;
mod events;
mod protocol;
mod request;
mod session;
mod thinking;

pub use channel::{BoxFuture, ChannelConnector, StreamChannel, WebSocketChannel, WebSocketConnector};
pub use error::{FailureKind, StreamError, StreamResult};
pub use events::{StreamEvent, StreamMessages};
pub use protocol::{
    CHUNK_SIZE, ControlFrame, SessionAction, SessionMachine, SessionPhase, StatusFrame,
    chunk_payload,
};
pub use request::{DEFAULT_MODEL, MessageInput, SendRequest, encode_payload};
pub use session::{
    ChatEventStream, ChatStreamClient, ChatStreamHandle, DEFAULT_ACK_TIMEOUT, SessionWorker,
    StreamConfig,
};
pub use thinking::ThinkingTracker;
