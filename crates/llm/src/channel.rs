use std::future::Future;
use std::pin::Pin;

use futures::{SinkExt, StreamExt};
use snafu::ResultExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::error::{ConnectSnafu, StreamResult, TransportSnafu};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Bidirectional text channel one streaming session runs over.
pub trait StreamChannel: Send {
    fn send_text<'a>(&'a mut self, text: String) -> BoxFuture<'a, StreamResult<()>>;

    /// Next inbound text frame; `None` once the peer has closed.
    fn next_text<'a>(&'a mut self) -> BoxFuture<'a, Option<StreamResult<String>>>;

    fn close<'a>(&'a mut self) -> BoxFuture<'a, StreamResult<()>>;
}

/// Opens a fresh channel per send.
pub trait ChannelConnector: Send + Sync {
    fn connect<'a>(&'a self) -> BoxFuture<'a, StreamResult<Box<dyn StreamChannel>>>;
}

#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl ChannelConnector for WebSocketConnector {
    fn connect<'a>(&'a self) -> BoxFuture<'a, StreamResult<Box<dyn StreamChannel>>> {
        Box::pin(async move {
            let (stream, response) =
                connect_async(self.url.as_str())
                    .await
                    .context(ConnectSnafu {
                        stage: "websocket-connect",
                        url: self.url.clone(),
                    })?;
            tracing::debug!(
                url = %self.url,
                status = %response.status(),
                "streaming websocket connected"
            );
            Ok(Box::new(WebSocketChannel { stream }) as Box<dyn StreamChannel>)
        })
    }
}

pub struct WebSocketChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl StreamChannel for WebSocketChannel {
    fn send_text<'a>(&'a mut self, text: String) -> BoxFuture<'a, StreamResult<()>> {
        Box::pin(async move {
            self.stream
                .send(Message::Text(text))
                .await
                .context(TransportSnafu {
                    stage: "websocket-send",
                })
        })
    }

    fn next_text<'a>(&'a mut self) -> BoxFuture<'a, Option<StreamResult<String>>> {
        Box::pin(async move {
            loop {
                match self.stream.next().await? {
                    Ok(Message::Text(text)) => return Some(Ok(text)),
                    Ok(Message::Binary(bytes)) => {
                        return Some(Ok(String::from_utf8_lossy(&bytes).into_owned()));
                    }
                    Ok(Message::Close(frame)) => {
                        tracing::debug!(frame = ?frame, "streaming websocket closed by peer");
                        return None;
                    }
                    Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                    Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                        return None;
                    }
                    Err(source) => {
                        return Some(Err(source).context(TransportSnafu {
                            stage: "websocket-receive",
                        }));
                    }
                }
            }
        })
    }

    fn close<'a>(&'a mut self) -> BoxFuture<'a, StreamResult<()>> {
        Box::pin(async move {
            match self.stream.close(None).await {
                Ok(()) => Ok(()),
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    Ok(())
                }
                Err(source) => Err(source).context(TransportSnafu {
                    stage: "websocket-close",
                }),
            }
        })
    }
}
