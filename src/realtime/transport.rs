//! Frame transport for the realtime session.
//!
//! A [`Transport`] opens a [`Connection`]: an outgoing text-frame sender and a
//! stream of [`TransportEvent`]s. Close and failure notifications arrive on
//! that stream and are the only thing that moves the session state machine.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use crate::config::RealtimeConfig;
use crate::error::SessionError;

/// Something that happened on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A text frame from the server.
    Frame(String),
    /// The peer closed the connection.
    Closed(Option<String>),
    /// The connection failed.
    Failed(String),
}

/// One open connection.
pub struct Connection {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<TransportEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    pub fn new(
        outgoing: mpsc::UnboundedSender<String>,
        incoming: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self {
            outgoing,
            incoming,
            tasks: Vec::new(),
        }
    }

    /// Attach an I/O task owned by this connection.
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.tasks.push(task);
        self
    }

    /// Split into the sender, the event receiver and a guard owning the tasks.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<String>,
        mpsc::UnboundedReceiver<TransportEvent>,
        ConnectionGuard,
    ) {
        let Self {
            outgoing,
            incoming,
            tasks,
        } = self;
        (outgoing, incoming, ConnectionGuard { tasks })
    }
}

/// Owns a connection's I/O tasks; aborts them on drop.
pub struct ConnectionGuard {
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Opens connections to the realtime endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, config: &RealtimeConfig) -> Result<Connection, SessionError>;
}

/// WebSocket transport backed by `tokio-tungstenite`.
#[derive(Debug, Default, Clone)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, config: &RealtimeConfig) -> Result<Connection, SessionError> {
        let url = config.endpoint();
        let mut request =
            url.as_str()
                .into_client_request()
                .map_err(|e| SessionError::ConnectionFailed {
                    url: url.clone(),
                    reason: e.to_string(),
                })?;

        let key = config.api_key.expose_secret();
        if !key.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {key}")).map_err(|e| {
                SessionError::ConnectionFailed {
                    url: url.clone(),
                    reason: format!("invalid API key header: {e}"),
                }
            })?;
            request.headers_mut().insert("Authorization", value);
        }
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (stream, _response) = connect_async(request).await.map_err(|e| match e {
            tungstenite::Error::Http(response)
                if matches!(response.status().as_u16(), 401 | 403) =>
            {
                SessionError::AuthRejected(format!("HTTP {}", response.status()))
            }
            other => SessionError::ConnectionFailed {
                url: url.clone(),
                reason: other.to_string(),
            },
        })?;

        info!(url = %url, "Realtime WebSocket connected");

        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let writer_events = event_tx.clone();
        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!(error = %e, "Realtime WebSocket write failed");
                    let _ = writer_events.send(TransportEvent::Failed(e.to_string()));
                    return;
                }
            }
            // Sender dropped: close politely.
            let _ = sink.send(Message::Close(None)).await;
        });

        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if event_tx.send(TransportEvent::Frame(text.to_string())).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty());
                        debug!(reason = ?reason, "Realtime WebSocket closed by peer");
                        let _ = event_tx.send(TransportEvent::Closed(reason));
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Realtime WebSocket read failed");
                        let _ = event_tx.send(TransportEvent::Failed(e.to_string()));
                        return;
                    }
                }
            }
            let _ = event_tx.send(TransportEvent::Closed(None));
        });

        Ok(Connection::new(out_tx, event_rx)
            .with_task(writer)
            .with_task(reader))
    }
}
