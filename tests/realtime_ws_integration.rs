//! Integration tests for the realtime session over a real WebSocket.
//!
//! Each test spins up an Axum server on a random port that plays the
//! realtime endpoint, and drives it through `WebSocketTransport`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use voice_pilot::agents::ShellExecutor;
use voice_pilot::config::{AppConfig, RealtimeConfig};
use voice_pilot::message::MessageKind;
use voice_pilot::orchestrator::{Orchestrator, OrchestratorState};
use voice_pilot::realtime::{ConnectionState, RealtimeSession, SessionManager, WebSocketTransport};
use voice_pilot::store::FileStorage;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Scripted realtime endpoint.
struct FakeEndpoint {
    frames: mpsc::UnboundedSender<Value>,
    connections: AtomicU32,
    /// Close the first connection right after its `session.update`.
    drop_first: bool,
}

async fn ws_handler(State(endpoint): State<Arc<FakeEndpoint>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve_socket(endpoint, socket))
}

async fn send_json(socket: &mut WebSocket, value: Value) -> bool {
    socket.send(Message::Text(value.to_string().into())).await.is_ok()
}

async fn serve_socket(endpoint: Arc<FakeEndpoint>, mut socket: WebSocket) {
    let connection = endpoint.connections.fetch_add(1, Ordering::SeqCst) + 1;
    let mut responses = 0;

    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let frame: Value = serde_json::from_str(text.as_str()).expect("client sent invalid JSON");
        let kind = frame["type"].as_str().unwrap_or_default().to_string();
        let _ = endpoint.frames.send(frame);

        match kind.as_str() {
            "session.update" => {
                if endpoint.drop_first && connection == 1 {
                    let _ = socket.send(Message::Close(None)).await;
                    return;
                }
                let created = json!({
                    "type": "session.created",
                    "session": { "id": format!("sess_{connection}") }
                });
                if !send_json(&mut socket, created).await {
                    return;
                }
            }
            "response.create" => {
                responses += 1;
                let response_id = format!("resp_{responses}");
                for delta in ["Hello", " ", "world"] {
                    let frame = json!({
                        "type": "response.text.delta",
                        "response_id": response_id,
                        "delta": delta
                    });
                    if !send_json(&mut socket, frame).await {
                        return;
                    }
                }
                let done = json!({ "type": "response.done", "response": { "id": response_id } });
                if !send_json(&mut socket, done).await {
                    return;
                }
            }
            _ => {}
        }
    }
}

/// Start the fake endpoint; returns its URL and the frames it receives.
async fn start_server(drop_first: bool) -> (String, Arc<FakeEndpoint>, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let endpoint = Arc::new(FakeEndpoint {
        frames: tx,
        connections: AtomicU32::new(0),
        drop_first,
    });
    let app = Router::new()
        .route("/v1/realtime", get(ws_handler))
        .with_state(Arc::clone(&endpoint));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("ws://127.0.0.1:{port}/v1/realtime"), endpoint, rx)
}

fn config_for(url: &str) -> RealtimeConfig {
    RealtimeConfig {
        url: url.to_string(),
        reconnect_interval: Duration::from_millis(50),
        max_reconnect_attempts: 3,
        ..RealtimeConfig::default()
    }
}

/// Receive frames until one of type `kind` arrives.
async fn next_frame_of(rx: &mut mpsc::UnboundedReceiver<Value>, kind: &str) -> Value {
    loop {
        let frame = rx.recv().await.expect("server frame channel closed");
        if frame["type"] == kind {
            return frame;
        }
    }
}

async fn wait_until<F>(mut check: F)
where
    F: AsyncFnMut() -> bool,
{
    while !check().await {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ── Session ──────────────────────────────────────────────────────────

#[tokio::test]
async fn session_configures_and_streams_reply() {
    timeout(TEST_TIMEOUT, async {
        let (url, _endpoint, mut frames) = start_server(false).await;
        let session = Arc::new(RealtimeSession::new(
            config_for(&url),
            Arc::new(WebSocketTransport::new()),
        ));

        session.connect().await.expect("connect failed");
        assert_eq!(session.state(), ConnectionState::Connected);

        let update = next_frame_of(&mut frames, "session.update").await;
        assert_eq!(update["session"]["voice"], "alloy");
        assert_eq!(update["session"]["modalities"], json!(["text"]));

        wait_until(async || session.session_id().await.as_deref() == Some("sess_1")).await;

        assert!(session.send_user_message("hi there").await);
        let item = next_frame_of(&mut frames, "conversation.item.create").await;
        assert_eq!(item["item"]["role"], "user");
        assert_eq!(item["item"]["content"][0]["text"], "hi there");
        next_frame_of(&mut frames, "response.create").await;

        wait_until(async || {
            session.messages().await.iter().any(|m| {
                m.kind() == MessageKind::AssistantOutput
                    && m.is_complete()
                    && m.content() == "Hello world"
            })
        })
        .await;

        let assistant: Vec<_> = session
            .messages()
            .await
            .into_iter()
            .filter(|m| m.kind() == MessageKind::AssistantOutput)
            .collect();
        assert_eq!(assistant.len(), 1);
        assert_eq!(assistant[0].response_id(), Some("resp_1"));

        session.disconnect().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn refused_connection_ends_in_error() {
    timeout(TEST_TIMEOUT, async {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let session = Arc::new(RealtimeSession::new(
            config_for(&format!("ws://127.0.0.1:{port}/v1/realtime")),
            Arc::new(WebSocketTransport::new()),
        ));
        assert!(session.connect().await.is_err());
        assert!(matches!(session.state(), ConnectionState::Error(_)));
        assert!(!session.send_user_message("nobody home").await);
        assert!(session.messages().await.is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn manager_reconnects_after_server_close() {
    timeout(TEST_TIMEOUT, async {
        let (url, endpoint, _frames) = start_server(true).await;
        let session = Arc::new(RealtimeSession::new(
            config_for(&url),
            Arc::new(WebSocketTransport::new()),
        ));
        let manager = Arc::new(SessionManager::new(Arc::clone(&session)));

        manager.start().await.expect("initial connect failed");

        wait_until(async || session.session_id().await.as_deref() == Some("sess_2")).await;
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(endpoint.connections.load(Ordering::SeqCst), 2);
        assert_eq!(manager.attempts(), 0);

        manager.stop().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
    })
    .await
    .expect("test timed out");
}

// ── Whole system ─────────────────────────────────────────────────────

#[tokio::test]
async fn planning_input_sends_context_then_user_turn() {
    timeout(TEST_TIMEOUT, async {
        let (url, _endpoint, mut frames) = start_server(false).await;
        let data = tempfile::tempdir().unwrap();

        let config = AppConfig {
            realtime: config_for(&url),
            ..AppConfig::default()
        };
        let session = Arc::new(RealtimeSession::new(
            config.realtime.clone(),
            Arc::new(WebSocketTransport::new()),
        ));
        let orchestrator = Orchestrator::new(
            config,
            Arc::new(FileStorage::new(data.path())),
            session,
            Arc::new(ShellExecutor::default()),
        );
        orchestrator.start_agents().await.unwrap();
        orchestrator.run().await.unwrap();
        assert_eq!(orchestrator.state(), OrchestratorState::Running);
        next_frame_of(&mut frames, "session.update").await;

        assert!(orchestrator.handle_user_input("what should I plan next?").await);

        let context = next_frame_of(&mut frames, "conversation.item.create").await;
        assert_eq!(context["item"]["role"], "system");
        let text = context["item"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("## Current Plan"));

        let user = next_frame_of(&mut frames, "conversation.item.create").await;
        assert_eq!(user["item"]["role"], "user");

        assert!(orchestrator.shutdown().await);
        assert_eq!(orchestrator.state(), OrchestratorState::Shutdown);
    })
    .await
    .expect("test timed out");
}
