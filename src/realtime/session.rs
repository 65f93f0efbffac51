//! Realtime session: one streaming connection and the envelope log built
//! from its events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::{
    ClientEvent, FunctionCall, FunctionCallFragment, Role, ServerEvent, ToolChoice, ToolDefinition,
};
use super::transport::{ConnectionGuard, Transport, TransportEvent};
use super::voice::SpeechInterface;
use crate::config::RealtimeConfig;
use crate::error::SessionError;
use crate::message::{Envelope, MessageKind, agents, meta};

/// Envelopes kept in the session log before the oldest are dropped.
const MAX_SESSION_MESSAGES: usize = 500;

/// Capacity of the session event channel.
const EVENT_CAPACITY: usize = 256;

/// Connection state of a session.
///
/// Error states compare equal only when their reasons match.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// States from which a fresh `connect()` may start.
    pub fn can_connect(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Error(_))
    }

    /// States that warrant a reconnection attempt.
    pub fn is_down(&self) -> bool {
        self.can_connect()
    }

    pub fn error_reason(&self) -> Option<&str> {
        match self {
            Self::Error(reason) => Some(reason),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// Events published by a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    /// The server assigned (or confirmed) a session id.
    SessionStarted(String),
    /// An envelope was appended or replaced in the session log.
    MessageUpdated(Envelope),
    /// A function call is ready to be executed.
    FunctionCall(FunctionCall),
}

/// Receives function calls in registration order.
pub trait FunctionCallObserver: Send + Sync {
    fn on_function_call(&self, call: &FunctionCall);
}

/// What the conversation layer needs from a session.
#[async_trait]
pub trait AssistantSession: Send + Sync {
    async fn send_user_message(&self, text: &str) -> bool;

    async fn send_context_message(&self, text: &str) -> bool;

    async fn request_function_call(
        &self,
        text: &str,
        tools: Vec<ToolDefinition>,
        tool_choice: Option<ToolChoice>,
    ) -> bool;

    async fn send_function_result(
        &self,
        name: &str,
        outcome: Result<serde_json::Value, String>,
    ) -> bool;

    fn connection_state(&self) -> ConnectionState;
}

/// The live half of a connection.
struct Link {
    outgoing: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
    _guard: ConnectionGuard,
}

/// A function call being assembled from deltas.
#[derive(Debug, Default)]
struct PendingCall {
    name: String,
    arguments: String,
    call_id: Option<String>,
    notified: bool,
}

impl PendingCall {
    fn snapshot(&self, response_id: &str) -> FunctionCall {
        FunctionCall {
            response_id: response_id.to_string(),
            name: self.name.clone(),
            arguments: self.arguments.clone(),
            call_id: self.call_id.clone(),
        }
    }
}

/// Client for the realtime streaming endpoint.
pub struct RealtimeSession {
    config: RealtimeConfig,
    transport: Arc<dyn Transport>,
    speech: Option<Arc<dyn SpeechInterface>>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
    link: Mutex<Option<Link>>,
    connect_lock: Mutex<()>,
    /// Bumped on every connect/disconnect so stale reader tasks are ignored.
    generation: AtomicU64,
    session_id: RwLock<Option<String>>,
    messages: Mutex<Vec<Envelope>>,
    calls: Mutex<HashMap<String, PendingCall>>,
    /// Latest call id per function name, echoed back with results.
    call_ids: Mutex<HashMap<String, String>>,
    observers: RwLock<Vec<Arc<dyn FunctionCallObserver>>>,
}

impl RealtimeSession {
    /// Create a disconnected session.
    pub fn new(config: RealtimeConfig, transport: Arc<dyn Transport>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            transport,
            speech: None,
            state,
            events,
            link: Mutex::new(None),
            connect_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            session_id: RwLock::new(None),
            messages: Mutex::new(Vec::new()),
            calls: Mutex::new(HashMap::new()),
            call_ids: Mutex::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Builder: attach a speech collaborator.
    pub fn with_speech(mut self, speech: Arc<dyn SpeechInterface>) -> Self {
        self.speech = Some(speech);
        self
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    pub(super) fn speech(&self) -> Option<&Arc<dyn SpeechInterface>> {
        self.speech.as_ref()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Watch the connection state.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Server-assigned session id, once known.
    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    /// Snapshot of the session log.
    pub async fn messages(&self) -> Vec<Envelope> {
        self.messages.lock().await.clone()
    }

    /// Register a function-call observer. Observers run in registration order.
    pub async fn add_function_call_observer(&self, observer: Arc<dyn FunctionCallObserver>) {
        self.observers.write().await.push(observer);
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next.clone());
        if previous != next {
            info!(from = %previous, to = %next, "Realtime session state changed");
            let _ = self.events.send(SessionEvent::StateChanged(next));
        }
    }

    /// Put the session into a terminal error state.
    pub(crate) fn force_error(&self, reason: impl Into<String>) {
        self.set_state(ConnectionState::Error(reason.into()));
    }

    // ── Connection lifecycle ────────────────────────────────────────

    /// Open the connection and send the session configuration.
    ///
    /// Succeeds immediately when already connected and fails while another
    /// connect is in flight.
    pub async fn connect(self: &Arc<Self>) -> Result<(), SessionError> {
        let Ok(_connecting) = self.connect_lock.try_lock() else {
            return Err(SessionError::InvalidState {
                state: ConnectionState::Connecting.to_string(),
            });
        };

        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Connecting => {
                return Err(SessionError::InvalidState {
                    state: ConnectionState::Connecting.to_string(),
                });
            }
            ConnectionState::Disconnected | ConnectionState::Error(_) => {}
        }

        self.set_state(ConnectionState::Connecting);

        let connection = match self.transport.open(&self.config).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(error = %e, "Realtime connection failed");
                self.set_state(ConnectionState::Error(e.to_string()));
                return Err(e);
            }
        };
        let (outgoing, incoming, guard) = connection.into_parts();

        let configure = match serde_json::to_string(&ClientEvent::session_update(&self.config)) {
            Ok(frame) => frame,
            Err(e) => {
                self.set_state(ConnectionState::Error(format!(
                    "failed to serialize session configuration: {e}"
                )));
                return Err(SessionError::Serialization(e));
            }
        };
        if outgoing.send(configure).is_err() {
            let reason = "failed to send session configuration".to_string();
            self.set_state(ConnectionState::Error(reason.clone()));
            return Err(SessionError::SendFailed(reason));
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        // Calls from an earlier connection can never complete.
        self.calls.lock().await.clear();

        // Hold the link lock until the state is published so an immediate
        // close from the reader lands after `Connected`.
        let mut link = self.link.lock().await;
        let reader = tokio::spawn(Self::read_loop(Arc::downgrade(self), generation, incoming));
        *link = Some(Link {
            outgoing,
            reader,
            _guard: guard,
        });
        self.set_state(ConnectionState::Connected);
        drop(link);

        Ok(())
    }

    /// Close the connection.
    pub async fn disconnect(&self) {
        let mut link = self.link.lock().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(live) = link.take() {
            live.reader.abort();
            debug!("Realtime connection torn down");
        }
        drop(link);
        self.calls.lock().await.clear();
        self.set_state(ConnectionState::Disconnected);
    }

    async fn read_loop(
        session: Weak<Self>,
        generation: u64,
        mut incoming: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        while let Some(event) = incoming.recv().await {
            let Some(session) = session.upgrade() else {
                return;
            };
            match event {
                TransportEvent::Frame(text) => session.handle_server_frame(&text).await,
                TransportEvent::Closed(reason) => {
                    session.on_transport_closed(generation, reason).await;
                    return;
                }
                TransportEvent::Failed(reason) => {
                    session.on_transport_failed(generation, reason).await;
                    return;
                }
            }
        }
        if let Some(session) = session.upgrade() {
            session.on_transport_closed(generation, None).await;
        }
    }

    async fn on_transport_closed(&self, generation: u64, reason: Option<String>) {
        let mut link = self.link.lock().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("Ignoring close from a stale connection");
            return;
        }
        link.take();
        info!(reason = ?reason, "Realtime connection closed");
        self.set_state(ConnectionState::Disconnected);
    }

    async fn on_transport_failed(&self, generation: u64, reason: String) {
        let mut link = self.link.lock().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("Ignoring failure from a stale connection");
            return;
        }
        link.take();
        warn!(reason = %reason, "Realtime connection failed");
        self.set_state(ConnectionState::Error(reason));
    }

    // ── Outgoing ────────────────────────────────────────────────────

    /// Serialize and send one frame. Failures are logged and reported as `false`.
    async fn send_frame(&self, event: &ClientEvent) -> bool {
        let text = match serde_json::to_string(event) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to serialize realtime frame");
                return false;
            }
        };
        let link = self.link.lock().await;
        match link.as_ref() {
            Some(live) => {
                if live.outgoing.send(text).is_err() {
                    warn!("Realtime transport closed, frame dropped");
                    false
                } else {
                    true
                }
            }
            None => {
                warn!("No live realtime connection, frame dropped");
                false
            }
        }
    }

    fn ensure_connected(&self, operation: &str) -> bool {
        let state = self.state();
        if !state.is_connected() {
            warn!(state = %state, operation, "Realtime session not connected");
            return false;
        }
        true
    }

    async fn send_turn(
        &self,
        text: &str,
        tools: Option<Vec<ToolDefinition>>,
        tool_choice: Option<ToolChoice>,
    ) -> bool {
        if !self.send_frame(&ClientEvent::text_item(Role::User, text)).await {
            return false;
        }
        self.send_frame(&ClientEvent::response_create(
            self.config.modalities.clone(),
            tools,
            tool_choice,
        ))
        .await
    }

    /// Send user text and request a response.
    ///
    /// The `userInput` envelope is logged before anything goes on the wire.
    pub async fn send_user_message(&self, text: &str) -> bool {
        if !self.ensure_connected("send_user_message") {
            return false;
        }
        self.push_message(Envelope::new(
            MessageKind::UserInput,
            agents::USER,
            agents::REALTIME,
            text,
        ))
        .await;
        self.send_turn(text, None, None).await
    }

    /// Add system-role context to the conversation without requesting a reply.
    pub async fn send_context_message(&self, text: &str) -> bool {
        if !self.ensure_connected("send_context_message") {
            return false;
        }
        self.send_frame(&ClientEvent::text_item(Role::System, text))
            .await
    }

    /// Send user text with tools attached. No `tool_choice` means `"auto"`.
    pub async fn request_function_call(
        &self,
        text: &str,
        tools: Vec<ToolDefinition>,
        tool_choice: Option<ToolChoice>,
    ) -> bool {
        if !self.ensure_connected("request_function_call") {
            return false;
        }
        self.push_message(
            Envelope::new(MessageKind::UserInput, agents::USER, agents::REALTIME, text)
                .with_metadata(meta::SOURCE, "function_request"),
        )
        .await;
        self.send_turn(text, Some(tools), tool_choice).await
    }

    /// Return a function's result or error, then request a new response.
    pub async fn send_function_result(
        &self,
        name: &str,
        outcome: Result<serde_json::Value, String>,
    ) -> bool {
        if !self.ensure_connected("send_function_result") {
            return false;
        }
        let call_id = self.call_ids.lock().await.get(name).cloned();
        if !self
            .send_frame(&ClientEvent::function_output(name, call_id, outcome))
            .await
        {
            return false;
        }
        self.send_frame(&ClientEvent::response_create(
            self.config.modalities.clone(),
            None,
            None,
        ))
        .await
    }

    // ── Incoming ────────────────────────────────────────────────────

    /// Apply one server frame to the session.
    pub async fn handle_server_frame(&self, text: &str) {
        let event = match ServerEvent::parse(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Unparseable realtime frame");
                return;
            }
        };

        match event {
            ServerEvent::SessionCreated { session } | ServerEvent::SessionUpdated { session } => {
                if let Some(id) = session.id {
                    let mut current = self.session_id.write().await;
                    if current.as_deref() != Some(id.as_str()) {
                        info!(session_id = %id, "Realtime session established");
                        *current = Some(id.clone());
                        let _ = self.events.send(SessionEvent::SessionStarted(id));
                    }
                }
            }
            ServerEvent::TextDelta { response_id, delta } => {
                self.apply_text_delta(&response_id, &delta).await;
            }
            ServerEvent::FunctionCallDelta { response_id, delta } => {
                self.apply_function_call_delta(&response_id, delta.function_call)
                    .await;
            }
            ServerEvent::ResponseDone {
                response_id,
                response,
            } => match response_id.or(response.map(|r| r.id)) {
                Some(id) => self.complete_response(&id).await,
                None => warn!("response.done without a response id"),
            },
            ServerEvent::Error { error } => {
                warn!(code = ?error.code, message = %error.message, "Realtime server error");
                let mut envelope = Envelope::new(
                    MessageKind::Error,
                    agents::REALTIME,
                    agents::USER,
                    error.message,
                );
                if let Some(code) = error.code {
                    envelope = envelope.with_metadata("code", code);
                }
                self.push_message(envelope).await;
            }
            ServerEvent::Unknown => {
                debug!("Ignoring unhandled realtime event type");
            }
        }
    }

    async fn apply_text_delta(&self, response_id: &str, delta: &str) {
        self.upsert(response_id, false, |existing| match existing {
            Some(envelope) => envelope.appended(delta),
            None => Envelope::new(
                MessageKind::AssistantOutput,
                agents::REALTIME,
                agents::USER,
                delta,
            )
            .with_metadata(meta::RESPONSE_ID, response_id)
            .with_metadata(meta::IS_COMPLETE, "false"),
        })
        .await;
    }

    async fn apply_function_call_delta(&self, response_id: &str, fragment: FunctionCallFragment) {
        let (call, notify) = {
            let mut calls = self.calls.lock().await;
            let pending = calls.entry(response_id.to_string()).or_default();
            if let Some(name) = fragment.name.filter(|n| !n.is_empty()) {
                pending.name = name;
            }
            if let Some(arguments) = fragment.arguments {
                pending.arguments.push_str(&arguments);
            }
            if fragment.call_id.is_some() {
                pending.call_id = fragment.call_id;
            }
            if pending.name.is_empty() {
                return;
            }
            let call = pending.snapshot(response_id);
            // Observers get the call once its arguments form complete JSON.
            let notify = !pending.notified && call.parsed_arguments().is_some();
            if notify {
                pending.notified = true;
            }
            (call, notify)
        };

        let content = match serde_json::to_string(&call) {
            Ok(content) => content,
            Err(e) => {
                warn!(error = %e, "Failed to serialize function call");
                return;
            }
        };
        let name = call.name.clone();
        self.upsert(response_id, true, move |existing| match existing {
            Some(envelope) => envelope.revised(content, [(meta::FUNCTION_NAME, name.as_str())]),
            None => Envelope::new(
                MessageKind::AssistantOutput,
                agents::REALTIME,
                agents::USER,
                content,
            )
            .with_metadata(meta::RESPONSE_ID, response_id)
            .with_metadata(meta::FUNCTION_CALL, "true")
            .with_metadata(meta::FUNCTION_NAME, name.as_str())
            .with_metadata(meta::IS_COMPLETE, "false"),
        })
        .await;

        if notify {
            self.notify_function_call(call).await;
        }
    }

    async fn notify_function_call(&self, call: FunctionCall) {
        if let Some(call_id) = &call.call_id {
            self.call_ids
                .lock()
                .await
                .insert(call.name.clone(), call_id.clone());
        }
        info!(name = %call.name, response_id = %call.response_id, "Function call received");
        let observers = self.observers.read().await.clone();
        for observer in observers {
            observer.on_function_call(&call);
        }
        let _ = self.events.send(SessionEvent::FunctionCall(call));
    }

    async fn complete_response(&self, response_id: &str) {
        let pending = self.calls.lock().await.remove(response_id);
        if let Some(pending) = pending
            && !pending.name.is_empty()
            && !pending.notified
        {
            self.notify_function_call(pending.snapshot(response_id)).await;
        }

        let completed: Vec<Envelope> = {
            let mut messages = self.messages.lock().await;
            let mut completed = Vec::new();
            for slot in messages
                .iter_mut()
                .filter(|m| m.response_id() == Some(response_id))
            {
                let next = slot.revised(slot.content().to_string(), [(meta::IS_COMPLETE, "true")]);
                *slot = next.clone();
                completed.push(next);
            }
            if completed.is_empty() {
                let empty = Envelope::new(
                    MessageKind::AssistantOutput,
                    agents::REALTIME,
                    agents::USER,
                    "",
                )
                .with_metadata(meta::RESPONSE_ID, response_id)
                .with_metadata(meta::IS_COMPLETE, "true");
                messages.push(empty.clone());
                trim_log(&mut messages);
                completed.push(empty);
            }
            completed
        };

        debug!(response_id, "Realtime response complete");
        for envelope in &completed {
            let _ = self.events.send(SessionEvent::MessageUpdated(envelope.clone()));
        }

        if self.config.speak_responses {
            let spoken = completed
                .iter()
                .find(|e| !e.flag(meta::FUNCTION_CALL) && !e.content().is_empty())
                .map(|e| e.content().to_string());
            if let Some(text) = spoken {
                self.speak(text).await;
            }
        }
    }

    async fn speak(&self, text: String) {
        let Some(speech) = self.speech.clone() else {
            return;
        };
        self.push_message(Envelope::new(
            MessageKind::VoiceOutput,
            agents::REALTIME,
            agents::USER,
            text.clone(),
        ))
        .await;
        tokio::spawn(async move {
            if let Err(e) = speech.speak(&text).await {
                warn!(error = %e, "Failed to speak response");
            }
        });
    }

    // ── Log ─────────────────────────────────────────────────────────

    pub(super) async fn push_message(&self, envelope: Envelope) {
        {
            let mut messages = self.messages.lock().await;
            messages.push(envelope.clone());
            trim_log(&mut messages);
        }
        let _ = self.events.send(SessionEvent::MessageUpdated(envelope));
    }

    /// Replace the latest envelope for `response_id` (or append a new one).
    async fn upsert<F>(&self, response_id: &str, function_call: bool, build: F)
    where
        F: FnOnce(Option<&Envelope>) -> Envelope,
    {
        let next = {
            let mut messages = self.messages.lock().await;
            let position = messages.iter().rposition(|m| {
                m.response_id() == Some(response_id) && m.flag(meta::FUNCTION_CALL) == function_call
            });
            let next = build(position.map(|i| &messages[i]));
            match position {
                Some(i) => messages[i] = next.clone(),
                None => {
                    messages.push(next.clone());
                    trim_log(&mut messages);
                }
            }
            next
        };
        let _ = self.events.send(SessionEvent::MessageUpdated(next));
    }
}

fn trim_log(messages: &mut Vec<Envelope>) {
    if messages.len() > MAX_SESSION_MESSAGES {
        let excess = messages.len() - MAX_SESSION_MESSAGES;
        messages.drain(..excess);
    }
}

#[async_trait]
impl AssistantSession for RealtimeSession {
    async fn send_user_message(&self, text: &str) -> bool {
        RealtimeSession::send_user_message(self, text).await
    }

    async fn send_context_message(&self, text: &str) -> bool {
        RealtimeSession::send_context_message(self, text).await
    }

    async fn request_function_call(
        &self,
        text: &str,
        tools: Vec<ToolDefinition>,
        tool_choice: Option<ToolChoice>,
    ) -> bool {
        RealtimeSession::request_function_call(self, text, tools, tool_choice).await
    }

    async fn send_function_result(
        &self,
        name: &str,
        outcome: Result<serde_json::Value, String>,
    ) -> bool {
        RealtimeSession::send_function_result(self, name, outcome).await
    }

    fn connection_state(&self) -> ConnectionState {
        self.state()
    }
}
