//! Conversation agent: the hub between the user, the session and the
//! background agents.
//!
//! User text and transcriptions enter here. Planning cues pull project
//! context from the planning agent before the text goes to the session;
//! results coming back from other agents are logged and surfaced to the
//! session as system context.

use std::sync::{Arc, LazyLock, Weak};

use regex::Regex;
use serde_json::json;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, info, warn};

use crate::config::ConversationConfig;
use crate::message::{Envelope, MessageKind, MessageRouter, agents, meta};
use crate::realtime::{AssistantSession, FunctionCall, SessionEvent, ToolDefinition};

/// Name of the tool the model calls to run shell commands.
pub const RUN_TERMINAL_COMMAND: &str = "run_terminal_command";

/// Source tag for commands issued on behalf of a model function call.
const FUNCTION_CALL_SOURCE: &str = "functionCall";

static PLANNING_CUES: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:plan(?:s|ning)?|tasks?|todos?|projects?|roadmaps?|milestones?|priorit(?:y|ies)|deadlines?)\b",
    )
    .ok()
});

static TERMINAL_CUES: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:run|execute|terminal|shell|command line)\b").ok());

/// Output longer than this is condensed in summaries.
const CONDENSE_THRESHOLD: usize = 100;
const CONDENSE_MAX_LINES: usize = 6;
const CONDENSE_KEEP_LINES: usize = 3;
const CONDENSE_MAX_CHARS: usize = 200;

/// How the agent reacts to a reply from another agent.
enum Reaction {
    /// Log it and surface the content to the session under a label.
    Forward(&'static str),
    /// Log it only.
    Record,
}

fn reaction_for(envelope: &Envelope) -> Option<Reaction> {
    match envelope.kind() {
        MessageKind::PlanUpdateConfirmation => Some(Reaction::Forward("Plan updated")),
        MessageKind::PlanQueryResult => Some(Reaction::Forward("Plan query result")),
        MessageKind::PlanSummaryResult => Some(Reaction::Forward("Plan summary")),
        MessageKind::TerminalOutput => {
            // Function-call output goes back through send_function_result.
            if envelope.meta(meta::SOURCE) == Some(FUNCTION_CALL_SOURCE) {
                Some(Reaction::Record)
            } else {
                Some(Reaction::Forward("Terminal output"))
            }
        }
        MessageKind::Error => Some(Reaction::Forward("Agent error")),
        MessageKind::ProjectContextResult | MessageKind::AssistantOutput => {
            Some(Reaction::Record)
        }
        _ => None,
    }
}

/// Whole-word cue match.
fn has_cue(text: &str, cues: &LazyLock<Option<Regex>>) -> bool {
    cues.as_ref().is_some_and(|re| re.is_match(text))
}

/// Tool definition offered to the model for terminal requests.
pub fn terminal_tool() -> ToolDefinition {
    ToolDefinition::function(
        RUN_TERMINAL_COMMAND,
        "Run a shell command in the user's working directory and return its output.",
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The command line to execute."
                }
            },
            "required": ["command"]
        }),
    )
}

/// Shorten long terminal output for summaries.
///
/// More than six lines keeps the first and last three around `...`;
/// otherwise the text is cut at 200 characters.
pub fn condense_output(text: &str) -> String {
    if text.chars().count() <= CONDENSE_THRESHOLD {
        return text.to_string();
    }
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() > CONDENSE_MAX_LINES {
        let mut kept: Vec<&str> = lines[..CONDENSE_KEEP_LINES].to_vec();
        kept.push("...");
        kept.extend_from_slice(&lines[lines.len() - CONDENSE_KEEP_LINES..]);
        return kept.join("\n");
    }
    if text.chars().count() <= CONDENSE_MAX_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(CONDENSE_MAX_CHARS).collect();
    format!("{cut}...")
}

pub struct ConversationAgent {
    config: ConversationConfig,
    router: Arc<MessageRouter>,
    log: Mutex<Vec<Envelope>>,
    session: RwLock<Option<Arc<dyn AssistantSession>>>,
}

impl ConversationAgent {
    pub fn new(config: ConversationConfig, router: Arc<MessageRouter>) -> Self {
        Self {
            config: config.normalized(),
            router,
            log: Mutex::new(Vec::new()),
            session: RwLock::new(None),
        }
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub async fn attach_session(&self, session: Arc<dyn AssistantSession>) {
        *self.session.write().await = Some(session);
        debug!("Session attached to conversation agent");
    }

    pub async fn detach_session(&self) {
        *self.session.write().await = None;
    }

    async fn session(&self) -> Option<Arc<dyn AssistantSession>> {
        self.session.read().await.clone()
    }

    /// Snapshot of the log.
    pub async fn messages(&self) -> Vec<Envelope> {
        self.log.lock().await.clone()
    }

    pub async fn message_count(&self) -> usize {
        self.log.lock().await.len()
    }

    async fn append(&self, envelope: Envelope) {
        let mut log = self.log.lock().await;
        log.push(envelope);
        let excess = log.len().saturating_sub(self.config.max_retained);
        if excess > 0 {
            log.drain(..excess);
        }
    }

    /// Insert or replace an envelope mirrored from the session.
    ///
    /// Matches by id, then by `responseId` and the function-call flag.
    async fn mirror(&self, envelope: Envelope) {
        let mut log = self.log.lock().await;
        let position = log.iter().position(|existing| {
            existing.id() == envelope.id()
                || (envelope.response_id().is_some()
                    && existing.kind() == envelope.kind()
                    && existing.response_id() == envelope.response_id()
                    && existing.flag(meta::FUNCTION_CALL) == envelope.flag(meta::FUNCTION_CALL))
        });
        match position {
            Some(pos) => log[pos] = envelope,
            None => {
                log.push(envelope);
                let excess = log.len().saturating_sub(self.config.max_retained);
                if excess > 0 {
                    log.drain(..excess);
                }
            }
        }
    }

    // ── Input ───────────────────────────────────────────────────────

    /// Handle typed user text.
    pub async fn process_user_input(&self, text: &str) -> bool {
        self.process_input(MessageKind::UserInput, text).await
    }

    /// Handle a finished speech transcription.
    pub async fn process_voice_input(&self, text: &str) -> bool {
        self.process_input(MessageKind::VoiceInput, text).await
    }

    async fn process_input(&self, kind: MessageKind, text: &str) -> bool {
        self.append(Envelope::new(kind, agents::USER, agents::CONVERSATION, text))
            .await;

        let Some(session) = self.session().await else {
            warn!(kind = %kind, "No session attached, input not forwarded");
            return false;
        };

        if has_cue(text, &PLANNING_CUES)
            && let Some(context) = self.request_project_context_from_planning_agent().await
            && !context.trim().is_empty()
        {
            debug!("Planning cue found, forwarding project context");
            session
                .send_context_message(&format!("Project context:\n{context}"))
                .await;
        }

        if has_cue(text, &TERMINAL_CUES) {
            debug!("Terminal cue found, offering the terminal tool");
            return session
                .request_function_call(text, vec![terminal_tool()], None)
                .await;
        }
        session.send_user_message(text).await
    }

    // ── Agent protocol ──────────────────────────────────────────────

    /// React to an envelope from another agent and acknowledge it.
    pub async fn process_incoming_agent_message(&self, envelope: Envelope) -> Envelope {
        let Some(reaction) = reaction_for(&envelope) else {
            warn!(kind = %envelope.kind(), sender = %envelope.sender(), "Conversation agent cannot handle message kind");
            return envelope.unhandled(agents::CONVERSATION);
        };

        self.append(envelope.clone()).await;
        if let Reaction::Forward(label) = reaction {
            if let Some(session) = self.session().await {
                let text = format!("{label} ({}):\n{}", envelope.sender(), envelope.content());
                if !session.send_context_message(&text).await {
                    debug!(kind = %envelope.kind(), "Context forward failed");
                }
            } else {
                debug!(kind = %envelope.kind(), "No session attached, result only logged");
            }
        }

        envelope
            .reply(
                MessageKind::AssistantOutput,
                format!("Processed {}", envelope.kind()),
            )
            .with_metadata(meta::PROCESSED, "true")
    }

    /// Log, route and process one outgoing envelope. Returns the reply.
    pub async fn send_agent_message(&self, envelope: Envelope) -> Option<Envelope> {
        self.append(envelope.clone()).await;
        let reply = self.router.route(envelope).await?;
        let ack = self.process_incoming_agent_message(reply.clone()).await;
        debug!(ack = %ack.kind(), "Reply processed");
        Some(reply)
    }

    /// Send a request and keep the reply only if it has the matching kind.
    async fn request(
        &self,
        kind: MessageKind,
        recipient: &str,
        content: &str,
        source: Option<&str>,
    ) -> Option<Envelope> {
        let expected = kind.response_kind()?;
        let mut envelope = Envelope::new(kind, agents::CONVERSATION, recipient, content);
        if let Some(source) = source {
            envelope = envelope.with_metadata(meta::SOURCE, source);
        }
        let reply = self.send_agent_message(envelope).await?;
        if reply.kind() == expected {
            Some(reply)
        } else {
            warn!(
                expected = %expected,
                got = %reply.kind(),
                content = %reply.content(),
                "Unexpected reply kind"
            );
            None
        }
    }

    pub async fn request_project_context_from_planning_agent(&self) -> Option<String> {
        self.request(MessageKind::RequestProjectContext, agents::PLANNING, "", None)
            .await
            .map(|reply| reply.content().to_string())
    }

    /// Ask the planning agent to add an item described by `text`.
    pub async fn request_plan_update(&self, text: &str) -> bool {
        self.request(MessageKind::RequestPlanUpdate, agents::PLANNING, text, None)
            .await
            .is_some()
    }

    pub async fn query_plan(&self, query: &str) -> Option<String> {
        self.request(MessageKind::RequestPlanQuery, agents::PLANNING, query, None)
            .await
            .map(|reply| reply.content().to_string())
    }

    pub async fn request_plan_summary(&self) -> Option<String> {
        self.request(MessageKind::RequestPlanSummary, agents::PLANNING, "", None)
            .await
            .map(|reply| reply.content().to_string())
    }

    /// Run a command through the terminal agent.
    pub async fn run_terminal_command(&self, command: &str) -> Option<String> {
        self.request(MessageKind::TerminalCommand, agents::TERMINAL, command, None)
            .await
            .map(|reply| reply.content().to_string())
    }

    async fn run_function_command(&self, command: &str) -> Result<String, String> {
        let envelope = Envelope::new(
            MessageKind::TerminalCommand,
            agents::CONVERSATION,
            agents::TERMINAL,
            command,
        )
        .with_metadata(meta::SOURCE, FUNCTION_CALL_SOURCE);
        match self.send_agent_message(envelope).await {
            Some(reply) if reply.kind() == MessageKind::TerminalOutput => {
                Ok(reply.content().to_string())
            }
            Some(reply) => Err(reply.content().to_string()),
            None => Err("Terminal agent is not available".to_string()),
        }
    }

    // ── Summary ─────────────────────────────────────────────────────

    /// Render the recent conversation for the context manager.
    pub async fn generate_conversation_summary(&self) -> String {
        let log = self.log.lock().await;
        let window = self
            .config
            .max_retained
            .min(log.len().max(self.config.min_retained));
        let start = log.len().saturating_sub(window);

        let lines: Vec<String> = log[start..]
            .iter()
            .filter_map(|envelope| match envelope.kind() {
                MessageKind::UserInput | MessageKind::VoiceInput => {
                    Some(format!("User: {}", envelope.content()))
                }
                MessageKind::AssistantOutput | MessageKind::VoiceOutput
                    if !envelope.content().is_empty() =>
                {
                    Some(format!("Assistant: {}", envelope.content()))
                }
                MessageKind::TerminalCommand => Some(format!("Command: {}", envelope.content())),
                MessageKind::TerminalOutput => {
                    Some(format!("Output: {}", condense_output(envelope.content())))
                }
                _ => None,
            })
            .collect();

        if lines.is_empty() {
            "No conversation yet.".to_string()
        } else {
            lines.join("\n")
        }
    }

    // ── Session events ──────────────────────────────────────────────

    /// Mirror session output into the log and answer terminal function calls.
    pub fn spawn_session_listener(
        self: &Arc<Self>,
        events: broadcast::Receiver<SessionEvent>,
    ) -> JoinHandle<()> {
        let agent: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut stream = BroadcastStream::new(events);
            while let Some(event) = stream.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped, "Session listener lagged");
                        continue;
                    }
                };
                let Some(agent) = agent.upgrade() else {
                    break;
                };
                match event {
                    SessionEvent::MessageUpdated(envelope)
                        if envelope.kind().is_assistant_output()
                            || envelope.kind() == MessageKind::Error =>
                    {
                        agent.mirror(envelope).await;
                    }
                    SessionEvent::FunctionCall(call) => {
                        tokio::spawn(async move { agent.answer_function_call(call).await });
                    }
                    SessionEvent::SessionStarted(id) => {
                        info!(session_id = %id, "Conversation bound to session");
                    }
                    _ => {}
                }
            }
            debug!("Session listener stopped");
        })
    }

    async fn answer_function_call(&self, call: FunctionCall) {
        let outcome = if call.name == RUN_TERMINAL_COMMAND {
            match call
                .parsed_arguments()
                .and_then(|args| args.get("command")?.as_str().map(str::to_string))
            {
                Some(command) => self
                    .run_function_command(&command)
                    .await
                    .map(|output| json!({ "output": output })),
                None => Err("Missing \"command\" argument".to_string()),
            }
        } else {
            Err(format!("Unknown function: {}", call.name))
        };

        if let Err(e) = &outcome {
            warn!(function = %call.name, error = %e, "Function call failed");
        }
        match self.session().await {
            Some(session) => {
                if !session.send_function_result(&call.name, outcome).await {
                    warn!(function = %call.name, "Could not return function result");
                }
            }
            None => warn!(function = %call.name, "No session attached for function result"),
        }
    }
}
