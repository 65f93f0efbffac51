//! Envelope data model: the unit exchanged between agents.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Well-known agent identifiers.
pub mod agents {
    pub const USER: &str = "User";
    pub const CONVERSATION: &str = "ConversationAgent";
    pub const PLANNING: &str = "PlanningAgent";
    pub const TERMINAL: &str = "TerminalAgent";
    pub const REALTIME: &str = "RealtimeSession";
    pub const CONTEXT: &str = "ContextManager";
}

/// Well-known metadata keys.
pub mod meta {
    pub const RESPONSE_ID: &str = "responseId";
    pub const IS_COMPLETE: &str = "isComplete";
    pub const PROCESSED: &str = "processed";
    pub const FUNCTION_CALL: &str = "functionCall";
    pub const FUNCTION_NAME: &str = "functionName";
    pub const REQUEST_KIND: &str = "requestKind";
    pub const SOURCE: &str = "source";
    pub const ITEM_ID: &str = "itemId";
}

/// Closed set of envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    UserInput,
    AssistantOutput,
    VoiceInput,
    VoiceOutput,
    TerminalCommand,
    TerminalOutput,
    RequestPlanUpdate,
    PlanUpdateConfirmation,
    RequestPlanQuery,
    PlanQueryResult,
    RequestProjectContext,
    ProjectContextResult,
    RequestPlanSummary,
    PlanSummaryResult,
    Error,
}

impl MessageKind {
    /// The response kind paired with a request kind.
    pub fn response_kind(&self) -> Option<MessageKind> {
        use MessageKind::*;
        match self {
            RequestPlanUpdate => Some(PlanUpdateConfirmation),
            RequestPlanQuery => Some(PlanQueryResult),
            RequestProjectContext => Some(ProjectContextResult),
            RequestPlanSummary => Some(PlanSummaryResult),
            TerminalCommand => Some(TerminalOutput),
            _ => None,
        }
    }

    /// Whether this kind expects a paired response.
    pub fn is_request(&self) -> bool {
        self.response_kind().is_some()
    }

    /// Whether this kind carries user-originated text.
    pub fn is_user_input(&self) -> bool {
        matches!(self, Self::UserInput | Self::VoiceInput)
    }

    /// Whether this kind carries assistant-originated text.
    pub fn is_assistant_output(&self) -> bool {
        matches!(self, Self::AssistantOutput | Self::VoiceOutput)
    }

    /// Wire name (matches the serde representation).
    pub fn as_str(&self) -> &'static str {
        use MessageKind::*;
        match self {
            UserInput => "userInput",
            AssistantOutput => "assistantOutput",
            VoiceInput => "voiceInput",
            VoiceOutput => "voiceOutput",
            TerminalCommand => "terminalCommand",
            TerminalOutput => "terminalOutput",
            RequestPlanUpdate => "requestPlanUpdate",
            PlanUpdateConfirmation => "planUpdateConfirmation",
            RequestPlanQuery => "requestPlanQuery",
            PlanQueryResult => "planQueryResult",
            RequestProjectContext => "requestProjectContext",
            ProjectContextResult => "projectContextResult",
            RequestPlanSummary => "requestPlanSummary",
            PlanSummaryResult => "planSummaryResult",
            Error => "error",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable message between agents.
///
/// Fields are read through accessors. Streaming updates are expressed with
/// [`Envelope::revised`], which keeps the identity and timestamp so the new
/// value can replace the old one in a log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    id: Uuid,
    kind: MessageKind,
    sender: String,
    recipient: String,
    content: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
    created_at: DateTime<Utc>,
}

impl Envelope {
    /// Create a new envelope.
    pub fn new(
        kind: MessageKind,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            sender: sender.into(),
            recipient: recipient.into(),
            content: content.into(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Builder: add one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Build the reply to this envelope: sender and recipient swapped.
    ///
    /// The `source` tag, if any, is carried over.
    pub fn reply(&self, kind: MessageKind, content: impl Into<String>) -> Self {
        let mut reply = Self::new(kind, self.recipient.clone(), self.sender.clone(), content)
            .with_metadata(meta::REQUEST_KIND, self.kind.as_str());
        if let Some(source) = self.meta(meta::SOURCE) {
            reply = reply.with_metadata(meta::SOURCE, source);
        }
        reply
    }

    /// The error reply for a kind the receiving agent does not handle.
    pub fn unhandled(&self, responder: &str) -> Self {
        Self::new(
            MessageKind::Error,
            responder,
            self.sender.clone(),
            format!("Unhandled message kind: {}", self.kind),
        )
        .with_metadata(meta::PROCESSED, "false")
        .with_metadata(meta::REQUEST_KIND, self.kind.as_str())
    }

    /// A replacement for this envelope with new content and extra metadata.
    pub fn revised<I, K, V>(&self, content: impl Into<String>, metadata: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut next = self.clone();
        next.content = content.into();
        for (k, v) in metadata {
            next.metadata.insert(k.into(), v.into());
        }
        next
    }

    /// A replacement for this envelope with `delta` appended to the content.
    pub fn appended(&self, delta: &str) -> Self {
        let mut next = self.clone();
        next.content.push_str(delta);
        next
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Look up a metadata value.
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Interpret a metadata value as a boolean flag (`"true"`).
    pub fn flag(&self, key: &str) -> bool {
        self.meta(key) == Some("true")
    }

    /// The streaming correlation key, if any.
    pub fn response_id(&self) -> Option<&str> {
        self.meta(meta::RESPONSE_ID)
    }

    /// Whether a streamed reply has finished.
    pub fn is_complete(&self) -> bool {
        self.flag(meta::IS_COMPLETE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_request_has_one_response() {
        use MessageKind::*;
        let requests = [
            RequestPlanUpdate,
            RequestPlanQuery,
            RequestProjectContext,
            RequestPlanSummary,
            TerminalCommand,
        ];
        let mut responses: Vec<_> = requests.iter().filter_map(|k| k.response_kind()).collect();
        assert_eq!(responses.len(), requests.len());
        responses.sort_by_key(|k| k.as_str());
        responses.dedup();
        assert_eq!(responses.len(), requests.len());
        assert!(!PlanQueryResult.is_request());
        assert!(!UserInput.is_request());
    }

    #[test]
    fn kind_serde_matches_as_str() {
        let json = serde_json::to_string(&MessageKind::RequestPlanUpdate).unwrap();
        assert_eq!(json, "\"requestPlanUpdate\"");
        let parsed: MessageKind = serde_json::from_str("\"terminalOutput\"").unwrap();
        assert_eq!(parsed, MessageKind::TerminalOutput);
        assert_eq!(MessageKind::PlanSummaryResult.to_string(), "planSummaryResult");
    }

    #[test]
    fn reply_swaps_parties() {
        let request = Envelope::new(
            MessageKind::RequestPlanSummary,
            agents::CONVERSATION,
            agents::PLANNING,
            "",
        );
        let reply = request.reply(MessageKind::PlanSummaryResult, "3 items");
        assert_eq!(reply.sender(), agents::PLANNING);
        assert_eq!(reply.recipient(), agents::CONVERSATION);
        assert_eq!(reply.meta(meta::REQUEST_KIND), Some("requestPlanSummary"));
        assert_ne!(reply.id(), request.id());
    }

    #[test]
    fn reply_carries_source() {
        let request = Envelope::new(MessageKind::TerminalCommand, "A", "B", "ls")
            .with_metadata(meta::SOURCE, "functionCall");
        let reply = request.reply(MessageKind::TerminalOutput, "file.txt");
        assert_eq!(reply.meta(meta::SOURCE), Some("functionCall"));
    }

    #[test]
    fn unhandled_marks_not_processed() {
        let envelope = Envelope::new(MessageKind::VoiceOutput, "A", "B", "hi");
        let err = envelope.unhandled("B");
        assert_eq!(err.kind(), MessageKind::Error);
        assert_eq!(err.recipient(), "A");
        assert!(err.content().contains("voiceOutput"));
        assert_eq!(err.meta(meta::PROCESSED), Some("false"));
    }

    #[test]
    fn revised_keeps_identity() {
        let original = Envelope::new(MessageKind::AssistantOutput, "S", "U", "Hel")
            .with_metadata(meta::RESPONSE_ID, "r1");
        let next = original.revised("Hello", [(meta::IS_COMPLETE, "true")]);
        assert_eq!(next.id(), original.id());
        assert_eq!(next.created_at(), original.created_at());
        assert_eq!(next.content(), "Hello");
        assert_eq!(next.response_id(), Some("r1"));
        assert!(next.is_complete());
        // The original is untouched.
        assert_eq!(original.content(), "Hel");
        assert!(!original.is_complete());
    }
}
