//! Realtime wire protocol: JSON text frames tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::config::RealtimeConfig;

// ── Client → server ─────────────────────────────────────────────────────

/// Frames sent to the realtime endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    #[serde(rename = "response.create")]
    ResponseCreate { response: ResponseSettings },
}

impl ClientEvent {
    /// The initial configuration frame.
    pub fn session_update(config: &RealtimeConfig) -> Self {
        Self::SessionUpdate {
            session: SessionSettings {
                instructions: config.instructions.clone(),
                modalities: config.modalities.clone(),
                voice: config.voice.clone(),
                temperature: config.temperature,
                input_audio_format: config.input_audio_format.clone(),
                output_audio_format: config.output_audio_format.clone(),
            },
        }
    }

    /// A text message from the given role.
    pub fn text_item(role: Role, text: impl Into<String>) -> Self {
        Self::ConversationItemCreate {
            item: ConversationItem::Message {
                role,
                content: vec![ContentPart::InputText { text: text.into() }],
            },
        }
    }

    /// A function result or error under the function's name.
    pub fn function_output(
        name: impl Into<String>,
        call_id: Option<String>,
        outcome: Result<serde_json::Value, String>,
    ) -> Self {
        let output = match outcome {
            Ok(result) => serde_json::json!({ "result": result }),
            Err(error) => serde_json::json!({ "error": error }),
        };
        Self::ConversationItemCreate {
            item: ConversationItem::FunctionCallOutput {
                name: name.into(),
                call_id,
                output: output.to_string(),
            },
        }
    }

    /// A response request.
    pub fn response_create(
        modalities: Vec<String>,
        tools: Option<Vec<ToolDefinition>>,
        tool_choice: Option<ToolChoice>,
    ) -> Self {
        // Tools without an explicit choice leave the selection to the model.
        let tool_choice = match (&tools, tool_choice) {
            (Some(_), None) => Some(ToolChoice::auto()),
            (_, choice) => choice,
        };
        Self::ResponseCreate {
            response: ResponseSettings {
                modalities,
                tools,
                tool_choice,
            },
        }
    }
}

/// Session settings carried by `session.update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub instructions: String,
    pub modalities: Vec<String>,
    pub voice: String,
    pub temperature: f32,
    pub input_audio_format: String,
    pub output_audio_format: String,
}

/// Speaker of a conversation item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// A conversation item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItem {
    Message {
        role: Role,
        content: Vec<ContentPart>,
    },
    FunctionCallOutput {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        output: String,
    },
}

/// One content part of a message item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    InputText { text: String },
}

/// Settings carried by `response.create`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSettings {
    pub modalities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
}

/// A function the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            kind: "function".to_string(),
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Tool selection strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    /// `"auto"`, `"none"` or `"required"`.
    Mode(ToolMode),
    /// Force a specific function.
    Function {
        #[serde(rename = "type")]
        kind: String,
        name: String,
    },
}

/// Named tool selection modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolMode {
    Auto,
    None,
    Required,
}

impl ToolChoice {
    /// Let the model decide.
    pub fn auto() -> Self {
        Self::Mode(ToolMode::Auto)
    }

    /// Force the named function.
    pub fn function(name: impl Into<String>) -> Self {
        Self::Function {
            kind: "function".to_string(),
            name: name.into(),
        }
    }
}

// ── Server → client ─────────────────────────────────────────────────────

/// Frames received from the realtime endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: SessionInfo,
    },

    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        session: SessionInfo,
    },

    #[serde(rename = "response.text.delta")]
    TextDelta { response_id: String, delta: String },

    #[serde(rename = "response.function_call.delta")]
    FunctionCallDelta {
        response_id: String,
        delta: FunctionCallDeltaBody,
    },

    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response_id: Option<String>,
        #[serde(default)]
        response: Option<ResponseRef>,
    },

    #[serde(rename = "error")]
    Error { error: ErrorBody },

    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    /// Parse one text frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseRef {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionCallDeltaBody {
    pub function_call: FunctionCallFragment,
}

/// Partial function call data; either field may be absent in a given delta.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FunctionCallFragment {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
    #[serde(default)]
    pub call_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
}

/// A function call assembled from deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub response_id: String,
    pub name: String,
    pub arguments: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

impl FunctionCall {
    /// Arguments parsed as JSON, if they are complete.
    pub fn parsed_arguments(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.arguments).ok()
    }
}
