//! Error types for voice-pilot.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Voice error: {0}")]
    Voice(#[from] VoiceError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Realtime session errors.
///
/// Transport failures end up here; the session state machine decides whether
/// they become a state transition.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Connection to {url} failed: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Operation not valid in state {state}")]
    InvalidState { state: String },

    #[error("Failed to send frame: {0}")]
    SendFailed(String),

    #[error("Failed to serialize frame: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No speech interface attached")]
    NoSpeechInterface,
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    #[error("Invalid backup id: {0:?}")]
    InvalidBackupId(String),

    #[error("Backup format version {found} is newer than supported version {supported}")]
    IncompatibleVersion { found: u32, supported: u32 },
}

/// Plan manipulation errors.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("Plan item {id} not found")]
    ItemNotFound { id: Uuid },

    #[error("Plan version {id} not found")]
    VersionNotFound { id: Uuid },

    #[error("Plan item cannot depend on itself: {id}")]
    SelfDependency { id: Uuid },

    #[error("Could not parse plan request: {0}")]
    Unparseable(String),

    #[error("Invalid request pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Failed to persist plan: {0}")]
    Persistence(#[from] StorageError),
}

/// Command execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Failed to spawn command: {0}")]
    SpawnFailed(String),

    #[error("Command timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Executor not ready after {waited:?}")]
    NotReady { waited: Duration },

    #[error("Command blocked: {reason}")]
    Blocked { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Speech collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error("Speech capture failed: {0}")]
    CaptureFailed(String),

    #[error("Speech synthesis failed: {0}")]
    SynthesisFailed(String),
}

/// Lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Cannot {action} while {state}")]
    InvalidTransition { state: String, action: String },

    #[error("Initialization failed: {0}")]
    InitializationFailed(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
