//! Configuration types.
//!
//! Everything here is built once at startup and handed to the components
//! that need it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::context::ContextType;
use crate::error::ConfigError;

/// Default system instructions sent with `session.update`.
pub const DEFAULT_INSTRUCTIONS: &str = "You are a voice-driven coding assistant. \
Keep spoken answers short, confirm planned work back to the user, and ask before \
running anything destructive in the terminal.";

/// Default realtime endpoint.
pub const DEFAULT_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// Top-level configuration.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub realtime: RealtimeConfig,
    pub conversation: ConversationConfig,
    pub context: ContextConfig,
    pub orchestrator: OrchestratorConfig,
    pub runtime: RuntimePaths,
}

impl AppConfig {
    /// Build the full configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            realtime: RealtimeConfig::from_env()?,
            conversation: ConversationConfig::from_env(),
            context: ContextConfig::from_env(),
            orchestrator: OrchestratorConfig::from_env(),
            runtime: RuntimePaths::from_env(),
        })
    }
}

/// Realtime session configuration.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Endpoint URL (the model is appended as a query parameter).
    pub url: String,
    pub api_key: SecretString,
    pub model: String,
    pub instructions: String,
    /// Enabled output modalities, e.g. `["text", "audio"]`.
    pub modalities: Vec<String>,
    pub voice: String,
    pub temperature: f32,
    pub input_audio_format: String,
    pub output_audio_format: String,
    /// Maximum reconnection attempts before the session is left in error.
    pub max_reconnect_attempts: u32,
    /// Fixed delay between reconnection attempts.
    pub reconnect_interval: Duration,
    /// Speak completed replies through the speech interface, if one is attached.
    pub speak_responses: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REALTIME_URL.to_string(),
            api_key: SecretString::from(String::new()),
            model: "gpt-4o-realtime-preview".to_string(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            modalities: vec!["text".to_string()],
            voice: "alloy".to_string(),
            temperature: 0.8,
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            max_reconnect_attempts: 5,
            reconnect_interval: Duration::from_secs(2),
            speak_responses: false,
        }
    }
}

impl RealtimeConfig {
    /// Load from environment. `OPENAI_API_KEY` is required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("OPENAI_API_KEY".to_string()))?;

        let defaults = Self::default();

        let temperature = match std::env::var("VOICE_PILOT_TEMPERATURE") {
            Ok(raw) => {
                let value: f32 = raw.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "VOICE_PILOT_TEMPERATURE".to_string(),
                    message: format!("not a number: {raw}"),
                })?;
                if !(0.0..=2.0).contains(&value) {
                    return Err(ConfigError::InvalidValue {
                        key: "VOICE_PILOT_TEMPERATURE".to_string(),
                        message: format!("{value} is outside 0.0..=2.0"),
                    });
                }
                value
            }
            Err(_) => defaults.temperature,
        };

        let modalities: Vec<String> = std::env::var("VOICE_PILOT_MODALITIES")
            .map(|s| {
                s.split(',')
                    .map(|m| m.trim().to_string())
                    .filter(|m| !m.is_empty())
                    .collect()
            })
            .unwrap_or(defaults.modalities);

        Ok(Self {
            url: std::env::var("VOICE_PILOT_REALTIME_URL").unwrap_or(defaults.url),
            api_key: SecretString::from(api_key),
            model: std::env::var("VOICE_PILOT_MODEL").unwrap_or(defaults.model),
            instructions: std::env::var("VOICE_PILOT_INSTRUCTIONS")
                .unwrap_or(defaults.instructions),
            modalities,
            voice: std::env::var("VOICE_PILOT_VOICE").unwrap_or(defaults.voice),
            temperature,
            input_audio_format: defaults.input_audio_format,
            output_audio_format: defaults.output_audio_format,
            max_reconnect_attempts: std::env::var("VOICE_PILOT_MAX_RECONNECTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_reconnect_attempts),
            reconnect_interval: std::env::var("VOICE_PILOT_RECONNECT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.reconnect_interval),
            speak_responses: std::env::var("VOICE_PILOT_SPEAK")
                .map(|s| matches!(s.as_str(), "1" | "true" | "yes"))
                .unwrap_or(defaults.speak_responses),
        })
    }

    /// Full connection URL including the model parameter.
    pub fn endpoint(&self) -> String {
        if self.url.contains('?') {
            format!("{}&model={}", self.url, self.model)
        } else {
            format!("{}?model={}", self.url, self.model)
        }
    }
}

/// Conversation log windowing.
#[derive(Debug, Clone)]
pub struct ConversationConfig {
    /// Messages retained in the agent log.
    pub max_retained: usize,
    /// Floor for the retained window.
    pub min_retained: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_retained: 50,
            min_retained: 10,
        }
    }
}

impl ConversationConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_retained = std::env::var("VOICE_PILOT_MAX_MESSAGES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_retained);
        Self {
            max_retained,
            ..defaults
        }
        .normalized()
    }

    /// Clamp `max_retained` so it never drops below `min_retained`.
    pub fn normalized(mut self) -> Self {
        self.max_retained = self.max_retained.max(self.min_retained);
        self
    }
}

/// Context aggregation settings.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Per-type token budget overrides. Types not listed use their default.
    pub token_budgets: HashMap<ContextType, usize>,
    /// Interval of the background refresh loop.
    pub refresh_interval: Duration,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_budgets: HashMap::new(),
            refresh_interval: Duration::from_secs(60),
        }
    }
}

impl ContextConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut token_budgets = HashMap::new();
        for ty in ContextType::ALL {
            let key = format!("VOICE_PILOT_BUDGET_{}", ty.env_suffix());
            if let Some(budget) = std::env::var(&key).ok().and_then(|s| s.parse().ok()) {
                token_budgets.insert(ty, budget);
            }
        }
        Self {
            token_budgets,
            refresh_interval: std::env::var("VOICE_PILOT_REFRESH_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.refresh_interval),
        }
    }

    /// Token budget for a context type.
    pub fn budget_for(&self, ty: ContextType) -> usize {
        self.token_budgets
            .get(&ty)
            .copied()
            .unwrap_or_else(|| ty.default_budget())
    }
}

/// Lifecycle settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How long shutdown waits for pending tasks.
    pub shutdown_timeout: Duration,
    /// Poll interval while waiting for pending tasks.
    pub pending_poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(5),
            pending_poll_interval: Duration::from_millis(100),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            shutdown_timeout: std::env::var("VOICE_PILOT_SHUTDOWN_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
            ..defaults
        }
    }
}

/// Filesystem locations and external tool paths resolved at startup.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    /// Root for persisted plan, context and backups.
    pub data_dir: PathBuf,
    /// Optional directory for rolling log files.
    pub log_dir: Option<PathBuf>,
    /// Shell used to run terminal commands.
    pub shell: String,
    /// Working directory for terminal commands.
    pub working_dir: Option<PathBuf>,
}

impl Default for RuntimePaths {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self {
            data_dir: PathBuf::from(home).join(".voice-pilot"),
            log_dir: None,
            shell: "sh".to_string(),
            working_dir: None,
        }
    }
}

impl RuntimePaths {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("VOICE_PILOT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            log_dir: std::env::var("VOICE_PILOT_LOG_DIR").ok().map(PathBuf::from),
            shell: std::env::var("VOICE_PILOT_SHELL").unwrap_or(defaults.shell),
            working_dir: std::env::var("VOICE_PILOT_WORKDIR").ok().map(PathBuf::from),
        }
    }
}
