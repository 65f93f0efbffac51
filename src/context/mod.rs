//! Context manager: token-budgeted fragments shared with the assistant.
//!
//! Fragments are keyed by [`ContextType`]. Each one is condensed to its
//! budget before it is stored, persisted through [`Storage`], and served
//! to the rest of the system as read-only snapshots.

pub mod summarize;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agents::{ConversationAgent, PlanningAgent};
use crate::config::ContextConfig;
use crate::error::{Result, StorageError};
use crate::orchestrator::{OrchestratorState, PendingTasks};
use crate::plan::report;
use crate::realtime::ConnectionState;
use crate::store::Storage;

pub use summarize::{estimate_tokens, summarize};

/// Kind of context fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContextType {
    Project,
    Conversation,
    CodeStructure,
    TaskStatus,
    SystemStatus,
    UserPreferences,
}

impl ContextType {
    pub const ALL: [ContextType; 6] = [
        Self::Project,
        Self::Conversation,
        Self::CodeStructure,
        Self::TaskStatus,
        Self::SystemStatus,
        Self::UserPreferences,
    ];

    /// Token budget used when none is configured.
    pub fn default_budget(&self) -> usize {
        match self {
            Self::Project => 2000,
            Self::Conversation => 3000,
            Self::CodeStructure => 2000,
            Self::TaskStatus => 1000,
            Self::SystemStatus => 500,
            Self::UserPreferences => 500,
        }
    }

    /// Suffix of the `VOICE_PILOT_BUDGET_*` override variable.
    pub fn env_suffix(&self) -> &'static str {
        match self {
            Self::Project => "PROJECT",
            Self::Conversation => "CONVERSATION",
            Self::CodeStructure => "CODE_STRUCTURE",
            Self::TaskStatus => "TASK_STATUS",
            Self::SystemStatus => "SYSTEM_STATUS",
            Self::UserPreferences => "USER_PREFERENCES",
        }
    }

    /// File name stem used by file storage.
    pub fn file_stem(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Conversation => "conversation",
            Self::CodeStructure => "codeStructure",
            Self::TaskStatus => "taskStatus",
            Self::SystemStatus => "systemStatus",
            Self::UserPreferences => "userPreferences",
        }
    }

    pub fn heading(&self) -> &'static str {
        match self {
            Self::Project => "Project",
            Self::Conversation => "Conversation",
            Self::CodeStructure => "Code Structure",
            Self::TaskStatus => "Task Status",
            Self::SystemStatus => "System Status",
            Self::UserPreferences => "User Preferences",
        }
    }
}

impl std::fmt::Display for ContextType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.file_stem())
    }
}

/// Components the manager pulls from during a refresh.
#[derive(Clone)]
pub struct ContextSources {
    pub planning: Arc<PlanningAgent>,
    pub conversation: Arc<ConversationAgent>,
    pub session_state: Option<watch::Receiver<ConnectionState>>,
    pub lifecycle: watch::Receiver<OrchestratorState>,
}

/// Clears the refresh flag when the refresh ends, however it ends.
struct RefreshFlag<'a>(&'a AtomicBool);

impl Drop for RefreshFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ContextManager {
    config: ContextConfig,
    storage: Arc<dyn Storage>,
    fragments: RwLock<HashMap<ContextType, String>>,
    refreshing: AtomicBool,
    sources: RwLock<Option<ContextSources>>,
    pending: PendingTasks,
}

impl ContextManager {
    pub fn new(config: ContextConfig, storage: Arc<dyn Storage>, pending: PendingTasks) -> Self {
        Self {
            config,
            storage,
            fragments: RwLock::new(HashMap::new()),
            refreshing: AtomicBool::new(false),
            sources: RwLock::new(None),
            pending,
        }
    }

    pub async fn attach(&self, sources: ContextSources) {
        *self.sources.write().await = Some(sources);
    }

    /// Drop references to the other components.
    pub async fn detach(&self) {
        *self.sources.write().await = None;
    }

    /// Restore persisted fragments. Returns how many were found.
    pub async fn load(&self) -> std::result::Result<usize, StorageError> {
        let mut loaded = HashMap::new();
        for ty in ContextType::ALL {
            if let Some(text) = self.storage.load_context(ty).await? {
                loaded.insert(ty, text);
            }
        }
        let count = loaded.len();
        *self.fragments.write().await = loaded;
        debug!(count, "Context fragments loaded");
        Ok(count)
    }

    pub fn budget_for(&self, ty: ContextType) -> usize {
        self.config.budget_for(ty)
    }

    /// Condense `text` to the budget of `ty`.
    pub fn summarize_context(&self, text: &str, ty: ContextType) -> String {
        summarize(text, self.budget_for(ty))
    }

    /// Current fragment of one type.
    pub async fn context(&self, ty: ContextType) -> Option<String> {
        self.fragments.read().await.get(&ty).cloned()
    }

    async fn store(&self, ty: ContextType, text: &str) -> std::result::Result<String, StorageError> {
        let summarized = self.summarize_context(text, ty);
        self.storage.save_context(ty, &summarized).await?;
        let mut fragments = self.fragments.write().await;
        if summarized.is_empty() {
            fragments.remove(&ty);
        } else {
            fragments.insert(ty, summarized.clone());
        }
        debug!(
            context = %ty,
            tokens = estimate_tokens(&summarized),
            budget = self.budget_for(ty),
            "Context fragment stored"
        );
        Ok(summarized)
    }

    /// Store a fragment. Project context also goes to the planning agent
    /// and triggers a refresh.
    pub async fn update_context_summary(&self, text: &str, ty: ContextType) -> Result<String> {
        let summarized = self.store(ty, text).await?;
        if ty == ContextType::Project {
            let planning = self
                .sources
                .read()
                .await
                .as_ref()
                .map(|sources| sources.planning.clone());
            if let Some(planning) = planning {
                planning.set_project_context(&summarized).await?;
                self.refresh_context_for_agents().await;
            }
        }
        Ok(summarized)
    }

    /// Rebuild project, conversation, task and system fragments.
    ///
    /// Returns `false` when a refresh is already running, nothing is
    /// attached, or a fragment could not be persisted.
    pub async fn refresh_context_for_agents(&self) -> bool {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Context refresh already running");
            return false;
        }
        let _flag = RefreshFlag(&self.refreshing);
        let _task = self.pending.track();

        let Some(sources) = self.sources.read().await.clone() else {
            warn!("Context refresh skipped, no sources attached");
            return false;
        };

        let items = sources.planning.items().await;
        let project = report::project_context(&sources.planning.project_context().await, &items);
        let conversation = sources.conversation.generate_conversation_summary().await;
        let tasks = report::status_report(&items);
        let system = self.system_status(&sources).await;

        let mut ok = true;
        for (ty, text) in [
            (ContextType::Project, project),
            (ContextType::Conversation, conversation),
            (ContextType::TaskStatus, tasks),
            (ContextType::SystemStatus, system),
        ] {
            if let Err(e) = self.store(ty, &text).await {
                warn!(context = %ty, error = %e, "Failed to persist context fragment");
                ok = false;
            }
        }
        if ok {
            info!("Context refreshed");
        }
        ok
    }

    async fn system_status(&self, sources: &ContextSources) -> String {
        let lifecycle = sources.lifecycle.borrow().clone();
        let session = sources
            .session_state
            .as_ref()
            .map(|rx| rx.borrow().to_string())
            .unwrap_or_else(|| "not attached".to_string());
        let counts = sources.planning.counts().await;
        let messages = sources.conversation.message_count().await;

        format!(
            "Orchestrator: {lifecycle}\n\
             Session: {session}\n\
             Pending tasks: {}\n\
             Plan: {} items ({} pending, {} in progress, {} blocked, {} completed, {} cancelled)\n\
             Messages: {messages}\n\
             Updated: {}",
            self.pending.len(),
            counts.total(),
            counts.pending,
            counts.in_progress,
            counts.blocked,
            counts.completed,
            counts.cancelled,
            Utc::now().to_rfc3339(),
        )
    }

    /// Render the requested fragments under `# <Heading>` titles.
    pub async fn get_combined_context(&self, types: &[ContextType]) -> String {
        let fragments = self.fragments.read().await;
        types
            .iter()
            .filter_map(|ty| {
                fragments
                    .get(ty)
                    .filter(|text| !text.trim().is_empty())
                    .map(|text| format!("# {}\n{}", ty.heading(), text))
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Refresh every `interval` until the manager is dropped or the task aborted.
    pub fn spawn_refresh_loop(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.refresh_context_for_agents().await;
            }
            debug!("Context refresh loop stopped");
        })
    }
}
