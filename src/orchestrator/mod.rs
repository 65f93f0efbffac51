//! Orchestrator: owns the component graph and the system lifecycle.
//!
//! Creation order: storage-backed agents, router registrations, the
//! context manager's sources, then (on `run`) the session manager, the
//! session listener and the refresh loop. Shutdown tears these down in
//! reverse and clears every cross-reference.

pub mod pending;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use pending::{PendingGuard, PendingTasks};
pub use state::{OrchestratorState, StateTransition};

use crate::agents::{CommandExecutor, ConversationAgent, PlanningAgent, TerminalAgent};
use crate::config::AppConfig;
use crate::context::{ContextManager, ContextSources, ContextType};
use crate::error::{OrchestratorError, Result};
use crate::message::MessageRouter;
use crate::realtime::{RealtimeSession, SessionManager};
use crate::store::{BackupInfo, Storage};

/// Agents created by `start_agents`.
#[derive(Clone)]
struct Agents {
    conversation: Arc<ConversationAgent>,
    planning: Arc<PlanningAgent>,
    terminal: Arc<TerminalAgent>,
}

pub struct Orchestrator {
    config: AppConfig,
    storage: Arc<dyn Storage>,
    executor: Arc<dyn CommandExecutor>,
    router: Arc<MessageRouter>,
    session: Arc<RealtimeSession>,
    manager: Arc<SessionManager>,
    context: Arc<ContextManager>,
    pending: PendingTasks,
    state: watch::Sender<OrchestratorState>,
    transitions: Mutex<Vec<StateTransition>>,
    agents: RwLock<Option<Agents>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn Storage>,
        session: Arc<RealtimeSession>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        let pending = PendingTasks::new();
        let context = Arc::new(ContextManager::new(
            config.context.clone(),
            storage.clone(),
            pending.clone(),
        ));
        let manager = Arc::new(SessionManager::new(session.clone()));
        let (state, _) = watch::channel(OrchestratorState::Initializing);
        Self {
            config,
            storage,
            executor,
            router: Arc::new(MessageRouter::new()),
            session,
            manager,
            context,
            pending,
            state,
            transitions: Mutex::new(Vec::new()),
            agents: RwLock::new(None),
            background: Mutex::new(Vec::new()),
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn state(&self) -> OrchestratorState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<OrchestratorState> {
        self.state.subscribe()
    }

    /// Every transition so far, oldest first.
    pub async fn transitions(&self) -> Vec<StateTransition> {
        self.transitions.lock().await.clone()
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn session(&self) -> &Arc<RealtimeSession> {
        &self.session
    }

    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn context(&self) -> &Arc<ContextManager> {
        &self.context
    }

    pub fn pending(&self) -> &PendingTasks {
        &self.pending
    }

    pub async fn conversation(&self) -> Option<Arc<ConversationAgent>> {
        self.agents.read().await.as_ref().map(|a| a.conversation.clone())
    }

    pub async fn planning(&self) -> Option<Arc<PlanningAgent>> {
        self.agents.read().await.as_ref().map(|a| a.planning.clone())
    }

    pub async fn terminal(&self) -> Option<Arc<TerminalAgent>> {
        self.agents.read().await.as_ref().map(|a| a.terminal.clone())
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    async fn record(&self, to: OrchestratorState) {
        let from = self.state.send_replace(to.clone());
        if from != to {
            info!(from = %from, to = %to, "Orchestrator state changed");
        }
        self.transitions.lock().await.push(StateTransition {
            from,
            to,
            timestamp: Utc::now(),
        });
    }

    async fn transition(&self, to: OrchestratorState, action: &str) -> Result<()> {
        let current = self.state();
        if !current.can_transition_to(&to) {
            warn!(state = %current, action, "Rejected lifecycle transition");
            return Err(OrchestratorError::InvalidTransition {
                state: current.to_string(),
                action: action.to_string(),
            }
            .into());
        }
        self.record(to).await;
        Ok(())
    }

    /// Load persisted state and wire the agents together.
    pub async fn start_agents(&self) -> Result<()> {
        let current = self.state();
        if !matches!(
            current,
            OrchestratorState::Initializing | OrchestratorState::Error(_)
        ) {
            return Err(OrchestratorError::InvalidTransition {
                state: current.to_string(),
                action: "start agents".to_string(),
            }
            .into());
        }

        match self.wire().await {
            Ok(agents) => {
                *self.agents.write().await = Some(agents);
                self.transition(OrchestratorState::Ready, "start agents").await
            }
            Err(e) => {
                error!(error = %e, "Agent startup failed");
                self.record(OrchestratorState::Error(e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn wire(&self) -> Result<Agents> {
        let planning = Arc::new(PlanningAgent::new(self.storage.clone())?);
        planning.load().await?;
        let fragments = self.context.load().await?;
        debug!(fragments, "Persisted context restored");

        let terminal = Arc::new(TerminalAgent::new(self.executor.clone()));
        self.router.register(planning.clone()).await;
        self.router.register(terminal.clone()).await;

        let conversation = Arc::new(ConversationAgent::new(
            self.config.conversation.clone(),
            self.router.clone(),
        ));
        conversation.attach_session(self.session.clone()).await;

        self.context
            .attach(ContextSources {
                planning: planning.clone(),
                conversation: conversation.clone(),
                session_state: Some(self.session.subscribe_state()),
                lifecycle: self.state.subscribe(),
            })
            .await;

        info!(agents = ?self.router.names().await, "Agents wired");
        Ok(Agents {
            conversation,
            planning,
            terminal,
        })
    }

    /// Connect the session and start the background loops.
    ///
    /// A failed first connect is not fatal: the session manager keeps retrying.
    pub async fn run(&self) -> Result<()> {
        self.transition(OrchestratorState::Running, "run").await?;
        let conversation = self.conversation().await.ok_or_else(|| {
            OrchestratorError::InitializationFailed("agents are not wired".to_string())
        })?;

        let listener = conversation.spawn_session_listener(self.session.subscribe());
        let refresh = self
            .context
            .spawn_refresh_loop(self.config.context.refresh_interval);
        self.background.lock().await.extend([listener, refresh]);

        if let Err(e) = self.manager.start().await {
            warn!(error = %e, "Session not connected yet, retrying in background");
        }
        Ok(())
    }

    /// Stop accepting input without tearing anything down.
    pub async fn pause(&self) -> Result<()> {
        self.transition(OrchestratorState::Paused, "pause").await
    }

    /// Return to the state the last pause was taken from.
    pub async fn resume(&self) -> Result<()> {
        let target = self
            .transitions
            .lock()
            .await
            .iter()
            .rev()
            .find(|t| t.to == OrchestratorState::Paused)
            .map_or(OrchestratorState::Running, |t| t.from.clone());
        self.transition(target, "resume").await
    }

    /// Forward typed input to the conversation agent while running.
    pub async fn handle_user_input(&self, text: &str) -> bool {
        let state = self.state();
        if state != OrchestratorState::Running {
            info!(state = %state, "Input ignored, system is not running");
            return false;
        }
        let Some(conversation) = self.conversation().await else {
            return false;
        };
        let _task = self.pending.track();
        conversation.process_user_input(text).await
    }

    // ── Pending tasks ───────────────────────────────────────────────

    pub fn add_pending_task(&self) -> Uuid {
        self.pending.add()
    }

    pub fn complete_pending_task(&self, id: Uuid) -> bool {
        self.pending.complete(id)
    }

    /// Wait for in-flight tasks. Returns `false` on timeout.
    pub async fn wait_for_pending_tasks(&self, timeout: Duration) -> bool {
        self.pending
            .wait_until_empty(timeout, self.config.orchestrator.pending_poll_interval)
            .await
    }

    /// Tear everything down. Always ends in `Shutdown`.
    ///
    /// Returns whether pending tasks drained before the timeout.
    pub async fn shutdown(&self) -> bool {
        if self.state().is_terminal() {
            debug!("Shutdown already in progress or complete");
            return self.pending.is_empty();
        }
        self.record(OrchestratorState::ShutdownInProgress).await;

        let timeout = self.config.orchestrator.shutdown_timeout;
        let drained = self.wait_for_pending_tasks(timeout).await;
        if !drained {
            warn!(
                remaining = self.pending.len(),
                timeout = ?timeout,
                "Shutting down with pending tasks"
            );
        }

        for task in self.background.lock().await.drain(..) {
            task.abort();
        }
        self.manager.stop().await;

        self.router.clear().await;
        self.context.detach().await;
        if let Some(agents) = self.agents.write().await.take() {
            agents.conversation.detach_session().await;
        }

        self.record(OrchestratorState::Shutdown).await;
        info!(drained, "Shutdown complete");
        drained
    }

    // ── Context & backups ───────────────────────────────────────────

    /// Refresh and render every context fragment.
    pub async fn combined_context(&self) -> String {
        self.context.refresh_context_for_agents().await;
        self.context.get_combined_context(&ContextType::ALL).await
    }

    pub async fn create_backup(&self) -> Result<BackupInfo> {
        let _task = self.pending.track();
        let info = self.storage.create_backup().await?;
        info!(backup_id = %info.id, items = info.item_count, "Backup created");
        Ok(info)
    }

    pub async fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        Ok(self.storage.list_backups().await?)
    }

    /// Restore a backup and reload the in-memory state from it.
    pub async fn restore_backup(&self, id: &str) -> Result<BackupInfo> {
        let _task = self.pending.track();
        let info = self.storage.restore_backup(id).await?;
        if let Some(planning) = self.planning().await {
            planning.load().await?;
        }
        self.context.load().await?;
        info!(backup_id = %info.id, "Backup restored");
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::terminal::test_support::ScriptedExecutor;
    use crate::config::{OrchestratorConfig, RealtimeConfig, RuntimePaths};
    use crate::error::Error;
    use crate::plan::PlanItem;
    use crate::realtime::ConnectionState;
    use crate::realtime::transport::test_support::MockTransport;
    use crate::store::{FileStorage, MemoryStorage};

    fn test_config() -> AppConfig {
        AppConfig {
            realtime: RealtimeConfig {
                reconnect_interval: Duration::from_millis(10),
                ..RealtimeConfig::default()
            },
            orchestrator: OrchestratorConfig {
                shutdown_timeout: Duration::from_millis(200),
                pending_poll_interval: Duration::from_millis(10),
            },
            runtime: RuntimePaths::default(),
            ..AppConfig::default()
        }
    }

    fn orchestrator_with(storage: Arc<dyn Storage>) -> (Orchestrator, Arc<MockTransport>) {
        let config = test_config();
        let transport = MockTransport::new();
        let session = Arc::new(RealtimeSession::new(config.realtime.clone(), transport.clone()));
        let orchestrator = Orchestrator::new(
            config,
            storage,
            session,
            Arc::new(ScriptedExecutor::ready_after(0)),
        );
        (orchestrator, transport)
    }

    #[tokio::test]
    async fn full_lifecycle() {
        let (orchestrator, transport) = orchestrator_with(Arc::new(MemoryStorage::new()));
        assert_eq!(orchestrator.state(), OrchestratorState::Initializing);

        orchestrator.start_agents().await.unwrap();
        assert_eq!(orchestrator.state(), OrchestratorState::Ready);
        assert_eq!(
            orchestrator.router().names().await,
            vec!["PlanningAgent".to_string(), "TerminalAgent".to_string()]
        );

        orchestrator.run().await.unwrap();
        assert_eq!(orchestrator.state(), OrchestratorState::Running);
        assert_eq!(orchestrator.session().state(), ConnectionState::Connected);
        assert_eq!(transport.opens(), 1);
        assert!(orchestrator.handle_user_input("hello").await);

        orchestrator.pause().await.unwrap();
        assert!(!orchestrator.handle_user_input("ignored").await);
        orchestrator.resume().await.unwrap();

        assert!(orchestrator.shutdown().await);
        assert_eq!(orchestrator.state(), OrchestratorState::Shutdown);
        assert!(orchestrator.router().names().await.is_empty());
        assert!(orchestrator.conversation().await.is_none());
        assert_eq!(orchestrator.session().state(), ConnectionState::Disconnected);
        assert!(!orchestrator.session_manager().is_active());

        let path: Vec<OrchestratorState> = orchestrator
            .transitions()
            .await
            .into_iter()
            .map(|t| t.to)
            .collect();
        assert_eq!(
            path,
            vec![
                OrchestratorState::Ready,
                OrchestratorState::Running,
                OrchestratorState::Paused,
                OrchestratorState::Running,
                OrchestratorState::ShutdownInProgress,
                OrchestratorState::Shutdown,
            ]
        );
    }

    #[tokio::test]
    async fn pause_before_run_resumes_to_ready() {
        let (orchestrator, transport) = orchestrator_with(Arc::new(MemoryStorage::new()));
        orchestrator.start_agents().await.unwrap();

        orchestrator.pause().await.unwrap();
        assert_eq!(orchestrator.state(), OrchestratorState::Paused);
        assert!(!orchestrator.handle_user_input("ignored").await);

        orchestrator.resume().await.unwrap();
        assert_eq!(orchestrator.state(), OrchestratorState::Ready);
        assert_eq!(transport.opens(), 0);

        orchestrator.run().await.unwrap();
        assert_eq!(orchestrator.state(), OrchestratorState::Running);
        assert!(orchestrator.shutdown().await);
    }

    #[tokio::test]
    async fn run_requires_ready() {
        let (orchestrator, _) = orchestrator_with(Arc::new(MemoryStorage::new()));
        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Orchestrator(OrchestratorError::InvalidTransition { .. })
        ));
        assert_eq!(orchestrator.state(), OrchestratorState::Initializing);
    }

    #[tokio::test]
    async fn startup_failure_enters_error_state() {
        let not_a_dir = tempfile::NamedTempFile::new().unwrap();
        let (orchestrator, _) =
            orchestrator_with(Arc::new(FileStorage::new(not_a_dir.path().to_path_buf())));
        assert!(orchestrator.start_agents().await.is_err());
        assert!(matches!(orchestrator.state(), OrchestratorState::Error(_)));
        assert!(orchestrator.conversation().await.is_none());

        // Shutdown still completes from the error state.
        assert!(orchestrator.shutdown().await);
        assert_eq!(orchestrator.state(), OrchestratorState::Shutdown);
    }

    #[tokio::test]
    async fn shutdown_reports_undrained_tasks() {
        let (orchestrator, _) = orchestrator_with(Arc::new(MemoryStorage::new()));
        orchestrator.start_agents().await.unwrap();
        let stuck = orchestrator.add_pending_task();

        let started = std::time::Instant::now();
        assert!(!orchestrator.shutdown().await);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(orchestrator.state(), OrchestratorState::Shutdown);
        assert!(orchestrator.complete_pending_task(stuck));
    }

    #[tokio::test]
    async fn pending_tasks_drain_before_shutdown() {
        let (orchestrator, _) = orchestrator_with(Arc::new(MemoryStorage::new()));
        orchestrator.start_agents().await.unwrap();
        let id = orchestrator.add_pending_task();
        let pending = orchestrator.pending().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            pending.complete(id);
        });
        assert!(orchestrator.shutdown().await);
    }

    #[tokio::test]
    async fn backup_restore_reloads_plan() {
        let (orchestrator, _) = orchestrator_with(Arc::new(MemoryStorage::new()));
        orchestrator.start_agents().await.unwrap();
        let planning = orchestrator.planning().await.unwrap();
        let item = planning.add_plan_item(PlanItem::new("Keep me")).await.unwrap();

        let backup = orchestrator.create_backup().await.unwrap();
        assert_eq!(backup.item_count, 1);
        planning.remove_plan_item(item.id).await.unwrap();
        assert!(planning.items().await.is_empty());

        orchestrator.restore_backup(&backup.id).await.unwrap();
        let items = planning.items().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Keep me");
        assert_eq!(orchestrator.list_backups().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn combined_context_includes_system_status() {
        let (orchestrator, _) = orchestrator_with(Arc::new(MemoryStorage::new()));
        orchestrator.start_agents().await.unwrap();
        let combined = orchestrator.combined_context().await;
        assert!(combined.contains("# System Status\nOrchestrator: ready"));
        assert!(combined.contains("Session: disconnected"));
        assert!(combined.contains("# Project\n## Current Plan\nThe plan is empty."));
    }
}
