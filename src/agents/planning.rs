//! Planning agent: owns the plan and answers planning requests.
//!
//! Every mutation is computed on a copy of the current state, persisted,
//! and only then committed, all under one write lock. A failed save leaves
//! memory untouched.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::PlanError;
use crate::message::{AgentEndpoint, Envelope, MessageKind, agents, meta};
use crate::plan::{
    PlanCounts, PlanItem, PlanItemPatch, PlanParser, PlanQuery, PlanStatus, PlanVersion, report,
};
use crate::store::Storage;

#[derive(Debug, Clone, Default)]
struct PlanState {
    items: Vec<PlanItem>,
    versions: Vec<PlanVersion>,
    project_context: String,
}

pub struct PlanningAgent {
    storage: Arc<dyn Storage>,
    parser: PlanParser,
    state: RwLock<PlanState>,
}

impl PlanningAgent {
    pub fn new(storage: Arc<dyn Storage>) -> Result<Self, PlanError> {
        Ok(Self {
            storage,
            parser: PlanParser::new()?,
            state: RwLock::new(PlanState::default()),
        })
    }

    /// Restore items, versions and project context from storage.
    pub async fn load(&self) -> Result<(), PlanError> {
        let items = self.storage.load_plan_items().await?;
        let versions = self.storage.load_plan_versions().await?;
        let project_context = self
            .storage
            .load_project_context()
            .await?
            .unwrap_or_default();

        info!(
            items = items.len(),
            versions = versions.len(),
            "Plan loaded from storage"
        );
        *self.state.write().await = PlanState {
            items,
            versions,
            project_context,
        };
        Ok(())
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub async fn items(&self) -> Vec<PlanItem> {
        self.state.read().await.items.clone()
    }

    pub async fn item(&self, id: Uuid) -> Option<PlanItem> {
        self.state
            .read()
            .await
            .items
            .iter()
            .find(|i| i.id == id)
            .cloned()
    }

    pub async fn counts(&self) -> PlanCounts {
        PlanCounts::from_items(&self.state.read().await.items)
    }

    pub async fn project_context(&self) -> String {
        self.state.read().await.project_context.clone()
    }

    // ── Item mutations ──────────────────────────────────────────────

    /// Run `f` on a copy of the items, persist the result, then commit it.
    async fn mutate_items<T, F>(&self, f: F) -> Result<T, PlanError>
    where
        F: FnOnce(&mut Vec<PlanItem>) -> Result<T, PlanError>,
    {
        let mut state = self.state.write().await;
        let mut next = state.items.clone();
        let out = f(&mut next)?;
        self.storage.save_plan_items(&next).await?;
        state.items = next;
        Ok(out)
    }

    /// Run `f` on one item of a copy of the plan.
    async fn mutate_item<T, F>(&self, id: Uuid, f: F) -> Result<T, PlanError>
    where
        F: FnOnce(&mut PlanItem) -> Result<T, PlanError>,
    {
        self.mutate_items(|items| {
            let item = items
                .iter_mut()
                .find(|i| i.id == id)
                .ok_or(PlanError::ItemNotFound { id })?;
            f(item)
        })
        .await
    }

    pub async fn add_plan_item(&self, item: PlanItem) -> Result<PlanItem, PlanError> {
        let added = item.clone();
        self.mutate_items(move |items| {
            items.push(item);
            Ok(())
        })
        .await?;
        info!(item_id = %added.id, title = %added.title, "Plan item added");
        Ok(added)
    }

    pub async fn update_plan_item(
        &self,
        id: Uuid,
        patch: &PlanItemPatch,
    ) -> Result<PlanItem, PlanError> {
        let updated = self
            .mutate_item(id, |item| {
                item.apply(patch);
                Ok(item.clone())
            })
            .await?;
        debug!(item_id = %id, "Plan item updated");
        Ok(updated)
    }

    /// Remove an item and drop it from other items' dependencies.
    pub async fn remove_plan_item(&self, id: Uuid) -> Result<PlanItem, PlanError> {
        let removed = self
            .mutate_items(|items| {
                let pos = items
                    .iter()
                    .position(|i| i.id == id)
                    .ok_or(PlanError::ItemNotFound { id })?;
                let removed = items.remove(pos);
                for other in items.iter_mut() {
                    other.remove_dependency(id);
                }
                Ok(removed)
            })
            .await?;
        info!(item_id = %id, title = %removed.title, "Plan item removed");
        Ok(removed)
    }

    /// Change an item's status. Returns `false` when it already had that status.
    pub async fn update_status(
        &self,
        id: Uuid,
        status: PlanStatus,
        note: Option<&str>,
    ) -> Result<bool, PlanError> {
        let changed = self
            .mutate_item(id, |item| Ok(item.set_status(status, note)))
            .await?;
        if changed {
            info!(item_id = %id, status = %status, "Plan item status changed");
        }
        Ok(changed)
    }

    /// Make `id` depend on `dependency`. Both items must exist.
    pub async fn add_dependency(&self, id: Uuid, dependency: Uuid) -> Result<bool, PlanError> {
        self.mutate_items(|items| {
            if !items.iter().any(|i| i.id == dependency) {
                return Err(PlanError::ItemNotFound { id: dependency });
            }
            items
                .iter_mut()
                .find(|i| i.id == id)
                .ok_or(PlanError::ItemNotFound { id })?
                .add_dependency(dependency)
        })
        .await
    }

    pub async fn remove_dependency(&self, id: Uuid, dependency: Uuid) -> Result<bool, PlanError> {
        self.mutate_item(id, |item| Ok(item.remove_dependency(dependency)))
            .await
    }

    pub async fn add_tag(&self, id: Uuid, tag: &str) -> Result<bool, PlanError> {
        let tag = tag.trim().trim_start_matches('#').to_lowercase();
        self.mutate_item(id, |item| Ok(item.add_tag(tag))).await
    }

    pub async fn remove_tag(&self, id: Uuid, tag: &str) -> Result<bool, PlanError> {
        let tag = tag.trim().trim_start_matches('#').to_lowercase();
        self.mutate_item(id, |item| Ok(item.remove_tag(&tag))).await
    }

    pub async fn set_project_context(&self, text: &str) -> Result<(), PlanError> {
        let mut state = self.state.write().await;
        self.storage.save_project_context(text).await?;
        state.project_context = text.to_string();
        debug!(chars = text.len(), "Project context updated");
        Ok(())
    }

    // ── Versions ────────────────────────────────────────────────────

    pub async fn list_versions(&self) -> Vec<PlanVersion> {
        self.state.read().await.versions.clone()
    }

    /// Snapshot the current items as a named version.
    pub async fn save_current_plan_as_version(
        &self,
        name: &str,
        description: &str,
    ) -> Result<PlanVersion, PlanError> {
        let mut state = self.state.write().await;
        let version = PlanVersion::new(name, description, state.items.clone());
        let mut versions = state.versions.clone();
        versions.push(version.clone());
        self.storage.save_plan_versions(&versions).await?;
        state.versions = versions;
        info!(version_id = %version.id, name, items = version.items.len(), "Plan version saved");
        Ok(version)
    }

    /// Replace the plan with a saved version, snapshotting the current plan first.
    pub async fn load_version(&self, id: Uuid) -> Result<PlanVersion, PlanError> {
        let mut state = self.state.write().await;
        let version = state
            .versions
            .iter()
            .find(|v| v.id == id)
            .cloned()
            .ok_or(PlanError::VersionNotFound { id })?;

        let snapshot = PlanVersion::new(
            format!("Before loading \"{}\"", version.name),
            "Automatic snapshot",
            state.items.clone(),
        );
        let mut versions = state.versions.clone();
        versions.push(snapshot);

        self.storage.save_plan_versions(&versions).await?;
        self.storage.save_plan_items(&version.items).await?;
        state.versions = versions;
        state.items = version.items.clone();
        info!(version_id = %id, name = %version.name, "Plan version loaded");
        Ok(version)
    }

    /// Replace all items, snapshotting the current plan first.
    pub async fn replace_plan(&self, items: Vec<PlanItem>) -> Result<(), PlanError> {
        let mut state = self.state.write().await;
        let snapshot = PlanVersion::new(
            "Before plan replacement",
            "Automatic snapshot",
            state.items.clone(),
        );
        let mut versions = state.versions.clone();
        versions.push(snapshot);

        self.storage.save_plan_versions(&versions).await?;
        self.storage.save_plan_items(&items).await?;
        info!(previous = state.items.len(), new = items.len(), "Plan replaced");
        state.versions = versions;
        state.items = items;
        Ok(())
    }

    pub async fn delete_version(&self, id: Uuid) -> Result<PlanVersion, PlanError> {
        let mut state = self.state.write().await;
        let mut versions = state.versions.clone();
        let pos = versions
            .iter()
            .position(|v| v.id == id)
            .ok_or(PlanError::VersionNotFound { id })?;
        let removed = versions.remove(pos);
        self.storage.save_plan_versions(&versions).await?;
        state.versions = versions;
        info!(version_id = %id, "Plan version deleted");
        Ok(removed)
    }

    // ── Protocol ────────────────────────────────────────────────────

    /// Answer one planning request.
    pub async fn process_agent_message(&self, envelope: Envelope) -> Envelope {
        debug!(kind = %envelope.kind(), sender = %envelope.sender(), "Planning request");
        match envelope.kind() {
            MessageKind::RequestPlanUpdate => self.handle_plan_update(&envelope).await,
            MessageKind::RequestPlanQuery => {
                let items = self.items().await;
                let text = match PlanQuery::classify(envelope.content()) {
                    PlanQuery::Status => report::status_report(&items),
                    PlanQuery::Priority => report::priority_report(&items),
                    PlanQuery::Summary => report::summary(&items),
                    PlanQuery::Listing => report::listing(&items),
                };
                envelope.reply(MessageKind::PlanQueryResult, text)
            }
            MessageKind::RequestProjectContext => {
                let state = self.state.read().await;
                let text = report::project_context(&state.project_context, &state.items);
                envelope.reply(MessageKind::ProjectContextResult, text)
            }
            MessageKind::RequestPlanSummary => {
                let items = self.items().await;
                envelope.reply(MessageKind::PlanSummaryResult, report::summary(&items))
            }
            other => {
                warn!(kind = %other, sender = %envelope.sender(), "Planning agent cannot handle message kind");
                envelope.unhandled(agents::PLANNING)
            }
        }
    }

    async fn handle_plan_update(&self, envelope: &Envelope) -> Envelope {
        let request = match self.parser.parse(envelope.content()) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Plan update not understood");
                return envelope.reply(MessageKind::Error, e.to_string());
            }
        };
        match self.add_plan_item(request.into_item()).await {
            Ok(item) => envelope
                .reply(
                    MessageKind::PlanUpdateConfirmation,
                    format!(
                        "Added \"{}\" to the plan ({} priority, {}).",
                        item.title,
                        item.priority,
                        item.status()
                    ),
                )
                .with_metadata(meta::ITEM_ID, item.id.to_string()),
            Err(e) => {
                warn!(error = %e, "Failed to add plan item");
                envelope.reply(MessageKind::Error, e.to_string())
            }
        }
    }
}

#[async_trait]
impl AgentEndpoint for PlanningAgent {
    fn name(&self) -> &str {
        agents::PLANNING
    }

    async fn handle(&self, envelope: Envelope) -> Envelope {
        self.process_agent_message(envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextType;
    use crate::error::StorageError;
    use crate::plan::PlanPriority;
    use crate::store::{BackupInfo, MemoryStorage};

    fn agent() -> (Arc<MemoryStorage>, PlanningAgent) {
        let storage = Arc::new(MemoryStorage::new());
        let agent = PlanningAgent::new(storage.clone()).unwrap();
        (storage, agent)
    }

    fn request(kind: MessageKind, content: &str) -> Envelope {
        Envelope::new(kind, agents::CONVERSATION, agents::PLANNING, content)
    }

    #[tokio::test]
    async fn add_task_titled_write_docs() {
        let (storage, agent) = agent();
        let reply = agent
            .process_agent_message(request(
                MessageKind::RequestPlanUpdate,
                r#"add task titled "Write docs""#,
            ))
            .await;

        assert_eq!(reply.kind(), MessageKind::PlanUpdateConfirmation);
        assert_eq!(reply.recipient(), agents::CONVERSATION);
        let items = agent.items().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Write docs");
        assert_eq!(items[0].status(), PlanStatus::Pending);
        assert_eq!(reply.meta(meta::ITEM_ID), Some(items[0].id.to_string().as_str()));
        assert_eq!(storage.load_plan_items().await.unwrap(), items);
    }

    #[tokio::test]
    async fn unparseable_update_is_an_error() {
        let (_storage, agent) = agent();
        let reply = agent
            .process_agent_message(request(MessageKind::RequestPlanUpdate, "hmm"))
            .await;
        assert_eq!(reply.kind(), MessageKind::Error);
        assert!(agent.items().await.is_empty());
    }

    #[tokio::test]
    async fn unhandled_kind_is_reported() {
        let (_storage, agent) = agent();
        let reply = agent
            .process_agent_message(request(MessageKind::VoiceOutput, "hello"))
            .await;
        assert_eq!(reply.kind(), MessageKind::Error);
        assert_eq!(reply.meta(meta::PROCESSED), Some("false"));
        assert!(reply.content().contains("voiceOutput"));
    }

    #[tokio::test]
    async fn query_dispatches_to_reports() {
        let (_storage, agent) = agent();
        agent
            .add_plan_item(PlanItem::new("Fix outage").with_priority(PlanPriority::Critical))
            .await
            .unwrap();

        let listing = agent
            .process_agent_message(request(MessageKind::RequestPlanQuery, "show the plan"))
            .await;
        assert_eq!(listing.kind(), MessageKind::PlanQueryResult);
        assert!(listing.content().contains("## Pending (1)"));

        let status = agent
            .process_agent_message(request(MessageKind::RequestPlanQuery, "status please"))
            .await;
        assert!(status.content().starts_with("Plan status: 1 items"));

        let summary = agent
            .process_agent_message(request(MessageKind::RequestPlanSummary, ""))
            .await;
        assert_eq!(summary.kind(), MessageKind::PlanSummaryResult);
        assert!(summary.content().contains("Next up: Fix outage"));
    }

    #[tokio::test]
    async fn project_context_request_includes_context() {
        let (storage, agent) = agent();
        agent.set_project_context("Rust voice assistant").await.unwrap();
        assert_eq!(
            storage.load_project_context().await.unwrap().as_deref(),
            Some("Rust voice assistant")
        );
        let reply = agent
            .process_agent_message(request(MessageKind::RequestProjectContext, ""))
            .await;
        assert_eq!(reply.kind(), MessageKind::ProjectContextResult);
        assert!(reply.content().starts_with("Rust voice assistant"));
        assert!(reply.content().contains("## Current Plan"));
    }

    #[tokio::test]
    async fn status_updates_record_history_and_persist() {
        let (storage, agent) = agent();
        let item = agent.add_plan_item(PlanItem::new("Ship")).await.unwrap();
        let saves = storage.save_count().await;

        assert!(agent.update_status(item.id, PlanStatus::InProgress, None).await.unwrap());
        assert!(!agent.update_status(item.id, PlanStatus::InProgress, None).await.unwrap());

        let stored = storage.load_plan_items().await.unwrap();
        assert_eq!(stored[0].history().len(), 1);
        assert!(storage.save_count().await > saves);
        assert!(matches!(
            agent.update_status(Uuid::new_v4(), PlanStatus::Completed, None).await,
            Err(PlanError::ItemNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn dependencies_require_existing_items() {
        let (_storage, agent) = agent();
        let a = agent.add_plan_item(PlanItem::new("A")).await.unwrap();
        let b = agent.add_plan_item(PlanItem::new("B")).await.unwrap();

        assert!(agent.add_dependency(a.id, b.id).await.unwrap());
        assert!(!agent.add_dependency(a.id, b.id).await.unwrap());
        assert_eq!(agent.item(a.id).await.unwrap().dependencies.len(), 1);
        assert!(matches!(
            agent.add_dependency(a.id, Uuid::new_v4()).await,
            Err(PlanError::ItemNotFound { .. })
        ));

        // Removing B drops it from A's dependencies.
        agent.remove_plan_item(b.id).await.unwrap();
        assert!(agent.item(a.id).await.unwrap().dependencies.is_empty());
    }

    #[tokio::test]
    async fn tags_are_normalized() {
        let (_storage, agent) = agent();
        let item = agent.add_plan_item(PlanItem::new("Tagged")).await.unwrap();
        assert!(agent.add_tag(item.id, "#Docs").await.unwrap());
        assert!(!agent.add_tag(item.id, "docs").await.unwrap());
        assert!(agent.remove_tag(item.id, "DOCS").await.unwrap());
    }

    #[tokio::test]
    async fn loading_a_version_snapshots_current_plan() {
        let (_storage, agent) = agent();
        agent.add_plan_item(PlanItem::new("v1 item")).await.unwrap();
        let v1 = agent.save_current_plan_as_version("v1", "first").await.unwrap();

        agent.add_plan_item(PlanItem::new("v2 item")).await.unwrap();
        agent.load_version(v1.id).await.unwrap();

        let items = agent.items().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "v1 item");

        let versions = agent.list_versions().await;
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[1].items.len(), 2);
        assert!(versions[1].name.contains("v1"));
    }

    #[tokio::test]
    async fn replace_plan_snapshots_and_delete_version() {
        let (_storage, agent) = agent();
        agent.add_plan_item(PlanItem::new("old")).await.unwrap();
        agent.replace_plan(vec![PlanItem::new("new")]).await.unwrap();

        assert_eq!(agent.items().await[0].title, "new");
        let versions = agent.list_versions().await;
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].items[0].title, "old");

        agent.delete_version(versions[0].id).await.unwrap();
        assert!(agent.list_versions().await.is_empty());
        assert!(matches!(
            agent.delete_version(versions[0].id).await,
            Err(PlanError::VersionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn load_restores_from_storage() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .save_plan_items(&[PlanItem::new("persisted")])
            .await
            .unwrap();
        storage.save_project_context("ctx").await.unwrap();

        let agent = PlanningAgent::new(storage).unwrap();
        agent.load().await.unwrap();
        assert_eq!(agent.items().await[0].title, "persisted");
        assert_eq!(agent.project_context().await, "ctx");
    }

    /// Storage whose plan saves always fail.
    struct ReadOnlyStorage(MemoryStorage);

    #[async_trait]
    impl Storage for ReadOnlyStorage {
        async fn load_plan_items(&self) -> Result<Vec<PlanItem>, StorageError> {
            self.0.load_plan_items().await
        }
        async fn save_plan_items(&self, _: &[PlanItem]) -> Result<(), StorageError> {
            Err(StorageError::Io(std::io::Error::other("read-only")))
        }
        async fn load_plan_versions(&self) -> Result<Vec<PlanVersion>, StorageError> {
            self.0.load_plan_versions().await
        }
        async fn save_plan_versions(&self, _: &[PlanVersion]) -> Result<(), StorageError> {
            Err(StorageError::Io(std::io::Error::other("read-only")))
        }
        async fn load_project_context(&self) -> Result<Option<String>, StorageError> {
            self.0.load_project_context().await
        }
        async fn save_project_context(&self, text: &str) -> Result<(), StorageError> {
            self.0.save_project_context(text).await
        }
        async fn load_context(&self, ty: ContextType) -> Result<Option<String>, StorageError> {
            self.0.load_context(ty).await
        }
        async fn save_context(&self, ty: ContextType, text: &str) -> Result<(), StorageError> {
            self.0.save_context(ty, text).await
        }
        async fn create_backup(&self) -> Result<BackupInfo, StorageError> {
            self.0.create_backup().await
        }
        async fn list_backups(&self) -> Result<Vec<BackupInfo>, StorageError> {
            self.0.list_backups().await
        }
        async fn restore_backup(&self, id: &str) -> Result<BackupInfo, StorageError> {
            self.0.restore_backup(id).await
        }
        async fn delete_backup(&self, id: &str) -> Result<(), StorageError> {
            self.0.delete_backup(id).await
        }
    }

    #[tokio::test]
    async fn failed_save_leaves_memory_unchanged() {
        let agent = PlanningAgent::new(Arc::new(ReadOnlyStorage(MemoryStorage::new()))).unwrap();
        assert!(matches!(
            agent.add_plan_item(PlanItem::new("lost")).await,
            Err(PlanError::Persistence(_))
        ));
        assert!(agent.items().await.is_empty());

        let reply = agent
            .process_agent_message(request(MessageKind::RequestPlanUpdate, r#"add task "x""#))
            .await;
        assert_eq!(reply.kind(), MessageKind::Error);
        assert!(agent.save_current_plan_as_version("v", "").await.is_err());
        assert!(agent.list_versions().await.is_empty());
    }
}
