//! In-memory storage for tests and ephemeral runs.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::traits::{
    BackupInfo, Snapshot, Storage, apply_snapshot, collect_snapshot, new_backup_id,
};
use crate::context::ContextType;
use crate::error::StorageError;
use crate::plan::{PlanItem, PlanVersion};

#[derive(Default)]
struct Inner {
    items: Vec<PlanItem>,
    versions: Vec<PlanVersion>,
    project_context: Option<String>,
    fragments: HashMap<ContextType, String>,
    backups: BTreeMap<String, Snapshot>,
    /// Save calls made, for tests asserting persistence happened.
    saves: usize,
}

#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of save calls so far.
    pub async fn save_count(&self) -> usize {
        self.inner.read().await.saves
    }

    /// Insert a raw backup snapshot under `id`.
    pub async fn insert_backup(&self, id: impl Into<String>, snapshot: Snapshot) {
        self.inner.write().await.backups.insert(id.into(), snapshot);
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load_plan_items(&self) -> Result<Vec<PlanItem>, StorageError> {
        Ok(self.inner.read().await.items.clone())
    }

    async fn save_plan_items(&self, items: &[PlanItem]) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        inner.items = items.to_vec();
        inner.saves += 1;
        Ok(())
    }

    async fn load_plan_versions(&self) -> Result<Vec<PlanVersion>, StorageError> {
        Ok(self.inner.read().await.versions.clone())
    }

    async fn save_plan_versions(&self, versions: &[PlanVersion]) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        inner.versions = versions.to_vec();
        inner.saves += 1;
        Ok(())
    }

    async fn load_project_context(&self) -> Result<Option<String>, StorageError> {
        Ok(self.inner.read().await.project_context.clone())
    }

    async fn save_project_context(&self, text: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        inner.project_context = (!text.is_empty()).then(|| text.to_string());
        inner.saves += 1;
        Ok(())
    }

    async fn load_context(&self, ty: ContextType) -> Result<Option<String>, StorageError> {
        Ok(self.inner.read().await.fragments.get(&ty).cloned())
    }

    async fn save_context(&self, ty: ContextType, text: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        if text.is_empty() {
            inner.fragments.remove(&ty);
        } else {
            inner.fragments.insert(ty, text.to_string());
        }
        inner.saves += 1;
        Ok(())
    }

    async fn create_backup(&self) -> Result<BackupInfo, StorageError> {
        let snapshot = collect_snapshot(self).await?;
        let id = new_backup_id(snapshot.created_at);
        let info = snapshot.info(id.clone());
        self.inner.write().await.backups.insert(id, snapshot);
        Ok(info)
    }

    async fn list_backups(&self) -> Result<Vec<BackupInfo>, StorageError> {
        let inner = self.inner.read().await;
        let mut backups: Vec<BackupInfo> = inner
            .backups
            .iter()
            .map(|(id, snapshot)| snapshot.info(id.clone()))
            .collect();
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(backups)
    }

    async fn restore_backup(&self, id: &str) -> Result<BackupInfo, StorageError> {
        let snapshot = self
            .inner
            .read()
            .await
            .backups
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::BackupNotFound(id.to_string()))?;
        apply_snapshot(self, &snapshot).await?;
        Ok(snapshot.info(id))
    }

    async fn delete_backup(&self, id: &str) -> Result<(), StorageError> {
        self.inner
            .write()
            .await
            .backups
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StorageError::BackupNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::store::traits::FORMAT_VERSION;

    #[tokio::test]
    async fn restore_refuses_newer_format() {
        let storage = MemoryStorage::new();
        storage
            .insert_backup(
                "next",
                Snapshot {
                    format_version: FORMAT_VERSION + 1,
                    created_at: Utc::now(),
                    items: vec![PlanItem::new("From the future")],
                    versions: Vec::new(),
                    project_context: None,
                    fragments: HashMap::new(),
                },
            )
            .await;
        assert!(matches!(
            storage.restore_backup("next").await,
            Err(StorageError::IncompatibleVersion { .. })
        ));
        assert!(storage.load_plan_items().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn backup_captures_fragments() {
        let storage = MemoryStorage::new();
        storage.save_context(ContextType::Project, "ctx").await.unwrap();
        let info = storage.create_backup().await.unwrap();
        storage.save_context(ContextType::Project, "").await.unwrap();
        assert_eq!(storage.load_context(ContextType::Project).await.unwrap(), None);

        storage.restore_backup(&info.id).await.unwrap();
        assert_eq!(
            storage.load_context(ContextType::Project).await.unwrap().as_deref(),
            Some("ctx")
        );
        storage.delete_backup(&info.id).await.unwrap();
        assert!(storage.list_backups().await.unwrap().is_empty());
    }
}
