//! File-backed storage: JSON and text files under one data directory.
//!
//! Layout:
//! - `plan/items.json`, `plan/versions.json`
//! - `context/project.md`, `context/<type>.md`
//! - `backups/<id>.json`

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tracing::{debug, info, warn};

use super::traits::{
    BackupInfo, Snapshot, Storage, apply_snapshot, check_format_version, collect_snapshot,
    new_backup_id,
};
use crate::context::ContextType;
use crate::error::StorageError;
use crate::plan::{PlanItem, PlanVersion};

const ITEMS_FILE: &str = "plan/items.json";
const VERSIONS_FILE: &str = "plan/versions.json";
const PROJECT_FILE: &str = "context/project.md";
const BACKUP_DIR: &str = "backups";

pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Storage rooted at `root`. Directories are created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    fn context_file(ty: ContextType) -> String {
        format!("context/{}.md", ty.file_stem())
    }

    /// Ids are plain names inside `backups/`.
    fn backup_path(&self, id: &str) -> Result<PathBuf, StorageError> {
        let valid = !id.is_empty()
            && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            warn!(backup_id = %id, "Rejected backup id");
            return Err(StorageError::InvalidBackupId(id.to_string()));
        }
        Ok(self.root.join(BACKUP_DIR).join(format!("{id}.json")))
    }

    /// Write through a temp file and rename so readers never see partial data.
    async fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_optional(path: &Path) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_json<T: DeserializeOwned + Default>(&self, relative: &str) -> Result<T, StorageError> {
        match Self::read_optional(&self.resolve(relative)).await? {
            Some(text) => Ok(serde_json::from_str(&text)?),
            None => Ok(T::default()),
        }
    }

    async fn write_json<T: Serialize + ?Sized>(&self, relative: &str, value: &T) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(value)?;
        Self::write_atomic(&self.resolve(relative), &json).await
    }

    async fn write_text(&self, relative: &str, text: &str) -> Result<(), StorageError> {
        Self::write_atomic(&self.resolve(relative), text.as_bytes()).await
    }

    async fn read_text(&self, relative: &str) -> Result<Option<String>, StorageError> {
        Ok(Self::read_optional(&self.resolve(relative))
            .await?
            .filter(|text| !text.is_empty()))
    }

    async fn read_backup(&self, id: &str) -> Result<Snapshot, StorageError> {
        let text = Self::read_optional(&self.backup_path(id)?)
            .await?
            .ok_or_else(|| StorageError::BackupNotFound(id.to_string()))?;
        let value: serde_json::Value = serde_json::from_str(&text)?;
        // Version first: newer layouts may not parse as a Snapshot.
        let found = value
            .get("format_version")
            .and_then(serde_json::Value::as_u64)
            .map_or(0, |v| u32::try_from(v).unwrap_or(u32::MAX));
        check_format_version(found)?;
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn load_plan_items(&self) -> Result<Vec<PlanItem>, StorageError> {
        self.read_json(ITEMS_FILE).await
    }

    async fn save_plan_items(&self, items: &[PlanItem]) -> Result<(), StorageError> {
        self.write_json(ITEMS_FILE, items).await?;
        debug!(count = items.len(), "Saved plan items");
        Ok(())
    }

    async fn load_plan_versions(&self) -> Result<Vec<PlanVersion>, StorageError> {
        self.read_json(VERSIONS_FILE).await
    }

    async fn save_plan_versions(&self, versions: &[PlanVersion]) -> Result<(), StorageError> {
        self.write_json(VERSIONS_FILE, versions).await
    }

    async fn load_project_context(&self) -> Result<Option<String>, StorageError> {
        self.read_text(PROJECT_FILE).await
    }

    async fn save_project_context(&self, text: &str) -> Result<(), StorageError> {
        self.write_text(PROJECT_FILE, text).await
    }

    async fn load_context(&self, ty: ContextType) -> Result<Option<String>, StorageError> {
        self.read_text(&Self::context_file(ty)).await
    }

    async fn save_context(&self, ty: ContextType, text: &str) -> Result<(), StorageError> {
        self.write_text(&Self::context_file(ty), text).await
    }

    async fn create_backup(&self) -> Result<BackupInfo, StorageError> {
        let snapshot = collect_snapshot(self).await?;
        let id = new_backup_id(snapshot.created_at);
        let json = serde_json::to_vec_pretty(&snapshot)?;
        Self::write_atomic(&self.backup_path(&id)?, &json).await?;
        info!(backup_id = %id, items = snapshot.items.len(), "Backup created");
        Ok(snapshot.info(id))
    }

    async fn list_backups(&self) -> Result<Vec<BackupInfo>, StorageError> {
        let dir = self.root.join(BACKUP_DIR);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut backups = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            match self.read_backup(&id).await {
                Ok(snapshot) => backups.push(snapshot.info(id)),
                Err(e) => warn!(backup_id = %id, error = %e, "Skipping unreadable backup"),
            }
        }
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(backups)
    }

    async fn restore_backup(&self, id: &str) -> Result<BackupInfo, StorageError> {
        let snapshot = self.read_backup(id).await?;
        apply_snapshot(self, &snapshot).await?;
        info!(backup_id = %id, restored_at = %Utc::now(), "Backup restored");
        Ok(snapshot.info(id))
    }

    async fn delete_backup(&self, id: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.backup_path(id)?).await {
            Ok(()) => {
                info!(backup_id = %id, "Backup deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::BackupNotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
