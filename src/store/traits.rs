//! `Storage` trait: single async interface for all persistence.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::ContextType;
use crate::error::StorageError;
use crate::plan::{PlanItem, PlanVersion};

/// Backup format written by this build. Restores of newer formats are refused.
pub const FORMAT_VERSION: u32 = 1;

/// Listing entry for one backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub format_version: u32,
    pub item_count: usize,
}

/// Everything a backup captures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub items: Vec<PlanItem>,
    #[serde(default)]
    pub versions: Vec<PlanVersion>,
    #[serde(default)]
    pub project_context: Option<String>,
    #[serde(default)]
    pub fragments: HashMap<ContextType, String>,
}

impl Snapshot {
    /// Refuse formats newer than this build understands.
    pub fn check_version(&self) -> Result<(), StorageError> {
        check_format_version(self.format_version)
    }

    pub fn info(&self, id: impl Into<String>) -> BackupInfo {
        BackupInfo {
            id: id.into(),
            created_at: self.created_at,
            format_version: self.format_version,
            item_count: self.items.len(),
        }
    }
}

/// Backend-agnostic persistence for plan, context and backups.
#[async_trait]
pub trait Storage: Send + Sync {
    // ── Plan ────────────────────────────────────────────────────────

    async fn load_plan_items(&self) -> Result<Vec<PlanItem>, StorageError>;

    async fn save_plan_items(&self, items: &[PlanItem]) -> Result<(), StorageError>;

    async fn load_plan_versions(&self) -> Result<Vec<PlanVersion>, StorageError>;

    async fn save_plan_versions(&self, versions: &[PlanVersion]) -> Result<(), StorageError>;

    // ── Context ─────────────────────────────────────────────────────

    async fn load_project_context(&self) -> Result<Option<String>, StorageError>;

    async fn save_project_context(&self, text: &str) -> Result<(), StorageError>;

    /// Load the stored fragment for one context type.
    async fn load_context(&self, ty: ContextType) -> Result<Option<String>, StorageError>;

    async fn save_context(&self, ty: ContextType, text: &str) -> Result<(), StorageError>;

    // ── Backups ─────────────────────────────────────────────────────

    /// Snapshot everything under a new backup id.
    async fn create_backup(&self) -> Result<BackupInfo, StorageError>;

    /// All backups, newest first.
    async fn list_backups(&self) -> Result<Vec<BackupInfo>, StorageError>;

    /// Replace current data with a backup's contents.
    async fn restore_backup(&self, id: &str) -> Result<BackupInfo, StorageError>;

    async fn delete_backup(&self, id: &str) -> Result<(), StorageError>;
}

/// Refuse a backup format newer than [`FORMAT_VERSION`].
pub fn check_format_version(found: u32) -> Result<(), StorageError> {
    if found > FORMAT_VERSION {
        return Err(StorageError::IncompatibleVersion {
            found,
            supported: FORMAT_VERSION,
        });
    }
    Ok(())
}

/// Collect the current data into a snapshot.
pub async fn collect_snapshot<S: Storage + ?Sized>(storage: &S) -> Result<Snapshot, StorageError> {
    let mut fragments = HashMap::new();
    for ty in ContextType::ALL {
        if let Some(text) = storage.load_context(ty).await? {
            fragments.insert(ty, text);
        }
    }
    Ok(Snapshot {
        format_version: FORMAT_VERSION,
        created_at: Utc::now(),
        items: storage.load_plan_items().await?,
        versions: storage.load_plan_versions().await?,
        project_context: storage.load_project_context().await?,
        fragments,
    })
}

/// Write a snapshot's contents back through the storage interface.
pub async fn apply_snapshot<S: Storage + ?Sized>(
    storage: &S,
    snapshot: &Snapshot,
) -> Result<(), StorageError> {
    snapshot.check_version()?;
    storage.save_plan_items(&snapshot.items).await?;
    storage.save_plan_versions(&snapshot.versions).await?;
    storage
        .save_project_context(snapshot.project_context.as_deref().unwrap_or_default())
        .await?;
    for ty in ContextType::ALL {
        let text = snapshot.fragments.get(&ty).map(String::as_str).unwrap_or_default();
        storage.save_context(ty, text).await?;
    }
    Ok(())
}

/// A fresh, sortable backup id.
pub fn new_backup_id(at: DateTime<Utc>) -> String {
    let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(6).collect();
    format!("backup-{}-{suffix}", at.format("%Y%m%dT%H%M%S%3fZ"))
}
