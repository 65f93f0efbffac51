//! Plan data model: items, status, priority and versions.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PlanError;

/// Lifecycle status of a plan item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlanStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Blocked,
    Cancelled,
}

impl PlanStatus {
    /// Order used when grouping items by status in reports.
    pub const REPORT_ORDER: [PlanStatus; 5] = [
        Self::Pending,
        Self::InProgress,
        Self::Blocked,
        Self::Completed,
        Self::Cancelled,
    ];

    /// Whether work on the item is finished (successfully or not).
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Human-readable group heading.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::InProgress => "In Progress",
            Self::Completed => "Completed",
            Self::Blocked => "Blocked",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "inProgress",
            Self::Completed => "completed",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Priority of a plan item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlanPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl PlanPriority {
    /// Most important first.
    pub const ALL: [PlanPriority; 4] = [Self::Critical, Self::High, Self::Medium, Self::Low];

    /// Sort rank; lower sorts first.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }

    /// Parse a spoken or typed priority word.
    pub fn from_word(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "critical" | "urgent" | "blocker" => Some(Self::Critical),
            "high" | "important" => Some(Self::High),
            "medium" | "normal" => Some(Self::Medium),
            "low" | "minor" => Some(Self::Low),
            _ => None,
        }
    }
}

impl std::fmt::Display for PlanPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// One status change of a plan item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub timestamp: DateTime<Utc>,
    pub from: PlanStatus,
    pub to: PlanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// A trackable unit of work.
///
/// Status, history and `updated_at` only change through methods, so every
/// status change is recorded and `updated_at` strictly increases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanItem {
    pub id: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: String,
    status: PlanStatus,
    pub priority: PlanPriority,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub dependencies: BTreeSet<Uuid>,
    #[serde(default)]
    history: Vec<HistoryRecord>,
    pub created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PlanItem {
    /// Create a pending, medium-priority item.
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: String::new(),
            status: PlanStatus::Pending,
            priority: PlanPriority::Medium,
            tags: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Builder: set priority.
    pub fn with_priority(mut self, priority: PlanPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: add tags.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn status(&self) -> PlanStatus {
        self.status
    }

    pub fn history(&self) -> &[HistoryRecord] {
        &self.history
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// First eight characters of the id, for listings.
    pub fn short_id(&self) -> String {
        self.id.to_string().chars().take(8).collect()
    }

    fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + chrono::Duration::microseconds(1)
        };
    }

    /// Change status. Returns `false` (and records nothing) when unchanged.
    pub fn set_status(&mut self, to: PlanStatus, note: Option<&str>) -> bool {
        if self.status == to {
            return false;
        }
        self.touch();
        self.history.push(HistoryRecord {
            timestamp: self.updated_at,
            from: self.status,
            to,
            note: note.map(str::to_string),
        });
        self.status = to;
        true
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = title.into();
        self.touch();
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
        self.touch();
    }

    pub fn set_priority(&mut self, priority: PlanPriority) {
        self.priority = priority;
        self.touch();
    }

    /// Add a tag. Returns `false` when already present.
    pub fn add_tag(&mut self, tag: impl Into<String>) -> bool {
        let added = self.tags.insert(tag.into());
        if added {
            self.touch();
        }
        added
    }

    /// Remove a tag. Returns `false` when absent.
    pub fn remove_tag(&mut self, tag: &str) -> bool {
        let removed = self.tags.remove(tag);
        if removed {
            self.touch();
        }
        removed
    }

    /// Add a dependency. Adding an existing one is a no-op returning `false`.
    pub fn add_dependency(&mut self, id: Uuid) -> Result<bool, PlanError> {
        if id == self.id {
            return Err(PlanError::SelfDependency { id });
        }
        let added = self.dependencies.insert(id);
        if added {
            self.touch();
        }
        Ok(added)
    }

    /// Remove a dependency. Returns `false` when absent.
    pub fn remove_dependency(&mut self, id: Uuid) -> bool {
        let removed = self.dependencies.remove(&id);
        if removed {
            self.touch();
        }
        removed
    }

    /// Apply a partial update. Returns whether anything changed.
    pub fn apply(&mut self, patch: &PlanItemPatch) -> bool {
        let mut changed = false;
        if let Some(title) = &patch.title
            && *title != self.title
        {
            self.set_title(title.clone());
            changed = true;
        }
        if let Some(description) = &patch.description
            && *description != self.description
        {
            self.set_description(description.clone());
            changed = true;
        }
        if let Some(priority) = patch.priority
            && priority != self.priority
        {
            self.set_priority(priority);
            changed = true;
        }
        if let Some(status) = patch.status {
            changed |= self.set_status(status, patch.note.as_deref());
        }
        changed
    }
}

/// Partial update for [`PlanItem::apply`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanItemPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<PlanPriority>,
    #[serde(default)]
    pub status: Option<PlanStatus>,
    /// Recorded in the history entry when `status` changes.
    #[serde(default)]
    pub note: Option<String>,
}

/// A named snapshot of the whole plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanVersion {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub items: Vec<PlanItem>,
}

impl PlanVersion {
    pub fn new(name: impl Into<String>, description: impl Into<String>, items: Vec<PlanItem>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: description.into(),
            created_at: Utc::now(),
            items,
        }
    }
}

/// Item counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub blocked: usize,
    pub cancelled: usize,
}

impl PlanCounts {
    pub fn from_items(items: &[PlanItem]) -> Self {
        let mut counts = Self::default();
        for item in items {
            match item.status() {
                PlanStatus::Pending => counts.pending += 1,
                PlanStatus::InProgress => counts.in_progress += 1,
                PlanStatus::Completed => counts.completed += 1,
                PlanStatus::Blocked => counts.blocked += 1,
                PlanStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.blocked + self.cancelled
    }

    pub fn get(&self, status: PlanStatus) -> usize {
        match status {
            PlanStatus::Pending => self.pending,
            PlanStatus::InProgress => self.in_progress,
            PlanStatus::Completed => self.completed,
            PlanStatus::Blocked => self.blocked,
            PlanStatus::Cancelled => self.cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_item_defaults() {
        let item = PlanItem::new("Write docs");
        assert_eq!(item.status(), PlanStatus::Pending);
        assert_eq!(item.priority, PlanPriority::Medium);
        assert!(item.history().is_empty());
        assert!(item.tags.is_empty());
        assert_eq!(item.created_at, item.updated_at());
    }

    #[test]
    fn each_status_change_records_one_entry() {
        let mut item = PlanItem::new("Ship");
        assert!(item.set_status(PlanStatus::InProgress, None));
        assert!(item.set_status(PlanStatus::Blocked, Some("waiting on review")));
        assert!(!item.set_status(PlanStatus::Blocked, None));
        assert!(item.set_status(PlanStatus::Completed, None));

        let history = item.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].from, PlanStatus::Pending);
        assert_eq!(history[0].to, PlanStatus::InProgress);
        assert_eq!(history[1].note.as_deref(), Some("waiting on review"));
        assert_eq!(history[2].to, PlanStatus::Completed);
        assert_eq!(item.status(), PlanStatus::Completed);
    }

    #[test]
    fn updated_at_strictly_increases() {
        let mut item = PlanItem::new("Tick");
        let mut last = item.updated_at();
        for i in 0..20 {
            item.set_title(format!("Tick {i}"));
            assert!(item.updated_at() > last);
            last = item.updated_at();
        }
    }

    #[test]
    fn dependency_edits_are_idempotent() {
        let mut item = PlanItem::new("A");
        let other = Uuid::new_v4();
        assert!(item.add_dependency(other).unwrap());
        assert!(!item.add_dependency(other).unwrap());
        assert_eq!(item.dependencies.len(), 1);
        assert!(item.remove_dependency(other));
        assert!(!item.remove_dependency(other));
        assert!(item.dependencies.is_empty());
    }

    #[test]
    fn self_dependency_rejected() {
        let mut item = PlanItem::new("A");
        let id = item.id;
        assert!(matches!(
            item.add_dependency(id),
            Err(PlanError::SelfDependency { .. })
        ));
    }

    #[test]
    fn patch_applies_only_changes() {
        let mut item = PlanItem::new("Old");
        let patch = PlanItemPatch {
            title: Some("New".into()),
            status: Some(PlanStatus::InProgress),
            note: Some("started".into()),
            ..PlanItemPatch::default()
        };
        assert!(item.apply(&patch));
        assert_eq!(item.title, "New");
        assert_eq!(item.history().len(), 1);
        assert_eq!(item.history()[0].note.as_deref(), Some("started"));
        assert!(!item.apply(&patch));
        assert_eq!(item.history().len(), 1);
    }

    #[test]
    fn status_serde_camel_case() {
        let json = serde_json::to_string(&PlanStatus::InProgress).unwrap();
        assert_eq!(json, "\"inProgress\"");
        assert_eq!(PlanStatus::InProgress.to_string(), "inProgress");
        let parsed: PlanPriority = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(parsed, PlanPriority::Critical);
    }

    #[test]
    fn priority_rank_orders_most_important_first() {
        let mut all = vec![PlanPriority::Low, PlanPriority::Critical, PlanPriority::Medium];
        all.sort_by_key(|p| p.rank());
        assert_eq!(all, vec![PlanPriority::Critical, PlanPriority::Medium, PlanPriority::Low]);
        assert_eq!(PlanPriority::from_word("Urgent"), Some(PlanPriority::Critical));
        assert_eq!(PlanPriority::from_word("whenever"), None);
    }

    #[test]
    fn counts_by_status() {
        let mut done = PlanItem::new("b");
        done.set_status(PlanStatus::Completed, None);
        let items = vec![PlanItem::new("a"), done, PlanItem::new("c")];
        let counts = PlanCounts::from_items(&items);
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.total(), 3);
        assert_eq!(counts.get(PlanStatus::Blocked), 0);
    }
}
