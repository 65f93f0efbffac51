//! Pending task set: in-flight async operations tracked for quiescence.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Shared set of in-flight task ids. Cloning shares the set.
#[derive(Debug, Clone, Default)]
pub struct PendingTasks {
    inner: Arc<Mutex<HashSet<Uuid>>>,
}

impl PendingTasks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        // The set holds plain ids, so a poisoned lock is still consistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new in-flight task.
    pub fn add(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().insert(id);
        debug!(task_id = %id, "Pending task added");
        id
    }

    /// Mark a task complete. Returns `false` for unknown or already completed ids.
    pub fn complete(&self, id: Uuid) -> bool {
        let removed = self.lock().remove(&id);
        if removed {
            debug!(task_id = %id, "Pending task completed");
        } else {
            warn!(task_id = %id, "Completing unknown pending task");
        }
        removed
    }

    /// Register a task that completes when the guard drops.
    pub fn track(&self) -> PendingGuard {
        PendingGuard {
            tasks: self.clone(),
            id: self.add(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Poll until the set is empty. Returns `false` if `timeout` passes first.
    pub async fn wait_until_empty(&self, timeout: Duration, poll: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_empty() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }
}

/// Completes its pending task on drop.
#[derive(Debug)]
pub struct PendingGuard {
    tasks: PendingTasks,
    id: Uuid,
}

impl PendingGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.tasks.complete(self.id);
    }
}
