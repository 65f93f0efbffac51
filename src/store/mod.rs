//! Persistence layer: plan items, versions, context fragments and backups.

pub mod file;
pub mod memory;
pub mod traits;

pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use traits::{BackupInfo, FORMAT_VERSION, Snapshot, Storage};
