pub mod cached;
pub mod memory;
pub mod sqlite;
pub mod trait_def;

pub use cached::CachedStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use trait_def::{AttributionStore, StorageError, StorageResult};
