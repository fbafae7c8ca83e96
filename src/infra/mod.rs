//! Storage backends implementing the task store and ledger.

pub mod file;
pub mod memory;
pub mod sqlite;
pub mod state;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use sqlite::{SqliteAuditSink, SqliteOptions, SqliteStore};
pub use state::StoreState;
