pub mod error;
pub mod memory;
mod schema;
pub mod sqlite_store;
pub mod traits;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use sqlite_store::SqliteStore;
pub use traits::InstanceStore;
