//! memtier-store: persistence layer for the memtier engine
//!
//! This crate owns every byte that goes to or comes from the backing store.
//! The lifecycle engine in `memtier-core` only ever talks to the
//! [`MemoryStore`] trait defined here.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: filtered queries, atomic batch updates, idempotent cluster upserts.
//!
//! ## Key Components
//!
//! - `MemoryStore`: async storage contract for memory records and clusters
//! - `Metadata`: typed view over the free-form metadata map
//! - `InMemoryStore`: mutex-guarded fake for tests and embedding
//! - `SurrealMemoryStore`: SurrealDB backend (in-memory, local file, or cloud)

mod error;
pub mod fakes;
mod handle;
pub mod metadata;
mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use fakes::InMemoryStore;
pub use handle::CloudConfig;
pub use metadata::{
    Importance, Metadata, KEY_CATEGORY, KEY_ENTITIES, KEY_IMPORTANCE, KEY_KIND, KEY_ROLE,
    KEY_SEEN_COUNT, KEY_TOPIC, THREAD_SUMMARY_KIND,
};
pub use storage_traits::{
    ClusterId, ClusterRecord, ClusterUpsert, MemoryFilter, MemoryId, MemoryRecord, MemoryStore,
    NewMemory, StorageResult, SummarizedFilter, DEFAULT_TIER,
};
pub use surreal_store::SurrealMemoryStore;

/// Result type for connection and schema operations
pub type Result<T> = std::result::Result<T, StateError>;
