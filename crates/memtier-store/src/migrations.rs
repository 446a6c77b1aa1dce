//! SurrealDB schema migrations and initialization
//!
//! Every statement uses `IF NOT EXISTS`, so running `init_schema` on an
//! already-initialized database is a no-op.

use crate::error::StateError;
use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all memtier tables in SurrealDB
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing memtier SurrealDB schema");

    init_memories_table(db).await?;
    init_clusters_table(db).await?;
    init_counters_table(db).await?;

    info!("memtier schema initialization complete");
    Ok(())
}

async fn run(db: &Surreal<Any>, table: &str, sql: &str) -> Result<()> {
    db.query(sql)
        .await
        .and_then(|res| res.check())
        .map_err(|e| StateError::SchemaSetup(format!("{table}: {e}")))?;
    Ok(())
}

/// Initialize `memories` table
///
/// Schema:
/// ```text
/// TABLE memories {
///   memory_id:   INT (unique, assigned from counters:memories)
///   owner:       STRING (indexed with thread_id)
///   namespace:   STRING?
///   thread_id:   STRING?
///   content:     STRING
///   tier:        STRING (indexed)
///   score:       INT?
///   metadata:    OBJECT
///   summarized:  BOOL
///   created_at:  DATETIME
///   updated_at:  DATETIME (indexed, drives migration)
/// }
/// ```
async fn init_memories_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing memories table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS memories SCHEMALESS;

        DEFINE INDEX IF NOT EXISTS idx_memory_id ON TABLE memories COLUMNS memory_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_memory_owner_thread ON TABLE memories COLUMNS owner, thread_id;
        DEFINE INDEX IF NOT EXISTS idx_memory_tier ON TABLE memories COLUMNS tier;
        DEFINE INDEX IF NOT EXISTS idx_memory_updated_at ON TABLE memories COLUMNS updated_at;
    "#;
    run(db, "memories", sql).await
}

/// Initialize `clusters` table
///
/// Schema:
/// ```text
/// TABLE clusters {
///   cluster_id:    STRING (unique)
///   owner:         STRING
///   topic:         STRING
///   category:      STRING
///   member_ids:    ARRAY<INT>
///   member_count:  INT
///   summary:       STRING
///   created_at:    DATETIME
///   updated_at:    DATETIME
/// }
/// ```
///
/// Constraints:
/// - (owner, topic, category) is unique; a second insert for the same key fails
async fn init_clusters_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing clusters table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS clusters SCHEMALESS;

        DEFINE INDEX IF NOT EXISTS idx_cluster_id ON TABLE clusters COLUMNS cluster_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_cluster_key ON TABLE clusters COLUMNS owner, topic, category UNIQUE;
    "#;
    run(db, "clusters", sql).await
}

/// Initialize `counters` table (monotonic id sequences)
async fn init_counters_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing counters table");

    run(db, "counters", "DEFINE TABLE IF NOT EXISTS counters SCHEMALESS;").await
}
