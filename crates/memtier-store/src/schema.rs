//! Row types as persisted in SurrealDB
//!
//! These mirror the domain types in `storage_traits` but use SurrealDB
//! native datetimes and signed integers. Conversion happens at the
//! boundary in `surreal_store`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::metadata::Metadata;
use crate::storage_traits::{ClusterId, ClusterRecord, MemoryId, MemoryRecord, NewMemory};
use crate::StorageResult;

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Row of the `memories` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MemoryRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub memory_id: i64,
    pub owner: String,
    pub namespace: Option<String>,
    pub thread_id: Option<String>,
    pub content: String,
    pub tier: String,
    pub score: Option<i64>,
    #[serde(default)]
    pub metadata: Metadata,
    pub summarized: bool,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl MemoryRow {
    pub fn from_new(memory_id: i64, memory: NewMemory, now: DateTime<Utc>) -> Self {
        let rec = memory.into_record(MemoryId(0), now);
        MemoryRow {
            id: None,
            memory_id,
            owner: rec.owner,
            namespace: rec.namespace,
            thread_id: rec.thread,
            content: rec.content,
            tier: rec.tier,
            score: rec.score.map(i64::from),
            metadata: rec.metadata,
            summarized: rec.summarized,
            created_at: rec.created_at,
            updated_at: rec.updated_at,
        }
    }

    pub fn into_record(self) -> StorageResult<MemoryRecord> {
        let id = u64::try_from(self.memory_id).map_err(|_| StorageError::CorruptRow {
            table: "memories",
            reason: format!("negative memory_id {}", self.memory_id),
        })?;
        let score = self
            .score
            .map(|s| {
                u8::try_from(s).map_err(|_| StorageError::CorruptRow {
                    table: "memories",
                    reason: format!("score {s} out of range for memory {id}"),
                })
            })
            .transpose()?;

        Ok(MemoryRecord {
            id: MemoryId(id),
            owner: self.owner,
            namespace: self.namespace,
            thread: self.thread_id,
            content: self.content,
            tier: self.tier,
            score,
            metadata: self.metadata,
            summarized: self.summarized,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Row of the `clusters` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ClusterRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub cluster_id: String,
    pub owner: String,
    pub topic: String,
    pub category: String,
    pub member_ids: Vec<i64>,
    pub member_count: i64,
    pub summary: String,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl ClusterRow {
    pub fn into_record(self) -> StorageResult<ClusterRecord> {
        let member_ids = self
            .member_ids
            .iter()
            .map(|&m| {
                u64::try_from(m).map(MemoryId).map_err(|_| StorageError::CorruptRow {
                    table: "clusters",
                    reason: format!("negative member id {m} in cluster {}", self.cluster_id),
                })
            })
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(ClusterRecord {
            id: ClusterId(self.cluster_id),
            owner: self.owner,
            topic: self.topic,
            category: self.category,
            member_count: usize::try_from(self.member_count).unwrap_or(member_ids.len()),
            member_ids,
            summary: self.summary,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Row returned by the id counter upsert
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CounterRow {
    pub value: i64,
}

/// Projection used for thread listings
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ThreadRow {
    pub thread_id: Option<String>,
}

/// Projection used for owner listings
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct OwnerRow {
    pub owner: String,
}

/// Projection used for tier counts
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TierCountRow {
    pub tier: String,
    pub count: i64,
}

/// Convert domain ids to the signed form stored in the database.
pub(crate) fn ids_to_db(ids: &[MemoryId]) -> Vec<i64> {
    ids.iter()
        .filter_map(|id| i64::try_from(id.0).ok())
        .collect()
}
