//! Storage abstractions for entity and progress persistence.
//!
//! - Entities: relational upserts keyed on each variant's natural key
//!   ([`SqliteStore`]).
//! - Progress: a single overwrite-only checkpoint record
//!   ([`FileCheckpointStore`]).

pub mod checkpoint;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{ConflictMode, Entity, EntityKind};

// Re-export for convenience
pub use checkpoint::{CheckpointStore, FileCheckpointStore};
pub use sqlite::{SqliteStore, StoreSnapshot};

/// Trait for entity storage backends.
///
/// Every batch call is atomic: either all rows of the batch are written or
/// none are.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Upsert a batch of one variant, resolving key conflicts per `mode`.
    ///
    /// Fails with [`crate::error::AppError::ReferentialWrite`] when a row
    /// references a user that does not exist.
    async fn upsert(&self, kind: EntityKind, batch: &[Entity], mode: ConflictMode)
    -> Result<usize>;

    /// Delete rows of one variant by record URI.
    async fn delete(&self, kind: EntityKind, uris: &[String]) -> Result<usize>;

    /// Insert placeholder users for any DIDs not yet stored.
    async fn ensure_users(&self, dids: &[String], indexed_at: i64) -> Result<usize>;

    /// Row count for a variant.
    async fn count(&self, kind: EntityKind) -> Result<u64>;
}
