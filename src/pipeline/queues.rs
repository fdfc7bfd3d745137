// src/pipeline/queues.rs

//! Per-variant pending-write buffers.
//!
//! Each queue maps a natural key to the latest pending record for that key
//! (last write wins inside a batch window) plus a set of tombstoned record
//! URIs. Draining swaps the buffers out, so a flush never sees a record
//! twice and never misses one enqueued concurrently.

use std::collections::{HashMap, HashSet};

use crate::models::{Entity, EntityKind, NaturalKey};

/// Everything a queue held at the moment it was drained.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DrainedBatch {
    /// Upserts ordered by natural key.
    pub upserts: Vec<Entity>,
    /// Record URIs to delete, sorted.
    pub deletions: Vec<String>,
}

impl DrainedBatch {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletions.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct EntityQueue {
    pending: HashMap<NaturalKey, Entity>,
    deletions: HashSet<String>,
}

impl EntityQueue {
    /// Insert or replace the pending record for the entity's key.
    ///
    /// Users are merged instead of replaced, so a placeholder never wipes
    /// out a full profile queued earlier.
    pub fn push(&mut self, entity: Entity) {
        if let Some(uri) = entity.uri() {
            self.deletions.remove(uri);
        }
        let key = entity.natural_key();
        match entity {
            Entity::User(newer) => {
                if let Some(Entity::User(existing)) = self.pending.get_mut(&key) {
                    existing.merge(newer);
                } else {
                    self.pending.insert(key, Entity::User(newer));
                }
            }
            other => {
                self.pending.insert(key, other);
            }
        }
    }

    /// Tombstone a record URI, cancelling any pending upsert of it.
    pub fn push_delete(&mut self, uri: String) {
        if self.pending.remove(&NaturalKey::Uri(uri.clone())).is_none() {
            self.pending.retain(|_, e| e.uri() != Some(uri.as_str()));
        }
        self.deletions.insert(uri);
    }

    pub fn len(&self) -> usize {
        self.pending.len() + self.deletions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.deletions.is_empty()
    }

    /// Swap out and return the queue contents.
    pub fn drain(&mut self) -> DrainedBatch {
        let pending = std::mem::take(&mut self.pending);
        let deletions = std::mem::take(&mut self.deletions);

        let mut keyed: Vec<_> = pending.into_iter().collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        let mut deletions: Vec<_> = deletions.into_iter().collect();
        deletions.sort();

        DrainedBatch {
            upserts: keyed.into_iter().map(|(_, e)| e).collect(),
            deletions,
        }
    }
}

/// One queue per entity variant.
#[derive(Debug, Default)]
pub struct EntityQueues {
    queues: [EntityQueue; 4],
}

impl EntityQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: EntityKind) -> &EntityQueue {
        &self.queues[kind.index()]
    }

    pub fn get_mut(&mut self, kind: EntityKind) -> &mut EntityQueue {
        &mut self.queues[kind.index()]
    }

    /// Queue an upsert. Returns the length of the affected queue.
    pub fn enqueue(&mut self, entity: Entity) -> usize {
        let queue = self.get_mut(entity.kind());
        queue.push(entity);
        queue.len()
    }

    /// Queue a delete. Returns the length of the affected queue.
    pub fn enqueue_delete(&mut self, kind: EntityKind, uri: String) -> usize {
        let queue = self.get_mut(kind);
        queue.push_delete(uri);
        queue.len()
    }

    pub fn drain(&mut self, kind: EntityKind) -> DrainedBatch {
        self.get_mut(kind).drain()
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        self.get(kind).len()
    }

    pub fn total_len(&self) -> usize {
        self.queues.iter().map(EntityQueue::len).sum()
    }
}
