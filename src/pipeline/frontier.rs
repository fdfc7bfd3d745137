// src/pipeline/frontier.rs

//! Crawl frontier: a priority queue of pending items plus the visited set.
//!
//! Items pop highest priority first, then shallowest depth, then in
//! discovery order. Every admitted id stays in the visited set for the rest
//! of the run, so an id is never queued twice.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::models::{FrontierItem, FrontierSnapshot, FrontierState};

/// Outcome of offering a discovered id to the frontier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    AlreadyVisited,
    TooDeep,
    BelowThreshold,
}

#[derive(Debug)]
struct Queued {
    item: FrontierItem,
    seq: u64,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.item
            .priority
            .total_cmp(&other.item.priority)
            .then_with(|| other.item.depth.cmp(&self.item.depth))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
pub struct Frontier {
    heap: BinaryHeap<Queued>,
    visited: HashMap<String, FrontierState>,
    processing: HashMap<String, FrontierItem>,
    max_depth: u32,
    threshold: f64,
    seq: u64,
}

impl Frontier {
    pub fn new(max_depth: u32, threshold: f64) -> Self {
        Self {
            heap: BinaryHeap::new(),
            visited: HashMap::new(),
            processing: HashMap::new(),
            max_depth,
            threshold,
            seq: 0,
        }
    }

    /// Rebuild a frontier saved with [`Frontier::snapshot`].
    ///
    /// Items that were in flight when the snapshot was taken come back as
    /// pending.
    pub fn restore(snapshot: FrontierSnapshot, max_depth: u32, threshold: f64) -> Self {
        let mut frontier = Self::new(max_depth, threshold);
        for (id, state) in snapshot.visited {
            let state = match state {
                FrontierState::Processing => FrontierState::Pending,
                other => other,
            };
            frontier.visited.insert(id, state);
        }
        for mut item in snapshot.pending {
            item.state = FrontierState::Pending;
            frontier.visited.insert(item.entity_id.clone(), FrontierState::Pending);
            frontier.push(item);
        }
        frontier
    }

    fn push(&mut self, item: FrontierItem) {
        self.seq += 1;
        self.heap.push(Queued {
            item,
            seq: self.seq,
        });
    }

    /// Queue a seed. Seeds skip the quality gate but not dedup.
    pub fn seed(&mut self, entity_id: &str) -> bool {
        if self.visited.contains_key(entity_id) {
            return false;
        }
        self.visited
            .insert(entity_id.to_string(), FrontierState::Pending);
        self.push(FrontierItem::seed(entity_id));
        true
    }

    /// Offer an id discovered from an item at `parent_depth`.
    pub fn admit(&mut self, entity_id: &str, parent_depth: u32, score: f64) -> Admission {
        if self.visited.contains_key(entity_id) {
            return Admission::AlreadyVisited;
        }
        let depth = parent_depth + 1;
        if depth > self.max_depth {
            return Admission::TooDeep;
        }
        if score < self.threshold {
            return Admission::BelowThreshold;
        }
        self.visited
            .insert(entity_id.to_string(), FrontierState::Pending);
        self.push(FrontierItem::discovered(entity_id, depth, score));
        Admission::Admitted
    }

    /// Whether a child of an item at `parent_depth` could still be admitted.
    pub fn can_expand(&self, parent_depth: u32) -> bool {
        parent_depth < self.max_depth
    }

    pub fn is_visited(&self, entity_id: &str) -> bool {
        self.visited.contains_key(entity_id)
    }

    pub fn state(&self, entity_id: &str) -> Option<FrontierState> {
        self.visited.get(entity_id).copied()
    }

    /// Pop the best pending item and mark it processing.
    pub fn next(&mut self) -> Option<FrontierItem> {
        let Queued { mut item, .. } = self.heap.pop()?;
        item.state = FrontierState::Processing;
        self.visited
            .insert(item.entity_id.clone(), FrontierState::Processing);
        self.processing.insert(item.entity_id.clone(), item.clone());
        Some(item)
    }

    pub fn complete(&mut self, entity_id: &str) {
        self.finish(entity_id, FrontierState::Completed);
    }

    pub fn fail(&mut self, entity_id: &str) {
        self.finish(entity_id, FrontierState::Failed);
    }

    fn finish(&mut self, entity_id: &str, state: FrontierState) {
        self.processing.remove(entity_id);
        if let Some(slot) = self.visited.get_mut(entity_id) {
            *slot = state;
        }
    }

    /// Put an in-flight item back for another attempt.
    pub fn requeue(&mut self, entity_id: &str) -> Option<u32> {
        let mut item = self.processing.remove(entity_id)?;
        item.attempts += 1;
        item.state = FrontierState::Pending;
        let attempts = item.attempts;
        self.visited
            .insert(entity_id.to_string(), FrontierState::Pending);
        self.push(item);
        Some(attempts)
    }

    /// Attempts already spent on an in-flight item.
    pub fn attempts(&self, entity_id: &str) -> u32 {
        self.processing
            .get(entity_id)
            .map(|item| item.attempts)
            .unwrap_or_default()
    }

    pub fn pending_len(&self) -> usize {
        self.heap.len()
    }

    pub fn in_flight(&self) -> usize {
        self.processing.len()
    }

    pub fn visited_len(&self) -> usize {
        self.visited.len()
    }

    pub fn count_state(&self, state: FrontierState) -> usize {
        self.visited.values().filter(|s| **s == state).count()
    }

    /// Serializable view. In-flight items are saved as pending so a resumed
    /// run picks them up again.
    pub fn snapshot(&self) -> FrontierSnapshot {
        let mut queued: Vec<&Queued> = self.heap.iter().collect();
        queued.sort_by(|a, b| b.cmp(a));

        let mut pending: Vec<FrontierItem> = self
            .processing
            .values()
            .cloned()
            .map(|mut item| {
                item.state = FrontierState::Pending;
                item
            })
            .collect();
        pending.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        pending.extend(queued.into_iter().map(|q| q.item.clone()));

        let mut visited: Vec<(String, FrontierState)> = self
            .visited
            .iter()
            .map(|(id, state)| (id.clone(), *state))
            .collect();
        visited.sort_by(|a, b| a.0.cmp(&b.0));

        FrontierSnapshot { pending, visited }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_then_depth_order() {
        let mut f = Frontier::new(3, 0.5);
        f.seed("did:plc:seed");
        assert_eq!(f.next().unwrap().entity_id, "did:plc:seed");

        assert_eq!(f.admit("did:plc:low", 0, 0.6), Admission::Admitted);
        assert_eq!(f.admit("did:plc:high", 0, 0.9), Admission::Admitted);
        assert_eq!(f.admit("did:plc:deep", 1, 0.9), Admission::Admitted);

        let order: Vec<_> = std::iter::from_fn(|| f.next()).map(|i| i.entity_id).collect();
        assert_eq!(order, vec!["did:plc:high", "did:plc:deep", "did:plc:low"]);
    }

    #[test]
    fn test_quality_and_depth_gate() {
        let mut f = Frontier::new(2, 0.6);
        assert_eq!(f.admit("did:plc:a", 0, 0.59), Admission::BelowThreshold);
        assert_eq!(f.admit("did:plc:b", 2, 0.99), Admission::TooDeep);
        assert_eq!(f.admit("did:plc:c", 1, 0.6), Admission::Admitted);
        assert!(!f.is_visited("did:plc:a"));
        assert!(!f.can_expand(2));
        assert_eq!(f.pending_len(), 1);
    }

    #[test]
    fn test_completed_is_never_requeued() {
        let mut f = Frontier::new(3, 0.0);
        f.seed("did:plc:a");
        let item = f.next().unwrap();
        f.complete(&item.entity_id);

        assert_eq!(f.admit("did:plc:a", 0, 1.0), Admission::AlreadyVisited);
        assert!(!f.seed("did:plc:a"));
        assert_eq!(f.state("did:plc:a"), Some(FrontierState::Completed));
        assert!(f.next().is_none());
    }

    #[test]
    fn test_requeue_counts_attempts() {
        let mut f = Frontier::new(3, 0.0);
        f.seed("did:plc:a");
        f.next();
        assert_eq!(f.requeue("did:plc:a"), Some(1));
        let again = f.next().unwrap();
        assert_eq!(again.attempts, 1);
        assert_eq!(f.attempts("did:plc:a"), 1);
        f.fail("did:plc:a");
        assert_eq!(f.count_state(FrontierState::Failed), 1);
        assert_eq!(f.in_flight(), 0);
    }

    #[test]
    fn test_snapshot_restores_in_flight_as_pending() {
        let mut f = Frontier::new(3, 0.0);
        f.seed("did:plc:a");
        f.seed("did:plc:b");
        f.next();
        f.admit("did:plc:c", 0, 0.7);

        let snapshot = f.snapshot();
        assert_eq!(snapshot.pending.len(), 3);
        assert!(snapshot.pending.iter().all(|i| i.state == FrontierState::Pending));

        let mut restored = Frontier::restore(snapshot, 3, 0.0);
        assert_eq!(restored.pending_len(), 3);
        assert_eq!(restored.visited_len(), 3);
        assert_eq!(restored.admit("did:plc:c", 0, 0.9), Admission::AlreadyVisited);
    }
}
