// src/pipeline/flusher.rs

//! Batch flusher: moves queued writes into the entity store.
//!
//! Writes go through the `storage-write` circuit breaker and the shared
//! retry policy. Users are always flushed before the dependent variants
//! that reference them. A batch rejected for a missing owner gets
//! placeholder owners and one more attempt; after that it is dropped and
//! counted, never re-queued.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::error::{AppError, Result};
use crate::models::{
    BatchConfig, Config, Counter, Entity, EntityKind, KindCounter, PendingWrite, PipelineStats,
};
use crate::pipeline::circuit_breaker::CircuitBreaker;
use crate::pipeline::queues::EntityQueues;
use crate::pipeline::retry::{RetryPolicy, retry_observed};
use crate::storage::EntityStore;

/// Rows affected by one flush call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushSummary {
    pub written: usize,
    pub deleted: usize,
    pub dropped: usize,
}

impl FlushSummary {
    fn merge(&mut self, other: FlushSummary) {
        self.written += other.written;
        self.deleted += other.deleted;
        self.dropped += other.dropped;
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0 && self.deleted == 0 && self.dropped == 0
    }
}

pub struct BatchFlusher {
    queues: Mutex<EntityQueues>,
    store: Arc<dyn EntityStore>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    config: BatchConfig,
    stats: Arc<PipelineStats>,
    flush_lock: tokio::sync::Mutex<()>,
    /// `FlushErrors` as of the last checkpoint that covered every write
    checkpointed_errors: AtomicU64,
}

impl BatchFlusher {
    pub fn new(store: Arc<dyn EntityStore>, config: &Config, stats: Arc<PipelineStats>) -> Self {
        Self {
            queues: Mutex::new(EntityQueues::new()),
            store,
            breaker: CircuitBreaker::new("storage-write", config.circuit_breaker.clone()),
            retry: RetryPolicy::from_config(&config.retry),
            config: config.batch.clone(),
            stats,
            flush_lock: tokio::sync::Mutex::new(()),
            checkpointed_errors: AtomicU64::new(0),
        }
    }

    /// Replace the retry policy used for storage writes.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    fn queues(&self) -> MutexGuard<'_, EntityQueues> {
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue an upsert. Returns `true` when its queue reached the batch size.
    pub fn enqueue(&self, entity: Entity) -> bool {
        let kind = entity.kind();
        let len = self.queues().enqueue(entity);
        self.stats.add_kind(KindCounter::Enqueued, kind, 1);
        len >= self.config.batch_size
    }

    /// Queue a delete by record URI. Returns `true` when the queue is full.
    pub fn enqueue_delete(&self, kind: EntityKind, uri: String) -> bool {
        if kind == EntityKind::User {
            log::debug!("Ignoring delete of user record {uri}");
            return false;
        }
        let len = self.queues().enqueue_delete(kind, uri);
        self.stats.add_kind(KindCounter::Enqueued, kind, 1);
        len >= self.config.batch_size
    }

    /// Queue a decoded write. Returns `true` when any touched queue is full.
    pub fn apply(&self, write: PendingWrite) -> bool {
        match write {
            PendingWrite::Upsert(entity) => self.enqueue(entity),
            PendingWrite::Delete { kind, uri } => self.enqueue_delete(kind, uri),
        }
    }

    /// Batches dropped since [`BatchFlusher::mark_checkpoint`] was last
    /// called. A checkpoint saved while this is non-zero would skip them.
    pub fn drops_since_checkpoint(&self) -> u64 {
        self.stats
            .get(Counter::FlushErrors)
            .saturating_sub(self.checkpointed_errors.load(Ordering::Relaxed))
    }

    /// Record that a checkpoint now covers everything flushed so far.
    pub fn mark_checkpoint(&self) {
        self.checkpointed_errors
            .store(self.stats.get(Counter::FlushErrors), Ordering::Relaxed);
    }

    pub fn pending(&self, kind: EntityKind) -> usize {
        self.queues().len(kind)
    }

    pub fn total_pending(&self) -> usize {
        self.queues().total_len()
    }

    /// Flush one variant. Dependent variants flush pending users first.
    pub async fn flush(&self, kind: EntityKind) -> FlushSummary {
        let _serial = self.flush_lock.lock().await;
        let mut summary = FlushSummary::default();
        if kind.is_dependent() {
            summary.merge(self.flush_locked(EntityKind::User).await);
        }
        summary.merge(self.flush_locked(kind).await);
        summary
    }

    /// Flush every queue, owners first.
    pub async fn flush_all(&self) -> FlushSummary {
        let _serial = self.flush_lock.lock().await;
        let mut summary = FlushSummary::default();
        for kind in EntityKind::FLUSH_ORDER {
            summary.merge(self.flush_locked(kind).await);
        }
        if !summary.is_empty() {
            log::debug!(
                "Flushed {} rows, deleted {}, dropped {}",
                summary.written,
                summary.deleted,
                summary.dropped
            );
        }
        summary
    }

    /// Flush the queues that reached the batch size.
    pub async fn flush_if_full(&self) -> FlushSummary {
        let full: Vec<EntityKind> = {
            let queues = self.queues();
            EntityKind::FLUSH_ORDER
                .into_iter()
                .filter(|kind| queues.len(*kind) >= self.config.batch_size)
                .collect()
        };
        if full.is_empty() {
            return FlushSummary::default();
        }

        let _serial = self.flush_lock.lock().await;
        let needs_users = full.iter().any(|k| k.is_dependent());
        let mut summary = FlushSummary::default();
        for kind in EntityKind::FLUSH_ORDER {
            if full.contains(&kind) || (kind == EntityKind::User && needs_users) {
                summary.merge(self.flush_locked(kind).await);
            }
        }
        summary
    }

    /// Flush all queues on the configured interval until `stop` flips.
    pub async fn run_periodic(&self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.flush_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_all().await;
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn flush_locked(&self, kind: EntityKind) -> FlushSummary {
        let batch = self.queues().drain(kind);
        let mut summary = FlushSummary::default();
        if batch.is_empty() {
            return summary;
        }

        if !batch.upserts.is_empty() {
            match self.write_upserts(kind, &batch.upserts).await {
                Ok(n) => {
                    summary.written = n;
                    self.stats
                        .add_kind(KindCounter::Written, kind, batch.upserts.len() as u64);
                }
                Err(e) => {
                    self.record_drop(kind, batch.upserts.len(), &e);
                    summary.dropped += batch.upserts.len();
                }
            }
        }

        if !batch.deletions.is_empty() {
            let uris = &batch.deletions;
            let label = format!("delete {kind}");
            let store = &self.store;
            match self
                .guarded(&label, move || store.delete(kind, uris))
                .await
            {
                Ok(n) => {
                    summary.deleted = n;
                    self.stats.add_kind(KindCounter::Deleted, kind, n as u64);
                }
                Err(e) => {
                    self.record_drop(kind, uris.len(), &e);
                    summary.dropped += uris.len();
                }
            }
        }

        summary
    }

    async fn write_upserts(&self, kind: EntityKind, batch: &[Entity]) -> Result<usize> {
        let mode = self.config.conflict.for_kind(kind);
        let label = format!("upsert {kind}");
        let store = &self.store;

        match self
            .guarded(&label, move || store.upsert(kind, batch, mode))
            .await
        {
            Err(AppError::ReferentialWrite { message, .. }) => {
                self.stats.incr(Counter::ReferentialRetries);
                log::warn!(
                    "{kind} batch of {} rejected for a missing owner ({message}); creating placeholders and retrying once",
                    batch.len()
                );
                let (owners, indexed_at) = owners_of(batch);
                let owners = &owners;
                self.guarded("ensure owners", move || {
                    store.ensure_users(owners, indexed_at)
                })
                .await?;
                self.guarded(&label, move || store.upsert(kind, batch, mode))
                    .await
            }
            other => other,
        }
    }

    /// Run a storage call through the breaker and retry policy.
    async fn guarded<T, F, Fut>(&self, label: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let op = &op;
        let breaker = &self.breaker;
        let stats = &self.stats;
        retry_observed(
            &self.retry,
            label,
            move || breaker.execute(op),
            |e| {
                if matches!(e, AppError::CircuitOpen { .. }) {
                    stats.incr(Counter::CircuitRejections);
                }
            },
        )
        .await
    }

    fn record_drop(&self, kind: EntityKind, rows: usize, error: &AppError) {
        self.stats.incr(Counter::FlushErrors);
        self.stats.add_kind(KindCounter::Dropped, kind, rows as u64);
        log::error!("Dropping {rows} pending {kind} writes: {error}");
    }
}

/// DIDs referenced by a batch, and the newest timestamp among its rows.
fn owners_of(batch: &[Entity]) -> (Vec<String>, i64) {
    let mut owners: Vec<String> = batch.iter().flat_map(Entity::owner_dids).collect();
    owners.sort();
    owners.dedup();
    let indexed_at = batch
        .iter()
        .map(|e| match e {
            Entity::User(u) => u.indexed_at,
            Entity::Edge(e) => e.indexed_at,
            Entity::Content(c) => c.indexed_at,
            Entity::Interaction(i) => i.indexed_at,
        })
        .max()
        .unwrap_or_default();
    (owners, indexed_at)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::models::{ConflictMode, Content, Edge, User};
    use crate::storage::SqliteStore;

    fn config(batch_size: usize) -> Config {
        let mut config = Config::default();
        config.batch.batch_size = batch_size;
        config.batch.flush_interval_ms = 1_000;
        config.circuit_breaker.failure_threshold = 3;
        config
    }

    fn flusher(store: Arc<dyn EntityStore>, batch_size: usize) -> BatchFlusher {
        BatchFlusher::new(store, &config(batch_size), Arc::new(PipelineStats::new()))
            .with_retry_policy(RetryPolicy::none())
    }

    fn follow(source: &str, target: &str) -> Entity {
        Entity::Edge(Edge {
            source: source.into(),
            target: target.into(),
            uri: Some(format!("at://{source}/app.bsky.graph.follow/{target}")),
            created_at: None,
            indexed_at: 10,
        })
    }

    /// Store that fails every call.
    struct BrokenStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EntityStore for BrokenStore {
        async fn upsert(&self, _: EntityKind, _: &[Entity], _: ConflictMode) -> Result<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(AppError::storage("disk on fire"))
        }
        async fn delete(&self, _: EntityKind, _: &[String]) -> Result<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(AppError::storage("disk on fire"))
        }
        async fn ensure_users(&self, _: &[String], _: i64) -> Result<usize> {
            Err(AppError::storage("disk on fire"))
        }
        async fn count(&self, _: EntityKind) -> Result<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_dependent_flush_writes_users_first() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let flusher = flusher(store.clone(), 100);

        flusher.enqueue(follow("did:plc:a", "did:plc:b"));
        flusher.enqueue(Entity::User(User::placeholder("did:plc:b", 1)));
        flusher.enqueue(Entity::User(User::placeholder("did:plc:a", 1)));

        let summary = flusher.flush(EntityKind::Edge).await;
        assert_eq!(summary.written, 3);
        assert_eq!(summary.dropped, 0);
        assert!(store.get_edge("did:plc:a", "did:plc:b").await.unwrap().is_some());
        assert_eq!(flusher.stats().get(Counter::ReferentialRetries), 0);
    }

    #[tokio::test]
    async fn test_missing_owner_is_created_then_retried_once() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let flusher = flusher(store.clone(), 100);

        flusher.enqueue(Entity::Content(Content {
            uri: "at://did:plc:a/app.bsky.feed.post/1".into(),
            author: "did:plc:a".into(),
            cid: None,
            text: "hello".into(),
            created_at: None,
            reply_parent: Some("at://did:plc:b/app.bsky.feed.post/0".into()),
            reply_root: None,
            langs: vec!["en".into()],
            indexed_at: 10,
        }));

        let summary = flusher.flush_all().await;
        assert_eq!(summary.written, 1);
        assert_eq!(flusher.stats().get(Counter::ReferentialRetries), 1);
        assert!(store.get_user("did:plc:a").await.unwrap().is_some());
        assert!(store.get_user("did:plc:b").await.unwrap().is_some());
        assert_eq!(store.count(EntityKind::Content).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_batch_is_dropped_not_requeued() {
        let store = Arc::new(BrokenStore {
            calls: AtomicUsize::new(0),
        });
        let flusher = flusher(store.clone(), 100);
        flusher.enqueue(Entity::User(User::placeholder("did:plc:a", 1)));
        flusher.enqueue_delete(EntityKind::Content, "at://did:plc:a/app.bsky.feed.post/1".into());

        let summary = flusher.flush_all().await;
        assert_eq!(summary.dropped, 2);
        assert_eq!(flusher.total_pending(), 0);
        assert_eq!(flusher.stats().get(Counter::FlushErrors), 2);
        assert_eq!(
            flusher
                .stats()
                .get_kind(KindCounter::Dropped, EntityKind::User),
            1
        );

        let again = flusher.flush_all().await;
        assert!(again.is_empty());
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_drops_are_tracked_until_next_checkpoint() {
        let store = Arc::new(BrokenStore {
            calls: AtomicUsize::new(0),
        });
        let flusher = flusher(store, 100);
        assert_eq!(flusher.drops_since_checkpoint(), 0);

        flusher.enqueue(Entity::User(User::placeholder("did:plc:a", 1)));
        flusher.flush_all().await;
        assert_eq!(flusher.drops_since_checkpoint(), 1);

        // A later empty flush does not hide the earlier loss.
        flusher.flush_all().await;
        assert_eq!(flusher.drops_since_checkpoint(), 1);

        flusher.mark_checkpoint();
        assert_eq!(flusher.drops_since_checkpoint(), 0);
    }

    #[tokio::test]
    async fn test_open_breaker_rejects_without_touching_store() {
        let store = Arc::new(BrokenStore {
            calls: AtomicUsize::new(0),
        });
        let flusher = flusher(store.clone(), 100);
        for i in 0..5 {
            flusher.enqueue(Entity::User(User::placeholder(format!("did:plc:{i}"), 1)));
            flusher.flush(EntityKind::User).await;
        }
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert_eq!(flusher.stats().get(Counter::CircuitRejections), 2);
        assert_eq!(flusher.stats().get(Counter::FlushErrors), 5);
    }

    #[tokio::test]
    async fn test_enqueue_reports_full_queue() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let flusher = flusher(store.clone(), 2);
        assert!(!flusher.enqueue(Entity::User(User::placeholder("did:plc:a", 1))));
        assert!(flusher.enqueue(Entity::User(User::placeholder("did:plc:b", 1))));

        flusher.enqueue(follow("did:plc:a", "did:plc:b"));
        let summary = flusher.flush_if_full().await;
        assert_eq!(summary.written, 2);
        assert_eq!(flusher.pending(EntityKind::Edge), 1);
    }

    #[tokio::test]
    async fn test_deletes_remove_rows() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let flusher = flusher(store.clone(), 100);
        flusher.enqueue(Entity::User(User::placeholder("did:plc:a", 1)));
        flusher.enqueue(Entity::User(User::placeholder("did:plc:b", 1)));
        flusher.enqueue(follow("did:plc:a", "did:plc:b"));
        flusher.flush_all().await;

        flusher.apply(PendingWrite::Delete {
            kind: EntityKind::Edge,
            uri: "at://did:plc:a/app.bsky.graph.follow/did:plc:b".into(),
        });
        let summary = flusher.flush_all().await;
        assert_eq!(summary.deleted, 1);
        assert_eq!(store.count(EntityKind::Edge).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flush_runs_on_interval() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let flusher = Arc::new(flusher(store.clone(), 100));
        let (stop_tx, stop_rx) = watch::channel(false);

        let runner = {
            let flusher = Arc::clone(&flusher);
            tokio::spawn(async move { flusher.run_periodic(stop_rx).await })
        };
        flusher.enqueue(Entity::User(User::placeholder("did:plc:a", 1)));

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(flusher.total_pending(), 0);

        stop_tx.send(true).unwrap();
        runner.await.unwrap();
    }
}
