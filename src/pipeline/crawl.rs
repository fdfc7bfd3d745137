// src/pipeline/crawl.rs

//! Backfill crawler.
//!
//! Walks the follow graph outward from a seed set. `workers` cooperative
//! futures share one priority frontier, so at most that many items (and
//! outbound fetches) are in flight. Every remote call waits on the rate
//! limiter, runs through the `remote-api` circuit breaker and is retried by
//! the shared retry policy. Fetched users and edges go through the batch
//! flusher; neighbors enter the frontier only when they pass the depth and
//! quality gates and have not been seen before.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;

use crate::error::{AppError, Result};
use crate::models::{
    ActorProfile, Checkpoint, Config, Counter, CrawlerConfig, Cursor, Direction, Entity,
    FrontierItem, FrontierState, PipelineStats, User,
};
use crate::pipeline::circuit_breaker::CircuitBreaker;
use crate::pipeline::flusher::BatchFlusher;
use crate::pipeline::frontier::{Admission, Frontier};
use crate::pipeline::quality::QualityScorer;
use crate::pipeline::rate_limiter::RateLimiter;
use crate::pipeline::retry::{RetryPolicy, retry_observed};
use crate::services::{GraphApi, MAX_PROFILES_PER_CALL};
use crate::storage::CheckpointStore;
use crate::utils::{chunked, unix_micros};

/// Rate-limiter key shared by every outbound graph call.
const RATE_KEY: &str = "graph-api";

/// Why a crawl run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    FrontierExhausted,
    ItemBudget,
    TimeBudget,
    Shutdown,
    Fatal,
}

/// Summary returned by [`Crawler::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlReport {
    /// Items finished in this run (completed or failed)
    pub processed: u64,
    pub completed: u64,
    pub failed: u64,
    /// Neighbors admitted to the frontier
    pub admitted: u64,
    /// Neighbors turned away by the depth or quality gate
    pub rejected: u64,
    /// Items left in the frontier (saved in the checkpoint)
    pub pending: usize,
    pub stop_reason: StopReason,
    pub elapsed: Duration,
}

/// What one item contributed.
#[derive(Debug, Default)]
struct ItemOutcome {
    neighbors: usize,
    admitted: u64,
    rejected: u64,
}

#[derive(Debug)]
struct CrawlState {
    frontier: Frontier,
    processed: u64,
    completed: u64,
    failed: u64,
    admitted: u64,
    rejected: u64,
    since_checkpoint: u64,
    stop: Option<StopReason>,
    fatal: Option<String>,
}

enum Next {
    Item(FrontierItem),
    Wait,
    Done,
}

pub struct Crawler {
    api: Arc<dyn GraphApi>,
    flusher: Arc<BatchFlusher>,
    checkpoints: Arc<dyn CheckpointStore>,
    stats: Arc<PipelineStats>,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    /// Re-queues allowed per item after a retryable failure
    item_retries: u32,
    scorer: QualityScorer,
    config: CrawlerConfig,
    checkpoint_every: u64,
    state: Mutex<CrawlState>,
    wake: Notify,
    checkpoint_lock: tokio::sync::Mutex<()>,
}

impl Crawler {
    pub fn new(
        api: Arc<dyn GraphApi>,
        flusher: Arc<BatchFlusher>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: &Config,
    ) -> Self {
        Self {
            stats: Arc::clone(flusher.stats()),
            api,
            flusher,
            checkpoints,
            limiter: RateLimiter::from_config(&config.rate_limit),
            breaker: CircuitBreaker::new("remote-api", config.circuit_breaker.clone()),
            retry: RetryPolicy::from_config(&config.retry),
            item_retries: config.retry.max_retries,
            scorer: QualityScorer::new(config.quality.clone()),
            config: config.crawler.clone(),
            checkpoint_every: config.checkpoint.crawl_every.max(1),
            state: Mutex::new(CrawlState {
                frontier: Frontier::new(config.crawler.max_depth, config.quality.threshold),
                processed: 0,
                completed: 0,
                failed: 0,
                admitted: 0,
                rejected: 0,
                since_checkpoint: 0,
                stop: None,
                fatal: None,
            }),
            wake: Notify::new(),
            checkpoint_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Replace the retry policy used for individual remote calls.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Frontier state of an entity, if it was ever admitted.
    pub fn frontier_state(&self, entity_id: &str) -> Option<FrontierState> {
        self.lock().frontier.state(entity_id)
    }

    fn lock(&self) -> MutexGuard<'_, CrawlState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Crawl from `seeds` (or from the saved frontier) until the frontier
    /// empties, a budget runs out or `shutdown` flips.
    pub async fn run(
        &self,
        seeds: &[String],
        shutdown: watch::Receiver<bool>,
    ) -> Result<CrawlReport> {
        let started = Instant::now();
        self.prepare(seeds).await?;

        let deadline = self
            .config
            .max_duration_secs
            .map(|secs| started + Duration::from_secs(secs));
        let workers = self.config.workers.max(1);
        log::info!("Starting {workers} crawl workers");

        let (ticker_stop, ticker_rx) = watch::channel(false);
        let pool = async {
            join_all((0..workers).map(|id| self.worker(id, deadline, shutdown.clone()))).await;
            let _ = ticker_stop.send(true);
        };
        tokio::join!(pool, self.flusher.run_periodic(ticker_rx));

        self.checkpoint(false).await?;

        let state = self.lock();
        let report = CrawlReport {
            processed: state.processed,
            completed: state.completed,
            failed: state.failed,
            admitted: state.admitted,
            rejected: state.rejected,
            pending: state.frontier.pending_len(),
            stop_reason: state.stop.unwrap_or(StopReason::FrontierExhausted),
            elapsed: started.elapsed(),
        };
        if let Some(reason) = &state.fatal {
            return Err(AppError::Fatal(reason.clone()));
        }
        Ok(report)
    }

    /// Restore the saved frontier, then add any seeds not seen yet.
    async fn prepare(&self, seeds: &[String]) -> Result<()> {
        let saved = self.checkpoints.load().await?;
        let mut state = self.lock();

        match saved.and_then(|c| c.frontier.map(|f| (c.counters, f))) {
            Some((counters, frontier)) => {
                self.stats.restore(&counters);
                self.flusher.mark_checkpoint();
                state.frontier = Frontier::restore(
                    frontier,
                    self.config.max_depth,
                    self.scorer.threshold(),
                );
                log::info!(
                    "Resumed frontier: {} pending, {} completed, {} failed",
                    state.frontier.pending_len(),
                    state.frontier.count_state(FrontierState::Completed),
                    state.frontier.count_state(FrontierState::Failed)
                );
            }
            None => log::info!("No saved frontier; starting from {} seeds", seeds.len()),
        }

        let added = seeds
            .iter()
            .filter(|seed| state.frontier.seed(seed))
            .count();
        if added > 0 {
            log::info!("Queued {added} seeds");
        }
        Ok(())
    }

    async fn worker(
        &self,
        id: usize,
        deadline: Option<Instant>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        log::debug!("Worker {id} started");
        let mut shutdown_closed = false;
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let item = match self.next_item(deadline, &shutdown) {
                Next::Item(item) => item,
                Next::Done => break,
                Next::Wait => {
                    let budget = async {
                        match deadline {
                            Some(at) => tokio::time::sleep_until(at).await,
                            None => std::future::pending().await,
                        }
                    };
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = budget => {}
                        changed = shutdown.changed(), if !shutdown_closed => {
                            shutdown_closed = changed.is_err();
                        }
                    }
                    continue;
                }
            };

            let result = self.process(&item).await;
            let due = self.settle(&item, result);
            self.wake.notify_waiters();
            if due {
                if let Err(e) = self.checkpoint(true).await {
                    log::error!("Failed to save crawl checkpoint: {e}");
                }
            }
        }
        self.wake.notify_waiters();
        log::debug!("Worker {id} finished");
    }

    fn next_item(&self, deadline: Option<Instant>, shutdown: &watch::Receiver<bool>) -> Next {
        let mut state = self.lock();
        if state.stop.is_none() {
            if *shutdown.borrow() {
                log::info!("Shutdown requested; draining in-flight items");
                state.stop = Some(StopReason::Shutdown);
            } else if deadline.is_some_and(|at| Instant::now() >= at) {
                log::info!("Time budget exhausted");
                state.stop = Some(StopReason::TimeBudget);
            } else if self.config.max_items.is_some_and(|max| {
                state.processed + state.frontier.in_flight() as u64 >= max
            }) {
                log::info!("Item budget exhausted");
                state.stop = Some(StopReason::ItemBudget);
            }
        }
        if state.stop.is_some() {
            return Next::Done;
        }

        if let Some(item) = state.frontier.next() {
            return Next::Item(item);
        }
        if state.frontier.in_flight() > 0 {
            return Next::Wait;
        }
        state.stop = Some(StopReason::FrontierExhausted);
        Next::Done
    }

    /// Record an item's result. Returns `true` when a checkpoint is due.
    fn settle(&self, item: &FrontierItem, result: Result<ItemOutcome>) -> bool {
        let id = item.entity_id.as_str();
        let mut state = self.lock();
        match result {
            Ok(outcome) => {
                state.frontier.complete(id);
                state.completed += 1;
                state.admitted += outcome.admitted;
                state.rejected += outcome.rejected;
                self.stats.incr(Counter::ItemsCompleted);
                self.stats.add(Counter::ItemsRejected, outcome.rejected);
                log::debug!(
                    "Crawled {id} (depth {}): {} neighbors, {} admitted",
                    item.depth,
                    outcome.neighbors,
                    outcome.admitted
                );
            }
            Err(e) if e.is_fatal() => {
                log::error!("Stopping crawl: {e}");
                state.frontier.requeue(id);
                state.stop = Some(StopReason::Fatal);
                state.fatal.get_or_insert_with(|| e.to_string());
                return false;
            }
            Err(e) if e.is_retryable() && state.frontier.attempts(id) < self.item_retries => {
                let attempt = state.frontier.requeue(id).unwrap_or_default();
                log::warn!("Re-queueing {id} after attempt {attempt}: {e}");
                return false;
            }
            Err(e) => {
                state.frontier.fail(id);
                state.failed += 1;
                self.stats.incr(Counter::ItemsFailed);
                log::warn!("Giving up on {id}: {e}");
            }
        }
        state.processed += 1;
        state.since_checkpoint += 1;
        if state.since_checkpoint >= self.checkpoint_every {
            state.since_checkpoint = 0;
            return true;
        }
        false
    }

    /// Snapshot the frontier, flush everything queued so far, then save.
    ///
    /// A `periodic` checkpoint is skipped while dropped batches are
    /// outstanding, so a restart re-crawls the items whose writes were lost.
    /// The final checkpoint of a run is always saved.
    async fn checkpoint(&self, periodic: bool) -> Result<()> {
        let _serial = self.checkpoint_lock.lock().await;
        let (snapshot, processed) = {
            let state = self.lock();
            (state.frontier.snapshot(), state.processed)
        };
        self.flusher.flush_all().await;

        let dropped = self.flusher.drops_since_checkpoint();
        if periodic && dropped > 0 {
            log::warn!(
                "Keeping previous crawl checkpoint: {dropped} batch(es) dropped since it was saved"
            );
            return Ok(());
        }

        let total = self.stats.get(Counter::ItemsCompleted) + self.stats.get(Counter::ItemsFailed);
        let checkpoint = Checkpoint::new(Some(Cursor::Index(total as i64)), self.stats.to_map())
            .with_frontier(snapshot);
        self.checkpoints.save(&checkpoint).await?;
        self.flusher.mark_checkpoint();
        log::info!("Checkpoint saved ({processed} items this run, {total} total)");
        Ok(())
    }

    async fn process(&self, item: &FrontierItem) -> Result<ItemOutcome> {
        let actor = item.entity_id.as_str();
        let now = unix_micros();

        let mut neighbors: BTreeMap<String, ActorProfile> = BTreeMap::new();
        let mut edges = Vec::new();
        for direction in [Direction::Followers, Direction::Follows] {
            for profile in self.list_all(direction, actor).await? {
                edges.push(direction.edge(actor, &profile.did, now));
                neighbors.entry(profile.did.clone()).or_insert(profile);
            }
        }

        self.flusher.enqueue(Entity::User(User::placeholder(actor, now)));
        for profile in neighbors.values() {
            self.flusher.enqueue(Entity::User(profile.to_user(now)));
        }
        for edge in edges {
            self.flusher.enqueue(Entity::Edge(edge));
        }
        self.flusher.flush_if_full().await;

        let mut outcome = ItemOutcome {
            neighbors: neighbors.len(),
            ..ItemOutcome::default()
        };
        let candidates: Vec<String> = {
            let state = self.lock();
            if !state.frontier.can_expand(item.depth) {
                return Ok(outcome);
            }
            neighbors
                .keys()
                .filter(|did| !state.frontier.is_visited(did))
                .cloned()
                .collect()
        };
        let chunk_size = self.config.profile_batch_size.min(MAX_PROFILES_PER_CALL);
        for chunk in chunked(&candidates, chunk_size) {
            let chunk = &chunk;
            let api = &self.api;
            let profiles = self
                .call("getProfiles", move || api.get_profiles(chunk))
                .await?;

            for profile in &profiles {
                self.flusher.enqueue(Entity::User(profile.to_user(now)));
            }
            let mut state = self.lock();
            for profile in &profiles {
                let assessment = self.scorer.assess(profile);
                match state.frontier.admit(&profile.did, item.depth, assessment.score) {
                    Admission::Admitted => outcome.admitted += 1,
                    Admission::AlreadyVisited => {}
                    Admission::TooDeep | Admission::BelowThreshold => {
                        log::trace!(
                            "Rejected {} (score {:.2}, {:?})",
                            profile.did,
                            assessment.score,
                            assessment.disqualified
                        );
                        outcome.rejected += 1;
                    }
                }
            }
        }
        if outcome.admitted > 0 {
            self.wake.notify_waiters();
        }
        self.flusher.flush_if_full().await;
        Ok(outcome)
    }

    /// Page through one side of `actor`'s graph, up to the per-item cap.
    async fn list_all(&self, direction: Direction, actor: &str) -> Result<Vec<ActorProfile>> {
        let cap = self.config.max_neighbors_per_item;
        let limit = self.config.page_size;
        let label = format!("{} of {actor}", direction.as_str());
        let api = &self.api;

        let mut listed = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let current = cursor.as_deref();
            let page = self
                .call(&label, move || {
                    api.list_neighbors(direction, actor, limit, current)
                })
                .await?;
            listed.extend(page.items);
            if listed.len() >= cap {
                listed.truncate(cap);
                break;
            }
            match page.cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(listed)
    }

    /// Run one remote call behind the rate limiter, breaker and retry policy.
    async fn call<T, F, Fut>(&self, label: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let op = &op;
        let limiter = &self.limiter;
        let breaker = &self.breaker;
        let stats = &self.stats;
        retry_observed(
            &self.retry,
            label,
            move || async move {
                let waited = limiter.acquire(RATE_KEY).await;
                if !waited.is_zero() {
                    log::debug!("Throttled for {waited:?}");
                }
                breaker.execute(op).await
            },
            |e| match e {
                AppError::RateLimited { .. } => stats.incr(Counter::RateLimitHits),
                AppError::CircuitOpen { .. } => stats.incr(Counter::CircuitRejections),
                _ => {}
            },
        )
        .await
    }
}
