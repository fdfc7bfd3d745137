// src/pipeline/stream.rs

//! Live firehose consumer.
//!
//! Holds one subscription at a time. Every message is decoded, turned into
//! queue writes and handed to the batch flusher; a periodic tick flushes all
//! queues. Every `stream_every` messages the queues are flushed and the
//! cursor is checkpointed. Lost connections are re-opened from the last
//! cursor with capped exponential backoff; too many consecutive failures end
//! the run with [`AppError::Fatal`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{AppError, Result};
use crate::models::{
    Checkpoint, Collection, Config, Counter, Cursor, Decoded, PipelineStats, decode,
};
use crate::pipeline::flusher::BatchFlusher;
use crate::pipeline::retry::RetryPolicy;
use crate::services::EventSource;
use crate::storage::CheckpointStore;

/// Outcome of a consumer run that ended on shutdown.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamReport {
    pub messages: u64,
    pub last_cursor: Option<i64>,
    pub reconnects: u32,
    pub elapsed: Duration,
}

enum Disconnect {
    Lost,
    Shutdown,
}

pub struct StreamConsumer {
    source: Arc<dyn EventSource>,
    flusher: Arc<BatchFlusher>,
    checkpoints: Arc<dyn CheckpointStore>,
    stats: Arc<PipelineStats>,
    subscribed: HashSet<Collection>,
    max_reconnect_attempts: u32,
    reconnect: RetryPolicy,
    flush_interval: Duration,
    checkpoint_every: u64,
}

impl StreamConsumer {
    pub fn new(
        source: Arc<dyn EventSource>,
        flusher: Arc<BatchFlusher>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: &Config,
    ) -> Self {
        let reconnect = RetryPolicy {
            max_retries: config.stream.max_reconnect_attempts,
            base_delay: Duration::from_millis(config.stream.reconnect_base_ms),
            max_delay: Duration::from_millis(config.stream.reconnect_max_ms),
            max_rate_limit_hits: 0,
            jitter: true,
        };
        Self {
            stats: Arc::clone(flusher.stats()),
            source,
            flusher,
            checkpoints,
            subscribed: config.stream.subscribed().into_iter().collect(),
            max_reconnect_attempts: config.stream.max_reconnect_attempts,
            reconnect,
            flush_interval: config.batch.flush_interval(),
            checkpoint_every: config.checkpoint.stream_every.max(1),
        }
    }

    /// Load the saved checkpoint, restore counters and return the cursor to
    /// resume from.
    pub async fn resume(&self) -> Result<Option<i64>> {
        match self.checkpoints.load().await? {
            Some(checkpoint) => {
                self.stats.restore(&checkpoint.counters);
                self.flusher.mark_checkpoint();
                let cursor = checkpoint.cursor.as_ref().and_then(Cursor::as_index);
                log::info!(
                    "Resuming from checkpoint saved {} (cursor {:?})",
                    checkpoint.updated_at,
                    cursor
                );
                Ok(cursor)
            }
            None => {
                log::info!("No checkpoint found; starting from the live tip");
                Ok(None)
            }
        }
    }

    /// Consume until `shutdown` flips or reconnects are exhausted.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<StreamReport> {
        let started = Instant::now();
        let mut cursor = self.resume().await?;
        let mut failures = 0u32;
        let mut reconnects = 0u32;
        let mut messages = 0u64;
        let mut since_checkpoint = 0u64;

        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let connected = tokio::select! {
                result = self.source.connect(cursor) => result,
                _ = shutdown.changed() => break,
            };

            let disconnect = match connected {
                Ok(mut frames) => loop {
                    tokio::select! {
                        frame = frames.next() => match frame {
                            Some(Ok(text)) => {
                                failures = 0;
                                messages += 1;
                                if let Some(c) = self.handle(&text).await {
                                    cursor = Some(cursor.map_or(c, |prev| prev.max(c)));
                                }
                                since_checkpoint += 1;
                                if since_checkpoint >= self.checkpoint_every {
                                    self.checkpoint(cursor).await;
                                    since_checkpoint = 0;
                                }
                            }
                            Some(Err(AppError::Decode(reason))) => {
                                self.stats.incr(Counter::DecodeErrors);
                                log::warn!("Dropping undecodable frame: {reason}");
                            }
                            Some(Err(e)) => {
                                log::warn!("Subscription lost: {e}");
                                break Disconnect::Lost;
                            }
                            None => {
                                log::warn!("Subscription closed by server");
                                break Disconnect::Lost;
                            }
                        },
                        _ = ticker.tick() => {
                            self.flusher.flush_all().await;
                        }
                        _ = shutdown.changed() => break Disconnect::Shutdown,
                    }
                },
                Err(e) => {
                    log::warn!("Connection attempt failed: {e}");
                    Disconnect::Lost
                }
            };

            if let Disconnect::Shutdown = disconnect {
                break;
            }

            failures += 1;
            if failures > self.max_reconnect_attempts {
                log::error!(
                    "Giving up after {} consecutive failed connection attempts",
                    failures
                );
                self.checkpoint(cursor).await;
                return Err(AppError::Fatal(format!(
                    "firehose unreachable after {} reconnect attempts",
                    self.max_reconnect_attempts
                )));
            }

            // Not `retry`: the counter spans a long-lived subscription and
            // resets on any frame, so each attempt is not one bounded call.
            let delay = self.reconnect.backoff(failures - 1);
            log::info!(
                "Reconnecting in {delay:?} (attempt {failures}/{})",
                self.max_reconnect_attempts
            );
            reconnects += 1;
            self.stats.incr(Counter::Reconnects);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        log::info!("Shutdown requested; flushing pending writes");
        self.flusher.flush_all().await;
        self.save(cursor).await?;
        self.flusher.mark_checkpoint();

        Ok(StreamReport {
            messages,
            last_cursor: cursor,
            reconnects,
            elapsed: started.elapsed(),
        })
    }

    /// Decode and enqueue one frame. Returns the frame's cursor when known.
    pub async fn handle(&self, text: &str) -> Option<i64> {
        match decode(text) {
            Decoded::Commit(event) => {
                if !self.subscribed.contains(&event.collection) {
                    self.stats.incr(Counter::IgnoredMessages);
                    return Some(event.cursor);
                }
                self.stats.incr(Counter::EventsProcessed);
                let mut full = false;
                for write in event.to_writes() {
                    full |= self.flusher.apply(write);
                }
                if full {
                    self.flusher.flush_if_full().await;
                }
                Some(event.cursor)
            }
            Decoded::Ignored { kind, cursor } => {
                self.stats.incr(Counter::IgnoredMessages);
                log::trace!("Ignoring {kind} message at {cursor}");
                Some(cursor)
            }
            Decoded::Error(failure) => {
                self.stats.incr(Counter::DecodeErrors);
                log::warn!("Dropping undecodable message: {}", failure.reason);
                failure.cursor
            }
        }
    }

    /// Flush, then save the cursor. Failures are logged; the next
    /// checkpoint will try again.
    ///
    /// The save is skipped while dropped batches are outstanding, so a
    /// restart replays from the last cursor whose writes all landed.
    async fn checkpoint(&self, cursor: Option<i64>) {
        self.flusher.flush_all().await;
        let dropped = self.flusher.drops_since_checkpoint();
        if dropped > 0 {
            log::warn!(
                "Keeping previous checkpoint: {dropped} batch(es) dropped since it was saved"
            );
            return;
        }
        match self.save(cursor).await {
            Ok(()) => self.flusher.mark_checkpoint(),
            Err(e) => log::error!("Failed to save checkpoint: {e}"),
        }
    }

    async fn save(&self, cursor: Option<i64>) -> Result<()> {
        let checkpoint = Checkpoint::new(cursor.map(Cursor::Index), self.stats.to_map());
        self.checkpoints.save(&checkpoint).await
    }
}
