//! Ingestion pipeline.
//!
//! - `stream`: live firehose consumption into the batch flusher
//! - `crawl`: resumable breadth-first backfill over the follow graph
//!
//! Both paths share the resilience primitives (`retry`, `circuit_breaker`,
//! `rate_limiter`) and write through the same `flusher`.

pub mod circuit_breaker;
pub mod crawl;
pub mod flusher;
pub mod frontier;
pub mod quality;
pub mod queues;
pub mod rate_limiter;
pub mod retry;
pub mod stream;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use crawl::{CrawlReport, Crawler, StopReason};
pub use flusher::{BatchFlusher, FlushSummary};
pub use frontier::{Admission, Frontier};
pub use quality::{Assessment, QualityScorer};
pub use queues::{DrainedBatch, EntityQueue, EntityQueues};
pub use rate_limiter::RateLimiter;
pub use retry::{RetryPolicy, retry, retry_observed};
pub use stream::{StreamConsumer, StreamReport};
