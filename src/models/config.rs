//! Application configuration structures.

use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{AppError, Result};
use crate::models::{Collection, EntityKind};

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Firehose subscription settings
    #[serde(default)]
    pub stream: StreamConfig,

    /// Queue and flush behavior
    #[serde(default)]
    pub batch: BatchConfig,

    /// Relational store location
    #[serde(default)]
    pub storage: StorageConfig,

    /// Checkpoint file and save cadence
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Backfill crawler settings
    #[serde(default)]
    pub crawler: CrawlerConfig,

    /// Outbound request throttle
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Retry/backoff shape shared by all components
    #[serde(default)]
    pub retry: RetryConfig,

    /// Circuit breaker thresholds
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Crawl admission heuristics
    #[serde(default)]
    pub quality: QualityConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if the file is missing.
    ///
    /// A file that exists but does not parse is still an error.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::warn!("Config file {:?} not found. Using defaults.", path);
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Apply `COLLECTOR_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("COLLECTOR_DATABASE_PATH") {
            self.storage.database_path = v;
        }
        if let Some(v) = lookup("COLLECTOR_CHECKPOINT_PATH") {
            self.checkpoint.path = v;
        }
        if let Some(v) = lookup("COLLECTOR_CRAWL_CHECKPOINT_PATH") {
            self.checkpoint.crawl_path = v;
        }
        if let Some(v) = lookup("COLLECTOR_STREAM_ENDPOINT") {
            self.stream.endpoint = v;
        }
        if let Some(v) = lookup("COLLECTOR_API_BASE_URL") {
            self.crawler.api_base_url = v;
        }
        if let Some(v) = lookup("COLLECTOR_ACCESS_TOKEN") {
            self.crawler.access_token = Some(v);
        }
        if let Some(v) = parse_var(&lookup, "COLLECTOR_BATCH_SIZE")? {
            self.batch.batch_size = v;
        }
        if let Some(v) = parse_var(&lookup, "COLLECTOR_FLUSH_INTERVAL_MS")? {
            self.batch.flush_interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "COLLECTOR_WORKERS")? {
            self.crawler.workers = v;
        }
        if let Some(v) = parse_var(&lookup, "COLLECTOR_MAX_DEPTH")? {
            self.crawler.max_depth = v;
        }
        if let Some(v) = parse_var(&lookup, "COLLECTOR_QUALITY_THRESHOLD")? {
            self.quality.threshold = v;
        }
        if let Some(v) = parse_var(&lookup, "COLLECTOR_MAX_RETRIES")? {
            self.retry.max_retries = v;
        }
        Ok(())
    }

    /// Validate configuration values. Any failure here aborts startup.
    pub fn validate(&self) -> Result<()> {
        let endpoint = Url::parse(&self.stream.endpoint)
            .map_err(|e| AppError::validation(format!("stream.endpoint is invalid: {e}")))?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(AppError::validation(
                "stream.endpoint must use ws:// or wss://",
            ));
        }
        if self.stream.collections.is_empty() {
            return Err(AppError::validation("stream.collections is empty"));
        }
        for nsid in &self.stream.collections {
            if Collection::from_nsid(nsid).is_none() {
                return Err(AppError::validation(format!(
                    "stream.collections contains unsupported collection '{nsid}'"
                )));
            }
        }
        if self.stream.max_reconnect_attempts == 0 {
            return Err(AppError::validation(
                "stream.max_reconnect_attempts must be > 0",
            ));
        }
        if self.batch.batch_size == 0 {
            return Err(AppError::validation("batch.batch_size must be > 0"));
        }
        if self.batch.flush_interval_ms == 0 {
            return Err(AppError::validation("batch.flush_interval_ms must be > 0"));
        }
        if self.storage.database_path.trim().is_empty() {
            return Err(AppError::validation("storage.database_path is empty"));
        }
        if self.checkpoint.path.trim().is_empty() || self.checkpoint.crawl_path.trim().is_empty() {
            return Err(AppError::validation(
                "checkpoint.path and checkpoint.crawl_path must be set",
            ));
        }
        if self.checkpoint.stream_every == 0 || self.checkpoint.crawl_every == 0 {
            return Err(AppError::validation(
                "checkpoint.stream_every and checkpoint.crawl_every must be > 0",
            ));
        }
        let api = Url::parse(&self.crawler.api_base_url)
            .map_err(|e| AppError::validation(format!("crawler.api_base_url is invalid: {e}")))?;
        if !matches!(api.scheme(), "http" | "https") {
            return Err(AppError::validation(
                "crawler.api_base_url must use http:// or https://",
            ));
        }
        if self.crawler.user_agent.trim().is_empty() {
            return Err(AppError::validation("crawler.user_agent is empty"));
        }
        if self.crawler.timeout_secs == 0 {
            return Err(AppError::validation("crawler.timeout_secs must be > 0"));
        }
        if self.crawler.workers == 0 {
            return Err(AppError::validation("crawler.workers must be > 0"));
        }
        if !(1..=100).contains(&self.crawler.page_size) {
            return Err(AppError::validation("crawler.page_size must be in 1..=100"));
        }
        if !(1..=25).contains(&self.crawler.profile_batch_size) {
            return Err(AppError::validation(
                "crawler.profile_batch_size must be in 1..=25",
            ));
        }
        if self.rate_limit.max_requests == 0 || self.rate_limit.window_ms == 0 {
            return Err(AppError::validation(
                "rate_limit.max_requests and rate_limit.window_ms must be > 0",
            ));
        }
        if self.retry.base_delay_ms == 0 || self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(AppError::validation(
                "retry.base_delay_ms must be > 0 and <= retry.max_delay_ms",
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(AppError::validation(
                "circuit_breaker.failure_threshold must be > 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.quality.threshold) {
            return Err(AppError::validation("quality.threshold must be in 0..=1"));
        }
        if self.quality.min_ratio >= self.quality.max_ratio {
            return Err(AppError::validation(
                "quality.min_ratio must be below quality.max_ratio",
            ));
        }
        Ok(())
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| AppError::config(format!("{name}={raw:?} is invalid: {e}"))),
        None => Ok(None),
    }
}

/// Firehose subscription settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// WebSocket subscribe endpoint
    #[serde(default = "defaults::endpoint")]
    pub endpoint: String,

    /// Collection NSIDs to subscribe to
    #[serde(default = "defaults::collections")]
    pub collections: Vec<String>,

    /// Consecutive failed connection attempts before giving up
    #[serde(default = "defaults::max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "defaults::reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    #[serde(default = "defaults::reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoint: defaults::endpoint(),
            collections: defaults::collections(),
            max_reconnect_attempts: defaults::max_reconnect_attempts(),
            reconnect_base_ms: defaults::reconnect_base_ms(),
            reconnect_max_ms: defaults::reconnect_max_ms(),
        }
    }
}

impl StreamConfig {
    /// Parsed subscribed collections. Unknown NSIDs are skipped (validation
    /// rejects them up front).
    pub fn subscribed(&self) -> Vec<Collection> {
        self.collections
            .iter()
            .filter_map(|nsid| Collection::from_nsid(nsid))
            .collect()
    }
}

/// How a variant resolves a natural-key conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictMode {
    /// Keep the stored row
    Ignore,
    /// Update the stored row with the incoming values
    Overwrite,
}

/// Per-variant conflict modes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictModes {
    #[serde(default = "defaults::overwrite")]
    pub user: ConflictMode,
    #[serde(default = "defaults::overwrite")]
    pub edge: ConflictMode,
    #[serde(default = "defaults::overwrite")]
    pub content: ConflictMode,
    #[serde(default = "defaults::ignore")]
    pub interaction: ConflictMode,
}

impl Default for ConflictModes {
    fn default() -> Self {
        Self {
            user: ConflictMode::Overwrite,
            edge: ConflictMode::Overwrite,
            content: ConflictMode::Overwrite,
            interaction: ConflictMode::Ignore,
        }
    }
}

impl ConflictModes {
    pub fn for_kind(&self, kind: EntityKind) -> ConflictMode {
        match kind {
            EntityKind::User => self.user,
            EntityKind::Edge => self.edge,
            EntityKind::Content => self.content,
            EntityKind::Interaction => self.interaction,
        }
    }
}

/// Queue and flush behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Queue size that triggers an immediate flush
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,

    /// Periodic flush interval in milliseconds
    #[serde(default = "defaults::flush_interval_ms")]
    pub flush_interval_ms: u64,

    #[serde(default)]
    pub conflict: ConflictModes,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::batch_size(),
            flush_interval_ms: defaults::flush_interval_ms(),
            conflict: ConflictModes::default(),
        }
    }
}

impl BatchConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file
    #[serde(default = "defaults::database_path")]
    pub database_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: defaults::database_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Firehose checkpoint JSON file
    #[serde(default = "defaults::checkpoint_path")]
    pub path: String,

    /// Backfill checkpoint JSON file (cursor, counters and frontier)
    #[serde(default = "defaults::crawl_checkpoint_path")]
    pub crawl_path: String,

    /// Save after this many firehose events
    #[serde(default = "defaults::stream_every")]
    pub stream_every: u64,

    /// Save after this many crawled frontier items
    #[serde(default = "defaults::crawl_every")]
    pub crawl_every: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: defaults::checkpoint_path(),
            crawl_path: defaults::crawl_checkpoint_path(),
            stream_every: defaults::stream_every(),
            crawl_every: defaults::crawl_every(),
        }
    }
}

/// Backfill crawler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    /// Graph API base URL
    #[serde(default = "defaults::api_base_url")]
    pub api_base_url: String,

    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Optional bearer token
    #[serde(default)]
    pub access_token: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,

    /// Concurrent workers (bounds outstanding fetches)
    #[serde(default = "defaults::workers")]
    pub workers: usize,

    /// Deepest frontier depth admitted (seeds are depth 0)
    #[serde(default = "defaults::max_depth")]
    pub max_depth: u32,

    /// Page size for neighbor listings
    #[serde(default = "defaults::page_size")]
    pub page_size: u32,

    /// Actors per profile lookup
    #[serde(default = "defaults::profile_batch_size")]
    pub profile_batch_size: usize,

    /// Neighbors listed per direction before pagination stops
    #[serde(default = "defaults::max_neighbors_per_item")]
    pub max_neighbors_per_item: usize,

    /// Stop after this many processed items
    #[serde(default)]
    pub max_items: Option<u64>,

    /// Stop after this many seconds
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            api_base_url: defaults::api_base_url(),
            user_agent: defaults::user_agent(),
            access_token: None,
            timeout_secs: defaults::timeout(),
            workers: defaults::workers(),
            max_depth: defaults::max_depth(),
            page_size: defaults::page_size(),
            profile_batch_size: defaults::profile_batch_size(),
            max_neighbors_per_item: defaults::max_neighbors_per_item(),
            max_items: None,
            max_duration_secs: None,
        }
    }
}

/// Fixed-window throttle for outbound calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "defaults::max_requests")]
    pub max_requests: u32,

    #[serde(default = "defaults::window_ms")]
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: defaults::max_requests(),
            window_ms: defaults::window_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Generic retries after the first attempt
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    #[serde(default = "defaults::base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "defaults::max_delay_ms")]
    pub max_delay_ms: u64,

    /// Consecutive rate-limit responses tolerated before giving up
    #[serde(default = "defaults::max_rate_limit_hits")]
    pub max_rate_limit_hits: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: defaults::max_retries(),
            base_delay_ms: defaults::base_delay_ms(),
            max_delay_ms: defaults::max_delay_ms(),
            max_rate_limit_hits: defaults::max_rate_limit_hits(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker
    #[serde(default = "defaults::failure_threshold")]
    pub failure_threshold: u32,

    /// Time the breaker stays open before a probe is allowed
    #[serde(default = "defaults::recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: defaults::failure_threshold(),
            recovery_timeout_ms: defaults::recovery_timeout_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Crawl admission heuristics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Minimum score for a neighbor to enter the frontier
    #[serde(default = "defaults::quality_threshold")]
    pub threshold: f64,

    #[serde(default = "defaults::min_followers")]
    pub min_followers: i64,

    #[serde(default = "defaults::min_following")]
    pub min_following: i64,

    /// Lowest accepted followers:following ratio
    #[serde(default = "defaults::min_ratio")]
    pub min_ratio: f64,

    /// Highest accepted followers:following ratio
    #[serde(default = "defaults::max_ratio")]
    pub max_ratio: f64,

    /// Post count at which the activity component saturates
    #[serde(default = "defaults::posts_saturation")]
    pub posts_saturation: i64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            threshold: defaults::quality_threshold(),
            min_followers: defaults::min_followers(),
            min_following: defaults::min_following(),
            min_ratio: defaults::min_ratio(),
            max_ratio: defaults::max_ratio(),
            posts_saturation: defaults::posts_saturation(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "defaults::log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
        }
    }
}

mod defaults {
    use super::ConflictMode;
    use crate::models::Collection;

    // Stream defaults
    pub fn endpoint() -> String {
        "wss://jetstream2.us-east.bsky.network/subscribe".into()
    }
    pub fn collections() -> Vec<String> {
        Collection::ALL.iter().map(|c| c.nsid().to_string()).collect()
    }
    pub fn max_reconnect_attempts() -> u32 {
        10
    }
    pub fn reconnect_base_ms() -> u64 {
        1_000
    }
    pub fn reconnect_max_ms() -> u64 {
        60_000
    }

    // Batch defaults
    pub fn batch_size() -> usize {
        500
    }
    pub fn flush_interval_ms() -> u64 {
        5_000
    }
    pub fn overwrite() -> ConflictMode {
        ConflictMode::Overwrite
    }
    pub fn ignore() -> ConflictMode {
        ConflictMode::Ignore
    }

    // Storage defaults
    pub fn database_path() -> String {
        "data/collector.db".into()
    }
    pub fn checkpoint_path() -> String {
        "data/checkpoint.json".into()
    }
    pub fn crawl_checkpoint_path() -> String {
        "data/crawl-checkpoint.json".into()
    }
    pub fn stream_every() -> u64 {
        1_000
    }
    pub fn crawl_every() -> u64 {
        50
    }

    // Crawler defaults
    pub fn api_base_url() -> String {
        "https://public.api.bsky.app".into()
    }
    pub fn user_agent() -> String {
        "Mozilla/5.0 (compatible; collector/0.1)".into()
    }
    pub fn timeout() -> u64 {
        30
    }
    pub fn workers() -> usize {
        5
    }
    pub fn max_depth() -> u32 {
        2
    }
    pub fn page_size() -> u32 {
        100
    }
    pub fn profile_batch_size() -> usize {
        25
    }
    pub fn max_neighbors_per_item() -> usize {
        1_000
    }

    // Rate limit defaults
    pub fn max_requests() -> u32 {
        3_000
    }
    pub fn window_ms() -> u64 {
        300_000
    }

    // Retry defaults
    pub fn max_retries() -> u32 {
        3
    }
    pub fn base_delay_ms() -> u64 {
        500
    }
    pub fn max_delay_ms() -> u64 {
        30_000
    }
    pub fn max_rate_limit_hits() -> u32 {
        8
    }

    // Circuit breaker defaults
    pub fn failure_threshold() -> u32 {
        5
    }
    pub fn recovery_timeout_ms() -> u64 {
        30_000
    }

    // Quality defaults
    pub fn quality_threshold() -> f64 {
        0.6
    }
    pub fn min_followers() -> i64 {
        10
    }
    pub fn min_following() -> i64 {
        5
    }
    pub fn min_ratio() -> f64 {
        0.05
    }
    pub fn max_ratio() -> f64 {
        50.0
    }
    pub fn posts_saturation() -> i64 {
        100
    }

    pub fn log_level() -> String {
        "info".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_default_config_ok() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_http_stream_endpoint() {
        let mut config = Config::default();
        config.stream.endpoint = "https://example.com/subscribe".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_unknown_collection() {
        let mut config = Config::default();
        config.stream.collections.push("app.example.unknown".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let mut config = Config::default();
        config.crawler.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_ratio_bounds() {
        let mut config = Config::default();
        config.quality.min_ratio = 10.0;
        config.quality.max_ratio = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [batch]
            batch_size = 10

            [batch.conflict]
            edge = "ignore"

            [crawler]
            workers = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.batch.batch_size, 10);
        assert_eq!(config.batch.conflict.edge, ConflictMode::Ignore);
        assert_eq!(config.batch.conflict.interaction, ConflictMode::Ignore);
        assert_eq!(config.crawler.workers, 2);
        assert_eq!(config.crawler.max_depth, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn overrides_apply_and_reject_garbage() {
        let mut config = Config::default();
        config
            .apply_overrides(|name| match name {
                "COLLECTOR_BATCH_SIZE" => Some("42".into()),
                "COLLECTOR_DATABASE_PATH" => Some("/tmp/x.db".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.batch.batch_size, 42);
        assert_eq!(config.storage.database_path, "/tmp/x.db");

        let err = config
            .apply_overrides(|name| (name == "COLLECTOR_WORKERS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
