// src/models/mod.rs

//! Domain models for the collector.
//!
//! This module contains all data structures used throughout the application,
//! organized by their primary purpose.

mod checkpoint;
mod config;
mod entity;
mod event;
mod frontier;
mod profile;
mod stats;

// Re-export all public types
pub use checkpoint::{Checkpoint, Cursor};
pub use config::{
    BatchConfig, CheckpointConfig, CircuitBreakerConfig, Config, ConflictMode, ConflictModes,
    CrawlerConfig, LoggingConfig, QualityConfig, RateLimitConfig, RetryConfig, StorageConfig,
    StreamConfig,
};
pub use entity::{
    Content, Edge, Entity, EntityKind, Interaction, InteractionKind, NaturalKey, User,
    did_from_uri, record_uri,
};
pub use event::{
    Collection, DecodeFailure, Decoded, EventEnvelope, Operation, PendingWrite, Record, decode,
};
pub use frontier::{FrontierItem, FrontierSnapshot, FrontierState};
pub use profile::{ActorProfile, Direction, NeighborPage};
pub use stats::{Counter, KindCounter, PipelineStats};
