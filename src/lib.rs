// src/lib.rs

//! Collector library
//!
//! Firehose ingestion and graph backfill for a decentralized social network,
//! persisted to SQLite with checkpointed resume.

pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod storage;
pub mod utils;
