// src/models/frontier.rs

//! Frontier items for the backfill crawl.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrontierState {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// A discovered entity waiting to be (or being) crawled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontierItem {
    pub entity_id: String,
    pub depth: u32,
    /// Quality score at discovery; seeds get the maximum.
    pub priority: f64,
    pub state: FrontierState,
    #[serde(default)]
    pub attempts: u32,
}

impl FrontierItem {
    pub fn seed(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            depth: 0,
            priority: f64::MAX,
            state: FrontierState::Pending,
            attempts: 0,
        }
    }

    pub fn discovered(entity_id: impl Into<String>, depth: u32, priority: f64) -> Self {
        Self {
            entity_id: entity_id.into(),
            depth,
            priority,
            state: FrontierState::Pending,
            attempts: 0,
        }
    }
}

/// Serializable frontier state stored inside a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrontierSnapshot {
    /// Items still to be crawled, including ones in flight at save time.
    pub pending: Vec<FrontierItem>,
    /// Every entity already admitted, with its last known state.
    pub visited: Vec<(String, FrontierState)>,
}
