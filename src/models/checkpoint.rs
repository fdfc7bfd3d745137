// src/models/checkpoint.rs

//! Durable progress record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::frontier::FrontierSnapshot;

/// Resume position: a firehose cursor or a seed index, or an opaque token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cursor {
    Index(i64),
    Token(String),
}

impl Cursor {
    pub fn as_index(&self) -> Option<i64> {
        match self {
            Cursor::Index(i) => Some(*i),
            Cursor::Token(s) => s.parse().ok(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub cursor: Option<Cursor>,
    /// Counters keyed like `written.user`, restored on resume.
    #[serde(default)]
    pub counters: BTreeMap<String, u64>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontier: Option<FrontierSnapshot>,
}

impl Checkpoint {
    pub fn new(cursor: Option<Cursor>, counters: BTreeMap<String, u64>) -> Self {
        Self {
            cursor,
            counters,
            updated_at: Utc::now(),
            frontier: None,
        }
    }

    pub fn with_frontier(mut self, frontier: FrontierSnapshot) -> Self {
        self.frontier = Some(frontier);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_accepts_number_or_string() {
        let c: Checkpoint = serde_json::from_str(
            r#"{"cursor": 1700000000000000, "counters": {"written.user": 3}, "updated_at": "2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(c.cursor, Some(Cursor::Index(1_700_000_000_000_000)));
        assert_eq!(c.counters["written.user"], 3);

        let c: Checkpoint =
            serde_json::from_str(r#"{"cursor": "42", "updated_at": "2024-01-01T00:00:00Z"}"#)
                .unwrap();
        assert_eq!(c.cursor.and_then(|c| c.as_index()), Some(42));
        assert!(c.frontier.is_none());
    }
}
