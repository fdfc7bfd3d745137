//! Utility functions and helpers.

pub mod http;
pub mod log;

use chrono::Utc;

/// Current time as unix microseconds, the unit of firehose cursors.
pub fn unix_micros() -> i64 {
    Utc::now().timestamp_micros()
}

/// Chunk a list of ids into groups of at most `size` (minimum 1).
pub fn chunked(ids: &[String], size: usize) -> Vec<Vec<String>> {
    ids.chunks(size.max(1)).map(<[String]>::to_vec).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunked() {
        let ids: Vec<String> = (0..5).map(|i| i.to_string()).collect();
        let chunks = chunked(&ids, 2);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2], vec!["4".to_string()]);
        assert_eq!(chunked(&ids, 0).len(), 5);
    }

    #[test]
    fn test_unix_micros_is_after_2020() {
        assert!(unix_micros() > 1_577_836_800_000_000);
    }
}
