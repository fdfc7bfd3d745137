// src/utils/log.rs

//! Run banners and summaries.
//!
//! Everything goes through the `log` facade so the binary's logger decides
//! formatting and filtering.

use std::collections::BTreeMap;

use ::log::LevelFilter;

/// Parse a configured level name. Unknown names fall back to `Info`.
pub fn parse_level(s: &str) -> LevelFilter {
    match s.trim().to_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" | "warning" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

/// Log a header
pub fn header(title: &str) {
    let border = "═".repeat(60);
    ::log::info!("{border}");
    ::log::info!("  {title}");
    ::log::info!("{border}");
}

/// Log a summary section
pub fn summary(title: &str, items: &[(&str, String)]) {
    ::log::info!("[SUMMARY] {title}");
    for (key, value) in items {
        ::log::info!("    {key}: {value}");
    }
}

/// Log the non-zero entries of a counter map.
pub fn counters(title: &str, counters: &BTreeMap<String, u64>) {
    let items: Vec<(&str, String)> = counters
        .iter()
        .filter(|(_, v)| **v > 0)
        .map(|(k, v)| (k.as_str(), v.to_string()))
        .collect();
    if items.is_empty() {
        ::log::info!("[SUMMARY] {title}: nothing recorded");
    } else {
        summary(title, &items);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), LevelFilter::Debug);
        assert_eq!(parse_level(" WARN "), LevelFilter::Warn);
        assert_eq!(parse_level("unknown"), LevelFilter::Info);
    }
}
