// src/models/stats.rs

//! Observable pipeline counters.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::entity::EntityKind;

/// Pipeline-wide counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    EventsProcessed,
    DecodeErrors,
    IgnoredMessages,
    FlushErrors,
    ReferentialRetries,
    CircuitRejections,
    Reconnects,
    RateLimitHits,
    ItemsCompleted,
    ItemsFailed,
    ItemsRejected,
}

impl Counter {
    const ALL: [Counter; 11] = [
        Counter::EventsProcessed,
        Counter::DecodeErrors,
        Counter::IgnoredMessages,
        Counter::FlushErrors,
        Counter::ReferentialRetries,
        Counter::CircuitRejections,
        Counter::Reconnects,
        Counter::RateLimitHits,
        Counter::ItemsCompleted,
        Counter::ItemsFailed,
        Counter::ItemsRejected,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Counter::EventsProcessed => "events_processed",
            Counter::DecodeErrors => "decode_errors",
            Counter::IgnoredMessages => "ignored_messages",
            Counter::FlushErrors => "flush_errors",
            Counter::ReferentialRetries => "referential_retries",
            Counter::CircuitRejections => "circuit_rejections",
            Counter::Reconnects => "reconnects",
            Counter::RateLimitHits => "rate_limit_hits",
            Counter::ItemsCompleted => "items_completed",
            Counter::ItemsFailed => "items_failed",
            Counter::ItemsRejected => "items_rejected",
        }
    }
}

/// Counters kept per entity variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindCounter {
    Enqueued,
    Written,
    Deleted,
    Dropped,
}

impl KindCounter {
    const ALL: [KindCounter; 4] = [
        KindCounter::Enqueued,
        KindCounter::Written,
        KindCounter::Deleted,
        KindCounter::Dropped,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            KindCounter::Enqueued => "enqueued",
            KindCounter::Written => "written",
            KindCounter::Deleted => "deleted",
            KindCounter::Dropped => "dropped",
        }
    }

    fn index(&self) -> usize {
        match self {
            KindCounter::Enqueued => 0,
            KindCounter::Written => 1,
            KindCounter::Deleted => 2,
            KindCounter::Dropped => 3,
        }
    }
}

/// Lock-free counters shared by the consumer, flusher and crawler.
#[derive(Debug, Default)]
pub struct PipelineStats {
    scalars: [AtomicU64; 11],
    per_kind: [[AtomicU64; 4]; 4],
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(counter: Counter) -> usize {
        Counter::ALL
            .iter()
            .position(|c| *c == counter)
            .unwrap_or_default()
    }

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        self.scalars[Self::slot(counter)].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.scalars[Self::slot(counter)].load(Ordering::Relaxed)
    }

    pub fn add_kind(&self, counter: KindCounter, kind: EntityKind, n: u64) {
        self.per_kind[counter.index()][kind.index()].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get_kind(&self, counter: KindCounter, kind: EntityKind) -> u64 {
        self.per_kind[counter.index()][kind.index()].load(Ordering::Relaxed)
    }

    /// Flat `name -> value` view, used for checkpoints and summaries.
    pub fn to_map(&self) -> BTreeMap<String, u64> {
        let mut map = BTreeMap::new();
        for counter in Counter::ALL {
            map.insert(counter.name().to_string(), self.get(counter));
        }
        for counter in KindCounter::ALL {
            for kind in EntityKind::FLUSH_ORDER {
                map.insert(
                    format!("{}.{}", counter.name(), kind),
                    self.get_kind(counter, kind),
                );
            }
        }
        map
    }

    /// Restore counters saved by [`PipelineStats::to_map`]. Unknown keys are
    /// ignored.
    pub fn restore(&self, map: &BTreeMap<String, u64>) {
        for counter in Counter::ALL {
            if let Some(v) = map.get(counter.name()) {
                self.scalars[Self::slot(counter)].store(*v, Ordering::Relaxed);
            }
        }
        for counter in KindCounter::ALL {
            for kind in EntityKind::FLUSH_ORDER {
                if let Some(v) = map.get(&format!("{}.{}", counter.name(), kind)) {
                    self.per_kind[counter.index()][kind.index()].store(*v, Ordering::Relaxed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_round_trip() {
        let stats = PipelineStats::new();
        stats.add_kind(KindCounter::Written, EntityKind::Edge, 4);
        stats.incr(Counter::DecodeErrors);

        let map = stats.to_map();
        assert_eq!(map["written.edge"], 4);
        assert_eq!(map["decode_errors"], 1);

        let restored = PipelineStats::new();
        restored.restore(&map);
        assert_eq!(restored.get_kind(KindCounter::Written, EntityKind::Edge), 4);
        assert_eq!(restored.get(Counter::DecodeErrors), 1);
    }
}
