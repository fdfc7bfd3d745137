//! Fixed-window request throttle.
//!
//! Each key gets a window of `window` length that starts on its first call.
//! Within the window at most `max_requests` calls are allowed; the window
//! resets on the first call after it expires. Expired entries are swept
//! lazily, at most once per window.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::models::RateLimitConfig;

/// Outcome of [`RateLimiter::is_allowed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    count: u32,
    reset_at: Instant,
}

#[derive(Debug)]
struct Windows {
    entries: HashMap<String, Entry>,
    last_sweep: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    windows: Mutex<Windows>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: Mutex::new(Windows {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_requests, Duration::from_millis(config.window_ms))
    }

    fn lock(&self) -> MutexGuard<'_, Windows> {
        self.windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a call for `key` and report whether it may proceed.
    pub fn is_allowed(&self, key: &str) -> RateLimitDecision {
        let now = Instant::now();
        let mut windows = self.lock();

        if now.duration_since(windows.last_sweep) >= self.window {
            windows.entries.retain(|_, e| e.reset_at > now);
            windows.last_sweep = now;
        }

        let window = self.window;
        let entry = windows
            .entries
            .entry(key.to_string())
            .and_modify(|e| {
                if now >= e.reset_at {
                    *e = Entry {
                        count: 1,
                        reset_at: now + window,
                    };
                } else if e.count <= self.max_requests {
                    e.count += 1;
                }
            })
            .or_insert(Entry {
                count: 1,
                reset_at: now + window,
            });

        let allowed = entry.count <= self.max_requests;
        RateLimitDecision {
            allowed,
            remaining: self.max_requests.saturating_sub(entry.count),
            reset_at: entry.reset_at,
        }
    }

    /// Wait until a call for `key` is allowed.
    ///
    /// Returns the total time spent waiting.
    pub async fn acquire(&self, key: &str) -> Duration {
        let started = Instant::now();
        loop {
            let decision = self.is_allowed(key);
            if decision.allowed {
                return started.elapsed();
            }
            log::debug!(
                "Rate limit reached for '{}', waiting {:?}",
                key,
                decision.reset_at.saturating_duration_since(Instant::now())
            );
            tokio::time::sleep_until(decision.reset_at).await;
        }
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.lock().entries.len()
    }
}
