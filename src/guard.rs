use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use crate::types::BotConfig;

// Visitor-facing limits, keyed by IP.
pub const VISITOR_MESSAGE_LIMIT: u32 = 10;
pub const VISITOR_MESSAGE_WINDOW_MS: u64 = 10_000;
pub const VISITOR_MESSAGE_COOLDOWN_MS: u64 = 700;
pub const VISITOR_CONNECT_LIMIT: u32 = 30;
pub const VISITOR_CONNECT_WINDOW_MS: u64 = 60_000;
pub const VISITOR_HELLO_LIMIT: u32 = 10;
pub const VISITOR_HELLO_WINDOW_MS: u64 = 60_000;
pub const TICKET_CREATE_LIMIT: u32 = 5;
pub const TICKET_CREATE_WINDOW_MS: u64 = 60_000;

// Agent limits, keyed by IP + agent id.
pub const AGENT_MESSAGE_LIMIT: u32 = 30;
pub const AGENT_MESSAGE_WINDOW_MS: u64 = 10_000;

pub const BOT_CONFIG_CACHE_TTL_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub ok: bool,
    pub retry_after_ms: u64,
}

impl RateDecision {
    fn allowed() -> Self {
        Self { ok: true, retry_after_ms: 0 }
    }

    fn rejected(retry_after_ms: u64) -> Self {
        Self { ok: false, retry_after_ms }
    }
}

/// Process-local abuse counters. Callers decide how to react to a
/// rejection (drop, error event, disconnect); the guard only counts.
pub trait RateLimiter: Send + Sync {
    /// Fixed-window counter: the first `limit` calls inside a window
    /// succeed, the rest are rejected until the window rolls over.
    fn allow(&self, key: &str, limit: u32, window_ms: u64) -> RateDecision;

    /// Minimum-interval gate, independent of `allow`: rejects a second
    /// success from the same key before `min_interval_ms` has elapsed.
    fn cooldown(&self, key: &str, min_interval_ms: u64) -> bool;
}

struct WindowEntry {
    window_start: Instant,
    count: u32,
}

#[derive(Default)]
pub struct MemoryRateLimiter {
    windows: Mutex<HashMap<String, WindowEntry>>,
    last_success: Mutex<HashMap<String, Instant>>,
}

impl MemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn allow_at(&self, key: &str, limit: u32, window_ms: u64, now: Instant) -> RateDecision {
        let window = Duration::from_millis(window_ms);
        let mut windows = self.windows.lock().expect("limiter lock poisoned");

        // Lazy eviction: stale keys are cleared whenever the map is touched.
        windows.retain(|_, entry| now.duration_since(entry.window_start) < window * 2);

        let entry = windows.entry(key.to_string()).or_insert(WindowEntry {
            window_start: now,
            count: 0,
        });
        if now.duration_since(entry.window_start) >= window {
            entry.window_start = now;
            entry.count = 0;
        }
        if entry.count >= limit {
            let elapsed = now.duration_since(entry.window_start);
            let remaining = window.saturating_sub(elapsed);
            return RateDecision::rejected(remaining.as_millis() as u64);
        }
        entry.count += 1;
        RateDecision::allowed()
    }

    fn cooldown_at(&self, key: &str, min_interval_ms: u64, now: Instant) -> bool {
        let min_interval = Duration::from_millis(min_interval_ms);
        let mut last = self.last_success.lock().expect("limiter lock poisoned");
        last.retain(|_, at| now.duration_since(*at) < min_interval * 4);

        if let Some(at) = last.get(key) {
            if now.duration_since(*at) < min_interval {
                return false;
            }
        }
        last.insert(key.to_string(), now);
        true
    }
}

impl RateLimiter for MemoryRateLimiter {
    fn allow(&self, key: &str, limit: u32, window_ms: u64) -> RateDecision {
        self.allow_at(key, limit, window_ms, Instant::now())
    }

    fn cooldown(&self, key: &str, min_interval_ms: u64) -> bool {
        self.cooldown_at(key, min_interval_ms, Instant::now())
    }
}

/// Short-TTL cache for the singleton bot configuration, invalidated
/// whenever the config is saved through the REST surface.
pub trait BotConfigCache: Send + Sync {
    fn get(&self) -> Option<BotConfig>;
    fn store(&self, config: BotConfig);
    fn invalidate(&self);
}

#[derive(Default)]
pub struct MemoryBotConfigCache {
    inner: Mutex<Option<(BotConfig, Instant)>>,
}

impl MemoryBotConfigCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BotConfigCache for MemoryBotConfigCache {
    fn get(&self) -> Option<BotConfig> {
        let guard = self.inner.lock().expect("config cache lock poisoned");
        let (config, stored_at) = guard.as_ref()?;
        if stored_at.elapsed() >= Duration::from_millis(BOT_CONFIG_CACHE_TTL_MS) {
            return None;
        }
        Some(config.clone())
    }

    fn store(&self, config: BotConfig) {
        let mut guard = self.inner.lock().expect("config cache lock poisoned");
        *guard = Some((config, Instant::now()));
    }

    fn invalidate(&self) {
        let mut guard = self.inner.lock().expect("config cache lock poisoned");
        *guard = None;
    }
}

pub fn agent_message_key(ip: &str, agent_id: &str) -> String {
    format!("{ip}|agent:{agent_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_limit_then_rejects() {
        let limiter = MemoryRateLimiter::new();
        let now = Instant::now();
        for _ in 0..5 {
            assert!(limiter.allow_at("1.2.3.4", 5, 10_000, now).ok);
        }
        let rejected = limiter.allow_at("1.2.3.4", 5, 10_000, now);
        assert!(!rejected.ok);
        assert!(rejected.retry_after_ms > 0 && rejected.retry_after_ms <= 10_000);
    }

    #[test]
    fn window_rollover_resets_count() {
        let limiter = MemoryRateLimiter::new();
        let start = Instant::now();
        for _ in 0..3 {
            assert!(limiter.allow_at("k", 3, 1_000, start).ok);
        }
        assert!(!limiter.allow_at("k", 3, 1_000, start).ok);
        let later = start + Duration::from_millis(1_001);
        assert!(limiter.allow_at("k", 3, 1_000, later).ok);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = MemoryRateLimiter::new();
        let now = Instant::now();
        assert!(limiter.allow_at("a", 1, 10_000, now).ok);
        assert!(!limiter.allow_at("a", 1, 10_000, now).ok);
        assert!(limiter.allow_at("b", 1, 10_000, now).ok);
    }

    #[test]
    fn cooldown_rejects_within_interval() {
        let limiter = MemoryRateLimiter::new();
        let start = Instant::now();
        assert!(limiter.cooldown_at("ip", 700, start));
        assert!(!limiter.cooldown_at("ip", 700, start + Duration::from_millis(300)));
        assert!(limiter.cooldown_at("ip", 700, start + Duration::from_millis(701)));
    }

    #[test]
    fn cooldown_failure_does_not_reset_clock() {
        let limiter = MemoryRateLimiter::new();
        let start = Instant::now();
        assert!(limiter.cooldown_at("ip", 1_000, start));
        assert!(!limiter.cooldown_at("ip", 1_000, start + Duration::from_millis(900)));
        // The rejected attempt must not push the next success further out.
        assert!(limiter.cooldown_at("ip", 1_000, start + Duration::from_millis(1_001)));
    }

    #[test]
    fn config_cache_respects_ttl_and_invalidate() {
        let cache = MemoryBotConfigCache::new();
        assert!(cache.get().is_none());
        cache.store(BotConfig::default());
        assert!(cache.get().is_some());
        cache.invalidate();
        assert!(cache.get().is_none());
    }
}
