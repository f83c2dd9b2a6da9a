//! Sliding-window rate limiting per user and category.
//!
//! Three categories gate three surfaces: `Orders` for placements,
//! `Requests` for other client calls, `Messages` for inbound peer
//! traffic (keyed by peer id). Each `(user, category)` pair keeps a
//! window of weighted hits; a hit is allowed while the in-window weight
//! stays at or under the cap.

use fnv::FnvHashMap;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// What is being limited.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RateCategory {
    Orders,
    Requests,
    Messages,
}

impl RateCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateCategory::Orders => "orders",
            RateCategory::Requests => "requests",
            RateCategory::Messages => "messages",
        }
    }
}

/// Per-category caps.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub orders_per_minute: u32,
    pub requests_per_second: u32,
    pub messages_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            orders_per_minute: 100,
            requests_per_second: 10,
            messages_per_minute: 1_000,
        }
    }
}

#[derive(Debug)]
struct Window {
    hits: VecDeque<(Instant, u32)>,
    weight: u32,
}

impl Window {
    fn prune(&mut self, span: Duration) {
        let now = Instant::now();
        while let Some(&(at, weight)) = self.hits.front() {
            if now.duration_since(at) >= span {
                self.hits.pop_front();
                self.weight -= weight;
            } else {
                break;
            }
        }
    }
}

/// Sliding-window limiter. Disabled limiters allow everything.
#[derive(Debug)]
pub struct RateLimiter {
    enabled: bool,
    config: RateLimitConfig,
    windows: Mutex<FnvHashMap<(String, RateCategory), Window>>,
}

impl RateLimiter {
    pub fn new(enabled: bool, config: RateLimitConfig) -> Self {
        Self {
            enabled,
            config,
            windows: Mutex::new(FnvHashMap::default()),
        }
    }

    fn limits(&self, category: RateCategory) -> (u32, Duration) {
        match category {
            RateCategory::Orders => (self.config.orders_per_minute, Duration::from_secs(60)),
            RateCategory::Requests => (self.config.requests_per_second, Duration::from_secs(1)),
            RateCategory::Messages => (self.config.messages_per_minute, Duration::from_secs(60)),
        }
    }

    /// Whether `user` may perform a `category` action of the given weight.
    /// Allowed hits are recorded; rejected hits are not.
    pub fn allow(&self, user: &str, category: RateCategory, weight: u32) -> bool {
        if !self.enabled {
            return true;
        }
        let (cap, span) = self.limits(category);
        let mut windows = self.windows.lock();
        let window = windows
            .entry((user.to_string(), category))
            .or_insert_with(|| Window {
                hits: VecDeque::new(),
                weight: 0,
            });
        window.prune(span);
        if window.weight + weight > cap {
            return false;
        }
        window.hits.push_back((Instant::now(), weight));
        window.weight += weight;
        true
    }

    /// Drop windows that have gone fully idle.
    pub fn cleanup(&self) {
        let mut windows = self.windows.lock();
        windows.retain(|(_, category), window| {
            let span = match category {
                RateCategory::Requests => Duration::from_secs(1),
                RateCategory::Orders | RateCategory::Messages => Duration::from_secs(60),
            };
            window.prune(span);
            !window.hits.is_empty()
        });
    }
}
