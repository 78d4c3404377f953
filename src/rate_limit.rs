use crate::config::RateLimitSettings;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Fixed `Retry-After` when the concurrent gate is saturated.
const CONCURRENT_RETRY_AFTER_SECS: u64 = 10;
/// State for an idle, fully-refilled IP is dropped after this long.
const IDLE_EXPIRY: Duration = Duration::from_secs(60);
const GC_INTERVAL: Duration = Duration::from_secs(30);

struct IpState {
    /// Fractional tokens; capacity is the per-minute connection cap.
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
    active: HashSet<u64>,
}

impl IpState {
    fn new(capacity: f64) -> Self {
        let now = Instant::now();
        Self {
            tokens: capacity,
            last_refill: now,
            last_seen: now,
            active: HashSet::new(),
        }
    }

    fn refill(&mut self, capacity: f64, rate_per_sec: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * rate_per_sec).min(capacity);
            self.last_refill = now;
        }
    }
}

/// Per-IP admission: a concurrent-sessions gate and a token-bucket rate
/// gate, both of which must pass.
pub struct IpRateLimiter {
    settings: RateLimitSettings,
    state: Mutex<LimiterState>,
}

struct LimiterState {
    per_ip: HashMap<String, IpState>,
    last_gc: Instant,
}

impl IpRateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(LimiterState {
                per_ip: HashMap::new(),
                last_gc: Instant::now(),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    fn capacity(&self) -> f64 {
        f64::from(self.settings.max_conn_per_min.max(1))
    }

    fn rate_per_sec(&self) -> f64 {
        self.capacity() / 60.0
    }

    /// Idempotent admission check; consumes nothing.
    pub fn check_connection_allowed(&self, ip: &str) -> bool {
        if !self.settings.enabled {
            return true;
        }

        let capacity = self.capacity();
        let rate = self.rate_per_sec();
        let mut state = self.state.lock().expect("rate limiter mutex");
        let entry = state
            .per_ip
            .entry(ip.to_string())
            .or_insert_with(|| IpState::new(capacity));
        entry.refill(capacity, rate);

        if entry.active.len() >= self.settings.max_conn_per_ip as usize {
            debug!("IP {} at concurrent cap ({})", ip, entry.active.len());
            return false;
        }
        entry.tokens >= 1.0
    }

    /// Consume one token and track the connection id.
    pub fn register_connection(&self, ip: &str, connection_id: u64) {
        if !self.settings.enabled {
            return;
        }

        let capacity = self.capacity();
        let rate = self.rate_per_sec();
        let mut state = self.state.lock().expect("rate limiter mutex");
        let entry = state
            .per_ip
            .entry(ip.to_string())
            .or_insert_with(|| IpState::new(capacity));
        entry.refill(capacity, rate);
        // Floors at zero when a concurrent check left the bucket below 1.
        entry.tokens = (entry.tokens - 1.0).max(0.0);
        entry.last_seen = Instant::now();
        entry.active.insert(connection_id);

        Self::maybe_gc(&mut state, capacity);
    }

    /// Silent no-op for unknown `(ip, connection_id)` pairs.
    pub fn unregister_connection(&self, ip: &str, connection_id: u64) {
        if !self.settings.enabled {
            return;
        }

        let capacity = self.capacity();
        let mut state = self.state.lock().expect("rate limiter mutex");
        if let Some(entry) = state.per_ip.get_mut(ip) {
            entry.active.remove(&connection_id);
            entry.last_seen = Instant::now();
        }
        Self::maybe_gc(&mut state, capacity);
    }

    /// Seconds a rejected client should wait: a fixed value when the
    /// concurrent gate is saturated, otherwise the refill time for one
    /// token, floored at one second.
    pub fn retry_after_seconds(&self, ip: &str) -> u64 {
        let capacity = self.capacity();
        let rate = self.rate_per_sec();
        let mut state = self.state.lock().expect("rate limiter mutex");
        let Some(entry) = state.per_ip.get_mut(ip) else {
            return 1;
        };

        if entry.active.len() >= self.settings.max_conn_per_ip as usize {
            return CONCURRENT_RETRY_AFTER_SECS;
        }

        entry.refill(capacity, rate);
        if entry.tokens >= 1.0 {
            return 1;
        }
        ((1.0 - entry.tokens) / rate).ceil().max(1.0) as u64
    }

    /// Drop state for IPs that are idle, fully refilled, and stale.
    fn maybe_gc(state: &mut LimiterState, capacity: f64) {
        let now = Instant::now();
        if now.duration_since(state.last_gc) < GC_INTERVAL {
            return;
        }
        state.last_gc = now;
        state.per_ip.retain(|_, entry| {
            !(entry.active.is_empty()
                && entry.tokens >= capacity
                && now.duration_since(entry.last_seen) > IDLE_EXPIRY)
        });
    }

    #[cfg(test)]
    fn tracked_ips(&self) -> usize {
        self.state.lock().expect("rate limiter mutex").per_ip.len()
    }
}
