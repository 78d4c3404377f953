use crate::bridge::Disconnector;
use crate::config::IdentitySettings;
use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const REPLACED_CLOSE_CODE: u16 = 1008;
const REPLACED_REASON: &str = "Connection replaced by a newer session";
const STALE_CLOSE_CODE: u16 = 1001;
const STALE_REASON: &str = "Stale connection cleanup";

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const SESSION_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const BUCKET_IDLE_EXPIRY: Duration = Duration::from_secs(10 * 60);
const DEFAULT_BUCKET_CAP: usize = 10_000;

static IDENTITY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("identity regex")
});

/// Extract the configuration-recognized identity from a request: the first
/// path segment matching the canonical form (second segment when the first
/// is `sub`), else the `id` query parameter. Lower-cased.
pub fn extract_identity(path: &str, query: Option<&str>) -> Option<String> {
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    let first = segments.next();
    let candidate = match first {
        Some("sub") => segments.next(),
        other => other,
    };

    if let Some(candidate) = candidate {
        if IDENTITY_RE.is_match(candidate) {
            return Some(candidate.to_ascii_lowercase());
        }
    }

    if let Some(query) = query {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if key == "id" && IDENTITY_RE.is_match(&value) {
                return Some(value.to_ascii_lowercase());
            }
        }
    }

    None
}

struct TrackedSession {
    addr: String,
    created_at: Instant,
    disconnect: Option<Disconnector>,
}

struct Bucket {
    sessions: HashMap<u64, TrackedSession>,
    by_addr: HashMap<String, HashSet<u64>>,
    last_touched: Instant,
}

impl Bucket {
    fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            by_addr: HashMap::new(),
            last_touched: Instant::now(),
        }
    }

    fn remove_session(&mut self, connection_id: u64) -> Option<TrackedSession> {
        let session = self.sessions.remove(&connection_id)?;
        if let Some(ids) = self.by_addr.get_mut(&session.addr) {
            ids.remove(&connection_id);
            if ids.is_empty() {
                self.by_addr.remove(&session.addr);
            }
        }
        Some(session)
    }
}

/// Per-identity buckets of active sessions. A new session from an address
/// that already holds sessions under the same identity replaces them
/// rather than counting against the cap.
pub struct IdentitySessionManager {
    max_per_identity: usize,
    bucket_cap: usize,
    inner: Mutex<HashMap<String, Bucket>>,
}

impl IdentitySessionManager {
    pub fn new(settings: IdentitySettings) -> Arc<Self> {
        let manager = Arc::new(Self {
            max_per_identity: settings.max_connections as usize,
            bucket_cap: DEFAULT_BUCKET_CAP,
            inner: Mutex::new(HashMap::new()),
        });

        if manager.is_enabled() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let weak = Arc::downgrade(&manager);
                handle.spawn(async move {
                    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        match weak.upgrade() {
                            Some(manager) => manager.sweep(),
                            None => break,
                        }
                    }
                });
            }
        }

        manager
    }

    pub fn is_enabled(&self) -> bool {
        self.max_per_identity > 0
    }

    /// Admit when the bucket has room, or when the requesting address
    /// already holds a session under this identity (same-address reconnects
    /// always go through; registration will replace the older session).
    pub fn check_connection_allowed(&self, identity: &str, addr: &str) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let buckets = self.inner.lock().expect("session mutex");
        match buckets.get(identity) {
            Some(bucket) => {
                bucket.sessions.len() < self.max_per_identity || bucket.by_addr.contains_key(addr)
            }
            None => true,
        }
    }

    pub fn register_connection(
        &self,
        identity: &str,
        addr: &str,
        connection_id: u64,
        disconnect: Disconnector,
    ) {
        if !self.is_enabled() {
            return;
        }

        let mut replaced: Vec<Disconnector> = Vec::new();
        {
            let mut buckets = self.inner.lock().expect("session mutex");

            if !buckets.contains_key(identity) && buckets.len() >= self.bucket_cap {
                Self::evict_one(&mut buckets);
            }

            let bucket = buckets.entry(identity.to_string()).or_insert_with(Bucket::new);
            bucket.last_touched = Instant::now();

            let superseded: Vec<u64> = bucket
                .by_addr
                .get(addr)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default();
            for old_id in superseded {
                if let Some(mut session) = bucket.remove_session(old_id) {
                    if let Some(d) = session.disconnect.take() {
                        replaced.push(d);
                    }
                }
            }

            bucket.sessions.insert(
                connection_id,
                TrackedSession {
                    addr: addr.to_string(),
                    created_at: Instant::now(),
                    disconnect: Some(disconnect),
                },
            );
            bucket
                .by_addr
                .entry(addr.to_string())
                .or_default()
                .insert(connection_id);
        }

        for disconnector in replaced {
            debug!("Replacing superseded session for identity {}", identity);
            disconnector.close(REPLACED_CLOSE_CODE, REPLACED_REASON);
        }
    }

    /// Silent no-op for unknown identities or connection ids.
    pub fn unregister_connection(&self, identity: &str, connection_id: u64) {
        if !self.is_enabled() {
            return;
        }
        let mut buckets = self.inner.lock().expect("session mutex");
        if let Some(bucket) = buckets.get_mut(identity) {
            bucket.remove_session(connection_id);
            bucket.last_touched = Instant::now();
        }
    }

    /// Disconnect sessions older than seven days and drop buckets that have
    /// sat empty for ten minutes.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut stale: Vec<Disconnector> = Vec::new();

        {
            let mut buckets = self.inner.lock().expect("session mutex");

            for bucket in buckets.values_mut() {
                let expired: Vec<u64> = bucket
                    .sessions
                    .iter()
                    .filter(|(_, s)| now.duration_since(s.created_at) > SESSION_MAX_AGE)
                    .map(|(id, _)| *id)
                    .collect();
                for id in expired {
                    if let Some(mut session) = bucket.remove_session(id) {
                        if let Some(d) = session.disconnect.take() {
                            stale.push(d);
                        }
                    }
                }
            }

            let before = buckets.len();
            buckets.retain(|_, bucket| {
                !(bucket.sessions.is_empty()
                    && now.duration_since(bucket.last_touched) > BUCKET_IDLE_EXPIRY)
            });
            if buckets.len() < before {
                debug!("Evicted {} idle identity bucket(s)", before - buckets.len());
            }
        }

        if !stale.is_empty() {
            info!("Closing {} stale session(s)", stale.len());
            for disconnector in stale {
                disconnector.close(STALE_CLOSE_CODE, STALE_REASON);
            }
        }
    }

    /// Make room for a new bucket: oldest empty bucket first, otherwise the
    /// oldest-idle one outright.
    fn evict_one(buckets: &mut HashMap<String, Bucket>) {
        let victim = buckets
            .iter()
            .filter(|(_, b)| b.sessions.is_empty())
            .min_by_key(|(_, b)| b.last_touched)
            .or_else(|| buckets.iter().min_by_key(|(_, b)| b.last_touched))
            .map(|(key, _)| key.clone());
        if let Some(key) = victim {
            buckets.remove(&key);
        }
    }

    #[cfg(test)]
    fn with_bucket_cap(max_connections: u32, bucket_cap: usize) -> Self {
        Self {
            max_per_identity: max_connections as usize,
            bucket_cap,
            inner: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.inner.lock().expect("session mutex").len()
    }

    #[cfg(test)]
    fn session_count(&self, identity: &str) -> usize {
        self.inner
            .lock()
            .expect("session mutex")
            .get(identity)
            .map(|b| b.sessions.len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn backdate_session(&self, identity: &str, connection_id: u64, age: Duration) {
        let mut buckets = self.inner.lock().expect("session mutex");
        if let Some(session) = buckets
            .get_mut(identity)
            .and_then(|b| b.sessions.get_mut(&connection_id))
        {
            session.created_at = Instant::now() - age;
        }
    }

    #[cfg(test)]
    fn backdate_bucket(&self, identity: &str, age: Duration) {
        let mut buckets = self.inner.lock().expect("session mutex");
        if let Some(bucket) = buckets.get_mut(identity) {
            bucket.last_touched = Instant::now() - age;
        }
    }
}
