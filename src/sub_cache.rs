use bytes::Bytes;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const DEFAULT_MAX_ENTRIES: usize = 256;
const DEFAULT_MAX_BYTES: usize = 20 * 1024 * 1024;
const PURGE_INTERVAL: Duration = Duration::from_secs(30);

/// A cached subscription document. Only 200-status responses are admitted,
/// so the status is implicit.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl CachedResponse {
    fn size_estimate(&self, key: &str) -> usize {
        let header_bytes: usize = self.headers.iter().map(|(k, v)| k.len() + v.len()).sum();
        key.len() + header_bytes + self.body.len()
    }
}

struct Node {
    key: String,
    value: CachedResponse,
    expires_at: Instant,
    size: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Doubly-linked LRU over slab indices, keyed by an auxiliary map for O(1)
/// touch and evict. Head is most-recently-used.
struct CacheInner {
    map: HashMap<String, usize>,
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    total_bytes: usize,
}

impl CacheInner {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            total_bytes: 0,
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.nodes[idx].as_ref().expect("occupied node");
            (node.prev, node.next)
        };
        match prev {
            Some(p) => {
                if let Some(node) = self.nodes[p].as_mut() {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.nodes[n].as_mut() {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(node) = self.nodes[idx].as_mut() {
            node.prev = None;
            node.next = None;
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(node) = self.nodes[idx].as_mut() {
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(node) = self.nodes[h].as_mut() {
                node.prev = Some(idx);
            }
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn remove(&mut self, idx: usize) -> Option<Node> {
        self.unlink(idx);
        let node = self.nodes[idx].take()?;
        self.map.remove(&node.key);
        self.total_bytes -= node.size;
        self.free.push(idx);
        Some(node)
    }

    fn insert_node(&mut self, node: Node) {
        let key = node.key.clone();
        let size = node.size;
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.map.insert(key, idx);
        self.total_bytes += size;
        self.push_front(idx);
    }
}

/// TTL + size-bounded LRU for subscription responses.
pub struct SubscriptionCache {
    ttl: Duration,
    max_entries: usize,
    max_bytes: usize,
    inner: Mutex<CacheInner>,
}

impl SubscriptionCache {
    pub fn new(ttl_ms: u64) -> Arc<Self> {
        Self::with_limits(ttl_ms, DEFAULT_MAX_ENTRIES, DEFAULT_MAX_BYTES)
    }

    pub fn with_limits(ttl_ms: u64, max_entries: usize, max_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            ttl: Duration::from_millis(ttl_ms),
            max_entries: max_entries.max(1),
            max_bytes: max_bytes.max(1),
            inner: Mutex::new(CacheInner::new()),
        })
    }

    /// Spawn the periodic expiry purge. Lazy purges on access still apply.
    pub fn start_purge_task(self: &Arc<Self>) {
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PURGE_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(cache) => cache.purge_expired(),
                    None => break,
                }
            }
        });
    }

    /// Returns a clone and promotes the entry to most-recently-used.
    /// Expired entries are purged on the way.
    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        let mut inner = self.inner.lock().expect("cache mutex");
        let idx = *inner.map.get(key)?;

        let expired = inner.nodes[idx]
            .as_ref()
            .map(|n| Instant::now() >= n.expires_at)
            .unwrap_or(true);
        if expired {
            inner.remove(idx);
            return None;
        }

        inner.unlink(idx);
        inner.push_front(idx);
        inner.nodes[idx].as_ref().map(|n| n.value.clone())
    }

    /// Admit a 200 response. Entries larger than the byte cap bypass the
    /// cache entirely; otherwise the tail is evicted until both caps hold.
    pub fn set(&self, key: &str, value: CachedResponse) {
        let size = value.size_estimate(key);
        if size > self.max_bytes {
            debug!("Cache bypass for {}: {} bytes exceeds cap", key, size);
            return;
        }

        let mut inner = self.inner.lock().expect("cache mutex");

        if let Some(&existing) = inner.map.get(key) {
            inner.remove(existing);
        }

        inner.insert_node(Node {
            key: key.to_string(),
            value,
            expires_at: Instant::now() + self.ttl,
            size,
            prev: None,
            next: None,
        });

        while inner.total_bytes > self.max_bytes || inner.map.len() > self.max_entries {
            let Some(tail) = inner.tail else { break };
            inner.remove(tail);
        }
    }

    pub fn purge_expired(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("cache mutex");
        let expired: Vec<usize> = inner
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| {
                slot.as_ref()
                    .filter(|node| now >= node.expires_at)
                    .map(|_| idx)
            })
            .collect();
        for idx in expired {
            inner.remove(idx);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache mutex").map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.lock().expect("cache mutex").total_bytes
    }
}
