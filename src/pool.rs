use crate::client::{empty_body, HttpClient};
use crate::config::BackendSettings;
use http_body_util::BodyExt;
use hyper::{Method, Request};
use log::{debug, info, warn};
use rand::Rng;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use url::Url;

const PROBE_TIMEOUT: Duration = Duration::from_secs(4);

/// One failure report flips a healthy backend down.
const FAILURE_THRESHOLD: u32 = 1;
/// An unhealthy backend needs two consecutive successes to come back.
const RECOVERY_THRESHOLD: u32 = 2;

/// A managed upstream origin. Mutated only by the pool, under its lock.
pub struct Backend {
    pub url: Url,
    pub weight: u32,
    pub healthy: bool,
    pub failures_total: u64,
    pub last_probe: Option<Instant>,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

impl Backend {
    fn new(url: Url, weight: u32) -> Self {
        Self {
            url,
            weight: weight.max(1),
            healthy: true,
            failures_total: 0,
            last_probe: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }
}

/// Vose alias structure: one uniform index draw plus one uniform threshold
/// compare yields an O(1) weighted sample.
pub(crate) struct AliasTable {
    prob: Vec<f64>,
    alias: Vec<usize>,
    /// Backend index carried by each table slot, in construction order.
    slots: Vec<usize>,
}

impl AliasTable {
    /// Build over `(backend_index, weight)` pairs. Weights are clamped to ≥1.
    pub(crate) fn build(entries: &[(usize, u32)]) -> Option<Self> {
        if entries.is_empty() {
            return None;
        }

        let n = entries.len();
        let slots: Vec<usize> = entries.iter().map(|(idx, _)| *idx).collect();
        let weights: Vec<f64> = entries.iter().map(|(_, w)| f64::from((*w).max(1))).collect();
        let total: f64 = weights.iter().sum();

        let mut scaled: Vec<f64> = weights.iter().map(|w| w * n as f64 / total).collect();
        let mut prob = vec![0.0f64; n];
        let mut alias = vec![0usize; n];

        let mut small: Vec<usize> = Vec::with_capacity(n);
        let mut large: Vec<usize> = Vec::with_capacity(n);
        for (i, p) in scaled.iter().enumerate() {
            if *p < 1.0 {
                small.push(i);
            } else {
                large.push(i);
            }
        }

        while let (Some(s), Some(l)) = (small.pop(), large.pop()) {
            prob[s] = scaled[s];
            alias[s] = l;
            scaled[l] = (scaled[l] + scaled[s]) - 1.0;
            if scaled[l] < 1.0 {
                small.push(l);
            } else {
                large.push(l);
            }
        }
        for i in large {
            prob[i] = 1.0;
        }
        for i in small {
            prob[i] = 1.0;
        }

        Some(Self { prob, alias, slots })
    }

    pub(crate) fn sample<R: Rng>(&self, rng: &mut R) -> usize {
        let column = rng.gen_range(0..self.prob.len());
        if rng.gen::<f64>() < self.prob[column] {
            self.slots[column]
        } else {
            self.slots[self.alias[column]]
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn slots(&self) -> &[usize] {
        &self.slots
    }
}

struct PoolInner {
    backends: Vec<Backend>,
    healthy_table: Option<AliasTable>,
    full_table: Option<AliasTable>,
    /// Min-index heap over healthy backends, for sticky mode.
    sticky_heap: BinaryHeap<Reverse<usize>>,
    next_probe_at: Instant,
}

impl PoolInner {
    fn rebuild_healthy(&mut self) {
        let healthy: Vec<(usize, u32)> = self
            .backends
            .iter()
            .enumerate()
            .filter(|(_, b)| b.healthy)
            .map(|(i, b)| (i, b.weight))
            .collect();

        self.healthy_table = AliasTable::build(&healthy);
        self.sticky_heap = healthy.iter().map(|(i, _)| Reverse(*i)).collect();
    }
}

/// Weighted backend pool with hysteretic health and O(1) selection.
pub struct BackendPool {
    sticky: bool,
    probe_interval: Duration,
    client: HttpClient,
    probing: AtomicBool,
    inner: Mutex<PoolInner>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BackendStatus {
    pub url: String,
    pub healthy: bool,
    pub weight: u32,
    pub failures_total: u64,
}

#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub total: usize,
    pub healthy: usize,
    pub backends: Vec<BackendStatus>,
}

impl BackendPool {
    pub fn new(settings: &BackendSettings, client: HttpClient) -> Arc<Self> {
        let backends: Vec<Backend> = settings
            .entries
            .iter()
            .filter_map(|entry| match Url::parse(&entry.url) {
                Ok(url) => Some(Backend::new(url, entry.weight)),
                Err(e) => {
                    warn!("Dropping unparseable backend '{}': {}", entry.url, e);
                    None
                }
            })
            .collect();

        let full: Vec<(usize, u32)> = backends.iter().enumerate().map(|(i, b)| (i, b.weight)).collect();
        let probe_interval = Duration::from_millis(settings.health_check_interval_ms.max(1));

        let mut inner = PoolInner {
            backends,
            healthy_table: None,
            full_table: AliasTable::build(&full),
            sticky_heap: BinaryHeap::new(),
            next_probe_at: Instant::now() + probe_interval,
        };
        inner.rebuild_healthy();

        info!(
            "Backend pool ready: {} origin(s), probe interval {:?}, sticky={}",
            inner.backends.len(),
            probe_interval,
            settings.sticky
        );

        Arc::new(Self {
            sticky: settings.sticky,
            probe_interval,
            client,
            probing: AtomicBool::new(false),
            inner: Mutex::new(inner),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("pool mutex").backends.is_empty()
    }

    /// Pick a backend, avoiding `exclude` (canonical URL strings) when
    /// possible. Falls back to the full set when no backend is healthy, and
    /// to the first configured backend as a last resort.
    pub fn select(self: &Arc<Self>, exclude: &HashSet<String>) -> Option<Url> {
        self.maybe_schedule_probes();

        let inner = self.inner.lock().expect("pool mutex");
        if inner.backends.is_empty() {
            return None;
        }

        if self.sticky && inner.backends.len() > 1 {
            return Self::sticky_pick(&inner, exclude);
        }

        let mut rng = rand::thread_rng();

        if let Some(table) = &inner.healthy_table {
            if let Some(url) = Self::table_pick(table, &inner.backends, exclude, &mut rng) {
                return Some(url);
            }
        } else {
            warn!("No healthy backend available; selecting from the full set");
        }

        if let Some(table) = &inner.full_table {
            if let Some(url) = Self::table_pick(table, &inner.backends, exclude, &mut rng) {
                return Some(url);
            }
        }

        Some(inner.backends[0].url.clone())
    }

    /// Sample up to `max(4, 2n)` times, then scan the table in order.
    fn table_pick<R: Rng>(
        table: &AliasTable,
        backends: &[Backend],
        exclude: &HashSet<String>,
        rng: &mut R,
    ) -> Option<Url> {
        let attempts = std::cmp::max(4, 2 * table.len());
        for _ in 0..attempts {
            let idx = table.sample(rng);
            let url = &backends[idx].url;
            if !exclude.contains(url.as_str()) {
                return Some(url.clone());
            }
        }
        for &idx in table.slots() {
            let url = &backends[idx].url;
            if !exclude.contains(url.as_str()) {
                return Some(url.clone());
            }
        }
        None
    }

    /// Sticky mode: first healthy backend in configured order.
    fn sticky_pick(inner: &PoolInner, exclude: &HashSet<String>) -> Option<Url> {
        if let Some(Reverse(head)) = inner.sticky_heap.peek() {
            let url = &inner.backends[*head].url;
            if !exclude.contains(url.as_str()) {
                return Some(url.clone());
            }
        }
        for backend in inner.backends.iter().filter(|b| b.healthy) {
            if !exclude.contains(backend.url.as_str()) {
                return Some(backend.url.clone());
            }
        }
        for backend in &inner.backends {
            if !exclude.contains(backend.url.as_str()) {
                return Some(backend.url.clone());
            }
        }
        Some(inner.backends[0].url.clone())
    }

    /// Request-level outcome report for the backend identified by `url`.
    pub fn report_result(&self, url: &Url, success: bool) {
        let mut inner = self.inner.lock().expect("pool mutex");
        let Some(idx) = inner.backends.iter().position(|b| b.url == *url) else {
            return;
        };
        if success {
            Self::apply_success(&mut inner, idx);
        } else {
            Self::apply_failure(&mut inner, idx);
        }
    }

    fn apply_success(inner: &mut PoolInner, idx: usize) {
        let backend = &mut inner.backends[idx];
        backend.consecutive_failures = 0;
        if backend.healthy {
            backend.consecutive_successes = 0;
            return;
        }
        backend.consecutive_successes += 1;
        if backend.consecutive_successes >= RECOVERY_THRESHOLD {
            backend.healthy = true;
            backend.consecutive_successes = 0;
            info!("Backend {} recovered", backend.url);
            inner.rebuild_healthy();
        }
    }

    fn apply_failure(inner: &mut PoolInner, idx: usize) {
        let backend = &mut inner.backends[idx];
        backend.failures_total += 1;
        backend.consecutive_successes = 0;
        backend.consecutive_failures += 1;
        if backend.healthy && backend.consecutive_failures >= FAILURE_THRESHOLD {
            backend.healthy = false;
            warn!("Backend {} marked unhealthy", backend.url);
            inner.rebuild_healthy();
        }
    }

    /// Dispatch a probe cycle when the interval has elapsed. The next-check
    /// timestamp is advanced before dispatch so a concurrent caller cannot
    /// double-schedule; at most one cycle is in flight.
    fn maybe_schedule_probes(self: &Arc<Self>) {
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }

        let now = Instant::now();
        {
            let mut inner = self.inner.lock().expect("pool mutex");
            if now < inner.next_probe_at || inner.backends.is_empty() {
                return;
            }
            inner.next_probe_at = now + self.probe_interval;
        }

        if self.probing.swap(true, Ordering::SeqCst) {
            return;
        }

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.run_probe_cycle().await;
            pool.probing.store(false, Ordering::SeqCst);
        });
    }

    async fn run_probe_cycle(&self) {
        let targets: Vec<(usize, Url)> = {
            let inner = self.inner.lock().expect("pool mutex");
            inner
                .backends
                .iter()
                .enumerate()
                .map(|(i, b)| (i, b.url.clone()))
                .collect()
        };

        let mut handles = Vec::with_capacity(targets.len());
        for (idx, url) in targets {
            let client = self.client.clone();
            handles.push((idx, tokio::spawn(probe_backend(client, url))));
        }

        for (idx, handle) in handles {
            let ok = handle.await.unwrap_or(false);
            self.record_probe(idx, ok);
        }
    }

    fn record_probe(&self, idx: usize, success: bool) {
        let mut inner = self.inner.lock().expect("pool mutex");
        if idx >= inner.backends.len() {
            return;
        }
        inner.backends[idx].last_probe = Some(Instant::now());
        debug!(
            "Probe of {} {}",
            inner.backends[idx].url,
            if success { "succeeded" } else { "failed" }
        );
        if success {
            Self::apply_success(&mut inner, idx);
        } else {
            Self::apply_failure(&mut inner, idx);
        }
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let inner = self.inner.lock().expect("pool mutex");
        let backends: Vec<BackendStatus> = inner
            .backends
            .iter()
            .map(|b| BackendStatus {
                url: b.url.to_string(),
                healthy: b.healthy,
                weight: b.weight,
                failures_total: b.failures_total,
            })
            .collect();
        let healthy = backends.iter().filter(|b| b.healthy).count();
        PoolSnapshot {
            total: backends.len(),
            healthy,
            backends,
        }
    }
}

/// `GET /health` on the backend origin; any status below 500 counts as
/// success. The body, if any, is drained and discarded.
async fn probe_backend(client: HttpClient, origin: Url) -> bool {
    let mut health_url = origin;
    health_url.set_path("/health");
    health_url.set_query(None);
    health_url.set_fragment(None);

    let request = match Request::builder()
        .method(Method::GET)
        .uri(health_url.as_str())
        .body(empty_body())
    {
        Ok(req) => req,
        Err(_) => return false,
    };

    match timeout(PROBE_TIMEOUT, client.request(request)).await {
        Ok(Ok(response)) => {
            let status = response.status();
            let _ = response.into_body().collect().await;
            status.as_u16() < 500
        }
        Ok(Err(e)) => {
            debug!("Probe transport failure: {}", e);
            false
        }
        Err(_) => false,
    }
}
