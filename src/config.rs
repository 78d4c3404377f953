use crate::transport::Transport;
use log::warn;
use serde::Serialize;
use std::collections::HashSet;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use url::Url;

fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().expect("default listen socket")
}

fn default_backend_url() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_conn_per_ip() -> u32 {
    10
}

fn default_max_conn_per_min() -> u32 {
    60
}

fn default_cache_ttl_ms() -> u64 {
    300_000
}

/// A single configured backend origin with its selection weight.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendEntry {
    pub url: String,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendSettings {
    pub entries: Vec<BackendEntry>,
    pub health_check_interval_ms: u64,
    pub sticky: bool,
    pub max_retries: u32,
    /// Set when a backend URL was supplied but none of the entries parsed.
    /// Proxied requests surface this as a 500 instead of silently using a
    /// default origin the operator never configured.
    pub config_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub max_conn_per_ip: u32,
    pub max_conn_per_min: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct IdentitySettings {
    /// 0 disables identity-session limiting.
    pub max_connections: u32,
}

/// A named upstream that serves per-token subscription documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionTarget {
    pub name: String,
    /// Scheme + host only; the explicit port lives alongside.
    pub origin: Url,
    pub port: u16,
    /// Normalized to start with `/`; empty base becomes `/`.
    pub base_path: String,
}

impl SubscriptionTarget {
    /// `scheme://host:port`, the origin string rewritten URLs are pinned to.
    pub fn origin_with_port(&self) -> String {
        format!(
            "{}://{}:{}",
            self.origin.scheme(),
            self.origin.host_str().unwrap_or_default(),
            self.port
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionSettings {
    pub enabled: bool,
    pub preserve_domain: bool,
    pub transform: bool,
    pub cache_ttl_ms: u64,
    pub targets: Vec<SubscriptionTarget>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub listen_addr: SocketAddr,
    pub backend: BackendSettings,
    pub rate_limit: RateLimitSettings,
    pub identity: IdentitySettings,
    pub subscription: SubscriptionSettings,
    pub default_transport: Transport,
    pub debug: bool,
    pub hide_backend_urls: bool,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::resolve(|key| std::env::var(key).ok())
    }

    /// Resolve settings from an arbitrary variable source. Missing or
    /// malformed values fall back to documented defaults without aborting.
    pub fn resolve(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let backend = resolve_backend(&lookup);
        let rate_limit = RateLimitSettings {
            enabled: lookup_bool(&lookup, "RATE_LIMIT_ENABLED", false),
            max_conn_per_ip: lookup_parsed(&lookup, "RATE_LIMIT_MAX_CONN_PER_IP", default_max_conn_per_ip()),
            max_conn_per_min: lookup_parsed(&lookup, "RATE_LIMIT_MAX_CONN_PER_MIN", default_max_conn_per_min()),
        };
        let identity = IdentitySettings {
            max_connections: lookup_parsed(&lookup, "UUID_MAX_CONNECTIONS", 0),
        };
        let subscription = SubscriptionSettings {
            enabled: lookup_bool(&lookup, "SUBSCRIPTION_ENABLED", false),
            preserve_domain: lookup_bool(&lookup, "SUBSCRIPTION_PRESERVE_DOMAIN", false),
            transform: lookup_bool(&lookup, "SUBSCRIPTION_TRANSFORM", false),
            cache_ttl_ms: lookup_parsed(&lookup, "SUBSCRIPTION_CACHE_TTL_MS", default_cache_ttl_ms()),
            targets: lookup("SUBSCRIPTION_TARGETS")
                .map(|raw| parse_subscription_targets(&raw))
                .unwrap_or_default(),
        };

        let default_transport = match lookup("TRANSPORT") {
            Some(raw) => Transport::from_token(raw.trim()).unwrap_or_else(|| {
                warn!("Unknown TRANSPORT value '{}', falling back to xhttp", raw);
                Transport::Xhttp
            }),
            None => Transport::Xhttp,
        };

        Self {
            listen_addr: default_listen_addr(),
            backend,
            rate_limit,
            identity,
            subscription,
            default_transport,
            debug: lookup_bool(&lookup, "DEBUG", false),
            hide_backend_urls: lookup_bool(&lookup, "HIDE_BACKEND_URLS", true),
        }
    }
}

fn resolve_backend(lookup: &impl Fn(&str) -> Option<String>) -> BackendSettings {
    let mut entries = Vec::new();
    let mut config_error = None;
    let mut saw_backend_var = false;

    if let Some(raw) = lookup("BACKEND_LIST") {
        saw_backend_var = true;
        entries = parse_backend_list(&raw);
    } else if let Some(raw) = lookup("BACKEND_URL") {
        saw_backend_var = true;
        entries = parse_backend_list(&raw);
    }

    if entries.is_empty() {
        if saw_backend_var {
            config_error = Some("no syntactically valid backend URL configured".to_string());
            warn!("Configured backend URLs are all invalid; proxied requests will fail with 500");
        }
        entries.push(BackendEntry {
            url: default_backend_url(),
            weight: 1,
        });
    }

    BackendSettings {
        entries,
        health_check_interval_ms: lookup_parsed(lookup, "BACKEND_HEALTH_CHECK_INTERVAL", default_health_check_interval_ms()),
        sticky: lookup_bool(lookup, "BACKEND_STICKY_SESSION", false),
        max_retries: lookup_parsed(lookup, "MAX_RETRIES", default_max_retries()).max(1),
        config_error,
    }
}

/// Parse a comma-list of `url` or `url|weight` entries, skipping invalid ones.
pub fn parse_backend_list(raw: &str) -> Vec<BackendEntry> {
    let mut entries: Vec<BackendEntry> = Vec::new();

    for item in raw.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }

        let (url_part, weight) = match item.split_once('|') {
            Some((url, w)) => {
                let weight = w.trim().parse::<u32>().unwrap_or_else(|_| {
                    warn!("Invalid backend weight '{}' for {}, using 1", w, url);
                    1
                });
                (url.trim(), weight.max(1))
            }
            None => (item, 1),
        };

        let parsed = match Url::parse(url_part) {
            Ok(url) if url.host_str().is_some() => url,
            _ => {
                warn!("Skipping invalid backend URL '{}'", url_part);
                continue;
            }
        };

        // Duplicate origins collapse, summing their weights.
        let canonical = parsed.to_string();
        if let Some(existing) = entries.iter_mut().find(|e| e.url == canonical) {
            existing.weight = existing.weight.saturating_add(weight);
        } else {
            entries.push(BackendEntry {
                url: canonical,
                weight,
            });
        }
    }

    entries
}

/// Parse `SUBSCRIPTION_TARGETS`: a JSON array of `{name, url, port, path}`
/// objects, or a comma-list of `name|url|port|path` entries.
pub fn parse_subscription_targets(raw: &str) -> Vec<SubscriptionTarget> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }

    let mut targets = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    if raw.starts_with('[') {
        #[derive(serde::Deserialize)]
        struct RawTarget {
            name: String,
            url: String,
            port: Option<u16>,
            #[serde(default)]
            path: Option<String>,
        }

        let parsed: Vec<RawTarget> = match serde_json::from_str(raw) {
            Ok(list) => list,
            Err(e) => {
                warn!("SUBSCRIPTION_TARGETS is not valid JSON: {}", e);
                return Vec::new();
            }
        };

        for t in parsed {
            if let Some(target) = build_target(&t.name, &t.url, t.port, t.path.as_deref()) {
                if seen.insert(target.name.clone()) {
                    targets.push(target);
                }
            }
        }
    } else {
        for item in raw.split(',') {
            let parts: Vec<&str> = item.trim().split('|').collect();
            if parts.len() < 2 {
                warn!("Skipping malformed subscription target '{}'", item);
                continue;
            }
            let port = parts.get(2).and_then(|p| p.trim().parse::<u16>().ok());
            let path = parts.get(3).copied();
            if let Some(target) = build_target(parts[0], parts[1], port, path) {
                if seen.insert(target.name.clone()) {
                    targets.push(target);
                }
            }
        }
    }

    targets
}

fn build_target(name: &str, url: &str, port: Option<u16>, path: Option<&str>) -> Option<SubscriptionTarget> {
    let name = name.trim().to_ascii_lowercase();
    if name.is_empty() {
        warn!("Skipping subscription target with empty name");
        return None;
    }

    let parsed = match Url::parse(url.trim()) {
        Ok(u) => u,
        Err(e) => {
            warn!("Skipping subscription target '{}': bad URL: {}", name, e);
            return None;
        }
    };

    if !matches!(parsed.scheme(), "http" | "https") {
        warn!("Skipping subscription target '{}': scheme must be http or https", name);
        return None;
    }
    parsed.host_str()?;

    let port = match port.or_else(|| parsed.port_or_known_default()) {
        Some(p) if p > 0 => p,
        _ => {
            warn!("Skipping subscription target '{}': no usable port", name);
            return None;
        }
    };

    let base_path = match path.map(str::trim).filter(|p| !p.is_empty()) {
        Some(p) if p.starts_with('/') => p.trim_end_matches('/').to_string(),
        Some(p) => format!("/{}", p.trim_end_matches('/')),
        None => {
            let p = parsed.path().trim_end_matches('/');
            if p.is_empty() { String::new() } else { p.to_string() }
        }
    };

    let mut origin = parsed.clone();
    origin.set_path("");
    origin.set_query(None);
    origin.set_fragment(None);

    Some(SubscriptionTarget {
        name,
        origin,
        port,
        base_path: if base_path.is_empty() { "/".to_string() } else { base_path },
    })
}

fn lookup_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match lookup(key) {
        Some(raw) => matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

fn lookup_parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Invalid value '{}' for {}, using default", raw, key);
            default
        }),
        None => default,
    }
}

/// Stable fingerprint used to key process-wide shared instances, so a
/// configuration change produces fresh instances.
pub fn fingerprint<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}
