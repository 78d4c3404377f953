use crate::backoff;
use crate::bridge::BridgeHooks;
use crate::client::HttpClient;
use crate::config::{self, Settings};
use crate::headers;
use crate::landing;
use crate::monitoring;
use crate::pool::BackendPool;
use crate::rate_limit::IpRateLimiter;
use crate::sessions::{extract_identity, IdentitySessionManager};
use crate::subscription::{match_route, SubscriptionProxy};
use crate::transport::{self, plain_response, ProxiedRequest, Transport};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, HOST, RETRY_AFTER};
use hyper::{Method, Request, Response, StatusCode};
use log::{debug, warn};
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Shared-instance registries are cleared once they grow past this, so hot
/// configuration changes cannot leak instances forever.
const MAX_REGISTRY_ENTRIES: usize = 32;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

static POOLS: Lazy<Mutex<HashMap<u64, Arc<BackendPool>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));
static LIMITERS: Lazy<Mutex<HashMap<u64, Arc<IpRateLimiter>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));
static SESSION_MANAGERS: Lazy<Mutex<HashMap<u64, Arc<IdentitySessionManager>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));
static SUBSCRIPTIONS: Lazy<Mutex<HashMap<u64, Arc<SubscriptionProxy>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn obtain<T>(
    registry: &Mutex<HashMap<u64, Arc<T>>>,
    key: u64,
    build: impl FnOnce() -> Arc<T>,
) -> Arc<T> {
    let mut map = registry.lock().expect("registry mutex");
    if map.len() > MAX_REGISTRY_ENTRIES {
        warn!(
            "Shared-instance registry grew past {} entries; clearing",
            MAX_REGISTRY_ENTRIES
        );
        map.clear();
    }
    map.entry(key).or_insert_with(build).clone()
}

/// The request router: admission control, transport dispatch and the
/// upstream failover driver. Pool, limiters and subscription proxy are
/// process-wide instances keyed by their configuration fingerprint.
pub struct Gateway {
    settings: Arc<Settings>,
    client: HttpClient,
    pool: Arc<BackendPool>,
    rate_limiter: Arc<IpRateLimiter>,
    sessions: Arc<IdentitySessionManager>,
    subscription: Option<Arc<SubscriptionProxy>>,
}

impl Gateway {
    pub fn new(settings: Settings, client: HttpClient) -> Arc<Self> {
        let settings = Arc::new(settings);

        let pool = obtain(&POOLS, config::fingerprint(&settings.backend), || {
            BackendPool::new(&settings.backend, client.clone())
        });
        let rate_limiter = obtain(&LIMITERS, config::fingerprint(&settings.rate_limit), || {
            Arc::new(IpRateLimiter::new(settings.rate_limit))
        });
        let sessions = obtain(
            &SESSION_MANAGERS,
            config::fingerprint(&settings.identity),
            || IdentitySessionManager::new(settings.identity),
        );
        let subscription = if settings.subscription.enabled {
            Some(obtain(
                &SUBSCRIPTIONS,
                config::fingerprint(&settings.subscription),
                || SubscriptionProxy::new(settings.subscription.clone(), client.clone()),
            ))
        } else {
            None
        };

        Arc::new(Self {
            settings,
            client,
            pool,
            rate_limiter,
            sessions,
            subscription,
        })
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    pub async fn handle(
        self: &Arc<Self>,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Response<Full<Bytes>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        if path == "/health" && method == Method::GET {
            return monitoring::health_response(
                &self.pool.snapshot(),
                self.settings.hide_backend_urls,
            );
        }

        if path == "/status" && method == Method::GET {
            return if self.settings.debug {
                monitoring::status_response(&self.settings, &self.subscription_target_names())
            } else {
                monitoring::not_found()
            };
        }

        if (path == "/" || path == "/index.html")
            && (method == Method::GET || method == Method::HEAD)
        {
            let head = method == Method::HEAD;
            return match &self.subscription {
                Some(sub) => landing::subscription_info_response(&sub.target_names(), head),
                None => landing::landing_response(head),
            };
        }

        if let Some(sub) = &self.subscription {
            if let Some(route) = match_route(&path) {
                let host = inbound_host(&req);
                return sub.handle(req, route, &host).await;
            }
        }

        self.proxy(req, remote_addr).await
    }

    fn subscription_target_names(&self) -> Vec<String> {
        self.subscription
            .as_ref()
            .map(|sub| sub.target_names())
            .unwrap_or_default()
    }

    /// The transport path: admission, preparation, failover, release.
    async fn proxy(
        self: &Arc<Self>,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Response<Full<Bytes>> {
        if let Some(reason) = &self.settings.backend.config_error {
            return plain_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Backend configuration error: {}", reason),
            );
        }

        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);
        let transport_kind = transport::resolve_transport(
            &path,
            query.as_deref(),
            req.headers(),
            self.settings.default_transport,
        );
        let path_and_query = transport::forwarded_path_and_query(&path, query.as_deref());

        let client_ip = {
            let from_headers = headers::resolve_client_ip(req.headers());
            if from_headers == "unknown" {
                remote_addr.ip().to_string()
            } else {
                from_headers
            }
        };

        if self.rate_limiter.is_enabled() && !self.rate_limiter.check_connection_allowed(&client_ip)
        {
            let retry_after = self.rate_limiter.retry_after_seconds(&client_ip);
            warn!("Rate limit hit for {}", client_ip);
            let mut response = plain_response(
                StatusCode::TOO_MANY_REQUESTS,
                "Rate limit exceeded. Please retry later.",
            );
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
            return response;
        }

        let identity = extract_identity(&path, query.as_deref());
        if self.sessions.is_enabled() {
            if let Some(identity) = &identity {
                if !self.sessions.check_connection_allowed(identity, &client_ip) {
                    warn!("Identity session cap hit for {}", identity);
                    let mut response = plain_response(
                        StatusCode::FORBIDDEN,
                        "Too many active sessions for this identity",
                    );
                    response.headers_mut().insert(
                        HeaderName::from_static(headers::CLOSE_CODE_HINT_HEADER),
                        HeaderValue::from_static("1008"),
                    );
                    return response;
                }
            }
        }

        let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        self.rate_limiter.register_connection(&client_ip, connection_id);

        let mut hooks = BridgeHooks::default();
        {
            let sessions = self.sessions.clone();
            let ready_identity = identity.clone();
            let ready_ip = client_ip.clone();
            hooks.on_ready = Some(Box::new(move |disconnect| {
                if let Some(identity) = ready_identity {
                    sessions.register_connection(&identity, &ready_ip, connection_id, disconnect);
                }
            }));

            let sessions = self.sessions.clone();
            let limiter = self.rate_limiter.clone();
            let close_identity = identity.clone();
            let close_ip = client_ip.clone();
            hooks.on_closed = Some(Box::new(move || {
                limiter.unregister_connection(&close_ip, connection_id);
                if let Some(identity) = close_identity {
                    sessions.unregister_connection(&identity, connection_id);
                }
            }));
        }

        let mut prepared = match ProxiedRequest::prepare(req).await {
            Ok(prepared) => prepared,
            Err(response) => {
                self.rate_limiter.unregister_connection(&client_ip, connection_id);
                return response;
            }
        };

        let response = self
            .drive(transport_kind, &mut prepared, &path_and_query, &mut hooks)
            .await;

        // A completed upgrade releases through the bridge close event; any
        // other status releases synchronously here.
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            self.rate_limiter.unregister_connection(&client_ip, connection_id);
        }

        response
    }

    /// Run up to `max_retries` attempts, each against a backend not yet
    /// tried this request. Untagged responses mark the backend healthy and
    /// return immediately; tagged ones mark it failed and back off.
    async fn drive(
        &self,
        transport_kind: Transport,
        prepared: &mut ProxiedRequest,
        path_and_query: &str,
        hooks: &mut BridgeHooks,
    ) -> Response<Full<Bytes>> {
        let max_retries = self.settings.backend.max_retries.max(1);
        let mut tried: HashSet<String> = HashSet::new();
        let mut last_response: Option<Response<Full<Bytes>>> = None;

        for attempt in 0..max_retries {
            let Some(origin) = self.pool.select(&tried) else {
                return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "No backend available");
            };
            tried.insert(origin.as_str().to_string());

            let mut response = transport::handle_proxy_request(
                transport_kind,
                prepared,
                path_and_query,
                &origin,
                &self.client,
                hooks,
            )
            .await;

            if !headers::is_backend_failure(&response) {
                self.pool.report_result(&origin, true);
                headers::strip_backend_failure(&mut response);
                return response;
            }

            self.pool.report_result(&origin, false);
            debug!(
                "Attempt {}/{} against {} failed with {}",
                attempt + 1,
                max_retries,
                origin,
                response.status()
            );
            last_response = Some(response);

            if attempt + 1 < max_retries {
                tokio::time::sleep(backoff::retry_delay(attempt)).await;
            }
        }

        match last_response {
            Some(mut response) => {
                headers::strip_backend_failure(&mut response);
                response
            }
            None => plain_response(StatusCode::BAD_GATEWAY, "No upstream attempt succeeded"),
        }
    }
}

fn inbound_host(req: &Request<Incoming>) -> String {
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_else(|| "localhost".to_string())
}
