use crate::client::{empty_body, HttpClient};
use crate::config::{SubscriptionSettings, SubscriptionTarget};
use crate::error::ProxyError;
use crate::headers;
use crate::rewrite;
use crate::sub_cache::{CachedResponse, SubscriptionCache};
use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, HOST, LOCATION};
use hyper::{Method, Request, Response, StatusCode};
use log::{debug, warn};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use url::Url;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;
const MAX_REDIRECTS: usize = 5;
const INITIAL_BUFFER: usize = 16 * 1024;

/// Token segments are re-encoded for the upstream path; a slash inside a
/// decoded segment must not become a separator.
const SEGMENT_ENCODE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'#')
    .add(b'?')
    .add(b'{')
    .add(b'}')
    .add(b'%')
    .add(b'/');

/// A matched subscription route. The token may span several path segments.
#[derive(Debug, Clone, PartialEq)]
pub struct SubRoute {
    pub service: Option<String>,
    pub token_segments: Vec<String>,
}

/// `/sub/<token...>` or `/<service>/sub/<token...>`.
pub fn match_route(path: &str) -> Option<SubRoute> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    if segments.first() == Some(&"sub") && segments.len() >= 2 {
        return Some(SubRoute {
            service: None,
            token_segments: segments[1..].iter().map(|s| s.to_string()).collect(),
        });
    }

    if segments.len() >= 3 && segments[1] == "sub" {
        return Some(SubRoute {
            service: Some(decode_segment(segments[0]).to_ascii_lowercase()),
            token_segments: segments[2..].iter().map(|s| s.to_string()).collect(),
        });
    }

    None
}

fn decode_segment(segment: &str) -> String {
    percent_decode_str(segment)
        .decode_utf8()
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

pub struct SubscriptionProxy {
    settings: SubscriptionSettings,
    cache: Arc<SubscriptionCache>,
    client: HttpClient,
}

impl SubscriptionProxy {
    pub fn new(settings: SubscriptionSettings, client: HttpClient) -> Arc<Self> {
        let cache = SubscriptionCache::new(settings.cache_ttl_ms);
        cache.start_purge_task();
        Arc::new(Self {
            settings,
            cache,
            client,
        })
    }

    pub fn target_names(&self) -> Vec<String> {
        self.settings.targets.iter().map(|t| t.name.clone()).collect()
    }

    /// Named target, case-insensitive; unknown or absent names fall back to
    /// the first configured target.
    pub fn resolve_target(&self, service: Option<&str>) -> Option<&SubscriptionTarget> {
        if let Some(name) = service {
            let name = name.to_ascii_lowercase();
            if let Some(target) = self.settings.targets.iter().find(|t| t.name == name) {
                return Some(target);
            }
        }
        self.settings.targets.first()
    }

    pub async fn handle(
        &self,
        req: Request<Incoming>,
        route: SubRoute,
        inbound_host: &str,
    ) -> Response<Full<Bytes>> {
        if req.method() != Method::GET {
            return plain(StatusCode::METHOD_NOT_ALLOWED, "Only GET is supported here");
        }

        let Some(target) = self.resolve_target(route.service.as_deref()) else {
            return plain(StatusCode::BAD_GATEWAY, "No subscription target configured");
        };

        let decoded_token: String = route
            .token_segments
            .iter()
            .map(|s| decode_segment(s))
            .collect::<Vec<_>>()
            .join("/");
        let cache_key = format!("{}:{}", target.name, decoded_token);

        if let Some(hit) = self.cache.get(&cache_key) {
            debug!("Subscription cache hit for {}", cache_key);
            return self.cached_to_response(hit, inbound_host);
        }

        let upstream_url = build_upstream_url(target, &route.token_segments, req.uri().query());

        let mut forwarded = req.headers().clone();
        forwarded.remove(HOST);
        headers::scrub_selector_headers(&mut forwarded);
        headers::strip_hop_by_hop(&mut forwarded, false);

        let fetched = timeout(
            FETCH_TIMEOUT,
            self.fetch_with_redirects(upstream_url, forwarded),
        )
        .await;

        let (status, mut upstream_headers, mut body) = match fetched {
            Err(_) => {
                warn!("Subscription fetch for {} timed out", cache_key);
                return plain(StatusCode::BAD_GATEWAY, "Subscription upstream timed out");
            }
            Ok(Err(ProxyError::SizeLimit(n))) => {
                warn!("Subscription response for {} hit the size limit ({} bytes)", cache_key, n);
                return plain(
                    StatusCode::BAD_GATEWAY,
                    "Subscription response size limit exceeded",
                );
            }
            Ok(Err(e)) => {
                warn!("Subscription fetch for {} failed: {}", cache_key, e);
                return plain(StatusCode::BAD_GATEWAY, "Unable to reach subscription upstream");
            }
            Ok(Ok(parts)) => parts,
        };

        headers::strip_hop_by_hop(&mut upstream_headers, false);
        upstream_headers.remove(headers::BACKEND_FAILURE_HEADER);
        upstream_headers.remove(CONTENT_LENGTH);

        let content_type = upstream_headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        if status == StatusCode::OK {
            if self.settings.preserve_domain {
                if let Some(rewritten) =
                    rewrite::preserve_domains(&body, content_type.as_deref(), target, &decoded_token)
                {
                    body = rewritten;
                }
            }

            self.cache.set(
                &cache_key,
                CachedResponse {
                    headers: header_pairs(&upstream_headers),
                    body: body.clone(),
                },
            );

            if self.settings.transform && is_transformable(content_type.as_deref()) {
                body = transform_body(body, inbound_host);
            }
        }

        let mut response = Response::builder().status(status);
        if let Some(headers) = response.headers_mut() {
            *headers = upstream_headers;
        }
        response
            .body(Full::new(body))
            .unwrap_or_else(|_| plain(StatusCode::BAD_GATEWAY, "Malformed upstream response"))
    }

    fn cached_to_response(&self, cached: CachedResponse, inbound_host: &str) -> Response<Full<Bytes>> {
        let mut headers = HeaderMap::new();
        for (name, value) in &cached.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }

        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let body = if self.settings.transform && is_transformable(content_type.as_deref()) {
            transform_body(cached.body, inbound_host)
        } else {
            cached.body
        };

        let mut response = Response::builder().status(StatusCode::OK);
        if let Some(slot) = response.headers_mut() {
            *slot = headers;
        }
        response
            .body(Full::new(body))
            .unwrap_or_else(|_| plain(StatusCode::BAD_GATEWAY, "Malformed cached response"))
    }

    /// Follow up to five redirects, then read the body under the strict
    /// byte cap.
    async fn fetch_with_redirects(
        &self,
        mut url: String,
        forwarded: HeaderMap,
    ) -> Result<(StatusCode, HeaderMap, Bytes), ProxyError> {
        for _ in 0..=MAX_REDIRECTS {
            let request = {
                let mut builder = Request::builder().method(Method::GET).uri(url.as_str());
                if let Some(slot) = builder.headers_mut() {
                    *slot = forwarded.clone();
                }
                builder
                    .body(empty_body())
                    .map_err(|e| ProxyError::Uri(e.to_string()))?
            };

            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| ProxyError::Upstream(e.to_string()))?;

            if response.status().is_redirection() {
                if let Some(location) = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                {
                    let base = Url::parse(&url)?;
                    let next = base.join(location)?;
                    debug!("Subscription redirect -> {}", next);
                    url = next.to_string();
                    continue;
                }
            }

            let status = response.status();
            let headers = response.headers().clone();
            let body = read_bounded_body(response).await?;
            return Ok((status, headers, body));
        }

        Err(ProxyError::Upstream("too many redirects".to_string()))
    }
}

/// `<origin>:<port><base-path>/<encoded-token>?<original-query>`.
fn build_upstream_url(
    target: &SubscriptionTarget,
    token_segments: &[String],
    query: Option<&str>,
) -> String {
    let encoded: Vec<String> = token_segments
        .iter()
        .map(|s| utf8_percent_encode(&decode_segment(s), SEGMENT_ENCODE).to_string())
        .collect();

    let base = if target.base_path == "/" {
        String::new()
    } else {
        target.base_path.clone()
    };

    let mut url = format!("{}{}/{}", target.origin_with_port(), base, encoded.join("/"));
    if let Some(q) = query {
        url.push('?');
        url.push_str(q);
    }
    url
}

/// Accumulate the body into a doubling contiguous buffer seeded from
/// `Content-Length` when known and within the cap. One byte over the cap
/// fails; exactly the cap succeeds.
async fn read_bounded_body(response: Response<Incoming>) -> Result<Bytes, ProxyError> {
    let content_length = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&n| n <= MAX_RESPONSE_BYTES);

    let mut buf = BytesMut::with_capacity(content_length.unwrap_or(INITIAL_BUFFER));
    let mut body = response.into_body();

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| ProxyError::Upstream(e.to_string()))?;
        if let Some(data) = frame.data_ref() {
            let needed = buf.len() + data.len();
            if needed > MAX_RESPONSE_BYTES {
                return Err(ProxyError::SizeLimit(needed));
            }
            if needed > buf.capacity() {
                let mut grown = buf.capacity().max(INITIAL_BUFFER);
                while grown < needed {
                    grown *= 2;
                }
                buf.reserve(grown.min(MAX_RESPONSE_BYTES) - buf.len());
            }
            buf.extend_from_slice(data);
        }
    }

    Ok(buf.freeze())
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn is_transformable(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| {
            let ct = ct.to_ascii_lowercase();
            ct.contains("text/plain") || ct.contains("application/json")
        })
        .unwrap_or(false)
}

fn transform_body(body: Bytes, inbound_host: &str) -> Bytes {
    match std::str::from_utf8(&body) {
        Ok(text) => Bytes::from(rewrite::transform_links(text, inbound_host)),
        Err(_) => body,
    }
}

fn plain(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(message.to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(name: &str, origin: &str, port: u16, base: &str) -> SubscriptionTarget {
        SubscriptionTarget {
            name: name.to_string(),
            origin: Url::parse(origin).unwrap(),
            port,
            base_path: base.to_string(),
        }
    }

    #[test]
    fn test_match_default_route() {
        let route = match_route("/sub/tok-abc").unwrap();
        assert_eq!(route.service, None);
        assert_eq!(route.token_segments, vec!["tok-abc"]);
    }

    #[test]
    fn test_match_named_route_case_insensitive() {
        let route = match_route("/Alpha/sub/tok/with/slashes").unwrap();
        assert_eq!(route.service.as_deref(), Some("alpha"));
        assert_eq!(route.token_segments, vec!["tok", "with", "slashes"]);
    }

    #[test]
    fn test_match_rejects_other_paths() {
        assert!(match_route("/sub").is_none());
        assert!(match_route("/ws/foo").is_none());
        assert!(match_route("/a/b/c").is_none());
        assert!(match_route("/").is_none());
    }

    #[test]
    fn test_upstream_url_building() {
        let t = target("alpha", "https://panel.example", 8443, "/feeds");
        let url = build_upstream_url(&t, &["tok".to_string(), "part".to_string()], Some("flag=1"));
        assert_eq!(url, "https://panel.example:8443/feeds/tok/part?flag=1");
    }

    #[test]
    fn test_upstream_url_root_base_path() {
        let t = target("alpha", "http://panel.example", 80, "/");
        let url = build_upstream_url(&t, &["tok".to_string()], None);
        assert_eq!(url, "http://panel.example:80/tok");
    }

    #[test]
    fn test_upstream_url_reencodes_segments() {
        let t = target("alpha", "https://panel.example", 443, "/sub");
        // A segment arriving as `a%2Fb` decodes to `a/b` and must be
        // re-encoded so the slash is not a separator.
        let url = build_upstream_url(&t, &["a%2Fb".to_string()], None);
        assert_eq!(url, "https://panel.example:443/sub/a%2Fb");
    }

    #[test]
    fn test_resolve_target_fallback() {
        let settings = SubscriptionSettings {
            enabled: true,
            preserve_domain: false,
            transform: false,
            cache_ttl_ms: 1_000,
            targets: vec![
                target("alpha", "https://one.example", 443, "/sub"),
                target("beta", "https://two.example", 443, "/sub"),
            ],
        };
        let proxy = SubscriptionProxy {
            settings,
            cache: SubscriptionCache::new(1_000),
            client: crate::client::build_client(),
        };

        assert_eq!(proxy.resolve_target(Some("BETA")).unwrap().name, "beta");
        assert_eq!(proxy.resolve_target(Some("missing")).unwrap().name, "alpha");
        assert_eq!(proxy.resolve_target(None).unwrap().name, "alpha");
    }

    #[test]
    fn test_transformable_content_types() {
        assert!(is_transformable(Some("text/plain; charset=utf-8")));
        assert!(is_transformable(Some("application/json")));
        assert!(!is_transformable(Some("text/html")));
        assert!(!is_transformable(None));
    }
}
