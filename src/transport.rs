use crate::bridge::{spawn_bridge, BridgeHooks};
use crate::client::{empty_body, full_body, HttpClient};
use crate::headers::{
    self, decode_early_data, is_upgrade_request, websocket_protocol_tokens, KNOWN_PROTOCOL_TOKENS,
};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, CONNECTION, HOST, UPGRADE};
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode};
use log::{debug, warn};
use std::time::Duration;
use tokio::time::timeout;
use url::Url;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const PASSTHROUGH_TIMEOUT: Duration = Duration::from_secs(15);

/// Early-data byte hints are capped regardless of what the client asks for.
const MAX_EARLY_DATA_BYTES: usize = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Ws,
    Xhttp,
    HttpUpgrade,
}

impl Transport {
    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "ws" => Some(Transport::Ws),
            "xhttp" => Some(Transport::Xhttp),
            "httpupgrade" => Some(Transport::HttpUpgrade),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Ws => "ws",
            Transport::Xhttp => "xhttp",
            Transport::HttpUpgrade => "httpupgrade",
        }
    }
}

/// Derive the transport: query parameter, then header, then path prefix,
/// then the configured default. Unknown values fall through to the next
/// step.
pub fn resolve_transport(
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    default: Transport,
) -> Transport {
    if let Some(value) = query_param(query, "transport") {
        if let Some(t) = Transport::from_token(&value) {
            return t;
        }
    }

    if let Some(value) = headers
        .get(headers::TRANSPORT_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(t) = Transport::from_token(value.trim()) {
            return t;
        }
    }

    if let Some(first) = first_segment(path) {
        if let Some(t) = Transport::from_token(first) {
            return t;
        }
    }

    default
}

/// Strip a leading transport-token segment (`/ws/foo/bar` → `/foo/bar`,
/// `/ws` → `/`). Paths without a recognized prefix pass through untouched.
pub fn strip_transport_prefix(path: &str) -> String {
    if let Some(first) = first_segment(path) {
        if Transport::from_token(first).is_some() {
            let rest = &path[1 + first.len()..];
            return if rest.is_empty() { "/".to_string() } else { rest.to_string() };
        }
    }
    path.to_string()
}

/// Drop the `transport` selector from a query string, keeping everything
/// else byte-for-byte.
pub fn scrub_query(query: Option<&str>) -> Option<String> {
    let query = query?;
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let key = pair.split('=').next().unwrap_or(pair);
            key != "transport"
        })
        .collect();
    if kept.is_empty() {
        None
    } else {
        Some(kept.join("&"))
    }
}

/// The path+query the upstream will see.
pub fn forwarded_path_and_query(path: &str, query: Option<&str>) -> String {
    let path = strip_transport_prefix(path);
    match scrub_query(query) {
        Some(q) => format!("{}?{}", path, q),
        None => path,
    }
}

fn first_segment(path: &str) -> Option<&str> {
    path.strip_prefix('/')?.split('/').next().filter(|s| !s.is_empty())
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// An inbound request prepared for (possibly repeated) forwarding: headers
/// and body are buffered once, and the client-side upgrade future is taken
/// exactly once by the first successful handshake.
pub struct ProxiedRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub is_upgrade: bool,
    body: Bytes,
    client_upgrade: Option<OnUpgrade>,
}

impl ProxiedRequest {
    pub async fn prepare(req: Request<Incoming>) -> Result<Self, Response<Full<Bytes>>> {
        let is_upgrade = is_upgrade_request(req.headers());
        let mut req = req;
        let client_upgrade = is_upgrade.then(|| hyper::upgrade::on(&mut req));
        let (parts, body) = req.into_parts();

        let body = if is_upgrade {
            Bytes::new()
        } else {
            match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    debug!("Failed to read inbound body: {}", e);
                    return Err(plain_response(
                        StatusCode::BAD_REQUEST,
                        "failed to read request body",
                    ));
                }
            }
        };

        Ok(Self {
            method: parts.method,
            headers: parts.headers,
            is_upgrade,
            body,
            client_upgrade,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum XhttpMode {
    Auto,
    /// Accepted and forwarded; behaves as `auto` upstream.
    PacketUp,
}

#[derive(Debug, Clone, Copy)]
struct XhttpParams {
    #[allow(dead_code)]
    mode: XhttpMode,
    early_data_budget: usize,
}

/// Validate xhttp's `mode` (query, falling back to the `x-xhttp-mode`
/// header) and `ed` parameters. Unknown or malformed values are client
/// errors.
fn parse_xhttp_params(query: Option<&str>, headers: &HeaderMap) -> Result<XhttpParams, String> {
    let mode_token = query_param(query, "mode").or_else(|| {
        headers
            .get("x-xhttp-mode")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
    });

    let mode = match mode_token.as_deref() {
        None | Some("") | Some("auto") => XhttpMode::Auto,
        Some("packet-up") => XhttpMode::PacketUp,
        Some(other) => return Err(format!("unknown xhttp mode '{}'", other)),
    };

    let early_data_budget = match query_param(query, "ed") {
        None => 0,
        Some(raw) => match raw.parse::<u64>() {
            Ok(n) => (n as usize).min(MAX_EARLY_DATA_BYTES),
            Err(_) => return Err(format!("invalid ed value '{}'", raw)),
        },
    };

    Ok(XhttpParams {
        mode,
        early_data_budget,
    })
}

/// When the `Sec-WebSocket-Protocol` header carries exactly one token that
/// is not a protocol-negotiation token and decodes as canonical base64url
/// within the `ed` budget, that token is early data: its octets become the
/// first upstream message and the token is stripped from the upstream
/// request to avoid double delivery.
fn extract_early_data(req_headers: &HeaderMap, budget: usize) -> Option<Bytes> {
    if budget == 0 {
        return None;
    }
    let tokens = websocket_protocol_tokens(req_headers);
    if tokens.len() != 1 {
        return None;
    }
    let token = &tokens[0];
    if KNOWN_PROTOCOL_TOKENS.contains(&token.to_ascii_lowercase().as_str()) {
        return None;
    }
    decode_early_data(token, budget)
}

/// Handle one proxied request against the origin the failover driver
/// chose: a passthrough forward, or a single upgrade handshake. Responses
/// carrying the internal failure marker tell the driver to try another
/// backend; retries and backoff live entirely in the driver.
pub async fn handle_proxy_request(
    transport: Transport,
    request: &mut ProxiedRequest,
    path_and_query: &str,
    origin: &Url,
    client: &HttpClient,
    hooks: &mut BridgeHooks,
) -> Response<Full<Bytes>> {
    if !request.is_upgrade {
        return passthrough(request, origin, path_and_query, client).await;
    }

    if request.method != Method::GET {
        return plain_response(StatusCode::BAD_REQUEST, "Upgrade requests must use GET");
    }

    let early_data = if transport == Transport::Xhttp {
        let params = match parse_xhttp_params(extract_query(path_and_query), &request.headers) {
            Ok(params) => params,
            Err(reason) => return plain_response(StatusCode::BAD_REQUEST, &reason),
        };
        extract_early_data(&request.headers, params.early_data_budget)
    } else {
        None
    };

    let upstream_headers =
        build_upstream_upgrade_headers(&request.headers, transport, early_data.is_some());
    let target_uri = origin_uri(origin, path_and_query);

    let upstream_request = match Request::builder()
        .method(Method::GET)
        .uri(target_uri.as_str())
        .body(empty_body())
    {
        Ok(mut r) => {
            *r.headers_mut() = upstream_headers;
            r
        }
        Err(e) => return tagged_bad_gateway(&format!("invalid upstream request: {}", e)),
    };

    let failure = match timeout(HANDSHAKE_TIMEOUT, client.request(upstream_request)).await {
        Ok(Ok(mut response)) if response.status() == StatusCode::SWITCHING_PROTOCOLS => {
            let Some(client_upgrade) = request.client_upgrade.take() else {
                return tagged_bad_gateway("client upgrade already consumed");
            };
            let upstream_upgrade = hyper::upgrade::on(&mut response);
            spawn_bridge(
                client_upgrade,
                upstream_upgrade,
                early_data,
                std::mem::take(hooks),
            );

            let (parts, _) = response.into_parts();
            let mut switch = Response::from_parts(parts, Full::new(Bytes::new()));
            headers::strip_backend_failure(&mut switch);
            return switch;
        }
        Ok(Ok(response)) => format!("upstream answered {} instead of 101", response.status()),
        Ok(Err(e)) => format!("upstream unreachable: {}", e),
        Err(_) => format!("handshake timed out after {:?}", HANDSHAKE_TIMEOUT),
    };

    warn!("Upgrade against {} failed: {}", origin, failure);
    tagged_bad_gateway(&failure)
}

/// Ordinary request: forward onto the origin with a hard deadline, no
/// retries at this layer.
async fn passthrough(
    request: &ProxiedRequest,
    origin: &Url,
    path_and_query: &str,
    client: &HttpClient,
) -> Response<Full<Bytes>> {
    let mut forwarded_headers = request.headers.clone();
    forwarded_headers.remove(HOST);
    headers::scrub_selector_headers(&mut forwarded_headers);
    headers::strip_hop_by_hop(&mut forwarded_headers, false);

    let upstream_request = match Request::builder()
        .method(request.method.clone())
        .uri(origin_uri(origin, path_and_query))
        .body(full_body(request.body.clone()))
    {
        Ok(mut r) => {
            *r.headers_mut() = forwarded_headers;
            r
        }
        Err(e) => return tagged_bad_gateway(&format!("invalid upstream request: {}", e)),
    };

    match timeout(PASSTHROUGH_TIMEOUT, client.request(upstream_request)).await {
        Ok(Ok(response)) => {
            let (mut parts, body) = response.into_parts();
            let body_bytes = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => return tagged_bad_gateway(&format!("upstream body error: {}", e)),
            };
            headers::strip_hop_by_hop(&mut parts.headers, false);
            parts.headers.remove(headers::BACKEND_FAILURE_HEADER);
            Response::from_parts(parts, Full::new(body_bytes))
        }
        Ok(Err(e)) => tagged_bad_gateway(&format!("upstream unreachable: {}", e)),
        Err(_) => tagged_bad_gateway(&format!(
            "upstream timed out after {:?}",
            PASSTHROUGH_TIMEOUT
        )),
    }
}

/// Upgrade headers for the upstream handshake: everything the client sent
/// minus Host, extensions, selectors and hop-by-hop state, with the upgrade
/// pair forced back on. `httpupgrade` echoes whatever upgrade token the
/// client supplied; the other transports always say `websocket`.
fn build_upstream_upgrade_headers(
    inbound: &HeaderMap,
    transport: Transport,
    early_data_consumed: bool,
) -> HeaderMap {
    let mut out = inbound.clone();
    out.remove(HOST);
    out.remove("sec-websocket-extensions");
    headers::scrub_selector_headers(&mut out);
    headers::strip_hop_by_hop(&mut out, false);
    out.remove(headers::BACKEND_FAILURE_HEADER);

    if early_data_consumed {
        out.remove("sec-websocket-protocol");
    }

    let upgrade_value = match transport {
        Transport::HttpUpgrade => inbound
            .get(UPGRADE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("websocket")),
        _ => HeaderValue::from_static("websocket"),
    };
    out.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    out.insert(UPGRADE, upgrade_value);

    out
}

fn origin_uri(origin: &Url, path_and_query: &str) -> String {
    format!("{}{}", origin.origin().ascii_serialization(), path_and_query)
}

fn extract_query(path_and_query: &str) -> Option<&str> {
    path_and_query.split_once('?').map(|(_, q)| q)
}

pub(crate) fn plain_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(message.to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

/// A 502 the failover driver recognizes as an upstream failure.
fn tagged_bad_gateway(message: &str) -> Response<Full<Bytes>> {
    let mut response = plain_response(StatusCode::BAD_GATEWAY, message);
    headers::tag_backend_failure(&mut response);
    response
}
