use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, UPGRADE};
use hyper::Response;

/// Internal marker propagating failure attribution from a transport handler
/// to the failover driver. Stripped before any response leaves the process.
pub const BACKEND_FAILURE_HEADER: &str = "x-cf-xray-backend-failure";

/// Transport selector header; never forwarded upstream.
pub const TRANSPORT_HEADER: &str = "x-transport-type";

/// Close-code hint attached to identity-limit rejections.
pub const CLOSE_CODE_HINT_HEADER: &str = "x-websocket-close-code";

/// Protocol-negotiation tokens that are never early-data candidates.
pub const KNOWN_PROTOCOL_TOKENS: [&str; 3] = ["trojan", "vless", "vmess"];

/// An upgrade handshake carries `Connection: upgrade` and an `Upgrade` token.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_has_upgrade = headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);

    connection_has_upgrade && headers.contains_key(UPGRADE)
}

/// Prefer `cf-connecting-ip`, then the first `x-forwarded-for` value, then
/// `x-real-ip`, else `"unknown"`.
pub fn resolve_client_ip(headers: &HeaderMap) -> String {
    if let Some(ip) = header_str(headers, "cf-connecting-ip") {
        return ip.trim().to_string();
    }
    if let Some(xff) = header_str(headers, "x-forwarded-for") {
        if let Some(first) = xff.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(ip) = header_str(headers, "x-real-ip") {
        return ip.trim().to_string();
    }
    "unknown".to_string()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Hop-by-hop headers never travel end to end.
pub fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
    if !keep_upgrade {
        headers.remove(CONNECTION);
        headers.remove(UPGRADE);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-authenticate");
    headers.remove("proxy-authorization");
    headers.remove("te");
    headers.remove("trailers");
    headers.remove("transfer-encoding");
}

/// Transport selectors the upstream must not see.
pub fn scrub_selector_headers(headers: &mut HeaderMap) {
    headers.remove(TRANSPORT_HEADER);
}

/// Comma-separated `Sec-WebSocket-Protocol` tokens, trimmed, empty dropped.
pub fn websocket_protocol_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .map(|raw| {
            raw.split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Decode an early-data token: canonical base64url (URL-safe alphabet, no
/// padding, round-trip equality with the re-encoded form), at most
/// `max_bytes` decoded octets. Anything else is not early data.
pub fn decode_early_data(token: &str, max_bytes: usize) -> Option<Bytes> {
    if token.is_empty() || max_bytes == 0 {
        return None;
    }

    let decoded = URL_SAFE_NO_PAD.decode(token).ok()?;
    if URL_SAFE_NO_PAD.encode(&decoded) != token {
        return None;
    }
    if decoded.len() > max_bytes {
        return None;
    }

    Some(Bytes::from(decoded))
}

pub fn tag_backend_failure<B>(response: &mut Response<B>) {
    response.headers_mut().insert(
        HeaderName::from_static(BACKEND_FAILURE_HEADER),
        HeaderValue::from_static("1"),
    );
}

pub fn is_backend_failure<B>(response: &Response<B>) -> bool {
    response.headers().contains_key(BACKEND_FAILURE_HEADER)
}

pub fn strip_backend_failure<B>(response: &mut Response<B>) {
    response.headers_mut().remove(BACKEND_FAILURE_HEADER);
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_upgrade_detection() {
        assert!(is_upgrade_request(&headers(&[
            ("connection", "Upgrade"),
            ("upgrade", "websocket"),
        ])));
        assert!(is_upgrade_request(&headers(&[
            ("connection", "keep-alive, Upgrade"),
            ("upgrade", "websocket"),
        ])));
        assert!(!is_upgrade_request(&headers(&[("upgrade", "websocket")])));
        assert!(!is_upgrade_request(&headers(&[("connection", "keep-alive")])));
    }

    #[test]
    fn test_client_ip_preference_order() {
        let map = headers(&[
            ("cf-connecting-ip", "203.0.113.7"),
            ("x-forwarded-for", "198.51.100.1, 10.0.0.1"),
            ("x-real-ip", "192.0.2.9"),
        ]);
        assert_eq!(resolve_client_ip(&map), "203.0.113.7");

        let map = headers(&[
            ("x-forwarded-for", "198.51.100.1, 10.0.0.1"),
            ("x-real-ip", "192.0.2.9"),
        ]);
        assert_eq!(resolve_client_ip(&map), "198.51.100.1");

        let map = headers(&[("x-real-ip", "192.0.2.9")]);
        assert_eq!(resolve_client_ip(&map), "192.0.2.9");

        assert_eq!(resolve_client_ip(&HeaderMap::new()), "unknown");
    }

    #[test]
    fn test_early_data_round_trip() {
        let payload = b"\x00\x01binary payload\xff";
        let token = URL_SAFE_NO_PAD.encode(payload);
        let decoded = decode_early_data(&token, 1024).unwrap();
        assert_eq!(&decoded[..], payload);
        assert_eq!(URL_SAFE_NO_PAD.encode(&decoded), token);
    }

    #[test]
    fn test_early_data_rejects_padding_and_standard_alphabet() {
        // Padded form round-trips to the unpadded encoding, so it is not canonical.
        assert!(decode_early_data("aGVsbG8=", 1024).is_none());
        // '+' is the standard alphabet, not URL-safe.
        assert!(decode_early_data("a+b/", 1024).is_none());
        assert!(decode_early_data("aGVsbG8", 1024).is_some());
    }

    #[test]
    fn test_early_data_respects_cap() {
        let token = URL_SAFE_NO_PAD.encode([0u8; 32]);
        assert!(decode_early_data(&token, 31).is_none());
        assert!(decode_early_data(&token, 32).is_some());
        assert!(decode_early_data(&token, 0).is_none());
    }

    #[test]
    fn test_failure_marker_lifecycle() {
        let mut resp = Response::new(());
        assert!(!is_backend_failure(&resp));
        tag_backend_failure(&mut resp);
        assert!(is_backend_failure(&resp));
        strip_backend_failure(&mut resp);
        assert!(!is_backend_failure(&resp));
    }

    #[test]
    fn test_protocol_tokens() {
        let map = headers(&[("sec-websocket-protocol", "vless,  chat ,")]);
        assert_eq!(websocket_protocol_tokens(&map), vec!["vless", "chat"]);
    }
}
