use crate::config::SubscriptionTarget;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use bytes::Bytes;
use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use regex::Regex;
use url::Url;

/// Minimum length before a payload is considered as a base64 document.
const MIN_BASE64_LEN: usize = 16;
/// Printable-byte ratio below which content is treated as binary.
const PRINTABLE_THRESHOLD: f64 = 0.85;
const CLASSIFY_WINDOW: usize = 512;

static PLAIN_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s"'<>\\`{}|]+"#).expect("plain url regex"));

/// JSON-escaped form: `https:\/\/host\/path`.
static ESCAPED_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?:\\/\\/(?:\\/|[^\s"'<>\\`{}|])+"#).expect("escaped url regex"));

/// Content-type hints that mark a payload as text, else a printable-bytes
/// heuristic over the first 512 bytes.
pub fn looks_textual(content_type: Option<&str>, body: &[u8]) -> bool {
    if let Some(ct) = content_type {
        let ct = ct.to_ascii_lowercase();
        if ct.contains("text/")
            || ct.contains("json")
            || ct.contains("xml")
            || ct.contains("yaml")
            || ct.contains("application/octet-stream")
        {
            return true;
        }
    }
    printable_ratio(body) >= PRINTABLE_THRESHOLD
}

fn printable_ratio(body: &[u8]) -> f64 {
    let window = &body[..body.len().min(CLASSIFY_WINDOW)];
    if window.is_empty() {
        return 0.0;
    }
    let printable = window
        .iter()
        .filter(|&&b| (0x20..0x7f).contains(&b) || matches!(b, b'\n' | b'\r' | b'\t'))
        .count();
    printable as f64 / window.len() as f64
}

/// Rewrite subscription-document URLs so their origin equals the target
/// origin, preserving path, query and fragment. Handles plain and
/// JSON-escaped URLs, and whole-payload base64url documents. Returns `None`
/// when nothing needed rewriting.
pub fn preserve_domains(
    body: &Bytes,
    content_type: Option<&str>,
    target: &SubscriptionTarget,
    token: &str,
) -> Option<Bytes> {
    if !looks_textual(content_type, body) {
        return None;
    }
    let text = std::str::from_utf8(body).ok()?;

    if let Some(reencoded) = rewrite_base64_payload(text, target, token) {
        return Some(Bytes::from(reencoded));
    }

    let rewritten = rewrite_text(text, target, token);
    if rewritten == text {
        None
    } else {
        Some(Bytes::from(rewritten))
    }
}

fn rewrite_text(text: &str, target: &SubscriptionTarget, token: &str) -> String {
    let pass1 = ESCAPED_URL_RE.replace_all(text, |caps: &regex::Captures<'_>| {
        let escaped = &caps[0];
        let unescaped = escaped.replace(r"\/", "/");
        match rewrite_candidate(&unescaped, target, token) {
            Some(rewritten) => rewritten.replace('/', r"\/"),
            None => escaped.to_string(),
        }
    });

    PLAIN_URL_RE
        .replace_all(&pass1, |caps: &regex::Captures<'_>| {
            let candidate = &caps[0];
            rewrite_candidate(candidate, target, token).unwrap_or_else(|| candidate.to_string())
        })
        .into_owned()
}

/// A URL is rewritten when it is not already on the target origin, carries
/// the subscription token (raw or percent-encoded) in its path or query,
/// and lies under the target's base path or any `/sub/` prefix.
fn rewrite_candidate(candidate: &str, target: &SubscriptionTarget, token: &str) -> Option<String> {
    let url = Url::parse(candidate).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }

    let target_origin = Url::parse(&target.origin_with_port()).ok()?;
    if url.origin() == target_origin.origin() {
        return None;
    }

    let path = url.path();
    let query = url.query().unwrap_or("");
    if !contains_token(path, token) && !contains_token(query, token) {
        return None;
    }
    if !(path.starts_with(&target.base_path) || path.contains("/sub/")) {
        return None;
    }

    let mut rebuilt = target_origin;
    rebuilt.set_path(path);
    rebuilt.set_query(url.query());
    rebuilt.set_fragment(url.fragment());
    Some(rebuilt.to_string())
}

fn contains_token(haystack: &str, token: &str) -> bool {
    if token.is_empty() {
        return false;
    }
    if haystack.contains(token) {
        return true;
    }
    percent_decode_str(haystack)
        .decode_utf8()
        .map(|decoded| decoded.contains(token))
        .unwrap_or(false)
}

#[derive(Clone, Copy, PartialEq)]
enum Base64Style {
    NoPad,
    Padded,
}

/// Decode a canonical base64url payload, remembering whether it was padded
/// so the rewrite can re-encode in the same style.
fn decode_base64url_flex(s: &str) -> Option<(Vec<u8>, Base64Style)> {
    if s.contains('=') {
        let decoded = URL_SAFE.decode(s).ok()?;
        (URL_SAFE.encode(&decoded) == s).then_some((decoded, Base64Style::Padded))
    } else {
        let decoded = URL_SAFE_NO_PAD.decode(s).ok()?;
        (URL_SAFE_NO_PAD.encode(&decoded) == s).then_some((decoded, Base64Style::NoPad))
    }
}

fn rewrite_base64_payload(text: &str, target: &SubscriptionTarget, token: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.len() < MIN_BASE64_LEN {
        return None;
    }

    let (decoded, style) = decode_base64url_flex(trimmed)?;
    if printable_ratio(&decoded) < PRINTABLE_THRESHOLD {
        return None;
    }
    let inner = String::from_utf8(decoded).ok()?;

    let rewritten = rewrite_text(&inner, target, token);
    if rewritten == inner {
        return None;
    }

    Some(match style {
        Base64Style::NoPad => URL_SAFE_NO_PAD.encode(rewritten.as_bytes()),
        Base64Style::Padded => URL_SAFE.encode(rewritten.as_bytes()),
    })
}

/// Independent link transform: point every URL in the payload at the
/// inbound request's host, keeping scheme, path, query and fragment.
pub fn transform_links(text: &str, inbound_host: &str) -> String {
    PLAIN_URL_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let candidate = &caps[0];
            match Url::parse(candidate) {
                Ok(url) => {
                    let query = url.query().map(|q| format!("?{}", q)).unwrap_or_default();
                    let fragment = url.fragment().map(|f| format!("#{}", f)).unwrap_or_default();
                    format!("{}://{}{}{}{}", url.scheme(), inbound_host, url.path(), query, fragment)
                }
                Err(_) => candidate.to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "tok-123";

    fn target() -> SubscriptionTarget {
        SubscriptionTarget {
            name: "alpha".to_string(),
            origin: Url::parse("https://panel.example").unwrap(),
            port: 443,
            base_path: "/sub".to_string(),
        }
    }

    #[test]
    fn test_classification_by_content_type() {
        assert!(looks_textual(Some("text/plain; charset=utf-8"), b"\xff\xfe"));
        assert!(looks_textual(Some("application/json"), b"\xff"));
        assert!(looks_textual(Some("application/octet-stream"), b"\xff"));
        assert!(looks_textual(Some("application/x-yaml"), b"\xff"));
    }

    #[test]
    fn test_classification_by_heuristic() {
        assert!(looks_textual(None, b"plain ascii content here"));
        let mut binary = vec![0u8; 512];
        binary[..16].copy_from_slice(b"PNG header bytes");
        assert!(!looks_textual(Some("image/png"), &binary));
        assert!(!looks_textual(None, &binary));
    }

    #[test]
    fn test_rewrite_matching_url() {
        let body = Bytes::from(format!("vless server at https://other.example/sub/{}?x=1#frag", TOKEN));
        let out = preserve_domains(&body, Some("text/plain"), &target(), TOKEN).unwrap();
        let out = std::str::from_utf8(&out).unwrap();
        assert_eq!(
            out,
            format!("vless server at https://panel.example/sub/{}?x=1#frag", TOKEN)
        );
    }

    #[test]
    fn test_rewrite_percent_encoded_token() {
        let target = target();
        let rewritten = rewrite_candidate("https://other.example/sub/tok%2D123", &target, TOKEN).unwrap();
        assert!(rewritten.starts_with("https://panel.example/"));
    }

    #[test]
    fn test_no_op_without_token_or_prefix() {
        let target = target();
        // Token missing.
        assert!(rewrite_candidate("https://other.example/sub/different", &target, TOKEN).is_none());
        // Token present but not under the base path or a /sub/ prefix.
        assert!(rewrite_candidate(&format!("https://other.example/feed/{}", TOKEN), &target, TOKEN).is_none());
        // Already on the target origin.
        assert!(rewrite_candidate(&format!("https://panel.example/sub/{}", TOKEN), &target, TOKEN).is_none());
    }

    #[test]
    fn test_no_op_payload_returns_none() {
        let body = Bytes::from_static(b"no urls in here at all");
        assert!(preserve_domains(&body, Some("text/plain"), &target(), TOKEN).is_none());
    }

    #[test]
    fn test_escaped_urls_rewritten_and_reescaped() {
        let body = Bytes::from(format!(
            r#"{{"endpoint":"https:\/\/other.example\/sub\/{}"}}"#,
            TOKEN
        ));
        let out = preserve_domains(&body, Some("application/json"), &target(), TOKEN).unwrap();
        let out = std::str::from_utf8(&out).unwrap();
        assert_eq!(
            out,
            format!(r#"{{"endpoint":"https:\/\/panel.example\/sub\/{}"}}"#, TOKEN)
        );
    }

    #[test]
    fn test_base64_payload_round_trip() {
        let inner = format!("proxy https://other.example/sub/{} end", TOKEN);
        let encoded = URL_SAFE_NO_PAD.encode(inner.as_bytes());
        let body = Bytes::from(encoded);

        let out = preserve_domains(&body, Some("text/plain"), &target(), TOKEN).unwrap();
        let decoded = URL_SAFE_NO_PAD.decode(&out[..]).unwrap();
        let decoded = String::from_utf8(decoded).unwrap();
        assert_eq!(decoded, format!("proxy https://panel.example/sub/{} end", TOKEN));
    }

    #[test]
    fn test_base64_padded_style_is_kept() {
        let inner = format!("x https://other.example/sub/{} y", TOKEN);
        let encoded = URL_SAFE.encode(inner.as_bytes());
        assert!(encoded.contains('='), "fixture should need padding");
        let body = Bytes::from(encoded);

        let out = preserve_domains(&body, Some("text/plain"), &target(), TOKEN).unwrap();
        let out = std::str::from_utf8(&out).unwrap();
        assert!(out.ends_with('='), "padding style must survive: {}", out);
        assert!(URL_SAFE.decode(out).is_ok());
    }

    #[test]
    fn test_non_canonical_base64_left_alone() {
        // Standard alphabet, not URL-safe: treated as ordinary text.
        let body = Bytes::from_static(b"c3Vic2NyaXB0aW9uK2RhdGEv+bad");
        assert!(preserve_domains(&body, Some("text/plain"), &target(), TOKEN).is_none());
    }

    #[test]
    fn test_transform_links() {
        let out = transform_links(
            "a https://one.example/p?q=1 b http://two.example/x#f c",
            "edge.example:8443",
        );
        assert_eq!(
            out,
            "a https://edge.example:8443/p?q=1 b http://edge.example:8443/x#f c"
        );
    }
}
