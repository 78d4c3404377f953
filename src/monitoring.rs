use crate::config::Settings;
use crate::pool::PoolSnapshot;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde_json::json;

/// `GET /health`: aggregate pool health. Per-backend URLs are redacted
/// unless the operator opted out of hiding them.
pub fn health_response(snapshot: &PoolSnapshot, hide_backend_urls: bool) -> Response<Full<Bytes>> {
    let status = if snapshot.healthy > 0 { "ok" } else { "degraded" };

    let mut payload = json!({
        "status": status,
        "timestamp": chrono::Utc::now().timestamp(),
        "totalBackends": snapshot.total,
        "healthyBackends": snapshot.healthy,
        "unhealthyBackends": snapshot.total - snapshot.healthy,
    });

    if !hide_backend_urls {
        payload["backends"] = serde_json::to_value(&snapshot.backends).unwrap_or_default();
    }

    json_response(StatusCode::OK, &payload)
}

/// `GET /status`: resolved configuration snapshot, exposed only in debug
/// mode (the router guards that).
pub fn status_response(settings: &Settings, subscription_targets: &[String]) -> Response<Full<Bytes>> {
    let payload = json!({
        "rateLimit": settings.rate_limit,
        "identityLimit": settings.identity,
        "subscriptionTargets": subscription_targets,
        "defaultTransport": settings.default_transport.as_str(),
    });
    json_response(StatusCode::OK, &payload)
}

pub fn not_found() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from("Not Found")))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn json_response(status: StatusCode, payload: &serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(payload.to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BackendStatus;

    fn snapshot(healthy: usize, total: usize) -> PoolSnapshot {
        PoolSnapshot {
            total,
            healthy,
            backends: (0..total)
                .map(|i| BackendStatus {
                    url: format!("http://backend-{}.example/", i),
                    healthy: i < healthy,
                    weight: 1,
                    failures_total: 0,
                })
                .collect(),
        }
    }

    fn body_json(response: Response<Full<Bytes>>) -> serde_json::Value {
        use http_body_util::BodyExt;
        let collected = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(response.into_body().collect())
            .unwrap();
        serde_json::from_slice(&collected.to_bytes()).unwrap()
    }

    #[test]
    fn test_health_ok_with_redaction() {
        let payload = body_json(health_response(&snapshot(2, 3), true));
        assert_eq!(payload["status"], "ok");
        assert_eq!(payload["totalBackends"], 3);
        assert_eq!(payload["healthyBackends"], 2);
        assert_eq!(payload["unhealthyBackends"], 1);
        assert!(payload.get("backends").is_none());
    }

    #[test]
    fn test_health_degraded_lists_backends_when_unhidden() {
        let payload = body_json(health_response(&snapshot(0, 2), false));
        assert_eq!(payload["status"], "degraded");
        assert_eq!(payload["backends"].as_array().unwrap().len(), 2);
        assert_eq!(payload["backends"][0]["healthy"], false);
    }

    #[test]
    fn test_status_payload_shape() {
        let settings = Settings::resolve(|key| match key {
            "DEBUG" => Some("true".to_string()),
            "TRANSPORT" => Some("ws".to_string()),
            _ => None,
        });
        let payload = body_json(status_response(&settings, &["alpha".to_string()]));
        assert_eq!(payload["defaultTransport"], "ws");
        assert_eq!(payload["subscriptionTargets"][0], "alpha");
        assert!(payload["rateLimit"]["enabled"].is_boolean());
        assert!(payload["identityLimit"]["max_connections"].is_number());
    }
}
