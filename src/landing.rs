use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};

const LANDING_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Service Online</title>
<style>
  body { font-family: system-ui, sans-serif; background: #f5f6f8; color: #1f2430;
         display: flex; align-items: center; justify-content: center; height: 100vh; margin: 0; }
  .card { background: #fff; border-radius: 10px; padding: 2.5rem 3rem;
          box-shadow: 0 2px 10px rgba(0,0,0,0.08); text-align: center; }
  h1 { margin: 0 0 0.5rem; font-size: 1.6rem; }
  p { margin: 0; color: #5b6472; }
</style>
</head>
<body>
<div class="card">
  <h1>Service Online</h1>
  <p>This endpoint is operating normally.</p>
</div>
</body>
</html>
"#;

/// Landing page for `/` and `/index.html` when the subscription proxy is
/// disabled. Cacheable for an hour at the edge.
pub fn landing_response(head: bool) -> Response<Full<Bytes>> {
    let body = if head {
        Bytes::new()
    } else {
        Bytes::from_static(LANDING_HTML.as_bytes())
    };
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/html; charset=utf-8")
        .header("cache-control", "public, max-age=3600")
        .body(Full::new(body))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

/// Plain-text usage hints shown instead of the landing page when the
/// subscription proxy is enabled.
pub fn subscription_info_response(target_names: &[String], head: bool) -> Response<Full<Bytes>> {
    let mut text = String::from("Subscription proxy is enabled.\n\nRoutes:\n  /sub/<token>\n");
    for name in target_names {
        text.push_str(&format!("  /{}/sub/<token>\n", name));
    }

    let body = if head { Bytes::new() } else { Bytes::from(text) };
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Full::new(body))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}
