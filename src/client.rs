use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::time::Duration;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// One request body type serves handshakes (empty) and retried
/// passthroughs (buffered).
pub type ProxyBody = BoxBody<Bytes, BoxError>;

/// Pooled upstream client shared by handshakes, passthroughs, probes and
/// subscription fetches. Plain-HTTP and TLS origins both go through the
/// same connector.
pub type HttpClient = Client<HttpsConnector<HttpConnector>, ProxyBody>;

pub fn build_client() -> HttpClient {
    let https = HttpsConnector::new();

    Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(16)
        .pool_idle_timeout(Duration::from_secs(60))
        .pool_timer(TokioTimer::new())
        .build(https)
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| -> BoxError { match never {} })
        .boxed()
}

pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| -> BoxError { match never {} })
        .boxed()
}
