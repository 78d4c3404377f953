//! Shared fixtures: a gateway instance on an ephemeral port, disposable
//! upstream servers, and a minimal raw-socket HTTP client so upgrade flows
//! can be driven byte by byte.

#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tunnel_bridge::client::build_client;
use tunnel_bridge::{Gateway, Settings};

pub fn settings_from(pairs: &[(&str, &str)]) -> Settings {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Settings::resolve(move |key| map.get(key).cloned())
}

/// Serve a gateway built from `settings` on an ephemeral port.
pub async fn spawn_gateway(settings: Settings) -> SocketAddr {
    let gateway = Gateway::new(settings, build_client());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind gateway");
    let addr = listener.local_addr().expect("gateway addr");

    tokio::spawn(async move {
        loop {
            let Ok((stream, remote)) = listener.accept().await else {
                break;
            };
            let gateway = gateway.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let gateway = gateway.clone();
                    async move {
                        Ok::<_, std::convert::Infallible>(gateway.handle(req, remote).await)
                    }
                });
                let _ = ServerBuilder::new()
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await;
            });
        }
    });

    addr
}

/// Upstream that echoes request details for passthrough assertions and
/// byte-echoes upgraded connections.
pub async fn spawn_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind backend");
    let addr = listener.local_addr().expect("backend addr");

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(|mut req: Request<Incoming>| async move {
                    if req.headers().contains_key("upgrade") {
                        let on_upgrade = hyper::upgrade::on(&mut req);
                        tokio::spawn(async move {
                            if let Ok(upgraded) = on_upgrade.await {
                                let mut io = TokioIo::new(upgraded);
                                let mut buf = [0u8; 4096];
                                loop {
                                    match io.read(&mut buf).await {
                                        Ok(0) | Err(_) => break,
                                        Ok(n) => {
                                            if io.write_all(&buf[..n]).await.is_err() {
                                                break;
                                            }
                                        }
                                    }
                                }
                            }
                        });
                        return Ok::<_, std::convert::Infallible>(
                            Response::builder()
                                .status(StatusCode::SWITCHING_PROTOCOLS)
                                .header("connection", "Upgrade")
                                .header("upgrade", "websocket")
                                .body(Full::new(Bytes::new()))
                                .expect("101 response"),
                        );
                    }

                    let summary = format!(
                        "path={} host={} xtt={}",
                        req.uri()
                            .path_and_query()
                            .map(|pq| pq.as_str())
                            .unwrap_or("/"),
                        req.headers()
                            .get("host")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("-"),
                        req.headers()
                            .get("x-transport-type")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("-"),
                    );
                    Ok(Response::builder()
                        .status(StatusCode::OK)
                        .body(Full::new(Bytes::from(summary)))
                        .expect("200 response"))
                });
                let _ = ServerBuilder::new()
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await;
            });
        }
    });

    addr
}

/// Upstream serving a fixed 200 body and counting hits.
pub async fn spawn_counting_backend(body: &'static str, hits: Arc<AtomicUsize>) -> SocketAddr {
    spawn_static_backend(move || {
        hits.fetch_add(1, Ordering::SeqCst);
        ("text/plain", Bytes::from_static(body.as_bytes()))
    })
    .await
}

/// Upstream serving a computed 200 body on every request.
pub async fn spawn_static_backend<F>(make: F) -> SocketAddr
where
    F: Fn() -> (&'static str, Bytes) + Clone + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind backend");
    let addr = listener.local_addr().expect("backend addr");

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let make = make.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |_req: Request<Incoming>| {
                    let make = make.clone();
                    async move {
                        let (content_type, body) = make();
                        Ok::<_, std::convert::Infallible>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .header("content-type", content_type)
                                .body(Full::new(body))
                                .expect("200 response"),
                        )
                    }
                });
                let _ = ServerBuilder::new().serve_connection(io, service).await;
            });
        }
    });

    addr
}

/// An address nothing is listening on.
pub async fn dead_backend_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    addr
}

pub struct RawResponse {
    pub status: u16,
    pub head: String,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<String> {
        let prefix = format!("{}:", name.to_ascii_lowercase());
        self.head
            .lines()
            .find(|line| line.to_ascii_lowercase().starts_with(&prefix))
            .map(|line| line[prefix.len()..].trim().to_string())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// One-shot request over a raw socket; reads to EOF.
pub async fn http_request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    extra_headers: &[(&str, &str)],
) -> RawResponse {
    let mut stream = TcpStream::connect(addr).await.expect("connect");

    let mut request = format!("{} {} HTTP/1.1\r\nHost: test.example\r\nConnection: close\r\n", method, path);
    for (name, value) in extra_headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.expect("write request");

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.expect("read response");

    parse_response(raw)
}

fn parse_response(raw: Vec<u8>) -> RawResponse {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("header terminator");
    let head = String::from_utf8_lossy(&raw[..split]).into_owned();
    let mut body = raw[split + 4..].to_vec();

    // Undo chunked framing when present; bodies here are single-chunk.
    if head.to_ascii_lowercase().contains("transfer-encoding: chunked") {
        body = dechunk(&body);
    }

    let status = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .expect("status code");

    RawResponse { status, head, body }
}

fn dechunk(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut rest = body;
    loop {
        let Some(eol) = rest.windows(2).position(|w| w == b"\r\n") else {
            break;
        };
        let size = usize::from_str_radix(
            String::from_utf8_lossy(&rest[..eol]).trim(),
            16,
        )
        .unwrap_or(0);
        if size == 0 {
            break;
        }
        let start = eol + 2;
        out.extend_from_slice(&rest[start..start + size]);
        rest = &rest[start + size + 2..];
    }
    out
}

/// Send an upgrade handshake and return the open socket plus the response
/// head (everything before the blank line).
pub async fn open_upgrade(
    addr: SocketAddr,
    path: &str,
    extra_headers: &[(&str, &str)],
) -> (TcpStream, RawResponse) {
    let mut stream = TcpStream::connect(addr).await.expect("connect");

    let mut request = format!(
        "GET {} HTTP/1.1\r\nHost: test.example\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n",
        path
    );
    for (name, value) in extra_headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.expect("write upgrade");

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.expect("read head");
        if n == 0 {
            break;
        }
        head.push(byte[0]);
    }

    let head_str = String::from_utf8_lossy(&head).into_owned();
    let status = head_str
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);

    (
        stream,
        RawResponse {
            status,
            head: head_str,
            body: Vec::new(),
        },
    )
}
