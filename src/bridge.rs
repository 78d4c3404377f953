use bytes::Bytes;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use log::debug;
use rand::RngCore;
use std::sync::{Arc, Mutex};
use tokio::io::{copy_bidirectional, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Close reasons are capped by the WebSocket control-frame payload limit.
const MAX_REASON_BYTES: usize = 123;

/// Kill switch handed to admission control through `on_ready`. Triggering
/// it tears the bridge down through the same idempotent path as a peer
/// close; the first close directive wins.
#[derive(Clone)]
pub struct Disconnector {
    token: CancellationToken,
    directive: Arc<Mutex<Option<(u16, String)>>>,
}

impl Disconnector {
    pub fn close(&self, code: u16, reason: &str) {
        {
            let mut slot = self.directive.lock().expect("disconnector mutex");
            if slot.is_none() {
                *slot = Some((code, reason.to_string()));
            }
        }
        self.token.cancel();
    }

    #[cfg(test)]
    pub(crate) fn standalone() -> Self {
        Self {
            token: CancellationToken::new(),
            directive: Arc::new(Mutex::new(None)),
        }
    }

    #[cfg(test)]
    pub(crate) fn fired(&self) -> Option<(u16, String)> {
        if !self.token.is_cancelled() {
            return None;
        }
        self.directive
            .lock()
            .expect("disconnector mutex")
            .clone()
            .or(Some((1000, String::new())))
    }
}

/// Lifecycle callbacks wired by the request router. `on_ready` installs the
/// kill switch; `on_closed` releases admission counters exactly once.
#[derive(Default)]
pub struct BridgeHooks {
    pub on_ready: Option<Box<dyn FnOnce(Disconnector) + Send>>,
    pub on_closed: Option<Box<dyn FnOnce() + Send>>,
}

/// Relay two upgraded streams until either side closes or the kill switch
/// fires. All teardown paths funnel through the single spawned task, so
/// `on_closed` cannot double-fire.
pub fn spawn_bridge(
    client_upgrade: OnUpgrade,
    upstream_upgrade: OnUpgrade,
    early_data: Option<Bytes>,
    mut hooks: BridgeHooks,
) {
    let token = CancellationToken::new();
    let directive: Arc<Mutex<Option<(u16, String)>>> = Arc::new(Mutex::new(None));

    if let Some(on_ready) = hooks.on_ready.take() {
        let disconnector = Disconnector {
            token: token.clone(),
            directive: Arc::clone(&directive),
        };
        invoke_quietly(move || on_ready(disconnector));
    }

    tokio::spawn(async move {
        relay(client_upgrade, upstream_upgrade, early_data, token, directive).await;
        if let Some(on_closed) = hooks.on_closed.take() {
            invoke_quietly(on_closed);
        }
    });
}

async fn relay(
    client_upgrade: OnUpgrade,
    upstream_upgrade: OnUpgrade,
    early_data: Option<Bytes>,
    token: CancellationToken,
    directive: Arc<Mutex<Option<(u16, String)>>>,
) {
    let (client_io, upstream_io) = match tokio::try_join!(client_upgrade, upstream_upgrade) {
        Ok(pair) => pair,
        Err(e) => {
            debug!("Upgrade completion failed: {}", e);
            return;
        }
    };

    let mut client = TokioIo::new(client_io);
    let mut upstream = TokioIo::new(upstream_io);

    // Early data goes out as the first client→upstream message.
    if let Some(data) = early_data {
        if let Err(e) = upstream.write_all(&encode_masked_binary_frame(&data)).await {
            debug!("Early data write failed: {}", e);
            let _ = client.write_all(&encode_close_frame(1011, "")).await;
            let _ = client.shutdown().await;
            return;
        }
    }

    tokio::select! {
        result = copy_bidirectional(&mut client, &mut upstream) => {
            match result {
                Ok((to_upstream, to_client)) => {
                    debug!("Bridge closed: {} bytes up, {} bytes down", to_upstream, to_client);
                }
                Err(e) => {
                    debug!("Bridge relay error: {}", e);
                    let _ = client.write_all(&encode_close_frame(1011, "")).await;
                }
            }
        }
        _ = token.cancelled() => {
            let (code, reason) = directive
                .lock()
                .expect("disconnector mutex")
                .clone()
                .unwrap_or((1000, String::new()));
            let frame = encode_close_frame(sanitize_close_code(code), truncate_reason(&reason));
            let _ = client.write_all(&frame).await;
        }
    }

    let _ = client.shutdown().await;
    let _ = upstream.shutdown().await;
}

/// Callbacks never propagate panics across the bridge boundary.
fn invoke_quietly(f: impl FnOnce()) {
    let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
}

/// Valid close codes are [1000, 4999] minus the two reserved ones; anything
/// else collapses to 1011.
pub fn sanitize_close_code(code: u16) -> u16 {
    if (1000..=4999).contains(&code) && code != 1005 && code != 1006 {
        code
    } else {
        1011
    }
}

pub fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_REASON_BYTES {
        return reason;
    }
    let mut end = MAX_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

/// Server→client close frame: unmasked, payload = code + reason.
pub(crate) fn encode_close_frame(code: u16, reason: &str) -> Vec<u8> {
    let reason = truncate_reason(reason).as_bytes();
    let mut frame = Vec::with_capacity(4 + reason.len());
    frame.push(0x88);
    frame.push((2 + reason.len()) as u8);
    frame.extend_from_slice(&code.to_be_bytes());
    frame.extend_from_slice(reason);
    frame
}

/// Client→server binary frame; client-originated frames must be masked.
pub(crate) fn encode_masked_binary_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 14);
    frame.push(0x82);

    match payload.len() {
        len if len < 126 => frame.push(0x80 | len as u8),
        len if len <= u16::MAX as usize => {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            frame.push(0x80 | 127);
            frame.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }

    let mut key = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut key);
    frame.extend_from_slice(&key);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
    frame
}
