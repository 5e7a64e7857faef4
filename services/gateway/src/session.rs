// A live WebSocket connection. One `Session` is created per successful
// upgrade and shared (via `Clone`, which only clones the `Arc` handles) with
// the Session Registry and the Fan-out Pusher so either can write a frame
// without racing the connection's own reader task, matching the teacher's
// `Arc<Mutex<..>>`-guarded send half / `AtomicBool` closed flag idiom from
// `services/server`'s WS handlers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message as WsFrame, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use im_protocol::OutEnvelope;
use tokio::sync::Mutex;
use tracing::debug;

use crate::registry::SessionRegistry;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub const GZIP_COMPRESSION: &str = im_protocol::GZIP_COMPRESSION;

#[derive(Clone)]
pub struct Session {
    id: u64,
    pub user_id: String,
    pub platform_id: i32,
    compression: Option<String>,
    sink: Arc<Mutex<SplitSink<WebSocket, WsFrame>>>,
    closed: Arc<AtomicBool>,
    last_active: Arc<Mutex<Instant>>,
}

impl Session {
    pub fn new(
        user_id: impl Into<String>,
        platform_id: i32,
        compression: Option<String>,
        sink: SplitSink<WebSocket, WsFrame>,
    ) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            user_id: user_id.into(),
            platform_id,
            compression,
            sink: Arc::new(Mutex::new(sink)),
            closed: Arc::new(AtomicBool::new(false)),
            last_active: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn touch(&self) {
        *self.last_active.lock().await = Instant::now();
    }

    pub async fn last_active(&self) -> Instant {
        *self.last_active.lock().await
    }

    /// Encodes and writes one outbound envelope. Applies gzip to the frame
    /// payload (as a binary frame) when the connection negotiated
    /// `compression=gzip` at upgrade; otherwise sends a plain text frame.
    /// Returns `false` on any write failure — the caller should treat that as
    /// "peer gone" and close the session.
    pub async fn send_envelope(&self, env: &OutEnvelope) -> bool {
        if self.is_closed() {
            return false;
        }
        let Ok(json) = serde_json::to_vec(env) else {
            return false;
        };
        let frame = if self.compression.as_deref() == Some(GZIP_COMPRESSION) {
            match gzip(&json) {
                Ok(bytes) => WsFrame::Binary(bytes.into()),
                Err(_) => return false,
            }
        } else {
            WsFrame::Text(String::from_utf8_lossy(&json).into_owned().into())
        };
        let mut sink = self.sink.lock().await;
        sink.send(frame).await.is_ok()
    }

    pub async fn send_raw(&self, frame: WsFrame) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut sink = self.sink.lock().await;
        sink.send(frame).await.is_ok()
    }

    /// Idempotent close: only the first caller actually closes the socket and
    /// unregisters from the registry.
    pub async fn close(&self, registry: &SessionRegistry) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        {
            let mut sink = self.sink.lock().await;
            let _ = sink.send(WsFrame::Close(None)).await;
        }
        registry.delete(&self.user_id, &[self.id]).await;
        debug!(user_id = %self.user_id, session_id = self.id, "session closed");
        true
    }
}

pub fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    use flate2::read::GzDecoder;
    use std::io::Read;
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_round_trips() {
        let original = b"hello session world";
        let compressed = gzip(original).unwrap();
        assert_ne!(compressed, original);
        let decompressed = gunzip(&compressed).unwrap();
        assert_eq!(decompressed, original);
    }
}
