//! MJPEG streaming over `multipart/x-mixed-replace`.
//!
//! Each viewer gets its own body stream that waits on the shared frame slot.
//! Viewers that fall behind skip straight to the newest frame. A stream ends
//! when the client goes away (axum drops the body) or when the slot is closed
//! during shutdown.

use crate::frame::{Frame, FrameSlot};
use crate::web::AppState;
use axum::{
    body::Body,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
};
use bytes::{BufMut, Bytes, BytesMut};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

/// Multipart boundary marker.
pub const BOUNDARY: &str = "FRAME";

/// `Content-Type` of the stream response.
pub fn stream_content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={}", BOUNDARY)
}

/// One multipart part: boundary, part headers, JPEG payload, trailing CRLF.
pub fn encode_part(frame: &Frame) -> Bytes {
    let head = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        frame.len()
    );
    let mut part = BytesMut::with_capacity(head.len() + frame.len() + 2);
    part.put_slice(head.as_bytes());
    part.put_slice(frame.jpeg());
    part.put_slice(b"\r\n");
    part.freeze()
}

/// Logs the viewer's departure when its body stream is dropped.
struct ViewerGuard {
    id: Uuid,
    connected_at: Instant,
    frames_sent: u64,
}

impl ViewerGuard {
    fn new(id: Uuid) -> Self {
        info!(viewer = %id, "Stream viewer connected");
        Self {
            id,
            connected_at: Instant::now(),
            frames_sent: 0,
        }
    }
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        info!(
            viewer = %self.id,
            frames = self.frames_sent,
            seconds = self.connected_at.elapsed().as_secs(),
            "Stream viewer disconnected"
        );
    }
}

/// Body that yields one part per new frame until the slot closes.
pub fn mjpeg_body(slot: Arc<FrameSlot>, viewer: Uuid) -> Body {
    let guard = ViewerGuard::new(viewer);
    let parts = futures_util::stream::unfold(
        (slot, 0u64, guard),
        |(slot, last_seen, mut guard)| async move {
            let (frame, generation) = slot.wait_for_next(last_seen).await?;
            guard.frames_sent += 1;
            Some((Ok::<_, Infallible>(encode_part(&frame)), (slot, generation, guard)))
        },
    );
    Body::from_stream(parts)
}

/// `GET /stream.mjpg`
pub async fn mjpeg_stream(State(state): State<AppState>) -> Response {
    let body = mjpeg_body(Arc::clone(&state.slot), Uuid::new_v4());
    (
        [
            (header::AGE, "0".to_string()),
            (header::CACHE_CONTROL, "no-cache, private".to_string()),
            (header::PRAGMA, "no-cache".to_string()),
            (header::CONTENT_TYPE, stream_content_type()),
        ],
        body,
    )
        .into_response()
}
