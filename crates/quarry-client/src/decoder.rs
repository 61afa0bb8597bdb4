//! Frame decoding for the streaming query endpoint.
//!
//! The body is a sequence of `data: <json>` frames separated by a blank
//! line. Network chunks arrive on arbitrary byte boundaries, so the decoder
//! keeps undecoded bytes (not text) between pushes: a multi-byte UTF-8
//! character split across two chunks is only decoded once it is whole.

use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use pin_project_lite::pin_project;
use serde_json::Value;
use tracing::{debug, trace, warn};

use quarry_core::errors::{ProtocolError, TransportError};

const FRAME_DELIMITER: &[u8] = b"\n\n";
const DATA_PREFIX: &[u8] = b"data:";

/// Default idle timeout for a streaming response.
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Incremental decoder. Feed it chunks with [`push`](Self::push); it returns
/// every frame completed by that chunk, in order.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    carry: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        // Only the tail of the old carry plus the new chunk can hold a new
        // delimiter.
        let mut search_from = self.carry.len().saturating_sub(FRAME_DELIMITER.len() - 1);
        self.carry.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(pos) = find_delimiter(&self.carry[search_from..]) {
            let end = search_from + pos;
            let raw = &self.carry[start..end];
            match decode_frame(raw) {
                Ok(Some(value)) => frames.push(value),
                Ok(None) => {}
                Err(error) => {
                    warn!(
                        error_kind = error.error_kind(),
                        error = %error,
                        bytes = raw.len(),
                        "dropping malformed frame"
                    );
                }
            }
            start = end + FRAME_DELIMITER.len();
            search_from = start;
        }
        self.carry.drain(..start);
        frames
    }

    /// Bytes held back waiting for a delimiter.
    pub fn pending_bytes(&self) -> usize {
        self.carry.len()
    }

    /// End of body. A trailing fragment without a delimiter is never
    /// parsed; returns how many bytes were dropped.
    pub fn finish(&mut self) -> usize {
        let dropped = self.carry.len();
        if dropped > 0 {
            debug!(bytes = dropped, "discarding unterminated trailing frame");
        }
        self.carry.clear();
        dropped
    }
}

fn find_delimiter(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(FRAME_DELIMITER.len())
        .position(|window| window == FRAME_DELIMITER)
}

/// Decode one complete frame. `Ok(None)` for segments that carry no data
/// (blank keep-alives, comment lines).
pub fn decode_frame(raw: &[u8]) -> Result<Option<Value>, ProtocolError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let Some(payload) = raw.strip_prefix(DATA_PREFIX) else {
        trace!(bytes = raw.len(), "skipping segment without data prefix");
        return Ok(None);
    };
    let text = std::str::from_utf8(payload).map_err(|_| ProtocolError::InvalidUtf8)?;
    serde_json::from_str(text.trim())
        .map(Some)
        .map_err(|e| ProtocolError::MalformedJson(e.to_string()))
}

pin_project! {
    /// Adapts a response byte stream into decoded frame values.
    ///
    /// Ends after the first transport error or idle timeout.
    pub struct FrameStream<S> {
        #[pin]
        inner: S,
        decoder: FrameDecoder,
        pending: VecDeque<Value>,
        idle_deadline: Pin<Box<tokio::time::Sleep>>,
        idle_duration: Duration,
        done: bool,
    }
}

impl<S> FrameStream<S> {
    pub fn new(inner: S) -> Self {
        Self::with_idle_timeout(inner, STREAM_IDLE_TIMEOUT)
    }

    /// Must be called inside a tokio runtime.
    pub fn with_idle_timeout(inner: S, idle_timeout: Duration) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            done: false,
        }
    }
}

impl<S, E> Stream for FrameStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    type Item = Result<Value, TransportError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Some(value) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(value)));
            }
            if *this.done {
                return Poll::Ready(None);
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let deadline = tokio::time::Instant::now() + *this.idle_duration;
                    this.idle_deadline.as_mut().reset(deadline);
                    this.pending.extend(this.decoder.push(&bytes));
                }
                Poll::Ready(Some(Err(e))) => {
                    *this.done = true;
                    this.decoder.finish();
                    return Poll::Ready(Some(Err(TransportError::StreamInterrupted(
                        e.to_string(),
                    ))));
                }
                Poll::Ready(None) => {
                    *this.done = true;
                    this.decoder.finish();
                    return Poll::Ready(None);
                }
                Poll::Pending => {
                    if this.idle_deadline.as_mut().poll(cx).is_ready() {
                        *this.done = true;
                        this.decoder.finish();
                        return Poll::Ready(Some(Err(TransportError::Timeout(
                            *this.idle_duration,
                        ))));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}
