//! Server-sent event decoding
//!
//! Backends push `data: <payload>` lines over one long-lived body. The line
//! splitting and stream bookkeeping are shared; what a payload means is up to
//! a per-protocol [`StreamDecoder`].

use futures_util::stream::{self, Stream, StreamExt};
use memchr::memchr;
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::provider::ChunkStream;
use crate::types::StreamChunk;
use crate::Result;

/// Payload that ends a stream before the body closes
pub const DONE_SENTINEL: &str = "[DONE]";

pub fn data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

/// Splits an arbitrary byte feed into complete lines
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and drain every line completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(newline) = memchr(b'\n', &self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
            if let Some(line) = decode_line(&raw[..newline]) {
                lines.push(line);
            }
        }
        lines
    }

    /// Take the unterminated tail left when the body closes
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.buffer);
        decode_line(&raw)
    }
}

fn decode_line(raw: &[u8]) -> Option<String> {
    match std::str::from_utf8(raw) {
        Ok(line) => {
            let line = line.trim_end_matches('\r');
            (!line.is_empty()).then(|| line.to_string())
        }
        Err(e) => {
            tracing::debug!(error = %e, "Skipping SSE line with invalid UTF-8");
            None
        }
    }
}

/// Per-protocol interpretation of `data:` payloads.
///
/// Decoders accumulate usage and stop reasons across events and only report
/// them through [`StreamDecoder::finish`].
pub trait StreamDecoder: Send + 'static {
    /// Text to emit for this payload, if any. An error ends the stream.
    fn decode(&mut self, payload: &str) -> Result<Option<String>>;

    /// Final chunk carrying accumulated usage and the last stop reason
    fn finish(&mut self) -> StreamChunk;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Reading,
    Closed,
    Finished,
}

struct SseState<S, D> {
    body: S,
    lines: SseLineBuffer,
    pending: VecDeque<String>,
    decoder: D,
    cancel: CancellationToken,
    phase: Phase,
}

enum Step<T> {
    Cancelled,
    Received(Option<T>),
}

/// Turn a byte body into a chunk stream.
///
/// The body's own errors must already be mapped to [`ProviderError`]. The
/// stream ends after the final chunk, after the first error, or with
/// [`ProviderError::Cancelled`] once `cancel` fires; the final chunk is only
/// produced when the body completed normally.
pub fn decode_stream<S, B, D>(body: S, decoder: D, cancel: CancellationToken) -> ChunkStream
where
    S: Stream<Item = Result<B>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    D: StreamDecoder,
{
    let state = SseState {
        body,
        lines: SseLineBuffer::new(),
        pending: VecDeque::new(),
        decoder,
        cancel,
        phase: Phase::Reading,
    };

    Box::pin(stream::unfold(state, |mut st| async move {
        loop {
            if st.phase == Phase::Finished {
                return None;
            }

            if st.cancel.is_cancelled() {
                st.phase = Phase::Finished;
                return Some((Err(ProviderError::Cancelled), st));
            }

            if let Some(line) = st.pending.pop_front() {
                let Some(payload) = data_payload(&line) else {
                    continue;
                };
                if payload == DONE_SENTINEL {
                    st.pending.clear();
                    st.phase = Phase::Closed;
                    continue;
                }
                match st.decoder.decode(payload) {
                    Ok(Some(text)) => return Some((Ok(StreamChunk::text(text)), st)),
                    Ok(None) => continue,
                    Err(e) => {
                        st.phase = Phase::Finished;
                        return Some((Err(e), st));
                    }
                }
            }

            if st.phase == Phase::Closed {
                st.phase = Phase::Finished;
                let chunk = st.decoder.finish();
                return Some((Ok(chunk), st));
            }

            let step = tokio::select! {
                biased;
                _ = st.cancel.cancelled() => Step::Cancelled,
                next = st.body.next() => Step::Received(next),
            };

            match step {
                Step::Cancelled => {
                    st.phase = Phase::Finished;
                    return Some((Err(ProviderError::Cancelled), st));
                }
                Step::Received(Some(Ok(bytes))) => {
                    let lines = st.lines.push(bytes.as_ref());
                    st.pending.extend(lines);
                }
                Step::Received(Some(Err(e))) => {
                    st.phase = Phase::Finished;
                    return Some((Err(e), st));
                }
                Step::Received(None) => {
                    st.pending.extend(st.lines.finish());
                    st.phase = Phase::Closed;
                }
            }
        }
    }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{StopReason, TokenUsage};
    use futures_util::stream::iter;

    /// Echoes payload text and counts events
    struct EchoDecoder {
        events: u32,
    }

    impl StreamDecoder for EchoDecoder {
        fn decode(&mut self, payload: &str) -> Result<Option<String>> {
            self.events += 1;
            if payload == "boom" {
                return Err(ProviderError::invalid_response("test", "boom"));
            }
            if payload == "skip" {
                return Ok(None);
            }
            Ok(Some(payload.to_string()))
        }

        fn finish(&mut self) -> StreamChunk {
            StreamChunk::finished(TokenUsage::new(1, self.events), StopReason::EndTurn)
        }
    }

    pub(crate) fn body(parts: &[&str]) -> impl Stream<Item = Result<Vec<u8>>> + Send + Unpin {
        let parts: Vec<Result<Vec<u8>>> = parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        iter(parts)
    }

    async fn collect(stream: ChunkStream) -> Vec<Result<StreamChunk>> {
        stream.collect().await
    }

    #[test]
    fn test_line_buffer_handles_split_frames() {
        let mut buffer = SseLineBuffer::new();
        assert!(buffer.push(b"data: hel").is_empty());
        assert_eq!(buffer.push(b"lo\r\n\ndata: x"), vec!["data: hello".to_string()]);
        assert_eq!(buffer.finish(), Some("data: x".to_string()));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn test_data_payload_spacing() {
        assert_eq!(data_payload("data: {}"), Some("{}"));
        assert_eq!(data_payload("data:{}"), Some("{}"));
        assert_eq!(data_payload("event: ping"), None);
    }

    #[tokio::test]
    async fn test_stream_until_done() {
        let stream = decode_stream(
            body(&["data: a\n", "event: x\ndata: skip\n", "data: b\ndata: [DONE]\ndata: c\n"]),
            EchoDecoder { events: 0 },
            CancellationToken::new(),
        );

        let items = collect(stream).await;
        let chunks: Vec<StreamChunk> = items.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text, "a");
        assert_eq!(chunks[1].text, "b");
        assert!(chunks[2].is_final);
        assert_eq!(chunks[2].usage, Some(TokenUsage::new(1, 3)));
    }

    #[tokio::test]
    async fn test_stream_close_without_sentinel_still_finishes() {
        let stream = decode_stream(body(&["data: a"]), EchoDecoder { events: 0 }, CancellationToken::new());
        let chunks: Vec<StreamChunk> = collect(stream).await.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "a");
        assert!(chunks[1].is_final);
    }

    #[tokio::test]
    async fn test_decoder_error_terminates_without_final() {
        let stream = decode_stream(
            body(&["data: a\ndata: boom\ndata: b\n"]),
            EchoDecoder { events: 0 },
            CancellationToken::new(),
        );
        let items = collect(stream).await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(ProviderError::InvalidResponse { .. })));
    }

    #[tokio::test]
    async fn test_transport_error_terminates_without_final() {
        let parts: Vec<Result<Vec<u8>>> = vec![
            Ok(b"data: a\n".to_vec()),
            Err(ProviderError::Unavailable {
                provider: "test".into(),
                details: "reset".into(),
            }),
            Ok(b"data: b\n".to_vec()),
        ];
        let stream = decode_stream(iter(parts), EchoDecoder { events: 0 }, CancellationToken::new());
        let items = collect(stream).await;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(ProviderError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_stream_yields_no_final_chunk() {
        let cancel = CancellationToken::new();
        let pending = stream::pending::<Result<Vec<u8>>>();
        let mut stream = decode_stream(
            iter(vec![Ok(b"data: a\n".to_vec())]).chain(pending),
            EchoDecoder { events: 0 },
            cancel.clone(),
        );

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.text, "a");

        cancel.cancel();
        assert!(matches!(stream.next().await, Some(Err(ProviderError::Cancelled))));
        assert!(stream.next().await.is_none());
    }
}
