// Upstream event-stream decoder
//
// The conversation endpoint replies with binary event-stream frames: a
// 12-byte prelude (total length, headers length, prelude CRC), the headers,
// a UTF-8 JSON payload, and a trailing message CRC. Each payload decodes
// into the `QStreamEvent` union, which classifies into the typed deltas the
// re-emitters consume. Inline <thinking> markers are tokenised out of the
// text stream here, surviving frame boundaries.

use bytes::{Buf, BytesMut};
use futures::stream::{Stream, StreamExt};
use std::collections::HashSet;

use crate::error::ApiError;
use crate::models::q::QStreamEvent;

/// Upper bound on a single frame payload
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

/// Prelude (12 bytes) plus trailing message CRC (4 bytes)
const FRAME_OVERHEAD: usize = 16;

/// One decoded upstream delta
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    Text(String),
    Thinking(String),
    ToolUseStart { id: String, name: String },
    ToolUseArgFragment { id: String, fragment: String },
    ToolUseStop { id: String },
    Abort { reason: String, message: String },
}

// ==================================================================================================
// Frame Decoding
// ==================================================================================================

/// Incremental event-stream frame decoder.
///
/// Bytes go in as they arrive from the socket; complete frame payloads come
/// out. CRCs are skipped, not verified.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pops the next complete frame payload, if one is buffered
    pub fn next_payload(&mut self) -> Result<Option<Vec<u8>>, ApiError> {
        if self.buf.len() < 12 {
            return Ok(None);
        }

        let total_len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
            as usize;
        let headers_len =
            u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;

        if total_len < FRAME_OVERHEAD + headers_len {
            return Err(ApiError::Decode(format!(
                "invalid frame lengths: total={} headers={}",
                total_len, headers_len
            )));
        }

        let payload_len = total_len - FRAME_OVERHEAD - headers_len;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(ApiError::Decode(format!(
                "frame payload too large: {} bytes",
                payload_len
            )));
        }

        if self.buf.len() < total_len {
            return Ok(None);
        }

        let payload_start = 12 + headers_len;
        let payload = self.buf[payload_start..payload_start + payload_len].to_vec();
        self.buf.advance(total_len);

        Ok(Some(payload))
    }
}

// ==================================================================================================
// Thinking Tag Splitting
// ==================================================================================================

const THINKING_OPEN: &str = "<thinking>";
const THINKING_CLOSE: &str = "</thinking>";

/// Splits a text stream on inline <thinking> markers.
///
/// A single `in_thinking` flag tracks which side of the marker we are on.
/// Markers can straddle frame boundaries, so up to one marker length minus a
/// byte of trailing text is held back until the next feed decides whether it
/// completes a marker.
#[derive(Debug, Default)]
pub struct ThinkingSplitter {
    in_thinking: bool,
    pending: String,
}

impl ThinkingSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<Delta> {
        self.pending.push_str(chunk);

        let mut out = Vec::new();
        loop {
            let marker = if self.in_thinking {
                THINKING_CLOSE
            } else {
                THINKING_OPEN
            };

            if let Some(idx) = self.pending.find(marker) {
                if idx > 0 {
                    out.push(self.wrap(self.pending[..idx].to_string()));
                }
                self.pending.drain(..idx + marker.len());
                self.in_thinking = !self.in_thinking;
                continue;
            }

            // No complete marker; hold back any suffix that could be the
            // start of one and flush the rest.
            let keep = trailing_marker_prefix_len(&self.pending, marker);
            let flush_len = self.pending.len() - keep;
            if flush_len > 0 {
                let flushed: String = self.pending.drain(..flush_len).collect();
                out.push(self.wrap(flushed));
            }
            break;
        }

        out
    }

    /// Flushes held-back bytes at end of stream
    pub fn finish(&mut self) -> Vec<Delta> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        let rest = std::mem::take(&mut self.pending);
        vec![self.wrap(rest)]
    }

    fn wrap(&self, text: String) -> Delta {
        if self.in_thinking {
            Delta::Thinking(text)
        } else {
            Delta::Text(text)
        }
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `marker`
fn trailing_marker_prefix_len(text: &str, marker: &str) -> usize {
    let max = (marker.len() - 1).min(text.len());
    for k in (1..=max).rev() {
        if text.ends_with(&marker[..k]) {
            return k;
        }
    }
    0
}

// ==================================================================================================
// Delta Decoding
// ==================================================================================================

/// Full pipeline from raw socket bytes to typed deltas.
///
/// With `split_thinking` disabled, text passes through verbatim (tags
/// included) - the aggregating paths tokenise blocks themselves.
#[derive(Debug)]
pub struct DeltaDecoder {
    frames: FrameDecoder,
    splitter: Option<ThinkingSplitter>,
    seen_tools: HashSet<String>,
}

impl DeltaDecoder {
    pub fn new(split_thinking: bool) -> Self {
        Self {
            frames: FrameDecoder::new(),
            splitter: split_thinking.then(ThinkingSplitter::new),
            seen_tools: HashSet::new(),
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Delta>, ApiError> {
        self.frames.push(chunk);

        let mut out = Vec::new();
        while let Some(payload) = self.frames.next_payload()? {
            let event: QStreamEvent = serde_json::from_slice(&payload).map_err(|e| {
                ApiError::Decode(format!("malformed frame payload: {}", e))
            })?;
            self.classify(event, &mut out);
        }
        Ok(out)
    }

    /// Flushes any held-back text at end of stream
    pub fn finish(&mut self) -> Vec<Delta> {
        match &mut self.splitter {
            Some(splitter) => splitter.finish(),
            None => Vec::new(),
        }
    }

    fn classify(&mut self, event: QStreamEvent, out: &mut Vec<Delta>) {
        if !event.content.is_empty() {
            match &mut self.splitter {
                Some(splitter) => out.extend(splitter.feed(&event.content)),
                None => out.push(Delta::Text(event.content)),
            }
        } else if !event.tool_use_id.is_empty() {
            if self.seen_tools.insert(event.tool_use_id.clone()) {
                out.push(Delta::ToolUseStart {
                    id: event.tool_use_id.clone(),
                    name: event.name.clone(),
                });
            }
            if !event.input.is_empty() {
                out.push(Delta::ToolUseArgFragment {
                    id: event.tool_use_id.clone(),
                    fragment: event.input,
                });
            }
            if event.stop {
                out.push(Delta::ToolUseStop {
                    id: event.tool_use_id,
                });
            }
        } else if !event.reason.is_empty() {
            out.push(Delta::Abort {
                reason: event.reason,
                message: event.message,
            });
        } else if !event.conversation_id.is_empty() || !event.utterance_id.is_empty() {
            // Metadata frames carry nothing the clients need.
            tracing::debug!(
                "metadata frame: conversation_id={}, utterance_id={}",
                event.conversation_id,
                event.utterance_id
            );
        }
    }
}

/// Turns an upstream response body into a pull-based delta stream
pub fn delta_stream(
    response: reqwest::Response,
    split_thinking: bool,
) -> impl Stream<Item = Result<Delta, ApiError>> {
    async_stream::try_stream! {
        let mut decoder = DeltaDecoder::new(split_thinking);
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = chunk
                .map_err(|e| ApiError::Internal(anyhow::anyhow!("upstream read error: {}", e)))?;
            for delta in decoder.feed(&chunk)? {
                yield delta;
            }
        }

        for delta in decoder.finish() {
            yield delta;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    /// Wraps a JSON payload in event-stream framing (CRCs zeroed)
    pub fn frame(payload: &serde_json::Value) -> Vec<u8> {
        let json_bytes = serde_json::to_vec(payload).unwrap();
        let total_len = FRAME_OVERHEAD + json_bytes.len();

        let mut buf = BytesMut::with_capacity(total_len);
        buf.put_u32(total_len as u32);
        buf.put_u32(0); // headers length
        buf.put_u32(0); // prelude CRC
        buf.put_slice(&json_bytes);
        buf.put_u32(0); // message CRC
        buf.to_vec()
    }

    #[test]
    fn test_frame_decoder_single_frame() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&frame(&serde_json::json!({"content": "hi"})));

        let payload = decoder.next_payload().unwrap().unwrap();
        assert_eq!(payload, br#"{"content":"hi"}"#);
        assert!(decoder.next_payload().unwrap().is_none());
    }

    #[test]
    fn test_frame_decoder_partial_frames() {
        let mut decoder = FrameDecoder::new();
        let bytes = frame(&serde_json::json!({"content": "split"}));

        decoder.push(&bytes[..7]);
        assert!(decoder.next_payload().unwrap().is_none());

        decoder.push(&bytes[7..]);
        let payload = decoder.next_payload().unwrap().unwrap();
        assert_eq!(payload, br#"{"content":"split"}"#);
    }

    #[test]
    fn test_frame_decoder_multiple_frames_one_chunk() {
        let mut decoder = FrameDecoder::new();
        let mut bytes = frame(&serde_json::json!({"content": "a"}));
        bytes.extend(frame(&serde_json::json!({"content": "b"})));
        decoder.push(&bytes);

        assert!(decoder.next_payload().unwrap().is_some());
        assert!(decoder.next_payload().unwrap().is_some());
        assert!(decoder.next_payload().unwrap().is_none());
    }

    #[test]
    fn test_frame_decoder_rejects_bad_lengths() {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();
        buf.put_u32(8); // total shorter than the fixed overhead
        buf.put_u32(0);
        buf.put_u32(0);
        decoder.push(&buf);

        assert!(decoder.next_payload().is_err());
    }

    #[test]
    fn test_frame_decoder_rejects_oversized_payload() {
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();
        buf.put_u32((FRAME_OVERHEAD + MAX_PAYLOAD_LEN + 1) as u32);
        buf.put_u32(0);
        buf.put_u32(0);
        decoder.push(&buf);

        assert!(decoder.next_payload().is_err());
    }

    #[test]
    fn test_splitter_plain_text() {
        let mut splitter = ThinkingSplitter::new();
        let deltas = splitter.feed("just words");
        // "just words" ends with no marker prefix, so everything flushes
        assert_eq!(deltas, vec![Delta::Text("just words".to_string())]);
        assert!(splitter.finish().is_empty());
    }

    #[test]
    fn test_splitter_single_chunk_roundtrip() {
        let mut splitter = ThinkingSplitter::new();
        let mut deltas = splitter.feed("a<thinking>b</thinking>c");
        deltas.extend(splitter.finish());
        assert_eq!(
            deltas,
            vec![
                Delta::Text("a".to_string()),
                Delta::Thinking("b".to_string()),
                Delta::Text("c".to_string()),
            ]
        );
    }

    #[test]
    fn test_splitter_marker_across_frames() {
        // "hel<thi" + "nking>ok</thinking>bye"
        let mut splitter = ThinkingSplitter::new();
        let mut deltas = splitter.feed("hel<thi");
        deltas.extend(splitter.feed("nking>ok</thinking>bye"));
        deltas.extend(splitter.finish());

        assert_eq!(
            deltas,
            vec![
                Delta::Text("hel".to_string()),
                Delta::Thinking("ok".to_string()),
                Delta::Text("bye".to_string()),
            ]
        );
    }

    #[test]
    fn test_splitter_false_marker_prefix_flushed() {
        let mut splitter = ThinkingSplitter::new();
        let mut deltas = splitter.feed("a<th");
        // "<th" is held back as a possible marker start
        assert_eq!(deltas, vec![Delta::Text("a".to_string())]);

        deltas = splitter.feed("ree words");
        assert_eq!(deltas, vec![Delta::Text("<three words".to_string())]);
    }

    #[test]
    fn test_splitter_unterminated_thinking_flushes_at_eof() {
        let mut splitter = ThinkingSplitter::new();
        let mut deltas = splitter.feed("<thinking>never closed");
        deltas.extend(splitter.finish());
        assert_eq!(
            deltas,
            vec![Delta::Thinking("never closed".to_string())]
        );
    }

    #[test]
    fn test_delta_decoder_tool_lifecycle() {
        let mut decoder = DeltaDecoder::new(true);
        let mut bytes = frame(&serde_json::json!({"toolUseId": "t1", "name": "f"}));
        bytes.extend(frame(&serde_json::json!({"toolUseId": "t1", "input": "{\"x\":"})));
        bytes.extend(frame(&serde_json::json!({"toolUseId": "t1", "input": "1}"})));
        bytes.extend(frame(&serde_json::json!({"toolUseId": "t1", "stop": true})));

        let deltas = decoder.feed(&bytes).unwrap();
        assert_eq!(
            deltas,
            vec![
                Delta::ToolUseStart {
                    id: "t1".to_string(),
                    name: "f".to_string()
                },
                Delta::ToolUseArgFragment {
                    id: "t1".to_string(),
                    fragment: "{\"x\":".to_string()
                },
                Delta::ToolUseArgFragment {
                    id: "t1".to_string(),
                    fragment: "1}".to_string()
                },
                Delta::ToolUseStop {
                    id: "t1".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_delta_decoder_start_only_once_per_id() {
        let mut decoder = DeltaDecoder::new(true);
        let mut bytes = frame(&serde_json::json!({"toolUseId": "t1", "name": "f", "input": "{"}));
        bytes.extend(frame(&serde_json::json!({"toolUseId": "t1", "name": "f", "input": "}"})));

        let deltas = decoder.feed(&bytes).unwrap();
        let starts = deltas
            .iter()
            .filter(|d| matches!(d, Delta::ToolUseStart { .. }))
            .count();
        assert_eq!(starts, 1);
    }

    #[test]
    fn test_delta_decoder_abort() {
        let mut decoder = DeltaDecoder::new(true);
        let bytes = frame(
            &serde_json::json!({"reason": "INVALID_STATE", "message": "conversation too long"}),
        );

        let deltas = decoder.feed(&bytes).unwrap();
        assert_eq!(
            deltas,
            vec![Delta::Abort {
                reason: "INVALID_STATE".to_string(),
                message: "conversation too long".to_string()
            }]
        );
    }

    #[test]
    fn test_delta_decoder_metadata_ignored() {
        let mut decoder = DeltaDecoder::new(true);
        let bytes = frame(&serde_json::json!({"conversation_id": "c1", "utterance_id": "u1"}));
        assert!(decoder.feed(&bytes).unwrap().is_empty());
    }

    #[test]
    fn test_delta_decoder_malformed_payload() {
        let mut decoder = DeltaDecoder::new(true);
        let json_bytes = b"not json";
        let mut buf = BytesMut::new();
        buf.put_u32((FRAME_OVERHEAD + json_bytes.len()) as u32);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_slice(json_bytes);
        buf.put_u32(0);

        assert!(decoder.feed(&buf).is_err());
    }

    #[test]
    fn test_delta_decoder_no_split_keeps_tags() {
        let mut decoder = DeltaDecoder::new(false);
        let bytes = frame(&serde_json::json!({"content": "a<thinking>b</thinking>c"}));

        let deltas = decoder.feed(&bytes).unwrap();
        assert_eq!(
            deltas,
            vec![Delta::Text("a<thinking>b</thinking>c".to_string())]
        );
    }
}
