//! SSE decoding for streamed chat completions.
//!
//! [`SseDecoder`] buffers raw bytes across chunk boundaries, reassembles
//! complete lines, and pulls `choices[0].delta.content` out of every
//! `data:` line until `data: [DONE]`. [`fragment_stream`] turns an upstream
//! byte stream into a [`FragmentStream`].

use std::collections::VecDeque;

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};

use super::{FragmentStream, ProviderError};

/// Lines longer than this without a newline are discarded.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Incremental SSE → text fragment decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `data: [DONE]` has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed one chunk of bytes; returns the fragments completed by it.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut fragments = Vec::new();
        if self.done {
            return fragments;
        }

        self.buffer.extend_from_slice(bytes);

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(fragment) = self.process_line(&line) {
                fragments.push(fragment);
            }
            if self.done {
                self.buffer.clear();
                return fragments;
            }
        }

        if self.buffer.len() > MAX_LINE_BYTES {
            tracing::warn!(
                buffered = self.buffer.len(),
                "SSE line exceeded buffer cap, discarding"
            );
            self.buffer.clear();
        }

        fragments
    }

    /// Flush a trailing line that had no newline.
    pub fn finish(&mut self) -> Vec<String> {
        if self.done || self.buffer.is_empty() {
            return Vec::new();
        }
        let line = std::mem::take(&mut self.buffer);
        self.process_line(&line).into_iter().collect()
    }

    fn process_line(&mut self, raw: &[u8]) -> Option<String> {
        let line = std::str::from_utf8(raw).ok()?.trim_end_matches(['\r', '\n']);
        let data = line.strip_prefix("data:")?.trim_start();

        if data == "[DONE]" {
            self.done = true;
            return None;
        }

        let parsed: serde_json::Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "skipping malformed SSE data line");
                return None;
            }
        };

        parsed
            .get("choices")?
            .get(0)?
            .get("delta")?
            .get("content")?
            .as_str()
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

struct StreamState {
    bytes: BoxStream<'static, Result<Bytes, reqwest::Error>>,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    finished: bool,
}

/// Adapt an upstream SSE byte stream into text fragments.
///
/// A transport error ends the stream after yielding the error.
pub fn fragment_stream<S>(bytes: S) -> FragmentStream
where
    S: futures::Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let state = StreamState {
        bytes: bytes.boxed(),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(fragment) = state.pending.pop_front() {
                return Some((Ok(fragment), state));
            }
            if state.finished || state.decoder.is_done() {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let fragments = state.decoder.push(&chunk);
                    state.pending.extend(fragments);
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(ProviderError::from(e)), state));
                }
                None => {
                    let fragments = state.decoder.finish();
                    state.pending.extend(fragments);
                    state.finished = true;
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}]})
        )
    }

    #[test]
    fn test_single_chunk() {
        let raw = format!("{}{}data: [DONE]\n\n", delta("Hello"), delta(" world"));
        let mut decoder = SseDecoder::new();
        let fragments = decoder.push(raw.as_bytes());
        assert_eq!(fragments, vec!["Hello".to_string(), " world".to_string()]);
        assert!(decoder.is_done());
    }

    #[test]
    fn test_split_across_chunks() {
        let raw = format!("{}{}data: [DONE]\n\n", delta("Hel"), delta("lo"));
        let bytes = raw.as_bytes();
        let mut decoder = SseDecoder::new();
        let mut fragments = Vec::new();
        for chunk in bytes.chunks(7) {
            fragments.extend(decoder.push(chunk));
        }
        assert_eq!(fragments.concat(), "Hello");
        assert!(decoder.is_done());
    }

    #[test]
    fn test_role_only_and_malformed_lines_skipped() {
        let raw = "event: message\n: comment\ndata: {not json}\n\ndata: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n";
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(raw.as_bytes()).is_empty());
        assert!(!decoder.is_done());
    }

    #[test]
    fn test_crlf_and_no_space() {
        let raw = "data:{\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\r\n\r\ndata:[DONE]\r\n";
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.push(raw.as_bytes()), vec!["ok".to_string()]);
        assert!(decoder.is_done());
    }

    #[test]
    fn test_finish_flushes_trailing_line() {
        let raw = "data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}";
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(raw.as_bytes()).is_empty());
        assert_eq!(decoder.finish(), vec!["tail".to_string()]);
    }

    #[test]
    fn test_ignores_data_after_done() {
        let raw = format!("data: [DONE]\n\n{}", delta("late"));
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(raw.as_bytes()).is_empty());
        assert!(decoder.push(delta("later").as_bytes()).is_empty());
    }

    #[test]
    fn test_buffer_cap() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&vec![b'x'; 65 * 1024]).is_empty());
        assert_eq!(decoder.push(delta("ok").as_bytes()), vec!["ok".to_string()]);
    }

    #[tokio::test]
    async fn test_fragment_stream() {
        let raw = format!("{}{}data: [DONE]\n\n", delta("a"), delta("b"));
        let (first, second) = raw.split_at(10);
        let chunks: Vec<Result<Bytes, reqwest::Error>> = vec![
            Ok(Bytes::from(first.to_string())),
            Ok(Bytes::from(second.to_string())),
        ];
        let fragments: Vec<String> = fragment_stream(futures::stream::iter(chunks))
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(fragments, vec!["a".to_string(), "b".to_string()]);
    }
}
