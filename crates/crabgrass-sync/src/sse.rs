use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;

use crabgrass_types::EntityRef;

use crate::api::{build_stream_client, error_detail};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};

/// Event name SSE assigns to frames without an `event:` field.
pub const DEFAULT_EVENT_NAME: &str = "message";

/// One dispatched SSE frame, before typed decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

impl SseFrame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }
}

pub type FrameStream = BoxStream<'static, Result<SseFrame>>;

/// Opens the push connection for one entity. The returned stream ends (or
/// yields an error) when the transport drops; reconnecting is the caller's
/// job.
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn open(&self, entity: &EntityRef) -> Result<FrameStream>;
}

/// Incremental SSE decoder.
///
/// Bytes may arrive split anywhere, including inside a UTF-8 sequence or
/// between the `\r` and `\n` of a CRLF pair.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending_bytes: Vec<u8>,
    text: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.pending_bytes.extend_from_slice(bytes);
        self.decode_pending_utf8();
        self.drain_frames()
    }

    fn decode_pending_utf8(&mut self) {
        loop {
            match std::str::from_utf8(&self.pending_bytes) {
                Ok(valid) => {
                    self.text.push_str(valid);
                    self.pending_bytes.clear();
                    return;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    if let Ok(valid) = std::str::from_utf8(&self.pending_bytes[..valid_up_to]) {
                        self.text.push_str(valid);
                    }
                    match err.error_len() {
                        // Truncated sequence; wait for the rest.
                        None => {
                            self.pending_bytes.drain(..valid_up_to);
                            return;
                        }
                        Some(bad_len) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            self.pending_bytes.drain(..valid_up_to + bad_len);
                        }
                    }
                }
            }
        }
    }

    fn drain_frames(&mut self) -> Vec<SseFrame> {
        if self.text.contains("\r\n") {
            self.text = self.text.replace("\r\n", "\n");
        }

        let mut frames = Vec::new();
        while let Some(end_idx) = self.text.find("\n\n") {
            let block: String = self.text.drain(..end_idx + 2).collect();
            if let Some(frame) = parse_block(&block[..end_idx]) {
                frames.push(frame);
            }
        }
        frames
    }
}

/// Parses one blank-line-delimited block. Comment-only blocks (keep-alives)
/// and blocks without `data:` yield nothing.
fn parse_block(block: &str) -> Option<SseFrame> {
    let mut event: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.split('\n') {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.trim().to_string()),
            "data" => data_lines.push(value),
            _ => {}
        }
    }

    if data_lines.is_empty() {
        return None;
    }

    Some(SseFrame {
        event: event
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| DEFAULT_EVENT_NAME.to_string()),
        data: data_lines.join("\n"),
    })
}

/// `GET {base}/api/{ideas|objectives}/{id}/events` over reqwest.
pub struct HttpEventTransport {
    client: Client,
    base_url: String,
}

impl HttpEventTransport {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        Ok(Self {
            client: build_stream_client(config.dev_user.as_deref())?,
            base_url: config.base_url.clone(),
        })
    }
}

#[async_trait]
impl EventTransport for HttpEventTransport {
    async fn open(&self, entity: &EntityRef) -> Result<FrameStream> {
        let url = format!("{}{}", self.base_url, entity.events_path());
        tracing::debug!("Subscribing to events at: {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SyncError::Transport(format!("Failed to subscribe to events: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Http {
                status: status.as_u16(),
                detail: error_detail(status.as_u16(), &body),
            });
        }

        let stream = response.bytes_stream();

        Ok(async_stream::stream! {
            let mut decoder = SseDecoder::new();

            futures::pin_mut!(stream);

            while let Some(chunk_result) = stream.next().await {
                match chunk_result {
                    Ok(chunk) => {
                        for frame in decoder.push(&chunk) {
                            yield Ok(frame);
                        }
                    }
                    Err(e) => {
                        yield Err(SyncError::Transport(format!("Stream error: {}", e)));
                        break;
                    }
                }
            }
            tracing::debug!("SSE stream ended");
        }
        .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_event() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"event: connected\ndata: {\"idea_id\":\"42\"}\n\n");
        assert_eq!(
            frames,
            vec![SseFrame::new("connected", "{\"idea_id\":\"42\"}")]
        );
    }

    #[test]
    fn handles_crlf_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder
            .push(b"event: file_saved\r\ndata: {\"file_type\":\"summary\"}\r")
            .is_empty());
        let frames = decoder.push(b"\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "file_saved");
        assert_eq!(frames[0].data, "{\"file_type\":\"summary\"}");
    }

    #[test]
    fn skips_keepalive_comments_without_stalling() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b": keepalive\n\nevent: agent_edit_stream_chunk\ndata: {\"edit_id\":\"e1\",\"content\":\"Hel\"}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "agent_edit_stream_chunk");
    }

    #[test]
    fn joins_multiline_data() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"data:first\ndata: second\n\n");
        assert_eq!(frames, vec![SseFrame::new("message", "first\nsecond")]);
    }

    #[test]
    fn reassembles_utf8_split_mid_character() {
        let payload = "event: agent_message\ndata: {\"content\":\"caf\u{e9}\"}\n\n".as_bytes();
        let split = payload
            .iter()
            .position(|b| *b == 0xC3)
            .expect("multi-byte lead")
            + 1;
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&payload[..split]).is_empty());
        let frames = decoder.push(&payload[split..]);
        assert_eq!(frames[0].data, "{\"content\":\"caf\u{e9}\"}");
    }

    #[test]
    fn event_without_data_is_ignored() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: connected\n\n").is_empty());
    }
}
