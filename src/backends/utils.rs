//! Shared plumbing used by multiple backend providers.

use futures::StreamExt;

use super::types::DispatchError;
use crate::session::AnswerSink;

/// Sentinel the upstream APIs send as the final SSE frame.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Incremental server-sent-events parser.
///
/// Collects `data:` field payloads frame by frame. Chunks arrive at
/// arbitrary byte boundaries, so state is kept across `push` calls. Only the
/// `data` field matters to us; comments and other fields are skipped.
#[derive(Default)]
pub struct SseParser {
    buffer: String,
    data_lines: Vec<String>,
}

impl SseParser {
    /// Feed a chunk, returning the payloads of every frame completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                // Blank line terminates a frame.
                if !self.data_lines.is_empty() {
                    frames.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
            } else if let Some(data) = line.strip_prefix("data:") {
                self.data_lines.push(data.strip_prefix(' ').unwrap_or(data).to_string());
            }
            // event:, id:, retry: and comment lines are ignored.
        }
        frames
    }

    /// Flush a trailing frame that was never terminated by a blank line.
    pub fn finish(&mut self) -> Option<String> {
        self.buffer.clear();
        if self.data_lines.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.data_lines).join("\n"))
        }
    }
}

/// Map an upstream error response onto the taxonomy and pass success
/// through. The body text is folded into the backend error so the caller
/// sees what the API actually said.
pub async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, DispatchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        reqwest::StatusCode::UNAUTHORIZED => Err(DispatchError::Unauthorized),
        reqwest::StatusCode::FORBIDDEN => Err(DispatchError::Blocked),
        _ => {
            let body = response.text().await.unwrap_or_default();
            let detail = body.trim();
            if detail.is_empty() {
                Err(DispatchError::Backend(format!("upstream returned {}", status)))
            } else {
                Err(DispatchError::Backend(format!(
                    "upstream returned {}: {}",
                    status, detail
                )))
            }
        }
    }
}

/// Drive an SSE response body into the sink until the stream ends or the
/// upstream sends its done sentinel. Frames that are not JSON are skipped
/// (keep-alives, vendor noise), not fatal.
pub async fn relay_sse(
    response: reqwest::Response,
    sink: &AnswerSink,
) -> Result<(), DispatchError> {
    let mut stream = response.bytes_stream();
    let mut parser = SseParser::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(DispatchError::backend)?;
        for payload in parser.push(&chunk) {
            if payload == DONE_SENTINEL {
                return Ok(());
            }
            relay_payload(&payload, sink).await?;
        }
    }
    if let Some(payload) = parser.finish() {
        if payload != DONE_SENTINEL {
            relay_payload(&payload, sink).await?;
        }
    }
    Ok(())
}

async fn relay_payload(payload: &str, sink: &AnswerSink) -> Result<(), DispatchError> {
    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(event) => sink.relay(event).await,
        Err(_) => {
            log::debug!("skipping non-JSON stream frame: {}", payload);
            Ok(())
        }
    }
}
