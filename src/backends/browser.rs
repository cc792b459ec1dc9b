//! Browser-session reverse proxy client.
//!
//! Talks to a reverse proxy that fronts the consumer chat web app using a
//! browser session access token. The proxy owns the conversation: the relay
//! only forwards `conversation_id` / `parent_message_id` from the previous
//! turn. Replies arrive as an SSE stream where every `data:` event carries
//! the full message so far; the last one before `[DONE]` is the answer.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::StreamExt as _;
use reqwest::{header, Client};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::{abortable, BackendReply, ChatBackend};
use crate::{config::BrowserConfig, model::Turn};

/// Reply in the browser proxy's shape.
#[derive(Debug, Clone, PartialEq)]
pub struct BrowserReply {
    pub message_id: String,
    pub conversation_id: Option<String>,
    pub response: String,
}

/// Client bound to one reverse-proxy URL.
pub struct BrowserProxy {
    client: Client,
    url: String,
    model: String,
}

impl BrowserProxy {
    pub fn new(cfg: &BrowserConfig, url: String) -> anyhow::Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("text/event-stream"));
        if let Some(token) = cfg.access_token() {
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&format!("Bearer {token}"))
                    .context("invalid access token value for Authorization header")?,
            );
        }
        if let Some(cookies) = cfg.cookies() {
            headers.insert(
                header::COOKIE,
                header::HeaderValue::from_str(&cookies).context("invalid Cookie header value")?,
            );
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .context("building reqwest client")?;

        Ok(Self { client, url, model: cfg.model.clone() })
    }

    /// POST the turn and read the SSE stream until `[DONE]`.
    ///
    /// Returns the last event that carried a message.
    async fn conversation(&self, body: Value) -> anyhow::Result<Value> {
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("browser proxy returned HTTP {status}: {text}");
        }

        let mut stream = response.bytes_stream();
        let mut lines = LineBuffer::default();
        let mut last = None;
        let mut done = false;

        'read: while let Some(chunk) = stream.next().await {
            lines.push(&chunk.context("reading browser proxy stream")?);
            while let Some(line) = lines.next_line() {
                if read_line(&line, &mut last)? {
                    done = true;
                    break 'read;
                }
            }
        }
        // The proxy may close without terminating its last line.
        if !done {
            if let Some(line) = lines.finish() {
                read_line(&line, &mut last)?;
            }
        }

        last.context("browser proxy stream ended without a reply")
    }
}

/// Fold one SSE line into `last`. Returns `true` on `[DONE]`.
fn read_line(line: &str, last: &mut Option<Value>) -> anyhow::Result<bool> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(false);
    };
    let data = data.trim_start_matches(' ');
    if data.trim() == "[DONE]" {
        return Ok(true);
    }
    if let Some(event) = parse_event(data)? {
        *last = Some(event);
    }
    Ok(false)
}

#[async_trait]
impl ChatBackend for BrowserProxy {
    async fn send(&self, turn: &Turn, cancel: &CancellationToken) -> anyhow::Result<BackendReply> {
        // Resume only when both ids came back from the previous turn.
        let (conversation_id, parent_message_id) =
            match (&turn.continuation.msg_id, &turn.continuation.conversation_id) {
                (Some(msg_id), Some(conversation_id)) => {
                    (Some(conversation_id.clone()), msg_id.clone())
                }
                _ => (None, Uuid::new_v4().to_string()),
            };

        let mut body = json!({
            "action": "next",
            "messages": [{
                "id": Uuid::new_v4().to_string(),
                "role": "user",
                "content": { "content_type": "text", "parts": [turn.prompt] },
            }],
            "model": self.model,
            "parent_message_id": parent_message_id,
        });
        if let (Some(id), Some(obj)) = (&conversation_id, body.as_object_mut()) {
            obj.insert("conversation_id".into(), Value::String(id.clone()));
        }

        debug!(url = %self.url, resumed = conversation_id.is_some(), "sending to browser proxy");
        let event = abortable(cancel, self.conversation(body)).await?;

        let message_id = event
            .pointer("/message/id")
            .and_then(Value::as_str)
            .context("browser proxy reply has no message id")?
            .to_string();
        let response = event
            .pointer("/message/content/parts/0")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let conversation_id = event
            .get("conversation_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .or(conversation_id);

        Ok(BackendReply::Browser(BrowserReply { message_id, conversation_id, response }))
    }
}

/// Parse one `data:` payload.
///
/// Returns `Ok(None)` for payloads that carry no message (keep-alives,
/// non-JSON noise) and an error when the proxy reports one.
fn parse_event(data: &str) -> anyhow::Result<Option<Value>> {
    let Ok(event) = serde_json::from_str::<Value>(data) else {
        return Ok(None);
    };
    match event.get("error") {
        None | Some(Value::Null) => {}
        Some(Value::String(s)) if s.is_empty() => {}
        Some(Value::String(s)) => anyhow::bail!("browser proxy error: {s}"),
        Some(other) => anyhow::bail!("browser proxy error: {other}"),
    }
    if event.get("message").is_some_and(Value::is_object) {
        Ok(Some(event))
    } else {
        Ok(None)
    }
}

/// Splits a byte stream into `\n`-terminated lines.
///
/// Bytes are buffered until a full line is available so multi-byte UTF-8
/// sequences split across chunks decode intact.
#[derive(Default)]
struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let line = self.buf.split_to(pos + 1);
        let text = String::from_utf8_lossy(&line[..pos]);
        Some(text.trim_end_matches('\r').to_string())
    }

    /// Whatever is left once the stream has ended, if it is not blank.
    fn finish(&mut self) -> Option<String> {
        let rest = self.buf.split();
        let text = String::from_utf8_lossy(&rest);
        let text = text.trim_end_matches(['\r', '\n']);
        (!text.trim().is_empty()).then(|| text.to_string())
    }
}
