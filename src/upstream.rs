//! Upstream Node Contract
//!
//! A node accepts `{question, max_tokens, timeout_secs}` and streams back
//! partial text followed by exactly one terminal frame (`ok` with usage,
//! `rate_limited` or `error`).
//!
//! `HttpUpstream` speaks this contract over HTTP: the response body is an
//! SSE stream of `data: {json}` lines.

use crate::node::NodeConfig;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Token usage reported by a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// One streaming call's parameters
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamRequest {
    pub question: String,
    pub max_tokens: usize,
    pub timeout_secs: u64,
}

/// A frame received from a node
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamFrame {
    Partial(String),
    Completed(Usage),
    RateLimited { retry_after: Option<Duration> },
    Failed { code: u16, message: String },
}

/// Transport-level failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpstreamError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("HTTP {status}: {body}")]
    Status {
        status: u16,
        retry_after: Option<Duration>,
        body: String,
    },
    #[error("Stream error: {0}")]
    Stream(String),
    #[error("Malformed frame: {0}")]
    Protocol(String),
}

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<UpstreamFrame, UpstreamError>> + Send>>;

/// Something that can open a streaming call against a node
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn open(
        &self,
        node: &NodeConfig,
        request: &UpstreamRequest,
    ) -> Result<FrameStream, UpstreamError>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireFrame {
    Partial { partial_text: String },
    Terminal(WireTerminal),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum WireTerminal {
    Ok {
        #[serde(default)]
        usage: Usage,
    },
    RateLimited {
        #[serde(default)]
        retry_after: Option<f64>,
    },
    Error {
        code: u16,
        #[serde(default)]
        message: String,
    },
}

impl From<WireFrame> for UpstreamFrame {
    fn from(frame: WireFrame) -> Self {
        match frame {
            WireFrame::Partial { partial_text } => UpstreamFrame::Partial(partial_text),
            WireFrame::Terminal(WireTerminal::Ok { usage }) => UpstreamFrame::Completed(usage),
            WireFrame::Terminal(WireTerminal::RateLimited { retry_after }) => {
                UpstreamFrame::RateLimited {
                    retry_after: retry_after
                        .filter(|s| s.is_finite() && *s >= 0.0)
                        .map(Duration::from_secs_f64),
                }
            }
            WireFrame::Terminal(WireTerminal::Error { code, message }) => {
                UpstreamFrame::Failed { code, message }
            }
        }
    }
}

/// Parse one SSE line; `None` for blank lines, comments and non-data fields
fn parse_line(line: &str) -> Option<Result<UpstreamFrame, UpstreamError>> {
    let line = line.trim();
    let data = line.strip_prefix("data:")?.trim();

    if data.is_empty() || data == "[DONE]" {
        return None;
    }

    Some(
        serde_json::from_str::<WireFrame>(data)
            .map(UpstreamFrame::from)
            .map_err(|e| UpstreamError::Protocol(format!("{}: {}", e, truncate(data, 100)))),
    )
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Turn a raw byte stream into frames, buffering across chunk boundaries
pub fn frame_stream<S>(bytes: S) -> impl Stream<Item = Result<UpstreamFrame, UpstreamError>> + Send
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let initial = (Box::pin(bytes), Vec::<u8>::new(), false);

    stream::unfold(initial, |(mut bytes, mut buffer, mut exhausted)| async move {
        loop {
            if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if let Some(frame) = parse_line(&String::from_utf8_lossy(&line)) {
                    return Some((frame, (bytes, buffer, exhausted)));
                }
                continue;
            }

            if exhausted {
                let rest = std::mem::take(&mut buffer);
                if let Some(frame) = parse_line(&String::from_utf8_lossy(&rest)) {
                    return Some((frame, (bytes, buffer, exhausted)));
                }
                return None;
            }

            match bytes.next().await {
                Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    exhausted = true;
                    buffer.clear();
                    return Some((
                        Err(UpstreamError::Stream(e.to_string())),
                        (bytes, buffer, exhausted),
                    ));
                }
                None => exhausted = true,
            }
        }
    })
}

/// Upstream over HTTP + SSE
#[derive(Clone)]
pub struct HttpUpstream {
    client: Client,
}

impl HttpUpstream {
    pub fn new(connect_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self { client })
    }
}

fn retry_after_header(headers: &header::HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn open(
        &self,
        node: &NodeConfig,
        request: &UpstreamRequest,
    ) -> Result<FrameStream, UpstreamError> {
        let url = format!("{}/v1/stream", node.url.trim_end_matches('/'));
        debug!(node = %node.id, "Opening stream: {}", url);

        let response = self
            .client
            .post(&url)
            .header(header::ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_header(response.headers());
            let body = response.text().await.unwrap_or_default();
            if status == StatusCode::TOO_MANY_REQUESTS {
                warn!(node = %node.id, "Node returned 429");
            }
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                retry_after,
                body: truncate(&body, 200).to_string(),
            });
        }

        Ok(Box::pin(frame_stream(response.bytes_stream())))
    }
}
