//! Streaming Call Executor
//!
//! Runs one attempt: opens a streaming call to a node and yields its chunks
//! lazily. The sequence is finite (it ends right after `Finished` or
//! `Failed`) and not restartable; a retry means a new `execute` call.
//!
//! Two clocks bound an attempt: the profile's wall-clock timeout and the
//! chunk timeout (longest tolerated silence between chunks). Either one
//! firing ends the attempt as `Timeout`.
//!
//! On completion the executor folds the outcome into the node's health and,
//! on success, spends the attempt's commit token on the ledger.

use crate::classifier::ComplexityProfile;
use crate::error::GatewayError;
use crate::ledger::{BudgetLedger, CommitToken, ModelPricing};
use crate::node::{NodeConfig, NodeId, NodeRegistry};
use crate::upstream::{FrameStream, Upstream, UpstreamError, UpstreamFrame, UpstreamRequest, Usage};
use futures_util::stream::{self, Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};
use uuid::Uuid;

/// Unique id of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptId(Uuid);

impl AttemptId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Output of one attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    Delta(String),
    Finished { usage: Usage, cost_usd: f64 },
    Failed(GatewayError),
}

pub type AttemptStream = Pin<Box<dyn Stream<Item = Chunk> + Send>>;

/// Executes attempts against nodes
#[derive(Clone)]
pub struct Executor {
    upstream: Arc<dyn Upstream>,
    registry: Arc<NodeRegistry>,
    ledger: Arc<BudgetLedger>,
}

struct AttemptState {
    upstream: Arc<dyn Upstream>,
    registry: Arc<NodeRegistry>,
    ledger: Arc<BudgetLedger>,
    attempt: AttemptId,
    commit: Option<CommitToken>,
    node: NodeId,
    config: NodeConfig,
    request: UpstreamRequest,
    started: Instant,
    deadline: Instant,
    chunk_timeout: Duration,
    frames: Option<FrameStream>,
    done: bool,
}

impl Executor {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        registry: Arc<NodeRegistry>,
        ledger: Arc<BudgetLedger>,
    ) -> Self {
        Self {
            upstream,
            registry,
            ledger,
        }
    }

    /// Start one attempt; nothing is sent until the stream is polled
    pub fn execute(&self, node: NodeId, question: &str, profile: &ComplexityProfile) -> AttemptStream {
        let started = Instant::now();
        let attempt = AttemptId::new();
        let state = AttemptState {
            upstream: self.upstream.clone(),
            registry: self.registry.clone(),
            ledger: self.ledger.clone(),
            attempt,
            commit: Some(CommitToken::new(attempt)),
            node,
            config: self.registry.config(node).clone(),
            request: UpstreamRequest {
                question: question.to_string(),
                max_tokens: profile.max_tokens,
                timeout_secs: profile.timeout.as_secs(),
            },
            started,
            deadline: started + profile.timeout,
            chunk_timeout: profile.chunk_timeout,
            frames: None,
            done: false,
        };

        Box::pin(stream::unfold(state, |mut state| async move {
            let chunk = state.next_chunk().await?;
            Some((chunk, state))
        }))
    }
}

impl AttemptState {
    async fn next_chunk(&mut self) -> Option<Chunk> {
        if self.done {
            return None;
        }

        if self.frames.is_none() {
            self.registry.record_attempt(self.node);
            info!(node = %self.config.id, attempt = %self.attempt, "Attempt started");

            match timeout_at(self.deadline, self.upstream.open(&self.config, &self.request)).await {
                Err(_) => return Some(self.fail(self.timeout_error())),
                Ok(Err(e)) => return Some(self.fail(self.transport_error(e))),
                Ok(Ok(frames)) => self.frames = Some(frames),
            }
        }

        loop {
            let Some(frames) = self.frames.as_mut() else {
                return None;
            };

            let wait_until = (Instant::now() + self.chunk_timeout).min(self.deadline);
            let next = timeout_at(wait_until, frames.next()).await;

            match next {
                Err(_) => return Some(self.fail(self.timeout_error())),
                Ok(None) => {
                    return Some(self.fail(GatewayError::TransientUpstream {
                        node: self.config.id.clone(),
                        message: "stream ended without a terminal frame".to_string(),
                    }))
                }
                Ok(Some(Err(e))) => return Some(self.fail(self.transport_error(e))),
                Ok(Some(Ok(UpstreamFrame::Partial(text)))) => {
                    if text.is_empty() {
                        continue;
                    }
                    return Some(Chunk::Delta(text));
                }
                Ok(Some(Ok(UpstreamFrame::Completed(usage)))) => return Some(self.succeed(usage)),
                Ok(Some(Ok(UpstreamFrame::RateLimited { retry_after }))) => {
                    return Some(self.fail(GatewayError::RateLimited {
                        node: self.config.id.clone(),
                        retry_after,
                    }))
                }
                Ok(Some(Ok(UpstreamFrame::Failed { code, message }))) => {
                    return Some(self.fail(self.status_error(code, None, message)))
                }
            }
        }
    }

    fn succeed(&mut self, usage: Usage) -> Chunk {
        self.finish();
        self.registry.record_success(self.node);

        let cost_usd = ModelPricing::for_model(&self.config.model).cost(&usage);
        if let Some(token) = self.commit.take() {
            self.ledger.commit(token, &usage, cost_usd);
        }

        info!(
            node = %self.config.id,
            attempt = %self.attempt,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            cost_usd,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Attempt succeeded"
        );
        Chunk::Finished { usage, cost_usd }
    }

    fn fail(&mut self, error: GatewayError) -> Chunk {
        self.finish();

        match &error {
            GatewayError::RateLimited { retry_after, .. } => {
                self.registry.record_rate_limited(self.node, *retry_after)
            }
            _ => self.registry.record_failure(self.node),
        }

        debug!(node = %self.config.id, attempt = %self.attempt, error = %error, "Attempt failed");
        Chunk::Failed(error)
    }

    /// Drop the connection; no further chunks
    fn finish(&mut self) {
        self.done = true;
        self.frames = None;
    }

    fn timeout_error(&self) -> GatewayError {
        GatewayError::Timeout {
            node: self.config.id.clone(),
            elapsed: self.started.elapsed(),
        }
    }

    fn transport_error(&self, error: UpstreamError) -> GatewayError {
        match error {
            UpstreamError::Status {
                status,
                retry_after,
                body,
            } => self.status_error(status, retry_after, body),
            other => GatewayError::TransientUpstream {
                node: self.config.id.clone(),
                message: other.to_string(),
            },
        }
    }

    /// 429 is a rate limit, 408 and 5xx are transient, other 4xx are fatal
    fn status_error(&self, code: u16, retry_after: Option<Duration>, message: String) -> GatewayError {
        let node = self.config.id.clone();
        match code {
            429 => GatewayError::RateLimited { node, retry_after },
            400..=499 if code != 408 => GatewayError::FatalUpstream {
                node,
                code,
                message,
            },
            _ => GatewayError::TransientUpstream {
                node,
                message: format!("{}: {}", code, message),
            },
        }
    }
}
