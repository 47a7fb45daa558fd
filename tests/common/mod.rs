//! Shared test helpers: a scripted upstream and gateway builders

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use gateway_mesh::config::Config;
use gateway_mesh::node::NodeConfig;
use gateway_mesh::upstream::{FrameStream, Upstream, UpstreamError, UpstreamFrame, UpstreamRequest, Usage};
use gateway_mesh::{Gateway, GatewayEvent, Question};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What a node does on one `open`
#[derive(Debug, Clone)]
pub enum Step {
    Stream {
        frames: Vec<(Duration, UpstreamFrame)>,
        hang: bool,
    },
    Refuse(UpstreamError),
}

impl Step {
    pub fn answer(parts: &[&str]) -> Self {
        Self::slow_answer(parts, Duration::ZERO)
    }

    /// Each part arrives after `gap`
    pub fn slow_answer(parts: &[&str], gap: Duration) -> Self {
        let mut frames: Vec<_> = parts
            .iter()
            .map(|p| (gap, UpstreamFrame::Partial(p.to_string())))
            .collect();
        frames.push((gap, UpstreamFrame::Completed(usage())));
        Step::Stream {
            frames,
            hang: false,
        }
    }

    /// Streams `parts`, then the connection drops without a terminal frame
    pub fn cut_off(parts: &[&str]) -> Self {
        Step::Stream {
            frames: parts
                .iter()
                .map(|p| (Duration::ZERO, UpstreamFrame::Partial(p.to_string())))
                .collect(),
            hang: false,
        }
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Step::Stream {
            frames: vec![(Duration::ZERO, UpstreamFrame::RateLimited { retry_after })],
            hang: false,
        }
    }

    pub fn failed(code: u16) -> Self {
        Step::Stream {
            frames: vec![(
                Duration::ZERO,
                UpstreamFrame::Failed {
                    code,
                    message: "scripted failure".into(),
                },
            )],
            hang: false,
        }
    }

    /// Sends nothing, ever
    pub fn hang() -> Self {
        Step::Stream {
            frames: Vec::new(),
            hang: true,
        }
    }
}

pub fn usage() -> Usage {
    Usage {
        input_tokens: 1_000,
        output_tokens: 1_000,
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Per-node scripted upstream; a node's last step repeats once its script runs out
#[derive(Default)]
pub struct ScriptedUpstream {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<HashMap<String, usize>>,
    live: Arc<AtomicUsize>,
}

impl ScriptedUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, node: &str, steps: Vec<Step>) {
        self.scripts.lock().insert(node.to_string(), steps.into());
    }

    pub fn calls(&self, node: &str) -> usize {
        self.calls.lock().get(node).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    /// Upstream streams not yet dropped
    pub fn live_streams(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn next_step(&self, node: &str) -> Step {
        let mut scripts = self.scripts.lock();
        let Some(steps) = scripts.get_mut(node) else {
            return Step::Refuse(UpstreamError::Connect(format!("no script for {}", node)));
        };
        if steps.len() > 1 {
            steps.pop_front().unwrap()
        } else {
            steps
                .front()
                .cloned()
                .unwrap_or_else(|| Step::Refuse(UpstreamError::Connect("empty script".into())))
        }
    }
}

#[async_trait]
impl Upstream for ScriptedUpstream {
    async fn open(&self, node: &NodeConfig, _: &UpstreamRequest) -> Result<FrameStream, UpstreamError> {
        *self.calls.lock().entry(node.id.clone()).or_default() += 1;

        let (frames, hang) = match self.next_step(&node.id) {
            Step::Refuse(e) => return Err(e),
            Step::Stream { frames, hang } => (frames, hang),
        };

        self.live.fetch_add(1, Ordering::SeqCst);
        let guard = LiveGuard(self.live.clone());

        let played = stream::unfold(
            (VecDeque::from(frames), guard),
            |(mut frames, guard)| async move {
                let (gap, frame) = frames.pop_front()?;
                if !gap.is_zero() {
                    tokio::time::sleep(gap).await;
                }
                Some((Ok::<_, UpstreamError>(frame), (frames, guard)))
            },
        );

        if hang {
            self.live.fetch_add(1, Ordering::SeqCst);
            let stalled = stream::unfold(LiveGuard(self.live.clone()), |guard| async move {
                std::future::pending::<()>().await;
                Some((Err(UpstreamError::Stream("unreachable".into())), guard))
            });
            Ok(Box::pin(played.chain(stalled)))
        } else {
            Ok(Box::pin(played))
        }
    }
}

/// Nodes named `(id, model)`, fast backoff, short detach grace
pub fn config(nodes: &[(&str, &str)]) -> Config {
    let mut config = Config {
        nodes: nodes
            .iter()
            .map(|(id, model)| NodeConfig::new(id, &format!("http://{}.test", id), model))
            .collect(),
        detach_grace: Duration::from_millis(100),
        ..Config::default()
    };
    config.classifier.backoff_base = Duration::from_secs(1);
    config
}

pub fn gateway(config: &Config, upstream: &Arc<ScriptedUpstream>) -> Gateway {
    Gateway::new(config, upstream.clone())
}

pub async fn ask(gateway: &Gateway, context: &str, question: &str) -> Vec<GatewayEvent> {
    gateway.ask(Question::new(context, question)).collect().await
}

pub fn names(events: &[GatewayEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.name()).collect()
}

/// Concatenated delta text
pub fn text(events: &[GatewayEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            GatewayEvent::Delta { text_fragment } => Some(text_fragment.as_str()),
            _ => None,
        })
        .collect()
}
