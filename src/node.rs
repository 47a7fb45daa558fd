//! Node Registry & Selector
//!
//! Fixed table of upstream nodes, addressed by `NodeId` (index into the
//! table). Each node carries its own health fields behind its own lock, so
//! concurrent executors update different nodes without contention.
//!
//! Health rules:
//! - rate limited: cooldown until `now + retry_after` (or the default cooldown)
//! - timeout / connection / upstream error: failure count +1, and at or past
//!   the threshold the node is unreachable for an exponentially growing cooldown
//! - success: failure count and every cooldown cleared

use crate::error::{GatewayError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Index into the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Static node description
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub id: String,
    pub url: String,
    /// Model family (haiku, sonnet, opus), used for pricing
    pub model: String,
}

impl NodeConfig {
    pub fn new(id: &str, url: &str, model: &str) -> Self {
        Self {
            id: id.to_string(),
            url: url.to_string(),
            model: model.to_string(),
        }
    }

    /// Parse `id=url[@model]`
    pub fn parse(spec: &str) -> Option<Self> {
        let (id, rest) = spec.trim().split_once('=')?;
        let (url, model) = match rest.rsplit_once('@') {
            Some((url, model))
                if model
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') =>
            {
                (url, model)
            }
            _ => (rest, "sonnet"),
        };

        let id = id.trim();
        let url = url.trim();
        if id.is_empty() || url.is_empty() {
            return None;
        }

        Some(Self::new(id, url, model.trim()))
    }
}

/// Health policy
#[derive(Debug, Clone)]
pub struct HealthPolicy {
    /// Cooldown when a rate limit carries no `retry_after`
    pub rate_limit_cooldown: Duration,
    /// Consecutive failures before a node becomes unreachable
    pub failure_threshold: u32,
    pub unreachable_cooldown: Duration,
    pub max_unreachable_cooldown: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            rate_limit_cooldown: Duration::from_secs(30),
            failure_threshold: 3,
            unreachable_cooldown: Duration::from_secs(10),
            max_unreachable_cooldown: Duration::from_secs(300),
        }
    }
}

impl HealthPolicy {
    fn unreachable_cooldown_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(self.failure_threshold).min(16);
        self.unreachable_cooldown
            .saturating_mul(1u32 << exponent)
            .min(self.max_unreachable_cooldown)
    }
}

/// Health as seen from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeHealth {
    Healthy,
    RateLimited { until: Instant },
    Unreachable { until: Instant },
}

#[derive(Debug, Default)]
struct NodeState {
    failure_count: u32,
    rate_limited_until: Option<Instant>,
    unreachable_until: Option<Instant>,
    attempts: u64,
    successes: u64,
}

impl NodeState {
    fn health(&self, now: Instant) -> NodeHealth {
        if let Some(until) = self.unreachable_until.filter(|t| *t > now) {
            return NodeHealth::Unreachable { until };
        }
        if let Some(until) = self.rate_limited_until.filter(|t| *t > now) {
            return NodeHealth::RateLimited { until };
        }
        NodeHealth::Healthy
    }
}

/// Point-in-time copy of a node's health fields
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSnapshot {
    pub health: NodeHealth,
    pub failure_count: u32,
    pub rate_limited_until: Option<Instant>,
    pub unreachable_until: Option<Instant>,
    pub attempts: u64,
    pub successes: u64,
}

/// Serializable node view for the HTTP surface
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub id: String,
    pub url: String,
    pub model: String,
    pub health: &'static str,
    pub failure_count: u32,
    pub cooldown_remaining_ms: u64,
    pub attempts: u64,
    pub successes: u64,
}

/// A registered node
#[derive(Debug)]
pub struct Node {
    pub config: NodeConfig,
    state: Mutex<NodeState>,
}

/// Node registry
#[derive(Debug)]
pub struct NodeRegistry {
    nodes: Vec<Node>,
    policy: HealthPolicy,
    cursor: AtomicUsize,
}

impl NodeRegistry {
    pub fn new(configs: Vec<NodeConfig>, policy: HealthPolicy) -> Self {
        let nodes = configs
            .into_iter()
            .map(|config| Node {
                config,
                state: Mutex::new(NodeState::default()),
            })
            .collect();

        Self {
            nodes,
            policy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn config(&self, id: NodeId) -> &NodeConfig {
        &self.nodes[id.0].config
    }

    /// Pick a node, round-robin, skipping excluded and cooling-down nodes
    ///
    /// Nodes with no recorded failures are preferred over nodes that are
    /// available but have failed recently.
    pub fn select(&self, exclude: &HashSet<NodeId>) -> Result<NodeId> {
        let count = self.nodes.len();
        if count == 0 {
            return Err(GatewayError::NoNodeAvailable);
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % count;
        let now = Instant::now();
        let mut degraded = None;

        for offset in 0..count {
            let id = NodeId((start + offset) % count);
            if exclude.contains(&id) {
                continue;
            }

            let state = self.nodes[id.0].state.lock();
            if state.health(now) != NodeHealth::Healthy {
                continue;
            }
            if state.failure_count == 0 {
                debug!(node = %self.nodes[id.0].config.id, "Selected node");
                return Ok(id);
            }
            degraded.get_or_insert(id);
        }

        match degraded {
            Some(id) => {
                debug!(node = %self.nodes[id.0].config.id, "Selected degraded node");
                Ok(id)
            }
            None => Err(GatewayError::NoNodeAvailable),
        }
    }

    pub fn record_attempt(&self, id: NodeId) {
        self.nodes[id.0].state.lock().attempts += 1;
    }

    pub fn record_success(&self, id: NodeId) {
        let mut state = self.nodes[id.0].state.lock();
        if state.failure_count > 0 || state.unreachable_until.is_some() {
            info!(node = %self.nodes[id.0].config.id, "Node recovered");
        }
        state.failure_count = 0;
        state.rate_limited_until = None;
        state.unreachable_until = None;
        state.successes += 1;
    }

    pub fn record_rate_limited(&self, id: NodeId, retry_after: Option<Duration>) {
        let cooldown = retry_after.unwrap_or(self.policy.rate_limit_cooldown);
        let until = Instant::now() + cooldown;
        let mut state = self.nodes[id.0].state.lock();
        state.rate_limited_until = Some(match state.rate_limited_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
        warn!(
            node = %self.nodes[id.0].config.id,
            cooldown_ms = cooldown.as_millis() as u64,
            "Node rate limited"
        );
    }

    pub fn record_failure(&self, id: NodeId) {
        let mut state = self.nodes[id.0].state.lock();
        state.failure_count = state.failure_count.saturating_add(1);

        if state.failure_count >= self.policy.failure_threshold {
            let cooldown = self.policy.unreachable_cooldown_for(state.failure_count);
            state.unreachable_until = Some(Instant::now() + cooldown);
            warn!(
                node = %self.nodes[id.0].config.id,
                failures = state.failure_count,
                cooldown_ms = cooldown.as_millis() as u64,
                "Node marked unreachable"
            );
        } else {
            debug!(
                node = %self.nodes[id.0].config.id,
                failures = state.failure_count,
                "Node failure recorded"
            );
        }
    }

    pub fn snapshot(&self, id: NodeId) -> NodeSnapshot {
        let state = self.nodes[id.0].state.lock();
        NodeSnapshot {
            health: state.health(Instant::now()),
            failure_count: state.failure_count,
            rate_limited_until: state.rate_limited_until,
            unreachable_until: state.unreachable_until,
            attempts: state.attempts,
            successes: state.successes,
        }
    }

    pub fn statuses(&self) -> Vec<NodeStatus> {
        let now = Instant::now();
        self.nodes
            .iter()
            .map(|node| {
                let state = node.state.lock();
                let (health, until) = match state.health(now) {
                    NodeHealth::Healthy => ("healthy", None),
                    NodeHealth::RateLimited { until } => ("rate_limited", Some(until)),
                    NodeHealth::Unreachable { until } => ("unreachable", Some(until)),
                };
                NodeStatus {
                    id: node.config.id.clone(),
                    url: node.config.url.clone(),
                    model: node.config.model.clone(),
                    health,
                    failure_count: state.failure_count,
                    cooldown_remaining_ms: until
                        .map(|t| t.saturating_duration_since(now).as_millis() as u64)
                        .unwrap_or(0),
                    attempts: state.attempts,
                    successes: state.successes,
                }
            })
            .collect()
    }
}
