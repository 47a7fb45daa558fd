//! Request pipeline
//!
//! `Gateway::ask` turns one question into an ordered event stream:
//!
//! 1. classify (length ceiling, tier, profile)
//! 2. reserve against the budget ledger
//! 3. `hello`
//! 4. serve from cache, join an in-flight computation, or start one
//! 5. relay deltas, then `done`/`complete` or `error`
//!
//! A new computation is driven by a spawned task that owns the retry chain
//! and the upstream connection. Callers only hold subscriptions, so a caller
//! going away never tears down work other callers still read.

use crate::cache::{CacheStats, CachedAnswer, Fingerprint, ResponseCache};
use crate::classifier::{Classifier, ComplexityProfile};
use crate::config::Config;
use crate::error::GatewayError;
use crate::events::{EventEmitter, GatewayEvent};
use crate::executor::{Chunk, Executor};
use crate::inflight::{Acquired, ComputationEvent, Deduplicator, Publisher, Subscription};
use crate::ledger::{BudgetLedger, LedgerSnapshot, ModelPricing, Reservation};
use crate::node::{NodeRegistry, NodeStatus};
use crate::retry::{sample_jitter, RetryChain, RetryEvent, RetryPolicy, RetryState};
use crate::upstream::{Upstream, Usage};
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

/// One caller request
#[derive(Debug, Clone, Deserialize)]
pub struct Question {
    /// Conversation scope; identical questions in different contexts never share work
    #[serde(default)]
    pub context_id: String,
    pub question: String,
    #[serde(default)]
    pub extreme_mode: bool,
}

impl Question {
    pub fn new(context_id: &str, question: &str) -> Self {
        Self {
            context_id: context_id.to_string(),
            question: question.to_string(),
            extreme_mode: false,
        }
    }

    pub fn extreme(mut self) -> Self {
        self.extreme_mode = true;
        self
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = GatewayEvent> + Send>>;

/// Gateway-wide counters
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub requests: u64,
    pub rejected: u64,
    pub cache_served: u64,
    pub joined: u64,
    pub computations: u64,
    pub in_flight: usize,
    pub cache: CacheStats,
    pub budget: LedgerSnapshot,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    rejected: AtomicU64,
    cache_served: AtomicU64,
    joined: AtomicU64,
    computations: AtomicU64,
}

struct Inner {
    classifier: Classifier,
    extreme_mode: bool,
    estimate_pricing: ModelPricing,
    registry: Arc<NodeRegistry>,
    ledger: Arc<BudgetLedger>,
    cache: ResponseCache,
    dedup: Arc<Deduplicator>,
    executor: Executor,
    detach_grace: Duration,
    counters: Counters,
}

/// The streaming gateway
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl Gateway {
    pub fn new(config: &Config, upstream: Arc<dyn Upstream>) -> Self {
        let registry = Arc::new(NodeRegistry::new(config.nodes.clone(), config.health.clone()));
        let ledger = Arc::new(BudgetLedger::new(config.budget.clone()));
        let executor = Executor::new(upstream, registry.clone(), ledger.clone());

        // Estimates assume the priciest node since selection happens later
        let estimate_pricing = config
            .nodes
            .iter()
            .map(|n| ModelPricing::for_model(&n.model))
            .fold(ModelPricing::HAIKU, |a, b| if b.output > a.output { b } else { a });

        info!(
            nodes = config.nodes.len(),
            extreme_mode = config.extreme_mode,
            cache = config.cache.enabled,
            ceiling_usd = ?config.budget.ceiling_usd,
            "Gateway initialized"
        );

        Self {
            inner: Arc::new(Inner {
                classifier: Classifier::new(config.classifier.clone()),
                extreme_mode: config.extreme_mode,
                estimate_pricing,
                registry,
                ledger,
                cache: ResponseCache::new(&config.cache),
                dedup: Arc::new(Deduplicator::new()),
                executor,
                detach_grace: config.detach_grace,
                counters: Counters::default(),
            }),
        }
    }

    /// Ask a question; the stream always ends with `complete` or `error`
    pub fn ask(&self, question: Question) -> EventStream {
        let session = Session {
            inner: self.inner.clone(),
            request: Some(question),
            emitter: EventEmitter::new(),
            pending: VecDeque::new(),
            subscription: None,
            finished: false,
        };

        Box::pin(stream::unfold(session, |mut session| async move {
            let event = session.next_event().await?;
            Some((event, session))
        }))
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.inner.registry
    }

    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.inner.ledger
    }

    pub fn nodes(&self) -> Vec<NodeStatus> {
        self.inner.registry.statuses()
    }

    pub fn reset_budget(&self) -> LedgerSnapshot {
        self.inner.ledger.reset();
        self.inner.ledger.snapshot()
    }

    pub fn stats(&self) -> GatewayStats {
        let c = &self.inner.counters;
        GatewayStats {
            requests: c.requests.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            cache_served: c.cache_served.load(Ordering::Relaxed),
            joined: c.joined.load(Ordering::Relaxed),
            computations: c.computations.load(Ordering::Relaxed),
            in_flight: self.inner.dedup.in_flight(),
            cache: self.inner.cache.stats(),
            budget: self.inner.ledger.snapshot(),
        }
    }
}

/// Per-caller state behind the event stream
struct Session {
    inner: Arc<Inner>,
    request: Option<Question>,
    emitter: EventEmitter,
    pending: VecDeque<GatewayEvent>,
    subscription: Option<Subscription>,
    finished: bool,
}

impl Session {
    async fn next_event(&mut self) -> Option<GatewayEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.finished {
                return None;
            }
            if let Some(request) = self.request.take() {
                self.admit(request).await;
                continue;
            }

            let Some(subscription) = self.subscription.as_mut() else {
                self.fail(GatewayError::Protocol("no computation attached".into()));
                continue;
            };

            match subscription.next().await {
                Some(ComputationEvent::Delta(text)) => {
                    let event = self.emitter.delta(text);
                    self.push(event);
                }
                Some(ComputationEvent::Succeeded(answer)) => {
                    self.complete(answer.usage, answer.cost_usd, false)
                }
                Some(ComputationEvent::Failed(error)) => self.fail(error),
                None => self.fail(GatewayError::Cancelled),
            }
        }
    }

    /// Pre-flight checks, then attach to an answer source
    async fn admit(&mut self, request: Question) {
        let inner = self.inner.clone();
        inner.counters.requests.fetch_add(1, Ordering::Relaxed);

        let length = request.question.chars().count();
        let extreme = request.extreme_mode || inner.extreme_mode;

        let profile = match inner.classifier.classify(length, extreme) {
            Ok(profile) => profile,
            Err(e) => {
                inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(length, error = %e, "Request rejected");
                return self.fail(e);
            }
        };

        let estimate = inner
            .estimate_pricing
            .estimate(&request.question, profile.max_tokens);
        let warning = match inner.ledger.reserve(estimate) {
            Reservation::Granted { warning } => warning,
            Reservation::Denied { spent, ceiling } => {
                inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return self.fail(GatewayError::BudgetExceeded { spent, ceiling });
            }
        };

        let hello = self.emitter.hello(profile.tier, warning);
        self.push(hello);

        let fingerprint = Fingerprint::compute(&request.context_id, &request.question, profile.tier);
        debug!(
            fingerprint = fingerprint.short(),
            tier = profile.tier.as_str(),
            length,
            "Request admitted"
        );

        if let Some(answer) = inner.cache.get(&fingerprint).await {
            inner.counters.cache_served.fetch_add(1, Ordering::Relaxed);
            return self.replay(answer);
        }

        match inner.dedup.acquire(&fingerprint) {
            Acquired::Joined(subscription) => {
                inner.counters.joined.fetch_add(1, Ordering::Relaxed);
                self.subscription = Some(subscription);
            }
            Acquired::Owner {
                publisher,
                subscription,
            } => {
                // A computation may have finished between the lookup and acquire
                if let Some(answer) = inner.cache.get(&fingerprint).await {
                    publisher.push(&answer.answer);
                    publisher.succeed(answer.clone());
                    inner.counters.cache_served.fetch_add(1, Ordering::Relaxed);
                    return self.replay(answer);
                }

                inner.counters.computations.fetch_add(1, Ordering::Relaxed);
                let span = info_span!(
                    "computation",
                    fingerprint = fingerprint.short(),
                    tier = profile.tier.as_str()
                );
                tokio::spawn(drive(inner.clone(), publisher, request.question, profile).instrument(span));
                self.subscription = Some(subscription);
            }
        }
    }

    /// Cached answers replay as one delta with zero incremental cost
    fn replay(&mut self, answer: CachedAnswer) {
        if !answer.answer.is_empty() {
            let event = self.emitter.delta(answer.answer);
            self.push(event);
        }
        self.complete(answer.usage, 0.0, true);
    }

    fn complete(&mut self, usage: Usage, cost_usd: f64, cached: bool) {
        self.finished = true;
        self.subscription = None;
        match self.emitter.finish(usage, cost_usd, cached) {
            Ok(events) => self.pending.extend(events),
            Err(e) => self.fail(e),
        }
    }

    fn fail(&mut self, error: GatewayError) {
        self.finished = true;
        self.subscription = None;
        if let Ok(event) = self.emitter.error(&error) {
            self.pending.push_back(event);
        }
    }

    fn push(&mut self, event: Result<GatewayEvent, GatewayError>) {
        match event {
            Ok(event) => self.pending.push_back(event),
            Err(e) => self.fail(e),
        }
    }
}

/// Result of a successful retry chain
struct Settled {
    usage: Usage,
    cost_usd: f64,
    node: String,
}

/// Owner task: runs the retry chain until it settles or every caller leaves
async fn drive(inner: Arc<Inner>, publisher: Publisher, question: String, profile: ComplexityProfile) {
    let mut chain = RetryChain::new(RetryPolicy::from_profile(&profile));
    let mut orphaned = publisher.orphaned();

    let result = tokio::select! {
        result = run_chain(&inner, &publisher, &mut chain, &question, &profile) => Some(result),
        _ = abandoned(&mut orphaned, &publisher, inner.detach_grace) => None,
    };

    let result = result.unwrap_or_else(|| {
        info!("No subscribers left, upstream call aborted");
        chain.apply(RetryEvent::Cancelled, 0.0);
        Err(GatewayError::Cancelled)
    });

    match result {
        Ok(settled) => {
            let answer = CachedAnswer {
                answer: publisher.published(),
                usage: settled.usage,
                cost_usd: settled.cost_usd,
                node: settled.node,
            };
            if publisher.diverged() {
                warn!("Streamed text spans diverging attempts, answer not cached");
            } else {
                inner.cache.set(publisher.fingerprint(), answer.clone()).await;
            }
            publisher.succeed(answer);
        }
        Err(error) => publisher.fail(error),
    }
}

async fn run_chain(
    inner: &Inner,
    publisher: &Publisher,
    chain: &mut RetryChain,
    question: &str,
    profile: &ComplexityProfile,
) -> Result<Settled, GatewayError> {
    let mut settled = None;

    loop {
        match chain.state().clone() {
            RetryState::Idle { .. } => {
                let mut selected = inner.registry.select(chain.excluded());
                if selected.is_err() && chain.clear_exclusions() {
                    debug!("Every node tried, starting a new sweep");
                    selected = inner.registry.select(chain.excluded());
                }
                let event = match selected {
                    Ok(node) => RetryEvent::NodeSelected(node),
                    Err(e) => RetryEvent::SelectionFailed(e),
                };
                chain.apply(event, 0.0);
            }

            RetryState::Attempting { node, .. } => {
                publisher.begin_attempt();
                let mut chunks = inner.executor.execute(node, question, profile);
                let mut outcome = Err(GatewayError::Protocol("attempt ended without an outcome".into()));

                while let Some(chunk) = chunks.next().await {
                    match chunk {
                        Chunk::Delta(text) => {
                            publisher.push(&text);
                        }
                        Chunk::Finished { usage, cost_usd } => outcome = Ok((usage, cost_usd)),
                        Chunk::Failed(error) => outcome = Err(error),
                    }
                }

                match outcome {
                    Ok((usage, cost_usd)) => {
                        settled = Some(Settled {
                            usage,
                            cost_usd,
                            node: inner.registry.config(node).id.clone(),
                        });
                        chain.apply(RetryEvent::AttemptSucceeded, 0.0);
                    }
                    Err(error) => {
                        chain.apply(RetryEvent::AttemptFailed(error), sample_jitter());
                    }
                }
            }

            RetryState::RetryWait { delay, .. } => {
                tokio::time::sleep(delay).await;
                chain.apply(RetryEvent::BackoffElapsed, 0.0);
            }

            RetryState::Succeeded { attempts, .. } => {
                debug!(attempts, "Retry chain succeeded");
                return settled.ok_or_else(|| GatewayError::Protocol("success without usage".into()));
            }

            RetryState::ExhaustedFailure { attempts, error } => {
                warn!(attempts, error = %error, "Retry chain failed");
                return Err(error);
            }
        }
    }
}

/// Resolves once no subscriber has been attached for a full grace period
async fn abandoned(orphaned: &mut watch::Receiver<bool>, publisher: &Publisher, grace: Duration) {
    loop {
        if orphaned.wait_for(|o| *o).await.is_err() {
            return std::future::pending().await;
        }
        tokio::time::sleep(grace).await;
        if publisher.subscribers() == 0 {
            return;
        }
    }
}
