//! In-Flight Deduplicator
//!
//! At most one upstream computation per fingerprint. The first caller for a
//! fingerprint becomes the owner and gets a `Publisher`; later callers join
//! with a `Subscription` and read the same ordered delta log, replayed from
//! the start and then live.
//!
//! The log is append-only and each subscription keeps its own cursor, so
//! nothing is delivered twice or out of order, and a slow or vanished reader
//! never affects anyone else. Dropping the last subscription of a pending
//! computation raises the cancel flag; the owner decides when to abort.
//!
//! Across retries the publisher suppresses text the caller has already seen:
//! a new attempt's output is only published past the length already sent.
//! When the final attempt's output differs from the published text, the
//! published text is no answer any node produced and must not be cached.

use crate::cache::{CachedAnswer, Fingerprint};
use crate::error::GatewayError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How a computation ended
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeeded(CachedAnswer),
    Failed(GatewayError),
}

/// What a subscriber reads
#[derive(Debug, Clone, PartialEq)]
pub enum ComputationEvent {
    Delta(String),
    Succeeded(CachedAnswer),
    Failed(GatewayError),
}

#[derive(Debug, Default)]
struct Log {
    deltas: Vec<String>,
    published: String,
    attempt_text: String,
    attempt_cursor: usize,
    diverged: bool,
    outcome: Option<Outcome>,
    subscribers: usize,
}

/// Shared state of one in-flight computation
#[derive(Debug)]
pub struct Computation {
    fingerprint: Fingerprint,
    log: Mutex<Log>,
    version: watch::Sender<u64>,
    orphaned: watch::Sender<bool>,
}

impl Computation {
    fn new(fingerprint: Fingerprint) -> Self {
        Self {
            fingerprint,
            log: Mutex::new(Log::default()),
            version: watch::channel(0).0,
            orphaned: watch::channel(false).0,
        }
    }

    pub fn subscribers(&self) -> usize {
        self.log.lock().subscribers
    }

    fn notify(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Attach a reader unless the computation already failed
    fn attach(self: &Arc<Self>) -> Option<Subscription> {
        let mut log = self.log.lock();
        if matches!(log.outcome, Some(Outcome::Failed(_))) {
            return None;
        }
        log.subscribers += 1;
        drop(log);

        self.orphaned.send_if_modified(|orphaned| std::mem::replace(orphaned, false));

        Some(Subscription {
            computation: self.clone(),
            cursor: 0,
            version: self.version.subscribe(),
            finished: false,
        })
    }

    fn detach(&self) {
        let mut log = self.log.lock();
        log.subscribers = log.subscribers.saturating_sub(1);
        let orphaned = log.subscribers == 0 && log.outcome.is_none();
        drop(log);

        if orphaned {
            debug!(fingerprint = self.fingerprint.short(), "Last subscriber detached");
            self.orphaned.send_replace(true);
        }
    }
}

/// Result of `Deduplicator::acquire`
pub enum Acquired {
    /// No computation was running; the caller must drive this one
    Owner {
        publisher: Publisher,
        subscription: Subscription,
    },
    /// Joined an existing computation
    Joined(Subscription),
}

/// Fingerprint → in-flight computation map
#[derive(Debug, Default)]
pub struct Deduplicator {
    computations: Mutex<HashMap<Fingerprint, Arc<Computation>>>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the running computation for `fingerprint` or become its owner
    ///
    /// Check-or-insert happens under one lock, so racing callers can never
    /// both become owners.
    pub fn acquire(self: &Arc<Self>, fingerprint: &Fingerprint) -> Acquired {
        let mut computations = self.computations.lock();

        if let Some(existing) = computations.get(fingerprint) {
            if let Some(subscription) = existing.attach() {
                debug!(fingerprint = fingerprint.short(), "Joined in-flight computation");
                return Acquired::Joined(subscription);
            }
        }

        let computation = Arc::new(Computation::new(fingerprint.clone()));
        computation.log.lock().subscribers = 1;
        let subscription = Subscription {
            computation: computation.clone(),
            cursor: 0,
            version: computation.version.subscribe(),
            finished: false,
        };

        computations.insert(fingerprint.clone(), computation.clone());
        drop(computations);

        debug!(fingerprint = fingerprint.short(), "New in-flight computation");
        Acquired::Owner {
            publisher: Publisher {
                computation,
                dedup: self.clone(),
            },
            subscription,
        }
    }

    /// Number of computations currently in flight
    pub fn in_flight(&self) -> usize {
        self.computations.lock().len()
    }

    fn release(&self, computation: &Arc<Computation>) {
        let mut computations = self.computations.lock();
        let ours = computations
            .get(&computation.fingerprint)
            .is_some_and(|c| Arc::ptr_eq(c, computation));
        if ours {
            computations.remove(&computation.fingerprint);
        }
    }
}

/// A caller's read end
#[derive(Debug)]
pub struct Subscription {
    computation: Arc<Computation>,
    cursor: usize,
    version: watch::Receiver<u64>,
    finished: bool,
}

impl Subscription {
    /// Next delta or the terminal outcome; `None` after the outcome
    pub async fn next(&mut self) -> Option<ComputationEvent> {
        if self.finished {
            return None;
        }

        loop {
            self.version.borrow_and_update();

            {
                let log = self.computation.log.lock();
                if let Some(delta) = log.deltas.get(self.cursor) {
                    self.cursor += 1;
                    return Some(ComputationEvent::Delta(delta.clone()));
                }
                if let Some(outcome) = &log.outcome {
                    self.finished = true;
                    return Some(match outcome {
                        Outcome::Succeeded(answer) => ComputationEvent::Succeeded(answer.clone()),
                        Outcome::Failed(err) => ComputationEvent::Failed(err.clone()),
                    });
                }
            }

            if self.version.changed().await.is_err() {
                return None;
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.computation.detach();
    }
}

/// The owner's write end
///
/// Dropping a publisher without an outcome fails the computation with
/// `Cancelled`, so subscribers always see a terminal event.
#[derive(Debug)]
pub struct Publisher {
    computation: Arc<Computation>,
    dedup: Arc<Deduplicator>,
}

impl Publisher {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.computation.fingerprint
    }

    pub fn subscribers(&self) -> usize {
        self.computation.subscribers()
    }

    /// Watch that flips to `true` whenever the last subscriber leaves
    pub fn orphaned(&self) -> watch::Receiver<bool> {
        self.computation.orphaned.subscribe()
    }

    /// Reset per-attempt text before a new attempt starts
    pub fn begin_attempt(&self) {
        let mut log = self.computation.log.lock();
        log.attempt_text.clear();
        log.attempt_cursor = log.published.len();
        log.diverged = false;
    }

    /// Feed attempt output; returns the fresh text actually published
    pub fn push(&self, text: &str) -> Option<String> {
        let mut log = self.computation.log.lock();
        log.attempt_text.push_str(text);

        let overlap = log.attempt_text.len().min(log.published.len());
        let agrees = log.attempt_text.as_bytes()[..overlap] == log.published.as_bytes()[..overlap];
        if !agrees && !log.diverged {
            log.diverged = true;
            warn!(
                fingerprint = self.computation.fingerprint.short(),
                "Retry output diverged from text already streamed"
            );
        }

        if log.attempt_text.len() <= log.attempt_cursor {
            return None;
        }

        let start = (log.attempt_cursor..=log.attempt_text.len())
            .find(|&i| log.attempt_text.is_char_boundary(i))
            .unwrap_or(log.attempt_text.len());
        let fresh = log.attempt_text[start..].to_string();
        log.attempt_cursor = log.attempt_text.len();
        if fresh.is_empty() {
            return None;
        }

        log.published.push_str(&fresh);
        log.deltas.push(fresh.clone());
        drop(log);

        self.computation.notify();
        Some(fresh)
    }

    /// Text published so far
    pub fn published(&self) -> String {
        self.computation.log.lock().published.clone()
    }

    /// Whether the published text differs from the current attempt's output
    pub fn diverged(&self) -> bool {
        let log = self.computation.log.lock();
        log.attempt_text != log.published
    }

    pub fn succeed(self, answer: CachedAnswer) {
        self.finish(Outcome::Succeeded(answer));
    }

    pub fn fail(self, error: GatewayError) {
        self.finish(Outcome::Failed(error));
    }

    fn finish(&self, outcome: Outcome) {
        {
            let mut log = self.computation.log.lock();
            if log.outcome.is_some() {
                return;
            }
            match &outcome {
                Outcome::Succeeded(_) => info!(
                    fingerprint = self.computation.fingerprint.short(),
                    subscribers = log.subscribers,
                    "Computation succeeded"
                ),
                Outcome::Failed(err) => info!(
                    fingerprint = self.computation.fingerprint.short(),
                    subscribers = log.subscribers,
                    error = %err,
                    "Computation failed"
                ),
            }
            log.outcome = Some(outcome);
        }

        self.dedup.release(&self.computation);
        self.computation.notify();
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.finish(Outcome::Failed(GatewayError::Cancelled));
    }
}
