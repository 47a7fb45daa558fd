//! Retry/Backoff Controller
//!
//! The retry chain is an explicit state machine:
//!
//! ```text
//!  ┌──────────────────────── backoff elapsed ───────────────────────────┐
//!  ▼                                                                    │
//! Idle ──node selected──► Attempting ──retryable, budget left──► RetryWait
//!  │                          │
//!  │                          ├──ok──► Succeeded
//!  │                          │
//!  └──no node─────────────────┴──fatal / budget spent──► ExhaustedFailure
//! ```
//!
//! `RetryWait → Attempting` goes through `Idle`, so every attempt runs node
//! selection again. `Idle` keeps the previous attempt's error: if selection
//! then fails, that error is what the chain reports.
//!
//! `RetryPolicy::transition` is pure: jitter is passed in, so every path can
//! be exercised without a clock or a network. `RetryChain` wraps it with the
//! per-chain exclusion set.

use crate::classifier::ComplexityProfile;
use crate::error::GatewayError;
use crate::node::NodeId;
use rand::Rng;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};

/// ±10% jitter on every backoff
pub const JITTER_FACTOR: f64 = 0.1;

/// Exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
    pub jitter_factor: f64,
}

impl Backoff {
    pub fn from_profile(profile: &ComplexityProfile) -> Self {
        Self {
            base: profile.backoff_base,
            multiplier: profile.backoff_multiplier,
            max: profile.max_backoff,
            jitter_factor: JITTER_FACTOR,
        }
    }

    /// Delay before retry number `retry` (0-based)
    ///
    /// `base × multiplier^retry`, capped at `max`, then scaled by
    /// `1 + jitter × jitter_factor` with `jitter` in `[-1, 1]`.
    pub fn delay(&self, retry: u32, jitter: f64) -> Duration {
        let raw = self.base.as_secs_f64() * self.multiplier.powi(retry.min(i32::MAX as u32) as i32);
        let capped = raw.min(self.max.as_secs_f64());
        let jitter = jitter.clamp(-1.0, 1.0) * self.jitter_factor;
        Duration::from_secs_f64((capped * (1.0 + jitter)).max(0.0))
    }

    /// Largest delay this backoff can produce, jitter included
    pub fn ceiling(&self) -> Duration {
        self.max.mul_f64(1.0 + self.jitter_factor)
    }
}

/// Uniform jitter sample in `[-1, 1]`
pub fn sample_jitter() -> f64 {
    rand::thread_rng().gen_range(-1.0..=1.0)
}

/// Retry chain state
#[derive(Debug, Clone, PartialEq)]
pub enum RetryState {
    /// Waiting for the selector; `attempts` already spent, `last` their final error
    Idle {
        attempts: u32,
        last: Option<GatewayError>,
    },
    Attempting { attempt: u32, node: NodeId },
    RetryWait {
        attempts: u32,
        delay: Duration,
        last: GatewayError,
    },
    Succeeded { attempts: u32, node: NodeId },
    ExhaustedFailure { attempts: u32, error: GatewayError },
}

impl RetryState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RetryState::Succeeded { .. } | RetryState::ExhaustedFailure { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            RetryState::Idle { .. } => "idle",
            RetryState::Attempting { .. } => "attempting",
            RetryState::RetryWait { .. } => "retry_wait",
            RetryState::Succeeded { .. } => "succeeded",
            RetryState::ExhaustedFailure { .. } => "exhausted",
        }
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum RetryEvent {
    NodeSelected(NodeId),
    SelectionFailed(GatewayError),
    AttemptSucceeded,
    AttemptFailed(GatewayError),
    BackoffElapsed,
    Cancelled,
}

/// Attempt budget and backoff for one chain
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn from_profile(profile: &ComplexityProfile) -> Self {
        Self {
            max_attempts: profile.max_attempts.max(1),
            backoff: Backoff::from_profile(profile),
        }
    }

    /// Pure transition function
    pub fn transition(&self, state: &RetryState, event: RetryEvent, jitter: f64) -> RetryState {
        use RetryEvent as E;
        use RetryState as S;

        match (state, event) {
            (s, _) if s.is_terminal() => s.clone(),

            (S::Idle { attempts, .. }, E::Cancelled)
            | (S::Attempting { attempt: attempts, .. }, E::Cancelled)
            | (S::RetryWait { attempts, .. }, E::Cancelled) => S::ExhaustedFailure {
                attempts: *attempts,
                error: GatewayError::Cancelled,
            },

            (S::Idle { attempts, .. }, E::NodeSelected(node)) => S::Attempting {
                attempt: attempts + 1,
                node,
            },

            (S::Idle { attempts, last }, E::SelectionFailed(error)) => S::ExhaustedFailure {
                attempts: *attempts,
                error: wrap(*attempts, last.clone().unwrap_or(error)),
            },

            (S::Attempting { attempt, node }, E::AttemptSucceeded) => S::Succeeded {
                attempts: *attempt,
                node: *node,
            },

            (S::Attempting { attempt, .. }, E::AttemptFailed(error)) => {
                if !error.is_retryable() {
                    S::ExhaustedFailure {
                        attempts: *attempt,
                        error,
                    }
                } else if *attempt >= self.max_attempts {
                    S::ExhaustedFailure {
                        attempts: *attempt,
                        error: wrap(*attempt, error),
                    }
                } else {
                    S::RetryWait {
                        attempts: *attempt,
                        delay: self.backoff.delay(attempt - 1, jitter),
                        last: error,
                    }
                }
            }

            (S::RetryWait { attempts, last, .. }, E::BackoffElapsed) => S::Idle {
                attempts: *attempts,
                last: Some(last.clone()),
            },

            (state, event) => S::ExhaustedFailure {
                attempts: attempts_of(state),
                error: GatewayError::Protocol(format!(
                    "retry event {:?} invalid in state {}",
                    event,
                    state.name()
                )),
            },
        }
    }
}

fn attempts_of(state: &RetryState) -> u32 {
    match state {
        RetryState::Idle { attempts, .. }
        | RetryState::RetryWait { attempts, .. }
        | RetryState::Succeeded { attempts, .. }
        | RetryState::ExhaustedFailure { attempts, .. } => *attempts,
        RetryState::Attempting { attempt, .. } => *attempt,
    }
}

fn wrap(attempts: u32, error: GatewayError) -> GatewayError {
    if attempts == 0 {
        error
    } else {
        GatewayError::Exhausted {
            attempts,
            last: Box::new(error),
        }
    }
}

/// One request's retry chain: state plus the nodes it has given up on
#[derive(Debug)]
pub struct RetryChain {
    policy: RetryPolicy,
    state: RetryState,
    excluded: HashSet<NodeId>,
}

impl RetryChain {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: RetryState::Idle {
                attempts: 0,
                last: None,
            },
            excluded: HashSet::new(),
        }
    }

    pub fn state(&self) -> &RetryState {
        &self.state
    }

    pub fn excluded(&self) -> &HashSet<NodeId> {
        &self.excluded
    }

    /// Lift exclusions once every node has been tried, starting a new sweep
    pub fn clear_exclusions(&mut self) -> bool {
        let had_any = !self.excluded.is_empty();
        self.excluded.clear();
        had_any
    }

    /// Feed an event; a failed attempt's node is excluded from later selections
    pub fn apply(&mut self, event: RetryEvent, jitter: f64) -> &RetryState {
        if let (RetryState::Attempting { node, .. }, RetryEvent::AttemptFailed(_)) =
            (&self.state, &event)
        {
            self.excluded.insert(*node);
        }

        let next = self.policy.transition(&self.state, event, jitter);
        match &next {
            RetryState::RetryWait {
                attempts,
                delay,
                last,
            } => warn!(
                attempt = attempts,
                max = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %last,
                "Attempt failed, backing off"
            ),
            other => debug!(from = self.state.name(), to = other.name(), "Retry transition"),
        }
        self.state = next;
        &self.state
    }
}
