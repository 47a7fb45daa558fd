//! Cost/Token Budget Ledger
//!
//! Running token and cost totals for the current session. Totals only grow
//! (atomic adds) until `reset()` opens a new session. Each attempt holds one
//! `CommitToken` and `commit` consumes it, so an attempt is counted at most
//! once without the ledger remembering past attempts.
//!
//! Hard-fail mode denies new requests once cumulative cost reaches the
//! ceiling; soft mode always grants and attaches a warning instead.

use crate::executor::AttemptId;
use crate::upstream::Usage;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

const MICROS_PER_USD: f64 = 1_000_000.0;

/// Pricing per million tokens (USD)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
}

impl ModelPricing {
    pub const HAIKU: Self = Self {
        input: 0.25,
        output: 1.25,
    };

    pub const SONNET: Self = Self {
        input: 3.0,
        output: 15.0,
    };

    pub const OPUS: Self = Self {
        input: 15.0,
        output: 75.0,
    };

    /// Pricing for a model family name; unknown names price as Sonnet
    pub fn for_model(model: &str) -> Self {
        let bytes = model.as_bytes();
        if bytes.windows(5).any(|w| w.eq_ignore_ascii_case(b"haiku")) {
            return Self::HAIKU;
        }
        if bytes.windows(4).any(|w| w.eq_ignore_ascii_case(b"opus")) {
            return Self::OPUS;
        }
        Self::SONNET
    }

    pub fn cost(&self, usage: &Usage) -> f64 {
        (usage.input_tokens as f64 * self.input + usage.output_tokens as f64 * self.output)
            / 1_000_000.0
    }

    /// Pre-flight estimate: question tokens in, the whole token budget out
    pub fn estimate(&self, question: &str, max_tokens: usize) -> f64 {
        let usage = Usage {
            input_tokens: estimate_tokens(question),
            output_tokens: max_tokens as u64,
        };
        self.cost(&usage)
    }
}

/// Approximate token count (~3.8 chars per token for English text)
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    (text.chars().count() as f64 / 3.8).ceil() as u64
}

/// One-shot right to commit an attempt's usage
///
/// Not `Clone`; `BudgetLedger::commit` takes it by value.
#[derive(Debug)]
pub struct CommitToken {
    attempt: AttemptId,
}

impl CommitToken {
    pub fn new(attempt: AttemptId) -> Self {
        Self { attempt }
    }
}

/// Ledger configuration
#[derive(Debug, Clone, Default)]
pub struct BudgetConfig {
    /// Session cost ceiling in USD; `None` disables budgeting
    pub ceiling_usd: Option<f64>,
    /// Deny requests at the ceiling instead of warning
    pub hard_fail: bool,
}

/// Outcome of a pre-flight reservation
#[derive(Debug, Clone, PartialEq)]
pub enum Reservation {
    Granted { warning: Option<String> },
    Denied { spent: f64, ceiling: f64 },
}

impl Reservation {
    pub fn is_granted(&self) -> bool {
        matches!(self, Reservation::Granted { .. })
    }
}

/// Ledger totals
#[derive(Debug, Clone, Serialize)]
pub struct LedgerSnapshot {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub commits: u64,
    pub warnings: u64,
    pub denials: u64,
    pub ceiling_usd: Option<f64>,
    pub hard_fail: bool,
    pub session_started: DateTime<Utc>,
}

/// Session budget ledger
#[derive(Debug)]
pub struct BudgetLedger {
    config: BudgetConfig,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    cost_micros: AtomicU64,
    commits: AtomicU64,
    warnings: AtomicU64,
    denials: AtomicU64,
    session_started: Mutex<DateTime<Utc>>,
}

impl BudgetLedger {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
            cost_micros: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            warnings: AtomicU64::new(0),
            denials: AtomicU64::new(0),
            session_started: Mutex::new(Utc::now()),
        }
    }

    /// Cumulative cost of the current session
    pub fn spent_usd(&self) -> f64 {
        self.cost_micros.load(Ordering::Acquire) as f64 / MICROS_PER_USD
    }

    /// Check whether a request with the given estimated cost may start
    pub fn reserve(&self, estimate_usd: f64) -> Reservation {
        let Some(ceiling) = self.config.ceiling_usd else {
            return Reservation::Granted { warning: None };
        };

        let spent = self.spent_usd();

        if spent >= ceiling {
            if self.config.hard_fail {
                self.denials.fetch_add(1, Ordering::Relaxed);
                warn!(spent, ceiling, "Budget exhausted, request denied");
                return Reservation::Denied { spent, ceiling };
            }
            self.warnings.fetch_add(1, Ordering::Relaxed);
            warn!(spent, ceiling, "Budget exhausted, soft mode continues");
            return Reservation::Granted {
                warning: Some(format!(
                    "Session budget exceeded: ${:.4} spent of ${:.4}",
                    spent, ceiling
                )),
            };
        }

        if spent + estimate_usd >= ceiling {
            self.warnings.fetch_add(1, Ordering::Relaxed);
            warn!(spent, estimate_usd, ceiling, "Request may cross the budget ceiling");
            return Reservation::Granted {
                warning: Some(format!(
                    "This request may exceed the session budget: ${:.4} spent, up to ${:.4} more, ceiling ${:.4}",
                    spent, estimate_usd, ceiling
                )),
            };
        }

        Reservation::Granted { warning: None }
    }

    /// Record actual usage of an attempt
    pub fn commit(&self, token: CommitToken, usage: &Usage, cost_usd: f64) {
        let attempt = token.attempt;
        let micros = (cost_usd.max(0.0) * MICROS_PER_USD).round() as u64;
        self.input_tokens.fetch_add(usage.input_tokens, Ordering::AcqRel);
        self.output_tokens.fetch_add(usage.output_tokens, Ordering::AcqRel);
        self.cost_micros.fetch_add(micros, Ordering::AcqRel);
        self.commits.fetch_add(1, Ordering::AcqRel);

        debug!(
            %attempt,
            tokens = usage.total_tokens(),
            cost_usd,
            "Usage committed"
        );
    }

    /// Start a new session scope
    pub fn reset(&self) {
        self.input_tokens.store(0, Ordering::Release);
        self.output_tokens.store(0, Ordering::Release);
        self.cost_micros.store(0, Ordering::Release);
        self.commits.store(0, Ordering::Release);
        self.warnings.store(0, Ordering::Release);
        self.denials.store(0, Ordering::Release);
        *self.session_started.lock() = Utc::now();
        info!("Budget ledger reset, new session started");
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            input_tokens: self.input_tokens.load(Ordering::Acquire),
            output_tokens: self.output_tokens.load(Ordering::Acquire),
            cost_usd: self.spent_usd(),
            commits: self.commits.load(Ordering::Acquire),
            warnings: self.warnings.load(Ordering::Relaxed),
            denials: self.denials.load(Ordering::Relaxed),
            ceiling_usd: self.config.ceiling_usd,
            hard_fail: self.config.hard_fail,
            session_started: *self.session_started.lock(),
        }
    }
}

impl Default for BudgetLedger {
    fn default() -> Self {
        Self::new(BudgetConfig::default())
    }
}
