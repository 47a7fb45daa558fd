//! Gateway Error Taxonomy
//!
//! Every failure a request can end in. Retryable classes are absorbed by the
//! retry controller; only the final outcome reaches the caller as an `error`
//! event carrying `kind()`, `user_message()` and `is_retryable()`.

use std::time::Duration;
use thiserror::Error;

/// Gateway errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("Question too long: {length} chars (max {max})")]
    QuestionTooLong { length: usize, max: usize },

    #[error("Node {node} rate limited")]
    RateLimited {
        node: String,
        retry_after: Option<Duration>,
    },

    #[error("Node {node} timed out after {elapsed:?}")]
    Timeout { node: String, elapsed: Duration },

    #[error("Transient upstream error from {node}: {message}")]
    TransientUpstream { node: String, message: String },

    #[error("Fatal upstream error from {node} ({code}): {message}")]
    FatalUpstream {
        node: String,
        code: u16,
        message: String,
    },

    #[error("No node available")]
    NoNodeAvailable,

    #[error("Budget exceeded: ${spent:.4} of ${ceiling:.4}")]
    BudgetExceeded { spent: f64, ceiling: f64 },

    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<GatewayError>,
    },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Protocol violation: {0}")]
    Protocol(String),
}

impl GatewayError {
    /// Wire name used in `error{kind}`
    ///
    /// `Exhausted` reports the class of the last failure so the caller sees
    /// what actually went wrong rather than the bookkeeping wrapper.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::QuestionTooLong { .. } => "question_too_long",
            Self::RateLimited { .. } => "rate_limited",
            Self::Timeout { .. } => "timeout",
            Self::TransientUpstream { .. } => "transient_upstream_error",
            Self::FatalUpstream { .. } => "fatal_upstream_error",
            Self::NoNodeAvailable => "no_node_available",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::Exhausted { last, .. } => last.kind(),
            Self::Cancelled => "cancelled",
            Self::Protocol(_) => "protocol",
        }
    }

    /// Whether the retry controller may spend another attempt on this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Timeout { .. } | Self::TransientUpstream { .. }
        )
    }

    /// Whether the caller could reasonably resubmit the same request later
    pub fn caller_may_retry(&self) -> bool {
        match self {
            Self::Exhausted { last, .. } => last.caller_may_retry(),
            Self::NoNodeAvailable | Self::Cancelled => true,
            other => other.is_retryable(),
        }
    }

    /// Human-actionable message for the terminal `error` event
    pub fn user_message(&self) -> String {
        match self {
            Self::QuestionTooLong { length, max } => format!(
                "Your question is {} characters, the limit is {}. Split it into smaller parts and ask them one at a time.",
                length, max
            ),
            Self::RateLimited { retry_after, .. } => match retry_after {
                Some(d) => format!(
                    "The AI backends are rate limiting requests. Retry in about {}s.",
                    d.as_secs().max(1)
                ),
                None => "The AI backends are rate limiting requests. Retry in a minute.".to_string(),
            },
            Self::Timeout { elapsed, .. } => format!(
                "The answer took longer than {}s. Enable extreme mode for long questions, or retry later.",
                elapsed.as_secs()
            ),
            Self::TransientUpstream { .. } => {
                "The AI backend had a temporary failure. Retry in a few moments.".to_string()
            }
            Self::FatalUpstream { code, message, .. } => format!(
                "The AI backend rejected the request ({}): {}. Rephrase the question before resubmitting.",
                code, message
            ),
            Self::NoNodeAvailable => {
                "No AI backend is currently available. Retry later.".to_string()
            }
            Self::BudgetExceeded { spent, ceiling } => format!(
                "The session cost budget is used up (${:.2} of ${:.2}). Raise the ceiling or start a new session.",
                spent, ceiling
            ),
            Self::Exhausted { attempts, last } => {
                format!("{} (gave up after {} attempts)", last.user_message(), attempts)
            }
            Self::Cancelled => "The request was cancelled.".to_string(),
            Self::Protocol(msg) => format!("Internal streaming error: {}", msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        let rate = GatewayError::RateLimited {
            node: "a".into(),
            retry_after: None,
        };
        let timeout = GatewayError::Timeout {
            node: "a".into(),
            elapsed: Duration::from_secs(1),
        };
        let fatal = GatewayError::FatalUpstream {
            node: "a".into(),
            code: 401,
            message: "unauthorized".into(),
        };

        assert!(rate.is_retryable());
        assert!(timeout.is_retryable());
        assert!(!fatal.is_retryable());
        assert!(!GatewayError::NoNodeAvailable.is_retryable());
        assert!(!GatewayError::QuestionTooLong { length: 2, max: 1 }.is_retryable());
    }

    #[test]
    fn test_exhausted_reports_last_kind() {
        let err = GatewayError::Exhausted {
            attempts: 2,
            last: Box::new(GatewayError::RateLimited {
                node: "a".into(),
                retry_after: Some(Duration::from_secs(5)),
            }),
        };

        assert_eq!(err.kind(), "rate_limited");
        assert!(err.caller_may_retry());
        assert!(err.user_message().contains("2 attempts"));
    }

    #[test]
    fn test_too_long_message_is_actionable() {
        let err = GatewayError::QuestionTooLong {
            length: 60_000,
            max: 50_000,
        };
        assert!(err.user_message().contains("Split"));
        assert_eq!(err.kind(), "question_too_long");
    }
}
