//! Complexity Classifier
//!
//! Maps a question's length to an operating profile: how long one attempt
//! may run, how many tokens it may produce, how many attempts the retry
//! chain gets and how long to back off between them.
//!
//! Extreme mode widens every tier's limits; it never moves tier boundaries.

use crate::error::{GatewayError, Result};
use serde::Serialize;
use std::time::Duration;

/// Complexity tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Simple,
    Long,
    Extreme,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Simple => "simple",
            Tier::Long => "long",
            Tier::Extreme => "extreme",
        }
    }
}

/// Limits for a single tier
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierLimits {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub max_tokens: usize,
}

/// Classifier configuration
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Questions at or above this length are `Long`
    pub long_threshold: usize,
    /// Questions at or above this length are `Extreme`
    pub extreme_threshold: usize,
    /// Absolute ceiling, rejected before any node contact
    pub max_question_chars: usize,
    pub simple: TierLimits,
    pub long: TierLimits,
    pub extreme: TierLimits,
    pub backoff_base: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
    /// Longest tolerated gap between two chunks
    pub chunk_timeout: Duration,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            long_threshold: 5_000,
            extreme_threshold: 20_000,
            max_question_chars: 50_000,
            simple: TierLimits {
                timeout: Duration::from_secs(180),
                max_attempts: 2,
                max_tokens: 4_000,
            },
            long: TierLimits {
                timeout: Duration::from_secs(300),
                max_attempts: 4,
                max_tokens: 16_000,
            },
            extreme: TierLimits {
                timeout: Duration::from_secs(600),
                max_attempts: 8,
                max_tokens: 32_000,
            },
            backoff_base: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
            chunk_timeout: Duration::from_secs(60),
        }
    }
}

/// Operating profile derived from a question
#[derive(Debug, Clone, PartialEq)]
pub struct ComplexityProfile {
    pub tier: Tier,
    pub max_tokens: usize,
    /// Wall-clock bound for one attempt
    pub timeout: Duration,
    /// Maximum gap between chunks within one attempt
    pub chunk_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
    pub extreme_mode: bool,
}

impl ComplexityProfile {
    /// Upper bound on the whole retry chain: `max_attempts × (timeout + max_backoff)`
    pub fn latency_bound(&self) -> Duration {
        (self.timeout + self.max_backoff) * self.max_attempts
    }
}

/// Length-based complexity classifier
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    config: ClassifierConfig,
}

impl Classifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Tier for a question length; boundaries are inclusive-exclusive
    pub fn tier_for(&self, question_length: usize) -> Tier {
        if question_length < self.config.long_threshold {
            Tier::Simple
        } else if question_length < self.config.extreme_threshold {
            Tier::Long
        } else {
            Tier::Extreme
        }
    }

    /// Classify a question length into a profile
    pub fn classify(&self, question_length: usize, extreme_mode: bool) -> Result<ComplexityProfile> {
        if question_length > self.config.max_question_chars {
            return Err(GatewayError::QuestionTooLong {
                length: question_length,
                max: self.config.max_question_chars,
            });
        }

        let tier = self.tier_for(question_length);
        let limits = match tier {
            Tier::Simple => self.config.simple,
            Tier::Long => self.config.long,
            Tier::Extreme => self.config.extreme,
        };

        let mut profile = ComplexityProfile {
            tier,
            max_tokens: limits.max_tokens,
            timeout: limits.timeout,
            chunk_timeout: self.config.chunk_timeout,
            max_attempts: limits.max_attempts.max(1),
            backoff_base: self.config.backoff_base,
            backoff_multiplier: self.config.backoff_multiplier,
            max_backoff: self.config.max_backoff,
            extreme_mode,
        };

        if extreme_mode {
            amplify(&mut profile);
        }

        Ok(profile)
    }
}

/// Extreme mode: timeouts ×10/3, attempts ×4, tokens ×2
fn amplify(profile: &mut ComplexityProfile) {
    profile.timeout = profile.timeout * 10 / 3;
    profile.chunk_timeout = profile.chunk_timeout * 10 / 3;
    profile.max_attempts = profile.max_attempts.saturating_mul(4);
    profile.max_tokens = profile.max_tokens.saturating_mul(2);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_tier() {
        let classifier = Classifier::default();
        let profile = classifier.classify(3_000, false).unwrap();

        assert_eq!(profile.tier, Tier::Simple);
        assert_eq!(profile.max_attempts, 2);
        assert_eq!(profile.timeout, Duration::from_secs(180));
    }

    #[test]
    fn test_extreme_tier() {
        let classifier = Classifier::default();
        let profile = classifier.classify(25_000, false).unwrap();

        assert_eq!(profile.tier, Tier::Extreme);
        assert_eq!(profile.max_attempts, 8);
        assert_eq!(profile.timeout, Duration::from_secs(600));
        assert_eq!(profile.max_tokens, 32_000);
    }

    #[test]
    fn test_boundaries_inclusive_exclusive() {
        let classifier = Classifier::default();

        assert_eq!(classifier.tier_for(4_999), Tier::Simple);
        assert_eq!(classifier.tier_for(5_000), Tier::Long);
        assert_eq!(classifier.tier_for(19_999), Tier::Long);
        assert_eq!(classifier.tier_for(20_000), Tier::Extreme);
    }

    #[test]
    fn test_ceiling_rejects() {
        let classifier = Classifier::default();

        assert!(classifier.classify(50_000, false).is_ok());
        match classifier.classify(50_001, true) {
            Err(GatewayError::QuestionTooLong { length, max }) => {
                assert_eq!(length, 50_001);
                assert_eq!(max, 50_000);
            }
            other => panic!("Expected QuestionTooLong, got {:?}", other),
        }
    }

    #[test]
    fn test_extreme_mode_amplifies_without_reclassifying() {
        let classifier = Classifier::default();
        let normal = classifier.classify(3_000, false).unwrap();
        let amplified = classifier.classify(3_000, true).unwrap();

        assert_eq!(amplified.tier, Tier::Simple);
        assert_eq!(amplified.timeout, Duration::from_secs(600));
        assert_eq!(amplified.max_attempts, normal.max_attempts * 4);
        assert_eq!(amplified.max_tokens, normal.max_tokens * 2);
    }

    #[test]
    fn test_latency_bound() {
        let classifier = Classifier::default();
        let profile = classifier.classify(10, false).unwrap();

        assert_eq!(profile.latency_bound(), Duration::from_secs((180 + 30) * 2));
    }
}
