//! Event Emitter
//!
//! Wire events and the per-request protocol state machine:
//!
//! ```text
//! hello → delta* → (done → complete) | error
//! ```
//!
//! `complete` is the authoritative success signal; `done` always precedes it.
//! A request rejected before it is accepted (too long, over budget) gets a
//! lone `error`. Every stream ends in exactly one of `complete` or `error`.

use crate::classifier::Tier;
use crate::error::GatewayError;
use crate::upstream::Usage;
use serde::Serialize;
use tokio::time::Instant;
use tracing::error;

/// Token usage as reported on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WireUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl From<Usage> for WireUsage {
    fn from(usage: Usage) -> Self {
        Self {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: usage.total_tokens(),
        }
    }
}

/// Event sent to the caller
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    Hello {
        tier: Tier,
        #[serde(skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
    },
    Delta {
        text_fragment: String,
    },
    Done {},
    Complete {
        usage: WireUsage,
        /// USD charged by this request; zero when served from cache
        cost: f64,
        /// Milliseconds since the request was accepted
        elapsed: u64,
        cached: bool,
    },
    Error {
        kind: String,
        message: String,
        retryable: bool,
    },
}

impl GatewayEvent {
    pub fn name(&self) -> &'static str {
        match self {
            GatewayEvent::Hello { .. } => "hello",
            GatewayEvent::Delta { .. } => "delta",
            GatewayEvent::Done {} => "done",
            GatewayEvent::Complete { .. } => "complete",
            GatewayEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GatewayEvent::Complete { .. } | GatewayEvent::Error { .. }
        )
    }

    pub fn from_error(err: &GatewayError) -> Self {
        GatewayEvent::Error {
            kind: err.kind().to_string(),
            message: err.user_message(),
            retryable: err.caller_may_retry(),
        }
    }

}

/// Emitter protocol position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitterState {
    Idle,
    Streaming,
    Finished,
}

/// Enforces event ordering for one request
#[derive(Debug)]
pub struct EventEmitter {
    state: EmitterState,
    started: Instant,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self {
            state: EmitterState::Idle,
            started: Instant::now(),
        }
    }

    pub fn state(&self) -> EmitterState {
        self.state
    }

    fn violation(&self, event: &str) -> GatewayError {
        error!(state = ?self.state, event, "Event emitted out of order");
        GatewayError::Protocol(format!("{} not allowed in state {:?}", event, self.state))
    }

    pub fn hello(&mut self, tier: Tier, warning: Option<String>) -> Result<GatewayEvent, GatewayError> {
        if self.state != EmitterState::Idle {
            return Err(self.violation("hello"));
        }
        self.state = EmitterState::Streaming;
        Ok(GatewayEvent::Hello { tier, warning })
    }

    pub fn delta(&mut self, text: String) -> Result<GatewayEvent, GatewayError> {
        if self.state != EmitterState::Streaming {
            return Err(self.violation("delta"));
        }
        Ok(GatewayEvent::Delta {
            text_fragment: text,
        })
    }

    /// `done` followed by `complete`
    pub fn finish(
        &mut self,
        usage: Usage,
        cost_usd: f64,
        cached: bool,
    ) -> Result<[GatewayEvent; 2], GatewayError> {
        if self.state != EmitterState::Streaming {
            return Err(self.violation("complete"));
        }
        self.state = EmitterState::Finished;
        Ok([
            GatewayEvent::Done {},
            GatewayEvent::Complete {
                usage: usage.into(),
                cost: cost_usd,
                elapsed: self.started.elapsed().as_millis() as u64,
                cached,
            },
        ])
    }

    /// Terminal error, valid before or after `hello` but never after a terminal
    pub fn error(&mut self, err: &GatewayError) -> Result<GatewayEvent, GatewayError> {
        if self.state == EmitterState::Finished {
            return Err(self.violation("error"));
        }
        self.state = EmitterState::Finished;
        Ok(GatewayEvent::from_error(err))
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_sequence() {
        let mut emitter = EventEmitter::new();

        let hello = emitter.hello(Tier::Long, None).unwrap();
        assert_eq!(hello.name(), "hello");
        emitter.delta("a".into()).unwrap();
        emitter.delta("b".into()).unwrap();

        let [done, complete] = emitter.finish(Usage::default(), 0.0, false).unwrap();
        assert_eq!(done.name(), "done");
        assert!(complete.is_terminal());
        assert_eq!(emitter.state(), EmitterState::Finished);
    }

    #[test]
    fn test_rejects_out_of_order() {
        let mut emitter = EventEmitter::new();
        assert!(emitter.delta("early".into()).is_err());
        assert!(emitter.finish(Usage::default(), 0.0, false).is_err());

        emitter.hello(Tier::Simple, None).unwrap();
        assert!(emitter.hello(Tier::Simple, None).is_err());

        emitter.finish(Usage::default(), 0.0, false).unwrap();
        assert!(emitter.delta("late".into()).is_err());
        assert!(emitter.error(&GatewayError::NoNodeAvailable).is_err());
    }

    #[test]
    fn test_preflight_error_without_hello() {
        let mut emitter = EventEmitter::new();
        let event = emitter
            .error(&GatewayError::QuestionTooLong {
                length: 10,
                max: 5,
            })
            .unwrap();

        match event {
            GatewayEvent::Error { kind, retryable, .. } => {
                assert_eq!(kind, "question_too_long");
                assert!(!retryable);
            }
            other => panic!("Expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_wire_format() {
        let hello = GatewayEvent::Hello {
            tier: Tier::Extreme,
            warning: None,
        };
        assert_eq!(
            serde_json::to_string(&hello).unwrap(),
            r#"{"event":"hello","tier":"extreme"}"#
        );

        assert_eq!(serde_json::to_string(&GatewayEvent::Done {}).unwrap(), r#"{"event":"done"}"#);

        let delta = GatewayEvent::Delta {
            text_fragment: "hi".into(),
        };
        assert_eq!(
            serde_json::to_string(&delta).unwrap(),
            r#"{"event":"delta","text_fragment":"hi"}"#
        );

        let error = GatewayEvent::from_error(&GatewayError::NoNodeAvailable);
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["kind"], "no_node_available");
        assert!(json.get("message").is_some());
        assert!(json.get("retryable").is_some());
    }

    #[test]
    fn test_complete_payload() {
        let mut emitter = EventEmitter::new();
        emitter.hello(Tier::Simple, None).unwrap();
        let [_, complete] = emitter
            .finish(
                Usage {
                    input_tokens: 3,
                    output_tokens: 4,
                },
                0.01,
                true,
            )
            .unwrap();

        let json = serde_json::to_value(&complete).unwrap();
        assert_eq!(json["event"], "complete");
        assert_eq!(json["usage"]["total_tokens"], 7);
        assert_eq!(json["cost"], 0.01);
        assert!(json["elapsed"].is_u64());
        assert_eq!(json["cached"], true);
    }
}
