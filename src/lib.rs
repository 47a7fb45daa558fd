//! Gateway Mesh
//!
//! Streaming AI gateway in front of a mesh of model-serving nodes.
//!
//! # Features
//!
//! - **Complexity Tiers**: question length picks timeouts, token and attempt budgets
//! - **Request Deduplication**: identical in-flight questions share one upstream call
//! - **Response Caching**: context-scoped SHA256 fingerprints in a TTL cache
//! - **Health-aware Routing**: round-robin with rate-limit and failure cooldowns
//! - **Retries**: explicit retry state machine with jittered exponential backoff
//! - **Budgets**: session cost ledger with soft-warn or hard-fail ceilings
//! - **Streaming**: ordered `hello → delta* → done → complete | error` events over SSE
//!
//! # Architecture
//!
//! ```text
//! Client ──► POST /v1/ask ──► Gateway ──► Classifier ──► Ledger (reserve)
//!             (SSE)              │
//!                                ├── Cache (Moka)
//!                                ├── Deduplicator ──► owner task
//!                                │                      ├── RetryChain
//!                                │                      ├── NodeRegistry (select)
//!                                │                      └── Executor ──► Upstream node
//!                                └── EventEmitter
//! ```

pub mod cache;
pub mod classifier;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod gateway;
pub mod inflight;
pub mod ledger;
pub mod node;
pub mod retry;
pub mod server;
pub mod upstream;

pub use config::Config;
pub use error::{GatewayError, Result};
pub use events::GatewayEvent;
pub use gateway::{EventStream, Gateway, GatewayStats, Question};
pub use upstream::{HttpUpstream, Upstream};
