//! mailpipe — IMAP ingestion fleet.
//!
//! Keeps live sessions to many user mailboxes under per-host concurrency
//! and rate caps, watches them via IDLE or adaptive polling, and forwards
//! a normalized envelope per observed message to a downstream durable
//! queue. A relational store records each mailbox's connection lifecycle
//! and counters for the operators.
//!
//! ## Module organization
//!
//! - `adapters/`: IMAP, SQLite, and queue-sink adapter layers
//! - `pool/`: connection pool with host grouping and admission control
//! - `scheduler/`: per-mailbox scheduling, backoff, and IDLE gating
//! - `workers/`: bounded worker fleet over a tiered task queue
//! - `monitor/`: per-task IMAP interaction (poll and IDLE flows)
//! - `state/`: application context wiring and shutdown
//! - `http/`: read-only observability endpoints
//! - `config/`: environment-driven settings
//! - `types/`: shared data types and the error enum

pub mod adapters;
pub mod config;
pub mod http;
pub mod monitor;
pub mod pool;
pub mod scheduler;
pub mod state;
pub mod types;
pub mod workers;

pub use config::Settings;
pub use state::AppContext;
pub use types::{Envelope, IngestError, Mailbox};
