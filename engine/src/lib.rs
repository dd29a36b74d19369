//! # Game Server Query Engine
//!
//! This library drives many concurrent game-server queries from a single
//! thread. Each server is a target with its own phase plan, retry budget and
//! partial result; the engine routes datagrams to targets, hands payloads to
//! the target's codec and decides what to send next.
//!
//! ## Core Responsibilities
//!
//! ### Phase Sequencing
//! A target walks through challenge, status, rules and players in order,
//! skipping whatever the caller did not ask for or the status reply already
//! carried. Rules are never requested before a required challenge completed.
//!
//! ### Retries and Timeouts
//! Every phase may be sent `retries + 1` times, one retry interval apart.
//! When the budget of a phase is spent the phase times out: a target that
//! never received anything ends as `Timeout`, one that lost only some phases
//! ends as `Ok` with a `missing_*` flag for each of them.
//!
//! ### Reassembly Without Recursion
//! A codec that completes a split reply queues the joined payload. The engine
//! drains that queue in a loop, so a chain of completed phases never recurses.
//!
//! ## Architecture Design
//!
//! ### Sans-IO Core
//! [`QueryEngine`] owns no socket and reads no clock. Callers pass the current
//! [`std::time::Instant`] to every entry point, collect outgoing datagrams
//! with `poll_transmit` and feed back what arrives. This keeps every state
//! transition a synchronous reaction to one event and makes timing fully
//! scriptable in tests.
//!
//! ### Tokio Driver
//! [`QueryDriver`] binds one UDP socket and runs the engine with a
//! `tokio::select!` loop over the socket and a tick interval.
//!
//! ## Module Organization
//!
//! ### Config Module (`config`)
//! Immutable per-query options cloned into each target.
//!
//! ### State Module (`state`)
//! Phase plan, budgets, send timestamps and round-trip accounting.
//!
//! ### Target Module (`target`)
//! Per-server state, terminal statuses and `PROTOCOL:HOST[:PORT]` parsing.
//!
//! ### Engine Module (`engine`)
//! Target registry, datagram routing, broadcast children and reports.
//!
//! ### Diagnostics Module (`diagnostics`)
//! Sink for codec errors, enabled per query with `show_errors`.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use engine::{QueryConfig, QueryDriver, QueryEngine};
//! use std::time::Instant;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut engine = QueryEngine::new();
//!     let config = QueryConfig::new().with_rules(true).with_players(true);
//!     engine.add_target("a2s", "192.0.2.10:27015".parse()?, &config, Instant::now())?;
//!
//!     let mut driver = QueryDriver::bind("0.0.0.0:0", engine).await?;
//!     for report in driver.run().await? {
//!         println!("{}", serde_json::to_string(&report)?);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod network;
pub mod state;
pub mod target;

pub use config::QueryConfig;
pub use diagnostics::{Diagnostic, DiagnosticSink, LogSink};
pub use engine::{QueryEngine, QueryReport, Transmit};
pub use error::EngineError;
pub use network::QueryDriver;
pub use state::{PhaseStatus, QueryStateMachine, SendDecision};
pub use target::{Target, TargetId, TargetMode, TargetSpec, TargetStatus};
