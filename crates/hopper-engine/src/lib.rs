//! hopper-engine: the core of hopper.
//!
//! This crate provides:
//!
//! - **sink**: bounded per-execution output capture and the line-atomic
//!   funnel that aggregates result streams
//! - **reader**: the stdin line filter feeding the target channel
//! - **exec**: the local executor — a worker pool running commands under
//!   per-target deadlines
//! - **agent**: the per-hop auth agent supervisor
//! - **jump**: the fan-out coordinator relaying targets through jump hosts
//! - **logpipe**: hop-tagged diagnostics for remote stderr streams
//! - **freq**: the histogram post-processor over result streams
//! - **serve**: the one-blob TCP file server
//!
//! The executors are async functions threaded with one hierarchical
//! cancellation scope; tripping it terminates every worker, child process,
//! and agent the run owns.

pub mod agent;
pub mod exec;
pub mod freq;
pub mod jump;
pub mod logpipe;
pub mod reader;
pub mod serve;
pub mod sink;

pub use agent::AgentError;
pub use exec::RunError;
pub use freq::{GroupBy, Item};
pub use reader::read_targets;
pub use serve::{FileServer, ServeError};
pub use sink::{BoundedSink, LineSink, TRUNCATION_MARKER};
