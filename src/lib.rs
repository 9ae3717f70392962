// BENCHMANAGER LIBRARY
// PROCESS LIFECYCLE FOR ONE BENCHMARK RUN: SPAWN ORDER, SETTLE POLICY,
// SERVER WAIT, TEARDOWN. SHARED BY THE BINARY AND THE tests/ CRATES.

pub mod config;
pub mod error;
pub mod process;
pub mod readiness;
pub mod report;
pub mod session;

pub use config::BenchConfig;
pub use error::{ProcessIssue, SessionError, SpawnError, TerminationError};
pub use process::{ExitState, ManagedProcess, Role, TerminationOutcome};
pub use session::{BenchmarkResult, BenchmarkSession, ServerOutcome};
