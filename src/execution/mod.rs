//! Workflow Execution Module
//!
//! Runs validated workflows: dispatches units concurrently, retries failed
//! attempts and honors cancellation.
//!
//! # Architecture
//!
//! - [`engine`]: Run lifecycle and the dispatch loop
//! - [`step`]: Runners that execute a single unit
//! - [`secrets`]: Secret providers consulted at dispatch

pub mod engine;
pub mod secrets;
pub mod step;

pub use engine::{Engine, Run, RunHandle};
pub use secrets::{NoSecrets, SecretProvider, StaticSecrets};
pub use step::{DryRunRunner, RunnerOutcome, ShellRunner, StepRunner};
