//! Stepflow - In-Process Workflow Engine
//!
//! Runs workflows of parameterized steps arranged in a dependency graph.
//! Steps can be gated on the output of earlier steps, and group steps fan
//! out into bounded-parallel members, one per item.
//!
//! # Architecture
//!
//! The library is organized into four main modules:
//!
//! - [`workflow`]: Definitions, validation, planning and run state
//! - [`execution`]: Async engine, step runners and secret providers
//! - [`monitoring`]: Resource usage tracking and execution timeline
//! - [`error`]: Error types shared by all of the above
//!
//! # Example
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! use stepflow::execution::{Engine, ShellRunner};
//! use stepflow::load_registry;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load and check a definition
//!     let registry = load_registry("demos/db-maintenance.yaml")?;
//!
//!     // Create execution engine
//!     let mut engine = Engine::new(registry, Arc::new(ShellRunner::new()));
//!     engine.set_max_parallel(4);
//!
//!     // Submit with workflow arguments and run
//!     let args = BTreeMap::from([("db-host".to_string(), "pg-primary".to_string())]);
//!     let run = engine.submit(args)?.execute().await?;
//!     println!("{}", run.status());
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod execution;
pub mod monitoring;
pub mod workflow;

// Re-export commonly used types
pub use error::{Error, Result};
pub use execution::engine::Engine;
pub use workflow::model::{StepTemplate, WorkflowDefinition};
pub use workflow::parser::{load_definition, load_registry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Stepflow";
