//! Error types for stepflow.
//!
//! Errors are split by the phase that raises them: definition errors are
//! caught before a run starts, run errors halt a run in progress, and runner
//! and secret errors are operational failures that end up on a single step
//! instance rather than aborting the run.

use thiserror::Error;

use crate::workflow::state::StepStatus;

/// Result type alias for crate-level operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Problems with a workflow definition, detected before any dispatch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DefinitionError {
    #[error("Workflow has no steps")]
    EmptyWorkflow,

    #[error("Duplicate step name: '{0}'")]
    DuplicateName(String),

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    DanglingDependency { step: String, dependency: String },

    #[error("Workflow contains cyclic dependencies between steps: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    #[error("Step '{step}': parameter '{key}' cannot be resolved")]
    UnresolvedParameter { step: String, key: String },

    #[error("Step '{0}' not found")]
    NotFound(String),

    #[error("Step '{step}': {reason}")]
    InvalidTemplate { step: String, reason: String },

    #[error("Step '{step}' gates on '{reference}', which is not one of its dependencies")]
    UnreachableGateReference { step: String, reference: String },
}

/// Errors that halt a run after it has been created.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("Output of step '{0}' read before the step finished")]
    OutputNotReady(String),

    #[error("Illegal transition for '{instance}': expected {expected}, found {actual} (requested {requested})")]
    IllegalTransition {
        instance: String,
        expected: StepStatus,
        actual: StepStatus,
        requested: StepStatus,
    },

    #[error("Unknown step instance: '{0}'")]
    UnknownInstance(String),

    #[error("Run state lock poisoned")]
    StatePoisoned,

    #[error("Run state I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Run state JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures at the executable unit boundary.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to prepare execution script: {0}")]
    Script(#[source] std::io::Error),

    #[error("Timed out after {0}s")]
    Timeout(u64),

    #[error("Cancelled")]
    Cancelled,

    #[error("Runner panicked: {0}")]
    Panicked(String),
}

/// Failures resolving an opaque secret reference.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SecretError {
    #[error("Unknown secret store '{0}'")]
    UnknownStore(String),

    #[error("Secret store '{store}' has no key '{key}'")]
    UnknownKey { store: String, key: String },

    #[error("Failed to load secrets: {0}")]
    Load(String),
}

/// Crate-level error used by loaders and the CLI.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),

    #[error("Secret error: {0}")]
    Secret(#[from] SecretError),

    #[error("Failed to read '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Short machine-readable code for the error class.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Definition(_) => "DEFINITION_ERROR",
            Error::Run(_) => "RUN_ERROR",
            Error::Secret(_) => "SECRET_ERROR",
            Error::Read { .. } => "READ_ERROR",
            Error::Yaml(_) => "YAML_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }
}
