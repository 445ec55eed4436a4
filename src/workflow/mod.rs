//! Workflow Definition Module
//!
//! Data structures and rules for defining, checking and planning
//! workflows of parameterized steps.
//!
//! # Structure
//!
//! - [`model`]: Step templates, gates, parameters and definitions
//! - [`registry`]: Registration and lookup of step templates
//! - [`params`]: Placeholder substitution and parameter binding
//! - [`condition`]: Gate evaluation against captured outputs
//! - [`validator`]: Static checks and topological ordering
//! - [`planner`]: Readiness, skip propagation and concurrency caps
//! - [`state`]: Run state store and transition log
//! - [`parser`]: YAML/JSON loading

pub mod condition;
pub mod model;
pub mod params;
pub mod parser;
pub mod planner;
pub mod registry;
pub mod state;
pub mod validator;

pub use model::{
    CompareOp, Condition, ExecutableSpec, Literal, ParamRef, ParamSource, ResourceLimits,
    RetryPolicy, SecretRef, StepKind, StepTemplate, WorkflowDefinition,
};
pub use params::{ConcreteArgs, ParameterResolver};
pub use parser::{load_arguments_file, load_definition, load_registry};
pub use planner::{Action, ExecutionPlanner};
pub use registry::{RegistryBuilder, StepRegistry};
pub use state::{
    InstanceId, Reason, RunStateStore, RunStatus, StepInstance, StepStatus, Transition,
    WorkflowRun,
};
