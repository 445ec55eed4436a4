//! Parameter Resolution
//!
//! Turns a step template plus the run's workflow arguments (and, for group
//! members, one iteration binding) into concrete arguments for the runner.
//!
//! Placeholders are written `{{name}}`. A name is looked up in a table built
//! from, lowest precedence first:
//! 1. literal inputs declared by the template
//! 2. workflow arguments, by name and through `workflow_arg` inputs
//! 3. the iteration binding, by key and through `iteration` inputs
//!
//! Iteration values may contain placeholders of workflow arguments, which
//! are filled in before the binding is applied.
//!
//! Every declared input and every placeholder must resolve, otherwise
//! [`DefinitionError::UnresolvedParameter`] names the missing key.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use log::debug;

use crate::error::DefinitionError;

use super::model::{IterationBinding, ParamSource, ResourceLimits, StepTemplate};

/// Opening and closing placeholder delimiters.
const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Fully materialized executable unit, ready for a runner.
#[derive(Clone, PartialEq, Default)]
pub struct ConcreteArgs {
    /// Display id of the instance being run (e.g. `restart[1]`)
    pub instance: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Values fetched from the secret provider at dispatch
    pub secret_env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub resources: ResourceLimits,
    /// The resolved parameter table
    pub params: BTreeMap<String, String>,
}

impl fmt::Debug for ConcreteArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted: BTreeMap<&str, &str> = self
            .secret_env
            .keys()
            .map(|k| (k.as_str(), "[REDACTED]"))
            .collect();

        f.debug_struct("ConcreteArgs")
            .field("instance", &self.instance)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("env", &self.env)
            .field("secret_env", &redacted)
            .field("working_dir", &self.working_dir)
            .field("resources", &self.resources)
            .field("params", &self.params)
            .finish()
    }
}

/// Resolves parameters for one run.
#[derive(Debug, Clone, Default)]
pub struct ParameterResolver {
    arguments: BTreeMap<String, String>,
}

impl ParameterResolver {
    /// Creates a resolver from definition defaults overlaid with the
    /// arguments submitted for this run.
    pub fn new(defaults: &BTreeMap<String, String>, submitted: BTreeMap<String, String>) -> Self {
        let mut arguments = defaults.clone();
        arguments.extend(submitted);
        Self { arguments }
    }

    /// Effective workflow arguments of the run.
    pub fn arguments(&self) -> &BTreeMap<String, String> {
        &self.arguments
    }

    /// Builds the parameter table of `template` for an optional binding.
    pub fn bind(
        &self,
        template: &StepTemplate,
        binding: Option<&IterationBinding>,
    ) -> Result<BTreeMap<String, String>, DefinitionError> {
        let mut table = BTreeMap::new();

        for input in &template.inputs {
            if let ParamSource::Literal { value } = &input.source {
                table.insert(input.name.clone(), value.clone());
            }
        }

        table.extend(self.arguments.iter().map(|(k, v)| (k.clone(), v.clone())));
        for input in &template.inputs {
            if let ParamSource::WorkflowArg { arg } = &input.source {
                if let Some(value) = self.arguments.get(arg) {
                    table.insert(input.name.clone(), value.clone());
                }
            }
        }

        if let Some(binding) = binding {
            // Item values may themselves refer to workflow arguments.
            let binding = binding
                .iter()
                .map(|(k, v)| substitute(v, &self.arguments, &template.name).map(|v| (k.clone(), v)))
                .collect::<Result<IterationBinding, _>>()?;

            table.extend(binding.iter().map(|(k, v)| (k.clone(), v.clone())));
            for input in &template.inputs {
                if let ParamSource::Iteration { key } = &input.source {
                    if let Some(value) = binding.get(key) {
                        table.insert(input.name.clone(), value.clone());
                    }
                }
            }
        }

        for input in &template.inputs {
            if table.contains_key(&input.name) {
                continue;
            }
            let key = match &input.source {
                ParamSource::Literal { .. } => &input.name,
                ParamSource::WorkflowArg { arg } => arg,
                ParamSource::Iteration { key } => key,
            };
            return Err(DefinitionError::UnresolvedParameter {
                step: template.name.clone(),
                key: key.clone(),
            });
        }

        Ok(table)
    }

    /// Materializes the executable unit of a leaf template.
    ///
    /// Secrets are not fetched here; see
    /// [`attach_secrets`](crate::execution::secrets::attach_secrets).
    pub fn materialize(
        &self,
        template: &StepTemplate,
        binding: Option<&IterationBinding>,
    ) -> Result<ConcreteArgs, DefinitionError> {
        let exec = template
            .executable
            .as_ref()
            .ok_or_else(|| DefinitionError::InvalidTemplate {
                step: template.name.clone(),
                reason: "no executable to materialize".to_string(),
            })?;

        let table = self.bind(template, binding)?;
        let step = template.name.as_str();

        let command = substitute(&exec.command, &table, step)?;
        let args = exec
            .args
            .iter()
            .map(|a| substitute(a, &table, step))
            .collect::<Result<Vec<_>, _>>()?;
        let env = exec
            .env
            .iter()
            .map(|(k, v)| substitute(v, &table, step).map(|v| (k.clone(), v)))
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        let working_dir = exec
            .working_dir
            .as_deref()
            .map(|d| substitute(d, &table, step).map(PathBuf::from))
            .transpose()?;

        debug!("Materialized '{}': {}", step, command);

        Ok(ConcreteArgs {
            instance: step.to_string(),
            command,
            args,
            env,
            secret_env: BTreeMap::new(),
            working_dir,
            resources: template.resources,
            params: table,
        })
    }
}

/// Replaces every `{{name}}` in `text` with its value from `table`.
///
/// An opening `{{` without a closing `}}` is kept verbatim.
pub fn substitute(
    text: &str,
    table: &BTreeMap<String, String>,
    step: &str,
) -> Result<String, DefinitionError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find(OPEN) {
        let after = &rest[start + OPEN.len()..];
        let Some(end) = after.find(CLOSE) else {
            break;
        };

        out.push_str(&rest[..start]);
        let key = after[..end].trim();
        let value = table
            .get(key)
            .ok_or_else(|| DefinitionError::UnresolvedParameter {
                step: step.to_string(),
                key: key.to_string(),
            })?;
        out.push_str(value);
        rest = &after[end + CLOSE.len()..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Lists the placeholder names used in `text`, in order of appearance.
pub fn placeholders(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find(OPEN) {
        let after = &rest[start + OPEN.len()..];
        let Some(end) = after.find(CLOSE) else {
            break;
        };
        names.push(after[..end].trim().to_string());
        rest = &after[end + CLOSE.len()..];
    }

    names
}
