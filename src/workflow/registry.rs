//! Step Registry
//!
//! Holds the step templates of one workflow definition. Templates are
//! registered through a [`RegistryBuilder`]; [`RegistryBuilder::finalize`]
//! checks dependency references and template shape and yields a read-only
//! [`StepRegistry`].

use std::collections::{BTreeMap, HashMap};

use log::{debug, info};

use crate::error::DefinitionError;

use super::model::StepTemplate;
use super::validator::validate_template;

/// Collects templates before the registry is frozen.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    name: String,
    arguments: BTreeMap<String, String>,
    templates: Vec<StepTemplate>,
    index: HashMap<String, usize>,
}

impl RegistryBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the default workflow arguments.
    pub fn with_arguments(mut self, arguments: BTreeMap<String, String>) -> Self {
        self.arguments = arguments;
        self
    }

    /// Registers a template.
    ///
    /// Fails with [`DefinitionError::DuplicateName`] if the name is taken.
    pub fn register(&mut self, template: StepTemplate) -> Result<&mut Self, DefinitionError> {
        if self.index.contains_key(&template.name) {
            return Err(DefinitionError::DuplicateName(template.name));
        }
        debug!("Registered step '{}' ({:?})", template.name, template.kind);
        self.index.insert(template.name.clone(), self.templates.len());
        self.templates.push(template);
        Ok(self)
    }

    /// Freezes the registry.
    ///
    /// Every `depends_on` entry must name a registered step, and every
    /// template must have a valid shape for its kind.
    pub fn finalize(self) -> Result<StepRegistry, DefinitionError> {
        if self.templates.is_empty() {
            return Err(DefinitionError::EmptyWorkflow);
        }

        for template in &self.templates {
            validate_template(template)?;

            for dependency in &template.depends_on {
                if !self.index.contains_key(dependency) {
                    return Err(DefinitionError::DanglingDependency {
                        step: template.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        info!(
            "Registry '{}' finalized with {} steps",
            self.name,
            self.templates.len()
        );

        Ok(StepRegistry {
            name: self.name,
            arguments: self.arguments,
            templates: self.templates,
            index: self.index,
        })
    }
}

/// Read-only set of step templates for one workflow definition.
#[derive(Debug, Clone)]
pub struct StepRegistry {
    name: String,
    arguments: BTreeMap<String, String>,
    templates: Vec<StepTemplate>,
    index: HashMap<String, usize>,
}

impl StepRegistry {
    /// Looks up a template by name.
    pub fn resolve(&self, name: &str) -> Result<&StepTemplate, DefinitionError> {
        self.index
            .get(name)
            .map(|&i| &self.templates[i])
            .ok_or_else(|| DefinitionError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Workflow name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Default workflow arguments.
    pub fn arguments(&self) -> &BTreeMap<String, String> {
        &self.arguments
    }

    /// Templates in registration order.
    pub fn templates(&self) -> &[StepTemplate] {
        &self.templates
    }

    /// Names of the steps that list `name` in `depends_on`.
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.templates
            .iter()
            .filter(|t| t.depends_on.iter().any(|d| d == name))
            .map(|t| t.name.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
