//! Workflow Validation
//!
//! Static checks run before any instance of a run is dispatched:
//! - Template shape per step kind
//! - Dependency graph is acyclic (topological order)
//! - Gates only reference steps the gated step transitively depends on
//! - Every parameter and placeholder resolves for the submitted arguments

use std::collections::{HashMap, HashSet, VecDeque};

use log::{debug, info, warn};

use crate::error::DefinitionError;

use super::model::{StepKind, StepTemplate};
use super::params::ParameterResolver;
use super::registry::StepRegistry;

fn invalid(step: &str, reason: &str) -> DefinitionError {
    DefinitionError::InvalidTemplate {
        step: step.to_string(),
        reason: reason.to_string(),
    }
}

/// Validates a single template's fields for its kind.
pub fn validate_template(template: &StepTemplate) -> Result<(), DefinitionError> {
    let name = template.name.as_str();
    if name.trim().is_empty() {
        return Err(invalid(name, "step has an empty name"));
    }

    if template.depends_on.iter().any(|d| d == name) {
        return Err(DefinitionError::CyclicDependency(vec![name.to_string()]));
    }

    if template.parallelism == Some(0) {
        return Err(invalid(name, "parallelism must be at least 1"));
    }

    match template.kind {
        StepKind::Leaf => {
            let has_command = template
                .executable
                .as_ref()
                .is_some_and(|e| !e.command.trim().is_empty());
            if !has_command {
                return Err(invalid(name, "leaf step has no command"));
            }
            if template.member.is_some() || !template.items.is_empty() {
                return Err(invalid(name, "leaf step cannot declare a member or items"));
            }
        }
        StepKind::Group => {
            let member = template
                .member
                .as_deref()
                .ok_or_else(|| invalid(name, "group step has no member template"))?;

            if template.executable.is_some() {
                return Err(invalid(name, "group step cannot have its own executable"));
            }
            if member.is_group() {
                return Err(invalid(name, "nested groups are not supported"));
            }
            if !member.depends_on.is_empty() || member.gate.is_some() {
                return Err(invalid(
                    name,
                    "member template cannot declare dependencies or a gate",
                ));
            }
            validate_template(member).map_err(|e| match e {
                DefinitionError::InvalidTemplate { reason, .. } => {
                    invalid(name, &format!("member: {}", reason))
                }
                other => other,
            })?;

            if template.items.is_empty() {
                warn!("Group step '{}' has no items and will do nothing", name);
            }
        }
    }

    if template.depends_on.is_empty() {
        debug!("Step '{}' is a root step (no dependencies)", name);
    }

    Ok(())
}

/// Orders step names so every dependency precedes its dependents.
///
/// Kahn's algorithm; ties keep registration order. On a cycle, the steps
/// that could not be ordered are reported.
pub fn topological_order(registry: &StepRegistry) -> Result<Vec<String>, DefinitionError> {
    let templates = registry.templates();

    let mut in_degree: HashMap<&str, usize> = templates
        .iter()
        .map(|t| (t.name.as_str(), t.depends_on.len()))
        .collect();

    let mut queue: VecDeque<&str> = templates
        .iter()
        .filter(|t| t.depends_on.is_empty())
        .map(|t| t.name.as_str())
        .collect();

    let mut sorted = Vec::with_capacity(templates.len());

    while let Some(current) = queue.pop_front() {
        sorted.push(current.to_string());

        for dependent in templates {
            let edges = dependent.depends_on.iter().filter(|d| *d == current).count();
            if edges == 0 {
                continue;
            }
            if let Some(degree) = in_degree.get_mut(dependent.name.as_str()) {
                *degree -= edges;
                if *degree == 0 {
                    queue.push_back(dependent.name.as_str());
                }
            }
        }
    }

    if sorted.len() != templates.len() {
        let ordered: HashSet<&str> = sorted.iter().map(String::as_str).collect();
        let stuck = templates
            .iter()
            .map(|t| t.name.clone())
            .filter(|n| !ordered.contains(n.as_str()))
            .collect();
        return Err(DefinitionError::CyclicDependency(stuck));
    }

    debug!("Topological order: {:?}", sorted);
    Ok(sorted)
}

/// Names of every step `name` transitively depends on.
pub fn ancestors<'a>(registry: &'a StepRegistry, name: &str) -> HashSet<&'a str> {
    let mut seen = HashSet::new();
    let mut stack: Vec<&str> = match registry.resolve(name) {
        Ok(t) => t.depends_on.iter().map(String::as_str).collect(),
        Err(_) => return seen,
    };

    while let Some(current) = stack.pop() {
        let Ok(template) = registry.resolve(current) else {
            continue;
        };
        if seen.insert(template.name.as_str()) {
            stack.extend(template.depends_on.iter().map(String::as_str));
        }
    }

    seen
}

/// Checks that every gate references a transitive dependency.
///
/// This guarantees the referenced step is terminal whenever the gate is
/// evaluated.
pub fn validate_gates(registry: &StepRegistry) -> Result<(), DefinitionError> {
    for template in registry.templates() {
        let Some(gate) = &template.gate else {
            continue;
        };
        if !ancestors(registry, &template.name).contains(gate.step.as_str()) {
            return Err(DefinitionError::UnreachableGateReference {
                step: template.name.clone(),
                reference: gate.step.clone(),
            });
        }
    }
    Ok(())
}

/// Resolves every leaf, and every member for each of its group's items,
/// without running anything.
pub fn validate_parameters(
    registry: &StepRegistry,
    resolver: &ParameterResolver,
) -> Result<(), DefinitionError> {
    for template in registry.templates() {
        match template.member.as_deref() {
            Some(member) if template.is_group() => {
                for binding in &template.items {
                    resolver
                        .materialize(member, Some(binding))
                        .map_err(|e| in_group(e, &template.name))?;
                }
            }
            _ => {
                resolver.materialize(template, None)?;
            }
        }
    }
    Ok(())
}

/// Reports member errors under the group's name.
fn in_group(err: DefinitionError, group: &str) -> DefinitionError {
    match err {
        DefinitionError::UnresolvedParameter { key, .. } => DefinitionError::UnresolvedParameter {
            step: group.to_string(),
            key,
        },
        other => other,
    }
}

/// Runs every static check and returns the topological order.
pub fn validate(
    registry: &StepRegistry,
    resolver: &ParameterResolver,
) -> Result<Vec<String>, DefinitionError> {
    info!("Validating workflow '{}' with {} steps", registry.name(), registry.len());

    let order = topological_order(registry)?;
    validate_gates(registry)?;
    validate_parameters(registry, resolver)?;

    info!("Workflow '{}' validated", registry.name());
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::workflow::model::{ParamRef, WorkflowDefinition};
    use crate::workflow::registry::RegistryBuilder;

    fn registry(steps: Vec<StepTemplate>) -> StepRegistry {
        let mut builder = RegistryBuilder::new("test");
        for step in steps {
            builder.register(step).unwrap();
        }
        builder.finalize().unwrap()
    }

    fn args(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_topological_order_linear() {
        let reg = registry(vec![
            StepTemplate::leaf("c", "echo c").depends_on("b"),
            StepTemplate::leaf("a", "echo a"),
            StepTemplate::leaf("b", "echo b").depends_on("a"),
        ]);
        assert_eq!(topological_order(&reg).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_topological_order_multiple_roots_keeps_registration_order() {
        let reg = registry(vec![
            StepTemplate::leaf("x", "true"),
            StepTemplate::leaf("y", "true"),
            StepTemplate::leaf("z", "true").depends_on("x").depends_on("y"),
        ]);
        assert_eq!(topological_order(&reg).unwrap(), vec!["x", "y", "z"]);
    }

    #[test]
    fn test_cycle_detected() {
        let reg = registry(vec![
            StepTemplate::leaf("root", "true"),
            StepTemplate::leaf("a", "true").depends_on("b"),
            StepTemplate::leaf("b", "true").depends_on("a"),
        ]);
        assert_eq!(
            topological_order(&reg).unwrap_err(),
            DefinitionError::CyclicDependency(vec!["a".into(), "b".into()])
        );
    }

    #[test]
    fn test_self_dependency_rejected() {
        let step = StepTemplate::leaf("a", "true").depends_on("a");
        assert!(matches!(
            validate_template(&step),
            Err(DefinitionError::CyclicDependency(_))
        ));
    }

    #[test]
    fn test_template_shapes() {
        let mut no_command = StepTemplate::leaf("a", "  ");
        assert!(validate_template(&no_command).is_err());
        no_command.executable = None;
        assert!(validate_template(&no_command).is_err());

        let mut group = StepTemplate::group(
            "g",
            StepTemplate::leaf("m", "true"),
            StepTemplate::items_from(["1"]),
        );
        assert!(validate_template(&group).is_ok());
        group.member = None;
        assert!(validate_template(&group).is_err());

        let zero = StepTemplate::group(
            "g",
            StepTemplate::leaf("m", "true"),
            StepTemplate::items_from(["1"]),
        )
        .with_parallelism(0);
        assert!(validate_template(&zero).is_err());
    }

    #[test]
    fn test_nested_group_rejected() {
        let inner = StepTemplate::group(
            "inner",
            StepTemplate::leaf("m", "true"),
            StepTemplate::items_from(["1"]),
        );
        let outer = StepTemplate::group("outer", inner, StepTemplate::items_from(["a"]));
        let err = validate_template(&outer).unwrap_err();
        assert!(err.to_string().contains("nested"));
    }

    #[test]
    fn test_member_with_dependency_rejected() {
        let member = StepTemplate::leaf("m", "true").depends_on("x");
        let group = StepTemplate::group("g", member, StepTemplate::items_from(["1"]));
        assert!(validate_template(&group).is_err());
    }

    #[test]
    fn test_gate_must_reference_ancestor() {
        let reg = registry(vec![
            StepTemplate::leaf("a", "echo true"),
            StepTemplate::leaf("other", "true"),
            StepTemplate::leaf("b", "true")
                .depends_on("other")
                .with_gate("a == true".parse().unwrap()),
        ]);
        assert_eq!(
            validate_gates(&reg).unwrap_err(),
            DefinitionError::UnreachableGateReference {
                step: "b".into(),
                reference: "a".into()
            }
        );
    }

    #[test]
    fn test_gate_on_transitive_ancestor() {
        let reg = registry(vec![
            StepTemplate::leaf("a", "echo true"),
            StepTemplate::leaf("b", "true").depends_on("a"),
            StepTemplate::leaf("c", "true")
                .depends_on("b")
                .with_gate("a == true".parse().unwrap()),
        ]);
        assert!(validate_gates(&reg).is_ok());
        assert_eq!(ancestors(&reg, "c"), HashSet::from(["a", "b"]));
    }

    #[test]
    fn test_parameters_checked_per_item() {
        let member = StepTemplate::leaf("restart", "ssh {{host}} reboot")
            .with_input(ParamRef::iteration("host", "server"));
        let items = vec![args(&[("server", "s1")]), args(&[("name", "s2")])];
        let reg = registry(vec![StepTemplate::group("servers", member, items)]);

        let err = validate_parameters(&reg, &ParameterResolver::default()).unwrap_err();
        assert_eq!(
            err,
            DefinitionError::UnresolvedParameter {
                step: "servers".into(),
                key: "server".into()
            }
        );
    }

    #[test]
    fn test_validate_missing_argument() {
        let reg = WorkflowDefinition::new("wf")
            .with_step(StepTemplate::leaf("a", "psql -h {{db-host}}"))
            .into_registry()
            .unwrap();

        let missing = ParameterResolver::new(reg.arguments(), BTreeMap::new());
        assert!(matches!(
            validate(&reg, &missing),
            Err(DefinitionError::UnresolvedParameter { key, .. }) if key == "db-host"
        ));

        let given = ParameterResolver::new(reg.arguments(), args(&[("db-host", "db1")]));
        assert_eq!(validate(&reg, &given).unwrap(), vec!["a"]);
    }
}
