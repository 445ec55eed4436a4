//! Workflow Parser
//!
//! Loads workflow definitions and argument files from disk. Definitions are
//! YAML; JSON documents are accepted as well since JSON is valid YAML.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::{debug, info};
use serde_json::Value;

use crate::error::{Error, Result};

use super::model::WorkflowDefinition;
use super::registry::StepRegistry;

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.display().to_string(),
        source,
    })
}

/// Parses a definition from YAML (or JSON) text.
pub fn parse_definition(content: &str) -> Result<WorkflowDefinition> {
    let definition: WorkflowDefinition = serde_yaml::from_str(content)?;
    debug!(
        "Parsed workflow '{}' with {} steps",
        definition.name,
        definition.len()
    );
    Ok(definition)
}

/// Loads a workflow definition from a file.
///
/// # Example
///
/// ```rust,no_run
/// use stepflow::workflow::load_definition;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let definition = load_definition("demos/db-maintenance.yaml")?;
///     println!("Loaded {} steps", definition.len());
///     Ok(())
/// }
/// ```
pub fn load_definition(path: impl AsRef<Path>) -> Result<WorkflowDefinition> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let content = read(path)?;
    debug!("Definition loaded ({} bytes)", content.len());
    parse_definition(&content)
}

/// Loads a definition and freezes it into a registry.
pub fn load_registry(path: impl AsRef<Path>) -> Result<StepRegistry> {
    Ok(load_definition(path)?.into_registry()?)
}

/// Loads workflow arguments from a flat YAML or JSON mapping.
///
/// Numbers and booleans are accepted and kept as their text form.
pub fn load_arguments_file(path: impl AsRef<Path>) -> Result<BTreeMap<String, String>> {
    let path = path.as_ref();
    let content = read(path)?;

    let value: Value = serde_yaml::from_str(&content)?;
    let object = match value {
        Value::Null => return Ok(BTreeMap::new()),
        Value::Object(object) => object,
        _ => {
            return Err(Error::Read {
                path: path.display().to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "arguments file must be a mapping",
                ),
            })
        }
    };

    let mut arguments = BTreeMap::new();
    for (key, value) in object {
        let text = match value {
            Value::String(s) => s,
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            other => {
                return Err(Error::Read {
                    path: path.display().to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("argument '{}' is not a scalar: {}", key, other),
                    ),
                })
            }
        };
        arguments.insert(key, text);
    }

    info!("Loaded {} argument(s) from {}", arguments.len(), path.display());
    Ok(arguments)
}

/// Splits a `key=value` command-line argument.
pub fn parse_argument(pair: &str) -> std::result::Result<(String, String), String> {
    match pair.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("Expected key=value, got '{}'", pair)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    use crate::workflow::model::StepKind;

    const DEMO: &str = include_str!("../../demos/db-maintenance.yaml");

    #[test]
    fn test_parse_demo_definition() {
        let definition = parse_definition(DEMO).unwrap();
        assert_eq!(definition.name, "db-maintenance");
        assert_eq!(definition.arguments["timezone"], "UTC");
        assert!(definition.arguments.contains_key("db-host-2"));

        let group = definition.get_step("sync-replicas").unwrap();
        assert_eq!(group.kind, StepKind::Group);
        assert_eq!(group.items.len(), 2);
        assert!(group.fail_fast);

        let registry = definition.into_registry().unwrap();
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn test_load_definition_file_not_found() {
        let result = load_definition("/nonexistent/path/workflow.yaml");
        assert!(matches!(result, Err(Error::Read { .. })));
    }

    #[test]
    fn test_load_definition_json() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("wf.json");
        std::fs::write(
            &path,
            r#"{"name": "j", "steps": [{"name": "a", "executable": {"command": "echo a"}}]}"#,
        )
        .unwrap();

        let definition = load_definition(&path).unwrap();
        assert_eq!(definition.name, "j");
        assert_eq!(definition.steps[0].name, "a");
    }

    #[test]
    fn test_load_definition_invalid_yaml() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("bad.yaml");
        std::fs::write(&path, "this is not valid yaml: [[[").unwrap();

        assert!(matches!(load_definition(&path), Err(Error::Yaml(_))));
    }

    #[test]
    fn test_load_registry_rejects_dangling() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("wf.yaml");
        std::fs::write(
            &path,
            "steps:\n  - name: b\n    depends_on: [a]\n    executable:\n      command: echo b\n",
        )
        .unwrap();

        assert!(matches!(load_registry(&path), Err(Error::Definition(_))));
    }

    #[test]
    fn test_load_arguments_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("args.yaml");
        std::fs::write(&path, "db-host: pg1\nport: 5432\nverbose: true\n").unwrap();

        let arguments = load_arguments_file(&path).unwrap();
        assert_eq!(arguments["db-host"], "pg1");
        assert_eq!(arguments["port"], "5432");
        assert_eq!(arguments["verbose"], "true");
    }

    #[test]
    fn test_load_arguments_file_rejects_nested() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("args.json");
        std::fs::write(&path, r#"{"db": {"host": "x"}}"#).unwrap();

        assert!(load_arguments_file(&path).is_err());
    }

    #[test]
    fn test_parse_argument() {
        assert_eq!(
            parse_argument("db-host=pg1").unwrap(),
            ("db-host".to_string(), "pg1".to_string())
        );
        assert_eq!(parse_argument("q=a=b").unwrap().1, "a=b");
        assert!(parse_argument("novalue").is_err());
        assert!(parse_argument("=x").is_err());
    }
}
