//! Workflow Data Model
//!
//! Core data structures describing step templates, their gates, their
//! parameters and how group steps fan out.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: db-maintenance
//! arguments:
//!   timezone: UTC
//! steps:
//!   - name: check
//!     executable:
//!       command: ./needs_maintenance.sh {{db-host}}
//!
//!   - name: vacuum
//!     depends_on: [check]
//!     gate: check == true
//!     executable:
//!       command: psql -h {{db-host}} -c "CALL {{procedure}}()"
//!     inputs:
//!       - name: procedure
//!         from: literal
//!         value: vacuum_all
//!
//!   - name: restart
//!     kind: group
//!     depends_on: [vacuum]
//!     parallelism: 2
//!     items: [s1, s2]
//!     member:
//!       name: restart-server
//!       executable:
//!         command: ssh {{item}} systemctl restart app
//! ```

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DefinitionError;

use super::registry::{RegistryBuilder, StepRegistry};

/// Key a bare-string iteration item is bound to.
pub const DEFAULT_ITEM_KEY: &str = "item";

/// One element of a group's iteration source: parameter name to value.
pub type IterationBinding = BTreeMap<String, String>;

/// Whether a template runs once or fans out over its items.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    #[default]
    Leaf,
    Group,
}

/// Opaque reference to a credential held by a secret provider.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    pub store: String,
    pub key: String,
}

impl SecretRef {
    pub fn new(store: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            key: key.into(),
        }
    }
}

/// The executable unit of a leaf step.
///
/// `command`, `args`, `env` values and `working_dir` may contain
/// `{{name}}` placeholders, filled in by the parameter resolver.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ExecutableSpec {
    /// Shell command text
    pub command: String,

    /// Positional arguments, exposed to the command as `$1`, `$2`, ...
    #[serde(deserialize_with = "single_or_vec", default)]
    pub args: Vec<String>,

    /// Extra environment variables for the unit
    #[serde(
        deserialize_with = "scalar_map",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub env: BTreeMap<String, String>,

    /// Environment variables filled from the secret provider at dispatch
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, SecretRef>,

    /// Directory to run in, relative to the runner's working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

impl ExecutableSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into().trim().to_string(),
            ..Self::default()
        }
    }
}

/// Where a declared parameter takes its value from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum ParamSource {
    /// A fixed value written in the definition
    Literal {
        #[serde(deserialize_with = "scalar_string")]
        value: String,
    },
    /// A workflow-level argument, possibly under a different name
    WorkflowArg { arg: String },
    /// A key of the current iteration binding (group members only)
    Iteration { key: String },
}

/// A parameter declared by a step template.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ParamRef {
    pub name: String,
    #[serde(flatten)]
    pub source: ParamSource,
}

impl ParamRef {
    pub fn literal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: ParamSource::Literal {
                value: value.into(),
            },
        }
    }

    pub fn workflow_arg(name: impl Into<String>, arg: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: ParamSource::WorkflowArg { arg: arg.into() },
        }
    }

    pub fn iteration(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: ParamSource::Iteration { key: key.into() },
        }
    }
}

/// Comparison operator of a gate.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    #[default]
    Eq,
    Ne,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompareOp::Eq => write!(f, "=="),
            CompareOp::Ne => write!(f, "!="),
        }
    }
}

/// Literal a captured output is compared against.
///
/// Comparison is always on text. Numbers have no literal form of their own:
/// `007` and `7` are different values, so they are kept as written.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Literal {
    Bool(bool),
    Text(String),
}

impl Literal {
    /// The text a captured output must equal to match this literal.
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            Literal::Bool(b) => Cow::Owned(b.to_string()),
            Literal::Text(s) => Cow::Borrowed(s),
        }
    }
}

impl<'de> Deserialize<'de> for Literal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct LiteralVisitor;

        impl<'de> Visitor<'de> for LiteralVisitor {
            type Value = Literal;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a boolean or a string")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Literal, E> {
                Ok(Literal::Bool(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Literal, E> {
                Ok(Literal::Text(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Literal, E> {
                Ok(Literal::Text(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Literal, E> {
                Err(E::custom(format!(
                    "numeric literal {} must be quoted to keep its exact text",
                    v
                )))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Literal, E> {
                self.visit_i64(v as i64)
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Literal, E> {
                Err(E::custom(format!(
                    "numeric literal {} must be quoted to keep its exact text",
                    v
                )))
            }
        }

        deserializer.deserialize_any(LiteralVisitor)
    }
}

/// Typed gate over the captured output of exactly one prior step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(try_from = "ConditionRepr")]
pub struct Condition {
    pub step: String,
    pub op: CompareOp,
    pub value: Literal,
}

impl Condition {
    pub fn equals(step: impl Into<String>, value: Literal) -> Self {
        Self {
            step: step.into(),
            op: CompareOp::Eq,
            value,
        }
    }

    pub fn not_equals(step: impl Into<String>, value: Literal) -> Self {
        Self {
            step: step.into(),
            op: CompareOp::Ne,
            value,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Literal::Text(s) => write!(f, "{} {} \"{}\"", self.step, self.op, s),
            other => write!(f, "{} {} {}", self.step, self.op, other.as_text()),
        }
    }
}

/// Parses `step == literal` or `step != literal`.
///
/// The step may be written as `step.output`. Literals `true`/`false` are
/// booleans; anything else is a string, taken verbatim or from inside
/// quotes.
impl FromStr for Condition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((lhs, op, rhs)) = split_operator(s) else {
            return Err(format!("Condition '{}' needs '==' or '!='", s));
        };

        let step = lhs.trim();
        let step = step.strip_suffix(".output").unwrap_or(step).trim();
        if step.is_empty() || step.contains(char::is_whitespace) {
            return Err(format!("Condition '{}' has an invalid step reference", s));
        }

        let rhs = rhs.trim();
        let value = match rhs {
            "true" => Literal::Bool(true),
            "false" => Literal::Bool(false),
            quoted if quoted.len() >= 2
                && ((quoted.starts_with('"') && quoted.ends_with('"'))
                    || (quoted.starts_with('\'') && quoted.ends_with('\''))) =>
            {
                Literal::Text(quoted[1..quoted.len() - 1].to_string())
            }
            other => Literal::Text(other.to_string()),
        };

        Ok(Self {
            step: step.to_string(),
            op,
            value,
        })
    }
}

/// Splits at the first `==` or `!=` outside a quoted literal.
fn split_operator(s: &str) -> Option<(&str, CompareOp, &str)> {
    let bytes = s.as_bytes();
    let mut quote: Option<u8> = None;

    for i in 0..bytes.len().saturating_sub(1) {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if bytes[i + 1] == b'=' && (b == b'=' || b == b'!') => {
                let op = if b == b'=' { CompareOp::Eq } else { CompareOp::Ne };
                return Some((&s[..i], op, &s[i + 2..]));
            }
            None => {}
        }
    }
    None
}

/// Accepted on-disk forms of a condition.
#[derive(Deserialize)]
#[serde(untagged)]
enum ConditionRepr {
    Expr(String),
    Fields {
        step: String,
        #[serde(default)]
        op: CompareOp,
        value: Literal,
    },
}

impl TryFrom<ConditionRepr> for Condition {
    type Error = String;

    fn try_from(repr: ConditionRepr) -> Result<Self, Self::Error> {
        match repr {
            ConditionRepr::Expr(expr) => expr.parse(),
            ConditionRepr::Fields { step, op, value } => Ok(Self { step, op, value }),
        }
    }
}

/// Bounded, deterministic retry for a failing unit.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    /// Extra attempts after the first
    #[serde(default)]
    pub limit: u32,

    /// Fixed pause before each retry
    #[serde(default)]
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            backoff_ms: 0,
        }
    }

    /// Total number of attempts allowed, counting the first.
    pub fn max_attempts(&self) -> u32 {
        self.limit.saturating_add(1)
    }
}

/// Resources requested by an executable unit.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Number of threads/cores this unit may use
    #[serde(default = "default_threads")]
    pub threads: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,

    /// Wall-clock limit, enforced by the runner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            memory_mb: None,
            timeout_secs: None,
        }
    }
}

/// Default thread count for steps that don't specify
fn default_threads() -> usize {
    1
}

/// A named node of the workflow DAG.
///
/// Leaf templates carry an [`ExecutableSpec`]; group templates carry a
/// `member` leaf template and the `items` it is instantiated over.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepTemplate {
    /// Unique name within the workflow
    pub name: String,

    #[serde(default)]
    pub kind: StepKind,

    /// Names of steps that must be terminal before this one is considered
    #[serde(deserialize_with = "single_or_vec", default)]
    pub depends_on: Vec<String>,

    /// Execute only when this condition holds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<ExecutableSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<ParamRef>,

    /// Maximum concurrently running members of a group; `None` is unbounded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<Box<StepTemplate>>,

    /// Iteration source of a group
    #[serde(
        deserialize_with = "iteration_items",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub items: Vec<IterationBinding>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    #[serde(default)]
    pub resources: ResourceLimits,

    /// Run even when a dependency failed
    #[serde(default)]
    pub fail_ignore: bool,

    /// Stop admitting group members after the first member failure
    #[serde(default)]
    pub fail_fast: bool,
}

impl StepTemplate {
    fn blank(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into().trim().to_string(),
            kind,
            depends_on: Vec::new(),
            gate: None,
            executable: None,
            inputs: Vec::new(),
            parallelism: None,
            member: None,
            items: Vec::new(),
            retry: None,
            resources: ResourceLimits::default(),
            fail_ignore: false,
            fail_fast: false,
        }
    }

    /// Creates a leaf template running `command`.
    ///
    /// # Example
    ///
    /// ```
    /// use stepflow::workflow::StepTemplate;
    ///
    /// let step = StepTemplate::leaf("vacuum", "psql -h {{db-host}} -c 'VACUUM'")
    ///     .depends_on("check")
    ///     .with_gate("check == true".parse().unwrap())
    ///     .with_retries(2);
    /// assert_eq!(step.depends_on, vec!["check"]);
    /// ```
    pub fn leaf(name: impl Into<String>, command: impl Into<String>) -> Self {
        let mut template = Self::blank(name, StepKind::Leaf);
        template.executable = Some(ExecutableSpec::new(command));
        template
    }

    /// Creates a group template fanning `member` out over `items`.
    pub fn group(
        name: impl Into<String>,
        member: StepTemplate,
        items: Vec<IterationBinding>,
    ) -> Self {
        let mut template = Self::blank(name, StepKind::Group);
        template.member = Some(Box::new(member));
        template.items = items;
        template
    }

    /// Builds bindings of the default item key from plain values.
    pub fn items_from<I, S>(values: I) -> Vec<IterationBinding>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        values
            .into_iter()
            .map(|v| BTreeMap::from([(DEFAULT_ITEM_KEY.to_string(), v.into())]))
            .collect()
    }

    /// Adds a dependency on another step.
    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.depends_on.push(step.into());
        self
    }

    pub fn with_gate(mut self, gate: Condition) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_input(mut self, param: ParamRef) -> Self {
        self.inputs.push(param);
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        if let Some(exec) = self.executable.as_mut() {
            exec.args = args;
        }
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        if let Some(exec) = self.executable.as_mut() {
            exec.env.insert(name.into(), value.into());
        }
        self
    }

    pub fn with_secret(mut self, env_name: impl Into<String>, secret: SecretRef) -> Self {
        if let Some(exec) = self.executable.as_mut() {
            exec.secrets.insert(env_name.into(), secret);
        }
        self
    }

    pub fn with_parallelism(mut self, limit: usize) -> Self {
        self.parallelism = Some(limit);
        self
    }

    pub fn with_retries(mut self, limit: u32) -> Self {
        self.retry = Some(RetryPolicy::new(limit));
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.resources.timeout_secs = Some(secs);
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.resources.threads = threads;
        self
    }

    pub fn fail_ignore(mut self) -> Self {
        self.fail_ignore = true;
        self
    }

    pub fn fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }

    pub fn is_group(&self) -> bool {
        self.kind == StepKind::Group
    }

    /// Effective concurrency cap of a group; `usize::MAX` when unbounded.
    pub fn parallelism_limit(&self) -> usize {
        self.parallelism.unwrap_or(usize::MAX)
    }

    /// Number of instances this template yields besides its own.
    pub fn member_count(&self) -> usize {
        if self.is_group() {
            self.items.len()
        } else {
            0
        }
    }
}

/// A complete workflow definition: defaults for workflow arguments plus an
/// ordered set of step templates forming a DAG.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    #[serde(default = "default_workflow_name")]
    pub name: String,

    /// Default values for workflow-level arguments
    #[serde(
        deserialize_with = "scalar_map",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub arguments: BTreeMap<String, String>,

    pub steps: Vec<StepTemplate>,
}

fn default_workflow_name() -> String {
    "workflow".to_string()
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: BTreeMap::new(),
            steps: Vec::new(),
        }
    }

    /// Sets a default for a workflow argument.
    pub fn with_argument(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }

    /// Appends a step template.
    pub fn with_step(mut self, step: StepTemplate) -> Self {
        self.steps.push(step);
        self
    }

    /// Gets a step by name.
    pub fn get_step(&self, name: &str) -> Option<&StepTemplate> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Returns steps with no dependencies (entry points).
    pub fn root_steps(&self) -> Vec<&StepTemplate> {
        self.steps.iter().filter(|s| s.depends_on.is_empty()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Registers every step and finalizes the registry.
    pub fn into_registry(self) -> Result<StepRegistry, DefinitionError> {
        let mut builder = RegistryBuilder::new(self.name).with_arguments(self.arguments);
        for step in self.steps {
            builder.register(step)?;
        }
        builder.finalize()
    }
}

/// Deserializes either a single string or array of strings into Vec<String>
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.is_empty() => Ok(Vec::new()),
        Value::Array(arr) => arr.into_iter().map(scalar_to_string).collect(),
        other => Ok(vec![scalar_to_string(other)?]),
    }
}

/// Renders a scalar as text; numbers and booleans are accepted unquoted.
fn scalar_to_string<E: de::Error>(value: Value) -> Result<String, E> {
    match value {
        Value::String(s) => Ok(s),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(de::Error::custom("Expected a string, number or boolean")),
    }
}

fn scalar_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    scalar_to_string(Value::deserialize(deserializer)?)
}

/// Deserializes a mapping whose values may be any scalar.
fn scalar_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(BTreeMap::new()),
        Value::Object(obj) => obj
            .into_iter()
            .map(|(k, v)| scalar_to_string(v).map(|v| (k, v)))
            .collect(),
        _ => Err(de::Error::custom("Expected a mapping")),
    }
}

/// Deserializes group items: each element is a scalar bound to
/// [`DEFAULT_ITEM_KEY`] or a mapping of scalars.
fn iteration_items<'de, D>(deserializer: D) -> Result<Vec<IterationBinding>, D::Error>
where
    D: Deserializer<'de>,
{
    let arr = match Value::deserialize(deserializer)? {
        Value::Null => return Ok(Vec::new()),
        Value::Array(arr) => arr,
        _ => return Err(de::Error::custom("Expected a list of items")),
    };

    arr.into_iter()
        .map(|item| match item {
            Value::Object(obj) => obj
                .into_iter()
                .map(|(k, v)| scalar_to_string(v).map(|v| (k, v)))
                .collect(),
            scalar => scalar_to_string(scalar)
                .map(|v| BTreeMap::from([(DEFAULT_ITEM_KEY.to_string(), v)])),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_creation() {
        let step = StepTemplate::leaf(" backup ", "pg_dump {{db-host}}")
            .depends_on("check")
            .with_threads(2)
            .with_timeout(30);

        assert_eq!(step.name, "backup");
        assert_eq!(step.kind, StepKind::Leaf);
        assert_eq!(step.depends_on, vec!["check"]);
        assert_eq!(step.resources.threads, 2);
        assert_eq!(step.resources.timeout_secs, Some(30));
        assert_eq!(step.executable.unwrap().command, "pg_dump {{db-host}}");
    }

    #[test]
    fn test_group_creation() {
        let member = StepTemplate::leaf("restart", "ssh {{item}} reboot");
        let group = StepTemplate::group("servers", member, StepTemplate::items_from(["s1", "s2"]))
            .with_parallelism(1);

        assert!(group.is_group());
        assert_eq!(group.member_count(), 2);
        assert_eq!(group.parallelism_limit(), 1);
        assert_eq!(group.items[1].get("item").map(String::as_str), Some("s2"));
    }

    #[test]
    fn test_unbounded_parallelism() {
        let group = StepTemplate::group("g", StepTemplate::leaf("m", "true"), Vec::new());
        assert_eq!(group.parallelism_limit(), usize::MAX);
        assert_eq!(StepTemplate::leaf("l", "true").member_count(), 0);
    }

    #[test]
    fn test_condition_parse_bool() {
        let cond: Condition = "check == true".parse().unwrap();
        assert_eq!(cond, Condition::equals("check", Literal::Bool(true)));
    }

    #[test]
    fn test_condition_parse_output_suffix_and_quotes() {
        let cond: Condition = "healthcheck.output != 'down'".parse().unwrap();
        assert_eq!(cond.step, "healthcheck");
        assert_eq!(cond.op, CompareOp::Ne);
        assert_eq!(cond.value, Literal::Text("down".to_string()));
    }

    #[test]
    fn test_condition_numbers_kept_verbatim() {
        let cond: Condition = "count == 007".parse().unwrap();
        assert_eq!(cond.value, Literal::Text("007".to_string()));
        assert_eq!(cond.to_string(), "count == \"007\"");

        let cond: Condition = "delta != +5".parse().unwrap();
        assert_eq!(cond.value.as_text(), "+5");
    }

    #[test]
    fn test_condition_operator_inside_quotes() {
        let cond: Condition = r#"a == "x!=y""#.parse().unwrap();
        assert_eq!(cond.step, "a");
        assert_eq!(cond.op, CompareOp::Eq);
        assert_eq!(cond.value, Literal::Text("x!=y".to_string()));

        let cond: Condition = "a != 'p==q'".parse().unwrap();
        assert_eq!(cond.op, CompareOp::Ne);
        assert_eq!(cond.value, Literal::Text("p==q".to_string()));
    }

    #[test]
    fn test_condition_fields_form() {
        let step: StepTemplate = serde_yaml::from_str(
            "name: b\ndepends_on: a\ngate: {step: a, value: \"007\"}\nexecutable: {command: \"true\"}\n",
        )
        .unwrap();
        let gate = step.gate.unwrap();
        assert_eq!(gate.value, Literal::Text("007".to_string()));

        let bare = "name: b\ndepends_on: a\ngate: {step: a, value: 007}\nexecutable: {command: \"true\"}\n";
        assert!(serde_yaml::from_str::<StepTemplate>(bare).is_err());
    }

    #[test]
    fn test_condition_parse_errors() {
        assert!("check true".parse::<Condition>().is_err());
        assert!(" == true".parse::<Condition>().is_err());
        assert!("a b == true".parse::<Condition>().is_err());
    }

    #[test]
    fn test_condition_display() {
        let cond = Condition::not_equals("a", Literal::Text("x".into()));
        assert_eq!(cond.to_string(), "a != \"x\"");
        let cond = Condition::equals("a", Literal::Bool(false));
        assert_eq!(cond.to_string(), "a == false");
    }

    #[test]
    fn test_retry_attempts() {
        assert_eq!(RetryPolicy::default().max_attempts(), 1);
        assert_eq!(RetryPolicy::new(2).max_attempts(), 3);
    }

    #[test]
    fn test_deserialize_step_yaml() {
        let yaml = r#"
name: vacuum
depends_on: check
gate: check == true
executable:
  command: psql -c "CALL {{procedure}}()"
  args: [--quiet]
  env:
    PGPORT: 5432
  secrets:
    PGPASSWORD:
      store: db
      key: password
inputs:
  - name: procedure
    from: literal
    value: vacuum_all
  - name: host
    from: workflow_arg
    arg: db-host
retry:
  limit: 2
  backoff_ms: 10
"#;
        let step: StepTemplate = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(step.kind, StepKind::Leaf);
        assert_eq!(step.depends_on, vec!["check"]);
        assert_eq!(step.gate, Some(Condition::equals("check", Literal::Bool(true))));

        let exec = step.executable.unwrap();
        assert_eq!(exec.args, vec!["--quiet"]);
        assert_eq!(exec.env.get("PGPORT").map(String::as_str), Some("5432"));
        assert_eq!(exec.secrets["PGPASSWORD"], SecretRef::new("db", "password"));

        assert_eq!(step.inputs[0], ParamRef::literal("procedure", "vacuum_all"));
        assert_eq!(step.inputs[1], ParamRef::workflow_arg("host", "db-host"));
        assert_eq!(step.retry, Some(RetryPolicy { limit: 2, backoff_ms: 10 }));
        assert_eq!(step.resources, ResourceLimits::default());
    }

    #[test]
    fn test_deserialize_structured_gate() {
        let yaml = r#"
name: b
depends_on: [a]
gate:
  step: a
  op: ne
  value: "ok"
executable:
  command: echo b
"#;
        let step: StepTemplate = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            step.gate,
            Some(Condition::not_equals("a", Literal::Text("ok".into())))
        );
    }

    #[test]
    fn test_deserialize_group_items() {
        let yaml = r#"
name: restart
kind: group
parallelism: 2
items:
  - s1
  - host: s2
    port: 22
member:
  name: restart-one
  executable:
    command: ssh {{item}} reboot
"#;
        let step: StepTemplate = serde_yaml::from_str(yaml).unwrap();
        assert!(step.is_group());
        assert_eq!(step.parallelism, Some(2));
        assert_eq!(step.items.len(), 2);
        assert_eq!(step.items[0]["item"], "s1");
        assert_eq!(step.items[1]["host"], "s2");
        assert_eq!(step.items[1]["port"], "22");
        assert_eq!(step.member.unwrap().name, "restart-one");
    }

    #[test]
    fn test_deserialize_bad_gate() {
        let yaml = "name: b\ngate: a is true\nexecutable:\n  command: x\n";
        assert!(serde_yaml::from_str::<StepTemplate>(yaml).is_err());
    }

    #[test]
    fn test_definition_helpers() {
        let def = WorkflowDefinition::new("wf")
            .with_argument("timezone", "UTC")
            .with_step(StepTemplate::leaf("a", "echo a"))
            .with_step(StepTemplate::leaf("b", "echo b").depends_on("a"));

        assert_eq!(def.len(), 2);
        assert!(!def.is_empty());
        assert_eq!(def.root_steps().len(), 1);
        assert!(def.get_step("b").is_some());
        assert!(def.get_step("c").is_none());
    }

    #[test]
    fn test_definition_into_registry_duplicate() {
        let def = WorkflowDefinition::new("wf")
            .with_step(StepTemplate::leaf("a", "echo a"))
            .with_step(StepTemplate::leaf("a", "echo again"));

        assert_eq!(
            def.into_registry().unwrap_err(),
            DefinitionError::DuplicateName("a".into())
        );
    }
}
