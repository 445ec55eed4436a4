//! Run State Store
//!
//! Records the status of every step instance of one workflow run as an
//! append-only transition log. Each commit is guarded by the caller's view
//! of the current status, so two writers racing on the same instance cannot
//! both succeed.
//!
//! When a persistence path is configured, [`RunStateStore::flush`] writes
//! the latest snapshot as JSON on the blocking thread pool, so the outcome
//! of a run can be inspected later with [`WorkflowRun::load`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::RunError;

/// Status of a step instance.
///
/// Lifecycle: `Pending → {Skipped | Running → {Succeeded | Failed}}`.
/// `Running → Running` records a retry attempt; `Pending → Failed` is only
/// used for cancellation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Whether `self → to` is an edge of the lifecycle.
    pub fn can_transition_to(self, to: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, to),
            (Pending, Running | Skipped | Failed) | (Running, Running | Succeeded | Failed)
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Skipped => "Skipped",
        };
        f.pad(s)
    }
}

/// Identifies one instance: a step, or one member of a group step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId {
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

impl InstanceId {
    pub fn step(name: impl Into<String>) -> Self {
        Self {
            step: name.into(),
            index: None,
        }
    }

    pub fn member(group: impl Into<String>, index: usize) -> Self {
        Self {
            step: group.into(),
            index: Some(index),
        }
    }

    pub fn is_member(&self) -> bool {
        self.index.is_some()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(i) => write!(f, "{}[{}]", self.step, i),
            None => write!(f, "{}", self.step),
        }
    }
}

/// Why an instance was skipped, failed, or retried.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reason {
    GateFalse { condition: String },
    UpstreamFailed { step: String },
    UpstreamSkipped,
    GroupHalted,
    ExitStatus { code: i32 },
    RunnerError { message: String },
    SecretUnavailable { message: String },
    MembersFailed { count: usize },
    Cancelled,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GateFalse { condition } => write!(f, "gate '{}' is false", condition),
            Self::UpstreamFailed { step } => write!(f, "upstream step '{}' failed", step),
            Self::UpstreamSkipped => write!(f, "all upstream steps skipped"),
            Self::GroupHalted => write!(f, "group halted after a member failure"),
            Self::ExitStatus { code } => write!(f, "exit status {}", code),
            Self::RunnerError { message } => write!(f, "runner error: {}", message),
            Self::SecretUnavailable { message } => write!(f, "secret unavailable: {}", message),
            Self::MembersFailed { count } => write!(f, "{} member(s) failed", count),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// State of one instance within a run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepInstance {
    pub id: InstanceId,
    pub status: StepStatus,
    /// Captured output text, set when the instance becomes terminal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Number of dispatch attempts so far
    #[serde(default)]
    pub attempt: u32,
}

impl StepInstance {
    fn pending(id: InstanceId) -> Self {
        Self {
            id,
            status: StepStatus::Pending,
            output: None,
            reason: None,
            started_at: None,
            finished_at: None,
            attempt: 0,
        }
    }

    /// Duration in milliseconds, once both timestamps are known.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Payload committed together with a transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionDetails {
    pub output: Option<String>,
    pub reason: Option<Reason>,
}

impl TransitionDetails {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn output(output: impl Into<String>) -> Self {
        Self {
            output: Some(output.into()),
            reason: None,
        }
    }

    pub fn reason(reason: Reason) -> Self {
        Self {
            output: None,
            reason: Some(reason),
        }
    }
}

/// One entry of the transition log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Transition {
    /// Commit order within the run, starting at 1
    pub seq: u64,
    pub instance: InstanceId,
    pub from: StepStatus,
    pub to: StepStatus,
    pub at: DateTime<Utc>,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
}

/// Overall status of a run, always derived from its instances.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        };
        f.pad(s)
    }
}

/// Point-in-time view of a run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowRun {
    pub run_id: String,
    pub workflow: String,
    pub created_at: DateTime<Utc>,
    pub instances: Vec<StepInstance>,
}

impl WorkflowRun {
    /// `Failed` if any instance failed, `Succeeded` once every instance is
    /// terminal, `Running` otherwise.
    pub fn status(&self) -> RunStatus {
        if self
            .instances
            .iter()
            .any(|i| i.status == StepStatus::Failed)
        {
            RunStatus::Failed
        } else if self.is_terminal() {
            RunStatus::Succeeded
        } else {
            RunStatus::Running
        }
    }

    /// True when no instance is Pending or Running.
    pub fn is_terminal(&self) -> bool {
        self.instances.iter().all(|i| i.status.is_terminal())
    }

    pub fn instance(&self, id: &InstanceId) -> Option<&StepInstance> {
        self.instances.iter().find(|i| &i.id == id)
    }

    /// The instance of a step itself (not of its members).
    pub fn step(&self, name: &str) -> Option<&StepInstance> {
        self.instances
            .iter()
            .find(|i| i.id.step == name && i.id.index.is_none())
    }

    /// Member instances of a group, in iteration order.
    pub fn members(&self, group: &str) -> Vec<&StepInstance> {
        let mut members: Vec<_> = self
            .instances
            .iter()
            .filter(|i| i.id.step == group && i.id.index.is_some())
            .collect();
        members.sort_by_key(|i| i.id.index);
        members
    }

    /// Number of instances per status.
    pub fn counts(&self) -> BTreeMap<StepStatus, usize> {
        let mut counts = BTreeMap::new();
        for instance in &self.instances {
            *counts.entry(instance.status).or_insert(0) += 1;
        }
        counts
    }

    /// Writes the snapshot as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), RunError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Reads a snapshot written by [`WorkflowRun::save`].
    pub fn load(path: &Path) -> Result<Self, RunError> {
        let content = fs::read_to_string(path)?;
        let run: WorkflowRun = serde_json::from_str(&content)?;
        info!("Loaded run '{}' from {}", run.run_id, path.display());
        Ok(run)
    }
}

struct StoreInner {
    instances: Vec<StepInstance>,
    index: HashMap<InstanceId, usize>,
    log: Vec<Transition>,
}

/// Durable, queryable record of one run.
///
/// Readers take a short read lock and clone what they need; each commit
/// holds the write lock only for the single transition being applied.
pub struct RunStateStore {
    run_id: String,
    workflow: String,
    created_at: DateTime<Utc>,
    persist_path: Option<PathBuf>,
    /// Set by every commit, cleared by `flush`
    dirty: AtomicBool,
    inner: RwLock<StoreInner>,
}

impl RunStateStore {
    /// Creates a store with every given instance Pending.
    pub fn new(
        run_id: impl Into<String>,
        workflow: impl Into<String>,
        ids: impl IntoIterator<Item = InstanceId>,
    ) -> Self {
        let instances: Vec<StepInstance> = ids.into_iter().map(StepInstance::pending).collect();
        let index = instances
            .iter()
            .enumerate()
            .map(|(i, inst)| (inst.id.clone(), i))
            .collect();

        Self {
            run_id: run_id.into(),
            workflow: workflow.into(),
            created_at: Utc::now(),
            persist_path: None,
            dirty: AtomicBool::new(false),
            inner: RwLock::new(StoreInner {
                instances,
                index,
                log: Vec::new(),
            }),
        }
    }

    /// Enables [`flush`](Self::flush) to write JSON snapshots to `path`.
    pub fn with_persistence(mut self, path: impl Into<PathBuf>) -> Self {
        self.persist_path = Some(path.into());
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StoreInner>, RunError> {
        self.inner.read().map_err(|_| RunError::StatePoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreInner>, RunError> {
        self.inner.write().map_err(|_| RunError::StatePoisoned)
    }

    /// Commits `from → to` for one instance.
    ///
    /// Fails with [`RunError::IllegalTransition`] when the stored status is
    /// not `from` or the edge is not part of the lifecycle; terminal
    /// instances therefore never change again.
    pub fn record_transition(
        &self,
        id: &InstanceId,
        from: StepStatus,
        to: StepStatus,
        details: TransitionDetails,
        at: DateTime<Utc>,
    ) -> Result<Transition, RunError> {
        let transition = {
            let mut inner = self.write()?;
            let idx = *inner
                .index
                .get(id)
                .ok_or_else(|| RunError::UnknownInstance(id.to_string()))?;
            let seq = inner.log.len() as u64 + 1;

            let instance = &mut inner.instances[idx];
            if instance.status != from || !from.can_transition_to(to) {
                return Err(RunError::IllegalTransition {
                    instance: id.to_string(),
                    expected: from,
                    actual: instance.status,
                    requested: to,
                });
            }

            if to == StepStatus::Running {
                if from == StepStatus::Pending {
                    instance.started_at = Some(at);
                }
                instance.attempt += 1;
            }
            if to.is_terminal() {
                instance.finished_at = Some(at);
                instance.output = details.output;
            }
            instance.reason = details.reason.clone();
            instance.status = to;

            let transition = Transition {
                seq,
                instance: id.clone(),
                from,
                to,
                at,
                attempt: instance.attempt,
                reason: details.reason,
            };
            inner.log.push(transition.clone());
            transition
        };

        debug!("{}: {} -> {}", id, from, to);
        self.dirty.store(true, Ordering::Release);
        Ok(transition)
    }

    /// Persists the current snapshot if anything was committed since the
    /// last flush. Failures are logged, never returned.
    pub async fn flush(&self) {
        let Some(path) = self.persist_path.clone() else {
            return;
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return;
        }

        let run = match self.snapshot() {
            Ok(run) => run,
            Err(e) => {
                warn!("Failed to persist run state to {}: {}", path.display(), e);
                return;
            }
        };

        let target = path.clone();
        match tokio::task::spawn_blocking(move || run.save(&target)).await {
            Ok(Ok(())) => debug!("Persisted run state to {}", path.display()),
            Ok(Err(e)) => warn!("Failed to persist run state to {}: {}", path.display(), e),
            Err(e) => warn!("Run state writer task failed: {}", e),
        }
    }

    /// Returns a consistent copy of the whole run.
    pub fn snapshot(&self) -> Result<WorkflowRun, RunError> {
        let inner = self.read()?;
        Ok(WorkflowRun {
            run_id: self.run_id.clone(),
            workflow: self.workflow.clone(),
            created_at: self.created_at,
            instances: inner.instances.clone(),
        })
    }

    /// Returns a copy of one instance.
    pub fn instance(&self, id: &InstanceId) -> Result<StepInstance, RunError> {
        let inner = self.read()?;
        inner
            .index
            .get(id)
            .map(|&i| inner.instances[i].clone())
            .ok_or_else(|| RunError::UnknownInstance(id.to_string()))
    }

    /// Returns the transition log in commit order.
    pub fn transitions(&self) -> Result<Vec<Transition>, RunError> {
        Ok(self.read()?.log.clone())
    }
}
