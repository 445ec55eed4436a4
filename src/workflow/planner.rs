//! Execution Planner
//!
//! Decides, from a snapshot of a run, what the engine should do next:
//! - Skip steps with a failed ancestor (unless `fail_ignore`), steps whose
//!   upstream was entirely skipped, and steps whose gate evaluates false
//! - Dispatch ready leaf steps and group members within the concurrency caps
//! - Open and close group steps
//!
//! Planning never mutates anything. The engine applies the returned actions
//! through the run state store and plans again until nothing is left to do.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info};

use crate::error::{DefinitionError, RunError};

use super::condition;
use super::model::{IterationBinding, StepTemplate};
use super::registry::StepRegistry;
use super::state::{InstanceId, Reason, StepInstance, StepStatus, WorkflowRun};
use super::validator;

/// One decision of the planner.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Pending instance becomes Skipped
    Skip { id: InstanceId, reason: Reason },
    /// Pending leaf step or group member starts running
    Dispatch { id: InstanceId },
    /// Pending group step opens; its members become eligible
    StartGroup { step: String },
    /// Every member of a running group is terminal
    FinishGroup {
        step: String,
        status: StepStatus,
        reason: Option<Reason>,
    },
}

/// Plans the execution of one registry.
pub struct ExecutionPlanner {
    registry: Arc<StepRegistry>,
    order: Vec<String>,
    groups: HashSet<String>,
    /// Transitive dependencies of each step, in topological order
    ancestors: HashMap<String, Vec<String>>,
    /// Maximum units running at once across the run
    max_parallel: usize,
    /// Thread budget shared by running units
    max_threads: usize,
}

impl ExecutionPlanner {
    /// Creates a planner over steps listed in topological `order`.
    pub fn new(registry: Arc<StepRegistry>, order: Vec<String>) -> Self {
        let max_threads = num_cpus::get();
        let groups = registry
            .templates()
            .iter()
            .filter(|t| t.is_group())
            .map(|t| t.name.clone())
            .collect();
        let ancestors = order
            .iter()
            .map(|name| {
                let upstream = validator::ancestors(&registry, name);
                let ordered = order
                    .iter()
                    .filter(|step| upstream.contains(step.as_str()))
                    .cloned()
                    .collect();
                (name.clone(), ordered)
            })
            .collect();

        info!(
            "Creating planner: {} steps, {} system threads",
            order.len(),
            max_threads
        );

        Self {
            registry,
            order,
            groups,
            ancestors,
            max_parallel: usize::MAX,
            max_threads,
        }
    }

    /// Caps the number of units running at once. Zero is treated as one.
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads.max(1);
        self
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Every instance of a run: each step, followed by its members.
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        let mut ids = Vec::new();
        for name in &self.order {
            ids.push(InstanceId::step(name.clone()));
            if let Ok(template) = self.registry.resolve(name) {
                ids.extend((0..template.member_count()).map(|i| InstanceId::member(name.clone(), i)));
            }
        }
        ids
    }

    /// Template whose executable an instance runs.
    pub fn template_for(&self, id: &InstanceId) -> Result<&StepTemplate, DefinitionError> {
        let template = self.registry.resolve(&id.step)?;
        match id.index {
            None => Ok(template),
            Some(_) => template
                .member
                .as_deref()
                .ok_or_else(|| DefinitionError::NotFound(id.to_string())),
        }
    }

    /// Iteration binding of a group member.
    pub fn binding_for(&self, id: &InstanceId) -> Option<&IterationBinding> {
        let index = id.index?;
        self.registry.resolve(&id.step).ok()?.items.get(index)
    }

    /// True for instances that execute a unit (leaves and members).
    pub fn is_unit(&self, id: &InstanceId) -> bool {
        id.is_member() || !self.groups.contains(&id.step)
    }

    fn threads_of(&self, id: &InstanceId) -> usize {
        self.template_for(id)
            .map(|t| t.resources.threads.max(1))
            .unwrap_or(1)
    }

    /// Computes the next actions for `run`.
    pub fn plan(&self, run: &WorkflowRun) -> Result<Vec<Action>, RunError> {
        let mut actions = Vec::new();

        let running_units: Vec<&StepInstance> = run
            .instances
            .iter()
            .filter(|i| i.status == StepStatus::Running && self.is_unit(&i.id))
            .collect();
        let mut running = running_units.len();
        let mut threads_used: usize = running_units.iter().map(|i| self.threads_of(&i.id)).sum();

        for name in &self.order {
            let template = self.registry.resolve(name)?;
            let id = InstanceId::step(name.clone());
            let Some(instance) = run.instance(&id) else {
                continue;
            };

            match instance.status {
                StepStatus::Pending => {
                    let Some(decision) = self.decide(template, run)? else {
                        continue;
                    };
                    match decision {
                        Ok(()) if template.is_group() => {
                            actions.push(Action::StartGroup { step: name.clone() });
                        }
                        Ok(()) => {
                            let threads = self.threads_of(&id);
                            if self.has_capacity(running, threads_used, threads) {
                                running += 1;
                                threads_used += threads;
                                actions.push(Action::Dispatch { id });
                            }
                        }
                        Err(reason) => {
                            for member in run.members(name) {
                                if member.status == StepStatus::Pending {
                                    actions.push(Action::Skip {
                                        id: member.id.clone(),
                                        reason: reason.clone(),
                                    });
                                }
                            }
                            actions.push(Action::Skip { id, reason });
                        }
                    }
                }
                StepStatus::Running if template.is_group() => {
                    self.plan_group(template, run, &mut running, &mut threads_used, &mut actions);
                }
                _ => {}
            }
        }

        if !actions.is_empty() {
            debug!("Planned {} action(s)", actions.len());
        }
        Ok(actions)
    }

    /// Returns `None` while dependencies are unfinished, otherwise whether
    /// the step may run or the reason it is skipped.
    fn decide(
        &self,
        template: &StepTemplate,
        run: &WorkflowRun,
    ) -> Result<Option<Result<(), Reason>>, RunError> {
        let mut deps = Vec::with_capacity(template.depends_on.len());
        for dependency in &template.depends_on {
            let instance = run
                .step(dependency)
                .ok_or_else(|| RunError::UnknownInstance(dependency.clone()))?;
            if !instance.status.is_terminal() {
                return Ok(None);
            }
            deps.push(instance);
        }

        if !template.fail_ignore {
            if let Some(failed) = self.failed_ancestor(&template.name, run) {
                return Ok(Some(Err(Reason::UpstreamFailed {
                    step: failed.to_string(),
                })));
            }
        }

        if !deps.is_empty() && deps.iter().all(|d| d.status == StepStatus::Skipped) {
            return Ok(Some(Err(Reason::UpstreamSkipped)));
        }

        if let Some(gate) = &template.gate {
            if !condition::evaluate(gate, run)? {
                return Ok(Some(Err(Reason::GateFalse {
                    condition: gate.to_string(),
                })));
            }
        }

        Ok(Some(Ok(())))
    }

    /// First transitive dependency of `name` that failed. Every ancestor is
    /// terminal once the direct dependencies are.
    fn failed_ancestor(&self, name: &str, run: &WorkflowRun) -> Option<&str> {
        self.ancestors
            .get(name)?
            .iter()
            .find(|step| run.step(step).is_some_and(|i| i.status == StepStatus::Failed))
            .map(String::as_str)
    }

    fn has_capacity(&self, running: usize, threads_used: usize, threads: usize) -> bool {
        if running >= self.max_parallel {
            return false;
        }
        // A unit larger than the whole budget may still run alone.
        running == 0 || threads_used + threads <= self.max_threads
    }

    fn plan_group(
        &self,
        template: &StepTemplate,
        run: &WorkflowRun,
        running: &mut usize,
        threads_used: &mut usize,
        actions: &mut Vec<Action>,
    ) {
        let members = run.members(&template.name);
        let failed = members
            .iter()
            .filter(|m| m.status == StepStatus::Failed)
            .count();

        if members.iter().all(|m| m.status.is_terminal()) {
            let (status, reason) = if failed > 0 {
                (StepStatus::Failed, Some(Reason::MembersFailed { count: failed }))
            } else {
                (StepStatus::Succeeded, None)
            };
            actions.push(Action::FinishGroup {
                step: template.name.clone(),
                status,
                reason,
            });
            return;
        }

        let pending = members.iter().filter(|m| m.status == StepStatus::Pending);

        if template.fail_fast && failed > 0 {
            for member in pending {
                actions.push(Action::Skip {
                    id: member.id.clone(),
                    reason: Reason::GroupHalted,
                });
            }
            return;
        }

        let mut active = members
            .iter()
            .filter(|m| m.status == StepStatus::Running)
            .count();
        let limit = template.parallelism_limit();

        for member in pending {
            if active >= limit {
                break;
            }
            let threads = self.threads_of(&member.id);
            if !self.has_capacity(*running, *threads_used, threads) {
                break;
            }
            active += 1;
            *running += 1;
            *threads_used += threads;
            actions.push(Action::Dispatch {
                id: member.id.clone(),
            });
        }
    }
}
