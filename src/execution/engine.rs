//! Workflow Execution Engine
//!
//! Drives one run of a workflow:
//! - Validates the registry against the submitted arguments
//! - Creates every step and member instance up front
//! - Applies planner actions and dispatches units as tokio tasks
//! - Retries failed attempts and propagates cancellation
//!
//! The engine loop is the only writer of the run state store. Units run in
//! a `JoinSet` and the loop joins them one by one; cancellation is broadcast
//! on a watch channel. A fatal error stops every unit before it is returned.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::{self, JoinError, JoinSet};

use crate::error::{RunError, RunnerError};
use crate::monitoring::ResourceMonitor;
use crate::workflow::params::ParameterResolver;
use crate::workflow::planner::{Action, ExecutionPlanner};
use crate::workflow::registry::StepRegistry;
use crate::workflow::state::{
    InstanceId, Reason, RunStateStore, StepStatus, Transition, TransitionDetails, WorkflowRun,
};
use crate::workflow::validator::validate;
use crate::workflow::ConcreteArgs;

use super::secrets::{attach_secrets, NoSecrets, SecretProvider};
use super::step::{stopped, RunnerOutcome, StepRunner};

/// Time runners get to honor the stop signal after a fatal error.
const HALT_GRACE: Duration = Duration::from_secs(5);

type UnitResult = Result<RunnerOutcome, RunnerError>;

/// Unit tasks of a run, keyed back to their instances.
#[derive(Default)]
struct InFlight {
    tasks: JoinSet<UnitResult>,
    owners: HashMap<task::Id, InstanceId>,
    units: HashMap<InstanceId, ConcreteArgs>,
}

impl InFlight {
    fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Waits for the next attempt to end. A panicking runner counts as a
    /// runner error on its instance.
    async fn next(&mut self) -> Option<(InstanceId, UnitResult)> {
        loop {
            let (task_id, result) = match self.tasks.join_next_with_id().await? {
                Ok((task_id, result)) => (task_id, result),
                Err(e) => (e.id(), Err(RunnerError::Panicked(panic_message(e)))),
            };
            match self.owners.remove(&task_id) {
                Some(id) => return Some((id, result)),
                None => warn!("Result from untracked unit task {}", task_id),
            }
        }
    }
}

fn panic_message(error: JoinError) -> String {
    match error.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string()),
        Err(e) => e.to_string(),
    }
}

/// Workflow execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use std::collections::BTreeMap;
/// use std::sync::Arc;
///
/// use stepflow::execution::{Engine, ShellRunner};
/// use stepflow::workflow::load_registry;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let registry = load_registry("demos/db-maintenance.yaml")?;
///     let mut engine = Engine::new(registry, Arc::new(ShellRunner::new()));
///     engine.set_max_parallel(4);
///
///     let run = engine.submit(BTreeMap::new())?;
///     let result = run.execute().await?;
///     println!("{}: {}", result.run_id, result.status());
///     Ok(())
/// }
/// ```
pub struct Engine {
    registry: Arc<StepRegistry>,
    runner: Arc<dyn StepRunner>,
    secrets: Arc<dyn SecretProvider>,
    max_parallel: Option<usize>,
    max_threads: Option<usize>,
    state_path: Option<PathBuf>,
    monitor_interval: Option<Duration>,
    run_counter: AtomicU64,
}

impl Engine {
    pub fn new(registry: StepRegistry, runner: Arc<dyn StepRunner>) -> Self {
        Self {
            registry: Arc::new(registry),
            runner,
            secrets: Arc::new(NoSecrets),
            max_parallel: None,
            max_threads: None,
            state_path: None,
            monitor_interval: None,
            run_counter: AtomicU64::new(0),
        }
    }

    /// Sets the provider used to resolve secret references at dispatch.
    pub fn with_secrets(mut self, secrets: Arc<dyn SecretProvider>) -> Self {
        self.secrets = secrets;
        self
    }

    /// Caps the number of units running at once across a run.
    pub fn set_max_parallel(&mut self, max: usize) {
        self.max_parallel = Some(max);
    }

    /// Sets the thread budget shared by running units (defaults to the
    /// number of CPUs).
    pub fn set_max_threads(&mut self, max: usize) {
        self.max_threads = Some(max);
    }

    /// Persists each run's state as JSON at `path` after every engine pass.
    pub fn set_state_path(&mut self, path: impl Into<PathBuf>) {
        self.state_path = Some(path.into());
    }

    /// Samples CPU and memory while runs execute.
    pub fn enable_resource_monitor(&mut self, interval: Duration) {
        self.monitor_interval = Some(interval);
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    fn next_run_id(&self) -> String {
        let n = self.run_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!(
            "{}-{}-{}",
            self.registry.name(),
            Utc::now().format("%Y%m%dT%H%M%S%3f"),
            n
        )
    }

    /// Creates a run for the given workflow arguments.
    ///
    /// All static checks happen here: a definition error returns before
    /// any instance exists.
    pub fn submit(&self, arguments: BTreeMap<String, String>) -> Result<Run, RunError> {
        let resolver = ParameterResolver::new(self.registry.arguments(), arguments);
        let order = validate(&self.registry, &resolver)?;

        let mut planner = ExecutionPlanner::new(Arc::clone(&self.registry), order);
        if let Some(max) = self.max_parallel {
            planner = planner.with_max_parallel(max);
        }
        if let Some(max) = self.max_threads {
            planner = planner.with_max_threads(max);
        }

        let run_id = self.next_run_id();
        let ids = planner.instance_ids();
        info!(
            "Submitted run '{}' with {} instance(s)",
            run_id,
            ids.len()
        );

        let mut store = RunStateStore::new(run_id, self.registry.name(), ids);
        if let Some(path) = &self.state_path {
            store = store.with_persistence(path);
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);

        Ok(Run {
            store: Arc::new(store),
            planner,
            resolver,
            runner: Arc::clone(&self.runner),
            secrets: Arc::clone(&self.secrets),
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
            monitor_interval: self.monitor_interval,
        })
    }
}

/// Cloneable view of a run: inspect it or cancel it from anywhere.
#[derive(Clone)]
pub struct RunHandle {
    store: Arc<RunStateStore>,
    cancel_tx: Arc<watch::Sender<bool>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        self.store.run_id()
    }

    pub fn snapshot(&self) -> Result<WorkflowRun, RunError> {
        self.store.snapshot()
    }

    pub fn transitions(&self) -> Result<Vec<Transition>, RunError> {
        self.store.transitions()
    }

    /// Requests cancellation. Pending and running instances end Failed.
    pub fn cancel(&self) {
        info!("Cancellation requested for run '{}'", self.store.run_id());
        self.cancel_tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }
}

/// A submitted run, ready to execute.
pub struct Run {
    store: Arc<RunStateStore>,
    planner: ExecutionPlanner,
    resolver: ParameterResolver,
    runner: Arc<dyn StepRunner>,
    secrets: Arc<dyn SecretProvider>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
    monitor_interval: Option<Duration>,
}

impl Run {
    pub fn run_id(&self) -> &str {
        self.store.run_id()
    }

    pub fn handle(&self) -> RunHandle {
        RunHandle {
            store: Arc::clone(&self.store),
            cancel_tx: Arc::clone(&self.cancel_tx),
        }
    }

    /// Executes the run to completion and returns its final snapshot.
    ///
    /// Step failures are recorded on their instances and are not errors
    /// here; only inconsistencies that make progress impossible are.
    pub async fn execute(self) -> Result<WorkflowRun, RunError> {
        let start_time = Instant::now();
        info!(
            "Starting run '{}' (max parallel: {})",
            self.run_id(),
            match self.planner.max_parallel() {
                usize::MAX => "unbounded".to_string(),
                n => n.to_string(),
            }
        );

        let monitor = self.monitor_interval.map(|interval| {
            let (stop_tx, stop_rx) = watch::channel(false);
            (stop_tx, ResourceMonitor::new().spawn(interval, stop_rx))
        });

        let result = self.drive().await;

        if let Some((stop_tx, handle)) = monitor {
            stop_tx.send_replace(true);
            match handle.await {
                Ok(monitor) => info!("{}", monitor.get_summary()),
                Err(e) => warn!("Resource monitor task failed: {}", e),
            }
        }

        let run = result?;
        let counts = run.counts();
        info!(
            "Run '{}' finished: {} in {:.2?} ({} succeeded, {} failed, {} skipped)",
            run.run_id,
            run.status(),
            start_time.elapsed(),
            counts.get(&StepStatus::Succeeded).copied().unwrap_or(0),
            counts.get(&StepStatus::Failed).copied().unwrap_or(0),
            counts.get(&StepStatus::Skipped).copied().unwrap_or(0),
        );
        Ok(run)
    }

    async fn drive(&self) -> Result<WorkflowRun, RunError> {
        let mut in_flight = InFlight::default();
        let result = self.drive_units(&mut in_flight).await;

        if let Err(e) = &result {
            error!("Run '{}' halted: {}", self.run_id(), e);
            self.halt(&mut in_flight).await;
        }
        self.store.flush().await;
        result?;

        let run = self.store.snapshot()?;
        if !run.is_terminal() {
            warn!(
                "Run '{}' stopped with unfinished instances",
                run.run_id
            );
        }
        Ok(run)
    }

    async fn drive_units(&self, in_flight: &mut InFlight) -> Result<(), RunError> {
        let mut cancel_rx = self.cancel_rx.clone();

        loop {
            let cancelled = *cancel_rx.borrow_and_update();

            if cancelled {
                self.cancel_remaining()?;
            } else {
                loop {
                    let snapshot = self.store.snapshot()?;
                    let actions = self.planner.plan(&snapshot)?;
                    if actions.is_empty() {
                        break;
                    }
                    for action in actions {
                        self.apply(action, in_flight)?;
                    }
                }
            }
            self.store.flush().await;

            if in_flight.is_empty() {
                return Ok(());
            }

            let completion = tokio::select! {
                completion = in_flight.next() => completion,
                changed = cancel_rx.changed(), if !cancelled => {
                    if changed.is_err() {
                        warn!("Cancellation channel closed");
                    }
                    continue;
                }
            };

            match completion {
                Some((id, result)) => self.complete(id, result, in_flight)?,
                None => {
                    warn!("No unit tasks left for {} running instance(s)", in_flight.units.len());
                    return Ok(());
                }
            }
        }
    }

    /// Stops every unit still running after a fatal error.
    ///
    /// Runners get the stop signal and [`HALT_GRACE`] to return; whatever is
    /// left after that is aborted.
    async fn halt(&self, in_flight: &mut InFlight) {
        self.cancel_tx.send_replace(true);

        let tasks = &mut in_flight.tasks;
        let drained = tokio::time::timeout(HALT_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!("Aborting {} unit(s) that ignored the stop signal", in_flight.tasks.len());
            in_flight.tasks.shutdown().await;
        }
    }

    fn record(
        &self,
        id: &InstanceId,
        from: StepStatus,
        to: StepStatus,
        details: TransitionDetails,
    ) -> Result<(), RunError> {
        self.store
            .record_transition(id, from, to, details, Utc::now())
            .map(|_| ())
    }

    fn apply(&self, action: Action, in_flight: &mut InFlight) -> Result<(), RunError> {
        match action {
            Action::Skip { id, reason } => {
                info!("Skipping '{}': {}", id, reason);
                self.record(
                    &id,
                    StepStatus::Pending,
                    StepStatus::Skipped,
                    TransitionDetails::reason(reason),
                )
            }
            Action::StartGroup { step } => {
                info!("Starting group: {}", step);
                self.record(
                    &InstanceId::step(step),
                    StepStatus::Pending,
                    StepStatus::Running,
                    TransitionDetails::none(),
                )
            }
            Action::FinishGroup {
                step,
                status,
                reason,
            } => {
                match &reason {
                    Some(reason) => error!("Group '{}' {}: {}", step, status, reason),
                    None => info!("Group '{}' {}", step, status),
                }
                self.record(
                    &InstanceId::step(step),
                    StepStatus::Running,
                    status,
                    TransitionDetails {
                        output: None,
                        reason,
                    },
                )
            }
            Action::Dispatch { id } => self.dispatch(id, in_flight),
        }
    }

    fn dispatch(&self, id: InstanceId, in_flight: &mut InFlight) -> Result<(), RunError> {
        let template = self.planner.template_for(&id)?;
        let mut unit = self
            .resolver
            .materialize(template, self.planner.binding_for(&id))?;
        unit.instance = id.to_string();

        info!("Starting: {}", id);
        self.record(&id, StepStatus::Pending, StepStatus::Running, TransitionDetails::none())?;

        if let Some(exec) = &template.executable {
            if let Err(e) = attach_secrets(&mut unit, exec, self.secrets.as_ref()) {
                error!("'{}' failed: {}", id, e);
                return self.record(
                    &id,
                    StepStatus::Running,
                    StepStatus::Failed,
                    TransitionDetails::reason(Reason::SecretUnavailable {
                        message: e.to_string(),
                    }),
                );
            }
        }

        self.spawn_unit(in_flight, id.clone(), unit.clone(), Duration::ZERO);
        in_flight.units.insert(id, unit);
        Ok(())
    }

    fn spawn_unit(
        &self,
        in_flight: &mut InFlight,
        id: InstanceId,
        unit: ConcreteArgs,
        delay: Duration,
    ) {
        let runner = Arc::clone(&self.runner);
        let stop = self.cancel_rx.clone();

        let handle = in_flight.tasks.spawn(async move {
            tokio::select! {
                biased;
                _ = stopped(stop.clone()) => Err(RunnerError::Cancelled),
                _ = tokio::time::sleep(delay) => runner.run(&unit, stop).await,
            }
        });
        in_flight.owners.insert(handle.id(), id);
    }

    fn complete(
        &self,
        id: InstanceId,
        result: Result<RunnerOutcome, RunnerError>,
        in_flight: &mut InFlight,
    ) -> Result<(), RunError> {
        let (output, reason) = match result {
            Ok(outcome) if outcome.succeeded() => {
                info!("'{}' completed successfully", id);
                in_flight.units.remove(&id);
                return self.record(
                    &id,
                    StepStatus::Running,
                    StepStatus::Succeeded,
                    TransitionDetails::output(outcome.output),
                );
            }
            Ok(outcome) => (
                Some(outcome.output),
                Reason::ExitStatus {
                    code: outcome.exit_status,
                },
            ),
            Err(RunnerError::Cancelled) => (None, Reason::Cancelled),
            Err(e) => (
                None,
                Reason::RunnerError {
                    message: e.to_string(),
                },
            ),
        };

        let policy = self
            .planner
            .template_for(&id)?
            .retry
            .unwrap_or_default();
        let attempt = self.store.instance(&id)?.attempt;
        let cancelled = *self.cancel_rx.borrow();

        if reason != Reason::Cancelled && !cancelled && attempt < policy.max_attempts() {
            warn!(
                "'{}' attempt {}/{} failed ({}), retrying in {} ms",
                id,
                attempt,
                policy.max_attempts(),
                reason,
                policy.backoff_ms
            );
            self.record(
                &id,
                StepStatus::Running,
                StepStatus::Running,
                TransitionDetails::reason(reason),
            )?;
            let Some(unit) = in_flight.units.get(&id).cloned() else {
                return Err(RunError::UnknownInstance(id.to_string()));
            };
            let delay = Duration::from_millis(policy.backoff_ms);
            self.spawn_unit(in_flight, id, unit, delay);
            return Ok(());
        }

        error!("'{}' failed: {}", id, reason);
        in_flight.units.remove(&id);
        self.record(
            &id,
            StepStatus::Running,
            StepStatus::Failed,
            TransitionDetails {
                output,
                reason: Some(reason),
            },
        )
    }

    /// Fails every Pending instance and every open group.
    ///
    /// Running units fail themselves once their runner sees the stop signal.
    fn cancel_remaining(&self) -> Result<(), RunError> {
        let snapshot = self.store.snapshot()?;
        for instance in &snapshot.instances {
            let from = match instance.status {
                StepStatus::Pending => StepStatus::Pending,
                StepStatus::Running if !self.planner.is_unit(&instance.id) => StepStatus::Running,
                _ => continue,
            };
            debug!("Cancelling '{}'", instance.id);
            self.record(
                &instance.id,
                from,
                StepStatus::Failed,
                TransitionDetails::reason(Reason::Cancelled),
            )?;
        }
        Ok(())
    }
}
