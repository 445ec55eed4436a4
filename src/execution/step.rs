//! Executable Unit Runners
//!
//! A [`StepRunner`] receives fully materialized arguments and reports the
//! exit status and captured output of one attempt. The engine never cares
//! how a unit runs; [`ShellRunner`] writes the command into a bash script
//! and runs it as a child process.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use colored::Colorize;
use log::{debug, error, warn};
use once_cell::sync::Lazy;
use tokio::process::Command;
use tokio::sync::watch;

use crate::error::RunnerError;
use crate::workflow::ConcreteArgs;

/// Directory holding generated execution scripts.
static SCRIPT_DIR: Lazy<PathBuf> = Lazy::new(|| std::env::temp_dir().join("stepflow_scripts"));

static SCRIPT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Result of one attempt of an executable unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerOutcome {
    /// Process exit status; `-1` when killed by a signal
    pub exit_status: i32,
    /// Captured standard output
    pub output: String,
}

impl RunnerOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            exit_status: 0,
            output: output.into(),
        }
    }

    pub fn failure(exit_status: i32, output: impl Into<String>) -> Self {
        Self {
            exit_status,
            output: output.into(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_status == 0
    }
}

/// Runs one executable unit.
///
/// Implementations must return promptly with [`RunnerError::Cancelled`]
/// once `stop` turns `true`.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run(
        &self,
        unit: &ConcreteArgs,
        stop: watch::Receiver<bool>,
    ) -> Result<RunnerOutcome, RunnerError>;
}

/// Resolves once `stop` is set. A dropped sender never resolves.
pub async fn stopped(mut stop: watch::Receiver<bool>) {
    let closed = stop.wait_for(|s| *s).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// Runs units as bash scripts.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    working_dir: Option<PathBuf>,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Base directory for units; relative unit directories are joined to it.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn directory_for(&self, unit: &ConcreteArgs) -> Option<PathBuf> {
        match (&self.working_dir, &unit.working_dir) {
            (Some(base), Some(dir)) => Some(base.join(dir)),
            (None, Some(dir)) => Some(dir.clone()),
            (Some(base), None) => Some(base.clone()),
            (None, None) => None,
        }
    }
}

#[async_trait]
impl StepRunner for ShellRunner {
    async fn run(
        &self,
        unit: &ConcreteArgs,
        stop: watch::Receiver<bool>,
    ) -> Result<RunnerOutcome, RunnerError> {
        let script_path = create_execution_script(&unit.instance, &unit.command)
            .map_err(RunnerError::Script)?;

        let mut cmd = Command::new("bash");
        cmd.arg(&script_path)
            .args(&unit.args)
            .envs(&unit.env)
            .envs(&unit.secret_env)
            .env("STEP_INSTANCE", &unit.instance)
            .env("STEP_THREADS", unit.resources.threads.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = self.directory_for(unit) {
            debug!("Executing '{}' in directory: {}", unit.instance, dir.display());
            cmd.current_dir(dir);
        }

        let result = execute(&mut cmd, unit, stop).await;
        remove_script(&script_path);
        let output = result?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let exit_status = output.status.code().unwrap_or(-1);

        if output.status.success() {
            debug!("'{}' completed successfully", unit.instance);
            if !stdout.trim().is_empty() {
                debug!("'{}' output:\n{}", unit.instance, stdout);
            }
        } else {
            error!("'{}' failed with exit code: {}", unit.instance, exit_status);
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                error!("stderr:\n{}", stderr);
            }
        }

        Ok(RunnerOutcome {
            exit_status,
            output: stdout,
        })
    }
}

/// Spawns `cmd` and waits for it under the unit's timeout and the stop
/// signal. The child is killed if either fires first.
async fn execute(
    cmd: &mut Command,
    unit: &ConcreteArgs,
    stop: watch::Receiver<bool>,
) -> Result<std::process::Output, RunnerError> {
    let child = cmd.spawn().map_err(|source| RunnerError::Spawn {
        command: unit.instance.clone(),
        source,
    })?;

    let wait = child.wait_with_output();
    tokio::pin!(wait);

    let timeout = unit.resources.timeout_secs;
    let deadline = async move {
        match timeout {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        output = &mut wait => output.map_err(RunnerError::Script),
        _ = deadline => {
            warn!("'{}' timed out after {}s", unit.instance, timeout.unwrap_or_default());
            Err(RunnerError::Timeout(timeout.unwrap_or_default()))
        }
        _ = stopped(stop) => {
            warn!("'{}' cancelled", unit.instance);
            Err(RunnerError::Cancelled)
        }
    }
}

/// Writes `command_text` into a fresh bash script.
fn create_execution_script(instance: &str, command_text: &str) -> std::io::Result<PathBuf> {
    fs::create_dir_all(&*SCRIPT_DIR)?;

    let safe: String = instance
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let seq = SCRIPT_SEQ.fetch_add(1, Ordering::Relaxed);
    let script_path = SCRIPT_DIR.join(format!("step_{}_{}_{}.sh", safe, std::process::id(), seq));

    let mut file = File::create(&script_path)?;
    writeln!(file, "#!/bin/bash")?;
    writeln!(file, "set -e")?;
    writeln!(file, "{}", command_text)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o700))?;
    }

    Ok(script_path)
}

fn remove_script(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!("Failed to clean up script {}: {}", path.display(), e);
    }
}

/// Prints each unit instead of running it.
#[derive(Debug, Clone, Default)]
pub struct DryRunRunner {
    output: String,
}

impl DryRunRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output reported for every unit, as seen by gates downstream.
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }
}

#[async_trait]
impl StepRunner for DryRunRunner {
    async fn run(
        &self,
        unit: &ConcreteArgs,
        _stop: watch::Receiver<bool>,
    ) -> Result<RunnerOutcome, RunnerError> {
        let mut line = format!("  {} {}", "[dry-run]".cyan(), unit.instance.as_str().bold());
        if !unit.args.is_empty() {
            line.push_str(&format!(" (args: {})", unit.args.join(" ")));
        }
        println!("{}", line);
        for command_line in unit.command.lines() {
            println!("      {}", command_line.dimmed());
        }
        if !unit.secret_env.is_empty() {
            let names: Vec<&str> = unit.secret_env.keys().map(String::as_str).collect();
            println!("      secrets: {}", names.join(", ").yellow());
        }
        Ok(RunnerOutcome::success(self.output.clone()))
    }
}
