//! Stepflow CLI Entry Point
//!
//! Provides command-line interface for workflow execution.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow
//! stepflow maintenance.yaml --arg db-host=pg-primary
//!
//! # Arguments from a file, persisted state
//! stepflow maintenance.yaml --args-file args.yaml --state run.json
//!
//! # Dry run mode (preview commands)
//! stepflow maintenance.yaml --dry-run
//!
//! # Inspect a persisted run
//! stepflow --status run.json
//! ```

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use log::{error, info, warn};

use stepflow::execution::{DryRunRunner, Engine, ShellRunner, StaticSecrets, StepRunner};
use stepflow::monitoring::ExecutionTimeline;
use stepflow::workflow::parser::parse_argument;
use stepflow::workflow::{load_arguments_file, load_registry, RunStatus, StepStatus, WorkflowRun};
use stepflow::{APP_NAME, VERSION};

/// Interval between resource samples in verbose mode.
const MONITOR_INTERVAL: Duration = Duration::from_millis(500);

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    definition_path: Option<String>,
    arguments: Vec<(String, String)>,
    args_file: Option<PathBuf>,
    max_parallel: usize,
    state_path: Option<PathBuf>,
    secrets_path: Option<PathBuf>,
    working_dir: Option<PathBuf>,
    status_path: Option<PathBuf>,
    dry_run: bool,
    json: bool,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            definition_path: None,
            arguments: Vec::new(),
            args_file: None,
            max_parallel: num_cpus::get(),
            state_path: None,
            secrets_path: None,
            working_dir: None,
            status_path: None,
            dry_run: false,
            json: false,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Gated DAG Workflow Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: stepflow [OPTIONS] <DEFINITION_FILE>");
    println!("       stepflow --status <STATE_FILE>");
    println!();
    println!("Arguments:");
    println!("  <DEFINITION_FILE>   Path to workflow definition (YAML or JSON)");
    println!();
    println!("Options:");
    println!("  --arg KEY=VALUE     Set a workflow argument (repeatable)");
    println!("  --args-file PATH    Read workflow arguments from a YAML/JSON file");
    println!("  --parallel N        Maximum concurrent units (default: {})", num_cpus::get());
    println!("  --state PATH        Persist run state as JSON");
    println!("  --secrets PATH      JSON secret stores for secret references");
    println!("  --working-dir PATH  Working directory for step commands");
    println!("  --dry-run           Preview commands without execution");
    println!("  --json              Print the final run state as JSON");
    println!("  --status PATH       Show a persisted run and exit");
    println!("  --verbose           Enable debug logging and timeline output");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  stepflow demos/db-maintenance.yaml --arg db-host=pg1 --dry-run");
    println!("  stepflow demos/db-maintenance.yaml --secrets demos/secrets.json --parallel 2");
}

/// Returns the value following option `args[*i]`.
fn option_value<'a>(args: &'a [String], i: &mut usize, what: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires {} argument", args[*i - 1], what))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--dry-run" => config.dry_run = true,
            "--json" => config.json = true,
            "--verbose" | "-v" => config.verbose = true,
            "--arg" => {
                let pair = option_value(args, &mut i, "a KEY=VALUE")?;
                config.arguments.push(parse_argument(pair)?);
            }
            "--args-file" => {
                config.args_file = Some(PathBuf::from(option_value(args, &mut i, "a path")?));
            }
            "--state" => {
                config.state_path = Some(PathBuf::from(option_value(args, &mut i, "a path")?));
            }
            "--secrets" => {
                config.secrets_path = Some(PathBuf::from(option_value(args, &mut i, "a path")?));
            }
            "--working-dir" => {
                config.working_dir = Some(PathBuf::from(option_value(args, &mut i, "a path")?));
            }
            "--status" => {
                config.status_path = Some(PathBuf::from(option_value(args, &mut i, "a path")?));
            }
            "--parallel" => {
                let value = option_value(args, &mut i, "a number")?;
                config.max_parallel = value
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| format!("Invalid parallel value: {}", value))?;
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.definition_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.definition_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    if config.definition_path.is_none() && config.status_path.is_none() {
        return Err("No workflow definition given".to_string());
    }

    Ok(config)
}

/// Checks that the working directory exists.
fn check_working_directory(dir: &Path) -> Result<(), String> {
    if !dir.exists() {
        return Err(format!("Working directory does not exist: {}", dir.display()));
    }
    if !dir.is_dir() {
        return Err(format!("Path is not a directory: {}", dir.display()));
    }
    info!("Working directory: {}", dir.display());
    Ok(())
}

/// Merges `--args-file` values with `--arg` pairs; the latter win.
fn collect_arguments(config: &Config) -> stepflow::Result<BTreeMap<String, String>> {
    let mut arguments = match &config.args_file {
        Some(path) => load_arguments_file(path)?,
        None => BTreeMap::new(),
    };
    for (key, value) in &config.arguments {
        arguments.insert(key.clone(), value.clone());
    }
    Ok(arguments)
}

/// Prints one line per instance, colored by status.
fn print_report(run: &WorkflowRun) {
    println!();
    println!("Run {} ({})", run.run_id.bold(), run.workflow);
    println!();

    for instance in &run.instances {
        let label = format!("{:<9}", instance.status);
        let label = match instance.status {
            StepStatus::Succeeded => label.green(),
            StepStatus::Failed => label.red(),
            StepStatus::Skipped => label.yellow(),
            _ => label.normal(),
        };

        let mut line = format!("  {} {:<24}", label, instance.id.to_string());
        if let Some(ms) = instance.duration_ms() {
            line.push_str(&format!(" {:>7} ms", ms));
        }
        if instance.attempt > 1 {
            line.push_str(&format!("  (attempts: {})", instance.attempt));
        }
        if let Some(reason) = &instance.reason {
            line.push_str(&format!("  {}", reason.to_string().dimmed()));
        }
        println!("{}", line);
    }

    let status = match run.status() {
        RunStatus::Succeeded => "Succeeded".green().bold(),
        RunStatus::Failed => "Failed".red().bold(),
        RunStatus::Running => "Running".normal().bold(),
    };
    println!();
    println!("Status: {}", status);
}

fn print_json(run: &WorkflowRun) -> stepflow::Result<()> {
    let value = serde_json::json!({
        "run": run,
        "status": run.status(),
    });
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn exit_code(run: &WorkflowRun) -> ExitCode {
    match run.status() {
        RunStatus::Succeeded => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}

/// Shows a persisted run.
fn show_status(config: &Config, path: &Path) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let run = WorkflowRun::load(path)?;
    if config.json {
        print_json(&run)?;
    } else {
        print_report(&run);
    }
    Ok(exit_code(&run))
}

/// Main application entry point.
async fn run() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);

    if let Some(path) = &config.status_path {
        return show_status(&config, path);
    }
    let Some(definition_path) = config.definition_path.as_deref() else {
        return Err("No workflow definition given".into());
    };

    if !config.json {
        print_banner();
    }

    if config.dry_run {
        info!("Mode: DRY RUN (commands will not execute)");
    }

    // Load and check the definition
    info!("Loading workflow: {}", definition_path);
    let registry = load_registry(definition_path).map_err(|e| {
        error!("Failed to load workflow [{}]: {}", e.code(), e);
        e
    })?;
    info!(
        "Workflow '{}' loaded: {} steps",
        registry.name(),
        registry.len()
    );

    let arguments = collect_arguments(&config)?;

    // Create and configure engine
    let runner: Arc<dyn StepRunner> = if config.dry_run {
        Arc::new(DryRunRunner::new())
    } else {
        let mut shell = ShellRunner::new();
        if let Some(dir) = &config.working_dir {
            check_working_directory(dir)?;
            shell = shell.with_working_dir(dir);
        }
        Arc::new(shell)
    };

    let mut engine = Engine::new(registry, runner);
    engine.set_max_parallel(config.max_parallel);
    if let Some(path) = &config.secrets_path {
        engine = engine.with_secrets(Arc::new(StaticSecrets::from_file(path)?));
    }
    if let Some(path) = &config.state_path {
        info!("Persisting run state to {}", path.display());
        engine.set_state_path(path);
    }
    if config.verbose {
        engine.enable_resource_monitor(MONITOR_INTERVAL);
    }

    let run = engine.submit(arguments)?;
    let handle = run.handle();

    let interrupt = handle.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupted, cancelling run");
                interrupt.cancel();
            }
            Err(e) => warn!("Could not listen for Ctrl-C: {}", e),
        }
    });

    // Execute workflow
    let result = run.execute().await?;

    if config.json {
        print_json(&result)?;
    } else {
        print_report(&result);
        if config.verbose {
            let timeline =
                ExecutionTimeline::from_transitions(result.created_at, &handle.transitions()?);
            println!("{}", timeline.gantt_chart());
        }
    }

    Ok(exit_code(&result))
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
