//! HealRunner CLI Entry Point
//!
//! Provides command-line interface for workflow replay.
//!
//! # Usage
//!
//! ```bash
//! # Replay a workflow with an automation process driving the browser
//! healrunner flows/login.json --browser-cmd "node driver.js"
//!
//! # Preview against a simulated browser
//! healrunner flows/login.json --dry-run
//!
//! # One run per input set, four at a time
//! healrunner flows/search.json --batch inputs.json --parallel 4
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info, warn};
use serde_json::Value;

use healrunner::browser::{BrowserLauncher, CommandLauncher, MemoryLauncher, MemorySite};
use healrunner::config::EngineConfig;
use healrunner::execution::{Engine, ExecutionRun, RunStatus};
use healrunner::workflow::{load_workflow, Bindings, Workflow, WorkflowStore};
use healrunner::{APP_NAME, VERSION};

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    workflow_path: Option<String>,
    vars_path: Option<String>,
    batch_path: Option<String>,
    config_path: Option<String>,
    browser_cmd: Option<String>,
    oracle_cmd: Option<String>,
    parallel: Option<usize>,
    dry_run: bool,
    no_heal: bool,
    verbose: bool,
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
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Self-Healing Browser Workflow Replay");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: healrunner [OPTIONS] <WORKFLOW_FILE>");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>       Workflow document (.json, or .yaml/.yml to import)");
    println!();
    println!("Options:");
    println!("  --vars FILE           Input variables for a single run (JSON or YAML map)");
    println!("  --batch FILE          One run per input set (JSON or YAML list of maps)");
    println!("  --parallel N          Maximum concurrent runs (default: 10)");
    println!("  --config FILE         Engine config file (default: healrun.yaml)");
    println!("  --browser-cmd CMD     Browser automation process to drive");
    println!("  --oracle-cmd CMD      Repair oracle process consulted when healing");
    println!("  --dry-run             Replay against a simulated browser");
    println!("  --no-heal             Disable self-healing");
    println!("  --verbose             Enable debug logging");
    println!("  --help                Show this help message");
    println!("  --version             Show version information");
    println!();
    println!("Examples:");
    println!("  healrunner flows/login.json --dry-run");
    println!("  healrunner flows/search.json --batch inputs.json --parallel 4 --browser-cmd \"node driver.js\"");
}

fn next_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a String, String> {
    *i += 1;
    args.get(*i).ok_or_else(|| format!("{} requires an argument", flag))
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
            "--no-heal" => config.no_heal = true,
            "--verbose" | "-v" => config.verbose = true,
            "--vars" => config.vars_path = Some(next_value(args, &mut i, arg)?.clone()),
            "--batch" => config.batch_path = Some(next_value(args, &mut i, arg)?.clone()),
            "--config" => config.config_path = Some(next_value(args, &mut i, arg)?.clone()),
            "--browser-cmd" => config.browser_cmd = Some(next_value(args, &mut i, arg)?.clone()),
            "--oracle-cmd" => config.oracle_cmd = Some(next_value(args, &mut i, arg)?.clone()),
            "--parallel" => {
                let value = next_value(args, &mut i, arg)?;
                let n: usize = value
                    .parse()
                    .map_err(|_| format!("Invalid parallel value: {}", value))?;
                if n == 0 {
                    return Err("--parallel must be at least 1".to_string());
                }
                config.parallel = Some(n);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.workflow_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.workflow_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    if config.vars_path.is_some() && config.batch_path.is_some() {
        return Err("--vars and --batch cannot be combined".to_string());
    }

    Ok(config)
}

/// Reads a JSON or YAML document by extension.
fn read_document(path: &str) -> Result<Value, Box<dyn std::error::Error>> {
    let content = fs::read_to_string(path)?;
    let is_yaml = path.ends_with(".yaml") || path.ends_with(".yml");
    Ok(if is_yaml {
        serde_yaml::from_str(&content)?
    } else {
        serde_json::from_str(&content)?
    })
}

/// Converts a map document into bindings; non-string scalars are kept in
/// their JSON text form.
fn to_bindings(value: &Value) -> Result<Bindings, String> {
    let Value::Object(map) = value else {
        return Err("input variables must be a map".to_string());
    };
    Ok(map
        .iter()
        .map(|(k, v)| {
            let text = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), text)
        })
        .collect())
}

/// Input sets for this invocation; a single empty set by default.
fn load_inputs(config: &Config) -> Result<Vec<Bindings>, Box<dyn std::error::Error>> {
    if let Some(path) = &config.batch_path {
        let Value::Array(items) = read_document(path)? else {
            return Err(format!("Batch file '{}' must contain a list of maps", path).into());
        };
        let inputs = items.iter().map(to_bindings).collect::<Result<Vec<_>, _>>()?;
        info!("Loaded {} input set(s) from {}", inputs.len(), path);
        return Ok(inputs);
    }
    if let Some(path) = &config.vars_path {
        return Ok(vec![to_bindings(&read_document(path)?)?]);
    }
    Ok(vec![Bindings::new()])
}

/// Loads the workflow and decides which store its repairs persist to.
///
/// JSON documents are updated in place; YAML documents are imported into
/// the configured workflows directory first.
fn prepare_workflow(path: &str, engine_config: &mut EngineConfig) -> Result<Workflow, Box<dyn std::error::Error>> {
    let mut workflow = load_workflow(path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        format!("Could not load workflow from '{}': {}", path, e)
    })?;

    let file = Path::new(path);
    let is_json = file.extension().and_then(|e| e.to_str()) == Some("json");

    if is_json {
        let stem = file
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| format!("Invalid workflow file name: {}", path))?;
        let dir = file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        workflow.name = stem.to_string();
        engine_config.storage.workflows_dir = dir;
        return Ok(workflow);
    }

    let store = WorkflowStore::new(&engine_config.storage.workflows_dir);
    if store.exists(&workflow.name) {
        warn!(
            "Workflow '{}' already stored in {}; running the stored revision",
            workflow.name,
            store.root().display()
        );
        return Ok(store.load(&workflow.name)?);
    }
    let saved = store.save(&workflow)?;
    info!("Imported workflow '{}' to {}", workflow.name, saved.display());
    Ok(workflow)
}

fn print_run(run: &ExecutionRun) {
    let status = match run.status {
        RunStatus::Succeeded => "SUCCEEDED".green().bold(),
        RunStatus::Cancelled => "CANCELLED".yellow().bold(),
        _ => "FAILED".red().bold(),
    };
    println!(
        "  {} {} ({}/{} steps, {} repair(s), {}ms)",
        status,
        run.run_id.to_string().dimmed(),
        run.succeeded_steps(),
        run.total_steps,
        run.healing_applications,
        run.duration_ms
    );
    if let Some(ctx) = &run.error {
        println!("    {}", ctx.describe().red());
    }
    if let Some(failure) = &run.failure {
        println!("    {}", failure.red());
    }
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let workflow_path = config
        .workflow_path
        .clone()
        .ok_or("No workflow file given (see --help)")?;

    let mut engine_config = match &config.config_path {
        Some(path) => EngineConfig::from_path(path)?,
        None => EngineConfig::load(),
    };
    if let Some(n) = config.parallel {
        engine_config.execution.max_concurrency = n;
    }
    if let Some(cmd) = &config.browser_cmd {
        engine_config.browser.command = Some(cmd.clone());
    }
    if let Some(cmd) = &config.oracle_cmd {
        engine_config.healing.oracle_command = Some(cmd.clone());
    }
    if config.no_heal || config.dry_run {
        engine_config.healing.enabled = false;
    }

    let launcher: Arc<dyn BrowserLauncher> = if config.dry_run {
        info!("Mode: DRY RUN (simulated browser, no repairs persisted)");
        Arc::new(MemoryLauncher::new(MemorySite::permissive()))
    } else {
        let cmd = engine_config
            .browser
            .command
            .clone()
            .ok_or("No browser command configured; pass --browser-cmd or --dry-run")?;
        Arc::new(CommandLauncher::from_command_line(&cmd)?)
    };

    let workflow = prepare_workflow(&workflow_path, &mut engine_config)?;
    let inputs = load_inputs(&config)?;
    info!(
        "Workflow '{}' (revision {}): {} steps, {} run(s)",
        workflow.name,
        workflow.revision,
        workflow.steps.len(),
        inputs.len()
    );

    let runtime = tokio::runtime::Runtime::new()?;
    let batch = runtime.block_on(async {
        let engine = Engine::from_config(&engine_config, launcher);

        let interrupt = engine.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupt.cancel_all();
            }
        });

        let batch = engine.run_batch(&workflow, inputs).await;
        engine.shutdown().await;
        batch
    })?;

    println!();
    println!("{}", format!("Results for '{}'", batch.workflow).bold());
    for run in &batch.runs {
        print_run(run);
    }
    println!(
        "  {} succeeded, {} failed, {} cancelled ({:.0}% success)",
        batch.succeeded,
        batch.failed,
        batch.cancelled,
        batch.success_rate() * 100.0
    );

    if batch.succeeded != batch.runs.len() {
        return Err(format!("{} of {} run(s) did not succeed", batch.runs.len() - batch.succeeded, batch.runs.len()).into());
    }
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
