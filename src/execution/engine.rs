//! Execution Coordinator
//!
//! The engine that runs workflows on behalf of callers:
//! - Single runs, by stored workflow name or from a loaded workflow
//! - Batches of runs over many input sets, bounded by a concurrency limit
//! - Background runs with their own cancellation handle
//! - Run history persistence
//!
//! Every run gets a child of the engine's root cancellation token, so
//! [`Engine::cancel_all`] stops everything in flight.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use log::{info, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::history::RunHistory;
use super::result::{BatchRun, ExecutionRun, RunStatus};
use super::runner::WorkflowRunner;
use super::step::StepExecutor;
use crate::browser::{BrowserLauncher, BrowserPool};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::healing::{CommandOracle, FastStrategy, HealingEngine, OracleStrategy, WorkflowUpdater};
use crate::workflow::{Bindings, Workflow, WorkflowStore};

/// Default number of runs executing at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// Workflow execution engine.
///
/// Cheap to clone; clones share the runner, the concurrency limit and the
/// root cancellation token.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use healrunner::browser::{MemoryLauncher, MemorySite};
/// use healrunner::config::EngineConfig;
/// use healrunner::execution::Engine;
/// use healrunner::workflow::Bindings;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let launcher = Arc::new(MemoryLauncher::new(MemorySite::permissive()));
///     let mut engine = Engine::from_config(&EngineConfig::default(), launcher);
///     engine.set_max_concurrency(4);
///
///     let run = engine.run("login", &Bindings::new()).await?;
///     println!("{:?}", run.status);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Engine {
    runner: Arc<WorkflowRunner>,
    store: WorkflowStore,
    history: Option<RunHistory>,
    limit: Arc<Semaphore>,
    max_concurrency: usize,
    root: CancellationToken,
}

/// A run executing in the background.
pub struct RunHandle {
    cancel: CancellationToken,
    join: JoinHandle<ExecutionRun>,
}

impl RunHandle {
    /// Asks the run to stop; it finishes as `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) -> Result<ExecutionRun> {
        Ok(self.join.await?)
    }
}

impl Engine {
    /// Creates an engine around a configured runner.
    pub fn new(runner: WorkflowRunner, store: WorkflowStore) -> Self {
        Self {
            runner: Arc::new(runner),
            store,
            history: None,
            limit: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENCY)),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            root: CancellationToken::new(),
        }
    }

    /// Builds the standard engine: pool, executor and, when enabled,
    /// healing with the fast strategy, the optional oracle and the updater.
    pub fn from_config(config: &EngineConfig, launcher: Arc<dyn BrowserLauncher>) -> Self {
        let pool = BrowserPool::new(launcher, config.execution.effective_pool_size());
        let store = WorkflowStore::new(&config.storage.workflows_dir);

        let mut runner = WorkflowRunner::new(pool)
            .with_executor(StepExecutor::new(&config.execution.screenshot_dir))
            .with_retry_policy(config.execution.retry.clone());

        if config.healing.enabled {
            let updater = Arc::new(WorkflowUpdater::new(store.clone(), &config.storage.backups_dir));
            let mut healer = HealingEngine::new(config.healing.timeout())
                .with_strategy(Arc::new(FastStrategy::new(
                    config.execution.max_step_timeout(),
                    config.healing.max_alternates,
                )))
                .with_updater(updater);

            if let Some(oracle) = config
                .healing
                .oracle_command
                .as_deref()
                .and_then(CommandOracle::from_command_line)
            {
                healer = healer.with_strategy(Arc::new(OracleStrategy::new(
                    Arc::new(oracle),
                    config.healing.timeout(),
                )));
            }
            info!("Healing enabled (strategies: {})", healer.strategy_names().join(", "));
            runner = runner.with_healer(Arc::new(healer));
        }

        let mut engine = Self::new(runner, store);
        engine.set_max_concurrency(config.execution.max_concurrency);
        engine.set_history(RunHistory::new(&config.storage.history_dir));
        engine
    }

    /// Sets the maximum number of runs executing at once. Call before
    /// starting runs.
    pub fn set_max_concurrency(&mut self, max: usize) {
        let max = max.max(1);
        self.max_concurrency = max;
        self.limit = Arc::new(Semaphore::new(max));
    }

    /// Saves every finished run to `history`.
    pub fn set_history(&mut self, history: RunHistory) {
        self.history = Some(history);
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn store(&self) -> &WorkflowStore {
        &self.store
    }

    pub fn runner(&self) -> &WorkflowRunner {
        &self.runner
    }

    /// Loads `name` from the store and runs it.
    pub async fn run(&self, name: &str, inputs: &Bindings) -> Result<ExecutionRun> {
        let workflow = self.store.load(name)?;
        Ok(self.run_workflow(&workflow, inputs).await)
    }

    /// Runs an already loaded workflow once.
    pub async fn run_workflow(&self, workflow: &Workflow, inputs: &Bindings) -> ExecutionRun {
        execute(
            Arc::clone(&self.runner),
            Arc::clone(&self.limit),
            self.history.clone(),
            workflow,
            inputs,
            self.root.child_token(),
        )
        .await
    }

    /// Runs `workflow` once per input set, at most `max_concurrency` at a
    /// time. Runs are independent: one failing does not stop the others.
    pub async fn run_batch(&self, workflow: &Workflow, inputs: Vec<Bindings>) -> Result<BatchRun> {
        let started_at = Utc::now();
        let workflow = Arc::new(workflow.clone());
        info!(
            "Starting batch of {} run(s) of '{}' (max concurrency: {})",
            inputs.len(),
            workflow.name,
            self.max_concurrency
        );

        let tasks: Vec<JoinHandle<ExecutionRun>> = inputs
            .into_iter()
            .map(|binding| {
                let runner = Arc::clone(&self.runner);
                let limit = Arc::clone(&self.limit);
                let history = self.history.clone();
                let workflow = Arc::clone(&workflow);
                let cancel = self.root.child_token();
                tokio::spawn(async move { execute(runner, limit, history, &workflow, &binding, cancel).await })
            })
            .collect();

        let mut runs = Vec::with_capacity(tasks.len());
        for joined in join_all(tasks).await {
            runs.push(joined?);
        }

        let batch = BatchRun::from_runs(&workflow.name, started_at, runs);
        info!(
            "Batch of '{}' finished: {} succeeded, {} failed, {} cancelled, {} repair(s)",
            batch.workflow, batch.succeeded, batch.failed, batch.cancelled, batch.healing_applications
        );
        Ok(batch)
    }

    /// Starts a run in the background.
    pub fn spawn(&self, workflow: Workflow, inputs: Bindings) -> RunHandle {
        let cancel = self.root.child_token();
        let runner = Arc::clone(&self.runner);
        let limit = Arc::clone(&self.limit);
        let history = self.history.clone();
        let token = cancel.clone();

        let join = tokio::spawn(async move { execute(runner, limit, history, &workflow, &inputs, token).await });
        RunHandle { cancel, join }
    }

    /// Cancels every run started by this engine.
    pub fn cancel_all(&self) {
        warn!("Cancelling all runs");
        self.root.cancel();
    }

    /// Cancels outstanding runs and closes the browser pool.
    pub async fn shutdown(&self) {
        self.root.cancel();
        self.limit.close();
        self.runner.pool().shutdown().await;
        info!("Engine shut down");
    }
}

async fn execute(
    runner: Arc<WorkflowRunner>,
    limit: Arc<Semaphore>,
    history: Option<RunHistory>,
    workflow: &Workflow,
    inputs: &Bindings,
    cancel: CancellationToken,
) -> ExecutionRun {
    let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        permit = limit.acquire_owned() => permit.ok(),
    };

    let run = match permit {
        Some(_permit) => runner.run(workflow, inputs, &cancel).await,
        None => {
            let mut run = ExecutionRun::new(&workflow.name, workflow.revision, workflow.len(), inputs.clone());
            run.finish(RunStatus::Cancelled);
            run
        }
    };

    if let Some(history) = &history {
        if let Err(e) = history.save(&run) {
            warn!("Failed to save run {}: {}", run.run_id, e);
        }
    }
    run
}
