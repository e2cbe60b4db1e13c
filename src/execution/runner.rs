//! Workflow Runner
//!
//! Executes one workflow for one set of inputs on one pooled browser.
//!
//! Steps run strictly in order. Each is rendered with the bindings in
//! scope just before it executes. When a step fails with a repairable
//! error and its position has not been repaired yet, the runner asks the
//! healing engine for replacement steps, splices them into its copy of the
//! workflow and resumes from the first replacement. Replacements belong to
//! the position they replaced: if one of them fails, the run fails.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use super::result::{ExecutionRun, RunStatus, StepResult};
use super::step::{StepError, StepExecutor, StepOutput};
use crate::browser::{Browser, BrowserPool, RetryPolicy};
use crate::error::EngineError;
use crate::healing::classifier::ErrorContext;
use crate::healing::{HealingEngine, HealingResult, RepairRequest};
use crate::workflow::{Bindings, Renderer, SimpleRenderer, Step, Workflow};

/// Bound on capturing page state after a failure.
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);

/// How one step attempt went.
struct Attempted {
    rendered: Step,
    budget_ms: u64,
    elapsed: Duration,
    result: Result<StepOutput, StepError>,
}

/// Why the step loop stopped early.
enum Halt {
    Failed,
    Cancelled,
}

pub struct WorkflowRunner {
    pool: BrowserPool,
    executor: StepExecutor,
    renderer: Arc<dyn Renderer>,
    healer: Option<Arc<HealingEngine>>,
    retry: RetryPolicy,
}

impl WorkflowRunner {
    pub fn new(pool: BrowserPool) -> Self {
        Self {
            pool,
            executor: StepExecutor::default(),
            renderer: Arc::new(SimpleRenderer),
            healer: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_executor(mut self, executor: StepExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Enables self-healing. Without a healer every failure ends the run.
    pub fn with_healer(mut self, healer: Arc<HealingEngine>) -> Self {
        self.healer = Some(healer);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn pool(&self) -> &BrowserPool {
        &self.pool
    }

    /// Runs `workflow` with `inputs` layered over its declared defaults.
    ///
    /// Never fails: every outcome, including a missing browser, is
    /// reported through the returned run's status.
    pub async fn run(&self, workflow: &Workflow, inputs: &Bindings, cancel: &CancellationToken) -> ExecutionRun {
        let mut bindings = workflow.default_bindings();
        bindings.extend(inputs.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut run = ExecutionRun::new(&workflow.name, workflow.revision, workflow.len(), bindings.clone());

        let missing = workflow.missing_required(&bindings);
        if !missing.is_empty() {
            run.failure = Some(format!("missing required variables: {}", missing.join(", ")));
            run.finish(RunStatus::Failed);
            return run;
        }
        if cancel.is_cancelled() {
            run.finish(RunStatus::Cancelled);
            return run;
        }

        run.transition(RunStatus::Running);
        info!("Run {} of '{}' started ({} steps)", run.run_id, workflow.name, workflow.len());

        let mut handle = match self.pool.acquire_with_retry(&self.retry, cancel).await {
            Ok(handle) => handle,
            Err(EngineError::Cancelled) => {
                run.finish(RunStatus::Cancelled);
                return run;
            }
            Err(e) => {
                error!("Run {} could not get a browser: {}", run.run_id, e);
                run.failure = Some(e.to_string());
                run.finish(RunStatus::Failed);
                return run;
            }
        };
        debug!("Run {} using browser session {}", run.run_id, handle.session_id());

        let status = match self.drive(workflow, &mut run, &mut bindings, &mut handle, cancel).await {
            Ok(()) => RunStatus::Succeeded,
            Err(Halt::Failed) => RunStatus::Failed,
            Err(Halt::Cancelled) => RunStatus::Cancelled,
        };
        self.pool.release(handle);

        run.finish(status);
        match run.status {
            RunStatus::Succeeded => info!(
                "Run {} of '{}' succeeded in {}ms ({} repair(s))",
                run.run_id, run.workflow, run.duration_ms, run.healing_applications
            ),
            RunStatus::Cancelled => warn!("Run {} of '{}' cancelled", run.run_id, run.workflow),
            _ => error!(
                "Run {} of '{}' failed after {}/{} steps",
                run.run_id,
                run.workflow,
                run.succeeded_steps(),
                run.total_steps
            ),
        }
        run
    }

    async fn drive(
        &self,
        workflow: &Workflow,
        run: &mut ExecutionRun,
        bindings: &mut Bindings,
        browser: &mut dyn Browser,
        cancel: &CancellationToken,
    ) -> Result<(), Halt> {
        // Repairs are spliced into this copy; the caller's workflow is untouched.
        let mut current = workflow.clone();
        let mut position = 0;

        while position < current.steps.len() {
            let slot = run.steps.len();
            let raw = current.steps[position].clone();
            info!("Step {}/{}: {}", slot + 1, run.total_steps, raw.summary());

            let attempt = self.attempt(browser, &raw, bindings, current.timeout_ms, cancel).await;
            let error = match attempt.result {
                Ok(output) => {
                    bindings.extend(output.outputs.iter().map(|(k, v)| (k.clone(), v.clone())));
                    run.record(StepResult::succeeded(&attempt.rendered, output, attempt.elapsed));
                    position += 1;
                    continue;
                }
                Err(StepError::Cancelled) => {
                    run.record(StepResult::skipped(&attempt.rendered));
                    return Err(Halt::Cancelled);
                }
                Err(e) => e,
            };

            let mut result = StepResult::failed(&attempt.rendered, &error, attempt.elapsed);
            let context = capture(browser, &error, &attempt.rendered, slot).await;
            warn!("Step '{}' failed: {}", raw.id, context.describe());

            let Some(healer) = self.healer.as_ref().filter(|_| context.healable) else {
                run.record(result);
                run.error = Some(context);
                return Err(Halt::Failed);
            };

            run.transition(RunStatus::Healing);
            let request = RepairRequest::new(&current, position, &raw, &context, attempt.budget_ms, bindings);
            let healed = healer.repair_step(&request, browser, cancel).await;

            if cancel.is_cancelled() {
                run.record(result);
                return Err(Halt::Cancelled);
            }

            let (replacements, performed) = match healed {
                Ok(HealingResult::Repaired { steps, session, performed }) => {
                    run.healing_sessions.push(session);
                    (steps, performed)
                }
                Ok(HealingResult::Unrepairable(session)) => {
                    warn!(
                        "Step '{}' could not be repaired: {}",
                        raw.id,
                        session.failure.as_deref().unwrap_or("no strategy applied")
                    );
                    run.healing_sessions.push(session);
                    run.record(result);
                    run.error = Some(context);
                    return Err(Halt::Failed);
                }
                Err(EngineError::Cancelled) => {
                    run.record(result);
                    return Err(Halt::Cancelled);
                }
                Err(e) => {
                    error!("Healing step '{}' failed: {}", raw.id, e);
                    run.failure = Some(e.to_string());
                    run.record(result);
                    run.error = Some(context);
                    return Err(Halt::Failed);
                }
            };

            run.healing_applications += 1;
            current.steps.splice(position..=position, replacements.iter().cloned());
            run.transition(RunStatus::Running);
            info!(
                "Resuming '{}' with {} replacement step(s) for '{}'",
                current.name,
                replacements.len(),
                raw.id
            );

            // A repair that already carried out the action is recorded, not rerun.
            let mut replacement_results = Vec::with_capacity(replacements.len());
            let mut first = 0;
            if let (Some(output), Some(done)) = (performed, replacements.first()) {
                let rendered = self.renderer.render(done, bindings);
                bindings.extend(output.outputs.iter().map(|(k, v)| (k.clone(), v.clone())));
                replacement_results.push(StepResult::succeeded(&rendered, output, Duration::ZERO));
                first = 1;
            }

            let (rest, halt) = self
                .run_replacements(
                    browser,
                    &current,
                    position + first,
                    replacements.len() - first,
                    slot,
                    bindings,
                    run,
                    cancel,
                )
                .await;
            replacement_results.extend(rest);
            result.absorb_replacements(replacement_results);
            run.record(result);
            position += replacements.len();

            if let Some(halt) = halt {
                return Err(halt);
            }
        }

        Ok(())
    }

    /// Runs the `count` replacement steps starting at `start`. A failure
    /// among them is final for the position.
    #[allow(clippy::too_many_arguments)]
    async fn run_replacements(
        &self,
        browser: &mut dyn Browser,
        current: &Workflow,
        start: usize,
        count: usize,
        slot: usize,
        bindings: &mut Bindings,
        run: &mut ExecutionRun,
        cancel: &CancellationToken,
    ) -> (Vec<StepResult>, Option<Halt>) {
        let mut results = Vec::with_capacity(count);

        for raw in &current.steps[start..start + count] {
            debug!("Replacement step {}", raw.summary());
            let attempt = self.attempt(browser, raw, bindings, current.timeout_ms, cancel).await;
            match attempt.result {
                Ok(output) => {
                    bindings.extend(output.outputs.iter().map(|(k, v)| (k.clone(), v.clone())));
                    results.push(StepResult::succeeded(&attempt.rendered, output, attempt.elapsed));
                }
                Err(StepError::Cancelled) => {
                    results.push(StepResult::skipped(&attempt.rendered));
                    return (results, Some(Halt::Cancelled));
                }
                Err(e) => {
                    results.push(StepResult::failed(&attempt.rendered, &e, attempt.elapsed));
                    let context = capture(browser, &e, &attempt.rendered, slot).await;
                    error!("Repaired step '{}' failed again: {}", raw.id, context.describe());
                    run.error = Some(context);
                    return (results, Some(Halt::Failed));
                }
            }
        }

        (results, None)
    }

    async fn attempt(
        &self,
        browser: &mut dyn Browser,
        raw: &Step,
        bindings: &Bindings,
        default_timeout_ms: u64,
        cancel: &CancellationToken,
    ) -> Attempted {
        let rendered = self.renderer.render(raw, bindings);
        let budget_ms = rendered.effective_timeout_ms(default_timeout_ms);
        let started = Instant::now();
        let result = self
            .executor
            .execute(browser, &rendered, Duration::from_millis(budget_ms), cancel)
            .await;

        Attempted {
            rendered,
            budget_ms,
            elapsed: started.elapsed(),
            result,
        }
    }
}

/// Captures the failure context, with a bounded snapshot of the page.
async fn capture(browser: &mut dyn Browser, error: &StepError, step: &Step, slot: usize) -> ErrorContext {
    let snapshot = tokio::time::timeout(SNAPSHOT_TIMEOUT, browser.snapshot())
        .await
        .unwrap_or_default();
    ErrorContext::capture(error, step, slot, snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{BrowserError, MemoryLauncher, MemorySite};
    use crate::healing::classifier::ErrorType;
    use crate::healing::FastStrategy;
    use crate::workflow::model::{Variable, META_ALTERNATES};
    use crate::workflow::Action;
    use serde_json::json;

    fn runner(site: &MemorySite, heal: bool) -> WorkflowRunner {
        let pool = BrowserPool::new(Arc::new(MemoryLauncher::new(site.clone())), 1);
        let runner = WorkflowRunner::new(pool).with_retry_policy(RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        });
        if !heal {
            return runner;
        }
        let healer = HealingEngine::default().with_strategy(Arc::new(FastStrategy::new(Duration::from_secs(60), 5)));
        runner.with_healer(Arc::new(healer))
    }

    fn click(id: &str, selector: &str) -> Step {
        Step::new(id, Action::Click { key: None }).with_selector(selector)
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let site = MemorySite::new().with_element("#title", "Welcome").with_element("#go", "");
        let workflow = Workflow::from_steps(
            "flow",
            vec![
                Step::new("open", Action::Navigate { url: "https://a.test/${user}".into() }),
                Step::new("read", Action::Extract { output: Some("title".into()) }).with_selector("#title"),
                click("go", "#go"),
            ],
        )
        .with_variable("user", Variable::with_default("ada"));

        let run = runner(&site, false).run(&workflow, &Bindings::new(), &CancellationToken::new()).await;

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.success_ratio, 1.0);
        assert_eq!(run.steps.len(), 3);
        assert_eq!(run.outputs.get("title").map(String::as_str), Some("Welcome"));
        assert_eq!(site.count("navigate https://a.test/ada"), 1);
    }

    #[tokio::test]
    async fn test_inputs_override_defaults() {
        let site = MemorySite::new();
        let workflow = Workflow::from_steps(
            "flow",
            vec![Step::new("open", Action::Navigate { url: "https://a.test/${user}".into() })],
        )
        .with_variable("user", Variable::with_default("ada"));
        let mut inputs = Bindings::new();
        inputs.insert("user".into(), "grace".into());

        let run = runner(&site, false).run(&workflow, &inputs, &CancellationToken::new()).await;
        assert!(run.is_success());
        assert_eq!(site.count("navigate https://a.test/grace"), 1);
    }

    #[tokio::test]
    async fn test_missing_required_variable() {
        let site = MemorySite::new();
        let workflow = Workflow::from_steps("flow", vec![click("go", "#go")]).with_variable(
            "token",
            Variable {
                required: true,
                ..Variable::default()
            },
        );

        let run = runner(&site, false).run(&workflow, &Bindings::new(), &CancellationToken::new()).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.failure.unwrap().contains("token"));
        assert_eq!(site.launches(), 0);
    }

    #[tokio::test]
    async fn test_unhealable_failure_stops_run() {
        let site = MemorySite::new().with_element("#a", "").with_element("#b", "");
        site.fail_on("click css=#a", BrowserError::Network("connection reset".into()));
        let workflow = Workflow::from_steps("flow", vec![click("a", "#a"), click("b", "#b")]);

        let run = runner(&site, true).run(&workflow, &Bindings::new(), &CancellationToken::new()).await;

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.healing_applications, 0);
        assert_eq!(run.steps.len(), 1);
        assert_eq!(run.error.unwrap().error_type, ErrorType::Network);
        assert_eq!(site.count("click css=#b"), 0);
    }

    #[tokio::test]
    async fn test_missing_element_is_healed() {
        let site = MemorySite::new().with_element("#new-buy", "").with_element("#next", "");
        let workflow = Workflow::from_steps(
            "flow",
            vec![
                click("buy", "#buy").with_metadata(META_ALTERNATES, json!(["#new-buy"])),
                click("next", "#next"),
            ],
        );

        let run = runner(&site, true).run(&workflow, &Bindings::new(), &CancellationToken::new()).await;

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.healing_applications, 1);
        assert_eq!(run.steps.len(), 2);
        assert!(run.steps[0].healed);
        assert_eq!(run.steps[0].replacements[0].step_id, "buy_heal_1");
        assert_eq!(run.healing_sessions.len(), 1);
        assert_eq!(run.success_ratio, 1.0);
        // The caller's workflow is not modified
        assert_eq!(workflow.steps[0].id, "buy");
    }

    #[tokio::test]
    async fn test_timeout_is_healed() {
        let site = MemorySite::new().with_element("#slow", "").with_element("#done", "");
        site.delay_times("click css=#slow", Duration::from_secs(5), 1);
        let workflow = Workflow::from_steps(
            "flow",
            vec![
                Step::new("open", Action::Navigate { url: "https://a.test".into() }),
                click("slow", "#slow").with_timeout_ms(100),
                click("done", "#done"),
            ],
        );

        let run = runner(&site, true).run(&workflow, &Bindings::new(), &CancellationToken::new()).await;

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.healing_applications, 1);
        assert_eq!(run.steps.len(), 3);
        assert!(run.steps[1].healed);
        assert_eq!(run.steps[1].error_type, Some(ErrorType::Timeout));
        assert_eq!(run.steps[1].replacements.len(), 2);
        assert_eq!(site.count("click css=#done"), 1);
    }

    #[tokio::test]
    async fn test_failure_after_repair_is_final() {
        let site = MemorySite::new().with_element("#slow", "");
        site.delay_on("click css=#slow", Duration::from_secs(10));
        let workflow = Workflow::from_steps("flow", vec![click("slow", "#slow").with_timeout_ms(100)]);

        let run = runner(&site, true).run(&workflow, &Bindings::new(), &CancellationToken::new()).await;

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.healing_applications, 1);
        assert_eq!(run.steps.len(), 1);
        assert!(run.steps[0].healed);
        let error = run.error.unwrap();
        assert_eq!(error.step.id, "slow_heal_2");
        assert_eq!(error.error_type, ErrorType::Timeout);
    }

    #[tokio::test]
    async fn test_alternate_is_tried_until_one_accepts_the_action() {
        let site = MemorySite::new()
            .with_element("#old-buy", "")
            .with_element("#new-buy", "")
            .with_element("#done", "");
        site.fail_on("click css=#old-buy", BrowserError::ElementNotFound("detached".into()));
        let workflow = Workflow::from_steps(
            "flow",
            vec![
                click("buy", "#buy").with_metadata(META_ALTERNATES, json!(["#old-buy", "#new-buy"])),
                click("done", "#done"),
            ],
        );

        let run = runner(&site, true).run(&workflow, &Bindings::new(), &CancellationToken::new()).await;

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.healing_applications, 1);
        assert_eq!(run.steps.len(), 2);
        assert!(run.steps[0].healed);
        assert_eq!(site.count("click css=#old-buy"), 1);
        assert_eq!(site.count("click css=#new-buy"), 1);
        assert_eq!(site.count("click css=#done"), 1);
    }

    #[tokio::test]
    async fn test_unrepairable_failure() {
        let site = MemorySite::new();
        let workflow = Workflow::from_steps("flow", vec![click("buy", "#buy")]);

        let run = runner(&site, true).run(&workflow, &Bindings::new(), &CancellationToken::new()).await;

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.healing_applications, 0);
        assert_eq!(run.healing_sessions.len(), 1);
        assert!(!run.healing_sessions[0].is_repaired());
        assert_eq!(run.error.unwrap().error_type, ErrorType::ElementNotFound);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let site = MemorySite::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let workflow = Workflow::from_steps("flow", vec![click("go", "#go")]);

        let run = runner(&site, false).run(&workflow, &Bindings::new(), &cancel).await;
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(site.launches(), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_step_releases_browser() {
        let site = MemorySite::new().with_element("#slow", "");
        site.delay_on("click css=#slow", Duration::from_secs(10));
        let runner = runner(&site, false);
        let workflow = Workflow::from_steps("flow", vec![click("slow", "#slow")]);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let run = runner.run(&workflow, &Bindings::new(), &cancel).await;
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(runner.pool().outstanding(), 0);
        assert_eq!(runner.pool().idle_count(), 1);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_fails_run() {
        let site = MemorySite::new();
        site.fail_launches(5);
        let workflow = Workflow::from_steps("flow", vec![click("go", "#go")]);

        let run = runner(&site, false).run(&workflow, &Bindings::new(), &CancellationToken::new()).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.failure.unwrap().contains("exhausted"));
    }
}
