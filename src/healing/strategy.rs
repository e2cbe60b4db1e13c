//! Repair strategies.
//!
//! A [`RepairStrategy`] looks at one failure and either proposes
//! replacement steps or declines. The engine tries strategies in priority
//! order; the built-in [`FastStrategy`] comes first because it needs no
//! external call.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::classifier::{ErrorContext, ErrorType};
use crate::browser::{Browser, BrowserOp, Target};
use crate::execution::step::{StepError, StepExecutor, StepOutput};
use crate::workflow::model::{Action, ElementState, Workflow, META_ALTERNATES, META_ELEMENT_TEXT};
use crate::workflow::render::{render_str, Bindings, Renderer, SimpleRenderer};
use crate::workflow::Step;

/// Generic inputs tried when a fill target disappears.
const FILL_FALLBACKS: &[&str] = &[
    "input[type=\"text\"]",
    "input[type=\"search\"]",
    "input[name*=\"search\"]",
    "input[name*=\"query\"]",
    "input[name=\"q\"]",
    "textarea",
    "[contenteditable=\"true\"]",
];

/// Everything a strategy needs to know about one failure.
#[derive(Debug, Clone)]
pub struct RepairRequest {
    pub session_id: Uuid,
    pub workflow: String,
    /// Position of the failing step in the run's step list
    pub position: usize,
    /// The failing step before rendering, as persisted
    pub raw_step: Step,
    pub context: ErrorContext,
    /// Natural-language description of the failure
    pub failure: String,
    /// Natural-language restatement of what is left to do
    pub goal: String,
    /// Budget the failing step ran with
    pub budget_ms: u64,
    /// Bindings in scope when the step failed
    pub bindings: Bindings,
}

impl RepairRequest {
    pub fn new(
        workflow: &Workflow,
        position: usize,
        raw_step: &Step,
        context: &ErrorContext,
        budget_ms: u64,
        bindings: &Bindings,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            workflow: workflow.name.clone(),
            position,
            raw_step: raw_step.clone(),
            context: context.clone(),
            failure: context.describe(),
            goal: workflow.remaining_goal(position),
            budget_ms,
            bindings: bindings.clone(),
        }
    }

    /// Id for the `n`th replacement step (1-based).
    pub fn replacement_id(&self, n: usize) -> String {
        format!("{}_heal_{}", self.raw_step.id, n)
    }
}

/// Result of one strategy attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Attempt {
    Repaired(Vec<Step>),
    /// `step` replaces the failed one and has already run successfully on
    /// the browser passed to the attempt, producing `output`
    Performed { step: Step, output: StepOutput },
    Declined(String),
}

#[async_trait]
pub trait RepairStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn attempt(
        &self,
        request: &RepairRequest,
        browser: &mut dyn Browser,
        cancel: &CancellationToken,
    ) -> Attempt;
}

/// Built-in repairs that need no external help.
///
/// - `Timeout`: wait for the target to become visible, then retry the
///   step with twice the budget, as long as that stays within
///   `max_step_timeout`.
/// - `ElementNotFound`: walk a short ranked list of alternate locators,
///   retrying the step's action against each one present on the live page
///   until one succeeds.
#[derive(Debug, Clone)]
pub struct FastStrategy {
    max_step_timeout: Duration,
    max_alternates: usize,
    executor: StepExecutor,
}

impl FastStrategy {
    pub fn new(max_step_timeout: Duration, max_alternates: usize) -> Self {
        Self {
            max_step_timeout,
            max_alternates,
            executor: StepExecutor::default(),
        }
    }

    /// Executor used to retry actions against alternate locators.
    pub fn with_executor(mut self, executor: StepExecutor) -> Self {
        self.executor = executor;
        self
    }

    fn repair_timeout(&self, request: &RepairRequest) -> Attempt {
        let doubled = request.budget_ms.saturating_mul(2);
        if doubled > self.max_step_timeout.as_millis() as u64 {
            return Attempt::Declined(format!(
                "timeout budget exhausted ({}ms would exceed {}ms)",
                doubled,
                self.max_step_timeout.as_millis()
            ));
        }

        let original = &request.raw_step;
        let mut steps = Vec::new();

        if let Some(target) = original.locator() {
            let mut wait = Step::new(request.replacement_id(1), Action::Wait { state: ElementState::Visible, duration_ms: None })
                .with_description(format!("Wait for the target of '{}' to become visible", original.id))
                .with_timeout_ms(doubled);
            match target {
                Target::XPath(_) => wait.xpath = original.xpath.clone(),
                _ => wait.selector = original.selector.clone(),
            }
            steps.push(wait);
        }

        let mut retry = original.clone();
        retry.id = request.replacement_id(steps.len() + 1);
        retry.timeout_ms = Some(doubled);
        steps.push(retry);

        info!(
            "Timeout repair for '{}': retry with {}ms budget",
            original.id, doubled
        );
        Attempt::Repaired(steps)
    }

    async fn repair_missing_element(
        &self,
        request: &RepairRequest,
        browser: &mut dyn Browser,
        cancel: &CancellationToken,
    ) -> Attempt {
        let candidates = alternate_locators(&request.raw_step, self.max_alternates);
        if candidates.is_empty() {
            return Attempt::Declined("no alternate locators available".into());
        }

        let budget = Duration::from_millis(request.budget_ms.max(1));
        let mut present = 0;

        for candidate in candidates {
            if cancel.is_cancelled() {
                return Attempt::Declined("cancelled".into());
            }
            let live = match &candidate {
                Target::Css(s) => Target::Css(render_str(s, &request.bindings)),
                Target::XPath(s) => Target::XPath(render_str(s, &request.bindings)),
                other => other.clone(),
            };

            match browser.perform(&BrowserOp::Count { target: live }).await {
                Ok(out) if out.count > 0 => {}
                Ok(_) => {
                    debug!("Alternate locator {} not present", candidate);
                    continue;
                }
                Err(e) => {
                    debug!("Lookup of {} failed: {}", candidate, e);
                    continue;
                }
            }

            let mut step = request.raw_step.clone();
            step.id = request.replacement_id(1);
            match &candidate {
                Target::XPath(xpath) => {
                    step.selector = None;
                    step.xpath = Some(xpath.clone());
                }
                Target::Css(selector) => step.selector = Some(selector.clone()),
                Target::Index(_) => continue,
            }
            present += 1;

            let rendered = SimpleRenderer.render(&step, &request.bindings);
            match self.executor.execute(browser, &rendered, budget, cancel).await {
                Ok(output) => {
                    info!("Alternate locator {} worked for '{}'", candidate, request.raw_step.id);
                    return Attempt::Performed { step, output };
                }
                Err(StepError::Cancelled) => return Attempt::Declined("cancelled".into()),
                Err(e) => debug!("Alternate locator {} is present but the action failed: {}", candidate, e),
            }
        }

        if present > 0 {
            return Attempt::Declined(format!("action failed on all {} alternate locator(s) present", present));
        }
        Attempt::Declined("no alternate locator matched the page".into())
    }
}

#[async_trait]
impl RepairStrategy for FastStrategy {
    fn name(&self) -> &'static str {
        "fast"
    }

    async fn attempt(
        &self,
        request: &RepairRequest,
        browser: &mut dyn Browser,
        cancel: &CancellationToken,
    ) -> Attempt {
        match request.context.error_type {
            ErrorType::Timeout => self.repair_timeout(request),
            ErrorType::ElementNotFound => self.repair_missing_element(request, browser, cancel).await,
            other => Attempt::Declined(format!("no built-in repair for {} errors", other)),
        }
    }
}

/// Ranked alternate locators for a step, most specific first:
/// recorded alternates, variants derived from the selector, the recorded
/// element text, and generic inputs for fill steps.
pub fn alternate_locators(step: &Step, limit: usize) -> Vec<Target> {
    let mut ranked: Vec<Target> = Vec::new();

    if let Some(Value::Array(recorded)) = step.metadata.get(META_ALTERNATES) {
        ranked.extend(recorded.iter().filter_map(Value::as_str).map(|s| Target::Css(s.to_string())));
    }

    if let Some(selector) = step.selector.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        ranked.extend(derived_selectors(selector).into_iter().map(Target::Css));
    }

    if let Some(text) = step.metadata_str(META_ELEMENT_TEXT).map(str::trim).filter(|t| !t.is_empty()) {
        if !text.contains('"') {
            ranked.push(Target::XPath(format!("//*[normalize-space(text())=\"{}\"]", text)));
        }
    }

    if step.action == Action::Fill {
        ranked.extend(FILL_FALLBACKS.iter().map(|s| Target::Css(s.to_string())));
    }

    let original = step.locator();
    let mut seen = HashSet::new();
    ranked
        .into_iter()
        .filter(|t| Some(t) != original.as_ref())
        .filter(|t| seen.insert(t.clone()))
        .take(limit)
        .collect()
}

/// Attribute-based variants of an id or class selector.
fn derived_selectors(selector: &str) -> Vec<String> {
    let mut alternatives = Vec::new();
    let simple = |s: &str| !s.is_empty() && !s.contains([' ', '>', '[', ':', '.', '#', '"']);

    if let Some(id) = selector.strip_prefix('#').filter(|id| simple(id)) {
        alternatives.push(format!("[id=\"{}\"]", id));
        alternatives.push(format!("[id*=\"{}\"]", id));
    } else if let Some(class) = selector.strip_prefix('.').filter(|c| simple(c)) {
        alternatives.push(format!("[class~=\"{}\"]", class));
        alternatives.push(format!("[class*=\"{}\"]", class));
    }

    let lower = selector.to_lowercase();
    if lower.contains("submit") {
        alternatives.push("button[type=\"submit\"]".into());
        alternatives.push("input[type=\"submit\"]".into());
    }
    if lower.contains("button") || lower.contains("btn") {
        alternatives.push("[role=\"button\"]".into());
        alternatives.push("input[type=\"button\"]".into());
    }

    alternatives
}
