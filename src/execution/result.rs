//! Execution result types.
//!
//! [`ExecutionRun`] is the record a run exposes to callers: status,
//! per-position step results, how many repairs were applied and, for
//! failed runs, the context of the final failure.

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::step::{StepError, StepOutput};
use crate::healing::classifier::{classify, ErrorContext, ErrorType};
use crate::healing::HealingSession;
use crate::workflow::{Bindings, Step};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Outcome of one original step position within a run.
///
/// When the position was healed, `replacements` holds the results of the
/// steps that ran in its place and `error` keeps the failure that
/// triggered the repair.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepResult {
    pub step_id: String,
    pub action: String,
    pub status: StepStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    #[serde(default, skip_serializing_if = "Bindings::is_empty")]
    pub outputs: Bindings,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    #[serde(default)]
    pub healed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replacements: Vec<StepResult>,
}

impl StepResult {
    fn base(step: &Step, status: StepStatus, duration: Duration) -> Self {
        Self {
            step_id: step.id.clone(),
            action: step.kind().to_string(),
            status,
            duration_ms: duration.as_millis() as u64,
            error: None,
            error_type: None,
            outputs: Bindings::new(),
            notes: Vec::new(),
            healed: false,
            replacements: Vec::new(),
        }
    }

    pub fn succeeded(step: &Step, output: StepOutput, duration: Duration) -> Self {
        let mut result = Self::base(step, StepStatus::Succeeded, duration);
        result.outputs = output.outputs;
        result.notes = output.notes;
        result
    }

    pub fn failed(step: &Step, error: &StepError, duration: Duration) -> Self {
        let mut result = Self::base(step, StepStatus::Failed, duration);
        result.error = Some(error.to_string());
        result.error_type = Some(classify(error));
        result
    }

    pub fn skipped(step: &Step) -> Self {
        Self::base(step, StepStatus::Skipped, Duration::ZERO)
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Succeeded
    }

    /// Folds the results of replacement steps into this position's result.
    ///
    /// The position succeeds only if every replacement succeeded.
    pub fn absorb_replacements(&mut self, replacements: Vec<StepResult>) {
        self.healed = true;
        self.duration_ms += replacements.iter().map(|r| r.duration_ms).sum::<u64>();
        for r in &replacements {
            self.outputs
                .extend(r.outputs.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        self.status = if !replacements.is_empty() && replacements.iter().all(StepResult::is_success) {
            StepStatus::Succeeded
        } else {
            StepStatus::Failed
        };
        self.replacements = replacements;
    }
}

/// Lifecycle of a run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Healing,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Healing)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Healing, Running)
                | (Healing, Failed)
                | (Healing, Cancelled)
        )
    }
}

/// One attempt to execute a workflow with a given binding.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ExecutionRun {
    pub run_id: Uuid,
    pub workflow: String,
    /// Revision of the workflow document the run started from
    pub revision: u64,
    pub status: RunStatus,
    pub total_steps: usize,
    pub steps: Vec<StepResult>,
    pub success_ratio: f64,
    pub healing_applications: u32,
    #[serde(default)]
    pub bindings: Bindings,
    #[serde(default)]
    pub outputs: Bindings,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    /// Context of the final failing step, for failed runs
    pub error: Option<ErrorContext>,
    /// Why the run failed when no step is to blame (no browser, missing
    /// inputs, a rejected repair)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub healing_sessions: Vec<HealingSession>,
}

impl ExecutionRun {
    pub fn new(workflow: impl Into<String>, revision: u64, total_steps: usize, bindings: Bindings) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            workflow: workflow.into(),
            revision,
            status: RunStatus::Pending,
            total_steps,
            steps: Vec::new(),
            success_ratio: 0.0,
            healing_applications: 0,
            bindings,
            outputs: Bindings::new(),
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: 0,
            error: None,
            failure: None,
            healing_sessions: Vec::new(),
        }
    }

    /// Moves the run to `next`, returning false if the move is not allowed.
    pub fn transition(&mut self, next: RunStatus) -> bool {
        if !self.status.can_transition(next) {
            warn!(
                "Run {} ignored transition {:?} -> {:?}",
                self.run_id,
                self.status,
                next
            );
            return false;
        }
        debug!("Run {}: {:?} -> {:?}", self.run_id, self.status, next);
        self.status = next;
        true
    }

    /// Appends the result for the next step position.
    pub fn record(&mut self, result: StepResult) {
        for (k, v) in &result.outputs {
            self.outputs.insert(k.clone(), v.clone());
        }
        self.steps.push(result);
    }

    pub fn succeeded_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.is_success()).count()
    }

    /// Ends the run in a terminal state and computes the summary fields.
    pub fn finish(&mut self, status: RunStatus) {
        if !self.status.is_terminal() {
            self.transition(status);
        }
        let now = Utc::now();
        self.finished_at = Some(now);
        self.duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
        self.success_ratio = if self.total_steps == 0 {
            0.0
        } else {
            self.succeeded_steps() as f64 / self.total_steps as f64
        };
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

/// Aggregate of a batch of runs.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BatchRun {
    pub workflow: String,
    pub runs: Vec<ExecutionRun>,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub healing_applications: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl BatchRun {
    pub fn from_runs(workflow: impl Into<String>, started_at: DateTime<Utc>, runs: Vec<ExecutionRun>) -> Self {
        let count = |status: RunStatus| runs.iter().filter(|r| r.status == status).count();
        Self {
            workflow: workflow.into(),
            succeeded: count(RunStatus::Succeeded),
            failed: count(RunStatus::Failed),
            cancelled: count(RunStatus::Cancelled),
            healing_applications: runs.iter().map(|r| r.healing_applications).sum(),
            started_at,
            duration_ms: (Utc::now() - started_at).num_milliseconds().max(0) as u64,
            runs,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.runs.is_empty() {
            return 0.0;
        }
        self.succeeded as f64 / self.runs.len() as f64
    }
}
