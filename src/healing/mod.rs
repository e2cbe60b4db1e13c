//! Self-Healing
//!
//! When a step fails with a repairable error, the healing engine proposes
//! replacement steps and the updater splices them into the persisted
//! workflow.
//!
//! - [`classifier`]: error taxonomy and recoverability policy
//! - [`strategy`]: the repair strategy seam and the fast built-in strategy
//! - [`oracle`]: delegation to an external repair oracle
//! - [`inflight`]: one repair per failing step at a time
//! - [`updater`]: backup, splice, validate and persist
//! - [`engine`]: composes the above

pub mod classifier;
pub mod engine;
pub mod inflight;
pub mod oracle;
pub mod strategy;
pub mod updater;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::Step;

pub use classifier::{classify, is_healable, ErrorContext, ErrorType};
pub use engine::{HealingEngine, HealingResult};
pub use oracle::{CommandOracle, OracleStrategy, RepairOracle};
pub use strategy::{Attempt, FastStrategy, RepairRequest, RepairStrategy};
pub use updater::{UpdateOutcome, WorkflowUpdater};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Succeeded,
    Failed,
}

/// One attempt to repair a specific failure.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HealingSession {
    pub id: Uuid,
    pub workflow: String,
    pub step_id: String,
    pub error: ErrorContext,
    /// What the rest of the workflow is meant to achieve
    pub goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replacements: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl HealingSession {
    pub fn open(request: &RepairRequest) -> Self {
        Self {
            id: request.session_id,
            workflow: request.workflow.clone(),
            step_id: request.raw_step.id.clone(),
            error: request.context.clone(),
            goal: request.goal.clone(),
            strategy: None,
            status: SessionStatus::Pending,
            replacements: Vec::new(),
            failure: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn succeed(&mut self, strategy: &str, replacements: Vec<Step>) {
        self.strategy = Some(strategy.to_string());
        self.replacements = replacements;
        self.status = SessionStatus::Succeeded;
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.failure = Some(reason.into());
        self.status = SessionStatus::Failed;
        self.finished_at = Some(Utc::now());
    }

    pub fn is_repaired(&self) -> bool {
        self.status == SessionStatus::Succeeded
    }
}
