//! External repair oracle.
//!
//! When no built-in repair applies, the failure and the remaining goal are
//! handed to an oracle (typically an agent able to reason about the live
//! page) that proposes replacement steps. Proposals are untrusted: each
//! one is checked before it can reach the workflow.

use std::collections::HashSet;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::classifier::ErrorContext;
use super::strategy::{Attempt, RepairRequest, RepairStrategy};
use crate::browser::Browser;
use crate::workflow::validator::validate_step;
use crate::workflow::Step;

/// What the oracle is told about a failure.
#[derive(Serialize, Debug, Clone)]
pub struct OracleRequest {
    pub workflow: String,
    pub failure: String,
    pub goal: String,
    pub context: ErrorContext,
    /// Session the oracle may drive to inspect the page
    pub browser_session: String,
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle timed out after {0:?}")]
    Timeout(Duration),

    #[error("oracle process failed: {0}")]
    Process(String),

    #[error("oracle reply is malformed: {0}")]
    Malformed(String),

    #[error("oracle proposed no steps")]
    Empty,
}

/// Proposes replacement steps for a failure.
#[async_trait]
pub trait RepairOracle: Send + Sync {
    async fn propose(
        &self,
        request: &OracleRequest,
        browser: &mut dyn Browser,
    ) -> Result<Vec<Value>, OracleError>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Reply {
    Steps(Vec<Value>),
    Wrapped { steps: Vec<Value> },
}

/// Oracle run as a one-shot process: the request is written to stdin as
/// JSON and the proposal is read from stdout, either a bare array of steps
/// or `{"steps": [...]}`.
#[derive(Debug, Clone)]
pub struct CommandOracle {
    program: String,
    args: Vec<String>,
}

impl CommandOracle {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(String::from);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }
}

#[async_trait]
impl RepairOracle for CommandOracle {
    async fn propose(
        &self,
        request: &OracleRequest,
        _browser: &mut dyn Browser,
    ) -> Result<Vec<Value>, OracleError> {
        let payload = serde_json::to_vec(request).map_err(|e| OracleError::Malformed(e.to_string()))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| OracleError::Process(format!("failed to start '{}': {}", self.program, e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| OracleError::Process("oracle process has no stdin".into()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| OracleError::Process("oracle process has no stdout".into()))?;

        // Both pipes are serviced together so a large reply cannot block
        // the oracle while it still has request bytes to take.
        let write = async move {
            let written = stdin.write_all(&payload).await;
            drop(stdin);
            written
        };
        let mut reply = String::new();
        let (written, read) = tokio::join!(write, stdout.read_to_string(&mut reply));
        read.map_err(|e| OracleError::Process(e.to_string()))?;
        match written {
            // An oracle may answer without reading the whole request
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                debug!("Oracle closed its input early");
            }
            other => other.map_err(|e| OracleError::Process(e.to_string()))?,
        }

        let status = child.wait().await.map_err(|e| OracleError::Process(e.to_string()))?;
        if !status.success() {
            return Err(OracleError::Process(format!("oracle exited with {}", status)));
        }

        let steps = match serde_json::from_str::<Reply>(reply.trim()) {
            Ok(Reply::Steps(steps)) | Ok(Reply::Wrapped { steps }) => steps,
            Err(e) => return Err(OracleError::Malformed(e.to_string())),
        };
        if steps.is_empty() {
            return Err(OracleError::Empty);
        }
        Ok(steps)
    }
}

/// Strategy delegating to a [`RepairOracle`], bounded by a timeout.
pub struct OracleStrategy {
    oracle: Arc<dyn RepairOracle>,
    timeout: Duration,
}

impl OracleStrategy {
    pub fn new(oracle: Arc<dyn RepairOracle>, timeout: Duration) -> Self {
        Self { oracle, timeout }
    }
}

#[async_trait]
impl RepairStrategy for OracleStrategy {
    fn name(&self) -> &'static str {
        "oracle"
    }

    async fn attempt(
        &self,
        request: &RepairRequest,
        browser: &mut dyn Browser,
        cancel: &CancellationToken,
    ) -> Attempt {
        let oracle_request = OracleRequest {
            workflow: request.workflow.clone(),
            failure: request.failure.clone(),
            goal: request.goal.clone(),
            context: request.context.clone(),
            browser_session: browser.session_id().to_string(),
        };
        info!("Asking repair oracle about '{}' in '{}'", request.raw_step.id, request.workflow);

        let proposal = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Attempt::Declined("cancelled".into()),
            result = tokio::time::timeout(self.timeout, self.oracle.propose(&oracle_request, browser)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => Err(OracleError::Timeout(self.timeout)),
                }
            }
        };

        match proposal {
            Ok(raw) => match accept_proposal(raw, request) {
                Ok(steps) => Attempt::Repaired(steps),
                Err(reason) => {
                    warn!("Rejected oracle proposal for '{}': {}", request.raw_step.id, reason);
                    Attempt::Declined(reason)
                }
            },
            Err(e) => {
                warn!("Repair oracle failed for '{}': {}", request.raw_step.id, e);
                Attempt::Declined(e.to_string())
            }
        }
    }
}

/// Turns an oracle proposal into steps, or explains why it is unusable.
///
/// Steps without an id get `{original}_heal_{n}`. Every step must parse,
/// pass step validation and carry an id unique within the proposal.
pub fn accept_proposal(raw: Vec<Value>, request: &RepairRequest) -> Result<Vec<Step>, String> {
    if raw.is_empty() {
        return Err("proposal contains no steps".into());
    }

    let mut steps = Vec::with_capacity(raw.len());
    let mut ids = HashSet::new();

    for (n, mut value) in raw.into_iter().enumerate() {
        let Some(object) = value.as_object_mut() else {
            return Err(format!("proposed step {} is not an object", n + 1));
        };
        let has_id = object
            .get("id")
            .and_then(Value::as_str)
            .map_or(false, |id| !id.trim().is_empty());
        if !has_id {
            object.insert("id".into(), Value::String(request.replacement_id(n + 1)));
        }

        let step: Step = serde_json::from_value(value)
            .map_err(|e| format!("proposed step {} does not parse: {}", n + 1, e))?;

        let problems = validate_step(&step);
        if let Some(problem) = problems.first() {
            return Err(problem.to_string());
        }
        if !ids.insert(step.id.clone()) {
            return Err(format!("proposal repeats step id '{}'", step.id));
        }
        debug!("Accepted proposed step {}", step.summary());
        steps.push(step);
    }

    Ok(steps)
}
