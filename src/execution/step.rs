//! Individual Step Execution
//!
//! Runs one rendered step against one browser session:
//! - Dispatch on the step's action kind
//! - Per-step timeout raced against the operation
//! - Cooperative cancellation
//! - Extraction into the run's output variables

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::custom::{self, SubOp};
use crate::browser::{Browser, BrowserError, BrowserOp, Target};
use crate::workflow::model::{Action, ScrollDirection, Step};

/// Delay used by a locator-less wait step with no duration.
const DEFAULT_WAIT_MS: u64 = 1_000;

/// Why a step did not complete.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StepError {
    #[error("step timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("step cancelled")]
    Cancelled,

    #[error(transparent)]
    Browser(#[from] BrowserError),

    #[error("invalid step: {0}")]
    Invalid(String),
}

impl StepError {
    /// Stable label of the error's structural kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Invalid(_) => "invalid_step",
            Self::Browser(e) => match e {
                BrowserError::Timeout(_) => "timeout",
                BrowserError::ElementNotFound(_) => "element_not_found",
                BrowserError::Navigation(_) => "navigation",
                BrowserError::Network(_) => "network",
                BrowserError::Launch(_) => "launch",
                BrowserError::Closed => "closed",
                BrowserError::Protocol(_) => "protocol",
            },
        }
    }
}

/// What a successful step produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    /// Values bound into the run's variable scope
    pub outputs: BTreeMap<String, String>,
    /// Diagnostic notes worth keeping in the run record
    pub notes: Vec<String>,
}

impl StepOutput {
    fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }
}

/// Executes rendered steps. Stateless apart from where screenshots go.
#[derive(Debug, Clone)]
pub struct StepExecutor {
    screenshot_dir: PathBuf,
}

impl Default for StepExecutor {
    fn default() -> Self {
        Self::new("screenshots")
    }
}

impl StepExecutor {
    pub fn new(screenshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            screenshot_dir: screenshot_dir.into(),
        }
    }

    /// Executes a single rendered step.
    ///
    /// The operation races a timer of `budget` and the `cancel` token. When
    /// either wins, the operation future is dropped, which releases any
    /// waiter it holds, and the step reports `Timeout` or `Cancelled`.
    pub async fn execute(
        &self,
        browser: &mut dyn Browser,
        step: &Step,
        budget: Duration,
        cancel: &CancellationToken,
    ) -> Result<StepOutput, StepError> {
        debug!("Executing step '{}' ({:?} budget)", step.id, budget);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StepError::Cancelled),
            res = tokio::time::timeout(budget, self.dispatch(browser, step)) => {
                res.unwrap_or(Err(StepError::Timeout(budget)))
            }
        };

        if let Err(e) = &result {
            debug!("Step '{}' failed: {}", step.id, e);
        }
        result
    }

    async fn dispatch(&self, browser: &mut dyn Browser, step: &Step) -> Result<StepOutput, StepError> {
        let mut out = StepOutput::default();

        match &step.action {
            Action::Navigate { url } => {
                if url.trim().is_empty() {
                    return Err(StepError::Invalid("navigate requires a url".into()));
                }
                let res = browser.perform(&BrowserOp::Navigate { url: url.clone() }).await?;
                if let Some(landed) = res.url.filter(|landed| landed != url) {
                    out.note(format!("landed on {}", landed));
                }
            }

            Action::Click { key } => {
                let target = step.locator();
                match (key, target) {
                    (Some(key), None) => {
                        browser.perform(&BrowserOp::PressKey { key: key.clone() }).await?;
                    }
                    (Some(key), Some(target)) => {
                        self.precondition(browser, step, &target).await?;
                        let pressed = browser.perform(&BrowserOp::PressKey { key: key.clone() }).await;
                        if let Err(e) = pressed {
                            out.note(format!("key '{}' failed ({}), clicked instead", key, e));
                            browser.perform(&BrowserOp::Click { target }).await?;
                        }
                    }
                    (None, Some(target)) => {
                        self.precondition(browser, step, &target).await?;
                        browser.perform(&BrowserOp::Click { target }).await?;
                    }
                    (None, None) => {
                        return Err(StepError::Invalid("click requires a selector or key".into()));
                    }
                }
            }

            Action::Fill => {
                let target = require_locator(step)?;
                self.precondition(browser, step, &target).await?;
                let text = step.value.clone().unwrap_or_default();
                browser.perform(&BrowserOp::Fill { target, text }).await?;
            }

            Action::Select => {
                let target = require_locator(step)?;
                let value = step
                    .value
                    .clone()
                    .filter(|v| !v.trim().is_empty())
                    .ok_or_else(|| StepError::Invalid("select requires a value".into()))?;
                self.precondition(browser, step, &target).await?;
                browser.perform(&BrowserOp::Select { target, value }).await?;
            }

            Action::Hover => {
                let target = require_locator(step)?;
                self.precondition(browser, step, &target).await?;
                browser.perform(&BrowserOp::Hover { target }).await?;
            }

            Action::Wait { state, duration_ms } => match step.locator() {
                Some(target) => {
                    browser
                        .perform(&BrowserOp::WaitFor { target, state: *state })
                        .await?;
                }
                None => {
                    let ms = duration_ms
                        .or_else(|| step.value.as_deref().and_then(|v| v.trim().parse().ok()))
                        .unwrap_or(DEFAULT_WAIT_MS);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
            },

            Action::Scroll { direction, amount } => {
                let amount = i64::from(*amount);
                let dy = match direction {
                    ScrollDirection::Down => amount,
                    ScrollDirection::Up => -amount,
                };
                browser.perform(&BrowserOp::Scroll { dy }).await?;
            }

            Action::PressKey { key } => {
                if key.trim().is_empty() {
                    return Err(StepError::Invalid("press_key requires a key".into()));
                }
                browser.perform(&BrowserOp::PressKey { key: key.clone() }).await?;
            }

            Action::Screenshot { path } => {
                let path = path.clone().unwrap_or_else(|| self.default_capture_path(&step.id, "png"));
                let res = browser.perform(&BrowserOp::Screenshot { path: path.clone() }).await?;
                out.note(format!("screenshot saved to {}", res.path.unwrap_or(path)));
            }

            Action::Extract { output } => {
                let res = browser
                    .perform(&BrowserOp::ExtractText { target: step.locator() })
                    .await?;
                let name = output
                    .clone()
                    .unwrap_or_else(|| format!("extracted_{}", step.id));
                debug!("Step '{}' extracted {} value(s) into '{}'", step.id, res.texts.len(), name);
                out.outputs.insert(name, res.texts.join("\n"));
            }

            Action::Custom => self.run_custom(browser, step, &mut out).await?,
        }

        Ok(out)
    }

    /// Waits for the step's `wait_for` state before interacting.
    async fn precondition(
        &self,
        browser: &mut dyn Browser,
        step: &Step,
        target: &Target,
    ) -> Result<(), StepError> {
        if let Some(state) = step.wait_for {
            browser
                .perform(&BrowserOp::WaitFor { target: target.clone(), state })
                .await?;
        }
        Ok(())
    }

    async fn run_custom(
        &self,
        browser: &mut dyn Browser,
        step: &Step,
        out: &mut StepOutput,
    ) -> Result<(), StepError> {
        let raw = step.value.as_deref().unwrap_or_default();
        let ops = match custom::decode(raw) {
            Ok(ops) => ops,
            Err(e) => {
                warn!("Custom step '{}' not decoded, skipping: {}", step.id, e);
                out.note(format!("custom payload not decoded: {}", e));
                return Ok(());
            }
        };

        for op in ops {
            match op {
                SubOp::OpenTab { url } => {
                    browser.perform(&BrowserOp::OpenTab { url }).await?;
                }
                SubOp::InputText { index: Some(index), text } => {
                    let target = Target::Index(index);
                    browser.perform(&BrowserOp::Fill { target, text }).await?;
                }
                SubOp::InputText { index: None, text } => {
                    browser.perform(&BrowserOp::Type { text }).await?;
                }
                SubOp::ClickElement { index } => {
                    let target = Target::Index(index);
                    browser.perform(&BrowserOp::Click { target }).await?;
                }
                SubOp::Scroll { dy } => {
                    browser.perform(&BrowserOp::Scroll { dy }).await?;
                }
                SubOp::SwitchTab { index } => {
                    browser.perform(&BrowserOp::SwitchTab { index }).await?;
                }
                SubOp::ExtractContent { goal } => {
                    let res = browser.perform(&BrowserOp::ExtractText { target: None }).await?;
                    if let Some(goal) = goal {
                        out.note(format!("extracted content for: {}", goal));
                    }
                    out.outputs
                        .insert(format!("extracted_{}", step.id), res.texts.join("\n"));
                }
                SubOp::SendKeys { keys } => {
                    browser.perform(&BrowserOp::PressKey { key: keys }).await?;
                }
                SubOp::Wait { duration } => tokio::time::sleep(duration).await,
                SubOp::SavePdf { path } => {
                    let path = path.unwrap_or_else(|| self.default_capture_path(&step.id, "pdf"));
                    browser.perform(&BrowserOp::SavePdf { path }).await?;
                }
                SubOp::Done { text, success } => {
                    let text = text.unwrap_or_default();
                    out.note(format!("completion marked (success: {}) {}", success, text).trim_end().to_string());
                    break;
                }
                SubOp::Skipped { name } => {
                    debug!("Custom step '{}': unsupported operation '{}'", step.id, name);
                    out.note(format!("skipped unsupported operation '{}'", name));
                }
            }
        }

        Ok(())
    }

    fn default_capture_path(&self, step_id: &str, extension: &str) -> String {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        self.screenshot_dir
            .join(format!("{}_{}.{}", step_id, stamp, extension))
            .to_string_lossy()
            .into_owned()
    }
}

fn require_locator(step: &Step) -> Result<Target, StepError> {
    step.locator().ok_or_else(|| {
        StepError::Invalid(format!("{} requires a selector or xpath", step.kind()))
    })
}
