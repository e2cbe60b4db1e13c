//! Workflow Execution Module
//!
//! Runs workflows against pooled browsers, one step at a time per run and
//! many runs at once.
//!
//! # Architecture
//!
//! - [`engine`]: coordinator running many workflow runs in parallel
//! - [`runner`]: one run of one workflow, healing failed steps
//! - [`step`]: execution of a single rendered step
//! - [`custom`]: decoding of custom step payloads
//! - [`result`]: run and step result records
//! - [`history`]: persisted run records

pub mod custom;
pub mod engine;
pub mod history;
pub mod result;
pub mod runner;
pub mod step;

pub use engine::{Engine, RunHandle};
pub use history::{ErrorSummary, RunHistory};
pub use result::{BatchRun, ExecutionRun, RunStatus, StepResult, StepStatus};
pub use runner::WorkflowRunner;
pub use step::{StepError, StepExecutor, StepOutput};
