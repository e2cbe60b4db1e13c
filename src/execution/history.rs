//! Run History
//!
//! Finished runs are saved as pretty-printed JSON, one file per run:
//! `{dir}/{workflow}_{run_id}.json`.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::Serialize;
use uuid::Uuid;

use super::result::ExecutionRun;
use crate::error::Result;
use crate::healing::classifier::{ErrorContext, ErrorType, Severity};

/// Failure statistics over a workflow's saved runs.
///
/// Each distinct failure is counted once, whether it was recorded as the
/// run's final error, as the trigger of a repair attempt, or both.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct ErrorSummary {
    pub runs: usize,
    pub total_errors: usize,
    pub by_type: BTreeMap<ErrorType, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
    pub healable: usize,
    pub healed: usize,
}

impl ErrorSummary {
    /// Builds the summary from finished runs.
    pub fn from_runs(runs: &[ExecutionRun]) -> Self {
        let mut summary = Self {
            runs: runs.len(),
            ..Self::default()
        };
        let mut seen = HashSet::new();

        for run in runs {
            let healed: HashSet<Uuid> = run
                .healing_sessions
                .iter()
                .filter(|session| session.is_repaired())
                .map(|session| session.error.error_id)
                .collect();
            let errors = run
                .healing_sessions
                .iter()
                .map(|session| &session.error)
                .chain(run.error.iter());

            for error in errors {
                if seen.insert(error.error_id) {
                    summary.count(error, healed.contains(&error.error_id));
                }
            }
        }
        summary
    }

    fn count(&mut self, error: &ErrorContext, healed: bool) {
        self.total_errors += 1;
        *self.by_type.entry(error.error_type).or_default() += 1;
        *self.by_severity.entry(error.severity).or_default() += 1;
        if error.healable {
            self.healable += 1;
        }
        if healed {
            self.healed += 1;
        }
    }

    /// Share of healable failures that were repaired, 0 when none were healable.
    pub fn healing_success_rate(&self) -> f64 {
        if self.healable == 0 {
            return 0.0;
        }
        self.healed as f64 / self.healable as f64
    }

    /// The most frequent failure type; ties go to the first in declaration order.
    pub fn most_common(&self) -> Option<ErrorType> {
        self.by_type
            .iter()
            .max_by(|(ta, a), (tb, b)| a.cmp(b).then(tb.cmp(ta)))
            .map(|(error_type, _)| *error_type)
    }
}

/// Directory of saved run records.
#[derive(Debug, Clone)]
pub struct RunHistory {
    dir: PathBuf,
}

impl RunHistory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Saves a run record and returns where it was written.
    pub fn save(&self, run: &ExecutionRun) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;

        let path = self.path_for(&run.workflow, run.run_id);
        let json = serde_json::to_string_pretty(run)?;
        fs::write(&path, json)?;

        info!("Saved run record to {}", path.display());
        Ok(path)
    }

    /// Loads one run record.
    pub fn load(&self, workflow: &str, run_id: Uuid) -> Result<ExecutionRun> {
        let content = fs::read_to_string(self.path_for(workflow, run_id))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// All saved runs of `workflow`, oldest first.
    pub fn list(&self, workflow: &str) -> Result<Vec<ExecutionRun>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }

        let prefix = format!("{}_", workflow);
        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let matches = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with(&prefix) && n.ends_with(".json"));
            if !matches {
                continue;
            }
            match serde_json::from_str::<ExecutionRun>(&fs::read_to_string(&path)?) {
                // Prefix also matches workflows named `{workflow}_...`
                Ok(run) if run.workflow == workflow => runs.push(run),
                Ok(_) => {}
                Err(e) => debug!("Skipping unreadable run record {}: {}", path.display(), e),
            }
        }

        runs.sort_by_key(|run| run.started_at);
        Ok(runs)
    }

    /// Deletes every saved run of `workflow`, returning how many were removed.
    pub fn clear(&self, workflow: &str) -> Result<usize> {
        let runs = self.list(workflow)?;
        for run in &runs {
            fs::remove_file(self.path_for(&run.workflow, run.run_id))?;
        }
        if !runs.is_empty() {
            info!("Deleted {} run record(s) of '{}'", runs.len(), workflow);
        }
        Ok(runs.len())
    }

    /// Failure statistics across every saved run of `workflow`.
    pub fn error_summary(&self, workflow: &str) -> Result<ErrorSummary> {
        let runs = self.list(workflow)?;
        let summary = ErrorSummary::from_runs(&runs);
        debug!(
            "'{}': {} error(s) over {} run(s), {} of {} healable repaired",
            workflow, summary.total_errors, summary.runs, summary.healed, summary.healable
        );
        Ok(summary)
    }

    fn path_for(&self, workflow: &str, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}_{}.json", workflow, run_id.simple()))
    }
}
