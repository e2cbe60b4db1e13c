//! Workflow Persistence
//!
//! Workflows are stored as pretty-printed JSON documents, one file per
//! workflow name, under a store root. Every write goes through a temp file
//! followed by a rename so readers never observe a half-written document.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use super::model::Workflow;
use super::validator::validate_workflow;
use crate::error::{EngineError, Result};

/// Directory-backed store of workflow documents.
#[derive(Debug, Clone)]
pub struct WorkflowStore {
    root: PathBuf,
}

impl WorkflowStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the document path for a workflow name.
    pub fn path_for(&self, name: &str) -> Result<PathBuf> {
        check_name(name)?;
        Ok(self.root.join(format!("{}.json", name)))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Reads the raw persisted bytes of a workflow.
    pub fn load_bytes(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path_for(name)?;
        if !path.is_file() {
            return Err(EngineError::WorkflowNotFound(name.to_string()));
        }
        Ok(fs::read(&path)?)
    }

    /// Loads and parses a workflow by name.
    pub fn load(&self, name: &str) -> Result<Workflow> {
        let bytes = self.load_bytes(name)?;
        let mut workflow: Workflow = serde_json::from_slice(&bytes)?;
        if workflow.name != name {
            // The store key is authoritative; saves go back to the same file.
            warn!("Workflow document '{}' is stored as '{}'", workflow.name, name);
            workflow.name = name.to_string();
        }
        debug!(
            "Loaded workflow '{}' (revision {}, {} steps)",
            workflow.name,
            workflow.revision,
            workflow.steps.len()
        );
        Ok(workflow)
    }

    /// Persists a workflow under its own name, atomically.
    pub fn save(&self, workflow: &Workflow) -> Result<PathBuf> {
        let path = self.path_for(&workflow.name)?;
        fs::create_dir_all(&self.root)?;
        write_atomic(&path, to_document(workflow)?.as_bytes())?;
        info!("Saved workflow '{}' to {}", workflow.name, path.display());
        Ok(path)
    }

    /// Lists the names of all stored workflows, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }

        let mut names: Vec<String> = fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("json"))
            .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(String::from))
            .filter(|name| !name.contains("_backup_"))
            .collect();
        names.sort();
        Ok(names)
    }
}

/// Rejects names that would escape the store root.
fn check_name(name: &str) -> Result<()> {
    let bad = name.trim().is_empty()
        || name.contains(['/', '\\'])
        || name == "."
        || name == ".."
        || name.starts_with('.');
    if bad {
        return Err(EngineError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Serializes a workflow the way it is persisted.
pub fn to_document(workflow: &Workflow) -> Result<String> {
    let mut text = serde_json::to_string_pretty(workflow)?;
    text.push('\n');
    Ok(text)
}

/// Writes `bytes` to `path` through a sibling temp file and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("workflow");
    let tmp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));

    let result = (|| {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

/// Loads a workflow file from any path, JSON or YAML by extension.
///
/// # Example
///
/// ```rust,no_run
/// use healrunner::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("flows/login.json")?;
///     println!("Loaded {} steps", workflow.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<Workflow> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let content = fs::read_to_string(path)?;
    debug!("Workflow document loaded ({} bytes)", content.len());

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let workflow: Workflow = if is_yaml {
        serde_yaml::from_str(&content)?
    } else {
        serde_json::from_str(&content)?
    };

    validate_workflow(&workflow).map_err(EngineError::ValidationFailed)?;

    info!("Parsed workflow '{}': {} steps", workflow.name, workflow.steps.len());
    Ok(workflow)
}
