//! Workflow Updater
//!
//! Applies repairs to persisted workflows. Each update of a workflow
//! happens under that workflow's lock and follows the same sequence:
//! load, splice, stamp provenance, validate, back up, write atomically.
//! A rejected update writes nothing.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::workflow::model::{
    HealingRecord, META_HEALED_AT, META_HEALING_SESSION, META_ORIGINAL_STEP, META_SOURCE, SOURCE_HEALING,
};
use crate::workflow::render::step_variables;
use crate::workflow::store::write_atomic;
use crate::workflow::validator::{check_variable_references, collect_errors};
use crate::workflow::{Step, Workflow, WorkflowStore};

/// What an update did.
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// Replacements were spliced in and persisted.
    Applied {
        workflow: Workflow,
        replacements: Vec<Step>,
        backup: PathBuf,
    },
    /// The step had already been replaced, by another run; the persisted
    /// replacements are returned instead.
    AlreadyReplaced {
        workflow: Workflow,
        replacements: Vec<Step>,
    },
}

impl UpdateOutcome {
    pub fn replacements(&self) -> &[Step] {
        match self {
            Self::Applied { replacements, .. } | Self::AlreadyReplaced { replacements, .. } => replacements,
        }
    }

    pub fn workflow(&self) -> &Workflow {
        match self {
            Self::Applied { workflow, .. } | Self::AlreadyReplaced { workflow, .. } => workflow,
        }
    }
}

/// Sole writer of persisted workflows.
pub struct WorkflowUpdater {
    store: WorkflowStore,
    backup_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl WorkflowUpdater {
    pub fn new(store: WorkflowStore, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            backup_dir: backup_dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &WorkflowStore {
        &self.store
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    fn lock_for(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    /// Replaces the failed step of `name` with `replacements`.
    ///
    /// The step is located by `failed_index` when the step there still has
    /// id `failed_step_id`, otherwise by id.
    pub async fn backup_and_replace(
        &self,
        name: &str,
        failed_index: usize,
        failed_step_id: &str,
        replacements: &[Step],
        session_id: Uuid,
    ) -> Result<UpdateOutcome> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let original_bytes = self.store.load_bytes(name)?;
        let mut workflow = self.store.load(name)?;

        let position = match workflow.steps.get(failed_index) {
            Some(step) if step.id == failed_step_id => Some(failed_index),
            _ => workflow.position(failed_step_id),
        };
        let Some(position) = position else {
            if let Some(existing) = persisted_replacement(&workflow, failed_step_id) {
                info!(
                    "Step '{}' of '{}' was already replaced by {:?}",
                    failed_step_id,
                    name,
                    existing.iter().map(|s| s.id.as_str()).collect::<Vec<_>>()
                );
                return Ok(UpdateOutcome::AlreadyReplaced {
                    workflow,
                    replacements: existing,
                });
            }
            return Err(EngineError::StepNotFound {
                workflow: name.to_string(),
                step_id: failed_step_id.to_string(),
            });
        };

        if replacements.is_empty() {
            return Err(EngineError::ValidationFailed("no replacement steps".into()));
        }

        let original = workflow.steps[position].clone();
        let stamped = stamp_provenance(replacements, &original.id, session_id);
        let also_known: BTreeSet<String> = step_variables(&original);

        workflow.steps.splice(position..=position, stamped.iter().cloned());

        let mut problems: Vec<String> = collect_errors(&workflow).iter().map(ToString::to_string).collect();
        problems.extend(
            check_variable_references(&workflow, &stamped, &also_known)
                .iter()
                .map(ToString::to_string),
        );
        if !problems.is_empty() {
            warn!("Rejected repair of '{}' in '{}': {}", original.id, name, problems.join("; "));
            return Err(EngineError::ValidationFailed(problems.join("\n")));
        }

        let backup = self.write_backup(name, &original_bytes)?;

        workflow.revision += 1;
        workflow.updated_at = Utc::now();
        workflow.healing_history.push(HealingRecord {
            healed_at: workflow.updated_at,
            session_id,
            original_step_id: original.id.clone(),
            failed_index: position,
            replacement_ids: stamped.iter().map(|s| s.id.clone()).collect(),
            revision: workflow.revision,
        });
        self.store.save(&workflow)?;

        info!(
            "Replaced step '{}' of '{}' with {} step(s), revision {}",
            original.id,
            name,
            stamped.len(),
            workflow.revision
        );
        Ok(UpdateOutcome::Applied {
            workflow,
            replacements: stamped,
            backup,
        })
    }

    /// The persisted replacements of `step_id`, if another run already
    /// repaired it.
    pub async fn existing_replacement(&self, name: &str, step_id: &str) -> Result<Option<Vec<Step>>> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let workflow = self.store.load(name)?;
        if workflow.get_step(step_id).is_some() {
            return Ok(None);
        }
        Ok(persisted_replacement(&workflow, step_id))
    }

    /// Restores `name` from a backup. The current document is backed up
    /// first, and the revision keeps increasing.
    pub async fn rollback(&self, name: &str, backup: &Path) -> Result<Workflow> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let restored_bytes = fs::read(backup)?;
        let mut restored: Workflow = serde_json::from_slice(&restored_bytes)?;

        let current_bytes = self.store.load_bytes(name)?;
        let current = self.store.load(name)?;
        self.write_backup(name, &current_bytes)?;

        restored.name = name.to_string();
        restored.revision = current.revision + 1;
        restored.updated_at = Utc::now();
        self.store.save(&restored)?;

        info!(
            "Rolled back '{}' to {} (revision {})",
            name,
            backup.display(),
            restored.revision
        );
        Ok(restored)
    }

    /// Backups of `name`, oldest first.
    pub fn backups(&self, name: &str) -> Result<Vec<PathBuf>> {
        if !self.backup_dir.is_dir() {
            return Ok(Vec::new());
        }
        let prefix = format!("{}_backup_", name);
        let mut found: Vec<PathBuf> = fs::read_dir(&self.backup_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| n.starts_with(&prefix) && n.ends_with(".json"))
            })
            .collect();
        found.sort();
        Ok(found)
    }

    /// Repairs applied to `name`, oldest first.
    pub fn history(&self, name: &str) -> Result<Vec<HealingRecord>> {
        Ok(self.store.load(name)?.healing_history)
    }

    fn write_backup(&self, name: &str, bytes: &[u8]) -> Result<PathBuf> {
        fs::create_dir_all(&self.backup_dir)?;
        let stamp = Utc::now().format("%Y%m%d_%H%M%S_%6f");
        let path = self.backup_dir.join(format!("{}_backup_{}.json", name, stamp));
        write_atomic(&path, bytes)?;
        debug!("Backed up '{}' to {}", name, path.display());
        Ok(path)
    }
}

/// Copies of `replacements` carrying healing provenance.
fn stamp_provenance(replacements: &[Step], original_id: &str, session_id: Uuid) -> Vec<Step> {
    let healed_at = Utc::now().to_rfc3339();
    replacements
        .iter()
        .map(|step| {
            let mut step = step.clone();
            step.metadata.insert(META_SOURCE.into(), Value::from(SOURCE_HEALING));
            step.metadata.insert(META_ORIGINAL_STEP.into(), Value::from(original_id));
            step.metadata.insert(META_HEALED_AT.into(), Value::from(healed_at.clone()));
            step.metadata
                .insert(META_HEALING_SESSION.into(), Value::from(session_id.to_string()));
            step
        })
        .collect()
}

/// Steps that replaced `step_id` according to the document's history.
fn persisted_replacement(workflow: &Workflow, step_id: &str) -> Option<Vec<Step>> {
    let record = workflow
        .healing_history
        .iter()
        .rev()
        .find(|r| r.original_step_id == step_id)?;
    let steps: Option<Vec<Step>> = record
        .replacement_ids
        .iter()
        .map(|id| workflow.get_step(id).cloned())
        .collect();
    steps.filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::Variable;
    use crate::workflow::Action;
    use tempfile::{tempdir, TempDir};

    fn setup() -> (TempDir, WorkflowUpdater) {
        let dir = tempdir().unwrap();
        let store = WorkflowStore::new(dir.path().join("workflows"));
        let workflow = Workflow::from_steps(
            "checkout",
            vec![
                Step::new("open", Action::Navigate { url: "https://shop.test".into() }),
                Step::new("pay", Action::Click { key: None }).with_selector("#pay"),
                Step::new("done", Action::Wait { state: Default::default(), duration_ms: Some(10) }),
            ],
        )
        .with_variable("card", Variable::default());
        store.save(&workflow).unwrap();
        let updater = WorkflowUpdater::new(store, dir.path().join("backups"));
        (dir, updater)
    }

    fn replacement(id: &str) -> Step {
        Step::new(id, Action::Click { key: None }).with_selector("#pay-v2")
    }

    #[tokio::test]
    async fn test_replace_persists_and_backs_up() {
        let (_dir, updater) = setup();
        let before = updater.store().load_bytes("checkout").unwrap();
        let session = Uuid::new_v4();

        let outcome = updater
            .backup_and_replace("checkout", 1, "pay", &[replacement("pay_heal_1")], session)
            .await
            .unwrap();
        let UpdateOutcome::Applied { workflow, replacements, backup } = outcome else {
            panic!("expected an applied update");
        };

        assert_eq!(workflow.revision, 1);
        assert_eq!(fs::read(&backup).unwrap(), before);
        assert!(replacements[0].is_healed());
        assert_eq!(replacements[0].metadata_str(META_ORIGINAL_STEP), Some("pay"));
        assert_eq!(
            replacements[0].metadata_str(META_HEALING_SESSION),
            Some(session.to_string().as_str())
        );

        let persisted = updater.store().load("checkout").unwrap();
        let ids: Vec<&str> = persisted.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["open", "pay_heal_1", "done"]);
        assert_eq!(persisted.healing_history.len(), 1);
        assert_eq!(updater.backups("checkout").unwrap(), vec![backup]);
        assert_eq!(updater.history("checkout").unwrap()[0].replacement_ids, vec!["pay_heal_1"]);
    }

    #[tokio::test]
    async fn test_locates_by_id_when_index_is_stale() {
        let (_dir, updater) = setup();
        let outcome = updater
            .backup_and_replace("checkout", 0, "pay", &[replacement("pay_heal_1")], Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(outcome.workflow().steps[1].id, "pay_heal_1");
        assert_eq!(outcome.workflow().steps[0].id, "open");
    }

    #[tokio::test]
    async fn test_rejected_update_writes_nothing() {
        let (_dir, updater) = setup();
        let before = updater.store().load_bytes("checkout").unwrap();

        // Duplicate id
        let err = updater
            .backup_and_replace("checkout", 1, "pay", &[replacement("open")], Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ValidationFailed(_)));

        // Unknown variable
        let bad = Step::new("pay_heal_1", Action::Fill).with_selector("#card").with_value("${cvv}");
        let err = updater
            .backup_and_replace("checkout", 1, "pay", &[bad], Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cvv"));

        assert_eq!(updater.store().load_bytes("checkout").unwrap(), before);
        assert!(updater.backups("checkout").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_declared_variables_are_allowed() {
        let (_dir, updater) = setup();
        let step = Step::new("pay_heal_1", Action::Fill).with_selector("#card").with_value("${card}");
        assert!(updater
            .backup_and_replace("checkout", 1, "pay", &[step], Uuid::new_v4())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_second_update_sees_existing_replacement() {
        let (_dir, updater) = setup();
        updater
            .backup_and_replace("checkout", 1, "pay", &[replacement("pay_heal_1")], Uuid::new_v4())
            .await
            .unwrap();

        let outcome = updater
            .backup_and_replace("checkout", 1, "pay", &[replacement("other")], Uuid::new_v4())
            .await
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::AlreadyReplaced { .. }));
        assert_eq!(outcome.replacements()[0].id, "pay_heal_1");
        assert_eq!(updater.store().load("checkout").unwrap().revision, 1);

        let existing = updater.existing_replacement("checkout", "pay").await.unwrap();
        assert_eq!(existing.unwrap()[0].id, "pay_heal_1");
        assert!(updater.existing_replacement("checkout", "open").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_step() {
        let (_dir, updater) = setup();
        let err = updater
            .backup_and_replace("checkout", 5, "ghost", &[replacement("x")], Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StepNotFound { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_updates_serialize() {
        let (_dir, updater) = setup();
        let updater = Arc::new(updater);

        let tasks: Vec<_> = (0..4)
            .map(|n| {
                let updater = Arc::clone(&updater);
                tokio::spawn(async move {
                    updater
                        .backup_and_replace("checkout", 1, "pay", &[replacement(&format!("pay_heal_{}", n))], Uuid::new_v4())
                        .await
                        .unwrap()
                })
            })
            .collect();
        let outcomes = futures::future::join_all(tasks).await;

        let applied = outcomes
            .iter()
            .filter(|o| matches!(o.as_ref().unwrap(), UpdateOutcome::Applied { .. }))
            .count();
        assert_eq!(applied, 1);
        let persisted = updater.store().load("checkout").unwrap();
        assert_eq!(persisted.revision, 1);
        assert_eq!(persisted.steps.len(), 3);
    }

    #[tokio::test]
    async fn test_rollback() {
        let (_dir, updater) = setup();
        let UpdateOutcome::Applied { backup, .. } = updater
            .backup_and_replace("checkout", 1, "pay", &[replacement("pay_heal_1")], Uuid::new_v4())
            .await
            .unwrap()
        else {
            panic!("expected an applied update");
        };

        let restored = updater.rollback("checkout", &backup).await.unwrap();
        assert_eq!(restored.revision, 2);
        assert_eq!(restored.steps[1].id, "pay");
        assert_eq!(updater.store().load("checkout").unwrap().steps[1].id, "pay");
        assert_eq!(updater.backups("checkout").unwrap().len(), 2);
    }
}
