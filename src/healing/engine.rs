//! Healing Engine
//!
//! Produces replacement steps for a failed step by trying repair
//! strategies in priority order, then hands accepted repairs to the
//! workflow updater. Repairs of the same `(workflow, step)` never run
//! twice concurrently: later callers wait for the first one's outcome.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::inflight::{Claim, InflightRegistry};
use super::strategy::{Attempt, RepairRequest, RepairStrategy};
use super::updater::{UpdateOutcome, WorkflowUpdater};
use super::HealingSession;
use crate::browser::Browser;
use crate::error::{EngineError, Result};
use crate::execution::step::StepOutput;
use crate::workflow::Step;

/// Default bound on one healing session.
pub const DEFAULT_HEALING_TIMEOUT: Duration = Duration::from_secs(300);

/// Used in place of a configured timeout too large to schedule.
const MAX_HEALING_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Outcome of a healing session.
///
/// `performed` is set when the first replacement step already ran
/// successfully on the browser that carried out the repair; the caller
/// resumes after it instead of running it again.
#[derive(Debug, Clone)]
pub enum HealingResult {
    Repaired {
        steps: Vec<Step>,
        session: HealingSession,
        performed: Option<StepOutput>,
    },
    Unrepairable(HealingSession),
}

impl HealingResult {
    pub fn session(&self) -> &HealingSession {
        match self {
            Self::Repaired { session, .. } | Self::Unrepairable(session) => session,
        }
    }

    pub fn is_repaired(&self) -> bool {
        matches!(self, Self::Repaired { .. })
    }

    /// The outcome as seen by a caller whose browser did not take part.
    fn shared(&self) -> Self {
        match self {
            Self::Repaired { steps, session, .. } => Self::Repaired {
                steps: steps.clone(),
                session: session.clone(),
                performed: None,
            },
            Self::Unrepairable(session) => Self::Unrepairable(session.clone()),
        }
    }
}

pub struct HealingEngine {
    strategies: Vec<Arc<dyn RepairStrategy>>,
    updater: Option<Arc<WorkflowUpdater>>,
    inflight: InflightRegistry<HealingResult>,
    timeout: Duration,
}

impl Default for HealingEngine {
    fn default() -> Self {
        Self::new(DEFAULT_HEALING_TIMEOUT)
    }
}

impl HealingEngine {
    pub fn new(timeout: Duration) -> Self {
        Self {
            strategies: Vec::new(),
            updater: None,
            inflight: InflightRegistry::new(),
            timeout,
        }
    }

    /// Appends a strategy; earlier strategies have priority.
    pub fn with_strategy(mut self, strategy: Arc<dyn RepairStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Persists accepted repairs through `updater`.
    pub fn with_updater(mut self, updater: Arc<WorkflowUpdater>) -> Self {
        self.updater = Some(updater);
        self
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Runs the strategies against one failure, without persisting.
    pub async fn heal(
        &self,
        request: &RepairRequest,
        browser: &mut dyn Browser,
        cancel: &CancellationToken,
    ) -> HealingResult {
        let mut session = HealingSession::open(request);
        let deadline = deadline_after(self.timeout);
        let mut declined = Vec::new();

        info!(
            "Healing session {} for step '{}' of '{}' ({})",
            session.id, request.raw_step.id, request.workflow, request.context.error_type
        );

        for strategy in &self.strategies {
            if cancel.is_cancelled() {
                session.fail("cancelled");
                return HealingResult::Unrepairable(session);
            }

            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    session.fail("cancelled");
                    return HealingResult::Unrepairable(session);
                }
                result = tokio::time::timeout_at(deadline, strategy.attempt(request, browser, cancel)) => result,
            };

            match attempt {
                Ok(Attempt::Repaired(steps)) => {
                    info!(
                        "Strategy '{}' repaired '{}' with {} step(s)",
                        strategy.name(),
                        request.raw_step.id,
                        steps.len()
                    );
                    session.succeed(strategy.name(), steps.clone());
                    return HealingResult::Repaired { steps, session, performed: None };
                }
                Ok(Attempt::Performed { step, output }) => {
                    info!(
                        "Strategy '{}' repaired '{}' and carried out the action",
                        strategy.name(),
                        request.raw_step.id
                    );
                    let steps = vec![step];
                    session.succeed(strategy.name(), steps.clone());
                    return HealingResult::Repaired {
                        steps,
                        session,
                        performed: Some(output),
                    };
                }
                Ok(Attempt::Declined(reason)) => {
                    debug!("Strategy '{}' declined: {}", strategy.name(), reason);
                    declined.push(format!("{}: {}", strategy.name(), reason));
                }
                Err(_) => {
                    warn!("Healing session {} timed out after {:?}", session.id, self.timeout);
                    declined.push(format!("{}: healing timed out", strategy.name()));
                    break;
                }
            }
        }

        if declined.is_empty() {
            declined.push("no repair strategy configured".into());
        }
        session.fail(declined.join("; "));
        HealingResult::Unrepairable(session)
    }

    /// Repairs a failed step and persists the repair.
    ///
    /// If the same step is already being repaired, waits for that repair
    /// and returns its outcome instead of starting another.
    pub async fn repair_step(
        &self,
        request: &RepairRequest,
        browser: &mut dyn Browser,
        cancel: &CancellationToken,
    ) -> Result<HealingResult> {
        loop {
            match self.inflight.claim(&request.workflow, &request.raw_step.id) {
                Claim::Follower(follower) => {
                    let busy = EngineError::AlreadyHealing {
                        workflow: request.workflow.clone(),
                        step_id: request.raw_step.id.clone(),
                    };
                    info!("{}; waiting for its outcome", busy);

                    let outcome = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                        outcome = follower.wait() => outcome,
                    };
                    match outcome {
                        Some(result) => return Ok(result),
                        // Leader abandoned the repair; try again.
                        None => continue,
                    }
                }
                Claim::Leader(guard) => {
                    let result = self.lead(request, browser, cancel).await;
                    let shared = match &result {
                        Ok(outcome) => outcome.shared(),
                        Err(e) => {
                            let mut session = HealingSession::open(request);
                            session.fail(e.to_string());
                            HealingResult::Unrepairable(session)
                        }
                    };
                    guard.complete(shared);
                    return result;
                }
            }
        }
    }

    async fn lead(
        &self,
        request: &RepairRequest,
        browser: &mut dyn Browser,
        cancel: &CancellationToken,
    ) -> Result<HealingResult> {
        if let Some(updater) = &self.updater {
            match updater.existing_replacement(&request.workflow, &request.raw_step.id).await {
                Ok(Some(steps)) => {
                    info!(
                        "Step '{}' of '{}' was already repaired; reusing the persisted steps",
                        request.raw_step.id, request.workflow
                    );
                    let mut session = HealingSession::open(request);
                    session.succeed("persisted", steps.clone());
                    return Ok(HealingResult::Repaired { steps, session, performed: None });
                }
                Ok(None) => {}
                Err(EngineError::WorkflowNotFound(_)) | Err(EngineError::InvalidName(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let result = self.heal(request, browser, cancel).await;
        let HealingResult::Repaired { steps, mut session, performed } = result else {
            return Ok(result);
        };
        let Some(updater) = &self.updater else {
            return Ok(HealingResult::Repaired { steps, session, performed });
        };

        let update = updater
            .backup_and_replace(
                &request.workflow,
                request.position,
                &request.raw_step.id,
                &steps,
                request.session_id,
            )
            .await;

        match update {
            Ok(UpdateOutcome::Applied { replacements, .. }) => {
                session.replacements = replacements.clone();
                Ok(HealingResult::Repaired {
                    steps: replacements,
                    session,
                    performed,
                })
            }
            // The action already ran with our steps; the run keeps them.
            Ok(UpdateOutcome::AlreadyReplaced { .. }) if performed.is_some() => {
                Ok(HealingResult::Repaired { steps, session, performed })
            }
            Ok(outcome) => {
                let steps = outcome.replacements().to_vec();
                session.replacements = steps.clone();
                Ok(HealingResult::Repaired { steps, session, performed: None })
            }
            Err(EngineError::WorkflowNotFound(name)) => {
                warn!("Workflow '{}' is not in the store; repair applies to this run only", name);
                Ok(HealingResult::Repaired { steps, session, performed })
            }
            Err(e @ EngineError::ValidationFailed(_)) | Err(e @ EngineError::StepNotFound { .. }) => {
                warn!("Repair of '{}' rejected: {}", request.raw_step.id, e);
                session.replacements.clear();
                session.fail(e.to_string());
                Ok(HealingResult::Unrepairable(session))
            }
            Err(e) => Err(e),
        }
    }
}

/// `timeout` from now, capped for timeouts too large to represent.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + MAX_HEALING_TIMEOUT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{BrowserError, BrowserLauncher, MemoryLauncher, MemorySite, PageSnapshot};
    use crate::execution::step::StepError;
    use crate::healing::classifier::ErrorContext;
    use crate::workflow::render::Bindings;
    use crate::workflow::{Action, Workflow, WorkflowStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct Scripted {
        attempt: Attempt,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(attempt: Attempt, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                attempt,
                delay,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RepairStrategy for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn attempt(&self, _: &RepairRequest, _: &mut dyn Browser, _: &CancellationToken) -> Attempt {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.attempt.clone()
        }
    }

    fn workflow() -> Workflow {
        Workflow::from_steps(
            "search",
            vec![
                Step::new("open", Action::Navigate { url: "https://a.test".into() }),
                Step::new("go", Action::Click { key: None }).with_selector("#go"),
            ],
        )
    }

    fn request(workflow: &Workflow) -> RepairRequest {
        let step = workflow.steps[1].clone();
        let err = StepError::Browser(BrowserError::ElementNotFound("#go".into()));
        let ctx = ErrorContext::capture(&err, &step, 1, PageSnapshot::default());
        RepairRequest::new(workflow, 1, &step, &ctx, 1_000, &Bindings::new())
    }

    fn fixed(id: &str) -> Attempt {
        Attempt::Repaired(vec![Step::new(id, Action::Click { key: None }).with_selector("#go-v2")])
    }

    async fn browser() -> Box<dyn Browser> {
        MemoryLauncher::new(MemorySite::new()).launch().await.unwrap()
    }

    #[tokio::test]
    async fn test_strategies_in_priority_order() {
        let declining = Scripted::new(Attempt::Declined("nope".into()), Duration::ZERO);
        let repairing = Scripted::new(fixed("go_heal_1"), Duration::ZERO);
        let engine = HealingEngine::default()
            .with_strategy(declining.clone())
            .with_strategy(repairing.clone());
        let mut b = browser().await;

        let result = engine.heal(&request(&workflow()), b.as_mut(), &CancellationToken::new()).await;
        assert!(result.is_repaired());
        assert_eq!(result.session().strategy.as_deref(), Some("scripted"));
        assert_eq!(declining.calls(), 1);
        assert_eq!(repairing.calls(), 1);
    }

    #[tokio::test]
    async fn test_all_declined_is_unrepairable() {
        let engine = HealingEngine::default()
            .with_strategy(Scripted::new(Attempt::Declined("no alternates".into()), Duration::ZERO));
        let mut b = browser().await;

        let result = engine.heal(&request(&workflow()), b.as_mut(), &CancellationToken::new()).await;
        let HealingResult::Unrepairable(session) = result else {
            panic!("expected unrepairable");
        };
        assert!(session.failure.unwrap().contains("no alternates"));
    }

    #[tokio::test]
    async fn test_healing_timeout() {
        let engine = HealingEngine::new(Duration::from_millis(20))
            .with_strategy(Scripted::new(fixed("late"), Duration::from_secs(5)));
        let mut b = browser().await;

        let result = engine.heal(&request(&workflow()), b.as_mut(), &CancellationToken::new()).await;
        assert!(!result.is_repaired());
    }

    #[tokio::test]
    async fn test_repair_is_persisted() {
        let dir = tempdir().unwrap();
        let store = WorkflowStore::new(dir.path());
        let wf = workflow();
        store.save(&wf).unwrap();
        let updater = Arc::new(WorkflowUpdater::new(store.clone(), dir.path().join("backups")));
        let engine = HealingEngine::default()
            .with_strategy(Scripted::new(fixed("go_heal_1"), Duration::ZERO))
            .with_updater(updater);
        let mut b = browser().await;

        let result = engine
            .repair_step(&request(&wf), b.as_mut(), &CancellationToken::new())
            .await
            .unwrap();
        let HealingResult::Repaired { steps, .. } = result else {
            panic!("expected a repair");
        };
        assert!(steps[0].is_healed());
        assert_eq!(store.load("search").unwrap().steps[1].id, "go_heal_1");
    }

    #[tokio::test]
    async fn test_persisted_repair_is_reused() {
        let dir = tempdir().unwrap();
        let store = WorkflowStore::new(dir.path());
        let wf = workflow();
        store.save(&wf).unwrap();
        let updater = Arc::new(WorkflowUpdater::new(store.clone(), dir.path().join("backups")));
        let strategy = Scripted::new(fixed("go_heal_1"), Duration::ZERO);
        let engine = HealingEngine::default()
            .with_strategy(strategy.clone())
            .with_updater(updater);
        let mut b = browser().await;

        engine.repair_step(&request(&wf), b.as_mut(), &CancellationToken::new()).await.unwrap();
        // A run that loaded the workflow before the repair fails the same step
        let again = engine.repair_step(&request(&wf), b.as_mut(), &CancellationToken::new()).await.unwrap();

        assert!(again.is_repaired());
        assert_eq!(again.session().strategy.as_deref(), Some("persisted"));
        assert_eq!(strategy.calls(), 1);
        assert_eq!(store.load("search").unwrap().revision, 1);
    }

    #[tokio::test]
    async fn test_rejected_repair_is_unrepairable() {
        let dir = tempdir().unwrap();
        let store = WorkflowStore::new(dir.path());
        let wf = workflow();
        store.save(&wf).unwrap();
        let before = store.load_bytes("search").unwrap();
        let updater = Arc::new(WorkflowUpdater::new(store.clone(), dir.path().join("backups")));
        // Collides with an existing step id
        let engine = HealingEngine::default()
            .with_strategy(Scripted::new(fixed("open"), Duration::ZERO))
            .with_updater(updater);
        let mut b = browser().await;

        let result = engine
            .repair_step(&request(&wf), b.as_mut(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.is_repaired());
        assert_eq!(store.load_bytes("search").unwrap(), before);
    }

    #[tokio::test]
    async fn test_concurrent_repairs_share_one_session() {
        let strategy = Scripted::new(fixed("go_heal_1"), Duration::from_millis(100));
        let engine = Arc::new(HealingEngine::default().with_strategy(strategy.clone()));
        let wf = workflow();

        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let engine = Arc::clone(&engine);
                let req = request(&wf);
                tokio::spawn(async move {
                    let mut b = browser().await;
                    engine.repair_step(&req, b.as_mut(), &CancellationToken::new()).await.unwrap()
                })
            })
            .collect();

        let results = futures::future::join_all(tasks).await;
        let session_ids: std::collections::HashSet<_> =
            results.iter().map(|r| r.as_ref().unwrap().session().id).collect();

        assert_eq!(strategy.calls(), 1);
        assert_eq!(session_ids.len(), 1);
        assert!(results.iter().all(|r| r.as_ref().unwrap().is_repaired()));
    }

    fn performed(id: &str) -> Attempt {
        let mut output = StepOutput::default();
        output.outputs.insert("clicked".into(), "#go-v2".into());
        Attempt::Performed {
            step: Step::new(id, Action::Click { key: None }).with_selector("#go-v2"),
            output,
        }
    }

    #[tokio::test]
    async fn test_performed_output_stays_with_the_leader() {
        let strategy = Scripted::new(performed("go_heal_1"), Duration::from_millis(100));
        let engine = Arc::new(HealingEngine::default().with_strategy(strategy.clone()));
        let wf = workflow();

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let engine = Arc::clone(&engine);
                let req = request(&wf);
                tokio::spawn(async move {
                    let mut b = browser().await;
                    engine.repair_step(&req, b.as_mut(), &CancellationToken::new()).await.unwrap()
                })
            })
            .collect();

        let performed: Vec<bool> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| match r.unwrap() {
                HealingResult::Repaired { performed, .. } => performed.is_some(),
                HealingResult::Unrepairable(_) => panic!("expected a repair"),
            })
            .collect();

        assert_eq!(strategy.calls(), 1);
        assert_eq!(performed.iter().filter(|p| **p).count(), 1);
    }

    #[tokio::test]
    async fn test_performed_repair_is_persisted() {
        let dir = tempdir().unwrap();
        let store = WorkflowStore::new(dir.path());
        let wf = workflow();
        store.save(&wf).unwrap();
        let updater = Arc::new(WorkflowUpdater::new(store.clone(), dir.path().join("backups")));
        let engine = HealingEngine::default()
            .with_strategy(Scripted::new(performed("go_heal_1"), Duration::ZERO))
            .with_updater(updater);
        let mut b = browser().await;

        let result = engine
            .repair_step(&request(&wf), b.as_mut(), &CancellationToken::new())
            .await
            .unwrap();
        let HealingResult::Repaired { steps, performed, .. } = result else {
            panic!("expected a repair");
        };
        assert_eq!(steps[0].id, "go_heal_1");
        assert_eq!(performed.unwrap().outputs["clicked"], "#go-v2");
        assert_eq!(store.load("search").unwrap().steps[1].id, "go_heal_1");
    }

    #[tokio::test]
    async fn test_unbounded_timeout_still_heals() {
        let engine = HealingEngine::new(Duration::MAX)
            .with_strategy(Scripted::new(fixed("go_heal_1"), Duration::ZERO));
        let mut b = browser().await;

        let result = engine.heal(&request(&workflow()), b.as_mut(), &CancellationToken::new()).await;
        assert!(result.is_repaired());
    }
}
