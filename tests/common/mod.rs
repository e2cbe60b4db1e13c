//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use healrunner::browser::{Browser, BrowserPool, MemoryLauncher, MemorySite, RetryPolicy};
use healrunner::execution::{Engine, WorkflowRunner};
use healrunner::healing::oracle::{OracleError, OracleRequest};
use healrunner::healing::{FastStrategy, HealingEngine, OracleStrategy, RepairOracle, WorkflowUpdater};
use healrunner::workflow::{Action, Step, WorkflowStore};

pub fn click(id: &str, selector: &str) -> Step {
    Step::new(id, Action::Click { key: None }).with_selector(selector)
}

pub fn navigate(id: &str, url: &str) -> Step {
    Step::new(id, Action::Navigate { url: url.into() })
}

/// Oracle replying with a fixed proposal after a delay, counting calls.
pub struct CountingOracle {
    reply: Vec<Value>,
    delay: Duration,
    calls: AtomicUsize,
}

impl CountingOracle {
    pub fn new(reply: Vec<Value>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            reply,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RepairOracle for CountingOracle {
    async fn propose(&self, _: &OracleRequest, _: &mut dyn Browser) -> Result<Vec<Value>, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(self.reply.clone())
    }
}

/// Engine over a simulated site, with workflows stored under
/// `root/flows` and backups under `root/backups`.
pub fn engine(site: &MemorySite, root: &Path, pool_size: usize, oracle: Option<Arc<dyn RepairOracle>>) -> Engine {
    let store = WorkflowStore::new(root.join("flows"));
    let updater = Arc::new(WorkflowUpdater::new(store.clone(), root.join("backups")));

    let mut healer = HealingEngine::new(Duration::from_secs(10))
        .with_strategy(Arc::new(FastStrategy::new(Duration::from_secs(60), 5)));
    if let Some(oracle) = oracle {
        healer = healer.with_strategy(Arc::new(OracleStrategy::new(oracle, Duration::from_secs(5))));
    }
    let healer = healer.with_updater(updater);

    let pool = BrowserPool::new(Arc::new(MemoryLauncher::new(site.clone())), pool_size);
    let runner = WorkflowRunner::new(pool)
        .with_retry_policy(RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        })
        .with_healer(Arc::new(healer));

    Engine::new(runner, store)
}
