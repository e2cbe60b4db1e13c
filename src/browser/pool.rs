//! Browser Resource Pool
//!
//! A fixed-capacity pool of browser sessions. Capacity is enforced by a
//! semaphore; each acquired [`BrowserHandle`] owns one permit and one
//! session exclusively. Sessions are created lazily and returned to the
//! idle set when the handle is released or dropped.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use super::driver::{Browser, BrowserError, BrowserLauncher, BrowserOp, OpOutput, PageSnapshot};
use crate::error::{EngineError, Result};

struct PoolInner {
    launcher: Arc<dyn BrowserLauncher>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn Browser>>>,
    max_size: usize,
    launched: AtomicUsize,
    closed: AtomicBool,
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, Vec<Box<dyn Browser>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded pool of browser sessions. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct BrowserPool {
    inner: Arc<PoolInner>,
}

impl BrowserPool {
    /// Creates a pool that holds at most `max_size` sessions (minimum 1).
    pub fn new(launcher: Arc<dyn BrowserLauncher>, max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                launcher,
                permits: Arc::new(Semaphore::new(max_size)),
                idle: Mutex::new(Vec::new()),
                max_size,
                launched: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Waits for a free slot, then hands out an idle session or launches one.
    ///
    /// Fails with [`EngineError::ResourceExhausted`] if a new session cannot
    /// be launched or the pool has been shut down. The slot is given back
    /// in that case.
    pub async fn acquire(&self) -> Result<BrowserHandle> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::ResourceExhausted("browser pool is shut down".into()))?;

        let reused = self.inner.idle().pop();
        let browser = match reused {
            Some(browser) => {
                debug!("Reusing browser session {}", browser.session_id());
                browser
            }
            None => {
                let browser = self.inner.launcher.launch().await.map_err(|e| {
                    warn!("Browser launch failed: {}", e);
                    EngineError::ResourceExhausted(e.to_string())
                })?;
                self.inner.launched.fetch_add(1, Ordering::SeqCst);
                info!("Launched browser session {}", browser.session_id());
                browser
            }
        };

        Ok(BrowserHandle {
            browser: Some(browser),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Acquires with bounded exponential backoff on `ResourceExhausted`.
    ///
    /// Waiting for a slot is not an error and does not count as an attempt.
    pub async fn acquire_with_retry(
        &self,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<BrowserHandle> {
        let mut attempt = 1;
        let mut delay = policy.initial_delay();

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                result = self.acquire() => result,
            };

            match result {
                Err(e) if e.is_retryable() && attempt < policy.max_attempts && !self.is_closed() => {
                    warn!(
                        "Browser acquisition attempt {}/{} failed: {}. Retrying in {:?}",
                        attempt, policy.max_attempts, e, delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = policy.next_delay(delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Returns a handle's session to the idle set. Never fails.
    pub fn release(&self, handle: BrowserHandle) {
        drop(handle);
    }

    /// Number of handles currently held by callers.
    pub fn outstanding(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.inner.max_size - self.inner.permits.available_permits()
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle().len()
    }

    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    /// Total number of sessions launched over the pool's lifetime.
    pub fn launched(&self) -> usize {
        self.inner.launched.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stops handing out sessions and closes the idle ones. Sessions still
    /// held are closed when their handles are released.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.permits.close();

        let idle: Vec<Box<dyn Browser>> = self.inner.idle().drain(..).collect();
        for mut browser in idle {
            debug!("Closing browser session {}", browser.session_id());
            browser.close().await;
        }
        info!("Browser pool shut down ({} sessions launched)", self.launched());
    }
}

/// Exclusive loan of one pooled browser session.
///
/// Dropping the handle returns the session to the pool, so cancelled runs
/// give their browser back without extra bookkeeping.
pub struct BrowserHandle {
    browser: Option<Box<dyn Browser>>,
    pool: Arc<PoolInner>,
    // Released after `Drop::drop` has put the session back.
    _permit: OwnedSemaphorePermit,
}

impl Drop for BrowserHandle {
    fn drop(&mut self) {
        let Some(browser) = self.browser.take() else {
            return;
        };
        if self.pool.closed.load(Ordering::SeqCst) {
            // Closing is async; kill-on-drop backends clean up on their own.
            debug!("Pool closed, dropping session {}", browser.session_id());
            return;
        }
        self.pool.idle().push(browser);
    }
}

#[async_trait]
impl Browser for BrowserHandle {
    fn session_id(&self) -> &str {
        self.browser.as_ref().map_or("", |b| b.session_id())
    }

    async fn perform(&mut self, op: &BrowserOp) -> std::result::Result<OpOutput, BrowserError> {
        match self.browser.as_mut() {
            Some(browser) => browser.perform(op).await,
            None => Err(BrowserError::Closed),
        }
    }

    async fn snapshot(&mut self) -> PageSnapshot {
        match self.browser.as_mut() {
            Some(browser) => browser.snapshot().await,
            None => PageSnapshot::default(),
        }
    }

    async fn close(&mut self) {
        if let Some(mut browser) = self.browser.take() {
            browser.close().await;
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    200
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    5_000
}

/// Exponential backoff used for pool acquisition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Delay after `current`, capped at `max_delay_ms`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next = current.mul_f64(self.backoff_multiplier.max(1.0));
        next.min(Duration::from_millis(self.max_delay_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::memory::{MemoryLauncher, MemorySite};
    use std::collections::HashSet;

    fn pool(max: usize) -> (BrowserPool, MemorySite) {
        let site = MemorySite::permissive();
        let launcher = Arc::new(MemoryLauncher::new(site.clone()));
        (BrowserPool::new(launcher, max), site)
    }

    #[tokio::test]
    async fn test_lazy_creation_and_reuse() {
        let (pool, _) = pool(2);
        assert_eq!(pool.launched(), 0);

        let handle = pool.acquire().await.unwrap();
        let first_id = handle.session_id().to_string();
        assert_eq!(pool.outstanding(), 1);
        pool.release(handle);

        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.idle_count(), 1);

        let handle = pool.acquire().await.unwrap();
        assert_eq!(handle.session_id(), first_id);
        assert_eq!(pool.launched(), 1);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let (pool, _) = pool(1);
        let held = pool.acquire().await.unwrap();

        let waiting = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(waiting.is_err(), "second acquire must wait");

        drop(held);
        let handle = tokio::time::timeout(Duration::from_secs(1), pool.acquire())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pool.outstanding(), 1);
        drop(handle);
    }

    #[tokio::test]
    async fn test_outstanding_never_exceeds_max() {
        let (pool, _) = pool(3);
        let held = Arc::new(Mutex::new(HashSet::new()));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..12 {
            let pool = pool.clone();
            let held = Arc::clone(&held);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let handle = pool.acquire().await.unwrap();
                let id = handle.session_id().to_string();
                assert!(held.lock().unwrap().insert(id.clone()), "session handed out twice");
                peak.fetch_max(pool.outstanding(), Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                held.lock().unwrap().remove(&id);
                drop(handle);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(pool.launched() <= 3);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_launch_failure_is_resource_exhausted() {
        let (pool, site) = pool(1);
        site.fail_launches(1);

        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, EngineError::ResourceExhausted(_)));
        // Permit was returned
        assert_eq!(pool.outstanding(), 0);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_acquire_with_retry_recovers() {
        let (pool, site) = pool(1);
        site.fail_launches(2);
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            ..RetryPolicy::default()
        };

        let handle = pool
            .acquire_with_retry(&policy, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!handle.session_id().is_empty());
    }

    #[tokio::test]
    async fn test_acquire_with_retry_gives_up() {
        let (pool, site) = pool(1);
        site.fail_launches(10);
        let policy = RetryPolicy {
            max_attempts: 2,
            initial_delay_ms: 1,
            ..RetryPolicy::default()
        };

        let err = pool
            .acquire_with_retry(&policy, &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_acquire() {
        let (pool, _) = pool(1);
        drop(pool.acquire().await.unwrap());
        pool.shutdown().await;

        assert_eq!(pool.idle_count(), 0);
        assert!(matches!(pool.acquire().await, Err(EngineError::ResourceExhausted(_))));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            initial_delay_ms: 100,
            backoff_multiplier: 3.0,
            max_delay_ms: 500,
            ..RetryPolicy::default()
        };
        let d1 = policy.next_delay(policy.initial_delay());
        assert_eq!(d1, Duration::from_millis(300));
        assert_eq!(policy.next_delay(d1), Duration::from_millis(500));
    }
}
