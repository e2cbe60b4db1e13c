//! In-memory browser backend.
//!
//! Simulates a page as a set of known element targets. Used for dry runs
//! (permissive mode: every element exists) and for exercising the engine
//! with scripted failures and delays.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use super::driver::{Browser, BrowserError, BrowserLauncher, BrowserOp, OpOutput, Target};
use crate::workflow::model::ElementState;

#[derive(Debug, Clone)]
enum Effect {
    Fail(BrowserError),
    Delay(Duration),
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    effect: Effect,
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct SiteState {
    permissive: bool,
    elements: HashMap<Target, Vec<String>>,
    rules: Vec<Rule>,
    launch_failures: usize,
    launches: usize,
    operations: Vec<String>,
}

/// Shared simulated site. Every browser launched from the same site sees
/// the same elements and rules, and records into the same operation log.
#[derive(Debug, Clone, Default)]
pub struct MemorySite {
    state: Arc<Mutex<SiteState>>,
}

impl MemorySite {
    /// A site where only registered elements exist.
    pub fn new() -> Self {
        Self::default()
    }

    /// A site where every element exists. Used for dry runs.
    pub fn permissive() -> Self {
        let site = Self::default();
        site.state().permissive = true;
        site
    }

    fn state(&self) -> MutexGuard<'_, SiteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an element by CSS selector.
    pub fn with_element(self, selector: &str, text: &str) -> Self {
        self.add_element(Target::Css(selector.to_string()), text);
        self
    }

    pub fn add_element(&self, target: Target, text: &str) {
        self.state()
            .elements
            .entry(target)
            .or_default()
            .push(text.to_string());
    }

    pub fn remove_element(&self, target: &Target) {
        self.state().elements.remove(target);
    }

    /// Fails every operation whose description contains `pattern`.
    pub fn fail_on(&self, pattern: &str, error: BrowserError) {
        self.push_rule(pattern, Effect::Fail(error), None);
    }

    /// Fails the next `times` matching operations.
    pub fn fail_times(&self, pattern: &str, error: BrowserError, times: usize) {
        self.push_rule(pattern, Effect::Fail(error), Some(times));
    }

    /// Delays every matching operation before it runs.
    pub fn delay_on(&self, pattern: &str, delay: Duration) {
        self.push_rule(pattern, Effect::Delay(delay), None);
    }

    /// Delays the next `times` matching operations.
    pub fn delay_times(&self, pattern: &str, delay: Duration, times: usize) {
        self.push_rule(pattern, Effect::Delay(delay), Some(times));
    }

    fn push_rule(&self, pattern: &str, effect: Effect, remaining: Option<usize>) {
        self.state().rules.push(Rule {
            pattern: pattern.to_string(),
            effect,
            remaining,
        });
    }

    /// Makes the next `count` launches fail.
    pub fn fail_launches(&self, count: usize) {
        self.state().launch_failures = count;
    }

    pub fn launches(&self) -> usize {
        self.state().launches
    }

    /// Descriptions of every operation performed, in order.
    pub fn operations(&self) -> Vec<String> {
        self.state().operations.clone()
    }

    /// Number of performed operations whose description contains `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        self.state()
            .operations
            .iter()
            .filter(|op| op.contains(pattern))
            .count()
    }

    /// Logs the operation and takes the first live rule matching it.
    fn record(&self, description: &str) -> Option<Effect> {
        let mut state = self.state();
        state.operations.push(description.to_string());

        let rule = state.rules.iter_mut().find(|rule| {
            rule.remaining != Some(0) && description.contains(rule.pattern.as_str())
        })?;
        if let Some(n) = rule.remaining.as_mut() {
            *n -= 1;
        }
        Some(rule.effect.clone())
    }

    fn texts(&self, target: &Target) -> Option<Vec<String>> {
        let state = self.state();
        match state.elements.get(target) {
            Some(texts) => Some(texts.clone()),
            None if state.permissive => Some(vec![String::new()]),
            None => None,
        }
    }
}

/// Launches [`MemoryBrowser`] sessions against a shared site.
#[derive(Debug, Clone)]
pub struct MemoryLauncher {
    site: MemorySite,
}

impl MemoryLauncher {
    pub fn new(site: MemorySite) -> Self {
        Self { site }
    }

    pub fn site(&self) -> &MemorySite {
        &self.site
    }
}

#[async_trait]
impl BrowserLauncher for MemoryLauncher {
    async fn launch(&self) -> Result<Box<dyn Browser>, BrowserError> {
        let mut state = self.site.state();
        if state.launch_failures > 0 {
            state.launch_failures -= 1;
            return Err(BrowserError::Launch("simulated launch failure".into()));
        }
        state.launches += 1;
        let id = format!("mem-{}", state.launches);
        drop(state);

        Ok(Box::new(MemoryBrowser {
            id,
            site: self.site.clone(),
            tabs: vec!["about:blank".to_string()],
            active: 0,
        }))
    }
}

/// One simulated browser session.
#[derive(Debug)]
pub struct MemoryBrowser {
    id: String,
    site: MemorySite,
    tabs: Vec<String>,
    active: usize,
}

impl MemoryBrowser {
    fn require(&self, target: &Target) -> Result<Vec<String>, BrowserError> {
        self.site
            .texts(target)
            .ok_or_else(|| BrowserError::ElementNotFound(format!("no element matches {}", target)))
    }

    fn current_url(&self) -> String {
        self.tabs.get(self.active).cloned().unwrap_or_default()
    }

    fn apply(&mut self, op: &BrowserOp) -> Result<OpOutput, BrowserError> {
        let mut out = OpOutput::default();

        match op {
            BrowserOp::Navigate { url } => {
                if let Some(tab) = self.tabs.get_mut(self.active) {
                    *tab = url.clone();
                }
                out.url = Some(url.clone());
            }
            BrowserOp::Click { target }
            | BrowserOp::Fill { target, .. }
            | BrowserOp::Select { target, .. }
            | BrowserOp::Hover { target } => {
                self.require(target)?;
            }
            BrowserOp::WaitFor { target, state } => {
                let present = self.site.texts(target).is_some();
                let satisfied = match state {
                    ElementState::Visible | ElementState::Attached => present,
                    ElementState::Hidden | ElementState::Detached => !present,
                };
                if !satisfied {
                    return Err(BrowserError::Timeout(format!("waiting for {} to be {}", target, state)));
                }
            }
            BrowserOp::ExtractText { target: Some(target) } => {
                out.texts = self.require(target)?;
                out.count = out.texts.len();
            }
            BrowserOp::ExtractText { target: None } => {
                out.texts = vec![format!("Contents of {}", self.current_url())];
                out.count = 1;
            }
            BrowserOp::Count { target } => {
                out.count = self.site.texts(target).map_or(0, |texts| texts.len());
            }
            BrowserOp::OpenTab { url } => {
                self.tabs.push(url.clone());
                self.active = self.tabs.len() - 1;
                out.url = Some(url.clone());
            }
            BrowserOp::SwitchTab { index } => {
                if *index >= self.tabs.len() {
                    return Err(BrowserError::Protocol(format!("no tab at index {}", index)));
                }
                self.active = *index;
                out.url = Some(self.current_url());
            }
            BrowserOp::Screenshot { path } | BrowserOp::SavePdf { path } => {
                out.path = Some(path.clone());
            }
            BrowserOp::Snapshot => {
                out.url = Some(self.current_url());
                out.title = Some(format!("{} ({})", self.current_url(), self.id));
            }
            BrowserOp::Type { .. } | BrowserOp::PressKey { .. } | BrowserOp::Scroll { .. } => {}
        }

        Ok(out)
    }
}

#[async_trait]
impl Browser for MemoryBrowser {
    fn session_id(&self) -> &str {
        &self.id
    }

    async fn perform(&mut self, op: &BrowserOp) -> Result<OpOutput, BrowserError> {
        let description = op.to_string();
        debug!("[{}] {}", self.id, description);

        match self.site.record(&description) {
            Some(Effect::Fail(error)) => return Err(error),
            Some(Effect::Delay(delay)) => tokio::time::sleep(delay).await,
            None => {}
        }

        self.apply(op)
    }

    async fn close(&mut self) {
        debug!("[{}] closed", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn browser(site: &MemorySite) -> Box<dyn Browser> {
        MemoryLauncher::new(site.clone()).launch().await.unwrap()
    }

    #[tokio::test]
    async fn test_strict_site_requires_elements() {
        let site = MemorySite::new().with_element("#ok", "OK");
        let mut b = browser(&site).await;

        let ok = BrowserOp::Click { target: Target::Css("#ok".into()) };
        let missing = BrowserOp::Click { target: Target::Css("#nope".into()) };
        assert!(b.perform(&ok).await.is_ok());
        assert!(matches!(
            b.perform(&missing).await,
            Err(BrowserError::ElementNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_permissive_site() {
        let site = MemorySite::permissive();
        let mut b = browser(&site).await;
        let op = BrowserOp::Count { target: Target::Css("#anything".into()) };
        assert_eq!(b.perform(&op).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_fail_times_is_consumed() {
        let site = MemorySite::permissive();
        site.fail_times("click", BrowserError::Network("reset".into()), 1);
        let mut b = browser(&site).await;
        let op = BrowserOp::Click { target: Target::Css("#a".into()) };

        assert!(b.perform(&op).await.is_err());
        assert!(b.perform(&op).await.is_ok());
        assert_eq!(site.count("click css=#a"), 2);
    }

    #[tokio::test]
    async fn test_tabs_and_snapshot() {
        let site = MemorySite::permissive();
        let mut b = browser(&site).await;

        b.perform(&BrowserOp::Navigate { url: "https://a.test".into() }).await.unwrap();
        b.perform(&BrowserOp::OpenTab { url: "https://b.test".into() }).await.unwrap();
        assert_eq!(b.snapshot().await.url.as_deref(), Some("https://b.test"));

        b.perform(&BrowserOp::SwitchTab { index: 0 }).await.unwrap();
        assert_eq!(b.snapshot().await.url.as_deref(), Some("https://a.test"));
        assert!(b.perform(&BrowserOp::SwitchTab { index: 5 }).await.is_err());
    }

    #[tokio::test]
    async fn test_launch_failures() {
        let site = MemorySite::new();
        site.fail_launches(1);
        let launcher = MemoryLauncher::new(site.clone());

        assert!(matches!(launcher.launch().await, Err(BrowserError::Launch(_))));
        assert!(launcher.launch().await.is_ok());
        assert_eq!(site.launches(), 1);
    }
}
