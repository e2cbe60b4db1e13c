//! Browser driver abstraction.
//!
//! A [`Browser`] is one live browser session. The engine only talks to it
//! through [`BrowserOp`] values so that backends (an external automation
//! process, the in-memory page used for dry runs) stay interchangeable.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::workflow::model::ElementState;

/// How an element is located on the page.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum Target {
    Css(String),
    XPath(String),
    /// Index into the page's interactive elements, as reported by the driver
    Index(u32),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Css(s) => write!(f, "css={}", s),
            Self::XPath(s) => write!(f, "xpath={}", s),
            Self::Index(i) => write!(f, "index={}", i),
        }
    }
}

/// A single primitive browser operation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BrowserOp {
    Navigate { url: String },
    Click { target: Target },
    Fill { target: Target, text: String },
    /// Types text into the focused element without clearing it
    Type { text: String },
    Select { target: Target, value: String },
    Hover { target: Target },
    PressKey { key: String },
    WaitFor { target: Target, state: ElementState },
    Scroll { dy: i64 },
    Screenshot { path: String },
    /// Collects the text of every match, or of the whole page without a target
    ExtractText { target: Option<Target> },
    /// Counts matching elements without touching them
    Count { target: Target },
    OpenTab { url: String },
    SwitchTab { index: usize },
    SavePdf { path: String },
    Snapshot,
}

impl fmt::Display for BrowserOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Navigate { url } => write!(f, "navigate {}", url),
            Self::Click { target } => write!(f, "click {}", target),
            Self::Fill { target, .. } => write!(f, "fill {}", target),
            Self::Type { .. } => write!(f, "type"),
            Self::Select { target, value } => write!(f, "select {} {}", target, value),
            Self::Hover { target } => write!(f, "hover {}", target),
            Self::PressKey { key } => write!(f, "press {}", key),
            Self::WaitFor { target, state } => write!(f, "wait {} {}", target, state),
            Self::Scroll { dy } => write!(f, "scroll {}", dy),
            Self::Screenshot { path } => write!(f, "screenshot {}", path),
            Self::ExtractText { target: Some(t) } => write!(f, "extract {}", t),
            Self::ExtractText { target: None } => write!(f, "extract page"),
            Self::Count { target } => write!(f, "count {}", target),
            Self::OpenTab { url } => write!(f, "open_tab {}", url),
            Self::SwitchTab { index } => write!(f, "switch_tab {}", index),
            Self::SavePdf { path } => write!(f, "save_pdf {}", path),
            Self::Snapshot => write!(f, "snapshot"),
        }
    }
}

/// What a browser operation reports back. Fields not relevant to an
/// operation are left empty.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct OpOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub texts: Vec<String>,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Opaque page state captured when a step fails.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PageSnapshot {
    pub url: Option<String>,
    pub title: Option<String>,
    /// Reference to a screenshot taken by the driver, if any
    pub screenshot: Option<String>,
}

/// Failures reported by a browser backend.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrowserError {
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("browser failed to launch: {0}")]
    Launch(String),

    #[error("browser session closed")]
    Closed,

    /// Anything else the backend reported, kept verbatim.
    #[error("{0}")]
    Protocol(String),
}

impl BrowserError {
    /// Builds an error from a backend's `kind` label and message.
    pub fn from_kind(kind: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            "timeout" => Self::Timeout(message),
            "element_not_found" | "not_found" => Self::ElementNotFound(message),
            "navigation" => Self::Navigation(message),
            "network" => Self::Network(message),
            "launch" => Self::Launch(message),
            "closed" => Self::Closed,
            _ => Self::Protocol(message),
        }
    }
}

/// One live browser session.
#[async_trait]
pub trait Browser: Send {
    /// Stable identifier of the underlying session.
    fn session_id(&self) -> &str;

    async fn perform(&mut self, op: &BrowserOp) -> Result<OpOutput, BrowserError>;

    /// Best-effort capture of the current page; never fails.
    async fn snapshot(&mut self) -> PageSnapshot {
        match self.perform(&BrowserOp::Snapshot).await {
            Ok(out) => PageSnapshot {
                url: out.url,
                title: out.title,
                screenshot: out.path,
            },
            Err(_) => PageSnapshot::default(),
        }
    }

    async fn close(&mut self);
}

/// Creates browser sessions for the pool.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn Browser>, BrowserError>;
}
