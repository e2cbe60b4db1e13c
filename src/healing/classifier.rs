//! Error Classification
//!
//! Maps a step failure onto the engine's error taxonomy. The structural
//! kind of the error wins; message keywords are only consulted for errors
//! whose kind says nothing (protocol errors, invalid steps).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::browser::{BrowserError, PageSnapshot};
use crate::execution::step::StepError;
use crate::workflow::Step;

/// Taxonomy category of a step failure.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Timeout,
    ElementNotFound,
    Navigation,
    Network,
    Unknown,
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Timeout => "timeout",
            Self::ElementNotFound => "element not found",
            Self::Navigation => "navigation",
            Self::Network => "network",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorType {
    pub fn severity(self) -> Severity {
        match self {
            Self::Timeout | Self::ElementNotFound | Self::Unknown => Severity::Medium,
            Self::Navigation | Self::Network => Severity::High,
        }
    }
}

// Checked in this order; the first table with a hit decides.
const ELEMENT_NOT_FOUND_KEYWORDS: &[&str] = &[
    "element not found",
    "no such element",
    "selector not found",
    "no element matches",
    "element is not visible",
    "element is not clickable",
    "invalid selector",
    "malformed selector",
    "syntax error in selector",
];

const TIMEOUT_KEYWORDS: &[&str] = &["timeout", "timed out", "wait timeout", "deadline exceeded"];

const NETWORK_KEYWORDS: &[&str] = &[
    "network error",
    "connection refused",
    "connection reset",
    "dns resolution failed",
    "net::err_",
];

const NAVIGATION_KEYWORDS: &[&str] = &["page load failed", "navigation failed", "page crashed"];

const KEYWORD_TABLE: &[(ErrorType, &[&str])] = &[
    (ErrorType::ElementNotFound, ELEMENT_NOT_FOUND_KEYWORDS),
    (ErrorType::Timeout, TIMEOUT_KEYWORDS),
    (ErrorType::Network, NETWORK_KEYWORDS),
    (ErrorType::Navigation, NAVIGATION_KEYWORDS),
];

/// Classifies a step failure.
pub fn classify(error: &StepError) -> ErrorType {
    match error {
        StepError::Timeout(_) => ErrorType::Timeout,
        StepError::Browser(BrowserError::Timeout(_)) => ErrorType::Timeout,
        StepError::Browser(BrowserError::ElementNotFound(_)) => ErrorType::ElementNotFound,
        StepError::Browser(BrowserError::Navigation(_)) => ErrorType::Navigation,
        StepError::Browser(BrowserError::Network(_)) => ErrorType::Network,
        other => classify_message(&other.to_string()),
    }
}

/// Keyword classification over an error message, case-insensitive.
pub fn classify_message(message: &str) -> ErrorType {
    let lower = message.to_lowercase();

    for (error_type, keywords) in KEYWORD_TABLE {
        if keywords.iter().any(|k| lower.contains(k)) {
            return *error_type;
        }
    }

    // Driver messages like "element '#x' was not found"
    if lower.contains("element") && lower.contains("not found") {
        return ErrorType::ElementNotFound;
    }

    ErrorType::Unknown
}

/// Whether a failure of this type is worth repairing by step substitution.
pub fn is_healable(error_type: ErrorType) -> bool {
    matches!(
        error_type,
        ErrorType::Timeout | ErrorType::ElementNotFound | ErrorType::Navigation
    )
}

/// Everything captured about a step failure.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorContext {
    pub error_id: Uuid,
    pub error_type: ErrorType,
    pub severity: Severity,
    /// Structural kind of the raised error
    pub kind: String,
    pub message: String,
    /// The failing step as it was executed (rendered)
    pub step: Step,
    /// Original step position the failure belongs to
    pub step_index: usize,
    pub snapshot: PageSnapshot,
    pub healable: bool,
    pub captured_at: DateTime<Utc>,
}

impl ErrorContext {
    pub fn capture(error: &StepError, step: &Step, step_index: usize, snapshot: PageSnapshot) -> Self {
        let error_type = classify(error);
        Self {
            error_id: Uuid::new_v4(),
            error_type,
            severity: error_type.severity(),
            kind: error.kind().to_string(),
            message: error.to_string(),
            step: step.clone(),
            step_index,
            snapshot,
            healable: is_healable(error_type),
            captured_at: Utc::now(),
        }
    }

    /// Natural-language description of the failure.
    pub fn describe(&self) -> String {
        let mut text = format!(
            "Step {} ({}) failed with a {} error: {}.",
            self.step_index + 1,
            self.step.summary(),
            self.error_type,
            self.message
        );
        if let Some(url) = &self.snapshot.url {
            text.push_str(&format!(" The page was at {}.", url));
        }
        text
    }
}
