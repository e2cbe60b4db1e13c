//! Workflow Data Model
//!
//! Core data structures representing recorded browser workflows.
//!
//! # Example JSON Format
//!
//! ```json
//! {
//!   "name": "login",
//!   "variables": {
//!     "username": { "type": "string", "default": "demo" }
//!   },
//!   "steps": [
//!     { "id": "open", "type": "navigate", "url": "https://example.com/login" },
//!     { "id": "user", "type": "fill", "selector": "#username", "value": "${username}" },
//!     { "id": "submit", "type": "click", "selector": "button[type='submit']", "timeout_ms": 5000 }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::browser::Target;

/// Default per-step timeout budget in milliseconds.
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 30_000;

/// Metadata key marking where a step came from.
pub const META_SOURCE: &str = "source";
/// Metadata key holding the id of the step a healed step replaced.
pub const META_ORIGINAL_STEP: &str = "original_step_id";
/// Metadata key holding the time a healed step was produced.
pub const META_HEALED_AT: &str = "healed_at";
/// Metadata key holding the healing session that produced a step.
pub const META_HEALING_SESSION: &str = "healing_session";
/// Metadata key holding recorded alternate CSS selectors.
pub const META_ALTERNATES: &str = "alternate_selectors";
/// Metadata key holding the recorded visible text of the target element.
pub const META_ELEMENT_TEXT: &str = "element_text";

/// Provenance value for steps produced by healing.
pub const SOURCE_HEALING: &str = "healing";

/// Element state a wait condition can target.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ElementState {
    #[default]
    Visible,
    Hidden,
    Attached,
    Detached,
}

impl fmt::Display for ElementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Visible => "visible",
            Self::Hidden => "hidden",
            Self::Attached => "attached",
            Self::Detached => "detached",
        };
        write!(f, "{}", name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    #[default]
    Down,
    Up,
}

fn default_scroll_amount() -> u32 {
    500
}

/// The action a step performs, tagged by `type` in the document.
///
/// `Custom` steps carry an opaque payload in [`Step::value`] which the
/// executor decodes into sub-operations at run time.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Navigate {
        url: String,
    },
    Click {
        /// Key to press instead of (or before) clicking the locator.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
    },
    Fill,
    Select,
    Wait {
        #[serde(default)]
        state: ElementState,
        /// Fixed delay used when the step has no locator.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    Scroll {
        #[serde(default)]
        direction: ScrollDirection,
        #[serde(default = "default_scroll_amount")]
        amount: u32,
    },
    Hover,
    PressKey {
        key: String,
    },
    Screenshot {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    Extract {
        /// Variable the extracted text is bound to.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
    Custom,
}

impl Action {
    /// Short lowercase name of the action kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Navigate { .. } => "navigate",
            Self::Click { .. } => "click",
            Self::Fill => "fill",
            Self::Select => "select",
            Self::Wait { .. } => "wait",
            Self::Scroll { .. } => "scroll",
            Self::Hover => "hover",
            Self::PressKey { .. } => "press_key",
            Self::Screenshot { .. } => "screenshot",
            Self::Extract { .. } => "extract",
            Self::Custom => "custom",
        }
    }

    /// Returns true if the action cannot run without a locator.
    pub fn requires_locator(&self) -> bool {
        match self {
            Self::Fill | Self::Select | Self::Hover => true,
            Self::Click { key } => key.is_none(),
            _ => false,
        }
    }
}

/// Represents a single step in a workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Step {
    /// Unique identifier within the workflow
    pub id: String,

    /// Human readable intent, used when asking for a repair
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(flatten)]
    pub action: Action,

    /// CSS selector of the target element
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,

    /// Structural (XPath) locator, used when no selector is recorded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xpath: Option<String>,

    /// Templated payload: text to type, option to select, or a custom
    /// sub-operation document
    #[serde(
        default,
        deserialize_with = "string_or_document",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<String>,

    /// Timeout budget; falls back to the workflow default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Element state to wait for before interacting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for: Option<ElementState>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

/// Accepts either a plain string or an inline JSON/YAML document for the
/// value payload. Documents are stored in their compact JSON form.
fn string_or_document<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Bool(b) => Ok(Some(b.to_string())),
        doc => Ok(Some(doc.to_string())),
    }
}

impl Step {
    /// Creates a new step performing `action`.
    ///
    /// # Example
    ///
    /// ```
    /// use healrunner::workflow::{Action, Step};
    ///
    /// let step = Step::new("submit", Action::Click { key: None })
    ///     .with_selector("#submit")
    ///     .with_timeout_ms(5_000);
    /// assert_eq!(step.kind(), "click");
    /// ```
    pub fn new(id: impl Into<String>, action: Action) -> Self {
        Self {
            id: id.into().trim().to_string(),
            description: String::new(),
            action,
            selector: None,
            xpath: None,
            value: None,
            timeout_ms: None,
            wait_for: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn with_xpath(mut self, xpath: impl Into<String>) -> Self {
        self.xpath = Some(xpath.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_wait_for(mut self, state: ElementState) -> Self {
        self.wait_for = Some(state);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Short lowercase name of the step's action kind.
    pub fn kind(&self) -> &'static str {
        self.action.kind()
    }

    /// Resolves the element target, preferring the CSS selector.
    pub fn locator(&self) -> Option<Target> {
        let non_empty = |s: &Option<String>| s.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(String::from);

        non_empty(&self.selector)
            .map(Target::Css)
            .or_else(|| non_empty(&self.xpath).map(Target::XPath))
    }

    /// Reads a string metadata entry.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Returns true if this step was produced by healing.
    pub fn is_healed(&self) -> bool {
        self.metadata_str(META_SOURCE) == Some(SOURCE_HEALING)
    }

    /// Effective timeout for this step given the workflow default.
    pub fn effective_timeout_ms(&self, workflow_default: u64) -> u64 {
        self.timeout_ms.unwrap_or(workflow_default)
    }

    /// One-line summary used in logs and repair goals.
    pub fn summary(&self) -> String {
        let mut text = format!("{} '{}'", self.kind(), self.id);
        if let Some(target) = self.locator() {
            text.push_str(&format!(" on {}", target));
        }
        if let Action::Navigate { url } = &self.action {
            text.push_str(&format!(" to {}", url));
        }
        if !self.description.is_empty() {
            text.push_str(&format!(" ({})", self.description));
        }
        text
    }
}

/// A declared workflow variable.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Variable {
    #[serde(rename = "type", default = "default_var_type")]
    pub var_type: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,

    #[serde(default)]
    pub required: bool,
}

fn default_var_type() -> String {
    "string".to_string()
}

impl Default for Variable {
    fn default() -> Self {
        Self {
            var_type: default_var_type(),
            description: String::new(),
            default: None,
            required: false,
        }
    }
}

impl Variable {
    pub fn with_default(default: impl Into<String>) -> Self {
        Self {
            default: Some(default.into()),
            ..Self::default()
        }
    }
}

/// Record of one applied repair, kept in the persisted document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HealingRecord {
    pub healed_at: DateTime<Utc>,
    pub session_id: Uuid,
    pub original_step_id: String,
    pub failed_index: usize,
    pub replacement_ids: Vec<String>,
    /// Revision the document had after the repair was applied
    pub revision: u64,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_timeout_ms() -> u64 {
    DEFAULT_STEP_TIMEOUT_MS
}

/// Represents a complete recorded workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Workflow {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default = "default_version")]
    pub version: String,

    /// Bumped every time the persisted document is updated
    #[serde(default)]
    pub revision: u64,

    /// Ordered list of steps; order defines execution order
    #[serde(default)]
    pub steps: Vec<Step>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, Variable>,

    /// Default step timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub healing_history: Vec<HealingRecord>,
}

impl Workflow {
    /// Creates a new empty workflow.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            description: String::new(),
            version: default_version(),
            revision: 0,
            steps: Vec::new(),
            variables: BTreeMap::new(),
            timeout_ms: DEFAULT_STEP_TIMEOUT_MS,
            created_at: now,
            updated_at: now,
            healing_history: Vec::new(),
        }
    }

    /// Creates a workflow from a list of steps.
    pub fn from_steps(name: impl Into<String>, steps: Vec<Step>) -> Self {
        let mut workflow = Self::new(name);
        workflow.steps = steps;
        workflow
    }

    /// Adds a step to the workflow.
    pub fn add_step(&mut self, step: Step) -> Result<(), String> {
        if self.steps.iter().any(|s| s.id == step.id) {
            return Err(format!("Step '{}' already exists", step.id));
        }
        self.steps.push(step);
        Ok(())
    }

    /// Declares a variable.
    pub fn with_variable(mut self, name: impl Into<String>, variable: Variable) -> Self {
        self.variables.insert(name.into(), variable);
        self
    }

    /// Gets a step by ID.
    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Returns the position of a step by ID.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    /// Returns the default bindings declared by the workflow's variables.
    pub fn default_bindings(&self) -> BTreeMap<String, String> {
        self.variables
            .iter()
            .filter_map(|(name, var)| var.default.clone().map(|d| (name.clone(), d)))
            .collect()
    }

    /// Required variables that have no default and are absent from `bindings`.
    pub fn missing_required(&self, bindings: &BTreeMap<String, String>) -> Vec<String> {
        self.variables
            .iter()
            .filter(|(name, var)| var.required && var.default.is_none() && !bindings.contains_key(*name))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Natural-language restatement of what is left to do from `index` on.
    pub fn remaining_goal(&self, index: usize) -> String {
        let remaining: Vec<String> = self
            .steps
            .iter()
            .skip(index)
            .enumerate()
            .map(|(n, step)| format!("{}. {}", n + 1, step.summary()))
            .collect();

        let mut goal = if self.description.is_empty() {
            format!("Complete the '{}' workflow.", self.name)
        } else {
            format!("Complete the '{}' workflow: {}.", self.name, self.description)
        };
        if !remaining.is_empty() {
            goal.push_str(" Remaining steps:\n");
            goal.push_str(&remaining.join("\n"));
        }
        goal
    }

    /// Returns the number of steps in the workflow.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the workflow has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl Default for Workflow {
    fn default() -> Self {
        Self::new("workflow")
    }
}
