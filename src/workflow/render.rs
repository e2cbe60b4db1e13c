//! Step Rendering
//!
//! Substitutes `${name}` references in a step's templated fields with the
//! run's current bindings. Unbound references are left intact so they
//! surface downstream as ordinary step failures.

use std::collections::{BTreeMap, BTreeSet};

use super::model::{Action, Step};

/// Variable bindings visible to a run.
pub type Bindings = BTreeMap<String, String>;

/// Turns a raw step plus bindings into the step that is executed.
pub trait Renderer: Send + Sync {
    fn render(&self, step: &Step, bindings: &Bindings) -> Step;
}

/// Default `${name}` substitution renderer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleRenderer;

impl Renderer for SimpleRenderer {
    fn render(&self, step: &Step, bindings: &Bindings) -> Step {
        let mut rendered = step.clone();
        let sub = |text: &mut String| *text = render_str(text, bindings);
        let sub_opt = |text: &mut Option<String>| {
            if let Some(t) = text.as_mut() {
                *t = render_str(t, bindings);
            }
        };

        sub(&mut rendered.description);
        sub_opt(&mut rendered.selector);
        sub_opt(&mut rendered.xpath);
        sub_opt(&mut rendered.value);

        match &mut rendered.action {
            Action::Navigate { url } => sub(url),
            Action::Click { key } => sub_opt(key),
            Action::PressKey { key } => sub(key),
            Action::Screenshot { path } => sub_opt(path),
            _ => {}
        }

        rendered
    }
}

/// Calls `f` for every `${name}` reference in `template`, in order.
fn scan_references<'a>(template: &'a str, mut f: impl FnMut(std::ops::Range<usize>, &'a str)) {
    let mut rest = 0;
    while let Some(offset) = template[rest..].find("${") {
        let start = rest + offset;
        let Some(len) = template[start + 2..].find('}') else {
            break;
        };
        let end = start + 2 + len;
        let name = template[start + 2..end].trim();
        if !name.is_empty() {
            f(start..end + 1, name);
        }
        rest = end + 1;
    }
}

/// Renders a single template string.
///
/// # Example
/// ```
/// use healrunner::workflow::render::{render_str, Bindings};
///
/// let mut bindings = Bindings::new();
/// bindings.insert("user".into(), "ada".into());
/// assert_eq!(render_str("hello ${user} ${missing}", &bindings), "hello ada ${missing}");
/// ```
pub fn render_str(template: &str, bindings: &Bindings) -> String {
    let mut out = String::with_capacity(template.len());
    let mut copied = 0;

    scan_references(template, |range, name| {
        if let Some(value) = bindings.get(name) {
            out.push_str(&template[copied..range.start]);
            out.push_str(value);
            copied = range.end;
        }
    });

    out.push_str(&template[copied..]);
    out
}

/// Returns the variable names referenced by a template string.
pub fn referenced_variables(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    scan_references(template, |_, name| names.push(name.to_string()));
    names
}

/// Returns every variable a step references across its templated fields.
pub fn step_variables(step: &Step) -> BTreeSet<String> {
    let mut fields: Vec<&str> = vec![step.description.as_str()];
    fields.extend(step.selector.as_deref());
    fields.extend(step.xpath.as_deref());
    fields.extend(step.value.as_deref());

    match &step.action {
        Action::Navigate { url } => fields.push(url),
        Action::Click { key: Some(key) } | Action::PressKey { key } => fields.push(key),
        Action::Screenshot { path: Some(path) } => fields.push(path),
        _ => {}
    }

    fields.into_iter().flat_map(referenced_variables).collect()
}
