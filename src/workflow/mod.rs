//! Workflow Definition Module
//!
//! Data structures, persistence and validation for recorded browser
//! workflows.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Step, Workflow)
//! - [`render`]: `${name}` substitution into steps
//! - [`store`]: JSON persistence and YAML import
//! - [`validator`]: Structural validation rules

pub mod model;
pub mod render;
pub mod store;
pub mod validator;

pub use model::{Action, ElementState, ScrollDirection, Step, Variable, Workflow};
pub use render::{Bindings, Renderer, SimpleRenderer};
pub use store::{load_workflow, WorkflowStore};
pub use validator::validate_workflow;
