//! HealRunner - Self-Healing Browser Workflow Replay
//!
//! Replays recorded browser workflows and repairs them when the page they
//! were recorded against has drifted. A step that fails with a healable
//! error is handed to the healing engine; the repaired steps run in its
//! place and are written back to the stored workflow, so later runs start
//! from the fix.
//!
//! # Architecture
//!
//! - [`workflow`]: Workflow model, validation, variable rendering and storage
//! - [`browser`]: Browser abstraction, session pool and drivers
//! - [`execution`]: Step execution, the per-run state machine and the engine
//! - [`healing`]: Error classification, repair strategies and persistence
//! - [`config`]: YAML engine configuration
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use healrunner::browser::{MemoryLauncher, MemorySite};
//! use healrunner::{load_workflow, Engine, EngineConfig};
//! use healrunner::workflow::Bindings;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let workflow = load_workflow("flows/login.json")?;
//!
//!     let launcher = Arc::new(MemoryLauncher::new(MemorySite::permissive()));
//!     let engine = Engine::from_config(&EngineConfig::load(), launcher);
//!
//!     let run = engine.run_workflow(&workflow, &Bindings::new()).await;
//!     println!("{:?}: {} repair(s)", run.status, run.healing_applications);
//!     Ok(())
//! }
//! ```

pub mod browser;
pub mod config;
pub mod error;
pub mod execution;
pub mod healing;
pub mod workflow;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::EngineError;
pub use execution::engine::Engine;
pub use workflow::model::{Action, Step, Workflow};
pub use workflow::store::load_workflow;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "HealRunner";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "HealRunner");
    }

    #[test]
    fn test_module_exports_step() {
        let step = Step::new("open", Action::Navigate { url: "https://example.test".into() });
        assert_eq!(step.id, "open");
        assert_eq!(step.kind(), "navigate");
    }

    #[test]
    fn test_module_exports_workflow() {
        let workflow = Workflow::new("login");
        assert!(workflow.is_empty());
        assert_eq!(workflow.name, "login");
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
