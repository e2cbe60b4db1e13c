//! Browser Access
//!
//! - [`driver`]: the `Browser` and `BrowserLauncher` traits and the
//!   operation vocabulary
//! - [`pool`]: bounded pool lending sessions to one run at a time
//! - [`command`]: sessions driven by an external automation process
//! - [`memory`]: simulated sessions for dry runs and tests

pub mod command;
pub mod driver;
pub mod memory;
pub mod pool;

pub use command::CommandLauncher;
pub use driver::{Browser, BrowserError, BrowserLauncher, BrowserOp, OpOutput, PageSnapshot, Target};
pub use memory::{MemoryLauncher, MemorySite};
pub use pool::{BrowserHandle, BrowserPool, RetryPolicy};
