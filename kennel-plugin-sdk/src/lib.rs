//! kennel-plugin-sdk: SDK for writing kennel stdio plugins
//!
//! A plugin is a process spawned by the host. This SDK runs the protocol
//! for it: configuration, lifecycle ordering, command dispatch, readiness
//! and error frames, and graceful shutdown on `KENNEL_STOP`, end of input or
//! a termination signal. The plugin only implements [`Module`].
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use kennel_plugin_sdk::prelude::*;
//!
//! struct Greeter {
//!     greeting: String,
//! }
//!
//! #[async_trait]
//! impl Module for Greeter {
//!     async fn init(&mut self, config: ModuleConfig) -> Result<(), ModuleError> {
//!         self.greeting = config.get_string("greeting", "Hello!");
//!         Ok(())
//!     }
//!
//!     async fn start(&mut self) -> Result<(), ModuleError> {
//!         Ok(())
//!     }
//!
//!     async fn stop(&mut self) -> Result<(), ModuleError> {
//!         Ok(())
//!     }
//!
//!     fn info(&self) -> ModuleInfo {
//!         ModuleInfo::new("greeter", "Greeter", "0.1.0")
//!     }
//!
//!     async fn handle_request(&mut self, request: Request) -> Result<Response, ModuleError> {
//!         let mut data = JsonMap::new();
//!         data.insert("message".into(), self.greeting.clone().into());
//!         Ok(Response::success(request.id, data))
//!     }
//!
//!     async fn handle_event(&mut self, _event: Event) -> Result<bool, ModuleError> {
//!         Ok(true)
//!     }
//! }
//!
//! // Generate `main`
//! plugin_main!(Greeter { greeting: String::new() });
//! ```

use async_trait::async_trait;
use std::time::Duration;

pub mod config;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod runner;
pub mod shutdown;

// Re-export everything from kennel-plugin-api
pub use kennel_plugin_api::*;

pub use config::{ModuleConfig, RunnerConfig};
pub use error::{ConfigError, DispatchError, LifecycleError, ModuleError, RunnerError};
pub use lifecycle::{Lifecycle, LifecycleState};
pub use logging::{LogLevel, Logger, LoggingConfig};
pub use runner::{run, run_module, Runner};
pub use shutdown::{ShutdownCoordinator, ShutdownTrigger};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{plugin_main, Module, ModuleConfig, ModuleError};
    pub use async_trait::async_trait;
    pub use kennel_plugin_api::{
        Event, HealthState, HealthStatus, JsonMap, ModuleInfo, Request, Response,
    };
}

/// Trait that plugins must implement.
///
/// The runtime calls `init` once, then `start` once, then any number of
/// `handle_request`, `handle_event` and `check_health` calls one at a time,
/// then `stop` once. `stop` is skipped if `init` or `start` failed.
#[async_trait]
pub trait Module: Send {
    /// Receive the host-supplied settings
    async fn init(&mut self, config: ModuleConfig) -> Result<(), ModuleError>;

    async fn start(&mut self) -> Result<(), ModuleError>;

    async fn stop(&mut self) -> Result<(), ModuleError>;

    /// Static identity, reported in the readiness frame
    fn info(&self) -> ModuleInfo;

    /// Handle a request. The runtime overwrites the response id with the
    /// request id.
    async fn handle_request(&mut self, request: Request) -> Result<Response, ModuleError>;

    /// Handle an event. The returned flag is acknowledged to the host.
    async fn handle_event(&mut self, event: Event) -> Result<bool, ModuleError>;

    /// Report health. `uptime` is the time since the module was created.
    ///
    /// Defaults to healthy with `uptime` in seconds.
    async fn check_health(&mut self, uptime: Duration) -> Result<HealthStatus, ModuleError> {
        Ok(HealthStatus::healthy(uptime))
    }
}

/// Generate a `main` that installs logging and runs the module.
///
/// Logging is configured from `KENNEL_LOG_LEVEL` / `KENNEL_LOG_FORMAT`
/// (falling back to `RUST_LOG`) and always writes to stderr.
#[macro_export]
macro_rules! plugin_main {
    ($module:expr) => {
        fn main() -> ::std::process::ExitCode {
            let _ = $crate::logging::init_subscriber(&$crate::logging::LoggingConfig::from_env());
            $crate::run($module)
        }
    };
}
