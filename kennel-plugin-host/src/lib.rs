//! kennel-plugin-host: Host-side driver for kennel stdio plugins
//!
//! Spawns one plugin process, waits for its readiness frame and exchanges
//! requests, events and health checks with it.
//!
//! ```rust,ignore
//! use kennel_plugin_host::{PluginCommand, PluginProcess, DEFAULT_READY_TIMEOUT, DEFAULT_STOP_GRACE};
//! use kennel_plugin_api::Request;
//!
//! let command = PluginCommand::new("./kennel-sysinfo-plugin").plugin_id("sysinfo-1");
//! let mut plugin = PluginProcess::spawn(&command, DEFAULT_READY_TIMEOUT).await?;
//! let response = plugin.request(Request::new("1", "hello")).await?;
//! let exit_code = plugin.stop(DEFAULT_STOP_GRACE).await?;
//! ```

pub mod process;

pub use kennel_plugin_api::{Event, HealthStatus, ModuleInfo, ReadyPayload, Request, Response};
pub use process::{
    HostError, PluginCommand, PluginProcess, DEFAULT_READY_TIMEOUT, DEFAULT_STOP_GRACE,
};
