//! Error types for the plugin runtime
//!
//! Only [`RunnerError`] and startup failures end the process. Everything a
//! single command can produce ([`DispatchError`]) is reported to the host as
//! an error frame and the read loop carries on.

use crate::lifecycle::LifecycleState;
use kennel_plugin_api::FrameError;
use std::any::Any;
use thiserror::Error;

/// Error returned by a [`Module`](crate::Module) operation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ModuleError {
    code: String,
    message: String,
}

impl ModuleError {
    /// Create an error with an explicit code
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Internal failure (code `internal_error`)
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal_error", message)
    }

    /// Rejected configuration (code `invalid_config`)
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new("invalid_config", message)
    }

    /// Machine-readable code
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Human-readable message
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<anyhow::Error> for ModuleError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{:#}", err))
    }
}

/// Errors raised by the lifecycle controller
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Operation called in the wrong state
    #[error("cannot {operation} a module that is {state}")]
    InvalidTransition {
        operation: &'static str,
        state: LifecycleState,
    },

    /// The module returned an error
    #[error("{operation} failed: {source}")]
    Module {
        operation: &'static str,
        #[source]
        source: ModuleError,
    },

    /// The module panicked
    #[error("{operation} panicked: {message}")]
    Panicked {
        operation: &'static str,
        message: String,
    },
}

/// Errors for a single command. Recoverable: reported as a `KENNEL_ERROR` frame.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The command line could not be decoded
    #[error(transparent)]
    Decode(#[from] FrameError),

    /// The envelope `data` does not fit the command type
    #[error("invalid {command_type} payload: {source}")]
    InvalidPayload {
        command_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown command type: {0:?}")]
    UnknownCommandType(String),

    /// The module failed or panicked while handling the command
    #[error(transparent)]
    Handler(#[from] LifecycleError),
}

/// Errors acquiring the process-level configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} is not valid JSON: {source}")]
    InvalidJson {
        var: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{var} must be a JSON object, got {found}")]
    NotAnObject { var: &'static str, found: &'static str },
}

/// Fatal runner errors
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("startup failed: {0}")]
    Startup(#[source] LifecycleError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
