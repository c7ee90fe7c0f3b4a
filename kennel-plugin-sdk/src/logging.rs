//! Logging support.
//!
//! Plugins log through `tracing`. Standard output carries the protocol, so
//! the subscriber installed here always writes to standard error.
//!
//! [`Logger`] is a small structured logger on top of `tracing` for plugin
//! code that wants named loggers with attached key-value fields:
//!
//! ```ignore
//! let log = Logger::new("sysinfo").with(&[("plugin_id", json!("p1"))]);
//! log.info("request handled", &[("action", json!("hello"))]);
//! ```

use kennel_plugin_api::JsonMap;
use serde_json::Value;
use std::env;
use std::fmt;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Level filter for the installed subscriber
pub const LOG_LEVEL_ENV: &str = "KENNEL_LOG_LEVEL";

/// Output format: `pretty`, `compact` or `json`
pub const LOG_FORMAT_ENV: &str = "KENNEL_LOG_FORMAT";

/// Log severity, ordered from most to least verbose.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    /// Disables output
    Off,
}

impl LogLevel {
    /// Parse a level name case-insensitively. Unknown names are `Info`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            "off" | "none" => LogLevel::Off,
            _ => LogLevel::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Off => "off",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscriber output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line human-readable output
    Pretty,

    /// Single-line output (default)
    Compact,

    /// One JSON object per line
    Json,
}

impl LogFormat {
    /// Parse a format name. Unknown names are `Compact`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "json" => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }
}

/// Subscriber configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level filter.
    ///
    /// If None, uses the RUST_LOG environment variable or defaults to "info".
    pub level: Option<LogLevel>,

    pub format: LogFormat,

    /// Include timestamps in output.
    pub timestamps: bool,

    /// Include target module names in output.
    pub target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            format: LogFormat::Compact,
            timestamps: true,
            target: true,
        }
    }
}

impl LoggingConfig {
    /// Read `KENNEL_LOG_LEVEL` and `KENNEL_LOG_FORMAT`.
    pub fn from_env() -> Self {
        Self::from_vars(env::var(LOG_LEVEL_ENV).ok(), env::var(LOG_FORMAT_ENV).ok())
    }

    fn from_vars(level: Option<String>, format: Option<String>) -> Self {
        Self {
            level: level.as_deref().map(LogLevel::from_name),
            format: format
                .as_deref()
                .map(LogFormat::from_name)
                .unwrap_or(LogFormat::Compact),
            ..Self::default()
        }
    }

    fn filter(&self) -> EnvFilter {
        match self.level {
            Some(level) => EnvFilter::new(level.as_str()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        }
    }
}

/// Install a stderr subscriber for `config`.
///
/// Fails if a global subscriber is already set; callers that may install
/// twice can ignore the error.
pub fn init_subscriber(config: &LoggingConfig) -> Result<(), TryInitError> {
    let filter = config.filter();
    let registry = tracing_subscriber::registry().with(filter);

    match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_target(config.target)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        (LogFormat::Pretty, false) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .without_time()
                    .with_target(config.target)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        (LogFormat::Compact, true) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(config.target)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        (LogFormat::Compact, false) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .without_time()
                    .with_target(config.target)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        (LogFormat::Json, true) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(config.target)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        (LogFormat::Json, false) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .without_time()
                    .with_target(config.target)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    }
}

/// Named structured logger.
///
/// Each call emits one `tracing` event at the matching level with the
/// logger name and the merged fields (JSON-encoded) attached.
#[derive(Debug, Clone)]
pub struct Logger {
    name: String,
    level: LogLevel,
    fields: JsonMap,
}

impl Logger {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            level: LogLevel::Trace,
            fields: JsonMap::new(),
        }
    }

    /// Drop calls below `level` before they reach `tracing`
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Child logger with `fields` attached to every call
    pub fn with(&self, fields: &[(&str, Value)]) -> Self {
        let mut child = self.clone();
        for (key, value) in fields {
            child.fields.insert((*key).to_string(), value.clone());
        }
        child
    }

    /// Child logger named `<name>.<suffix>`
    pub fn named(&self, suffix: &str) -> Self {
        let mut child = self.clone();
        child.name = if self.name.is_empty() {
            suffix.to_string()
        } else {
            format!("{}.{}", self.name, suffix)
        };
        child
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &JsonMap {
        &self.fields
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level != LogLevel::Off && self.level != LogLevel::Off && level >= self.level
    }

    pub fn trace(&self, message: &str, fields: &[(&str, Value)]) {
        self.log(LogLevel::Trace, message, fields);
    }

    pub fn debug(&self, message: &str, fields: &[(&str, Value)]) {
        self.log(LogLevel::Debug, message, fields);
    }

    pub fn info(&self, message: &str, fields: &[(&str, Value)]) {
        self.log(LogLevel::Info, message, fields);
    }

    pub fn warn(&self, message: &str, fields: &[(&str, Value)]) {
        self.log(LogLevel::Warn, message, fields);
    }

    pub fn error(&self, message: &str, fields: &[(&str, Value)]) {
        self.log(LogLevel::Error, message, fields);
    }

    pub fn log(&self, level: LogLevel, message: &str, fields: &[(&str, Value)]) {
        if !self.enabled(level) {
            return;
        }
        let rendered = self.render_fields(fields);
        let name = self.name.as_str();
        match level {
            LogLevel::Trace => tracing::trace!(logger = name, fields = %rendered, "{}", message),
            LogLevel::Debug => tracing::debug!(logger = name, fields = %rendered, "{}", message),
            LogLevel::Info => tracing::info!(logger = name, fields = %rendered, "{}", message),
            LogLevel::Warn => tracing::warn!(logger = name, fields = %rendered, "{}", message),
            LogLevel::Error => tracing::error!(logger = name, fields = %rendered, "{}", message),
            LogLevel::Off => {}
        }
    }

    /// Attached fields merged with per-call fields, as compact JSON.
    /// Per-call fields win on key collisions.
    fn render_fields(&self, fields: &[(&str, Value)]) -> String {
        let mut merged = self.fields.clone();
        for (key, value) in fields {
            merged.insert((*key).to_string(), value.clone());
        }
        Value::Object(merged).to_string()
    }
}
