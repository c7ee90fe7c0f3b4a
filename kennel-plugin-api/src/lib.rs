//! kennel-plugin-api: Shared types for kennel stdio plugins
//!
//! This crate defines the protocol between a host and an out-of-process plugin.
//! Payloads are JSON objects carried on tagged lines; see [`frame`] for the
//! line format.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

pub mod frame;

pub use frame::{
    decode_inbound, decode_outbound, FrameError, InboundFrame, OutboundFrame, COMMAND_TAG,
    ERROR_TAG, EVENT_RESPONSE_TAG, HEALTH_RESPONSE_TAG, MAX_LINE_BYTES, PLUGIN_ERROR_TAG,
    READY_TAG, RESPONSE_TAG, STOP_TAG,
};

/// JSON object used for params, data and details
pub type JsonMap = Map<String, Value>;

/// Advisory request timeout applied when the host omits one
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Language tag reported by modules built with this crate
pub const DEFAULT_LANGUAGE: &str = "rust";

/// Environment variable carrying the plugin identifier
pub const PLUGIN_ID_ENV: &str = "KENNEL_PLUGIN_ID";

/// Environment variable carrying the JSON configuration object
pub const PLUGIN_CONFIG_ENV: &str = "KENNEL_PLUGIN_CONFIG";

/// Command envelope `type` for requests
pub const COMMAND_REQUEST: &str = "request";

/// Command envelope `type` for events
pub const COMMAND_EVENT: &str = "event";

/// Command envelope `type` for health checks
pub const COMMAND_HEALTH_CHECK: &str = "health_check";

/// Milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

fn default_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Hosts that marshal a nil map send `null`; decode it like a missing key
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// `null` or `0` means "no timeout given"
fn timeout_or_default<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<u64>::deserialize(deserializer)? {
        Some(timeout) if timeout > 0 => timeout,
        _ => DEFAULT_REQUEST_TIMEOUT_MS,
    })
}

/// `null` or `0` means "not stamped"
fn timestamp_or_now<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<i64>::deserialize(deserializer)? {
        Some(timestamp) if timestamp != 0 => timestamp,
        _ => now_millis(),
    })
}

/// Static identity of a module, reported in the readiness frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    /// Unique module identifier
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Module version (semver)
    pub version: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub author: String,

    #[serde(default)]
    pub license: String,

    /// Capability tags
    #[serde(default)]
    pub capabilities: BTreeSet<String>,

    /// Platform names the module runs on (e.g. "linux")
    #[serde(default)]
    pub supported_platforms: BTreeSet<String>,

    /// Implementation language tag
    #[serde(default = "default_language")]
    pub language: String,
}

impl ModuleInfo {
    /// Create module info with the mandatory identity fields
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            description: String::new(),
            author: String::new(),
            license: String::new(),
            capabilities: BTreeSet::new(),
            supported_platforms: BTreeSet::new(),
            language: default_language(),
        }
    }

    /// Set description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set author
    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    /// Set license
    pub fn license(mut self, license: impl Into<String>) -> Self {
        self.license = license.into();
        self
    }

    /// Add a capability tag
    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    /// Add a supported platform
    pub fn platform(mut self, platform: impl Into<String>) -> Self {
        self.supported_platforms.insert(platform.into());
        self
    }

    /// Override the language tag
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }
}

/// A request from the host. Missing or `null` fields take their defaults on decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation token, echoed back in the [`Response`]
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,

    /// Action selector
    #[serde(default, deserialize_with = "null_as_default")]
    pub action: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub params: JsonMap,

    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: BTreeMap<String, String>,

    /// Advisory timeout in milliseconds. Not enforced by the plugin runtime.
    #[serde(default = "default_timeout", deserialize_with = "timeout_or_default")]
    pub timeout: u64,
}

impl Request {
    /// Create a request with default params, metadata and timeout
    pub fn new(id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            params: JsonMap::new(),
            metadata: BTreeMap::new(),
            timeout: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }

    /// Add a parameter
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Add a metadata entry
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set the advisory timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.as_millis() as u64;
        self
    }
}

/// Structured error carried by a failed [`Response`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Machine-readable code (e.g. "unknown_action")
    pub code: String,

    /// Human-readable message
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonMap>,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }
}

/// Reply to a [`Request`].
///
/// `data` is present only on success and `error` only on failure; use
/// [`Response::success`] and [`Response::failure`] to keep them exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the originating request
    pub id: String,

    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonMap>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Response {
    /// Create a successful response
    pub fn success(id: impl Into<String>, data: JsonMap) -> Self {
        Self {
            id: id.into(),
            success: true,
            data: Some(data),
            error: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Create a failed response
    pub fn failure(
        id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            success: false,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
            metadata: BTreeMap::new(),
        }
    }

    /// Add a metadata entry
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// An event pushed by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,

    /// Dotted event type (e.g. "system.startup")
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub event_type: String,

    /// Originating component name
    #[serde(default, deserialize_with = "null_as_default")]
    pub source: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub data: JsonMap,

    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: BTreeMap<String, String>,

    /// Milliseconds since epoch; the decode time when the host omits it or sends 0
    #[serde(default = "now_millis", deserialize_with = "timestamp_or_now")]
    pub timestamp: i64,
}

impl Event {
    /// Create an event stamped with the current time
    pub fn new(
        id: impl Into<String>,
        event_type: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            source: source.into(),
            data: JsonMap::new(),
            metadata: BTreeMap::new(),
            timestamp: now_millis(),
        }
    }

    /// Add a data entry
    pub fn data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// Coarse health of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Result of a health check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthState,

    #[serde(default)]
    pub details: JsonMap,

    /// Observation time, milliseconds since epoch
    pub timestamp: i64,
}

impl HealthStatus {
    /// Create a status observed now with no details
    pub fn new(status: HealthState) -> Self {
        Self {
            status,
            details: JsonMap::new(),
            timestamp: now_millis(),
        }
    }

    /// Default report: healthy, with `uptime` in fractional seconds
    pub fn healthy(uptime: Duration) -> Self {
        Self::new(HealthState::Healthy).detail("uptime", uptime.as_secs_f64())
    }

    /// Add a detail entry
    pub fn detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Payload of the readiness frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadyPayload {
    /// Always "ready"
    pub status: String,
    pub plugin_id: String,
    pub info: ModuleInfo,
}

impl ReadyPayload {
    pub fn new(plugin_id: impl Into<String>, info: ModuleInfo) -> Self {
        Self {
            status: "ready".to_string(),
            plugin_id: plugin_id.into(),
            info,
        }
    }
}

/// Payload of the fatal startup error frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartupFailure {
    /// Always "error"
    pub status: String,
    pub plugin_id: String,
    pub error: String,
}

impl StartupFailure {
    pub fn new(plugin_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            plugin_id: plugin_id.into(),
            error: error.into(),
        }
    }
}

/// Acknowledgement of an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAck {
    pub event_id: String,
    pub success: bool,
}

/// Payload of a recoverable per-command error frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
}

/// One unit of work from the host: a `type` selector plus nested `data`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// "request", "event" or "health_check"
    #[serde(rename = "type")]
    pub command_type: String,

    #[serde(default = "empty_object")]
    pub data: Value,
}

impl CommandEnvelope {
    /// Wrap a request
    pub fn request(request: &Request) -> Result<Self, serde_json::Error> {
        Ok(Self {
            command_type: COMMAND_REQUEST.to_string(),
            data: serde_json::to_value(request)?,
        })
    }

    /// Wrap an event
    pub fn event(event: &Event) -> Result<Self, serde_json::Error> {
        Ok(Self {
            command_type: COMMAND_EVENT.to_string(),
            data: serde_json::to_value(event)?,
        })
    }

    /// A health check carries no data
    pub fn health_check() -> Self {
        Self {
            command_type: COMMAND_HEALTH_CHECK.to_string(),
            data: empty_object(),
        }
    }
}
