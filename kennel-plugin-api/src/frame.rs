//! Line framing for the stdio protocol.
//!
//! Every frame is one line: a tag, optionally followed by `:` and a compact
//! JSON payload. This module only converts between lines and typed frames;
//! reading, writing and flushing belong to the caller.
//!
//! | Direction       | Tag                      | Payload          |
//! |-----------------|--------------------------|------------------|
//! | host → plugin   | `KENNEL_COMMAND`         | [`CommandEnvelope`] |
//! | host → plugin   | `KENNEL_STOP`            | none             |
//! | plugin → host   | `KENNEL_PLUGIN_READY`    | [`ReadyPayload`] |
//! | plugin → host   | `KENNEL_PLUGIN_ERROR`    | [`StartupFailure`] |
//! | plugin → host   | `KENNEL_RESPONSE`        | [`Response`]     |
//! | plugin → host   | `KENNEL_EVENT_RESPONSE`  | [`EventAck`]     |
//! | plugin → host   | `KENNEL_HEALTH_RESPONSE` | [`HealthStatus`] |
//! | plugin → host   | `KENNEL_ERROR`           | [`ErrorPayload`] |

use crate::{
    CommandEnvelope, ErrorPayload, EventAck, HealthStatus, ReadyPayload, Response, StartupFailure,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub const COMMAND_TAG: &str = "KENNEL_COMMAND";
pub const STOP_TAG: &str = "KENNEL_STOP";
pub const READY_TAG: &str = "KENNEL_PLUGIN_READY";
pub const PLUGIN_ERROR_TAG: &str = "KENNEL_PLUGIN_ERROR";
pub const RESPONSE_TAG: &str = "KENNEL_RESPONSE";
pub const EVENT_RESPONSE_TAG: &str = "KENNEL_EVENT_RESPONSE";
pub const HEALTH_RESPONSE_TAG: &str = "KENNEL_HEALTH_RESPONSE";
pub const ERROR_TAG: &str = "KENNEL_ERROR";

/// Lines longer than this are rejected before any JSON parsing.
pub const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

/// Errors produced while decoding or encoding a frame
#[derive(Debug, Error)]
pub enum FrameError {
    /// Line exceeds [`MAX_LINE_BYTES`]
    #[error("frame exceeds {max_bytes} bytes")]
    TooLarge { max_bytes: usize },

    /// Payload is not valid JSON or lacks required fields
    #[error("malformed {tag} payload: {source}")]
    MalformedPayload {
        tag: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Payload could not be serialized
    #[error("failed to encode {tag} frame: {source}")]
    Encode {
        tag: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// A frame written by the host
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Graceful shutdown request
    Stop,

    /// A command to dispatch
    Command(CommandEnvelope),
}

impl InboundFrame {
    /// Encode as a single line (without the trailing newline)
    pub fn encode(&self) -> Result<String, FrameError> {
        match self {
            InboundFrame::Stop => Ok(STOP_TAG.to_string()),
            InboundFrame::Command(envelope) => encode_payload(COMMAND_TAG, envelope),
        }
    }
}

/// A frame written by the plugin
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Ready(ReadyPayload),
    PluginError(StartupFailure),
    Response(Response),
    EventResponse(EventAck),
    Health(HealthStatus),
    Error(ErrorPayload),
}

impl OutboundFrame {
    /// Recoverable error frame with the given message
    pub fn error(message: impl Into<String>) -> Self {
        OutboundFrame::Error(ErrorPayload {
            error: message.into(),
        })
    }

    /// Tag this frame is written with
    pub fn tag(&self) -> &'static str {
        match self {
            OutboundFrame::Ready(_) => READY_TAG,
            OutboundFrame::PluginError(_) => PLUGIN_ERROR_TAG,
            OutboundFrame::Response(_) => RESPONSE_TAG,
            OutboundFrame::EventResponse(_) => EVENT_RESPONSE_TAG,
            OutboundFrame::Health(_) => HEALTH_RESPONSE_TAG,
            OutboundFrame::Error(_) => ERROR_TAG,
        }
    }

    /// Encode as a single line (without the trailing newline)
    pub fn encode(&self) -> Result<String, FrameError> {
        let tag = self.tag();
        match self {
            OutboundFrame::Ready(payload) => encode_payload(tag, payload),
            OutboundFrame::PluginError(payload) => encode_payload(tag, payload),
            OutboundFrame::Response(payload) => encode_payload(tag, payload),
            OutboundFrame::EventResponse(payload) => encode_payload(tag, payload),
            OutboundFrame::Health(payload) => encode_payload(tag, payload),
            OutboundFrame::Error(payload) => encode_payload(tag, payload),
        }
    }
}

/// Decode a line read by the plugin.
///
/// Blank and unrecognized lines yield `Ok(None)` and are meant to be skipped.
pub fn decode_inbound(line: &str) -> Result<Option<InboundFrame>, FrameError> {
    let Some(line) = prepare(line)? else {
        return Ok(None);
    };

    if line == STOP_TAG {
        return Ok(Some(InboundFrame::Stop));
    }

    match split_frame(line) {
        Some((COMMAND_TAG, payload)) => {
            let envelope = decode_payload(COMMAND_TAG, payload)?;
            Ok(Some(InboundFrame::Command(envelope)))
        }
        _ => Ok(None),
    }
}

/// Decode a line read by the host.
///
/// Lines that carry no known tag (for example a plugin printing to stdout
/// outside the protocol) yield `Ok(None)`.
pub fn decode_outbound(line: &str) -> Result<Option<OutboundFrame>, FrameError> {
    let Some(line) = prepare(line)? else {
        return Ok(None);
    };
    let Some((tag, payload)) = split_frame(line) else {
        return Ok(None);
    };

    let frame = match tag {
        READY_TAG => OutboundFrame::Ready(decode_payload(READY_TAG, payload)?),
        PLUGIN_ERROR_TAG => OutboundFrame::PluginError(decode_payload(PLUGIN_ERROR_TAG, payload)?),
        RESPONSE_TAG => OutboundFrame::Response(decode_payload(RESPONSE_TAG, payload)?),
        EVENT_RESPONSE_TAG => {
            OutboundFrame::EventResponse(decode_payload(EVENT_RESPONSE_TAG, payload)?)
        }
        HEALTH_RESPONSE_TAG => OutboundFrame::Health(decode_payload(HEALTH_RESPONSE_TAG, payload)?),
        ERROR_TAG => OutboundFrame::Error(decode_payload(ERROR_TAG, payload)?),
        _ => return Ok(None),
    };
    Ok(Some(frame))
}

fn prepare(line: &str) -> Result<Option<&str>, FrameError> {
    if line.len() > MAX_LINE_BYTES {
        return Err(FrameError::TooLarge {
            max_bytes: MAX_LINE_BYTES,
        });
    }
    let trimmed = line.trim();
    if trimmed.is_empty() {
        Ok(None)
    } else {
        Ok(Some(trimmed))
    }
}

fn split_frame(line: &str) -> Option<(&str, &str)> {
    line.split_once(':')
}

fn decode_payload<T: DeserializeOwned>(tag: &'static str, payload: &str) -> Result<T, FrameError> {
    serde_json::from_str(payload).map_err(|source| FrameError::MalformedPayload { tag, source })
}

fn encode_payload<T: Serialize>(tag: &'static str, payload: &T) -> Result<String, FrameError> {
    let json =
        serde_json::to_string(payload).map_err(|source| FrameError::Encode { tag, source })?;
    Ok(format!("{}:{}", tag, json))
}
