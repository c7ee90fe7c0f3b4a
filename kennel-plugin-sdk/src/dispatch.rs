//! Command dispatch.
//!
//! Turns a decoded [`CommandEnvelope`] into a lifecycle call and the
//! lifecycle result into the frame to write back. Every failure becomes a
//! `KENNEL_ERROR` frame; nothing here ends the read loop.

use crate::error::DispatchError;
use crate::lifecycle::Lifecycle;
use crate::Module;
use kennel_plugin_api::{
    CommandEnvelope, Event, EventAck, OutboundFrame, Request, COMMAND_EVENT, COMMAND_HEALTH_CHECK,
    COMMAND_REQUEST,
};

/// A command envelope decoded into its typed payload
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Request(Request),
    Event(Event),
    HealthCheck,
}

impl Command {
    pub fn from_envelope(envelope: CommandEnvelope) -> Result<Self, DispatchError> {
        match envelope.command_type.as_str() {
            COMMAND_REQUEST => serde_json::from_value(envelope.data)
                .map(Command::Request)
                .map_err(|source| DispatchError::InvalidPayload {
                    command_type: COMMAND_REQUEST,
                    source,
                }),
            COMMAND_EVENT => serde_json::from_value(envelope.data)
                .map(Command::Event)
                .map_err(|source| DispatchError::InvalidPayload {
                    command_type: COMMAND_EVENT,
                    source,
                }),
            COMMAND_HEALTH_CHECK => Ok(Command::HealthCheck),
            _ => Err(DispatchError::UnknownCommandType(envelope.command_type)),
        }
    }
}

/// Dispatch one envelope and produce exactly one frame for it.
pub async fn dispatch<M: Module>(
    lifecycle: &mut Lifecycle<M>,
    envelope: CommandEnvelope,
) -> OutboundFrame {
    match try_dispatch(lifecycle, envelope).await {
        Ok(frame) => frame,
        Err(err) => {
            tracing::warn!(error = %err, "command failed");
            OutboundFrame::error(err.to_string())
        }
    }
}

async fn try_dispatch<M: Module>(
    lifecycle: &mut Lifecycle<M>,
    envelope: CommandEnvelope,
) -> Result<OutboundFrame, DispatchError> {
    match Command::from_envelope(envelope)? {
        Command::Request(request) => {
            tracing::debug!(id = %request.id, action = %request.action, "dispatching request");
            let response = lifecycle.handle_request(request).await?;
            Ok(OutboundFrame::Response(response))
        }
        Command::Event(event) => {
            tracing::debug!(id = %event.id, event_type = %event.event_type, "dispatching event");
            let event_id = event.id.clone();
            let success = lifecycle.handle_event(event).await?;
            Ok(OutboundFrame::EventResponse(EventAck { event_id, success }))
        }
        Command::HealthCheck => {
            tracing::trace!("dispatching health check");
            Ok(OutboundFrame::Health(lifecycle.check_health().await?))
        }
    }
}
