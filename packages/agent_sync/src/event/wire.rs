//! JSON envelope codec for the agent session stream.
//!
//! Event envelope:
//! `{ "id": N, "timestamp": "...", "source": "agent", "message": "...", "cause": N,
//!    "action": "<type>", "args": {...} }`
//! or
//! `{ ..., "observation": "<type>", "content": "...", "extras": {...} }`
//!
//! Heartbeat frames: `{ "kind": "ping", "nonce": N }` out,
//! `{ "kind": "pong", "nonce": N }` back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::observation::ErrorExtras;
use super::{
    Action, DomainEvent, EventId, EventKind, EventSource, Observation, ObservationKind,
};
use crate::error::SyncError;

/// Maximum payload size accepted from the transport (1 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Diagnostic excerpts of bad payloads are cut to this many bytes.
const EXCERPT_LEN: usize = 256;

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    id: Option<EventId>,
    timestamp: Option<String>,
    source: Option<EventSource>,
    message: Option<String>,
    cause: Option<EventId>,
    action: Option<String>,
    args: Option<Value>,
    observation: Option<String>,
    content: Option<String>,
    extras: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum ControlFrame {
    Ping { nonce: u64 },
    Pong { nonce: u64 },
}

/// Decode a payload, never failing: anything unusable becomes one `error`
/// observation carrying diagnostics.
pub fn decode(raw: &[u8]) -> DomainEvent {
    match try_decode(raw) {
        Ok(event) => event,
        Err(err) => {
            debug!(error = %err, "payload converted to error observation");
            protocol_error_event(&err, raw)
        }
    }
}

/// Strict decode.
pub fn try_decode(raw: &[u8]) -> Result<DomainEvent, SyncError> {
    if raw.len() > MAX_PAYLOAD_SIZE {
        return Err(SyncError::Protocol(format!(
            "payload too large: {} bytes (max {})",
            raw.len(),
            MAX_PAYLOAD_SIZE
        )));
    }
    let envelope: RawEnvelope = serde_json::from_slice(raw)?;

    let kind = match (envelope.action, envelope.observation) {
        (Some(tag), None) => {
            EventKind::Action(Action::from_parts(&tag, envelope.args.unwrap_or(Value::Null))?)
        }
        (None, Some(tag)) => EventKind::Observation(Observation {
            content: envelope.content.unwrap_or_default(),
            kind: ObservationKind::from_parts(&tag, envelope.extras.unwrap_or(Value::Null))?,
        }),
        (Some(_), Some(_)) => {
            return Err(SyncError::Protocol(
                "payload carries both 'action' and 'observation'".into(),
            ));
        }
        (None, None) => {
            return Err(SyncError::Protocol(
                "payload has no 'action' or 'observation' discriminator".into(),
            ));
        }
    };

    Ok(DomainEvent {
        id: envelope.id,
        timestamp: parse_timestamp(envelope.timestamp.as_deref()),
        source: envelope.source.unwrap_or(EventSource::Environment),
        message: envelope.message,
        cause: envelope.cause,
        kind,
    })
}

/// Encode an event into envelope bytes.
pub fn encode(event: &DomainEvent) -> Result<Vec<u8>, SyncError> {
    let mut obj = Map::new();
    if let Some(id) = event.id {
        obj.insert("id".into(), Value::from(id));
    }
    obj.insert("timestamp".into(), Value::from(event.timestamp.to_rfc3339()));
    obj.insert("source".into(), serde_json::to_value(event.source)?);
    if let Some(message) = &event.message {
        obj.insert("message".into(), Value::from(message.as_str()));
    }
    if let Some(cause) = event.cause {
        obj.insert("cause".into(), Value::from(cause));
    }
    match &event.kind {
        EventKind::Action(action) => {
            let (tag, args) = action.to_parts()?;
            obj.insert("action".into(), Value::from(tag));
            obj.insert("args".into(), args);
        }
        EventKind::Observation(obs) => {
            let (tag, extras) = obs.kind.to_parts()?;
            obj.insert("observation".into(), Value::from(tag));
            obj.insert("content".into(), Value::from(obs.content.as_str()));
            obj.insert("extras".into(), extras);
        }
    }
    Ok(serde_json::to_vec(&Value::Object(obj))?)
}

pub fn probe(nonce: u64) -> Vec<u8> {
    // Serializing a two-field enum cannot fail.
    serde_json::to_vec(&ControlFrame::Ping { nonce }).unwrap_or_default()
}

pub fn probe_response(nonce: u64) -> Vec<u8> {
    serde_json::to_vec(&ControlFrame::Pong { nonce }).unwrap_or_default()
}

/// Nonce of a heartbeat response frame, if this payload is one.
pub fn parse_probe_response(raw: &[u8]) -> Option<u64> {
    match control_frame(raw)? {
        ControlFrame::Pong { nonce } => Some(nonce),
        ControlFrame::Ping { .. } => None,
    }
}

/// Nonce of a heartbeat probe frame, if this payload is one.
pub fn parse_probe(raw: &[u8]) -> Option<u64> {
    match control_frame(raw)? {
        ControlFrame::Ping { nonce } => Some(nonce),
        ControlFrame::Pong { .. } => None,
    }
}

fn control_frame(raw: &[u8]) -> Option<ControlFrame> {
    // Cheap pre-check: event envelopes never carry a top-level "kind".
    if !raw.windows(6).any(|w| w == b"\"kind\"") {
        return None;
    }
    serde_json::from_slice(raw).ok()
}

/// The error observation standing in for an unusable payload.
pub fn protocol_error_event(err: &SyncError, raw: &[u8]) -> DomainEvent {
    // Keep the envelope metadata when the outer object parsed at all.
    let partial: Option<RawEnvelope> = serde_json::from_slice(raw).ok();
    let excerpt = String::from_utf8_lossy(&raw[..raw.len().min(EXCERPT_LEN)]).into_owned();

    DomainEvent {
        id: partial.as_ref().and_then(|e| e.id),
        timestamp: parse_timestamp(partial.as_ref().and_then(|e| e.timestamp.as_deref())),
        source: EventSource::Environment,
        message: Some(excerpt),
        cause: partial.as_ref().and_then(|e| e.cause),
        kind: EventKind::Observation(Observation {
            content: err.to_string(),
            kind: ObservationKind::Error(ErrorExtras {
                error_id: Some(err.error_code().to_string()),
            }),
        }),
    }
}

fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    let Some(raw) = raw else {
        return Utc::now();
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return ts.with_timezone(&Utc);
    }
    // Backends commonly emit naive ISO timestamps without an offset.
    match chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        Ok(naive) => naive.and_utc(),
        Err(_) => {
            debug!(timestamp = raw, "unparseable timestamp, using receive time");
            Utc::now()
        }
    }
}
