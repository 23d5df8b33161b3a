//! Normalizing raw hub payloads into pipeline events
//!
//! The hub reports events in its own wire shape. This module turns that
//! shape into the internal [`Event`] type: canonical event-type names, the
//! entity reference pulled out of the payload, and a deterministic content
//! id so retries and replays can be deduplicated downstream. Normalization
//! is best-effort; anything malformed yields `None` rather than an error.

use crate::events::{
    Event, Timestamp, EVENT_TYPE_AUTOMATION_TRIGGERED, EVENT_TYPE_SCENE_ACTIVATED,
    EVENT_TYPE_SCRIPT_STARTED, EVENT_TYPE_SERVICE_EXECUTED, EVENT_TYPE_STATE_CHANGE,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Normalize one raw hub event object into a pipeline event (best-effort)
///
/// Expects the inner event object of a hub event frame, i.e. something like
/// `{"event_type": "state_changed", "data": {...}, "time_fired": "..."}`.
///
/// # Arguments
/// * `raw` - The raw event object as received from the hub
/// * `received_at` - When this process received the frame
///
/// # Returns
/// The normalized event, or `None` if the object has no usable event type
/// or is a state change without an entity id
pub fn normalize(raw: &Value, received_at: Timestamp) -> Option<Event> {
    let obj = raw.as_object()?;
    let raw_type = obj.get("event_type")?.as_str()?;
    if raw_type.is_empty() {
        return None;
    }
    let event_type = canonical_event_type(raw_type);

    let payload = obj
        .get("data")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let entity_id = payload
        .get("entity_id")
        .and_then(Value::as_str)
        .map(str::to_string);

    if event_type == EVENT_TYPE_STATE_CHANGE && entity_id.is_none() {
        return None;
    }

    let occurred_at = obj
        .get("time_fired")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
        .unwrap_or(received_at);

    let id = content_id(&event_type, entity_id.as_deref(), occurred_at, &payload);

    Some(Event {
        id,
        event_type,
        entity_id,
        occurred_at,
        received_at,
        payload,
    })
}

/// Map a hub event-type name onto its canonical tag
///
/// Unknown names pass through unchanged so new hub event types still flow
/// through the pipeline.
fn canonical_event_type(raw_type: &str) -> String {
    match raw_type {
        "state_changed" => EVENT_TYPE_STATE_CHANGE.to_string(),
        "automation_triggered" => EVENT_TYPE_AUTOMATION_TRIGGERED.to_string(),
        "script_started" => EVENT_TYPE_SCRIPT_STARTED.to_string(),
        "scene_activated" => EVENT_TYPE_SCENE_ACTIVATED.to_string(),
        "call_service" => EVENT_TYPE_SERVICE_EXECUTED.to_string(),
        other => other.to_string(),
    }
}

/// Derive a stable id from the event's content
fn content_id(
    event_type: &str,
    entity_id: Option<&str>,
    occurred_at: Timestamp,
    payload: &serde_json::Map<String, Value>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event_type.as_bytes());
    hasher.update(b"\n");
    hasher.update(entity_id.unwrap_or("").as_bytes());
    hasher.update(b"\n");
    hasher.update(occurred_at.to_rfc3339().as_bytes());
    hasher.update(b"\n");
    hasher.update(serde_json::to_string(payload).unwrap_or_default().as_bytes());

    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}
