//! Core event types for the hub ingestion pipeline
//!
//! This module defines the canonical Event record produced by the normalizer
//! and consumed by the filter engine and forwarder, together with the
//! canonical event-type vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Timestamp type for consistent time handling across the application
pub type Timestamp = DateTime<Utc>;

/// Canonical tag for hub state-change events
pub const EVENT_TYPE_STATE_CHANGE: &str = "state-change";
/// Canonical tag for automation-trigger events
pub const EVENT_TYPE_AUTOMATION_TRIGGERED: &str = "automation-triggered";
/// Canonical tag for script-start events
pub const EVENT_TYPE_SCRIPT_STARTED: &str = "script-started";
/// Canonical tag for scene-activation events
pub const EVENT_TYPE_SCENE_ACTIVATED: &str = "scene-activated";
/// Canonical tag for service-execution events
pub const EVENT_TYPE_SERVICE_EXECUTED: &str = "service-executed";

/// Event types that always survive filtering (automations, scripts, scenes)
pub const HIGH_SIGNAL_EVENT_TYPES: [&str; 3] = [
    EVENT_TYPE_AUTOMATION_TRIGGERED,
    EVENT_TYPE_SCRIPT_STARTED,
    EVENT_TYPE_SCENE_ACTIVATED,
];

/// One normalized hub occurrence
///
/// Immutable once created. The `payload` map is passed through opaque;
/// the filter engine inspects it only through the narrow accessors below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Deterministic identifier derived from the raw frame content
    pub id: String,
    /// Canonical event-type tag (open set, see the constants above)
    pub event_type: String,
    /// Affected device/entity, when the frame names one
    pub entity_id: Option<String>,
    /// Source-reported occurrence time
    pub occurred_at: Timestamp,
    /// Local ingestion time, used for latency and active-hours decisions
    pub received_at: Timestamp,
    /// Raw event data (old/new state, attributes), unparsed
    pub payload: serde_json::Map<String, Value>,
}

impl Event {
    /// Entity domain, the `entity_id` prefix before the first `.`
    /// (e.g. `light` for `light.kitchen`)
    pub fn entity_domain(&self) -> Option<&str> {
        self.entity_id.as_deref().and_then(|id| id.split('.').next())
    }

    /// Current state value carried by the payload, when present
    ///
    /// Hub frames report `new_state` either as a bare string or as an
    /// object whose `state` field holds the value; both forms are handled.
    pub fn state_value(&self) -> Option<&str> {
        match self.payload.get("new_state") {
            Some(Value::String(s)) => Some(s.as_str()),
            Some(Value::Object(obj)) => obj.get("state").and_then(Value::as_str),
            _ => None,
        }
    }

    /// Whether this event's type is in the always-keep set
    pub fn is_high_signal(&self) -> bool {
        HIGH_SIGNAL_EVENT_TYPES.contains(&self.event_type.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_event() -> Event {
        Event {
            id: "abc123".to_string(),
            event_type: EVENT_TYPE_STATE_CHANGE.to_string(),
            entity_id: Some("light.kitchen".to_string()),
            occurred_at: Utc::now(),
            received_at: Utc::now(),
            payload: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_event_serialization() {
        let mut event = base_event();
        event
            .payload
            .insert("new_state".to_string(), json!({"state": "on"}));

        let json = serde_json::to_string(&event).unwrap();
        let deserialized: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event, deserialized);
    }

    #[test]
    fn test_entity_domain_extraction() {
        let event = base_event();
        assert_eq!(event.entity_domain(), Some("light"));

        let mut no_entity = base_event();
        no_entity.entity_id = None;
        assert_eq!(no_entity.entity_domain(), None);

        let mut nested = base_event();
        nested.entity_id = Some("sensor.porch.temperature".to_string());
        assert_eq!(nested.entity_domain(), Some("sensor"));
    }

    #[test]
    fn test_state_value_from_object() {
        let mut event = base_event();
        event.payload.insert(
            "new_state".to_string(),
            json!({"state": "on", "attributes": {"brightness": 254}}),
        );
        assert_eq!(event.state_value(), Some("on"));
    }

    #[test]
    fn test_state_value_from_string() {
        let mut event = base_event();
        event
            .payload
            .insert("new_state".to_string(), json!("22.5"));
        assert_eq!(event.state_value(), Some("22.5"));
    }

    #[test]
    fn test_state_value_missing() {
        let event = base_event();
        assert_eq!(event.state_value(), None);

        let mut numeric = base_event();
        numeric.payload.insert("new_state".to_string(), json!(42));
        assert_eq!(numeric.state_value(), None);
    }

    #[test]
    fn test_high_signal_types() {
        let mut event = base_event();
        assert!(!event.is_high_signal());

        event.event_type = EVENT_TYPE_AUTOMATION_TRIGGERED.to_string();
        assert!(event.is_high_signal());
        event.event_type = EVENT_TYPE_SCRIPT_STARTED.to_string();
        assert!(event.is_high_signal());
        event.event_type = EVENT_TYPE_SCENE_ACTIVATED.to_string();
        assert!(event.is_high_signal());

        event.event_type = EVENT_TYPE_SERVICE_EXECUTED.to_string();
        assert!(!event.is_high_signal());
    }
}
