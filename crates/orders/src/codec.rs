//! Payload decoding by type tag.
//!
//! The inbox stores payloads as raw JSON and only decodes them on the processor
//! sweep. Decoding goes through a registry keyed by the stored `event_type` tag
//! so that an unknown or retired tag is a classified failure, not a crash, and
//! so the tag set can be checked exhaustively against the event variants at
//! startup.

use std::collections::HashMap;

use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::event::{OrderEvent, OrderEventKind};

/// Payload decode failure. Maps to an inbox record marked FAILED.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("malformed payload for {kind}: {message}")]
    Malformed { kind: OrderEventKind, message: String },

    #[error("payload operation tag is {found}, record event type is {expected}")]
    TagMismatch {
        expected: OrderEventKind,
        found: OrderEventKind,
    },

    #[error("no decoder registered for event type {0}")]
    MissingDecoder(OrderEventKind),
}

type DecodeFn = fn(&JsonValue) -> Result<OrderEvent, CodecError>;

/// Registry mapping event type tag -> decode function.
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    decoders: HashMap<OrderEventKind, DecodeFn>,
}

impl CodecRegistry {
    /// Empty registry. Use [`CodecRegistry::with_defaults`] unless a test needs
    /// a deliberately incomplete one.
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Registry with a decoder for every event kind.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(OrderEventKind::Create, decode_create);
        registry.register(OrderEventKind::Update, decode_update);
        registry.register(OrderEventKind::Delete, decode_delete);
        registry
    }

    pub fn register(&mut self, kind: OrderEventKind, decode: DecodeFn) {
        self.decoders.insert(kind, decode);
    }

    /// Startup check: every event kind must have a decoder.
    pub fn validate_exhaustive(&self) -> Result<(), CodecError> {
        for kind in OrderEventKind::ALL {
            if !self.decoders.contains_key(&kind) {
                return Err(CodecError::MissingDecoder(kind));
            }
        }
        Ok(())
    }

    /// Decode a stored payload. `event_type` is matched case-insensitively.
    pub fn decode(&self, event_type: &str, payload: &JsonValue) -> Result<OrderEvent, CodecError> {
        let kind = OrderEventKind::parse(event_type)
            .ok_or_else(|| CodecError::UnknownEventType(event_type.to_string()))?;
        let decode = self
            .decoders
            .get(&kind)
            .ok_or(CodecError::MissingDecoder(kind))?;
        decode(payload)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn decode_create(payload: &JsonValue) -> Result<OrderEvent, CodecError> {
    decode_as(OrderEventKind::Create, payload)
}

fn decode_update(payload: &JsonValue) -> Result<OrderEvent, CodecError> {
    decode_as(OrderEventKind::Update, payload)
}

fn decode_delete(payload: &JsonValue) -> Result<OrderEvent, CodecError> {
    decode_as(OrderEventKind::Delete, payload)
}

fn decode_as(expected: OrderEventKind, payload: &JsonValue) -> Result<OrderEvent, CodecError> {
    let event: OrderEvent =
        serde_json::from_value(payload.clone()).map_err(|e| CodecError::Malformed {
            kind: expected,
            message: e.to_string(),
        })?;

    if event.kind() != expected {
        return Err(CodecError::TagMismatch {
            expected,
            found: event.kind(),
        });
    }

    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_are_exhaustive() {
        CodecRegistry::with_defaults().validate_exhaustive().unwrap();
    }

    #[test]
    fn incomplete_registry_fails_validation() {
        let mut registry = CodecRegistry::new();
        registry.register(OrderEventKind::Create, decode_create);

        let err = registry.validate_exhaustive().unwrap_err();
        assert!(matches!(err, CodecError::MissingDecoder(_)));
    }

    #[test]
    fn decodes_create_payload() {
        let registry = CodecRegistry::with_defaults();
        let payload = json!({
            "operation": "CREATE",
            "customerId": 7,
            "amount": 1050,
            "status": "NEW"
        });

        let event = registry.decode("CREATE", &payload).unwrap();
        assert_eq!(event, OrderEvent::created(7, 1050, "NEW"));
    }

    #[test]
    fn event_type_lookup_is_case_insensitive() {
        let registry = CodecRegistry::with_defaults();
        let payload = json!({ "operation": "DELETE" });

        assert!(registry.decode("delete", &payload).is_ok());
    }

    #[test]
    fn malformed_payload_is_classified() {
        let registry = CodecRegistry::with_defaults();
        let payload = json!({ "operation": "CREATE", "customerId": "seven" });

        let err = registry.decode("CREATE", &payload).unwrap_err();
        assert!(matches!(err, CodecError::Malformed { .. }));
    }

    #[test]
    fn mismatched_tag_is_rejected() {
        let registry = CodecRegistry::with_defaults();
        let payload = json!({ "operation": "DELETE" });

        let err = registry.decode("CREATE", &payload).unwrap_err();
        assert!(matches!(err, CodecError::TagMismatch { .. }));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let registry = CodecRegistry::with_defaults();
        let err = registry.decode("PURGE", &json!({})).unwrap_err();
        assert!(matches!(err, CodecError::UnknownEventType(_)));
    }
}
