//! Order domain events.
//!
//! One variant per operation. The type system carries the per-operation field
//! requirements: a CREATE cannot exist without its full field set, an UPDATE
//! cannot be built empty, and a DELETE carries nothing.

use serde::{Deserialize, Serialize};

use orderflow_core::{DomainError, DomainResult};

/// Fields an UPDATE may change. At least one must be present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<i64>,
    /// Amount in smallest currency unit (cents).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl OrderPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn customer_id(mut self, customer_id: i64) -> Self {
        self.customer_id = Some(customer_id);
        self
    }

    pub fn amount(mut self, amount_cents: i64) -> Self {
        self.amount = Some(amount_cents);
        self
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.customer_id.is_none() && self.amount.is_none() && self.status.is_none()
    }
}

/// A change to one order, tagged by operation kind.
///
/// Serialized form is flat and wire-compatible:
/// `{"operation":"UPDATE","amount":2000}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation")]
pub enum OrderEvent {
    #[serde(rename = "CREATE", rename_all = "camelCase")]
    Created {
        customer_id: i64,
        /// Amount in smallest currency unit (cents).
        amount: i64,
        status: String,
    },
    #[serde(rename = "UPDATE")]
    Updated(OrderPatch),
    #[serde(rename = "DELETE")]
    Deleted,
}

impl OrderEvent {
    pub fn created(customer_id: i64, amount_cents: i64, status: impl Into<String>) -> Self {
        Self::Created {
            customer_id,
            amount: amount_cents,
            status: status.into(),
        }
    }

    /// Build an UPDATE event, rejecting an empty patch.
    pub fn updated(patch: OrderPatch) -> DomainResult<Self> {
        if patch.is_empty() {
            return Err(DomainError::validation(
                "update must change at least one of customerId, amount, status",
            ));
        }
        Ok(Self::Updated(patch))
    }

    pub fn deleted() -> Self {
        Self::Deleted
    }

    pub fn kind(&self) -> OrderEventKind {
        match self {
            OrderEvent::Created { .. } => OrderEventKind::Create,
            OrderEvent::Updated(_) => OrderEventKind::Update,
            OrderEvent::Deleted => OrderEventKind::Delete,
        }
    }
}

/// Operation discriminator, the stored `event_type` of outbox/inbox records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderEventKind {
    #[serde(rename = "CREATE")]
    Create,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

impl OrderEventKind {
    /// Every variant; the codec registry is validated against this set.
    pub const ALL: [OrderEventKind; 3] = [
        OrderEventKind::Create,
        OrderEventKind::Update,
        OrderEventKind::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderEventKind::Create => "CREATE",
            OrderEventKind::Update => "UPDATE",
            OrderEventKind::Delete => "DELETE",
        }
    }

    /// Case-insensitive parse of a stored type tag.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
    }
}

impl core::fmt::Display for OrderEventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_serializes_with_operation_tag() {
        let event = OrderEvent::created(7, 1050, "NEW");
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["operation"], "CREATE");
        assert_eq!(json["customerId"], 7);
        assert_eq!(json["amount"], 1050);
        assert_eq!(json["status"], "NEW");
    }

    #[test]
    fn update_omits_absent_fields() {
        let event = OrderEvent::updated(OrderPatch::new().amount(2000)).unwrap();
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["operation"], "UPDATE");
        assert_eq!(json["amount"], 2000);
        assert!(json.get("customerId").is_none());
        assert!(json.get("status").is_none());
    }

    #[test]
    fn empty_update_is_rejected() {
        let err = OrderEvent::updated(OrderPatch::new()).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn delete_is_a_bare_tag() {
        let json = serde_json::to_value(OrderEvent::deleted()).unwrap();
        assert_eq!(json, serde_json::json!({ "operation": "DELETE" }));
    }

    #[test]
    fn kind_parse_is_case_insensitive() {
        assert_eq!(OrderEventKind::parse("create"), Some(OrderEventKind::Create));
        assert_eq!(OrderEventKind::parse("Update"), Some(OrderEventKind::Update));
        assert_eq!(OrderEventKind::parse("bogus"), None);
    }
}
