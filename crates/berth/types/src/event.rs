//! Payment confirmation events as delivered by the external notifier.
//!
//! Authenticity is checked at the boundary before an event reaches the
//! engine. Delivery is at-least-once, so the same session may show up
//! several times.

use serde::{Deserialize, Serialize};

use crate::{PlanId, SessionId};

/// Event type that triggers provisioning.
pub const PURCHASE_CONFIRMED: &str = "purchase.confirmed";

/// A verified payment notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEvent {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(rename = "sessionId")]
    pub session_id: SessionId,

    #[serde(rename = "resolvedPlanId")]
    pub resolved_plan_id: PlanId,
}

impl PaymentEvent {
    pub fn purchase_confirmed(session_id: SessionId, plan: PlanId) -> Self {
        Self {
            kind: PURCHASE_CONFIRMED.to_string(),
            session_id,
            resolved_plan_id: plan,
        }
    }

    pub fn is_purchase_confirmed(&self) -> bool {
        self.kind == PURCHASE_CONFIRMED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let event: PaymentEvent = serde_json::from_str(
            r#"{"type":"purchase.confirmed","sessionId":"cs_1","resolvedPlanId":"planB"}"#,
        )
        .unwrap();
        assert!(event.is_purchase_confirmed());
        assert_eq!(event.session_id.as_str(), "cs_1");
        assert_eq!(event.resolved_plan_id.as_str(), "planB");
    }

    #[test]
    fn test_other_event_types() {
        let event: PaymentEvent = serde_json::from_str(
            r#"{"type":"invoice.paid","sessionId":"cs_1","resolvedPlanId":"planB"}"#,
        )
        .unwrap();
        assert!(!event.is_purchase_confirmed());
    }
}
