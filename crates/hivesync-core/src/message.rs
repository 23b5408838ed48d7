//! Messages exchanged between workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{MessageId, Recipient, WorkerId};

/// Immutable message record. Only `delivered_to` changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,

    /// Sending worker id, or `"system"`.
    pub from: String,

    pub to: Recipient,

    /// Application-defined message type (e.g. "handoff", "review_request").
    #[serde(rename = "type")]
    pub kind: String,

    /// Opaque structured payload.
    pub payload: serde_json::Value,

    /// Lower is more urgent. Informational; delivery order is FIFO.
    pub priority: u32,

    pub created_at: DateTime<Utc>,

    /// Recipients that have already received this message.
    #[serde(default)]
    pub delivered_to: BTreeSet<WorkerId>,
}

impl Message {
    pub fn new(
        from: impl Into<String>,
        to: Recipient,
        kind: impl Into<String>,
        payload: serde_json::Value,
        priority: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            from: from.into(),
            to,
            kind: kind.into(),
            payload,
            priority,
            created_at: now,
            delivered_to: BTreeSet::new(),
        }
    }

    /// Returns true if the message should still be handed to `worker`.
    ///
    /// Broadcasts are never echoed back to their sender.
    pub fn is_pending_for(&self, worker: &WorkerId) -> bool {
        self.to.includes(worker)
            && !self.delivered_to.contains(worker)
            && !(self.to == Recipient::Broadcast && self.from == worker.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_for_recipient() {
        let w1 = WorkerId::new("w1");
        let w2 = WorkerId::new("w2");
        let mut msg = Message::new(
            "w1",
            Recipient::Broadcast,
            "hello",
            serde_json::json!({}),
            5,
            Utc::now(),
        );

        assert!(!msg.is_pending_for(&w1));
        assert!(msg.is_pending_for(&w2));

        msg.delivered_to.insert(w2.clone());
        assert!(!msg.is_pending_for(&w2));
    }

    #[test]
    fn test_type_field_name() {
        let msg = Message::new(
            "system",
            Recipient::from("w1"),
            "notice",
            serde_json::Value::Null,
            1,
            Utc::now(),
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "notice");
        assert_eq!(value["to"], "w1");
    }
}
