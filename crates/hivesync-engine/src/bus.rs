//! Point-to-point and broadcast messaging through the store.

use std::sync::Arc;

use tracing::{debug, info};

use hivesync_core::{CoordError, Message, Recipient, WorkerId};

use crate::clock::Clock;
use crate::store::{Mutation, Records};

/// Message counters for the snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxCounts {
    pub total: u64,
    /// Direct messages not yet read, plus broadcasts nobody has read.
    pub undelivered: u64,
}

/// Mailboxes backed by the messages table.
pub struct MessageBus {
    records: Records,
    clock: Arc<dyn Clock>,
}

impl MessageBus {
    pub fn new(records: Records, clock: Arc<dyn Clock>) -> Self {
        Self { records, clock }
    }

    /// Store a new message. Messages are immutable apart from their
    /// delivery set.
    pub async fn send(
        &self,
        from: &str,
        to: Recipient,
        kind: &str,
        payload: serde_json::Value,
        priority: u32,
    ) -> Result<Message, CoordError> {
        if from.trim().is_empty() {
            return Err(CoordError::InvalidInput("message sender must not be empty".into()));
        }
        if kind.trim().is_empty() {
            return Err(CoordError::InvalidInput("message type must not be empty".into()));
        }
        if let Recipient::Worker(id) = &to {
            if id.as_str().trim().is_empty() {
                return Err(CoordError::InvalidInput("message recipient must not be empty".into()));
            }
        }

        let msg = Message::new(from, to, kind, payload, priority, self.clock.now());
        self.records.insert(&msg).await?;

        info!(message_id = %msg.id, from = %msg.from, to = %msg.to, kind = %msg.kind, "Message sent");
        Ok(msg)
    }

    /// Drain `worker`'s mailbox.
    ///
    /// Returns direct messages and broadcasts (except the worker's own) not
    /// yet delivered to it, oldest first, and marks each one delivered.
    /// Concurrent readers for the same worker never receive the same message.
    pub async fn get_messages(&self, worker: &WorkerId) -> Result<Vec<Message>, CoordError> {
        let mut pending: Vec<Message> = self
            .records
            .scan::<Message>()
            .await?
            .into_iter()
            .map(|e| e.value)
            .filter(|m| m.is_pending_for(worker))
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let mut delivered = Vec::with_capacity(pending.len());
        for msg in pending {
            let marked = self
                .records
                .update::<Message, _, CoordError, _>(msg.id.as_str(), |current| match current {
                    Some(mut m) if m.is_pending_for(worker) => {
                        m.delivered_to.insert(worker.clone());
                        Ok((Mutation::Put(m.clone()), Some(m)))
                    }
                    _ => Ok((Mutation::Keep, None)),
                })
                .await?;
            delivered.extend(marked);
        }

        if !delivered.is_empty() {
            debug!(worker_id = %worker, count = delivered.len(), "Messages delivered");
        }
        Ok(delivered)
    }

    /// The `limit` most recent messages, newest first.
    pub async fn history(&self, limit: usize) -> Result<Vec<Message>, CoordError> {
        let mut all: Vec<Message> = self
            .records
            .scan::<Message>()
            .await?
            .into_iter()
            .map(|e| e.value)
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        all.truncate(limit);
        Ok(all)
    }

    pub async fn counts(&self) -> Result<MailboxCounts, CoordError> {
        let mut counts = MailboxCounts::default();
        for e in self.records.scan::<Message>().await? {
            let m = e.value;
            counts.total += 1;
            let unread = match &m.to {
                Recipient::Worker(id) => !m.delivered_to.contains(id),
                Recipient::Broadcast => m.delivered_to.is_empty(),
            };
            if unread {
                counts.undelivered += 1;
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn bus() -> (Arc<MessageBus>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let records = Records::new(Arc::new(MemoryStore::new()), 8);
        (Arc::new(MessageBus::new(records, clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_direct_messages_fifo_and_once() {
        let (bus, clock) = bus();
        let w2 = WorkerId::new("w2");

        for n in 0..3 {
            bus.send("w1", Recipient::from("w2"), "note", json!({ "n": n }), 5)
                .await
                .unwrap();
            clock.advance(Duration::from_millis(10));
        }

        let got = bus.get_messages(&w2).await.unwrap();
        let order: Vec<i64> = got.iter().map(|m| m.payload["n"].as_i64().unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert!(bus.get_messages(&w2).await.unwrap().is_empty());
        assert!(bus.get_messages(&WorkerId::new("w3")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let (bus, _) = bus();
        bus.send("w1", Recipient::Broadcast, "hello", json!(null), 1)
            .await
            .unwrap();

        assert!(bus.get_messages(&WorkerId::new("w1")).await.unwrap().is_empty());
        for id in ["w2", "w3"] {
            let worker = WorkerId::new(id);
            assert_eq!(bus.get_messages(&worker).await.unwrap().len(), 1);
            assert!(bus.get_messages(&worker).await.unwrap().is_empty());
        }

        let counts = bus.counts().await.unwrap();
        assert_eq!(counts.total, 1);
        assert_eq!(counts.undelivered, 0);
    }

    #[tokio::test]
    async fn test_concurrent_readers_split_mailbox() {
        let (bus, _) = bus();
        for _ in 0..10 {
            bus.send("system", Recipient::from("w1"), "job", json!({}), 1)
                .await
                .unwrap();
        }

        let a = tokio::spawn({
            let bus = bus.clone();
            async move { bus.get_messages(&WorkerId::new("w1")).await.unwrap().len() }
        });
        let b = tokio::spawn({
            let bus = bus.clone();
            async move { bus.get_messages(&WorkerId::new("w1")).await.unwrap().len() }
        });
        assert_eq!(a.await.unwrap() + b.await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_history_and_validation() {
        let (bus, clock) = bus();
        let first = bus
            .send("w1", Recipient::from("w2"), "a", json!(1), 1)
            .await
            .unwrap();
        clock.advance(Duration::from_secs(1));
        let second = bus
            .send("w1", Recipient::from("w2"), "b", json!(2), 1)
            .await
            .unwrap();

        let recent = bus.history(1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, second.id);
        assert_eq!(bus.history(10).await.unwrap()[1].id, first.id);

        assert!(matches!(
            bus.send("", Recipient::Broadcast, "a", json!(1), 1).await,
            Err(CoordError::InvalidInput(_))
        ));
    }
}
