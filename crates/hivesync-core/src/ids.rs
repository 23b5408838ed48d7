//! Newtype wrappers for identifiers to ensure type safety.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an identifier from a string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Get the inner string reference.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner string.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_id!(
    /// Unique identifier for a Task.
    TaskId
);

string_id!(
    /// Unique identifier for a Worker. Chosen by the worker itself.
    ///
    /// Ordering is lexicographic and is what the assigner uses to break ties.
    WorkerId
);

string_id!(
    /// Unique identifier for a Message.
    MessageId
);

/// Sender of a message: a worker or the coordination system itself.
pub const SYSTEM_SENDER: &str = "system";

/// Recipient sentinel addressing every worker.
pub const BROADCAST: &str = "broadcast";

/// Addressee of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Recipient {
    /// A single worker's mailbox.
    Worker(WorkerId),
    /// Every worker except the sender.
    Broadcast,
}

impl Recipient {
    /// Returns true if a message with this recipient belongs in `worker`'s mailbox.
    pub fn includes(&self, worker: &WorkerId) -> bool {
        match self {
            Recipient::Worker(id) => id == worker,
            Recipient::Broadcast => true,
        }
    }
}

impl From<String> for Recipient {
    fn from(s: String) -> Self {
        if s == BROADCAST {
            Recipient::Broadcast
        } else {
            Recipient::Worker(WorkerId::from(s))
        }
    }
}

impl From<&str> for Recipient {
    fn from(s: &str) -> Self {
        Recipient::from(s.to_owned())
    }
}

impl From<WorkerId> for Recipient {
    fn from(id: WorkerId) -> Self {
        Recipient::Worker(id)
    }
}

impl From<Recipient> for String {
    fn from(r: Recipient) -> Self {
        match r {
            Recipient::Worker(id) => id.into_inner(),
            Recipient::Broadcast => BROADCAST.to_string(),
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Worker(id) => write!(f, "{}", id),
            Recipient::Broadcast => f.write_str(BROADCAST),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_generate() {
        let id1 = TaskId::generate();
        let id2 = TaskId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_worker_ids_order_lexicographically() {
        let mut ids = vec![WorkerId::new("w-b"), WorkerId::new("w-a"), WorkerId::new("w-10")];
        ids.sort();
        assert_eq!(ids[0].as_str(), "w-10");
        assert_eq!(ids[1].as_str(), "w-a");
    }

    #[test]
    fn test_recipient_broadcast_sentinel() {
        assert_eq!(Recipient::from("broadcast"), Recipient::Broadcast);
        assert_eq!(
            Recipient::from("w1"),
            Recipient::Worker(WorkerId::new("w1"))
        );

        let json = serde_json::to_string(&Recipient::Broadcast).unwrap();
        assert_eq!(json, "\"broadcast\"");
    }

    #[test]
    fn test_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&TaskId::new("t-1")).unwrap();
        assert_eq!(json, "\"t-1\"");
    }
}
