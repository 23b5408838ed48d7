//! HiveSync Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Storage backends
//! - Network
//! - Runtime specifics
//!
//! Workers, tasks, locks and messages defined here are the records every
//! process in the fleet reads and writes through a shared store.

pub mod capability;
pub mod error;
pub mod event;
pub mod ids;
pub mod lock;
pub mod message;
pub mod snapshot;
pub mod status;
pub mod task;
pub mod worker;

// Re-export commonly used types
pub use capability::{Capability, CapabilitySet};
pub use error::CoordError;
pub use event::CoordEvent;
pub use ids::{MessageId, Recipient, TaskId, WorkerId, BROADCAST, SYSTEM_SENDER};
pub use lock::Lock;
pub use message::Message;
pub use snapshot::{Snapshot, Stats};
pub use status::{TaskStatus, WorkerStatus};
pub use task::{NewTask, Task};
pub use worker::{Worker, DEFAULT_PERFORMANCE_SCORE};
