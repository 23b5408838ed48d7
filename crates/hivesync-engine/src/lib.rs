//! HiveSync Coordination Engine
//!
//! This crate provides the leaderless coordination layer for HiveSync:
//! shared store backends, the worker registry, task lifecycle, resource
//! locks, messaging, task assignment and the reconciler loop that every
//! process may run.

pub mod assigner;
pub mod backoff;
pub mod bus;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod http;
pub mod locks;
pub mod metrics;
pub mod notify;
pub mod reconciler;
pub mod registry;
pub mod store;
pub mod tasks;

pub use assigner::{Assigner, Assignment, ScoringStrategy, WeightedScoring};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use coordinator::{Coordinator, CoordinatorBuilder};
pub use reconciler::{Reconciler, TickReport};
pub use registry::HeartbeatOutcome;
pub use store::{Store, StoreError};
