//! Resource lock records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::WorkerId;

/// Exclusive claim on a named resource.
///
/// A resource key has at most one holder at any time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    /// Opaque resource identifier (file path, row key, ...).
    pub resource_key: String,

    /// Worker currently holding the lock.
    pub holder: WorkerId,

    /// When the lock was acquired.
    pub locked_at: DateTime<Utc>,
}

impl Lock {
    pub fn new(resource_key: impl Into<String>, holder: WorkerId, now: DateTime<Utc>) -> Self {
        Self {
            resource_key: resource_key.into(),
            holder,
            locked_at: now,
        }
    }
}
