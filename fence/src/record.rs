// Persisted representation of one named lease

use crate::time::Timestamp;
use serde::{Deserialize, Serialize};

/// Fencing token. Strictly increasing per lease name, never reused.
pub type Fence = u64;

/// Highest fence a store will issue. Fences travel as signed 64-bit
/// integers, so nothing above `i64::MAX` is representable on the wire.
pub const MAX_FENCE: Fence = i64::MAX.unsigned_abs();

/// One lease, keyed by `name`.
///
/// Whether the lease is held is never stored; it is derived by comparing
/// `expire_time` against the current instant. `holder_nonce` and `fence`
/// persist after expiry as history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Store key, immutable once created
    pub name: String,

    /// Opaque token chosen by the current or last holder
    pub holder_nonce: String,

    /// Incremented exactly once per successful acquire
    pub fence: Fence,

    pub acquire_time: Timestamp,
    pub heartbeat_time: Timestamp,
    pub expire_time: Timestamp,

    /// Holder-defined checkpoint payload
    pub body: String,
}

impl LeaseRecord {
    /// The state an absent record is treated as before mutations apply.
    pub fn vacant(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            holder_nonce: String::new(),
            fence: 0,
            acquire_time: Timestamp::EPOCH,
            heartbeat_time: Timestamp::EPOCH,
            expire_time: Timestamp::EPOCH,
            body: String::new(),
        }
    }

    /// Held iff `expire_time` is strictly after `now`.
    pub fn is_held(&self, now: Timestamp) -> bool {
        self.expire_time > now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vacant_record() {
        let rec = LeaseRecord::vacant("job1");
        assert_eq!(rec.name, "job1");
        assert_eq!(rec.fence, 0);
        assert!(rec.body.is_empty());
        assert!(!rec.is_held(Timestamp::EPOCH));
    }

    #[test]
    fn test_liveness_boundary() {
        let mut rec = LeaseRecord::vacant("job1");
        rec.expire_time = Timestamp::from_nanos(1_000);

        assert!(rec.is_held(Timestamp::from_nanos(999)));
        // Expiry instant itself counts as free
        assert!(!rec.is_held(Timestamp::from_nanos(1_000)));
        assert!(!rec.is_held(Timestamp::from_nanos(1_001)));
    }
}
