//! The conditional-write contract the lease protocol is built on.
//!
//! A store applies a list of [`Mutation`]s to one record only if a
//! [`Condition`] over that record (or its absence) holds, and reports a
//! failed condition as [`UpdateOutcome::ConditionFailed`] rather than as an
//! error. Any store with per-record compare-and-set can satisfy this.

use crate::{
    record::{Fence, LeaseRecord, MAX_FENCE},
    time::Timestamp,
};
use async_trait::async_trait;
use thiserror::Error;

/// Predicate over the current state of a record.
///
/// Field comparisons are false on an absent record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Absent,
    Exists,
    /// `expire_time > t`
    LiveAt(Timestamp),
    /// `expire_time <= t`
    ExpiredAt(Timestamp),
    NonceIs(String),
    FenceIs(Fence),
    All(Vec<Condition>),
    Any(Vec<Condition>),
}

impl Condition {
    pub fn evaluate(&self, record: Option<&LeaseRecord>) -> bool {
        match (self, record) {
            (Condition::Absent, rec) => rec.is_none(),
            (Condition::Exists, rec) => rec.is_some(),
            (Condition::LiveAt(t), Some(rec)) => rec.expire_time > *t,
            (Condition::ExpiredAt(t), Some(rec)) => rec.expire_time <= *t,
            (Condition::NonceIs(nonce), Some(rec)) => rec.holder_nonce == *nonce,
            (Condition::FenceIs(fence), Some(rec)) => rec.fence == *fence,
            (
                Condition::LiveAt(_)
                | Condition::ExpiredAt(_)
                | Condition::NonceIs(_)
                | Condition::FenceIs(_),
                None,
            ) => false,
            (Condition::All(conds), rec) => conds.iter().all(|c| c.evaluate(rec)),
            (Condition::Any(conds), rec) => conds.iter().any(|c| c.evaluate(rec)),
        }
    }
}

/// A single field assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    SetNonce(String),
    /// `fence = fence + 1`, starting from 0 on an absent record. Fails
    /// rather than pass [`MAX_FENCE`].
    IncrementFence,
    SetAcquireTime(Timestamp),
    SetHeartbeatTime(Timestamp),
    SetExpireTime(Timestamp),
    SetBody(String),
}

impl Mutation {
    pub fn apply(&self, record: &mut LeaseRecord) -> Result<(), StoreError> {
        match self {
            Mutation::SetNonce(nonce) => record.holder_nonce.clone_from(nonce),
            Mutation::IncrementFence => {
                record.fence = record
                    .fence
                    .checked_add(1)
                    .filter(|next| *next <= MAX_FENCE)
                    .ok_or_else(|| StoreError::FenceExhausted {
                        name: record.name.clone(),
                    })?;
            }
            Mutation::SetAcquireTime(t) => record.acquire_time = *t,
            Mutation::SetHeartbeatTime(t) => record.heartbeat_time = *t,
            Mutation::SetExpireTime(t) => record.expire_time = *t,
            Mutation::SetBody(body) => record.body.clone_from(body),
        }
        Ok(())
    }
}

/// Result of a conditional update that reached the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The condition held; carries the post-update record.
    Applied(LeaseRecord),
    ConditionFailed,
}

/// Backend failures unrelated to the condition.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("fence of record {name:?} cannot advance past {MAX_FENCE}")]
    FenceExhausted { name: String },

    #[error("corrupt record {name:?}: {reason}")]
    Corrupt { name: String, reason: String },

    #[error("invalid store configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ConditionalStore: Send + Sync + std::fmt::Debug {
    /// Atomically apply `mutations` to the record `name` iff `condition` holds.
    async fn update_if(
        &self,
        name: &str,
        condition: &Condition,
        mutations: &[Mutation],
    ) -> Result<UpdateOutcome, StoreError>;

    async fn get(&self, name: &str) -> Result<Option<LeaseRecord>, StoreError>;

    /// Provision whatever the backend needs (tables, indexes). Idempotent.
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Short backend name for logs and status output.
    fn backend(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(nonce: &str, fence: Fence, expire: i64) -> LeaseRecord {
        let mut rec = LeaseRecord::vacant("job1");
        rec.holder_nonce = nonce.to_string();
        rec.fence = fence;
        rec.expire_time = Timestamp::from_nanos(expire);
        rec
    }

    #[test]
    fn test_condition_on_absent_record() {
        let now = Timestamp::from_nanos(100);
        assert!(Condition::Absent.evaluate(None));
        assert!(!Condition::Exists.evaluate(None));
        assert!(!Condition::LiveAt(now).evaluate(None));
        assert!(!Condition::ExpiredAt(now).evaluate(None));
        assert!(!Condition::NonceIs(String::new()).evaluate(None));
        assert!(!Condition::FenceIs(0).evaluate(None));
    }

    #[test]
    fn test_condition_on_present_record() {
        let rec = record("n1", 4, 200);
        let now = Timestamp::from_nanos(100);

        assert!(!Condition::Absent.evaluate(Some(&rec)));
        assert!(Condition::Exists.evaluate(Some(&rec)));
        assert!(Condition::LiveAt(now).evaluate(Some(&rec)));
        assert!(!Condition::ExpiredAt(now).evaluate(Some(&rec)));
        assert!(Condition::ExpiredAt(Timestamp::from_nanos(200)).evaluate(Some(&rec)));
        assert!(Condition::NonceIs("n1".to_string()).evaluate(Some(&rec)));
        assert!(!Condition::NonceIs("n2".to_string()).evaluate(Some(&rec)));
        assert!(Condition::FenceIs(4).evaluate(Some(&rec)));
        assert!(!Condition::FenceIs(3).evaluate(Some(&rec)));
    }

    #[test]
    fn test_compound_conditions() {
        let rec = record("n1", 1, 200);
        let now = Timestamp::from_nanos(100);

        let acquirable = Condition::Any(vec![
            Condition::Absent,
            Condition::ExpiredAt(now),
            Condition::NonceIs("n2".to_string()),
        ]);
        assert!(acquirable.evaluate(None));
        assert!(!acquirable.evaluate(Some(&rec)));

        let live_and_fenced = Condition::All(vec![
            Condition::Exists,
            Condition::LiveAt(now),
            Condition::FenceIs(1),
        ]);
        assert!(live_and_fenced.evaluate(Some(&rec)));
        assert!(!live_and_fenced.evaluate(None));

        assert!(Condition::All(vec![]).evaluate(None));
        assert!(!Condition::Any(vec![]).evaluate(None));
    }

    #[test]
    fn test_mutations_apply_in_order() {
        let mut rec = LeaseRecord::vacant("job1");
        let t = Timestamp::from_nanos(7);
        for m in [
            Mutation::SetNonce("n1".to_string()),
            Mutation::IncrementFence,
            Mutation::IncrementFence,
            Mutation::SetAcquireTime(t),
            Mutation::SetHeartbeatTime(t),
            Mutation::SetExpireTime(Timestamp::from_nanos(9)),
            Mutation::SetBody("x".to_string()),
        ] {
            m.apply(&mut rec).unwrap();
        }

        assert_eq!(rec.holder_nonce, "n1");
        assert_eq!(rec.fence, 2);
        assert_eq!(rec.acquire_time, t);
        assert_eq!(rec.heartbeat_time, t);
        assert_eq!(rec.expire_time, Timestamp::from_nanos(9));
        assert_eq!(rec.body, "x");
    }

    #[test]
    fn test_fence_never_wraps() {
        let mut rec = record("n1", MAX_FENCE - 1, 0);
        Mutation::IncrementFence.apply(&mut rec).unwrap();
        assert_eq!(rec.fence, MAX_FENCE);

        let err = Mutation::IncrementFence.apply(&mut rec).unwrap_err();
        assert!(matches!(err, StoreError::FenceExhausted { ref name } if name == "job1"));
        assert_eq!(rec.fence, MAX_FENCE);
    }
}
