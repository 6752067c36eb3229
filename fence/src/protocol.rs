// Lease protocol: acquire, heartbeat, value mutation and release, each one
// conditional update against the store.

use crate::{
    error::{Error, Result},
    record::{Fence, LeaseRecord},
    store::{Condition, ConditionalStore, Mutation, UpdateOutcome},
    time::{Clock, SystemClock, Timestamp},
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Longest nonce a client may present
pub const MAX_NONCE_LEN: usize = 64;

/// Longest lease name accepted
pub const MAX_NAME_LEN: usize = 256;

/// Grants and maintains leases. Holds no lease state of its own; the store
/// arbitrates every competing call.
#[derive(Debug)]
pub struct LeaseProtocol<S: ConditionalStore + ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: ConditionalStore + ?Sized> Clone for LeaseProtocol<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S: ConditionalStore + ?Sized> LeaseProtocol<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Take the lease `name` for `duration`.
    ///
    /// Succeeds if the lease is absent, expired, or last acquired with the
    /// same `nonce`, so a client may safely retry after a timeout. Every
    /// success increments the fence. The body is left as it was.
    pub async fn acquire(&self, name: &str, nonce: &str, duration: Duration) -> Result<LeaseRecord> {
        validate_name(name)?;
        validate_nonce(nonce)?;

        let now = self.clock.now();
        let condition = Condition::Any(vec![
            Condition::Absent,
            Condition::ExpiredAt(now),
            Condition::NonceIs(nonce.to_owned()),
        ]);
        let mutations = [
            Mutation::SetNonce(nonce.to_owned()),
            Mutation::IncrementFence,
            Mutation::SetAcquireTime(now),
            Mutation::SetHeartbeatTime(now),
            Mutation::SetExpireTime(now.saturating_add(duration)),
        ];

        match self.update(name, &condition, &mutations).await? {
            UpdateOutcome::Applied(record) => {
                info!("Granted lease {} fence={} until {}", name, record.fence, record.expire_time);
                Ok(record)
            }
            UpdateOutcome::ConditionFailed => {
                debug!("Lease {} is held by another nonce", name);
                Err(Error::LeaseHeld { name: name.to_owned() })
            }
        }
    }

    /// Extend a live lease held under `fence` to `now + extension`.
    ///
    /// A `None` fence is one no lease can carry, such as a negative value
    /// off the wire; it is well-formed but never matches.
    pub async fn heartbeat(
        &self,
        name: &str,
        fence: Option<Fence>,
        extension: Duration,
    ) -> Result<()> {
        validate_name(name)?;

        let now = self.clock.now();
        let mutations = [
            Mutation::SetHeartbeatTime(now),
            Mutation::SetExpireTime(now.saturating_add(extension)),
        ];
        self.renew(name, fence, now, &mutations).await?;
        debug!("Heartbeat on lease {} fence={:?}", name, fence);
        Ok(())
    }

    /// Replace the body of a live lease held under `fence`. Always renews
    /// the lease in the same update.
    pub async fn mutate_value(
        &self,
        name: &str,
        fence: Option<Fence>,
        extension: Duration,
        value: &str,
    ) -> Result<()> {
        validate_name(name)?;

        let now = self.clock.now();
        let mutations = [
            Mutation::SetBody(value.to_owned()),
            Mutation::SetHeartbeatTime(now),
            Mutation::SetExpireTime(now.saturating_add(extension)),
        ];
        self.renew(name, fence, now, &mutations).await?;
        debug!("Updated value of lease {} fence={:?} ({} bytes)", name, fence, value.len());
        Ok(())
    }

    /// Expire the lease if `fence` is current. A stale fence or an unknown
    /// name is not an error and changes nothing; only store failures surface.
    pub async fn release(&self, name: &str, fence: Option<Fence>) -> Result<()> {
        validate_name(name)?;

        let condition = Condition::All(vec![Condition::Exists, fence_matches(fence)]);
        let mutations = [Mutation::SetExpireTime(Timestamp::EPOCH)];

        match self.update(name, &condition, &mutations).await? {
            UpdateOutcome::Applied(_) => info!("Released lease {} fence={:?}", name, fence),
            UpdateOutcome::ConditionFailed => {
                debug!("Release of lease {} fence={:?} matched nothing", name, fence);
            }
        }
        Ok(())
    }

    /// Current stored record, if the name was ever acquired.
    pub async fn inspect(&self, name: &str) -> Result<Option<LeaseRecord>> {
        validate_name(name)?;
        self.store.get(name).await.map_err(|e| {
            error!("Store read for lease {} failed: {}", name, e);
            Error::StoreUnavailable(e)
        })
    }

    async fn renew(
        &self,
        name: &str,
        fence: Option<Fence>,
        now: Timestamp,
        mutations: &[Mutation],
    ) -> Result<()> {
        let condition = Condition::All(vec![
            Condition::Exists,
            Condition::LiveAt(now),
            fence_matches(fence),
        ]);
        match self.update(name, &condition, mutations).await? {
            UpdateOutcome::Applied(_) => Ok(()),
            UpdateOutcome::ConditionFailed => {
                debug!("Lease {} expired or fence {:?} is stale", name, fence);
                Err(Error::LeaseExpiredOrFenced {
                    name: name.to_owned(),
                    fence,
                })
            }
        }
    }

    async fn update(
        &self,
        name: &str,
        condition: &Condition,
        mutations: &[Mutation],
    ) -> Result<UpdateOutcome> {
        self.store
            .update_if(name, condition, mutations)
            .await
            .map_err(|e| {
                error!("Conditional update on lease {} failed: {}", name, e);
                Error::StoreUnavailable(e)
            })
    }
}

/// A fence no lease carries matches nothing.
fn fence_matches(fence: Option<Fence>) -> Condition {
    fence.map_or(Condition::Any(Vec::new()), Condition::FenceIs)
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::MalformedInput("lease name missing or empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::MalformedInput(format!(
            "lease name longer than {MAX_NAME_LEN} bytes"
        )));
    }
    Ok(())
}

pub fn validate_nonce(nonce: &str) -> Result<()> {
    if nonce.is_empty() {
        return Err(Error::MalformedInput("nonce missing or empty".to_string()));
    }
    if nonce.len() > MAX_NONCE_LEN {
        return Err(Error::MalformedInput(format!(
            "nonce longer than {MAX_NONCE_LEN} bytes"
        )));
    }
    Ok(())
}

/// Parse a fence from its decimal text form.
///
/// Any signed 64-bit integer is well-formed. A negative one parses to
/// `None`, since no lease ever carries it.
pub fn parse_fence(raw: &str) -> Result<Option<Fence>> {
    if raw.is_empty() {
        return Err(Error::MalformedInput("fence missing or empty".to_string()));
    }
    let value: i64 = raw
        .parse()
        .map_err(|_| Error::MalformedInput("fence not an integer".to_string()))?;
    Ok(Fence::try_from(value).ok())
}
