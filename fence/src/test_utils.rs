use crate::{
    memory::InMemoryStore,
    protocol::LeaseProtocol,
    record::LeaseRecord,
    store::{Condition, ConditionalStore, Mutation, StoreError, UpdateOutcome},
    time::{ManualClock, Timestamp},
};
use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// 2024-01-01T00:00:00Z, a fixed starting point for manual clocks.
pub const TEST_EPOCH: Timestamp = Timestamp::from_nanos(1_704_067_200_000_000_000);

/// A protocol over a fresh in-memory store with a clock the test controls.
pub fn manual_protocol() -> (LeaseProtocol<InMemoryStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(TEST_EPOCH));
    let protocol = LeaseProtocol::with_clock(Arc::new(InMemoryStore::new()), clock.clone());
    (protocol, clock)
}

/// A store whose backend is always unreachable. Counts calls so tests can
/// assert that rejected input never reaches the store.
#[derive(Debug, Default)]
pub struct UnreachableStore {
    calls: AtomicUsize,
}

impl UnreachableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail(&self) -> StoreError {
        self.calls.fetch_add(1, Ordering::SeqCst);
        StoreError::Unavailable("connection refused".to_string())
    }
}

#[async_trait]
impl ConditionalStore for UnreachableStore {
    async fn update_if(
        &self,
        _name: &str,
        _condition: &Condition,
        _mutations: &[Mutation],
    ) -> Result<UpdateOutcome, StoreError> {
        Err(self.fail())
    }

    async fn get(&self, _name: &str) -> Result<Option<LeaseRecord>, StoreError> {
        Err(self.fail())
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Err(self.fail())
    }

    fn backend(&self) -> &'static str {
        "unreachable"
    }
}
