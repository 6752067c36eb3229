use crate::{
    record::LeaseRecord,
    store::{Condition, ConditionalStore, Mutation, StoreError, UpdateOutcome},
};
use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};

/// Process-local store. Each conditional update runs while holding the
/// shard lock for its key, which makes it atomic per record.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: DashMap<String, LeaseRecord>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl ConditionalStore for InMemoryStore {
    async fn update_if(
        &self,
        name: &str,
        condition: &Condition,
        mutations: &[Mutation],
    ) -> Result<UpdateOutcome, StoreError> {
        match self.records.entry(name.to_owned()) {
            Entry::Occupied(mut entry) => {
                if !condition.evaluate(Some(entry.get())) {
                    return Ok(UpdateOutcome::ConditionFailed);
                }
                // Staged on a copy so a failed mutation leaves the record as it was
                let mut next = entry.get().clone();
                for m in mutations {
                    m.apply(&mut next)?;
                }
                entry.insert(next.clone());
                Ok(UpdateOutcome::Applied(next))
            }
            Entry::Vacant(entry) => {
                if !condition.evaluate(None) {
                    return Ok(UpdateOutcome::ConditionFailed);
                }
                let mut record = LeaseRecord::vacant(name);
                for m in mutations {
                    m.apply(&mut record)?;
                }
                entry.insert(record.clone());
                Ok(UpdateOutcome::Applied(record))
            }
        }
    }

    async fn get(&self, name: &str) -> Result<Option<LeaseRecord>, StoreError> {
        Ok(self.records.get(name).map(|r| r.clone()))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
