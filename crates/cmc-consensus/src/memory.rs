//! ---
//! cmc_section: "07-resilience-fault-tolerance"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Consensus store access and replica membership."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use cmc_persistence::StoreError;
use parking_lot::Mutex;

use crate::store::{ConsensusStore, Versioned};

#[derive(Debug, Default)]
struct MemoryInner {
    revision: u64,
    entries: BTreeMap<String, Versioned>,
    unavailable: bool,
}

/// Process-local store. Clones share the same data, so several replicas in one
/// process (tests, single-node deployments) see one linearizable history.
#[derive(Debug, Clone, Default)]
pub struct InMemoryConsensusStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl InMemoryConsensusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`StoreError::Unavailable`] until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.inner.lock().unavailable = !available;
    }

    fn lock_available(&self) -> Result<parking_lot::MutexGuard<'_, MemoryInner>, StoreError> {
        let inner = self.inner.lock();
        if inner.unavailable {
            return Err(StoreError::Unavailable("in-memory store disabled".into()));
        }
        Ok(inner)
    }
}

impl MemoryInner {
    fn write(&mut self, key: &str, value: Vec<u8>) -> u64 {
        self.revision += 1;
        let revision = self.revision;
        self.entries
            .insert(key.to_owned(), Versioned { value, revision });
        revision
    }
}

#[async_trait]
impl ConsensusStore for InMemoryConsensusStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        Ok(self.lock_available()?.entries.get(key).cloned())
    }

    async fn put_if(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<u64, StoreError> {
        let mut inner = self.lock_available()?;
        let actual = inner.entries.get(key).map_or(0, |entry| entry.revision);
        if actual != expected_revision {
            return Err(StoreError::Conflict {
                expected: expected_revision,
                actual,
            });
        }
        Ok(inner.write(key, value))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, StoreError> {
        Ok(self.lock_available()?.write(key, value))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.lock_available()?;
        if inner.entries.remove(key).is_some() {
            inner.revision += 1;
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, StoreError> {
        let inner = self.lock_available()?;
        Ok(inner
            .entries
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}
