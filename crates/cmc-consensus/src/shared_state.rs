//! ---
//! cmc_section: "07-resilience-fault-tolerance"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Consensus store access and replica membership."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use cmc_persistence::{StateStore, StoreError, StoredBlob};

use crate::store::{ConsensusStore, MESH_STATE_KEY};

/// Sealed state shared by every replica under [`MESH_STATE_KEY`].
#[derive(Clone)]
pub struct ClusterStateStore {
    store: Arc<dyn ConsensusStore>,
}

impl ClusterStateStore {
    pub fn new(store: Arc<dyn ConsensusStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StateStore for ClusterStateStore {
    async fn load(&self) -> Result<Option<StoredBlob>, StoreError> {
        Ok(self
            .store
            .get(MESH_STATE_KEY)
            .await?
            .map(|entry| StoredBlob {
                revision: entry.revision,
                bytes: entry.value,
            }))
    }

    async fn save(&self, expected_revision: u64, bytes: Vec<u8>) -> Result<u64, StoreError> {
        self.store
            .put_if(MESH_STATE_KEY, expected_revision, bytes)
            .await
    }
}
