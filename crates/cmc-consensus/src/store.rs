//! ---
//! cmc_section: "07-resilience-fault-tolerance"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Consensus store access and replica membership."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
use async_trait::async_trait;
use cmc_persistence::StoreError;

pub const MESH_STATE_KEY: &str = "cmc/mesh/state";
pub const MEMBERS_PREFIX: &str = "cmc/members/";
pub const LEADER_KEY: &str = "cmc/leader";

/// Value with the store revision at which it was last modified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub revision: u64,
}

/// Linearizable key-value store shared by all replicas.
///
/// Revisions are strictly positive; `0` stands for "key absent" in conditional writes.
#[async_trait]
pub trait ConsensusStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError>;

    /// Write only if the key's current revision equals `expected_revision`.
    async fn put_if(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<u64, StoreError>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// All keys starting with `prefix`, in key order.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, StoreError>;
}
