//! ---
//! cmc_section: "07-resilience-fault-tolerance"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Consensus store access and replica membership."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
//! Consensus layer for coordinator replicas.
//!
//! Replicas never talk to each other directly. They share a linearizable key-value store
//! which holds the sealed mesh state, one membership record per replica and a leader lease.

mod etcd;
mod memory;
mod membership;
mod shared_state;
mod store;

pub use etcd::EtcdGatewayStore;
pub use memory::InMemoryConsensusStore;
pub use membership::{
    LeaderLease, MemberRecord, Membership, MembershipGate, MembershipSettings, MembershipStatus,
    ReplicaGate, SingleReplica,
};
pub use shared_state::ClusterStateStore;
pub use store::{ConsensusStore, Versioned, LEADER_KEY, MEMBERS_PREFIX, MESH_STATE_KEY};

pub use cmc_persistence::StoreError;
