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
use std::time::Duration;

use chrono::{DateTime, Utc};
use cmc_common::ClusterConfig;
use cmc_persistence::StoreError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::store::{ConsensusStore, LEADER_KEY, MEMBERS_PREFIX};

/// Membership record each replica keeps fresh in the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberRecord {
    pub node_name: String,
    pub namespace: String,
    pub cluster_name: String,
    pub cluster_size: u32,
    pub joined_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

/// Time-bounded claim on cluster leadership.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaderLease {
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

/// Snapshot of this replica's view of the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipStatus {
    pub node: String,
    pub leader: Option<String>,
    pub is_leader: bool,
    pub live_members: Vec<String>,
    pub expected_size: u32,
    pub has_quorum: bool,
}

impl MembershipStatus {
    fn initial(node: &str, expected_size: u32) -> Self {
        Self {
            node: node.to_owned(),
            leader: None,
            is_leader: false,
            live_members: Vec::new(),
            expected_size,
            has_quorum: false,
        }
    }
}

/// Identity and timing of one replica.
#[derive(Debug, Clone)]
pub struct MembershipSettings {
    pub node_name: String,
    pub namespace: String,
    pub cluster_name: String,
    pub cluster_size: u32,
    pub heartbeat_interval: Duration,
    pub member_ttl: Duration,
    pub leader_lease: Duration,
}

impl From<&ClusterConfig> for MembershipSettings {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            node_name: config.node_name.clone(),
            namespace: config.namespace.clone(),
            cluster_name: config.cluster_name.clone(),
            cluster_size: config.cluster_size,
            heartbeat_interval: config.heartbeat_interval,
            member_ttl: config.member_ttl,
            leader_lease: config.leader_lease,
        }
    }
}

fn quorum(expected_size: u32) -> usize {
    expected_size as usize / 2 + 1
}

fn codec_error(err: serde_json::Error) -> StoreError {
    StoreError::Codec(err.to_string())
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(3650))
}

/// Keeps this replica registered, tracks live peers and contends for the leader lease.
pub struct Membership {
    store: Arc<dyn ConsensusStore>,
    settings: MembershipSettings,
    joined_at: Mutex<Option<DateTime<Utc>>>,
    status: watch::Sender<MembershipStatus>,
}

impl Membership {
    pub fn new(store: Arc<dyn ConsensusStore>, settings: MembershipSettings) -> Self {
        let (status, _) = watch::channel(MembershipStatus::initial(
            &settings.node_name,
            settings.cluster_size,
        ));
        Self {
            store,
            settings,
            joined_at: Mutex::new(None),
            status,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.settings.node_name
    }

    pub fn subscribe(&self) -> watch::Receiver<MembershipStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> MembershipStatus {
        self.status.borrow().clone()
    }

    /// Gate reflecting the latest published status.
    pub fn gate(&self) -> MembershipGate {
        MembershipGate {
            status: self.subscribe(),
        }
    }

    fn member_key(&self) -> String {
        format!("{}{}", MEMBERS_PREFIX, self.settings.node_name)
    }

    async fn write_record(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let joined_at = *self.joined_at.lock().get_or_insert(now);
        let record = MemberRecord {
            node_name: self.settings.node_name.clone(),
            namespace: self.settings.namespace.clone(),
            cluster_name: self.settings.cluster_name.clone(),
            cluster_size: self.settings.cluster_size,
            joined_at,
            heartbeat_at: now,
        };
        let bytes = serde_json::to_vec(&record).map_err(codec_error)?;
        self.store.put(&self.member_key(), bytes).await?;
        Ok(())
    }

    /// Register this replica.
    pub async fn join(&self) -> Result<(), StoreError> {
        self.write_record(Utc::now()).await?;
        info!(node = %self.settings.node_name, cluster = %self.settings.cluster_name, size = self.settings.cluster_size, "joined consensus cluster");
        Ok(())
    }

    /// Heartbeat, refresh the member view and the leader lease, then publish the status.
    pub async fn tick(&self) -> Result<MembershipStatus, StoreError> {
        self.tick_at(Utc::now()).await
    }

    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<MembershipStatus, StoreError> {
        self.write_record(now).await?;

        let ttl = chrono_duration(self.settings.member_ttl);
        let mut live_members = Vec::new();
        for (key, entry) in self.store.list(MEMBERS_PREFIX).await? {
            match serde_json::from_slice::<MemberRecord>(&entry.value) {
                Ok(record) if now - record.heartbeat_at <= ttl => {
                    live_members.push(record.node_name)
                }
                Ok(record) => {
                    debug!(member = %record.node_name, last_seen = %record.heartbeat_at, "member heartbeat expired")
                }
                Err(err) => warn!(key = %key, error = %err, "ignoring malformed member record"),
            }
        }
        live_members.sort();

        let leader = self.refresh_lease(now).await?;
        let status = MembershipStatus {
            node: self.settings.node_name.clone(),
            is_leader: leader.as_deref() == Some(self.settings.node_name.as_str()),
            leader,
            has_quorum: live_members.len() >= quorum(self.settings.cluster_size),
            live_members,
            expected_size: self.settings.cluster_size,
        };
        self.publish(status.clone());
        Ok(status)
    }

    async fn refresh_lease(&self, now: DateTime<Utc>) -> Result<Option<String>, StoreError> {
        let current = self.store.get(LEADER_KEY).await?;
        let (expected_revision, lease) = match &current {
            Some(entry) => (
                entry.revision,
                serde_json::from_slice::<LeaderLease>(&entry.value).ok(),
            ),
            None => (0, None),
        };
        if let Some(lease) = &lease {
            if lease.holder != self.settings.node_name && lease.expires_at > now {
                return Ok(Some(lease.holder.clone()));
            }
        }

        let renewed = LeaderLease {
            holder: self.settings.node_name.clone(),
            expires_at: now + chrono_duration(self.settings.leader_lease),
        };
        let bytes = serde_json::to_vec(&renewed).map_err(codec_error)?;
        match self.store.put_if(LEADER_KEY, expected_revision, bytes).await {
            Ok(_) => {
                let previous = lease.map(|lease| lease.holder);
                if previous.as_deref() != Some(self.settings.node_name.as_str()) {
                    info!(node = %self.settings.node_name, ?previous, "acquired leader lease");
                }
                Ok(Some(renewed.holder))
            }
            Err(StoreError::Conflict { .. }) => {
                let winner = self
                    .store
                    .get(LEADER_KEY)
                    .await?
                    .and_then(|entry| serde_json::from_slice::<LeaderLease>(&entry.value).ok())
                    .map(|lease| lease.holder);
                debug!(node = %self.settings.node_name, leader = ?winner, "lost leader lease race");
                Ok(winner)
            }
            Err(err) => Err(err),
        }
    }

    fn publish(&self, status: MembershipStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            if current.has_quorum != status.has_quorum {
                if status.has_quorum {
                    info!(node = %status.node, live = status.live_members.len(), expected = status.expected_size, "cluster quorum reached");
                } else {
                    warn!(node = %status.node, live = status.live_members.len(), expected = status.expected_size, "cluster quorum lost");
                }
            }
            *current = status;
            true
        });
    }

    fn mark_unreachable(&self) {
        let mut status = self.status();
        status.has_quorum = false;
        status.is_leader = false;
        self.publish(status);
    }

    /// Remove this replica's record and release the lease if held.
    pub async fn leave(&self) -> Result<(), StoreError> {
        self.store.delete(&self.member_key()).await?;
        if let Some(entry) = self.store.get(LEADER_KEY).await? {
            if let Ok(lease) = serde_json::from_slice::<LeaderLease>(&entry.value) {
                if lease.holder == self.settings.node_name {
                    self.store.delete(LEADER_KEY).await?;
                }
            }
        }
        self.mark_unreachable();
        info!(node = %self.settings.node_name, "left consensus cluster");
        Ok(())
    }

    /// Run heartbeats until `shutdown` flips to true.
    ///
    /// Store failures are logged and reflected as lost quorum; they never end the loop.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), StoreError> {
        let mut interval = tokio::time::interval(self.settings.heartbeat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut joined = false;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if !joined {
                        match self.join().await {
                            Ok(()) => joined = true,
                            Err(err) => {
                                warn!(node = %self.settings.node_name, error = %err, "unable to join cluster; retrying");
                                self.mark_unreachable();
                                continue;
                            }
                        }
                    }
                    if let Err(err) = self.tick().await {
                        warn!(node = %self.settings.node_name, error = %err, "membership heartbeat failed");
                        self.mark_unreachable();
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        if joined {
            if let Err(err) = self.leave().await {
                warn!(node = %self.settings.node_name, error = %err, "failed to leave cluster cleanly");
            }
        }
        Ok(())
    }
}

/// Decides whether this replica may commit mutations.
pub trait ReplicaGate: Send + Sync {
    fn writable(&self) -> bool;
}

/// Gate for single-node deployments.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleReplica;

impl ReplicaGate for SingleReplica {
    fn writable(&self) -> bool {
        true
    }
}

/// Gate following a [`Membership`] status stream: writable only with quorum.
///
/// Leadership is not required. Every commit is a compare-and-swap on the sealed state
/// revision, so a follower that lost a race gets a conflict and reloads; any replica in the
/// quorum may serve activations.
#[derive(Debug, Clone)]
pub struct MembershipGate {
    status: watch::Receiver<MembershipStatus>,
}

impl ReplicaGate for MembershipGate {
    fn writable(&self) -> bool {
        self.status.borrow().has_quorum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryConsensusStore;

    fn settings(node: &str, size: u32) -> MembershipSettings {
        MembershipSettings {
            node_name: node.into(),
            namespace: "mesh".into(),
            cluster_name: "coordinator".into(),
            cluster_size: size,
            heartbeat_interval: Duration::from_millis(50),
            member_ttl: Duration::from_secs(10),
            leader_lease: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn single_node_has_quorum_and_leads() {
        let store = Arc::new(InMemoryConsensusStore::new());
        let membership = Membership::new(store, settings("c-0", 1));
        membership.join().await.unwrap();
        let status = membership.tick().await.unwrap();
        assert!(status.has_quorum);
        assert!(status.is_leader);
        assert!(membership.gate().writable());
    }

    #[tokio::test]
    async fn quorum_needs_a_majority_of_expected_members() {
        let store = InMemoryConsensusStore::new();
        let a = Membership::new(Arc::new(store.clone()), settings("c-0", 3));
        let b = Membership::new(Arc::new(store.clone()), settings("c-1", 3));

        let alone = a.tick().await.unwrap();
        assert!(!alone.has_quorum);
        assert!(!a.gate().writable());

        b.tick().await.unwrap();
        let together = a.tick().await.unwrap();
        assert_eq!(together.live_members, vec!["c-0".to_string(), "c-1".to_string()]);
        assert!(together.has_quorum);
    }

    #[tokio::test]
    async fn exactly_one_replica_holds_the_lease() {
        let store = InMemoryConsensusStore::new();
        let a = Membership::new(Arc::new(store.clone()), settings("c-0", 3));
        let b = Membership::new(Arc::new(store.clone()), settings("c-1", 3));
        let now = Utc::now();
        let first = a.tick_at(now).await.unwrap();
        let second = b.tick_at(now).await.unwrap();
        assert!(first.is_leader);
        assert!(!second.is_leader);
        assert_eq!(second.leader.as_deref(), Some("c-0"));
    }

    #[tokio::test]
    async fn follower_with_quorum_accepts_writes() {
        let store = InMemoryConsensusStore::new();
        let a = Membership::new(Arc::new(store.clone()), settings("c-0", 3));
        let b = Membership::new(Arc::new(store.clone()), settings("c-1", 3));
        let now = Utc::now();
        a.tick_at(now).await.unwrap();
        let status = b.tick_at(now).await.unwrap();
        assert!(!status.is_leader);
        assert!(status.has_quorum);
        assert!(b.gate().writable());
    }

    #[tokio::test]
    async fn expired_members_and_leases_are_taken_over() {
        let store = InMemoryConsensusStore::new();
        let a = Membership::new(Arc::new(store.clone()), settings("c-0", 3));
        let b = Membership::new(Arc::new(store.clone()), settings("c-1", 3));
        let start = Utc::now();
        a.tick_at(start).await.unwrap();

        let later = start + chrono::Duration::seconds(30);
        let status = b.tick_at(later).await.unwrap();
        assert_eq!(status.live_members, vec!["c-1".to_string()]);
        assert!(status.is_leader);
        assert!(!status.has_quorum);
    }

    #[tokio::test]
    async fn store_outage_clears_quorum_and_run_stops_on_shutdown() {
        let store = InMemoryConsensusStore::new();
        let membership = Arc::new(Membership::new(Arc::new(store.clone()), settings("c-0", 1)));
        let mut status = membership.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(membership.clone().run(shutdown_rx));

        status.wait_for(|status| status.has_quorum).await.unwrap();
        store.set_available(false);
        status.wait_for(|status| !status.has_quorum).await.unwrap();
        store.set_available(true);
        status.wait_for(|status| status.has_quorum).await.unwrap();

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert!(store.list(MEMBERS_PREFIX).await.unwrap().is_empty());
    }
}
