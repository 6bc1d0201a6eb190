//! ---
//! cmc_section: "01-core-functionality"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Coordinator lifecycle state machine."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
//! The coordinator core.
//!
//! Mutations (`set_manifest`, activation commits, `bootstrap`) serialise on one async
//! lock that also covers sealing and persistence. Every commit first re-reads the store,
//! decides against the freshest state and writes with compare-and-swap on the revision it
//! read. Readers only ever see an immutable [`CoreSnapshot`] that is swapped in after the
//! write succeeded.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cmc_attestation::{CodeIdentity, Issuer, Quote, Validator};
use cmc_common::AppConfig;
use cmc_consensus::ReplicaGate;
use cmc_persistence::{Sealer, StateStore, StoreError, StoredBlob};
use cmc_security::{
    validate_public_key, AuditLog, AuditOutcome, CertificateError, IssuedCertificate, RootIdentity,
};
use parking_lot::{Mutex, RwLock};
use rustls::ServerConfig;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::{watch, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::authority::{bootstrap_root, MeshAuthority};
use crate::errors::{CoreError, DenialReason};
use crate::manifest::Manifest;
use crate::state::{public_key_fingerprint, IssuanceRecord, SealedState};

/// Lifecycle of the coordinator. Only `Ready` serves activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Uninitialized,
    Recovering,
    AwaitingManifest,
    Ready,
}

impl Lifecycle {
    fn for_state(state: &SealedState) -> Self {
        if state.manifest.is_some() {
            Lifecycle::Ready
        } else {
            Lifecycle::AwaitingManifest
        }
    }
}

/// Bootstrap parameters the core needs.
#[derive(Debug, Clone)]
pub struct CoreSettings {
    pub node_name: String,
    pub dns_names: Vec<String>,
    /// Pause before the single retry of an unavailable store at startup.
    pub store_retry_delay: Duration,
}

impl From<&AppConfig> for CoreSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            node_name: config.cluster.node_name.clone(),
            dns_names: config.mesh.dns_names.clone(),
            store_retry_delay: Duration::from_secs(2),
        }
    }
}

/// Capabilities injected into the core.
pub struct CoreDependencies {
    pub validator: Arc<dyn Validator>,
    pub issuer: Arc<dyn Issuer>,
    pub sealer: Arc<dyn Sealer>,
    pub store: Arc<dyn StateStore>,
    pub gate: Arc<dyn ReplicaGate>,
    pub audit: Option<AuditLog>,
}

/// Immutable view published to readers.
#[derive(Debug)]
pub struct CoreSnapshot {
    pub lifecycle: Lifecycle,
    pub revision: u64,
    pub state: SealedState,
    authority: Option<Arc<MeshAuthority>>,
}

/// Activation input from a mesh member.
#[derive(Debug, Clone)]
pub struct ActivationRequest {
    pub quote: Quote,
    /// SEC1 uncompressed P-256 public key.
    pub public_key: Vec<u8>,
    pub package: Option<String>,
}

/// Successful activation.
#[derive(Debug, Clone)]
pub struct ActivationGrant {
    pub id: Uuid,
    pub package: String,
    pub certificate: IssuedCertificate,
    pub root_certificate_der: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoreStatus {
    pub node: String,
    pub lifecycle: Lifecycle,
    pub revision: u64,
    pub manifest_digest: Option<String>,
    pub root_fingerprint: Option<String>,
    pub issued_certificates: usize,
}

/// Root certificate together with a quote over its SHA-256.
#[derive(Debug, Clone)]
pub struct CoordinatorQuote {
    pub root_certificate_pem: String,
    pub quote: Quote,
}

/// An issued but not yet recorded activation; holds the mutation lock.
struct PendingActivation<'a> {
    _guard: MutexGuard<'a, ()>,
    base: Arc<CoreSnapshot>,
    authority: Arc<MeshAuthority>,
    record: IssuanceRecord,
    certificate: IssuedCertificate,
}

pub struct Core {
    settings: CoreSettings,
    validator: Arc<dyn Validator>,
    issuer: Arc<dyn Issuer>,
    sealer: Arc<dyn Sealer>,
    store: Arc<dyn StateStore>,
    gate: Arc<dyn ReplicaGate>,
    audit: Option<Mutex<AuditLog>>,
    mutation: tokio::sync::Mutex<()>,
    snapshot: RwLock<Arc<CoreSnapshot>>,
    quote_cache: Mutex<Option<(String, Quote)>>,
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("node", &self.settings.node_name)
            .field("lifecycle", &self.snapshot().lifecycle)
            .finish_non_exhaustive()
    }
}

impl Core {
    /// Load or bootstrap the mesh state.
    ///
    /// Absent state bootstraps a root and leaves the core awaiting a manifest. Tampered
    /// state and unknown schema versions are hard errors.
    pub async fn new(settings: CoreSettings, deps: CoreDependencies) -> Result<Self, CoreError> {
        let core = Self {
            settings,
            validator: deps.validator,
            issuer: deps.issuer,
            sealer: deps.sealer,
            store: deps.store,
            gate: deps.gate,
            audit: deps.audit.map(Mutex::new),
            mutation: tokio::sync::Mutex::new(()),
            snapshot: RwLock::new(Arc::new(CoreSnapshot {
                lifecycle: Lifecycle::Uninitialized,
                revision: 0,
                state: SealedState::default(),
                authority: None,
            })),
            quote_cache: Mutex::new(None),
        };

        let _guard = core.mutation.lock().await;
        let loaded = core.load_with_retry().await?;
        if loaded.is_some() {
            core.set_lifecycle(Lifecycle::Recovering);
        }
        if let Err(err) = core.adopt(loaded) {
            if matches!(err, CoreError::TamperedOrWrongKey) {
                core.audit("state.unseal", AuditOutcome::Denied, json!({ "error": err.to_string() }));
            }
            return Err(err);
        }
        core.bootstrap_locked().await?;
        let snapshot = core.snapshot();
        info!(node = %core.settings.node_name, state = ?snapshot.lifecycle, revision = snapshot.revision, issued = snapshot.state.issuances.len(), "coordinator core initialised");
        drop(_guard);
        Ok(core)
    }

    pub fn snapshot(&self) -> Arc<CoreSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.snapshot().lifecycle
    }

    fn set_lifecycle(&self, lifecycle: Lifecycle) {
        let mut current = self.snapshot.write();
        if current.lifecycle != lifecycle {
            info!(node = %self.settings.node_name, from = ?current.lifecycle, to = ?lifecycle, "lifecycle transition");
        }
        *current = Arc::new(CoreSnapshot {
            lifecycle,
            revision: current.revision,
            state: current.state.clone(),
            authority: current.authority.clone(),
        });
    }

    async fn load_with_retry(&self) -> Result<Option<StoredBlob>, CoreError> {
        match self.store.load().await {
            Err(StoreError::Unavailable(reason)) => {
                warn!(node = %self.settings.node_name, error = %reason, "state store unavailable; retrying once");
                tokio::time::sleep(self.settings.store_retry_delay).await;
                Ok(self.store.load().await?)
            }
            other => Ok(other?),
        }
    }

    /// Swap in the state held by `blob`, reusing the authority when the root is unchanged.
    fn adopt(&self, blob: Option<StoredBlob>) -> Result<Arc<CoreSnapshot>, CoreError> {
        let (revision, state) = match blob {
            Some(blob) => (blob.revision, SealedState::unseal(&blob.bytes, self.sealer.as_ref())?),
            None => (0, SealedState::default()),
        };
        self.publish(revision, state)
    }

    fn publish(&self, revision: u64, state: SealedState) -> Result<Arc<CoreSnapshot>, CoreError> {
        let current = self.snapshot();
        let authority = match (&state.root, &current.authority) {
            (Some(root), Some(authority)) if authority.root() == root => Some(authority.clone()),
            (Some(root), _) => Some(Arc::new(MeshAuthority::new(
                root.clone(),
                &self.settings.dns_names,
            )?)),
            (None, _) => None,
        };
        let lifecycle = if state.root.is_some() {
            Lifecycle::for_state(&state)
        } else {
            current.lifecycle
        };
        if lifecycle != current.lifecycle {
            info!(node = %self.settings.node_name, from = ?current.lifecycle, to = ?lifecycle, revision, "lifecycle transition");
        }
        let snapshot = Arc::new(CoreSnapshot {
            lifecycle,
            revision,
            state,
            authority,
        });
        *self.snapshot.write() = snapshot.clone();
        Ok(snapshot)
    }

    /// Read-before-decide: pick up writes made by other replicas. Caller holds the mutation lock.
    async fn refresh_locked(&self) -> Result<Arc<CoreSnapshot>, CoreError> {
        let current = self.snapshot();
        match self.store.load().await? {
            Some(blob) if blob.revision == current.revision => Ok(current),
            Some(blob) => {
                debug!(node = %self.settings.node_name, from = current.revision, to = blob.revision, "refreshing stale local state");
                self.adopt(Some(blob))
            }
            None if current.revision == 0 => Ok(current),
            None => Err(CoreError::StaleReplica(
                "sealed state disappeared from the store".into(),
            )),
        }
    }

    /// Seal and write `state` on top of `base`, then publish it. Caller holds the mutation lock.
    async fn commit_locked(
        &self,
        base: &CoreSnapshot,
        state: SealedState,
    ) -> Result<Arc<CoreSnapshot>, CoreError> {
        let blob = state.seal(self.sealer.as_ref())?;
        let revision = self.store.save(base.revision, blob).await?;
        self.publish(revision, state)
    }

    fn ensure_writable(&self) -> Result<(), CoreError> {
        if self.gate.writable() {
            Ok(())
        } else {
            Err(CoreError::StaleReplica(
                "replica has no quorum in the consensus cluster".into(),
            ))
        }
    }

    async fn bootstrap_locked(&self) -> Result<RootIdentity, CoreError> {
        let base = self.refresh_locked().await?;
        if let Some(root) = &base.state.root {
            return Ok(root.clone());
        }
        // Not gated on quorum: the compare-and-swap below lets exactly one replica win.
        let mut state = base.state.clone();
        state.root = Some(bootstrap_root(None)?);
        match self.commit_locked(&base, state).await {
            Ok(snapshot) => {
                let root = snapshot.state.root.clone().ok_or_else(|| {
                    CoreError::CorruptState("committed state lost its root".into())
                })?;
                self.audit("root.bootstrap", AuditOutcome::Granted, json!({ "fingerprint": root.fingerprint() }));
                Ok(root)
            }
            Err(CoreError::StaleReplica(reason)) => {
                // Another replica bootstrapped first; adopt its root.
                debug!(node = %self.settings.node_name, %reason, "lost bootstrap race");
                let snapshot = self.refresh_locked().await?;
                snapshot.state.root.clone().ok_or(CoreError::StaleReplica(reason))
            }
            Err(err) => Err(err),
        }
    }

    /// Generate the mesh root once. Later calls return the identical root.
    pub async fn bootstrap(&self) -> Result<RootIdentity, CoreError> {
        let _guard = self.mutation.lock().await;
        self.bootstrap_locked().await
    }

    /// Re-read the store and adopt writes made by other replicas.
    pub async fn refresh(&self) -> Result<Arc<CoreSnapshot>, CoreError> {
        let _guard = self.mutation.lock().await;
        self.refresh_locked().await
    }

    /// Keep the local cache following the shared store until `shutdown` flips to true.
    ///
    /// Failed refreshes are logged and retried on the next tick; they never end the loop.
    pub async fn run_refresh(
        self: Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), CoreError> {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.refresh().await {
                        warn!(node = %self.settings.node_name, error = %err, "state refresh failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Accept the mesh manifest. Only possible while awaiting one.
    pub async fn set_manifest(&self, manifest: Manifest) -> Result<String, CoreError> {
        let _guard = self.mutation.lock().await;
        let base = self.refresh_locked().await?;
        match base.lifecycle {
            Lifecycle::AwaitingManifest => {}
            Lifecycle::Ready => return Err(CoreError::AlreadyInitialized),
            other => return Err(CoreError::NotReady(other)),
        }
        manifest.validate()?;
        self.ensure_writable()?;

        let mut state = base.state.clone();
        state.root = Some(bootstrap_root(state.root.as_ref())?);
        let digest = manifest.digest();
        let packages = manifest.packages.len();
        state.manifest = Some(manifest);
        state.manifest_digest = Some(digest.clone());
        self.commit_locked(&base, state).await?;

        self.audit("manifest.set", AuditOutcome::Granted, json!({ "digest": digest, "packages": packages }));
        info!(node = %self.settings.node_name, digest = %digest, packages, "manifest accepted");
        Ok(digest)
    }

    /// Verify a member's quote and issue its certificate.
    ///
    /// The attestation round trip runs without the mutation lock. `deadline` bounds
    /// everything up to the commit: past it the call returns [`CoreError::Timeout`] and
    /// nothing is recorded. Once sealing and persistence start they run to completion and
    /// the grant is returned.
    pub async fn activate(
        &self,
        request: ActivationRequest,
        deadline: Instant,
    ) -> Result<ActivationGrant, CoreError> {
        let result = self.activate_before(&request, deadline).await;
        match &result {
            Ok(grant) => {
                info!(node = %self.settings.node_name, package = %grant.package, serial = grant.certificate.serial, expires_at = %grant.certificate.not_after, "activation granted");
            }
            Err(CoreError::ActivationDenied(reason)) => {
                warn!(node = %self.settings.node_name, reason = reason.kind(), error = %reason, "activation denied");
                self.audit(
                    "activation",
                    AuditOutcome::Denied,
                    json!({
                        "reason": reason.kind(),
                        "detail": reason.to_string(),
                        "requested_package": request.package,
                        "public_key_fingerprint": public_key_fingerprint(&request.public_key),
                    }),
                );
            }
            Err(err) => {
                debug!(node = %self.settings.node_name, error = %err, "activation failed");
            }
        }
        result
    }

    async fn activate_before(
        &self,
        request: &ActivationRequest,
        deadline: Instant,
    ) -> Result<ActivationGrant, CoreError> {
        let pending = match tokio::time::timeout_at(deadline, self.prepare_activation(request)).await {
            Ok(pending) => pending?,
            Err(_) => return Err(CoreError::Timeout),
        };
        // Last point at which the caller's deadline is honoured; dropping `pending`
        // releases the lock with nothing written.
        if Instant::now() >= deadline {
            return Err(CoreError::Timeout);
        }
        self.commit_activation(pending).await
    }

    /// Steps (1) to (3): everything that may be abandoned without side effects.
    async fn prepare_activation(
        &self,
        request: &ActivationRequest,
    ) -> Result<PendingActivation<'_>, CoreError> {
        let mut view = self.snapshot();
        if view.lifecycle != Lifecycle::Ready {
            // Another replica may have accepted the manifest since this cache was filled.
            view = self.refresh().await?;
        }
        let manifest = match (&view.lifecycle, &view.state.manifest) {
            (Lifecycle::Ready, Some(manifest)) => manifest.clone(),
            (lifecycle, _) => return Err(CoreError::NotReady(*lifecycle)),
        };

        // (1) attestation, no lock held
        let identity = self
            .validator
            .validate(&request.quote, &manifest.measurements())
            .await?;

        // (2) key binding and manifest lookup
        validate_public_key(&request.public_key).map_err(|err| {
            let reason = match err {
                CertificateError::InvalidPublicKey(reason) => reason,
                other => other.to_string(),
            };
            CoreError::ActivationDenied(DenialReason::InvalidPublicKey(reason))
        })?;
        let expected_payload = Sha256::digest(&request.public_key);
        if identity.payload.as_slice() != expected_payload.as_slice() {
            return Err(CoreError::ActivationDenied(DenialReason::KeyBindingMismatch));
        }
        let package = match manifest.package_for(&identity.measurement) {
            Some((name, _)) => name.to_owned(),
            None => {
                return Err(CoreError::ActivationDenied(DenialReason::PolicyDenied(
                    identity.measurement,
                )))
            }
        };
        if let Some(requested) = &request.package {
            if requested != &package {
                return Err(CoreError::ActivationDenied(DenialReason::PackageMismatch {
                    requested: requested.clone(),
                    actual: package,
                }));
            }
        }

        // (3) decide under the mutation lock against fresh state
        let guard = self.mutation.lock().await;
        let base = self.refresh_locked().await?;
        self.ensure_writable()?;
        let (authority, manifest) = match (&base.authority, &base.state.manifest) {
            (Some(authority), Some(manifest)) if base.lifecycle == Lifecycle::Ready => {
                (authority.clone(), manifest)
            }
            _ => return Err(CoreError::NotReady(base.lifecycle)),
        };
        self.check_limit(&base.state, manifest, &identity, &package)?;
        let serial = base.state.next_serial;
        let certificate = authority.issue_leaf(manifest, &identity, &request.public_key, serial)?;
        let record = IssuanceRecord {
            id: Uuid::new_v4(),
            serial,
            package: package.clone(),
            measurement: identity.measurement,
            public_key_fingerprint: public_key_fingerprint(&request.public_key),
            certificate_der: certificate.der.clone(),
            issued_at: Utc::now(),
            expires_at: certificate.not_after,
        };
        Ok(PendingActivation {
            _guard: guard,
            base,
            authority,
            record,
            certificate,
        })
    }

    /// Steps (4) and (5): record, seal, persist and hand out the grant.
    async fn commit_activation(
        &self,
        pending: PendingActivation<'_>,
    ) -> Result<ActivationGrant, CoreError> {
        let PendingActivation {
            _guard,
            base,
            authority,
            record,
            certificate,
        } = pending;
        let id = record.id;
        let package = record.package.clone();
        let mut state = base.state.clone();
        state.next_serial = record.serial + 1;
        state.issuances.push(record);
        self.commit_locked(&base, state).await?;

        Ok(ActivationGrant {
            id,
            package,
            certificate,
            root_certificate_der: authority.root().certificate_der.clone(),
        })
    }

    fn check_limit(
        &self,
        state: &SealedState,
        manifest: &Manifest,
        identity: &CodeIdentity,
        package: &str,
    ) -> Result<(), CoreError> {
        let Some((_, policy)) = manifest.package_for(&identity.measurement) else {
            return Err(CoreError::ActivationDenied(DenialReason::PolicyDenied(
                identity.measurement,
            )));
        };
        if let Some(limit) = policy.max_activations {
            if state.activations_for(package) >= limit as usize {
                return Err(CoreError::ActivationDenied(
                    DenialReason::ActivationLimitReached {
                        package: package.to_owned(),
                        limit,
                    },
                ));
            }
        }
        Ok(())
    }

    /// TLS configuration presenting the coordinator's certificate.
    pub fn get_tls_config(&self) -> Result<Arc<ServerConfig>, CoreError> {
        let snapshot = self.snapshot();
        snapshot
            .authority
            .as_ref()
            .map(|authority| authority.server_tls_config())
            .ok_or(CoreError::NotReady(snapshot.lifecycle))
    }

    pub fn status(&self) -> CoreStatus {
        let snapshot = self.snapshot();
        CoreStatus {
            node: self.settings.node_name.clone(),
            lifecycle: snapshot.lifecycle,
            revision: snapshot.revision,
            manifest_digest: snapshot.state.manifest_digest.clone(),
            root_fingerprint: snapshot.state.root.as_ref().map(RootIdentity::fingerprint),
            issued_certificates: snapshot.state.issuances.len(),
        }
    }

    pub fn manifest(&self) -> Result<Manifest, CoreError> {
        let snapshot = self.snapshot();
        snapshot
            .state
            .manifest
            .clone()
            .ok_or(CoreError::NotReady(snapshot.lifecycle))
    }

    pub fn root_certificate(&self) -> Result<RootIdentity, CoreError> {
        let snapshot = self.snapshot();
        snapshot
            .state
            .root
            .clone()
            .ok_or(CoreError::NotReady(snapshot.lifecycle))
    }

    pub fn issuances(&self) -> Vec<IssuanceRecord> {
        self.snapshot().state.issuances.clone()
    }

    /// Quote binding the SHA-256 of the root certificate to the coordinator's measurement.
    pub async fn coordinator_quote(&self) -> Result<CoordinatorQuote, CoreError> {
        let root = self.root_certificate()?;
        let fingerprint = root.fingerprint();
        let cached = self
            .quote_cache
            .lock()
            .as_ref()
            .filter(|(cached_for, _)| cached_for == &fingerprint)
            .map(|(_, quote)| quote.clone());
        let quote = match cached {
            Some(quote) => quote,
            None => {
                let digest = Sha256::digest(&root.certificate_der);
                let quote = self.issuer.issue(&digest).await?;
                *self.quote_cache.lock() = Some((fingerprint, quote.clone()));
                quote
            }
        };
        Ok(CoordinatorQuote {
            root_certificate_pem: root.certificate_pem(),
            quote,
        })
    }

    fn audit(&self, action: &str, outcome: AuditOutcome, detail: serde_json::Value) {
        if let Some(audit) = &self.audit {
            if let Err(err) = audit.lock().record(action, outcome, detail) {
                warn!(node = %self.settings.node_name, action, error = %err, "failed to write audit entry");
            }
        }
    }
}
