//! ---
//! cmc_section: "01-core-functionality"
//! cmc_subsection: "tests"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Coordinator core lifecycle and activation tests."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cmc_attestation::{
    AttestationError, CodeIdentity, Measurement, Quote, SimulationIssuer, SimulationRoot,
    SimulationValidator, Validator,
};
use cmc_consensus::{ClusterStateStore, InMemoryConsensusStore, ReplicaGate, SingleReplica};
use cmc_core::{
    ActivationRequest, CertificateTemplate, Core, CoreDependencies, CoreError, CoreSettings,
    DenialReason, Lifecycle, Manifest, PackagePolicy,
};
use cmc_persistence::{AesGcmSealer, LocalSealedStore, StateStore, StoreError, StoredBlob};
use cmc_security::{inspect_certificate, verify_signed_by, AuditLog, AuditOutcome};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::time::Instant;

const SEAL_KEY: [u8; 32] = [7; 32];

fn root() -> SimulationRoot {
    SimulationRoot::new([42; 32])
}

fn member(name: &str) -> SimulationIssuer {
    SimulationIssuer::new(root(), Measurement::digest_of(name.as_bytes()))
}

fn manifest() -> Manifest {
    let mut packages = BTreeMap::new();
    packages.insert(
        "frontend".to_string(),
        PackagePolicy {
            measurement: Measurement::digest_of(b"frontend"),
            max_activations: None,
            certificate: CertificateTemplate {
                common_name: "frontend".into(),
                dns_names: vec!["frontend.mesh.local".into()],
                ttl_secs: 3600,
            },
        },
    );
    packages.insert(
        "bootstrapper".to_string(),
        PackagePolicy {
            measurement: Measurement::digest_of(b"bootstrapper"),
            max_activations: Some(1),
            certificate: CertificateTemplate {
                common_name: "bootstrapper".into(),
                dns_names: vec![],
                ttl_secs: 600,
            },
        },
    );
    Manifest {
        packages,
        max_certificate_ttl_secs: 86_400,
    }
}

fn member_key() -> Vec<u8> {
    let rng = SystemRandom::new();
    let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng).unwrap();
    EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
        .unwrap()
        .public_key()
        .as_ref()
        .to_vec()
}

async fn request_for(package: &str, public_key: Vec<u8>) -> ActivationRequest {
    use cmc_attestation::Issuer;
    let quote = member(package)
        .issue(&Sha256::digest(&public_key))
        .await
        .unwrap();
    ActivationRequest {
        quote,
        public_key,
        package: None,
    }
}

fn soon() -> Instant {
    Instant::now() + Duration::from_secs(10)
}

#[derive(Default)]
struct Switch(AtomicBool);

impl ReplicaGate for Switch {
    fn writable(&self) -> bool {
        !self.0.load(Ordering::SeqCst)
    }
}

/// Acknowledges writes only after `delay`, once the inner store has persisted them.
struct SlowAckStore {
    inner: LocalSealedStore,
    delay: Duration,
}

#[async_trait]
impl StateStore for SlowAckStore {
    async fn load(&self) -> Result<Option<StoredBlob>, StoreError> {
        self.inner.load().await
    }

    async fn save(&self, expected_revision: u64, bytes: Vec<u8>) -> Result<u64, StoreError> {
        let revision = self.inner.save(expected_revision, bytes).await?;
        tokio::time::sleep(self.delay).await;
        Ok(revision)
    }
}

/// Attestation service that answers after `delay`.
struct SlowValidator {
    inner: SimulationValidator,
    delay: Duration,
}

#[async_trait]
impl Validator for SlowValidator {
    async fn validate(
        &self,
        quote: &Quote,
        expected: &[Measurement],
    ) -> Result<CodeIdentity, AttestationError> {
        tokio::time::sleep(self.delay).await;
        self.inner.validate(quote, expected).await
    }
}

fn fast_validator() -> Arc<dyn Validator> {
    Arc::new(SimulationValidator::new(root(), Duration::from_secs(300)))
}

async fn core_with(
    store: Arc<dyn StateStore>,
    gate: Arc<dyn ReplicaGate>,
    key: [u8; 32],
    audit_dir: Option<&Path>,
) -> Result<Core, CoreError> {
    core_with_validator(store, gate, fast_validator(), key, audit_dir).await
}

async fn core_with_validator(
    store: Arc<dyn StateStore>,
    gate: Arc<dyn ReplicaGate>,
    validator: Arc<dyn Validator>,
    key: [u8; 32],
    audit_dir: Option<&Path>,
) -> Result<Core, CoreError> {
    let audit = audit_dir.map(|dir| AuditLog::open(dir.join("audit.log"), "node-0").unwrap());
    Core::new(
        CoreSettings {
            node_name: "node-0".into(),
            dns_names: vec!["localhost".into()],
            store_retry_delay: Duration::from_millis(10),
        },
        CoreDependencies {
            validator,
            issuer: Arc::new(member("coordinator")),
            sealer: Arc::new(AesGcmSealer::new(&key).unwrap()),
            store,
            gate,
            audit,
        },
    )
    .await
}

async fn local_core(dir: &Path) -> Core {
    let store = Arc::new(LocalSealedStore::open(dir).unwrap());
    core_with(store, Arc::new(SingleReplica), SEAL_KEY, Some(dir))
        .await
        .unwrap()
}

async fn replica_of(shared: &InMemoryConsensusStore) -> Core {
    core_with(
        Arc::new(ClusterStateStore::new(Arc::new(shared.clone()))),
        Arc::new(SingleReplica),
        SEAL_KEY,
        None,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn empty_seal_dir_awaits_manifest_with_a_root() {
    let dir = TempDir::new().unwrap();
    let core = local_core(dir.path()).await;

    assert_eq!(core.lifecycle(), Lifecycle::AwaitingManifest);
    assert!(core.root_certificate().is_ok());
    assert!(core.get_tls_config().is_ok());
    assert!(matches!(core.manifest(), Err(CoreError::NotReady(Lifecycle::AwaitingManifest))));
    assert!(dir.path().join("sealed_state").exists());
}

#[tokio::test]
async fn manifest_is_immutable_once_set() {
    let dir = TempDir::new().unwrap();
    let core = local_core(dir.path()).await;

    let digest = core.set_manifest(manifest()).await.unwrap();
    assert_eq!(core.lifecycle(), Lifecycle::Ready);
    assert_eq!(core.status().manifest_digest, Some(digest));

    let err = core.set_manifest(manifest()).await.unwrap_err();
    assert!(matches!(err, CoreError::AlreadyInitialized));
    let mut different = manifest();
    different.max_certificate_ttl_secs = 7200;
    let err = core.set_manifest(different).await.unwrap_err();
    assert!(matches!(err, CoreError::AlreadyInitialized));
}

#[tokio::test]
async fn invalid_manifest_keeps_waiting() {
    let dir = TempDir::new().unwrap();
    let core = local_core(dir.path()).await;
    let mut broken = manifest();
    broken.max_certificate_ttl_secs = 0;

    let err = core.set_manifest(broken).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidManifest(_)));
    assert_eq!(core.lifecycle(), Lifecycle::AwaitingManifest);
}

#[tokio::test]
async fn activation_requires_a_manifest() {
    let dir = TempDir::new().unwrap();
    let core = local_core(dir.path()).await;
    let err = core
        .activate(request_for("frontend", member_key()).await, soon())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotReady(Lifecycle::AwaitingManifest)));
}

#[tokio::test]
async fn activation_issues_measurement_bound_certificate() {
    let dir = TempDir::new().unwrap();
    let core = local_core(dir.path()).await;
    core.set_manifest(manifest()).await.unwrap();

    let grant = core
        .activate(request_for("frontend", member_key()).await, soon())
        .await
        .unwrap();
    assert_eq!(grant.package, "frontend");

    let info = inspect_certificate(&grant.certificate.der).unwrap();
    assert_eq!(info.measurement, Some(*Measurement::digest_of(b"frontend").as_bytes()));
    assert!(info.dns_names.contains(&"frontend.mesh.local".to_string()));
    assert!(info.not_after - info.not_before <= 3600 + 60);

    let root_key = core.root_certificate().unwrap().public_key().unwrap();
    assert!(verify_signed_by(&grant.certificate.der, &root_key).unwrap());
    assert_eq!(core.issuances().len(), 1);
}

#[tokio::test]
async fn denials_leave_no_trace_in_state() {
    let dir = TempDir::new().unwrap();
    let core = local_core(dir.path()).await;
    core.set_manifest(manifest()).await.unwrap();

    let unknown = core
        .activate(request_for("intruder", member_key()).await, soon())
        .await
        .unwrap_err();
    assert!(matches!(
        unknown,
        CoreError::ActivationDenied(DenialReason::MeasurementMismatch(_))
    ));

    let mut swapped = request_for("frontend", member_key()).await;
    swapped.public_key = member_key();
    let binding = core.activate(swapped, soon()).await.unwrap_err();
    assert!(matches!(
        binding,
        CoreError::ActivationDenied(DenialReason::KeyBindingMismatch)
    ));

    let mut wrong_package = request_for("frontend", member_key()).await;
    wrong_package.package = Some("bootstrapper".into());
    let mismatch = core.activate(wrong_package, soon()).await.unwrap_err();
    assert!(matches!(
        mismatch,
        CoreError::ActivationDenied(DenialReason::PackageMismatch { .. })
    ));

    let garbage = ActivationRequest {
        quote: Quote::new(vec![1, 2, 3]),
        public_key: member_key(),
        package: None,
    };
    let rejected = core.activate(garbage, soon()).await.unwrap_err();
    assert!(matches!(
        rejected,
        CoreError::ActivationDenied(DenialReason::AttestationRejected(_))
    ));

    assert!(core.issuances().is_empty());

    let audit = AuditLog::open(dir.path().join("audit.log"), "reader").unwrap();
    let denied = audit
        .entries()
        .unwrap()
        .into_iter()
        .filter(|entry| entry.outcome == AuditOutcome::Denied)
        .count();
    assert_eq!(denied, 4);
    assert!(audit.verify().unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_use_package_activates_exactly_once() {
    let dir = TempDir::new().unwrap();
    let core = Arc::new(local_core(dir.path()).await);
    core.set_manifest(manifest()).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let core = core.clone();
        let request = request_for("bootstrapper", member_key()).await;
        handles.push(tokio::spawn(async move { core.activate(request, soon()).await }));
    }
    let mut granted = 0;
    let mut limited = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => granted += 1,
            Err(CoreError::ActivationDenied(DenialReason::ActivationLimitReached { limit, .. })) => {
                assert_eq!(limit, 1);
                limited += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(granted, 1);
    assert_eq!(limited, 7);
    assert_eq!(core.issuances().len(), 1);
}

#[tokio::test]
async fn restart_recovers_root_manifest_and_history() {
    let dir = TempDir::new().unwrap();
    let (root, digest) = {
        let core = local_core(dir.path()).await;
        core.set_manifest(manifest()).await.unwrap();
        core.activate(request_for("frontend", member_key()).await, soon())
            .await
            .unwrap();
        core.activate(request_for("bootstrapper", member_key()).await, soon())
            .await
            .unwrap();
        (core.root_certificate().unwrap(), core.status().manifest_digest)
    };

    let restarted = local_core(dir.path()).await;
    assert_eq!(restarted.lifecycle(), Lifecycle::Ready);
    assert_eq!(restarted.root_certificate().unwrap(), root);
    assert_eq!(restarted.status().manifest_digest, digest);
    assert_eq!(restarted.issuances().len(), 2);

    let err = restarted
        .activate(request_for("bootstrapper", member_key()).await, soon())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::ActivationDenied(DenialReason::ActivationLimitReached { .. })
    ));
    let serials: Vec<u64> = restarted.issuances().iter().map(|r| r.serial).collect();
    let next = restarted
        .activate(request_for("frontend", member_key()).await, soon())
        .await
        .unwrap();
    assert!(!serials.contains(&next.certificate.serial));
}

#[tokio::test]
async fn wrong_seal_key_is_a_hard_error() {
    let dir = TempDir::new().unwrap();
    local_core(dir.path()).await;

    let store = Arc::new(LocalSealedStore::open(dir.path()).unwrap());
    let err = core_with(store, Arc::new(SingleReplica), [8; 32], Some(dir.path()))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::TamperedOrWrongKey));
}

#[tokio::test]
async fn expired_deadline_records_nothing() {
    let dir = TempDir::new().unwrap();
    let core = local_core(dir.path()).await;
    core.set_manifest(manifest()).await.unwrap();

    let request = request_for("frontend", member_key()).await;
    let err = core
        .activate(request, Instant::now() - Duration::from_millis(1))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Timeout));
    assert!(core.issuances().is_empty());
}

#[tokio::test]
async fn deadline_passing_during_attestation_records_nothing() {
    let dir = TempDir::new().unwrap();
    let validator = Arc::new(SlowValidator {
        inner: SimulationValidator::new(root(), Duration::from_secs(300)),
        delay: Duration::from_millis(300),
    });
    let store = Arc::new(LocalSealedStore::open(dir.path()).unwrap());
    let core = core_with_validator(store, Arc::new(SingleReplica), validator, SEAL_KEY, None)
        .await
        .unwrap();
    core.set_manifest(manifest()).await.unwrap();

    let err = core
        .activate(
            request_for("bootstrapper", member_key()).await,
            Instant::now() + Duration::from_millis(100),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Timeout));
    assert!(core.issuances().is_empty());

    // The single-use budget is untouched.
    core.activate(request_for("bootstrapper", member_key()).await, soon())
        .await
        .unwrap();
}

#[tokio::test]
async fn slow_store_acknowledgement_still_returns_the_grant() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SlowAckStore {
        inner: LocalSealedStore::open(dir.path()).unwrap(),
        delay: Duration::from_millis(300),
    });
    let core = core_with(store, Arc::new(SingleReplica), SEAL_KEY, None)
        .await
        .unwrap();
    core.set_manifest(manifest()).await.unwrap();

    let grant = core
        .activate(
            request_for("bootstrapper", member_key()).await,
            Instant::now() + Duration::from_millis(150),
        )
        .await
        .unwrap();
    drop(core);

    let restarted = local_core(dir.path()).await;
    let issuances = restarted.issuances();
    assert_eq!(issuances.len(), 1);
    assert_eq!(issuances[0].serial, grant.certificate.serial);

    let err = restarted
        .activate(request_for("bootstrapper", member_key()).await, soon())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::ActivationDenied(DenialReason::ActivationLimitReached { .. })
    ));
}

#[tokio::test]
async fn off_curve_public_key_is_denied_without_spending_the_budget() {
    let dir = TempDir::new().unwrap();
    let core = local_core(dir.path()).await;
    core.set_manifest(manifest()).await.unwrap();

    let mut off_curve = vec![0x04];
    off_curve.extend_from_slice(&[0x11; 64]);
    let err = core
        .activate(request_for("bootstrapper", off_curve).await, soon())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::ActivationDenied(DenialReason::InvalidPublicKey(_))
    ));
    assert!(core.issuances().is_empty());

    core.activate(request_for("bootstrapper", member_key()).await, soon())
        .await
        .unwrap();
}

#[tokio::test]
async fn replica_serves_a_manifest_accepted_elsewhere() {
    let shared = InMemoryConsensusStore::new();
    let first = replica_of(&shared).await;
    let second = replica_of(&shared).await;
    assert_eq!(second.lifecycle(), Lifecycle::AwaitingManifest);

    let digest = first.set_manifest(manifest()).await.unwrap();
    let grant = second
        .activate(request_for("frontend", member_key()).await, soon())
        .await
        .unwrap();
    assert_eq!(grant.package, "frontend");
    assert_eq!(second.lifecycle(), Lifecycle::Ready);
    assert_eq!(second.status().manifest_digest, Some(digest));

    first
        .activate(request_for("frontend", member_key()).await, soon())
        .await
        .unwrap();
    assert_eq!(second.issuances().len(), 1);
    second.refresh().await.unwrap();
    assert_eq!(second.issuances().len(), 2);
}

#[tokio::test]
async fn refresh_loop_follows_the_shared_store() {
    let shared = InMemoryConsensusStore::new();
    let first = replica_of(&shared).await;
    let second = Arc::new(replica_of(&shared).await);
    let (stop, shutdown) = tokio::sync::watch::channel(false);
    let follower = tokio::spawn(second.clone().run_refresh(Duration::from_millis(20), shutdown));

    first.set_manifest(manifest()).await.unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while second.lifecycle() != Lifecycle::Ready {
        assert!(Instant::now() < deadline, "replica never picked up the manifest");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(second.manifest().is_ok());

    stop.send(true).unwrap();
    follower.await.unwrap().unwrap();
}

#[tokio::test]
async fn replica_without_quorum_rejects_mutations() {
    let dir = TempDir::new().unwrap();
    let gate = Arc::new(Switch::default());
    let store = Arc::new(LocalSealedStore::open(dir.path()).unwrap());
    let core = core_with(store, gate.clone(), SEAL_KEY, None).await.unwrap();

    gate.0.store(true, Ordering::SeqCst);
    let err = core.set_manifest(manifest()).await.unwrap_err();
    assert!(matches!(err, CoreError::StaleReplica(_)));
    assert!(err.is_retryable());

    gate.0.store(false, Ordering::SeqCst);
    core.set_manifest(manifest()).await.unwrap();
}

#[tokio::test]
async fn replicas_share_one_root_and_manifest() {
    let shared = InMemoryConsensusStore::new();
    let first = core_with(
        Arc::new(ClusterStateStore::new(Arc::new(shared.clone()))),
        Arc::new(SingleReplica),
        SEAL_KEY,
        None,
    )
    .await
    .unwrap();
    let second = core_with(
        Arc::new(ClusterStateStore::new(Arc::new(shared.clone()))),
        Arc::new(SingleReplica),
        SEAL_KEY,
        None,
    )
    .await
    .unwrap();
    assert_eq!(
        first.root_certificate().unwrap(),
        second.root_certificate().unwrap()
    );

    first.set_manifest(manifest()).await.unwrap();
    let err = second.set_manifest(manifest()).await.unwrap_err();
    assert!(matches!(err, CoreError::AlreadyInitialized));
    assert_eq!(second.lifecycle(), Lifecycle::Ready);

    first
        .activate(request_for("bootstrapper", member_key()).await, soon())
        .await
        .unwrap();
    let err = second
        .activate(request_for("bootstrapper", member_key()).await, soon())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::ActivationDenied(DenialReason::ActivationLimitReached { .. })
    ));
}

#[tokio::test]
async fn unavailable_store_fails_startup() {
    let shared = InMemoryConsensusStore::new();
    shared.set_available(false);
    let err = core_with(
        Arc::new(ClusterStateStore::new(Arc::new(shared))),
        Arc::new(SingleReplica),
        SEAL_KEY,
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CoreError::Storage(_)));
}

#[tokio::test]
async fn coordinator_quote_binds_the_root() {
    let dir = TempDir::new().unwrap();
    let core = local_core(dir.path()).await;
    let quoted = core.coordinator_quote().await.unwrap();

    let validator = SimulationValidator::new(root(), Duration::from_secs(300));
    let identity = validator
        .validate(&quoted.quote, &[Measurement::digest_of(b"coordinator")])
        .await
        .unwrap();
    let root_der = core.root_certificate().unwrap().certificate_der;
    assert_eq!(identity.payload, Sha256::digest(&root_der).to_vec());

    let again = core.coordinator_quote().await.unwrap();
    assert_eq!(again.quote, quoted.quote);
}
