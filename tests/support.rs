//! ---
//! cmc_section: "15-testing-qa-runbook"
//! cmc_subsection: "integration-tests"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Shared fixtures for the workspace integration suites."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cmc_api::{client_router, mesh_router, run_server, ActivateRequest, StaticApiKeyAuthoriser};
use cmc_attestation::{Issuer, Measurement, Quote, SimulationIssuer, SimulationRoot, SimulationValidator};
use cmc_consensus::SingleReplica;
use cmc_core::{Core, CoreDependencies, CoreError, CoreSettings, SubsystemEvent, Supervisor, SupervisorError};
use cmc_persistence::{AesGcmSealer, LocalSealedStore};
use cmc_security::AuditLog;
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const SEAL_KEY: [u8; 32] = [0x5a; 32];
pub const ADMIN_KEY: &str = "mesh-operator";

pub fn attestation_root() -> SimulationRoot {
    SimulationRoot::new([0x17; 32])
}

pub fn manifest_json() -> String {
    serde_json::json!({
        "packages": {
            "web": {
                "measurement": Measurement::digest_of(b"web").to_hex(),
                "certificate": {
                    "common_name": "web",
                    "dns_names": ["web.mesh.local"],
                    "ttl_secs": 1800
                }
            },
            "migrator": {
                "measurement": Measurement::digest_of(b"migrator").to_hex(),
                "max_activations": 1,
                "certificate": { "common_name": "migrator", "ttl_secs": 300 }
            }
        },
        "max_certificate_ttl_secs": 3600
    })
    .to_string()
}

pub fn member_public_key() -> Vec<u8> {
    let rng = SystemRandom::new();
    let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng).unwrap();
    EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
        .unwrap()
        .public_key()
        .as_ref()
        .to_vec()
}

/// A quote from a member running `image`, binding `public_key`.
pub async fn member_quote(image: &str, public_key: &[u8]) -> Quote {
    SimulationIssuer::new(attestation_root(), Measurement::digest_of(image.as_bytes()))
        .issue(&Sha256::digest(public_key))
        .await
        .unwrap()
}

pub async fn activation_body(image: &str) -> ActivateRequest {
    let public_key = member_public_key();
    let quote = member_quote(image, &public_key).await;
    ActivateRequest {
        quote,
        public_key,
        package: None,
    }
}

pub async fn open_core(seal_dir: &Path, key: [u8; 32]) -> Result<Arc<Core>, CoreError> {
    let audit = AuditLog::open(seal_dir.join("audit.log"), "coordinator-0").unwrap();
    let core = Core::new(
        CoreSettings {
            node_name: "coordinator-0".into(),
            dns_names: vec!["localhost".into()],
            store_retry_delay: Duration::from_millis(10),
        },
        CoreDependencies {
            validator: Arc::new(SimulationValidator::new(
                attestation_root(),
                Duration::from_secs(120),
            )),
            issuer: Arc::new(SimulationIssuer::new(
                attestation_root(),
                Measurement::digest_of(b"coordinator"),
            )),
            sealer: Arc::new(AesGcmSealer::new(&key).unwrap()),
            store: Arc::new(LocalSealedStore::open(seal_dir).unwrap()),
            gate: Arc::new(SingleReplica),
            audit: Some(audit),
        },
    )
    .await?;
    Ok(Arc::new(core))
}

/// Both APIs served over TLS under a supervisor, as the daemon runs them.
pub struct RunningCoordinator {
    pub core: Arc<Core>,
    pub client_addr: SocketAddr,
    pub mesh_addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<(), SupervisorError>>,
}

impl RunningCoordinator {
    pub async fn start(core: Arc<Core>) -> Self {
        let tls = core.get_tls_config().unwrap();
        let mut supervisor = Supervisor::new();
        let authoriser = StaticApiKeyAuthoriser::from_digests(&[StaticApiKeyAuthoriser::digest(ADMIN_KEY)]);
        supervisor.spawn(
            "client-api",
            run_server(
                "127.0.0.1:0".parse().unwrap(),
                tls.clone(),
                client_router(core.clone(), Arc::new(authoriser)),
                supervisor.notifier("client-api"),
                supervisor.shutdown_signal(),
            ),
        );
        supervisor.spawn(
            "mesh-api",
            run_server(
                "127.0.0.1:0".parse().unwrap(),
                tls,
                mesh_router(core.clone(), Duration::from_secs(10)),
                supervisor.notifier("mesh-api"),
                supervisor.shutdown_signal(),
            ),
        );

        let mut client_addr = None;
        let mut mesh_addr = None;
        while client_addr.is_none() || mesh_addr.is_none() {
            match supervisor.next_event().await.unwrap() {
                Some(SubsystemEvent::Started { name, addr }) if name == "client-api" => {
                    client_addr = Some(addr)
                }
                Some(SubsystemEvent::Started { addr, .. }) => mesh_addr = Some(addr),
                other => panic!("unexpected supervisor event {other:?}"),
            }
        }

        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(supervisor.run_until(async move {
            let _ = stopped.await;
        }));
        Self {
            core,
            client_addr: client_addr.unwrap(),
            mesh_addr: mesh_addr.unwrap(),
            stop,
            task,
        }
    }

    pub fn client_url(&self, path: &str) -> String {
        format!("https://localhost:{}{}", self.client_addr.port(), path)
    }

    pub fn mesh_url(&self, path: &str) -> String {
        format!("https://localhost:{}{}", self.mesh_addr.port(), path)
    }

    /// Client trusting only the mesh root.
    pub fn https(&self) -> reqwest::Client {
        let root = self.core.root_certificate().unwrap();
        reqwest::Client::builder()
            .use_rustls_tls()
            .add_root_certificate(reqwest::Certificate::from_der(&root.certificate_der).unwrap())
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap()
    }

    pub async fn stop(self) {
        let _ = self.stop.send(());
        self.task.await.unwrap().unwrap();
    }
}
