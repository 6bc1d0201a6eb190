//! ---
//! cmc_section: "05-networking-external-interfaces"
//! cmc_subsection: "tests"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "TLS listener tests against the coordinator certificate."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cmc_api::{client_router, run_server, OpenAuthoriser, TlsServer};
use cmc_attestation::{Measurement, SimulationIssuer, SimulationRoot, SimulationValidator};
use cmc_consensus::SingleReplica;
use cmc_core::{Core, CoreDependencies, CoreSettings, SubsystemEvent, Supervisor};
use cmc_persistence::{AesGcmSealer, LocalSealedStore};
use reqwest::{Certificate, Client};
use tempfile::TempDir;

async fn core(dir: &TempDir) -> Arc<Core> {
    let root = SimulationRoot::new([5; 32]);
    let core = Core::new(
        CoreSettings {
            node_name: "node-0".into(),
            dns_names: vec!["localhost".into()],
            store_retry_delay: Duration::from_millis(10),
        },
        CoreDependencies {
            validator: Arc::new(SimulationValidator::new(root.clone(), Duration::from_secs(60))),
            issuer: Arc::new(SimulationIssuer::new(root, Measurement::digest_of(b"coordinator"))),
            sealer: Arc::new(AesGcmSealer::new(&[1; 32]).unwrap()),
            store: Arc::new(LocalSealedStore::open(dir.path()).unwrap()),
            gate: Arc::new(SingleReplica),
            audit: None,
        },
    )
    .await
    .unwrap();
    Arc::new(core)
}

fn trusting_client(core: &Core) -> Client {
    let root = core.root_certificate().unwrap();
    Client::builder()
        .use_rustls_tls()
        .add_root_certificate(Certificate::from_der(&root.certificate_der).unwrap())
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

#[tokio::test]
async fn status_is_served_over_mesh_rooted_tls() {
    let dir = TempDir::new().unwrap();
    let core = core(&dir).await;
    let server = TlsServer::bind("127.0.0.1:0".parse().unwrap(), core.get_tls_config().unwrap())
        .unwrap();
    let port = server.local_addr().port();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let task = tokio::spawn(server.serve(
        client_router(core.clone(), Arc::new(OpenAuthoriser)),
        async move {
            let _ = stop_rx.await;
        },
    ));

    let status: serde_json::Value = trusting_client(&core)
        .get(format!("https://localhost:{port}/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["node"], "node-0");

    let untrusting = Client::builder().use_rustls_tls().build().unwrap();
    assert!(untrusting
        .get(format!("https://localhost:{port}/status"))
        .send()
        .await
        .is_err());

    let _ = stop_tx.send(());
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn listener_reports_address_to_supervisor() {
    let dir = TempDir::new().unwrap();
    let core = core(&dir).await;
    let mut supervisor = Supervisor::new();
    let notifier = supervisor.notifier("client-api");
    let shutdown = supervisor.shutdown_signal();
    supervisor.spawn(
        "client-api",
        run_server(
            "127.0.0.1:0".parse().unwrap(),
            core.get_tls_config().unwrap(),
            client_router(core.clone(), Arc::new(OpenAuthoriser)),
            notifier,
            shutdown,
        ),
    );

    let event = supervisor.next_event().await.unwrap();
    let Some(SubsystemEvent::Started { name, addr }) = event else {
        panic!("expected a started event, got {event:?}");
    };
    assert_eq!(name, "client-api");
    assert_ne!(addr.port(), 0);

    let response = trusting_client(&core)
        .get(format!("https://localhost:{}/certificate/root", addr.port()))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    supervisor.run_until(async {}).await.unwrap();
}

#[tokio::test]
async fn occupied_port_is_a_startup_failure() {
    let dir = TempDir::new().unwrap();
    let core = core(&dir).await;
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr: SocketAddr = taken.local_addr().unwrap();

    let mut supervisor = Supervisor::new();
    let notifier = supervisor.notifier("mesh-api");
    let shutdown = supervisor.shutdown_signal();
    supervisor.spawn(
        "mesh-api",
        run_server(
            addr,
            core.get_tls_config().unwrap(),
            client_router(core.clone(), Arc::new(OpenAuthoriser)),
            notifier,
            shutdown,
        ),
    );
    let err = supervisor.run_until(std::future::pending()).await.unwrap_err();
    assert!(err.to_string().contains("mesh-api"));
}
