//! ---
//! cmc_section: "01-core-functionality"
//! cmc_subsection: "binary"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Binary entrypoint for the coordinator daemon."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use cmc_api::{
    client_router, mesh_router, run_server, AdminAuthoriser, OpenAuthoriser,
    StaticApiKeyAuthoriser,
};
use cmc_attestation::{
    Issuer, Measurement, RemoteAttestationClient, SimulationIssuer, SimulationRoot,
    SimulationValidator, Validator,
};
use cmc_common::{init_tracing, AppConfig, AttestationBackend, Mode};
use cmc_consensus::{
    ClusterStateStore, ConsensusStore, EtcdGatewayStore, Membership, MembershipSettings,
    ReplicaGate, SingleReplica,
};
use cmc_core::{Core, CoreDependencies, CoreSettings, Supervisor};
use cmc_persistence::{prepare_seal_dir, AesGcmSealer, LocalSealedStore, StateStore};
use cmc_security::{AuditLog, KeyMaterial};
use tokio::signal;
use tracing::{info, warn};
use url::Url;

const SERVICE_NAME: &str = "cmc-coordinator";
const SIMULATION_KEY_FILE: &str = "seal.key";
const AUDIT_LOG_FILE: &str = "audit.log";
const DEFAULT_COORDINATOR_IMAGE: &[u8] = b"cmc-coordinator";

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Confidential mesh coordinator",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Development logging: pretty output, debug filter")]
    dev: bool,

    #[arg(long, help = "Force simulation mode (simulated attestation, generated seal key)")]
    simulation: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the coordinator")]
    Run,
    #[command(about = "Validate the configuration and exit")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::load_unvalidated(cli.config.as_deref())?;
    if cli.dev {
        config.dev_mode = true;
    }
    if cli.simulation {
        config.mode = Mode::Simulation;
        config.attestation.backend = AttestationBackend::Simulation;
    }
    config.validate()?;
    init_tracing(SERVICE_NAME, &config.logging, config.dev_mode)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_coordinator(config).await,
        Commands::CheckConfig => {
            let seal_dir = config.seal.effective_dir()?;
            info!(mode = ?config.mode, seal_dir = %seal_dir.display(), replicated = config.cluster.is_replicated(), "configuration valid");
            println!(
                "configuration ok: node {} ({:?}), seal dir {}",
                config.cluster.node_name,
                config.mode,
                seal_dir.display()
            );
            Ok(())
        }
    }
}

async fn run_coordinator(config: AppConfig) -> Result<()> {
    let node = config.cluster.node_name.clone();
    let seal_dir = config.seal.effective_dir()?;
    prepare_seal_dir(&seal_dir)
        .with_context(|| format!("unable to prepare seal directory {}", seal_dir.display()))?;
    let key = load_seal_key(&config, &seal_dir)?;
    info!(node = %node, seal_dir = %seal_dir.display(), key_fingerprint = %key.fingerprint(), "seal key loaded");

    let (validator, issuer) = attestation_backends(&config)?;
    let (store, gate, membership) = state_backends(&config, &seal_dir)?;
    let audit = AuditLog::open(seal_dir.join(AUDIT_LOG_FILE), node.clone())
        .context("unable to open audit log")?;

    let core = Core::new(
        CoreSettings::from(&config),
        CoreDependencies {
            validator,
            issuer,
            sealer: Arc::new(AesGcmSealer::new(key.as_bytes())?),
            store,
            gate,
            audit: Some(audit),
        },
    )
    .await
    .context("failed to initialise coordinator core")?;
    let core = Arc::new(core);
    let tls = core
        .get_tls_config()
        .context("coordinator has no TLS identity")?;

    let mut supervisor = Supervisor::new();
    if let Some(membership) = membership {
        supervisor.spawn("membership", membership.run(supervisor.shutdown_signal()));
        supervisor.spawn(
            "state-refresh",
            core.clone()
                .run_refresh(config.cluster.heartbeat_interval, supervisor.shutdown_signal()),
        );
    }

    let client = client_router(core.clone(), admin_authoriser(&config));
    supervisor.spawn(
        "client-api",
        run_server(
            config.mesh.client_addr,
            tls.clone(),
            client,
            supervisor.notifier("client-api"),
            supervisor.shutdown_signal(),
        ),
    );
    let mesh = mesh_router(core.clone(), config.api.request_timeout);
    supervisor.spawn(
        "mesh-api",
        run_server(
            config.mesh.mesh_addr,
            tls,
            mesh,
            supervisor.notifier("mesh-api"),
            supervisor.shutdown_signal(),
        ),
    );

    info!(node = %node, state = ?core.lifecycle(), "coordinator running; waiting for termination signal");
    supervisor
        .run_until(async {
            if let Err(err) = signal::ctrl_c().await {
                warn!(error = %err, "unable to listen for ctrl-c; shutting down");
            }
        })
        .await?;
    info!(node = %node, "coordinator stopped");
    Ok(())
}

fn load_seal_key(config: &AppConfig, seal_dir: &Path) -> Result<KeyMaterial> {
    match &config.seal.key_file {
        Some(path) => KeyMaterial::load(path),
        None if config.mode.is_simulation() => {
            let path = seal_dir.join(SIMULATION_KEY_FILE);
            warn!(path = %path.display(), "simulation mode: using a locally generated seal key");
            KeyMaterial::load_or_generate(&path)
        }
        None => Err(anyhow!("seal.key_file is required outside simulation mode")),
    }
}

fn attestation_backends(config: &AppConfig) -> Result<(Arc<dyn Validator>, Arc<dyn Issuer>)> {
    let settings = &config.attestation;
    match settings.backend {
        AttestationBackend::Simulation => {
            let measurement = match &settings.coordinator_measurement {
                Some(hex) => hex
                    .parse::<Measurement>()
                    .context("attestation.coordinator_measurement is not a valid measurement")?,
                None => Measurement::digest_of(DEFAULT_COORDINATOR_IMAGE),
            };
            let root = SimulationRoot::development();
            warn!(measurement = %measurement, "simulated attestation enabled; quotes carry no hardware guarantee");
            let validator: Arc<dyn Validator> =
                Arc::new(SimulationValidator::new(root.clone(), settings.max_quote_age));
            let issuer: Arc<dyn Issuer> = Arc::new(SimulationIssuer::new(root, measurement));
            Ok((validator, issuer))
        }
        AttestationBackend::Remote => {
            let endpoint = settings
                .endpoint
                .as_deref()
                .ok_or_else(|| anyhow!("attestation.endpoint is required for the remote backend"))?;
            let url = Url::parse(endpoint)
                .with_context(|| format!("invalid attestation endpoint {endpoint}"))?;
            let client = Arc::new(RemoteAttestationClient::new(url, config.api.request_timeout)?);
            info!(endpoint = %endpoint, "remote attestation service configured");
            let validator: Arc<dyn Validator> = client.clone();
            let issuer: Arc<dyn Issuer> = client;
            Ok((validator, issuer))
        }
    }
}

/// Sealed-state store, replica gate and, when replicated, the membership service.
fn state_backends(
    config: &AppConfig,
    seal_dir: &Path,
) -> Result<(Arc<dyn StateStore>, Arc<dyn ReplicaGate>, Option<Arc<Membership>>)> {
    if !config.cluster.is_replicated() {
        let store = LocalSealedStore::open(seal_dir)?;
        info!(path = %store.path().display(), "single-node sealed state");
        let store: Arc<dyn StateStore> = Arc::new(store);
        let gate: Arc<dyn ReplicaGate> = Arc::new(SingleReplica);
        return Ok((store, gate, None));
    }
    let endpoints = config.cluster.store_endpoints();
    let consensus: Arc<dyn ConsensusStore> = Arc::new(EtcdGatewayStore::new(
        &endpoints,
        config.api.request_timeout,
    )?);
    info!(endpoints = ?endpoints, size = config.cluster.cluster_size, "replicated state in consensus store");
    let membership = Arc::new(Membership::new(
        consensus.clone(),
        MembershipSettings::from(&config.cluster),
    ));
    let store: Arc<dyn StateStore> = Arc::new(ClusterStateStore::new(consensus));
    let gate: Arc<dyn ReplicaGate> = Arc::new(membership.gate());
    Ok((store, gate, Some(membership)))
}

fn admin_authoriser(config: &AppConfig) -> Arc<dyn AdminAuthoriser> {
    if config.api.admin_keys.is_empty() {
        warn!("no api.admin_keys configured; administrative endpoints are open (simulation only)");
        Arc::new(OpenAuthoriser)
    } else {
        Arc::new(StaticApiKeyAuthoriser::from_digests(&config.api.admin_keys))
    }
}
