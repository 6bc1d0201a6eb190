//! ---
//! cmc_section: "01-core-functionality"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Shared primitives and utilities for the coordinator runtime."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use config::{Config, Environment, File, FileFormat};
use path_absolutize::Absolutize;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_mode() -> Mode {
    Mode::Production
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("logs")
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_member_ttl() -> Duration {
    Duration::from_secs(10)
}

fn default_leader_lease() -> Duration {
    Duration::from_secs(10)
}

fn default_store_port() -> u16 {
    2379
}

fn default_max_quote_age() -> Duration {
    Duration::from_secs(300)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Primary configuration object for the coordinator.
///
/// Every value is read once at process start. The sections without a serde
/// default (`mesh`, `seal`, `cluster`) carry the bootstrap parameters the
/// coordinator cannot run without.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default)]
    pub dev_mode: bool,
    pub mesh: MeshConfig,
    pub seal: SealConfig,
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub attestation: AttestationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "CMC_CONFIG";
    pub const ENV_PREFIX: &'static str = "CMC";

    /// Load configuration from an optional TOML file layered with `CMC_*` environment variables.
    ///
    /// The file is taken from `path`, falling back to the `CMC_CONFIG` variable. Environment
    /// variables use `__` between sections, e.g. `CMC_SEAL__DIR` or `CMC_MESH__DNS_NAMES=a,b`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = Self::load_unvalidated(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Layer the sources without running [`AppConfig::validate`], so callers can apply
    /// command-line overrides first.
    pub fn load_unvalidated(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var(Self::ENV_CONFIG_PATH)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);
        let file = path.map(Path::to_path_buf).or(env_path);

        let mut builder = Config::builder();
        if let Some(file) = &file {
            debug!(config_path = %file.display(), "loading configuration file");
            builder = builder.add_source(File::from(file.as_path()).format(FileFormat::Toml));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix(Self::ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("mesh.dns_names")
                    .with_list_parse_key("cluster.endpoints")
                    .with_list_parse_key("api.admin_keys")
                    .try_parsing(true),
            )
            .build()
            .context("failed to assemble configuration sources")?;

        let config: AppConfig = settings
            .try_deserialize()
            .context("configuration is missing required values or is malformed")?;
        Ok(config)
    }

    /// Validate structural invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.mesh.validate()?;
        self.cluster.validate()?;
        if self.seal.dir.as_os_str().is_empty() {
            return Err(anyhow!("seal.dir must not be empty"));
        }
        match self.attestation.backend {
            AttestationBackend::Simulation if !self.mode.is_simulation() => {
                return Err(anyhow!(
                    "the simulation attestation backend is only permitted in simulation mode"
                ));
            }
            AttestationBackend::Remote if self.attestation.endpoint.is_none() => {
                return Err(anyhow!(
                    "attestation.endpoint is required for the remote attestation backend"
                ));
            }
            _ => {}
        }
        if !self.mode.is_simulation() && self.seal.key_file.is_none() {
            return Err(anyhow!("seal.key_file is required outside simulation mode"));
        }
        if !self.mode.is_simulation() && self.api.admin_keys.is_empty() {
            return Err(anyhow!("api.admin_keys is required outside simulation mode"));
        }
        if let Some(bad) = self
            .api
            .admin_keys
            .iter()
            .find(|digest| digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()))
        {
            return Err(anyhow!("api.admin_keys entry {:?} is not a hex SHA-256 digest", bad));
        }
        Ok(())
    }

    /// Log format after applying the dev-mode default.
    pub fn effective_log_format(&self) -> LogFormat {
        self.logging.format.unwrap_or(if self.dev_mode {
            LogFormat::Pretty
        } else {
            LogFormat::StructuredJson
        })
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Operating mode for the coordinator.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Production,
    Simulation,
}

impl Mode {
    pub fn is_simulation(&self) -> bool {
        matches!(self, Mode::Simulation)
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "production" => Ok(Mode::Production),
            "simulation" => Ok(Mode::Simulation),
            other => Err(format!("unknown mode: {}", other)),
        }
    }
}

/// Listener addresses and the names placed on the coordinator certificate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    pub dns_names: Vec<String>,
    pub client_addr: SocketAddr,
    pub mesh_addr: SocketAddr,
}

impl MeshConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dns_names.is_empty() {
            return Err(anyhow!("mesh.dns_names must list at least one name"));
        }
        if self.dns_names.iter().any(|name| name.trim().is_empty()) {
            return Err(anyhow!("mesh.dns_names must not contain empty entries"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealConfig {
    pub dir: PathBuf,
    #[serde(default)]
    pub prefix: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

impl SealConfig {
    /// Resolve the seal directory beneath the optional prefix.
    ///
    /// The directory is always nested under the prefix, even when it is written
    /// as an absolute path.
    pub fn effective_dir(&self) -> Result<PathBuf> {
        let joined = match &self.prefix {
            Some(prefix) => {
                let relative: PathBuf = self
                    .dir
                    .components()
                    .filter(|component| {
                        !matches!(component, Component::RootDir | Component::Prefix(_))
                    })
                    .collect();
                prefix.join(relative)
            }
            None => self.dir.clone(),
        };
        let absolute = joined
            .absolutize()
            .with_context(|| format!("unable to resolve seal directory {}", joined.display()))?;
        Ok(absolute.into_owned())
    }
}

/// Identity this replica uses to join the consensus cluster.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub node_name: String,
    pub namespace: String,
    pub cluster_name: String,
    pub cluster_size: u32,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default = "default_store_port")]
    pub store_port: u16,
    #[serde(default = "default_heartbeat_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub heartbeat_interval: Duration,
    #[serde(default = "default_member_ttl")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub member_ttl: Duration,
    #[serde(default = "default_leader_lease")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub leader_lease: Duration,
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("cluster.node_name", &self.node_name),
            ("cluster.namespace", &self.namespace),
            ("cluster.cluster_name", &self.cluster_name),
        ] {
            if value.trim().is_empty() {
                return Err(anyhow!("{} must not be empty", field));
            }
        }
        if self.cluster_size == 0 {
            return Err(anyhow!("cluster.cluster_size must be at least 1"));
        }
        if self.member_ttl <= self.heartbeat_interval {
            return Err(anyhow!(
                "cluster.member_ttl must be longer than cluster.heartbeat_interval"
            ));
        }
        Ok(())
    }

    /// True once the deployment expects more than one replica.
    pub fn is_replicated(&self) -> bool {
        self.cluster_size > 1
    }

    /// Store endpoints, derived from the stateful-set naming scheme when not configured.
    pub fn store_endpoints(&self) -> Vec<String> {
        if !self.endpoints.is_empty() {
            return self.endpoints.clone();
        }
        (0..self.cluster_size)
            .map(|ordinal| {
                format!(
                    "http://{cluster}-{ordinal}.{cluster}.{ns}.svc.cluster.local:{port}",
                    cluster = self.cluster_name,
                    ns = self.namespace,
                    port = self.store_port,
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AttestationBackend {
    #[default]
    Simulation,
    Remote,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationConfig {
    #[serde(default)]
    pub backend: AttestationBackend,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Measurement the simulated issuer reports for the coordinator (hex).
    #[serde(default)]
    pub coordinator_measurement: Option<String>,
    #[serde(default = "default_max_quote_age")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub max_quote_age: Duration,
}

impl Default for AttestationConfig {
    fn default() -> Self {
        Self {
            backend: AttestationBackend::default(),
            endpoint: None,
            coordinator_measurement: None,
            max_quote_age: default_max_quote_age(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default)]
    pub format: Option<LogFormat>,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: None,
            file_prefix: None,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// SHA-256 digests (hex) of API keys allowed to call write operations.
    #[serde(default)]
    pub admin_keys: Vec<String>,
    #[serde(default = "default_request_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            admin_keys: Vec::new(),
            request_timeout: default_request_timeout(),
        }
    }
}
