//! ---
//! cmc_section: "01-core-functionality"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Shared primitives and utilities for the coordinator runtime."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
//! Shared primitives for the coordinator workspace.
//! This crate exposes configuration loading and logging setup consumed by
//! every other crate and the daemon.

pub mod config;
pub mod logging;

pub use config::{
    ApiConfig, AppConfig, AttestationBackend, AttestationConfig, ClusterConfig, LoggingConfig,
    MeshConfig, Mode, SealConfig,
};
pub use logging::{init_tracing, LogFormat};
