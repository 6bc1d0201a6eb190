//! ---
//! cmc_section: "01-core-functionality"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Coordinator lifecycle, mesh authority and supervision."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
//! Coordinator core for the confidential mesh: manifest, sealed state, certificate
//! issuance and the supervisor that runs the coordinator's subsystems.

pub mod authority;
pub mod core;
pub mod errors;
pub mod manifest;
pub mod state;
pub mod supervisor;

pub use crate::core::{
    ActivationGrant, ActivationRequest, CoordinatorQuote, Core, CoreDependencies, CoreSettings,
    CoreSnapshot, CoreStatus, Lifecycle,
};
pub use authority::{bootstrap_root, MeshAuthority, ROOT_COMMON_NAME};
pub use errors::{CoreError, DenialReason};
pub use manifest::{CertificateTemplate, Manifest, ManifestError, PackagePolicy};
pub use state::{IssuanceRecord, SealedState, STATE_SCHEMA_VERSION};
pub use supervisor::{EventNotifier, SubsystemEvent, Supervisor, SupervisorError};
