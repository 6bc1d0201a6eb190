//! ---
//! cmc_section: "05-networking-external-interfaces"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Transport adapters for the coordinator core."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
//! HTTP over TLS adapters in front of [`cmc_core::Core`]: the client control API and the
//! mesh activation API. Both present the coordinator certificate derived from the mesh root.

pub mod auth;
pub mod client;
pub mod error;
pub mod mesh;
pub mod server;

pub use auth::{
    extract_api_key, AdminAuthoriser, AdminOperation, OpenAuthoriser, StaticApiKeyAuthoriser,
};
pub use client::{client_router, ManifestAck, QuoteResponse};
pub use error::{ApiError, ErrorResponse};
pub use mesh::{mesh_router, ActivateRequest, ActivateResponse};
pub use server::{run_server, TlsServer};
