//! ---
//! cmc_section: "06-security-access-control"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Mesh certificate authority and security helpers."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
//! Security building blocks for the coordinator: the mesh certificate authority, TLS
//! configuration derived from it, seal key handling and the audit trail.

pub mod audit;
pub mod certificates;
pub mod crypto;
pub mod tls;

pub use audit::{AuditEntry, AuditLog, AuditOutcome};
pub use certificates::{
    inspect_certificate, pem_encode, validate_public_key, verify_signed_by, CertificateAuthority,
    CertificateError, CertificateInfo, IssuedCertificate, IssuedIdentity, LeafTemplate,
    RootIdentity, MEASUREMENT_EXTENSION_OID_STR,
};
pub use crypto::KeyMaterial;
pub use tls::{client_config, server_config};
