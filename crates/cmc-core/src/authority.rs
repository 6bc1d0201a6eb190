//! ---
//! cmc_section: "01-core-functionality"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Mesh certificate authority embedded in the core."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use cmc_attestation::CodeIdentity;
use cmc_security::{
    server_config, CertificateAuthority, CertificateError, IssuedCertificate, LeafTemplate,
    RootIdentity,
};
use rustls::ServerConfig;
use tracing::{debug, info};

use crate::errors::{CoreError, DenialReason};
use crate::manifest::Manifest;

pub const ROOT_COMMON_NAME: &str = "Confidential Mesh Root CA";
const ROOT_VALIDITY: Duration = Duration::from_secs(10 * 365 * 86_400);
const SELF_IDENTITY_TTL: Duration = Duration::from_secs(365 * 86_400);
const SELF_COMMON_NAME: &str = "mesh-coordinator";

/// Return `existing` unchanged, or generate the mesh root if there is none.
pub fn bootstrap_root(existing: Option<&RootIdentity>) -> Result<RootIdentity, CertificateError> {
    match existing {
        Some(root) => Ok(root.clone()),
        None => {
            let root = RootIdentity::generate(ROOT_COMMON_NAME, ROOT_VALIDITY)?;
            info!(fingerprint = %root.fingerprint(), "generated mesh root identity");
            Ok(root)
        }
    }
}

/// Signing authority plus the coordinator's own TLS identity for this process.
pub struct MeshAuthority {
    ca: CertificateAuthority,
    tls: Arc<ServerConfig>,
}

impl std::fmt::Debug for MeshAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshAuthority")
            .field("root", self.ca.root())
            .finish_non_exhaustive()
    }
}

impl MeshAuthority {
    /// Rebuild the signer and issue a fresh coordinator certificate for `dns_names`.
    pub fn new(root: RootIdentity, dns_names: &[String]) -> Result<Self, CertificateError> {
        let ca = CertificateAuthority::from_root(root)?;
        let identity = ca.issue_identity(&LeafTemplate {
            common_name: SELF_COMMON_NAME.into(),
            dns_names: dns_names.to_vec(),
            serial: rand::random::<u64>() | (1 << 63),
            ttl: SELF_IDENTITY_TTL,
            measurement: None,
            server_auth: true,
            client_auth: true,
        })?;
        let tls = server_config(
            &ca.root().certificate_der,
            &identity.certificate.der,
            &identity.key_pkcs8_der,
        )?;
        debug!(serial = identity.certificate.serial, dns_names = ?dns_names, "issued coordinator identity");
        Ok(Self { ca, tls })
    }

    pub fn root(&self) -> &RootIdentity {
        self.ca.root()
    }

    pub fn server_tls_config(&self) -> Arc<ServerConfig> {
        self.tls.clone()
    }

    /// Sign a member certificate for a proven code identity.
    ///
    /// Fails with [`DenialReason::PolicyDenied`] when the manifest does not authorise the
    /// identity's measurement.
    pub fn issue_leaf(
        &self,
        manifest: &Manifest,
        identity: &CodeIdentity,
        public_key: &[u8],
        serial: u64,
    ) -> Result<IssuedCertificate, CoreError> {
        let (_, policy) = manifest.package_for(&identity.measurement).ok_or(
            CoreError::ActivationDenied(DenialReason::PolicyDenied(identity.measurement)),
        )?;
        let template = LeafTemplate {
            common_name: policy.certificate.common_name.clone(),
            dns_names: policy.certificate.dns_names.clone(),
            serial,
            ttl: manifest.ttl_for(policy),
            measurement: Some(*identity.measurement.as_bytes()),
            server_auth: true,
            client_auth: true,
        };
        self.ca
            .issue_leaf(&template, public_key)
            .map_err(|err| match err {
                CertificateError::InvalidPublicKey(reason) => {
                    CoreError::ActivationDenied(DenialReason::InvalidPublicKey(reason))
                }
                other => CoreError::Certificate(other),
            })
    }
}
