//! ---
//! cmc_section: "06-security-access-control"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "TLS configuration derived from mesh identities."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
use std::sync::Arc;

use rustls::crypto::ring::default_provider;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::certificates::CertificateError;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(default_provider())
}

fn tls_error(err: impl std::fmt::Display) -> CertificateError {
    CertificateError::Tls(err.to_string())
}

fn root_store(root_der: &[u8]) -> Result<RootCertStore, CertificateError> {
    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from(root_der.to_vec()))
        .map_err(tls_error)?;
    Ok(roots)
}

/// Server configuration presenting `leaf` and verifying client certificates against the root.
///
/// Client certificates are optional so members that have not been activated yet can still
/// reach the server.
pub fn server_config(
    root_der: &[u8],
    leaf_der: &[u8],
    leaf_key_pkcs8: &[u8],
) -> Result<Arc<ServerConfig>, CertificateError> {
    let provider = provider();
    let verifier =
        WebPkiClientVerifier::builder_with_provider(Arc::new(root_store(root_der)?), provider.clone())
            .allow_unauthenticated()
            .build()
            .map_err(tls_error)?;
    let chain = vec![
        CertificateDer::from(leaf_der.to_vec()),
        CertificateDer::from(root_der.to_vec()),
    ];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key_pkcs8.to_vec()));
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)
        .map_err(tls_error)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Client configuration trusting only the mesh root, optionally presenting a member identity.
pub fn client_config(
    root_der: &[u8],
    identity: Option<(&[u8], &[u8])>,
) -> Result<Arc<ClientConfig>, CertificateError> {
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?
        .with_root_certificates(root_store(root_der)?);
    let config = match identity {
        Some((cert_der, key_pkcs8)) => builder
            .with_client_auth_cert(
                vec![CertificateDer::from(cert_der.to_vec())],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pkcs8.to_vec())),
            )
            .map_err(tls_error)?,
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::certificates::{CertificateAuthority, LeafTemplate, RootIdentity};

    #[test]
    fn server_config_accepts_issued_identity() {
        let root = RootIdentity::generate("Mesh Root", Duration::from_secs(86_400)).unwrap();
        let ca = CertificateAuthority::from_root(root.clone()).unwrap();
        let identity = ca
            .issue_identity(&LeafTemplate {
                common_name: "coordinator".into(),
                dns_names: vec!["localhost".into()],
                serial: 2,
                ttl: Duration::from_secs(3600),
                measurement: None,
                server_auth: true,
                client_auth: false,
            })
            .unwrap();
        let config = server_config(
            &root.certificate_der,
            &identity.certificate.der,
            &identity.key_pkcs8_der,
        )
        .unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
        assert!(client_config(&root.certificate_der, None).is_ok());
    }

    #[test]
    fn garbage_key_is_rejected() {
        let root = RootIdentity::generate("Mesh Root", Duration::from_secs(86_400)).unwrap();
        let err = server_config(&root.certificate_der, &root.certificate_der, b"nope").unwrap_err();
        assert!(matches!(err, CertificateError::Tls(_)));
    }
}
