//! ---
//! cmc_section: "06-security-access-control"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Mesh certificate authority primitives."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CustomExtension, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, RemoteKeyPair, SanType,
    SerialNumber, SignatureAlgorithm, PKCS_ECDSA_P256_SHA256,
};
use ring::agreement;
use ring::rand::SystemRandom;
use ring::signature::{UnparsedPublicKey, ECDSA_P256_SHA256_ASN1};
use serde::{Deserialize, Serialize};
use serde_with::base64::Base64;
use serde_with::serde_as;
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

/// Private extension carrying the attested code measurement.
pub const MEASUREMENT_EXTENSION_OID: &[u64] = &[1, 3, 6, 1, 4, 1, 57264, 7, 1];
pub const MEASUREMENT_EXTENSION_OID_STR: &str = "1.3.6.1.4.1.57264.7.1";

/// Length of an uncompressed SEC1 P-256 point.
pub const P256_PUBLIC_KEY_LEN: usize = 65;

const ROOT_SERIAL: u64 = 1;
/// Leaves are backdated to absorb clock skew between mesh members.
const LEAF_BACKDATE: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("invalid certificate: {0}")]
    Parse(String),
    #[error("invalid validity window: {0}")]
    Validity(String),
    #[error("tls configuration failed: {0}")]
    Tls(String),
    #[error("system random source failed")]
    Random,
}

/// Root key pair and self-signed CA certificate of a mesh.
///
/// The certificate DER is produced exactly once; ECDSA signatures are randomised so
/// re-signing would change the bytes.
#[serde_as]
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RootIdentity {
    pub common_name: String,
    #[serde_as(as = "Base64")]
    pub certificate_der: Vec<u8>,
    #[serde_as(as = "Base64")]
    pub key_pkcs8_der: Vec<u8>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl std::fmt::Debug for RootIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootIdentity")
            .field("common_name", &self.common_name)
            .field("fingerprint", &self.fingerprint())
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

impl RootIdentity {
    /// Generate a fresh P-256 root valid for `validity` from now.
    pub fn generate(common_name: &str, validity: Duration) -> Result<Self, CertificateError> {
        let now = Utc::now();
        let not_before = to_datetime(to_offset(now)? - LEAF_BACKDATE)?;
        let not_after = now
            + chrono::Duration::from_std(validity)
                .map_err(|err| CertificateError::Validity(err.to_string()))?;
        let key_pair = KeyPair::generate(&PKCS_ECDSA_P256_SHA256)?;
        let key_pkcs8_der = key_pair.serialize_der();
        let mut params = root_params(common_name, not_before, not_after)?;
        params.key_pair = Some(key_pair);
        let certificate = Certificate::from_params(params)?;
        let certificate_der = certificate.serialize_der()?;
        Ok(Self {
            common_name: common_name.to_owned(),
            certificate_der,
            key_pkcs8_der,
            not_before,
            not_after,
        })
    }

    pub fn certificate_pem(&self) -> String {
        pem_encode("CERTIFICATE", &self.certificate_der)
    }

    /// SHA-256 over the certificate DER, hex encoded.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.certificate_der))
    }

    pub fn public_key(&self) -> Result<Vec<u8>, CertificateError> {
        Ok(inspect_certificate(&self.certificate_der)?.public_key)
    }
}

fn root_params(
    common_name: &str,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> Result<CertificateParams, CertificateError> {
    let mut params = CertificateParams::default();
    params.alg = &PKCS_ECDSA_P256_SHA256;
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params
        .distinguished_name
        .push(DnType::OrganizationName, "Confidential Mesh");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.serial_number = Some(SerialNumber::from(ROOT_SERIAL));
    params.not_before = to_offset(not_before)?;
    params.not_after = to_offset(not_after)?;
    Ok(params)
}

/// Attributes of a leaf certificate to sign.
#[derive(Debug, Clone)]
pub struct LeafTemplate {
    pub common_name: String,
    pub dns_names: Vec<String>,
    pub serial: u64,
    pub ttl: Duration,
    pub measurement: Option<[u8; 32]>,
    pub server_auth: bool,
    pub client_auth: bool,
}

/// A signed leaf certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub der: Vec<u8>,
    pub serial: u64,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl IssuedCertificate {
    pub fn pem(&self) -> String {
        pem_encode("CERTIFICATE", &self.der)
    }
}

/// Leaf with a freshly generated key, used for the coordinator's own TLS identity.
#[derive(Clone)]
pub struct IssuedIdentity {
    pub certificate: IssuedCertificate,
    pub key_pkcs8_der: Vec<u8>,
}

/// Signs leaves under a [`RootIdentity`].
pub struct CertificateAuthority {
    root: RootIdentity,
    signer: Certificate,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Rebuild the signing handle for an existing root.
    pub fn from_root(root: RootIdentity) -> Result<Self, CertificateError> {
        let mut params = root_params(&root.common_name, root.not_before, root.not_after)?;
        params.key_pair = Some(KeyPair::from_der(&root.key_pkcs8_der)?);
        let signer = Certificate::from_params(params)?;
        Ok(Self { root, signer })
    }

    pub fn root(&self) -> &RootIdentity {
        &self.root
    }

    /// Sign a certificate for a SEC1 uncompressed P-256 public key held by a mesh member.
    pub fn issue_leaf(
        &self,
        template: &LeafTemplate,
        public_key: &[u8],
    ) -> Result<IssuedCertificate, CertificateError> {
        validate_public_key(public_key)?;
        let key_pair = KeyPair::from_remote(Box::new(PublicKeyOnly(public_key.to_vec())))?;
        self.sign(template, key_pair)
    }

    /// Generate a key pair and sign a leaf for it.
    pub fn issue_identity(
        &self,
        template: &LeafTemplate,
    ) -> Result<IssuedIdentity, CertificateError> {
        let key_pair = KeyPair::generate(&PKCS_ECDSA_P256_SHA256)?;
        let key_pkcs8_der = key_pair.serialize_der();
        let certificate = self.sign(template, key_pair)?;
        Ok(IssuedIdentity {
            certificate,
            key_pkcs8_der,
        })
    }

    fn sign(
        &self,
        template: &LeafTemplate,
        key_pair: KeyPair,
    ) -> Result<IssuedCertificate, CertificateError> {
        if template.ttl.is_zero() {
            return Err(CertificateError::Validity("ttl must be positive".into()));
        }
        let now = to_offset(Utc::now())?;
        let not_before = now - LEAF_BACKDATE;
        let not_after = (now + template.ttl).min(to_offset(self.root.not_after)?);

        let mut params = CertificateParams::default();
        params.alg = &PKCS_ECDSA_P256_SHA256;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, template.common_name.as_str());
        params.subject_alt_names = template
            .dns_names
            .iter()
            .map(|name| SanType::DnsName(name.clone()))
            .collect();
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        if template.server_auth {
            params
                .extended_key_usages
                .push(ExtendedKeyUsagePurpose::ServerAuth);
        }
        if template.client_auth {
            params
                .extended_key_usages
                .push(ExtendedKeyUsagePurpose::ClientAuth);
        }
        params.serial_number = Some(SerialNumber::from(template.serial));
        params.not_before = not_before;
        params.not_after = not_after;
        params.use_authority_key_identifier_extension = true;
        if let Some(measurement) = template.measurement {
            params
                .custom_extensions
                .push(CustomExtension::from_oid_content(
                    MEASUREMENT_EXTENSION_OID,
                    encode_octet_string(&measurement),
                ));
        }
        params.key_pair = Some(key_pair);

        let certificate = Certificate::from_params(params)?;
        let der = certificate.serialize_der_with_signer(&self.signer)?;
        Ok(IssuedCertificate {
            der,
            serial: template.serial,
            not_before: to_datetime(not_before)?,
            not_after: to_datetime(not_after)?,
        })
    }
}

/// Public half of a member key; the CA only needs it for the subject key info.
struct PublicKeyOnly(Vec<u8>);

impl RemoteKeyPair for PublicKeyOnly {
    fn public_key(&self) -> &[u8] {
        &self.0
    }

    fn sign(&self, _msg: &[u8]) -> Result<Vec<u8>, rcgen::Error> {
        Err(rcgen::Error::RemoteKeyError)
    }

    fn algorithm(&self) -> &'static SignatureAlgorithm {
        &PKCS_ECDSA_P256_SHA256
    }
}

/// Accept only SEC1 uncompressed points that lie on P-256.
///
/// ring parses and range-checks the peer point before any key agreement, so an ephemeral
/// ECDH against it fails exactly when the point is unusable.
pub fn validate_public_key(public_key: &[u8]) -> Result<(), CertificateError> {
    if public_key.len() != P256_PUBLIC_KEY_LEN || public_key[0] != 0x04 {
        return Err(CertificateError::InvalidPublicKey(format!(
            "expected a {} byte uncompressed P-256 point, got {} bytes",
            P256_PUBLIC_KEY_LEN,
            public_key.len()
        )));
    }
    let ephemeral =
        agreement::EphemeralPrivateKey::generate(&agreement::ECDH_P256, &SystemRandom::new())
            .map_err(|_| CertificateError::Random)?;
    agreement::agree_ephemeral(
        ephemeral,
        &agreement::UnparsedPublicKey::new(&agreement::ECDH_P256, public_key),
        |_| (),
    )
    .map_err(|_| CertificateError::InvalidPublicKey("point is not on the P-256 curve".into()))
}

fn encode_octet_string(content: &[u8; 32]) -> Vec<u8> {
    let mut der = Vec::with_capacity(content.len() + 2);
    der.push(0x04);
    der.push(content.len() as u8);
    der.extend_from_slice(content);
    der
}

fn decode_octet_string(der: &[u8]) -> Option<[u8; 32]> {
    match der {
        [0x04, 0x20, rest @ ..] => rest.try_into().ok(),
        _ => None,
    }
}

/// Fields of interest read back from a DER certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub common_name: Option<String>,
    pub dns_names: Vec<String>,
    pub serial: Vec<u8>,
    pub measurement: Option<[u8; 32]>,
    pub public_key: Vec<u8>,
    pub not_before: i64,
    pub not_after: i64,
    pub is_ca: bool,
}

pub fn inspect_certificate(der: &[u8]) -> Result<CertificateInfo, CertificateError> {
    let (_, certificate) =
        X509Certificate::from_der(der).map_err(|err| CertificateError::Parse(err.to_string()))?;
    let measurement = certificate
        .extensions()
        .iter()
        .find(|extension| extension.oid.to_id_string() == MEASUREMENT_EXTENSION_OID_STR)
        .and_then(|extension| decode_octet_string(extension.value));
    let dns_names = certificate
        .subject_alternative_name()
        .map_err(|err| CertificateError::Parse(err.to_string()))?
        .map(|san| {
            san.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some((*dns).to_owned()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    let common_name = certificate
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attribute| attribute.as_str().ok())
        .map(str::to_owned);
    Ok(CertificateInfo {
        common_name,
        dns_names,
        serial: certificate.raw_serial().to_vec(),
        measurement,
        public_key: certificate.public_key().subject_public_key.data.to_vec(),
        not_before: certificate.validity().not_before.timestamp(),
        not_after: certificate.validity().not_after.timestamp(),
        is_ca: certificate.is_ca(),
    })
}

/// Check that `der` carries a valid ECDSA P-256 signature by `issuer_public_key`.
pub fn verify_signed_by(der: &[u8], issuer_public_key: &[u8]) -> Result<bool, CertificateError> {
    let (_, certificate) =
        X509Certificate::from_der(der).map_err(|err| CertificateError::Parse(err.to_string()))?;
    let tbs: &[u8] = certificate.tbs_certificate.as_ref();
    let verifier = UnparsedPublicKey::new(&ECDSA_P256_SHA256_ASN1, issuer_public_key);
    Ok(verifier
        .verify(tbs, certificate.signature_value.data.as_ref())
        .is_ok())
}

pub fn pem_encode(label: &str, der: &[u8]) -> String {
    let encoded = BASE64.encode(der);
    let mut pem = format!("-----BEGIN {}-----\n", label);
    for chunk in encoded.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(chunk));
        pem.push('\n');
    }
    pem.push_str(&format!("-----END {}-----\n", label));
    pem
}

fn to_offset(value: DateTime<Utc>) -> Result<OffsetDateTime, CertificateError> {
    OffsetDateTime::from_unix_timestamp(value.timestamp())
        .map_err(|err| CertificateError::Validity(err.to_string()))
}

fn to_datetime(value: OffsetDateTime) -> Result<DateTime<Utc>, CertificateError> {
    DateTime::<Utc>::from_timestamp(value.unix_timestamp(), 0)
        .ok_or_else(|| CertificateError::Validity(format!("timestamp {} out of range", value)))
}
