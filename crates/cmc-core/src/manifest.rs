//! ---
//! cmc_section: "01-core-functionality"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Mesh policy manifest."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
//! The manifest names every binary allowed into the mesh and what certificate it gets.
//! Once accepted it never changes for the lifetime of the mesh.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use cmc_attestation::Measurement;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub packages: BTreeMap<String, PackagePolicy>,
    /// Upper bound for every leaf certificate lifetime.
    pub max_certificate_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PackagePolicy {
    pub measurement: Measurement,
    /// `Some(1)` makes the package single-use.
    #[serde(default)]
    pub max_activations: Option<u32>,
    pub certificate: CertificateTemplate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CertificateTemplate {
    pub common_name: String,
    #[serde(default)]
    pub dns_names: Vec<String>,
    pub ttl_secs: u64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManifestError {
    #[error("manifest is not valid JSON: {0}")]
    Malformed(String),
    #[error("manifest must declare at least one package")]
    NoPackages,
    #[error("package names must not be empty")]
    EmptyPackageName,
    #[error("max_certificate_ttl_secs must be positive")]
    ZeroMaxTtl,
    #[error("packages {first} and {second} share measurement {measurement}")]
    DuplicateMeasurement {
        measurement: Measurement,
        first: String,
        second: String,
    },
    #[error("package {package}: ttl_secs {ttl} must be within 1..={max}")]
    InvalidTtl { package: String, ttl: u64, max: u64 },
    #[error("package {0}: max_activations must be at least 1")]
    InvalidActivationLimit(String),
    #[error("package {0}: certificate common_name must not be empty")]
    EmptyCommonName(String),
}

impl Manifest {
    pub fn from_json(bytes: &[u8]) -> Result<Self, ManifestError> {
        serde_json::from_slice(bytes).map_err(|err| ManifestError::Malformed(err.to_string()))
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.packages.is_empty() {
            return Err(ManifestError::NoPackages);
        }
        if self.max_certificate_ttl_secs == 0 {
            return Err(ManifestError::ZeroMaxTtl);
        }
        let mut seen: HashMap<Measurement, &str> = HashMap::new();
        for (name, policy) in &self.packages {
            if name.trim().is_empty() {
                return Err(ManifestError::EmptyPackageName);
            }
            if let Some(first) = seen.insert(policy.measurement, name) {
                return Err(ManifestError::DuplicateMeasurement {
                    measurement: policy.measurement,
                    first: first.to_owned(),
                    second: name.clone(),
                });
            }
            let ttl = policy.certificate.ttl_secs;
            if ttl == 0 || ttl > self.max_certificate_ttl_secs {
                return Err(ManifestError::InvalidTtl {
                    package: name.clone(),
                    ttl,
                    max: self.max_certificate_ttl_secs,
                });
            }
            if policy.max_activations == Some(0) {
                return Err(ManifestError::InvalidActivationLimit(name.clone()));
            }
            if policy.certificate.common_name.trim().is_empty() {
                return Err(ManifestError::EmptyCommonName(name.clone()));
            }
        }
        Ok(())
    }

    /// SHA-256 over the canonical JSON form, hex encoded.
    ///
    /// Packages live in a `BTreeMap` and fields serialise in declaration order, so equal
    /// manifests always produce the same bytes.
    pub fn digest(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(canonical))
    }

    pub fn measurements(&self) -> Vec<Measurement> {
        self.packages
            .values()
            .map(|policy| policy.measurement)
            .collect()
    }

    /// Package authorised for `measurement`, if any.
    pub fn package_for(&self, measurement: &Measurement) -> Option<(&str, &PackagePolicy)> {
        self.packages
            .iter()
            .find(|(_, policy)| &policy.measurement == measurement)
            .map(|(name, policy)| (name.as_str(), policy))
    }

    /// Leaf lifetime for a package, never above the manifest maximum.
    pub fn ttl_for(&self, policy: &PackagePolicy) -> Duration {
        Duration::from_secs(
            policy
                .certificate
                .ttl_secs
                .min(self.max_certificate_ttl_secs),
        )
    }
}
