//! ---
//! cmc_section: "01-core-functionality"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Coordinator core error taxonomy."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
use cmc_attestation::{AttestationError, Measurement};
use cmc_persistence::{EnvelopeError, SealError, StoreError};
use cmc_security::CertificateError;
use thiserror::Error;

use crate::core::Lifecycle;
use crate::manifest::ManifestError;

/// Why an activation was refused. Denials are final for the presented quote.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DenialReason {
    #[error("attestation rejected: {0}")]
    AttestationRejected(String),
    #[error("measurement {0} is not permitted")]
    MeasurementMismatch(Measurement),
    #[error("quote does not bind the presented public key")]
    KeyBindingMismatch,
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("measurement {0} is not authorised by the manifest")]
    PolicyDenied(Measurement),
    #[error("requested package {requested} but quote proves {actual}")]
    PackageMismatch { requested: String, actual: String },
    #[error("package {package} reached its activation limit of {limit}")]
    ActivationLimitReached { package: String, limit: u32 },
}

impl DenialReason {
    /// Short stable label for logs and audit entries.
    pub fn kind(&self) -> &'static str {
        match self {
            DenialReason::AttestationRejected(_) => "attestation_rejected",
            DenialReason::MeasurementMismatch(_) => "measurement_mismatch",
            DenialReason::KeyBindingMismatch => "key_binding_mismatch",
            DenialReason::InvalidPublicKey(_) => "invalid_public_key",
            DenialReason::PolicyDenied(_) => "policy_denied",
            DenialReason::PackageMismatch { .. } => "package_mismatch",
            DenialReason::ActivationLimitReached { .. } => "activation_limit_reached",
        }
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("coordinator is not ready (state: {0:?})")]
    NotReady(Lifecycle),
    #[error("a manifest has already been set")]
    AlreadyInitialized,
    #[error("invalid manifest: {0}")]
    InvalidManifest(#[from] ManifestError),
    #[error("activation denied: {0}")]
    ActivationDenied(DenialReason),
    #[error("operation deadline expired")]
    Timeout,
    #[error("replica is stale: {0}")]
    StaleReplica(String),
    #[error("state storage failed: {0}")]
    Storage(StoreError),
    #[error("sealed state is tampered or was sealed with a different key")]
    TamperedOrWrongKey,
    #[error("sealing failed: {0}")]
    Seal(SealError),
    #[error("unsupported sealed state schema version {found} (supported: {supported})")]
    UnsupportedStateFormat { found: u16, supported: u16 },
    #[error("sealed state is corrupt: {0}")]
    CorruptState(String),
    #[error("certificate operation failed: {0}")]
    Certificate(#[from] CertificateError),
    #[error("attestation service unavailable: {0}")]
    AttestationUnavailable(String),
}

impl CoreError {
    /// Transient failures a caller may retry unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Timeout
                | CoreError::StaleReplica(_)
                | CoreError::Storage(_)
                | CoreError::AttestationUnavailable(_)
        )
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { expected, actual } => CoreError::StaleReplica(format!(
                "state moved from revision {} to {}",
                expected, actual
            )),
            other => CoreError::Storage(other),
        }
    }
}

impl From<SealError> for CoreError {
    fn from(err: SealError) -> Self {
        match err {
            SealError::TamperedOrWrongKey => CoreError::TamperedOrWrongKey,
            SealError::UnsupportedFormat { found, supported } => CoreError::UnsupportedStateFormat {
                found: found.into(),
                supported: supported.into(),
            },
            other => CoreError::Seal(other),
        }
    }
}

impl From<EnvelopeError> for CoreError {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::UnsupportedVersion { found, supported } => {
                CoreError::UnsupportedStateFormat { found, supported }
            }
            other => CoreError::CorruptState(other.to_string()),
        }
    }
}

impl From<AttestationError> for CoreError {
    fn from(err: AttestationError) -> Self {
        match err {
            AttestationError::Rejected(reason) => {
                CoreError::ActivationDenied(DenialReason::AttestationRejected(reason))
            }
            AttestationError::MeasurementMismatch(measurement) => {
                CoreError::ActivationDenied(DenialReason::MeasurementMismatch(measurement))
            }
            AttestationError::Unavailable(reason) => CoreError::AttestationUnavailable(reason),
        }
    }
}
