//! ---
//! cmc_section: "06-security-access-control"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Attestation gate capabilities consumed by the coordinator core."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
use thiserror::Error;

use crate::types::Measurement;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AttestationError {
    #[error("quote rejected: {0}")]
    Rejected(String),
    #[error("measurement {0} is not among the expected measurements")]
    MeasurementMismatch(Measurement),
    #[error("attestation service unavailable: {0}")]
    Unavailable(String),
}

impl AttestationError {
    /// True for failures caused by the quote itself rather than the backend.
    pub fn is_denial(&self) -> bool {
        !matches!(self, AttestationError::Unavailable(_))
    }
}
