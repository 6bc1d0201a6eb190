//! ---
//! cmc_section: "06-security-access-control"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Attestation gate capabilities consumed by the coordinator core."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
//! Attestation gate for the coordinator.
//!
//! The core only talks to the [`Validator`] and [`Issuer`] traits and never looks
//! inside quote bytes. Two backends ship with the crate: a deterministic HMAC based
//! simulation used in development and tests, and an HTTP client for an external
//! attestation service.

pub mod error;
pub mod remote;
pub mod simulation;
pub mod types;

use async_trait::async_trait;

pub use error::AttestationError;
pub use remote::RemoteAttestationClient;
pub use simulation::{SimulationIssuer, SimulationRoot, SimulationValidator};
pub use types::{CodeIdentity, Measurement, MeasurementParseError, Quote};

/// Verifies quotes produced by mesh members.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Check `quote` and return the identity it proves.
    ///
    /// Returns [`AttestationError::Rejected`] for malformed, stale or unrooted quotes and
    /// [`AttestationError::MeasurementMismatch`] when a valid quote asserts a measurement
    /// outside `expected`.
    async fn validate(
        &self,
        quote: &Quote,
        expected: &[Measurement],
    ) -> Result<CodeIdentity, AttestationError>;
}

/// Produces quotes for the coordinator itself.
#[async_trait]
pub trait Issuer: Send + Sync {
    /// Bind `payload` to the coordinator's own measurement.
    async fn issue(&self, payload: &[u8]) -> Result<Quote, AttestationError>;
}
