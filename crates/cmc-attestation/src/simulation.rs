//! ---
//! cmc_section: "06-security-access-control"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Attestation gate capabilities consumed by the coordinator core."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
//! Simulated attestation.
//!
//! Quotes are authenticated with HMAC-SHA256 under a shared [`SimulationRoot`] secret which
//! stands in for the hardware root of trust. Layout:
//!
//! ```text
//! magic "CMCSIMQ1" | issued_at u64 BE | measurement [32] | payload_len u32 BE | payload | mac [32]
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::AttestationError;
use crate::types::{CodeIdentity, Measurement, Quote, MEASUREMENT_LEN};
use crate::{Issuer, Validator};

type HmacSha256 = Hmac<Sha256>;

const MAGIC: &[u8; 8] = b"CMCSIMQ1";
const MAC_LEN: usize = 32;
const HEADER_LEN: usize = MAGIC.len() + 8 + MEASUREMENT_LEN + 4;
const MAX_PAYLOAD_LEN: usize = 4096;
/// Tolerated clock skew for quotes stamped slightly in the future.
const FUTURE_SKEW_SECS: i64 = 30;

/// Shared secret acting as the simulated hardware root.
#[derive(Clone)]
pub struct SimulationRoot([u8; 32]);

impl SimulationRoot {
    pub fn new(secret: [u8; 32]) -> Self {
        Self(secret)
    }

    /// Well-known root shared by every simulated workload.
    pub fn development() -> Self {
        Self(Sha256::digest(b"cmc simulation attestation root").into())
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length.
        HmacSha256::new_from_slice(&self.0).unwrap_or_else(|_| unreachable!())
    }
}

impl std::fmt::Debug for SimulationRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SimulationRoot(..)")
    }
}

/// Issues simulated quotes for a fixed measurement.
#[derive(Debug, Clone)]
pub struct SimulationIssuer {
    root: SimulationRoot,
    measurement: Measurement,
}

impl SimulationIssuer {
    pub fn new(root: SimulationRoot, measurement: Measurement) -> Self {
        Self { root, measurement }
    }

    pub fn measurement(&self) -> Measurement {
        self.measurement
    }

    /// Build a quote stamped with an explicit unix timestamp.
    pub fn quote_at(&self, payload: &[u8], issued_at: i64) -> Result<Quote, AttestationError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(AttestationError::Rejected(format!(
                "payload of {} bytes exceeds {} bytes",
                payload.len(),
                MAX_PAYLOAD_LEN
            )));
        }
        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len() + MAC_LEN);
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&issued_at.to_be_bytes());
        bytes.extend_from_slice(self.measurement.as_bytes());
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(payload);
        let mut mac = self.root.mac();
        mac.update(&bytes);
        bytes.extend_from_slice(&mac.finalize().into_bytes());
        Ok(Quote::new(bytes))
    }
}

#[async_trait]
impl Issuer for SimulationIssuer {
    async fn issue(&self, payload: &[u8]) -> Result<Quote, AttestationError> {
        self.quote_at(payload, Utc::now().timestamp())
    }
}

/// Verifies quotes produced by [`SimulationIssuer`] under the same root.
#[derive(Debug, Clone)]
pub struct SimulationValidator {
    root: SimulationRoot,
    max_age: Duration,
}

impl SimulationValidator {
    pub fn new(root: SimulationRoot, max_age: Duration) -> Self {
        Self { root, max_age }
    }

    fn parse(&self, quote: &Quote) -> Result<CodeIdentity, AttestationError> {
        let bytes = quote.as_bytes();
        if bytes.len() < HEADER_LEN + MAC_LEN || &bytes[..MAGIC.len()] != MAGIC {
            return Err(AttestationError::Rejected("malformed quote".into()));
        }
        let (body, tag) = bytes.split_at(bytes.len() - MAC_LEN);
        let mut mac = self.root.mac();
        mac.update(body);
        mac.verify_slice(tag)
            .map_err(|_| AttestationError::Rejected("quote is not rooted in the trust anchor".into()))?;

        let mut cursor = MAGIC.len();
        let issued_at = i64::from_be_bytes(read_array(body, &mut cursor)?);
        let measurement = Measurement::from_bytes(read_array(body, &mut cursor)?);
        let payload_len = u32::from_be_bytes(read_array(body, &mut cursor)?) as usize;
        if body.len() - cursor != payload_len {
            return Err(AttestationError::Rejected("payload length mismatch".into()));
        }
        let payload = body[cursor..].to_vec();

        let now = Utc::now().timestamp();
        if issued_at > now + FUTURE_SKEW_SECS {
            return Err(AttestationError::Rejected("quote is dated in the future".into()));
        }
        let age = now.saturating_sub(issued_at);
        if age > self.max_age.as_secs() as i64 {
            return Err(AttestationError::Rejected(format!(
                "quote is stale ({}s old)",
                age
            )));
        }
        Ok(CodeIdentity {
            measurement,
            payload,
        })
    }
}

fn read_array<const N: usize>(body: &[u8], cursor: &mut usize) -> Result<[u8; N], AttestationError> {
    let slice = body
        .get(*cursor..*cursor + N)
        .ok_or_else(|| AttestationError::Rejected("truncated quote".into()))?;
    *cursor += N;
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    Ok(out)
}

#[async_trait]
impl Validator for SimulationValidator {
    async fn validate(
        &self,
        quote: &Quote,
        expected: &[Measurement],
    ) -> Result<CodeIdentity, AttestationError> {
        let identity = self.parse(quote)?;
        if !expected.contains(&identity.measurement) {
            debug!(measurement = %identity.measurement, "simulated quote asserts unexpected measurement");
            return Err(AttestationError::MeasurementMismatch(identity.measurement));
        }
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measurement() -> Measurement {
        Measurement::digest_of(b"payments-service v1")
    }

    fn pair() -> (SimulationIssuer, SimulationValidator) {
        let root = SimulationRoot::development();
        (
            SimulationIssuer::new(root.clone(), measurement()),
            SimulationValidator::new(root, Duration::from_secs(60)),
        )
    }

    #[tokio::test]
    async fn issued_quote_validates_and_returns_payload() {
        let (issuer, validator) = pair();
        let quote = issuer.issue(b"report-data").await.unwrap();
        let identity = validator.validate(&quote, &[measurement()]).await.unwrap();
        assert_eq!(identity.measurement, measurement());
        assert_eq!(identity.payload, b"report-data");
    }

    #[tokio::test]
    async fn unexpected_measurement_is_a_mismatch() {
        let (issuer, validator) = pair();
        let quote = issuer.issue(b"x").await.unwrap();
        let other = Measurement::digest_of(b"other");
        let err = validator.validate(&quote, &[other]).await.unwrap_err();
        assert_eq!(err, AttestationError::MeasurementMismatch(measurement()));
    }

    #[tokio::test]
    async fn flipped_bit_is_rejected() {
        let (issuer, validator) = pair();
        let mut bytes = issuer.issue(b"x").await.unwrap().into_bytes();
        bytes[12] ^= 0x01;
        let err = validator
            .validate(&Quote::new(bytes), &[measurement()])
            .await
            .unwrap_err();
        assert!(matches!(err, AttestationError::Rejected(_)));
    }

    #[tokio::test]
    async fn foreign_root_is_rejected() {
        let issuer = SimulationIssuer::new(SimulationRoot::new([7u8; 32]), measurement());
        let (_, validator) = pair();
        let quote = issuer.issue(b"x").await.unwrap();
        assert!(matches!(
            validator.validate(&quote, &[measurement()]).await,
            Err(AttestationError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn stale_quote_is_rejected() {
        let (issuer, validator) = pair();
        let quote = issuer
            .quote_at(b"x", Utc::now().timestamp() - 3600)
            .unwrap();
        let err = validator.validate(&quote, &[measurement()]).await.unwrap_err();
        assert!(err.to_string().contains("stale"));
    }

    #[tokio::test]
    async fn garbage_is_rejected_without_panicking() {
        let (_, validator) = pair();
        for bytes in [vec![], vec![0u8; 3], b"CMCSIMQ1".to_vec(), vec![0xff; 200]] {
            assert!(matches!(
                validator.validate(&Quote::new(bytes), &[measurement()]).await,
                Err(AttestationError::Rejected(_))
            ));
        }
    }
}
