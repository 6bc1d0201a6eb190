//! ---
//! cmc_section: "06-security-access-control"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Attestation gate capabilities consumed by the coordinator core."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
//! HTTP client for an external attestation service.
//!
//! `POST {base}/v1/verify` validates a quote and `POST {base}/v1/quote` produces one for
//! the coordinator. A `403` answer from the verifier is a denial, anything else that is
//! not a success is treated as the service being unavailable.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::error::AttestationError;
use crate::types::{CodeIdentity, Measurement, Quote};
use crate::{Issuer, Validator};

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub quote: Quote,
    pub expected_measurements: Vec<Measurement>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub measurement: Measurement,
    /// Base64 report data.
    pub payload: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DenialKind {
    Rejected,
    MeasurementMismatch,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyDenial {
    pub kind: DenialKind,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub measurement: Option<Measurement>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QuoteRequest {
    /// Base64 report data to bind.
    pub payload: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QuoteResponse {
    pub quote: Quote,
}

/// Client implementing both capabilities against one service.
#[derive(Debug, Clone)]
pub struct RemoteAttestationClient {
    client: Client,
    base: Url,
}

impl RemoteAttestationClient {
    pub fn new(base: Url, timeout: Duration) -> Result<Self, AttestationError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AttestationError::Unavailable(err.to_string()))?;
        Ok(Self { client, base })
    }

    fn endpoint(&self, path: &str) -> Result<Url, AttestationError> {
        self.base
            .join(path)
            .map_err(|err| AttestationError::Unavailable(format!("invalid endpoint: {}", err)))
    }
}

fn unavailable(err: reqwest::Error) -> AttestationError {
    AttestationError::Unavailable(err.to_string())
}

#[async_trait]
impl Validator for RemoteAttestationClient {
    async fn validate(
        &self,
        quote: &Quote,
        expected: &[Measurement],
    ) -> Result<CodeIdentity, AttestationError> {
        let request = VerifyRequest {
            quote: quote.clone(),
            expected_measurements: expected.to_vec(),
        };
        let response = self
            .client
            .post(self.endpoint("v1/verify")?)
            .json(&request)
            .send()
            .await
            .map_err(unavailable)?;

        match response.status() {
            StatusCode::OK => {
                let body: VerifyResponse = response.json().await.map_err(unavailable)?;
                // The service's answer is re-checked against our own expectations.
                if !expected.contains(&body.measurement) {
                    return Err(AttestationError::MeasurementMismatch(body.measurement));
                }
                let payload = BASE64.decode(body.payload.as_bytes()).map_err(|err| {
                    AttestationError::Unavailable(format!("invalid payload encoding: {}", err))
                })?;
                Ok(CodeIdentity {
                    measurement: body.measurement,
                    payload,
                })
            }
            StatusCode::FORBIDDEN => {
                let denial: VerifyDenial = response.json().await.map_err(unavailable)?;
                match (denial.kind, denial.measurement) {
                    (DenialKind::MeasurementMismatch, Some(measurement)) => {
                        Err(AttestationError::MeasurementMismatch(measurement))
                    }
                    _ => Err(AttestationError::Rejected(denial.reason)),
                }
            }
            status => {
                warn!(%status, "attestation verifier returned unexpected status");
                Err(AttestationError::Unavailable(format!(
                    "verifier returned {}",
                    status
                )))
            }
        }
    }
}

#[async_trait]
impl Issuer for RemoteAttestationClient {
    async fn issue(&self, payload: &[u8]) -> Result<Quote, AttestationError> {
        let request = QuoteRequest {
            payload: BASE64.encode(payload),
        };
        let response = self
            .client
            .post(self.endpoint("v1/quote")?)
            .json(&request)
            .send()
            .await
            .map_err(unavailable)?
            .error_for_status()
            .map_err(unavailable)?;
        let body: QuoteResponse = response.json().await.map_err(unavailable)?;
        Ok(body.quote)
    }
}
