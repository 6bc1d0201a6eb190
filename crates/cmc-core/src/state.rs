//! ---
//! cmc_section: "01-core-functionality"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Sealed coordinator state."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use cmc_attestation::Measurement;
use cmc_persistence::{decode_state, encode_state, Sealer};
use cmc_security::RootIdentity;
use serde::{Deserialize, Serialize};
use serde_with::base64::Base64;
use serde_with::serde_as;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::errors::CoreError;
use crate::manifest::Manifest;

/// Schema of [`SealedState`] written by this build.
pub const STATE_SCHEMA_VERSION: u16 = 1;

/// Leaf serials start above the root's serial.
pub const FIRST_LEAF_SERIAL: u64 = 2;

/// Everything the coordinator must remember across restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SealedState {
    pub root: Option<RootIdentity>,
    pub manifest: Option<Manifest>,
    pub manifest_digest: Option<String>,
    pub issuances: Vec<IssuanceRecord>,
    pub next_serial: u64,
}

impl Default for SealedState {
    fn default() -> Self {
        Self {
            root: None,
            manifest: None,
            manifest_digest: None,
            issuances: Vec::new(),
            next_serial: FIRST_LEAF_SERIAL,
        }
    }
}

impl SealedState {
    pub fn activations_for(&self, package: &str) -> usize {
        self.issuances
            .iter()
            .filter(|record| record.package == package)
            .count()
    }

    pub fn seal(&self, sealer: &dyn Sealer) -> Result<Vec<u8>, CoreError> {
        let plaintext = encode_state(self, STATE_SCHEMA_VERSION)?;
        Ok(sealer.seal(&plaintext)?)
    }

    pub fn unseal(blob: &[u8], sealer: &dyn Sealer) -> Result<Self, CoreError> {
        let plaintext = sealer.unseal(blob)?;
        Ok(decode_state(&plaintext, STATE_SCHEMA_VERSION)?)
    }
}

/// One issued leaf certificate.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IssuanceRecord {
    pub id: Uuid,
    pub serial: u64,
    pub package: String,
    pub measurement: Measurement,
    /// SHA-256 of the member's public key, hex encoded.
    pub public_key_fingerprint: String,
    #[serde_as(as = "Base64")]
    pub certificate_der: Vec<u8>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub fn public_key_fingerprint(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}
