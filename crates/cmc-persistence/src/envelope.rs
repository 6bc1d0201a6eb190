//! ---
//! cmc_section: "03-persistence-logging"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Sealed state persistence for the coordinator."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
//! Versioned plaintext envelope placed inside the sealed blob.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors raised while encoding or decoding a state envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The envelope was written by a schema this build does not understand.
    #[error("unsupported state schema version {found} (supported: {supported})")]
    UnsupportedVersion {
        /// Version found in the envelope.
        found: u16,
        /// Version this build reads and writes.
        supported: u16,
    },
    /// The envelope digest does not match its content.
    #[error("state envelope digest mismatch")]
    DigestMismatch,
    /// The envelope could not be serialised or parsed.
    #[error("state envelope malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    schema_version: u16,
    written_at: DateTime<Utc>,
    digest: String,
    state: T,
}

#[derive(Deserialize)]
struct VersionHeader {
    schema_version: u16,
}

/// Serialise `state` into an envelope tagged with `schema_version`.
pub fn encode_state<T: Serialize>(state: &T, schema_version: u16) -> Result<Vec<u8>, EnvelopeError> {
    let envelope = Envelope {
        schema_version,
        written_at: Utc::now(),
        digest: digest(state)?,
        state,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

/// Parse an envelope, checking its version before touching the payload.
pub fn decode_state<T: Serialize + DeserializeOwned>(
    bytes: &[u8],
    schema_version: u16,
) -> Result<T, EnvelopeError> {
    let header: VersionHeader = serde_json::from_slice(bytes)?;
    if header.schema_version != schema_version {
        return Err(EnvelopeError::UnsupportedVersion {
            found: header.schema_version,
            supported: schema_version,
        });
    }
    let envelope: Envelope<T> = serde_json::from_slice(bytes)?;
    if digest(&envelope.state)? != envelope.digest {
        return Err(EnvelopeError::DigestMismatch);
    }
    Ok(envelope.state)
}

fn digest<T: Serialize>(state: &T) -> Result<String, EnvelopeError> {
    let serialized = serde_json::to_vec(state)?;
    Ok(hex::encode(Sha256::digest(serialized)))
}
