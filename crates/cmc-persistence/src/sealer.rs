//! ---
//! cmc_section: "03-persistence-logging"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Sealed state persistence for the coordinator."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
//! Authenticated encryption of state blobs.
//!
//! Blob layout: `"CMCSEAL" | version u8 | nonce [12] | ciphertext | tag [16]`. The eight
//! byte header is bound as associated data.

use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

const MAGIC: &[u8; 7] = b"CMCSEAL";
const SEAL_FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = MAGIC.len() + 1;

/// Errors raised while sealing or unsealing state.
#[derive(Debug, Error)]
pub enum SealError {
    /// Authentication failed: the blob was modified, truncated or sealed under another key.
    #[error("sealed state is tampered or was sealed with a different key")]
    TamperedOrWrongKey,
    /// The blob authenticates but was written in a seal format this build cannot read.
    #[error("sealed state uses seal format {found}, this build reads {supported}")]
    UnsupportedFormat { found: u8, supported: u8 },
    /// The seal directory or its contents cannot be used.
    #[error("seal storage unavailable: {0}")]
    StorageUnavailable(String),
    /// Encryption failed.
    #[error("sealing failed")]
    Crypto,
}

/// Symmetric authenticated encryption of opaque blobs.
pub trait Sealer: Send + Sync {
    /// Encrypt `plaintext` under a fresh nonce.
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError>;
    /// Decrypt a blob produced by [`Sealer::seal`]; never returns partial plaintext.
    fn unseal(&self, blob: &[u8]) -> Result<Vec<u8>, SealError>;
}

/// AES-256-GCM sealer with random 96-bit nonces.
pub struct AesGcmSealer {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl std::fmt::Debug for AesGcmSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AesGcmSealer(..)")
    }
}

impl AesGcmSealer {
    /// Build a sealer from 32 bytes of key material.
    pub fn new(key: &[u8; 32]) -> Result<Self, SealError> {
        let unbound = UnboundKey::new(&AES_256_GCM, key).map_err(|_| SealError::Crypto)?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    fn header(version: u8) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[..MAGIC.len()].copy_from_slice(MAGIC);
        header[MAGIC.len()] = version;
        header
    }

    fn seal_versioned(&self, version: u8, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
        let header = Self::header(version);
        let mut nonce = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce).map_err(|_| SealError::Crypto)?;

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(&header[..]),
                &mut in_out,
            )
            .map_err(|_| SealError::Crypto)?;

        let mut blob = Vec::with_capacity(HEADER_LEN + NONCE_LEN + in_out.len());
        blob.extend_from_slice(&header);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&in_out);
        Ok(blob)
    }
}

impl Sealer for AesGcmSealer {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
        self.seal_versioned(SEAL_FORMAT_VERSION, plaintext)
    }

    fn unseal(&self, blob: &[u8]) -> Result<Vec<u8>, SealError> {
        let tag_len = AES_256_GCM.tag_len();
        if blob.len() < HEADER_LEN + NONCE_LEN + tag_len {
            return Err(SealError::TamperedOrWrongKey);
        }
        let (header, rest) = blob.split_at(HEADER_LEN);
        if &header[..MAGIC.len()] != MAGIC {
            return Err(SealError::TamperedOrWrongKey);
        }
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce)
            .map_err(|_| SealError::TamperedOrWrongKey)?;
        let mut in_out = ciphertext.to_vec();
        // The header is associated data, so a flipped version byte fails here as tampering.
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(header), &mut in_out)
            .map_err(|_| SealError::TamperedOrWrongKey)?;
        let version = header[MAGIC.len()];
        if version != SEAL_FORMAT_VERSION {
            return Err(SealError::UnsupportedFormat {
                found: version,
                supported: SEAL_FORMAT_VERSION,
            });
        }
        Ok(plaintext.to_vec())
    }
}

/// Create the seal directory with owner-only permissions.
pub fn prepare_seal_dir(dir: &Path) -> Result<(), SealError> {
    let unavailable =
        |err: std::io::Error| SealError::StorageUnavailable(format!("{}: {}", dir.display(), err));
    fs::create_dir_all(dir).map_err(unavailable)?;
    #[cfg(unix)]
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700)).map_err(unavailable)?;
    Ok(())
}
