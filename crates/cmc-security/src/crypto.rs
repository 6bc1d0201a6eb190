//! ---
//! cmc_section: "06-security-access-control"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Seal key material handling."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
use std::fs::{self, OpenOptions};
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use anyhow::{bail, Context, Result};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::info;

/// Opaque 256-bit symmetric key used to seal coordinator state.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial([u8; 32]);

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyMaterial({})", &self.fingerprint()[..16])
    }
}

impl KeyMaterial {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generate random key material.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// SHA-256 fingerprint of the key, safe to log and audit.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.0))
    }

    /// Read a key file holding either 32 raw bytes or 64 hex characters.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read(path)
            .with_context(|| format!("unable to read seal key at {}", path.display()))?;
        if contents.len() == 32 {
            let mut bytes = [0u8; 32];
            bytes.copy_from_slice(&contents);
            return Ok(Self(bytes));
        }
        let text = std::str::from_utf8(&contents)
            .map(str::trim)
            .with_context(|| format!("seal key at {} is neither raw nor hex", path.display()))?;
        let decoded = hex::decode(text)
            .with_context(|| format!("seal key at {} is not valid hex", path.display()))?;
        let bytes: [u8; 32] = match decoded.try_into() {
            Ok(bytes) => bytes,
            Err(decoded) => bail!(
                "seal key at {} must be 32 bytes, got {}",
                path.display(),
                decoded.len()
            ),
        };
        Ok(Self(bytes))
    }

    /// Load the key at `path`, generating and persisting one (hex, 0600) if absent.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let key = Self::generate();
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options
            .open(path)
            .with_context(|| format!("unable to create seal key at {}", path.display()))?;
        file.write_all(hex::encode(key.0).as_bytes())?;
        file.sync_all()?;
        info!(path = %path.display(), fingerprint = %&key.fingerprint()[..16], "generated seal key");
        Ok(key)
    }
}
