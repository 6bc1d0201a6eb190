//! ---
//! cmc_section: "03-persistence-logging"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Sealed state persistence for the coordinator."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::sealer::{prepare_seal_dir, SealError};

/// Fixed name of the sealed blob inside the seal directory.
pub const SEALED_STATE_FILE: &str = "sealed_state";

/// Errors raised by state stores. All variants are retryable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The stored revision moved since it was read.
    #[error("revision conflict: expected {expected}, found {actual}")]
    Conflict {
        /// Revision the writer based its decision on.
        expected: u64,
        /// Revision currently stored.
        actual: u64,
    },
    /// The backing store could not be reached or written.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store returned data it could not decode.
    #[error("store codec error: {0}")]
    Codec(String),
}

/// Opaque sealed blob together with the revision it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    /// Monotonic revision; `0` never denotes a stored blob.
    pub revision: u64,
    /// Sealed bytes.
    pub bytes: Vec<u8>,
}

/// Durable home of the sealed state blob.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the current blob, `None` when nothing was ever written.
    async fn load(&self) -> Result<Option<StoredBlob>, StoreError>;

    /// Write `bytes` if the stored revision still equals `expected_revision`
    /// (`0` meaning absent) and return the new revision.
    async fn save(&self, expected_revision: u64, bytes: Vec<u8>) -> Result<u64, StoreError>;
}

/// Single-node store keeping the blob at `<seal_dir>/sealed_state`.
///
/// The revision lives in memory; the file is replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct LocalSealedStore {
    path: PathBuf,
    revision: Arc<Mutex<u64>>,
}

impl LocalSealedStore {
    /// Prepare the seal directory and open the store inside it.
    pub fn open(seal_dir: &Path) -> Result<Self, SealError> {
        prepare_seal_dir(seal_dir)?;
        let path = seal_dir.join(SEALED_STATE_FILE);
        let revision = if path.exists() { 1 } else { 0 };
        Ok(Self {
            path,
            revision: Arc::new(Mutex::new(revision)),
        })
    }

    /// Location of the sealed blob.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn unavailable(path: &Path, err: std::io::Error) -> StoreError {
    StoreError::Unavailable(format!("{}: {}", path.display(), err))
}

fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

#[async_trait]
impl StateStore for LocalSealedStore {
    async fn load(&self) -> Result<Option<StoredBlob>, StoreError> {
        let path = self.path.clone();
        let read = tokio::task::spawn_blocking(move || fs::read(&path))
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        match read {
            Ok(bytes) => {
                let mut revision = self.revision.lock();
                if *revision == 0 {
                    *revision = 1;
                }
                Ok(Some(StoredBlob {
                    revision: *revision,
                    bytes,
                }))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(unavailable(&self.path, err)),
        }
    }

    async fn save(&self, expected_revision: u64, bytes: Vec<u8>) -> Result<u64, StoreError> {
        let path = self.path.clone();
        let revision = self.revision.clone();
        // Check, write and bump on the blocking thread: a write that outlives its caller
        // still advances the revision.
        let written = tokio::task::spawn_blocking(move || {
            let mut revision = revision.lock();
            if *revision != expected_revision {
                return Err(StoreError::Conflict {
                    expected: expected_revision,
                    actual: *revision,
                });
            }
            write_atomically(&path, &bytes).map_err(|err| unavailable(&path, err))?;
            *revision += 1;
            Ok(*revision)
        })
        .await
        .map_err(|err| StoreError::Unavailable(err.to_string()))??;
        debug!(path = %self.path.display(), revision = written, "sealed state written");
        Ok(written)
    }
}
