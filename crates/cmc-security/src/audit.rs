//! ---
//! cmc_section: "06-security-access-control"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Hash-chained audit trail for security decisions."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Outcome of an audited decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Granted,
    Denied,
}

/// Entry recorded in the audit trail. Never carries key material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// Node that made the decision.
    pub node: String,
    /// Event type, e.g. `activation`, `manifest.set`, `state.unseal`.
    pub action: String,
    pub outcome: AuditOutcome,
    pub detail: serde_json::Value,
    pub hash: String,
    pub previous_hash: String,
}

impl AuditEntry {
    fn compute_hash(
        sequence: u64,
        timestamp: DateTime<Utc>,
        node: &str,
        action: &str,
        outcome: AuditOutcome,
        detail: &serde_json::Value,
        previous_hash: &str,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(sequence.to_be_bytes());
        hasher.update(
            timestamp
                .timestamp_nanos_opt()
                .unwrap_or_default()
                .to_be_bytes(),
        );
        hasher.update(node.as_bytes());
        hasher.update(action.as_bytes());
        hasher.update([outcome as u8]);
        hasher.update(detail.to_string().as_bytes());
        hasher.update(previous_hash.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn recompute(&self, previous_hash: &str) -> String {
        Self::compute_hash(
            self.sequence,
            self.timestamp,
            &self.node,
            &self.action,
            self.outcome,
            &self.detail,
            previous_hash,
        )
    }
}

fn genesis_hash() -> String {
    "0".repeat(64)
}

/// Append-only audit trail stored as newline-delimited JSON.
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    node: String,
    next_sequence: u64,
    last_hash: String,
}

impl AuditLog {
    /// Open (or create on first append) the trail at `path`, resuming from its head.
    pub fn open(path: impl AsRef<Path>, node: impl Into<String>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut log = Self {
            path,
            node: node.into(),
            next_sequence: 0,
            last_hash: genesis_hash(),
        };
        for entry in log.entries()? {
            log.next_sequence = entry.sequence + 1;
            log.last_hash = entry.hash;
        }
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(
        &mut self,
        action: &str,
        outcome: AuditOutcome,
        detail: serde_json::Value,
    ) -> Result<AuditEntry> {
        let timestamp = Utc::now();
        let hash = AuditEntry::compute_hash(
            self.next_sequence,
            timestamp,
            &self.node,
            action,
            outcome,
            &detail,
            &self.last_hash,
        );
        let entry = AuditEntry {
            sequence: self.next_sequence,
            timestamp,
            node: self.node.clone(),
            action: action.to_owned(),
            outcome,
            detail,
            hash: hash.clone(),
            previous_hash: self.last_hash.clone(),
        };

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options
            .open(&self.path)
            .with_context(|| format!("unable to open audit log {}", self.path.display()))?;
        file.write_all(serde_json::to_string(&entry)?.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        self.next_sequence += 1;
        self.last_hash = hash;
        Ok(entry)
    }

    pub fn entries(&self) -> Result<Vec<AuditEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for line in BufReader::new(fs::File::open(&self.path)?).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }

    /// Verify the hash chain; false if any entry was altered, removed or reordered.
    pub fn verify(&self) -> Result<bool> {
        let mut previous = genesis_hash();
        for (index, entry) in self.entries()?.into_iter().enumerate() {
            if entry.sequence != index as u64
                || entry.previous_hash != previous
                || entry.recompute(&previous) != entry.hash
            {
                return Ok(false);
            }
            previous = entry.hash;
        }
        Ok(true)
    }
}
