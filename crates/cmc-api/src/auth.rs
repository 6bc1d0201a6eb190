//! ---
//! cmc_section: "06-security-access-control"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "API key authorisation for administrative endpoints."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use axum::http::{header, HeaderMap};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Operations on the client API that need an authorised caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdminOperation {
    SetManifest,
    ReadIssuances,
}

impl AdminOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminOperation::SetManifest => "set-manifest",
            AdminOperation::ReadIssuances => "read-issuances",
        }
    }
}

impl fmt::Display for AdminOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decides whether an API key may perform an administrative operation.
pub trait AdminAuthoriser: Send + Sync + 'static {
    fn authorise(&self, api_key: &str, operation: AdminOperation) -> bool;
}

/// Fixed key list. Keys are held as SHA-256 digests so the configuration never
/// contains usable secrets.
#[derive(Debug, Clone)]
pub struct StaticApiKeyAuthoriser {
    keys: Arc<HashMap<String, Vec<String>>>,
}

impl StaticApiKeyAuthoriser {
    /// Map of hex key digest to permitted operation names (`*` allows all).
    pub fn new(entries: impl IntoIterator<Item = (String, Vec<String>)>) -> Self {
        Self {
            keys: Arc::new(
                entries
                    .into_iter()
                    .map(|(digest, perms)| (digest.to_ascii_lowercase(), perms))
                    .collect(),
            ),
        }
    }

    /// Every digest gets every operation.
    pub fn from_digests(digests: &[String]) -> Self {
        Self::new(
            digests
                .iter()
                .map(|digest| (digest.clone(), vec!["*".to_string()])),
        )
    }

    pub fn digest(api_key: &str) -> String {
        hex::encode(Sha256::digest(api_key.as_bytes()))
    }
}

impl AdminAuthoriser for StaticApiKeyAuthoriser {
    fn authorise(&self, api_key: &str, operation: AdminOperation) -> bool {
        let digest = Self::digest(api_key);
        let Some(permissions) = self.keys.get(&digest) else {
            debug!(key_digest = %&digest[..12], "api key rejected");
            return false;
        };
        let allowed = permissions
            .iter()
            .any(|perm| perm == "*" || perm == operation.as_str());
        if !allowed {
            debug!(key_digest = %&digest[..12], %operation, "api key lacks permission");
        }
        allowed
    }
}

/// Admits everyone. Only wired up in simulation mode without configured keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAuthoriser;

impl AdminAuthoriser for OpenAuthoriser {
    fn authorise(&self, _api_key: &str, _operation: AdminOperation) -> bool {
        true
    }
}

/// Key from `x-api-key`, falling back to `Authorization: Bearer`.
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-api-key")
        .or_else(|| headers.get(header::AUTHORIZATION))
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().trim_start_matches("Bearer ").trim().to_owned())
        .filter(|value| !value.is_empty())
}
