//! ---
//! cmc_section: "05-networking-external-interfaces"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Mesh activation API."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use cmc_attestation::Quote;
use cmc_core::{ActivationRequest, Core};
use cmc_security::pem_encode;
use serde::{Deserialize, Serialize};
use serde_with::base64::Base64;
use serde_with::serde_as;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::ApiError;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivateRequest {
    pub quote: Quote,
    /// SEC1 uncompressed P-256 public key, base64.
    #[serde_as(as = "Base64")]
    pub public_key: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivateResponse {
    pub id: Uuid,
    pub package: String,
    pub certificate_pem: String,
    pub root_certificate_pem: String,
    pub serial: u64,
    pub expires_at: DateTime<Utc>,
}

struct MeshState {
    core: Arc<Core>,
    request_timeout: Duration,
}

/// `request_timeout` becomes the deadline of every activation.
pub fn mesh_router(core: Arc<Core>, request_timeout: Duration) -> Router {
    Router::new()
        .route("/activate", post(post_activate))
        .with_state(Arc::new(MeshState {
            core,
            request_timeout,
        }))
        .layer(TraceLayer::new_for_http())
}

async fn post_activate(
    State(state): State<Arc<MeshState>>,
    payload: Result<Json<ActivateRequest>, JsonRejection>,
) -> Result<Json<ActivateResponse>, ApiError> {
    let Json(request) = payload.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    let deadline = Instant::now() + state.request_timeout;
    let grant = state
        .core
        .activate(
            ActivationRequest {
                quote: request.quote,
                public_key: request.public_key,
                package: request.package,
            },
            deadline,
        )
        .await?;
    Ok(Json(ActivateResponse {
        id: grant.id,
        package: grant.package,
        certificate_pem: grant.certificate.pem(),
        root_certificate_pem: pem_encode("CERTIFICATE", &grant.root_certificate_der),
        serial: grant.certificate.serial,
        expires_at: grant.certificate.not_after,
    }))
}
