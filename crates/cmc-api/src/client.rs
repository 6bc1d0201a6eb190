//! ---
//! cmc_section: "05-networking-external-interfaces"
//! cmc_subsection: "module"
//! cmc_type: "source"
//! cmc_scope: "code"
//! cmc_description: "Client control API routes."
//! cmc_version: "v0.0.0-prealpha"
//! cmc_owner: "tbd"
//! ---
//! Control surface for mesh operators: manifest upload, root certificate, coordinator
//! quote and issuance history.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use cmc_attestation::Quote;
use cmc_core::{Core, CoreError, CoreStatus, IssuanceRecord, Manifest};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::{extract_api_key, AdminAuthoriser, AdminOperation};
use crate::error::ApiError;

struct ClientState {
    core: Arc<Core>,
    authoriser: Arc<dyn AdminAuthoriser>,
}

impl ClientState {
    fn authorise(&self, headers: &HeaderMap, operation: AdminOperation) -> Result<(), ApiError> {
        let Some(api_key) = extract_api_key(headers) else {
            return Err(ApiError::unauthorised());
        };
        if self.authoriser.authorise(&api_key, operation) {
            Ok(())
        } else {
            Err(ApiError::forbidden())
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestAck {
    pub digest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuoteResponse {
    pub root_certificate_pem: String,
    /// Quote over the SHA-256 of the root certificate DER.
    pub quote: Quote,
}

pub fn client_router(core: Arc<Core>, authoriser: Arc<dyn AdminAuthoriser>) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/manifest", get(get_manifest).post(post_manifest))
        .route("/certificate/root", get(get_root_certificate))
        .route("/quote", get(get_quote))
        .route("/issuances", get(get_issuances))
        .with_state(Arc::new(ClientState { core, authoriser }))
        .layer(TraceLayer::new_for_http())
}

async fn get_status(State(state): State<Arc<ClientState>>) -> Json<CoreStatus> {
    Json(state.core.status())
}

async fn get_manifest(State(state): State<Arc<ClientState>>) -> Result<Json<Manifest>, ApiError> {
    Ok(Json(state.core.manifest()?))
}

async fn post_manifest(
    State(state): State<Arc<ClientState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ManifestAck>, ApiError> {
    state.authorise(&headers, AdminOperation::SetManifest)?;
    let manifest = Manifest::from_json(&body).map_err(CoreError::from)?;
    let digest = state.core.set_manifest(manifest).await?;
    info!(digest = %digest, "manifest installed via client api");
    Ok(Json(ManifestAck { digest }))
}

async fn get_root_certificate(
    State(state): State<Arc<ClientState>>,
) -> Result<impl IntoResponse, ApiError> {
    let root = state.core.root_certificate()?;
    Ok((
        [(header::CONTENT_TYPE, "application/x-pem-file")],
        root.certificate_pem(),
    ))
}

async fn get_quote(State(state): State<Arc<ClientState>>) -> Result<Json<QuoteResponse>, ApiError> {
    let quoted = state.core.coordinator_quote().await?;
    Ok(Json(QuoteResponse {
        root_certificate_pem: quoted.root_certificate_pem,
        quote: quoted.quote,
    }))
}

async fn get_issuances(
    State(state): State<Arc<ClientState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<IssuanceRecord>>, ApiError> {
    state.authorise(&headers, AdminOperation::ReadIssuances)?;
    Ok(Json(state.core.issuances()))
}
