use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing, Json, Router,
};
use derive_new::new;
use serde::Deserialize;
use tracing::{debug, warn};

use relay_core::{PingResponse, RelayTransactionRequest, RelayTransactionResponse};

use crate::handler::RelayServer;

const PING_PATH: &str = "/getaddr";
const RELAY_PATH: &str = "/relay";

#[derive(Debug, Deserialize)]
struct PingQuery {
    paymaster: Option<String>,
}

/// HTTP routes of the relay: ping and submit-relay-request
#[derive(new, Clone)]
pub struct RelayApi {
    server: Arc<RelayServer>,
}

async fn ping(
    State(server): State<Arc<RelayServer>>,
    Query(query): Query<PingQuery>,
) -> Result<Json<PingResponse>, (StatusCode, String)> {
    // an empty or malformed hint is treated as no hint
    let paymaster = query.paymaster.and_then(|p| p.parse().ok());
    match server.ping(paymaster).await {
        Ok(response) => Ok(Json(response)),
        Err(err) => {
            warn!(?err, "Failed to answer ping");
            Err((StatusCode::SERVICE_UNAVAILABLE, err.to_string()))
        }
    }
}

async fn relay(
    State(server): State<Arc<RelayServer>>,
    Json(request): Json<RelayTransactionRequest>,
) -> (StatusCode, Json<RelayTransactionResponse>) {
    match server.create_relay_transaction(request).await {
        Ok(raw_tx) => (StatusCode::OK, Json(RelayTransactionResponse::signed(raw_tx))),
        Err(err) if err.is_rejection() => {
            debug!(%err, "Rejected relay request");
            (
                StatusCode::BAD_REQUEST,
                Json(RelayTransactionResponse::rejected(err.to_string())),
            )
        }
        Err(err) => {
            warn!(?err, "Failed to relay request");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(RelayTransactionResponse::rejected(err.to_string())),
            )
        }
    }
}

impl RelayApi {
    /// Router serving the relay endpoints
    pub fn router(&self) -> Router {
        Router::new()
            .route(PING_PATH, routing::get(ping))
            .route(RELAY_PATH, routing::post(relay))
            .with_state(self.server.clone())
    }
}
