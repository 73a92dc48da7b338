//! HTTP relay: the browser posts its offer here and gets the answer back.

use crate::error::Error;
use crate::peer::types::{IceServerConfig, SessionAnswer, SessionOffer};
use crate::session::SessionSupervisor;
use axum::extract::State;
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub type SessionRegistry = Arc<RwLock<HashMap<String, DateTime<Utc>>>>;

#[derive(Clone)]
pub struct AppState {
    supervisor: Arc<SessionSupervisor>,
    ice_servers: Arc<Vec<IceServerConfig>>,
    sessions: SessionRegistry,
}

impl AppState {
    pub fn new(supervisor: SessionSupervisor, ice_servers: Vec<IceServerConfig>) -> Self {
        Self {
            supervisor: Arc::new(supervisor),
            ice_servers: Arc::new(ice_servers),
            sessions: SessionRegistry::default(),
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }
}

/// Offer body; `ice_servers` replaces the configured list for this session only.
#[derive(Deserialize)]
struct OfferRequest {
    #[serde(flatten)]
    offer: SessionOffer,
    #[serde(default)]
    ice_servers: Option<Vec<IceServerConfig>>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct Health {
    active_sessions: usize,
    oldest_session: Option<DateTime<Utc>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/offer", post(offer))
        .route("/health", get(health))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE]),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(err: Error) -> Response {
    let status = if err.is_negotiation() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    warn!(status = %status, error = %err, "offer rejected");
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

async fn offer(State(state): State<AppState>, body: String) -> Response {
    let request: OfferRequest = match serde_json::from_str(&body) {
        Ok(r) => r,
        Err(e) => return error_response(Error::invalid_offer(e)),
    };
    let ice_servers = request
        .ice_servers
        .as_deref()
        .unwrap_or(state.ice_servers.as_slice());

    let accepted = match state.supervisor.accept(&request.offer, ice_servers).await {
        Ok(accepted) => accepted,
        Err(e) => return error_response(e),
    };

    state
        .sessions
        .write()
        .await
        .insert(accepted.id.clone(), Utc::now());

    let sessions = state.sessions.clone();
    let id = accepted.id.clone();
    let termination = accepted.termination;
    tokio::spawn(async move {
        let reason = termination.wait().await;
        sessions.write().await.remove(&id);
        info!(session = %id, reason = %reason, "session unregistered");
    });

    let answer: SessionAnswer = accepted.answer;
    (StatusCode::OK, Json(answer)).into_response()
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.sessions.read().await;
    Json(Health {
        active_sessions: sessions.len(),
        oldest_session: sessions.values().min().copied(),
    })
}
