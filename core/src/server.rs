/*
    spotify-backup-rs | Rust CLI tool to back up Spotify playlists to JSON.
    Copyright (C) 2025  Israel Alberto Roldan Vega

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

//! Web mode: a small JSON API that lets a browser front end configure
//! credentials and complete the authorization flow.
//!
//! The server assumes a single user per process. Credentials and tokens live
//! in one [`Session`] behind a lock and are shared by all requests.

use crate::auth::AuthError;
use crate::callback::{MISSING_CODE_PAGE, SUCCESS_PAGE};
use crate::config::{self, Credentials, Settings};
use crate::exchange::TokenExchanger;
use crate::token_store::{StoreError, TokenStore};
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind web server to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("Web server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Mutable per-process state shared by the API handlers.
#[derive(Debug, Default, Clone)]
pub struct Session {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl Session {
    fn credentials(&self, redirect_uri: &str) -> Option<Credentials> {
        match (&self.client_id, &self.client_secret) {
            (Some(id), Some(secret)) => {
                Some(Credentials::new(id.as_str(), secret.as_str(), redirect_uri))
            }
            _ => None,
        }
    }
}

/// Handler context: configuration that never changes plus the locked session.
#[derive(Clone)]
pub struct AppState {
    settings: Arc<Settings>,
    store: Arc<TokenStore>,
    session: Arc<RwLock<Session>>,
}

impl AppState {
    /// Seeds the session from the settings and any refresh token already on disk.
    pub fn new(settings: Settings, store: TokenStore) -> Self {
        let refresh_token = settings
            .refresh_token
            .clone()
            .or_else(|| match store.load() {
                Ok(token) => {
                    info!("Loaded refresh token from {}", store.path().display());
                    Some(token)
                }
                Err(StoreError::NotFound(_)) => None,
                Err(e) => {
                    warn!("Ignoring unreadable token file: {}", e);
                    None
                }
            });

        let session = Session {
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            access_token: settings.access_token.clone(),
            refresh_token,
        };

        Self {
            settings: Arc::new(settings),
            store: Arc::new(store),
            session: Arc::new(RwLock::new(session)),
        }
    }

    pub async fn session(&self) -> Session {
        self.session.read().await.clone()
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub has_token: bool,
    pub has_client_id: bool,
    pub needs_setup: bool,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSetupRequest {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSetupResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthStartResponse {
    pub auth_url: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// JSON error body with a status code.
struct ApiError(StatusCode, String);

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self(StatusCode::BAD_REQUEST, message.into())
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(format!("Invalid request: {}", rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorResponse { error: self.1 })).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(status))
        .route("/auth/setup", post(auth_setup))
        .route("/auth/start", post(auth_start))
        .route("/auth/callback", get(auth_callback))
        .fallback(not_found);

    Router::new().nest("/api", api).with_state(state)
}

/// Serves the API until the process is stopped.
pub async fn serve(addr: SocketAddr, state: AppState) -> Result<(), ServerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;

    info!("Web server listening on {}", addr);
    axum::serve(listener, router(state))
        .await
        .map_err(ServerError::Serve)
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let session = state.session.read().await;
    let has_token = session.access_token.is_some() || session.refresh_token.is_some();
    let has_client_id = session.client_id.is_some();

    let message = if !has_client_id {
        "Please provide Spotify client ID and secret to begin"
    } else if !has_token {
        "Client credentials configured. Ready to authenticate with Spotify"
    } else {
        "Authentication complete. Ready to backup playlists"
    };

    Json(StatusResponse {
        has_token,
        has_client_id,
        needs_setup: !has_client_id,
        message: message.to_string(),
    })
}

async fn auth_setup(
    State(state): State<AppState>,
    payload: Result<Json<AuthSetupRequest>, JsonRejection>,
) -> Result<Json<AuthSetupResponse>, ApiError> {
    let Json(request) = payload?;
    let client_id = request.client_id.trim();
    let client_secret = request.client_secret.trim();
    if client_id.is_empty() || client_secret.is_empty() {
        return Err(ApiError::bad_request(
            "Invalid request: clientId and clientSecret are required",
        ));
    }

    let credentials = Credentials::new(client_id, client_secret, state.settings.redirect_uri.as_str());
    let auth_url = config::authorize_url(&credentials, &state.settings.endpoints)?;

    {
        let mut session = state.session.write().await;
        session.client_id = Some(credentials.client_id);
        session.client_secret = Some(credentials.client_secret);
    }

    Ok(Json(AuthSetupResponse {
        success: true,
        message: "Client credentials saved. Please authorize the application".to_string(),
        auth_url: Some(auth_url),
    }))
}

async fn auth_start(State(state): State<AppState>) -> Result<Json<AuthStartResponse>, ApiError> {
    let credentials = state
        .session
        .read()
        .await
        .credentials(&state.settings.redirect_uri)
        .ok_or_else(|| ApiError::bad_request("Client credentials not configured"))?;

    Ok(Json(AuthStartResponse {
        auth_url: config::authorize_url(&credentials, &state.settings.endpoints)?,
        message: "Please visit the auth URL to authorize the application".to_string(),
    }))
}

fn error_page(status: StatusCode, detail: &str) -> Response {
    let body = format!(
        "<html><body><h1>Error</h1><p>{}</p></body></html>",
        html_escape::encode_text(detail)
    );
    (status, Html(body)).into_response()
}

async fn auth_callback(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(code) = params.get("code").filter(|code| !code.is_empty()) else {
        return (StatusCode::BAD_REQUEST, Html(MISSING_CODE_PAGE)).into_response();
    };

    let redirect_uri = &state.settings.redirect_uri;
    let Some(credentials) = state.session.read().await.credentials(redirect_uri) else {
        return error_page(StatusCode::BAD_REQUEST, "Client credentials not configured");
    };

    let exchanged = match TokenExchanger::new(&credentials, &state.settings.endpoints) {
        Ok(exchanger) => exchanger.exchange_code(code, redirect_uri).await,
        Err(e) => Err(e),
    };
    let pair = match exchanged {
        Ok(pair) => pair,
        Err(e) => {
            warn!("Authorization callback failed: {}", e);
            return error_page(StatusCode::BAD_GATEWAY, &e.to_string());
        }
    };

    if let Err(e) = state.store.save(&pair.refresh_token) {
        warn!("Failed to save refresh token: {}", e);
    } else {
        info!("Refresh token saved to {}", state.store.path().display());
    }

    {
        let mut session = state.session.write().await;
        session.access_token = Some(pair.access_token);
        session.refresh_token = Some(pair.refresh_token);
    }

    (
        StatusCode::OK,
        Html(SUCCESS_PAGE.replace("the terminal", "the application")),
    )
        .into_response()
}

async fn not_found() -> ApiError {
    ApiError(StatusCode::NOT_FOUND, "not found".to_string())
}
