//! Admin HTTP API for viewing and editing the relay config file.
//!
//! Changes are written straight to the TOML file; the poll loop picks them
//! up on its next pass. Every `/api` route needs `Authorization: Bearer`.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, put},
};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{ConfigFile, TextSection};

const REDACTED: &str = "********";

/// Shared state for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    config_path: Arc<PathBuf>,
    token: Arc<SecretString>,
    /// Serialises read-modify-write of the config file.
    write_lock: Arc<Mutex<()>>,
}

/// Build the admin router.
pub fn admin_routes(config_path: PathBuf, token: SecretString) -> Router {
    let state = AdminState {
        config_path: Arc::new(config_path),
        token: Arc::new(token),
        write_lock: Arc::new(Mutex::new(())),
    };

    // Token check runs ahead of the body extractors.
    let api = Router::new()
        .route("/api/config", get(get_config))
        .route("/api/config/text", put(update_text))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/health", get(health))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "mail-relay"
    }))
}

// ── Auth ────────────────────────────────────────────────────────────────

fn authorized(headers: &HeaderMap, token: &SecretString) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|given| {
            bool::from(
                given
                    .trim()
                    .as_bytes()
                    .ct_eq(token.expose_secret().as_bytes()),
            )
        })
}

/// Bearer-token middleware for every `/api` route.
async fn require_token(
    State(state): State<AdminState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    if !authorized(&headers, &state.token) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "Missing or invalid bearer token"})),
        )
            .into_response();
    }
    next.run(request).await
}

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": e.to_string()})),
    )
}

// ── Config ──────────────────────────────────────────────────────────────

/// Replace every secret with a placeholder.
pub fn redact(mut file: ConfigFile) -> ConfigFile {
    let mask = |s: &mut String| {
        if !s.is_empty() {
            *s = REDACTED.to_string();
        }
    };
    mask(&mut file.mailbox.password);
    if let Some(text) = file.text.as_mut() {
        mask(&mut text.auth_token);
    }
    if let Some(chat) = file.chat.as_mut() {
        mask(&mut chat.bot_token);
    }
    file
}

async fn get_config(State(state): State<AdminState>) -> impl IntoResponse {
    match ConfigFile::load(&state.config_path) {
        Ok(file) => (StatusCode::OK, Json(serde_json::json!(redact(file)))),
        Err(e) => internal_error(e),
    }
}

/// Partial update of the `[text]` table. Absent fields are left alone; a
/// blank `auth_token` keeps the stored one.
#[derive(Debug, Default, Deserialize)]
pub struct TextUpdate {
    pub enabled: Option<bool>,
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    pub from_number: Option<String>,
    pub destination_number: Option<String>,
    pub max_length: Option<usize>,
}

impl TextUpdate {
    fn apply(self, text: &mut TextSection) {
        if let Some(enabled) = self.enabled {
            text.enabled = enabled;
        }
        if let Some(sid) = self.account_sid {
            text.account_sid = sid.trim().to_string();
        }
        if let Some(token) = self.auth_token.filter(|t| !t.trim().is_empty()) {
            text.auth_token = token.trim().to_string();
        }
        if let Some(from) = self.from_number {
            text.from_number = from.trim().to_string();
        }
        if let Some(dest) = self.destination_number {
            text.destination_number = dest.trim().to_string();
        }
        if let Some(max) = self.max_length {
            text.max_length = Some(max);
        }
    }
}

async fn update_text(
    State(state): State<AdminState>,
    Json(update): Json<TextUpdate>,
) -> impl IntoResponse {
    if update.max_length == Some(0) {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "max_length must be greater than zero"})),
        );
    }

    let _guard = state.write_lock.lock().await;

    let mut file = match ConfigFile::load(&state.config_path) {
        Ok(file) => file,
        Err(e) => return internal_error(e),
    };
    update.apply(file.text.get_or_insert_with(TextSection::default));

    if let Err(e) = file.save(&state.config_path) {
        warn!(error = %e, "Failed to save configuration");
        return internal_error(e);
    }

    info!(path = %state.config_path.display(), "Text channel configuration saved");
    (StatusCode::OK, Json(serde_json::json!(redact(file).text)))
}
