//! Callback server: receives the broker's post-login redirect.
//!
//! Routes:
//! - `GET /callback` browser redirect target, answers with an HTML page
//! - `POST /auth/exchange` manual path for hosts the redirect cannot reach
//! - `POST /auth/invalidate` forces a new login, keeping the stored record
//! - `GET /health` liveness, no side effects

use super::AppError;
use crate::auth::{extract_request_token, CallbackParams, ExchangeError, ExchangeOutcome, TokenExchanger};
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shared application state for the callback server
#[derive(Clone)]
pub struct CallbackAppState {
    pub exchanger: Arc<TokenExchanger>,
    pub headless: bool,
}

/// Manual exchange request body; one of the two fields is required
#[derive(Debug, Deserialize)]
pub struct ManualExchangeRequest {
    pub request_token: Option<String>,
    /// Full redirect URL copied from the browser address bar
    pub callback_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    pub success: bool,
    /// `false` when no session was stored
    pub invalidated: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ManualExchangeResponse {
    pub success: bool,
    pub outcome: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Create callback server router
pub fn create_callback_router(state: CallbackAppState) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/health", get(health))
        .route("/callback", get(callback))
        .route("/auth/exchange", post(manual_exchange))
        .route("/auth/invalidate", post(invalidate))
        .with_state(Arc::new(state))
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn page(status: StatusCode, title: &str, message: &str) -> Response {
    let body = format!(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>{title}</title></head>\n\
         <body style=\"font-family: sans-serif; max-width: 40em; margin: 4em auto;\">\n\
         <h1>{title}</h1>\n<p>{message}</p>\n</body>\n</html>\n",
        title = escape_html(title),
        message = escape_html(message),
    );
    (status, Html(body)).into_response()
}

/// HTTP status for a failed exchange
fn exchange_error_status(err: &ExchangeError) -> StatusCode {
    match err {
        ExchangeError::InvalidCode(_) => StatusCode::BAD_REQUEST,
        ExchangeError::Rejected { .. }
        | ExchangeError::Transport(_)
        | ExchangeError::Timeout
        | ExchangeError::Interrupted => StatusCode::BAD_GATEWAY,
        ExchangeError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<ExchangeError> for AppError {
    fn from(err: ExchangeError) -> Self {
        let message = err.to_string();
        match exchange_error_status(&err) {
            StatusCode::BAD_REQUEST => AppError::BadRequest(message),
            StatusCode::BAD_GATEWAY => AppError::BadGateway(message),
            _ => AppError::ServerError(message),
        }
    }
}

/// GET /
async fn banner() -> Json<serde_json::Value> {
    Json(json!({
        "service": "kite-callback",
        "endpoints": ["/callback", "/auth/exchange", "/auth/invalidate", "/health"]
    }))
}

/// GET /health
async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "healthy", "server": "callback"}))
}

/// GET /callback
///
/// Broker redirect target. Exchanges the request token at most once and
/// reports the result to the user's browser.
async fn callback(
    State(state): State<Arc<CallbackAppState>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    debug!(status = ?params.status, action = ?params.action, "Login callback received");

    if let Some(failure) = params.failure() {
        warn!(reason = %failure, "Login did not succeed");
        return page(
            StatusCode::BAD_REQUEST,
            "Login failed",
            &format!("The broker reported: {}. Request a new login URL and try again.", failure),
        );
    }

    let Some(code) = params.request_token.as_deref().filter(|t| !t.trim().is_empty()) else {
        warn!("Login callback without request_token");
        return page(
            StatusCode::BAD_REQUEST,
            "Login failed",
            "The redirect did not include a request token.",
        );
    };

    match state.exchanger.exchange_once(code).await {
        Ok(ExchangeOutcome::Exchanged(record)) => {
            info!("Login completed via callback");
            page(
                StatusCode::OK,
                "Login successful",
                &format!(
                    "Your Kite session is active until {}. You can close this window and return to your assistant.",
                    record.expires_at.to_rfc3339()
                ),
            )
        }
        Ok(ExchangeOutcome::Duplicate) => page(
            StatusCode::OK,
            "Login already completed",
            "This login was already processed. You can close this window.",
        ),
        Err(e) => page(
            exchange_error_status(&e),
            "Login failed",
            &format!("{}. Request a new login URL and try again.", e),
        ),
    }
}

/// POST /auth/exchange
///
/// Same exchange as the callback, for when the browser cannot reach this
/// server. Accepts either the bare request token or the full redirect URL.
async fn manual_exchange(
    State(state): State<Arc<CallbackAppState>>,
    payload: Result<Json<ManualExchangeRequest>, JsonRejection>,
) -> Result<Json<ManualExchangeResponse>, AppError> {
    let Json(request) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;

    let code = match (request.request_token, request.callback_url) {
        (Some(token), _) if !token.trim().is_empty() => token,
        (_, Some(url)) => extract_request_token(&url).ok_or_else(|| {
            AppError::BadRequest("callback_url does not contain a request_token".to_string())
        })?,
        _ => {
            return Err(AppError::BadRequest(
                "Either request_token or callback_url is required".to_string(),
            ))
        }
    };

    debug!(headless = state.headless, "Manual exchange requested");

    let response = match state.exchanger.exchange_once(&code).await? {
        ExchangeOutcome::Exchanged(record) => ManualExchangeResponse {
            success: true,
            outcome: "exchanged",
            message: "Session stored".to_string(),
            expires_at: Some(record.expires_at),
            user_id: record.user_id,
        },
        ExchangeOutcome::Duplicate => ManualExchangeResponse {
            success: true,
            outcome: "duplicate",
            message: "Request token was already exchanged".to_string(),
            expires_at: None,
            user_id: None,
        },
    };

    Ok(Json(response))
}

/// POST /auth/invalidate
///
/// Marks the stored session invalid. The record stays on disk so status
/// output can still show who was logged in and until when.
async fn invalidate(
    State(state): State<Arc<CallbackAppState>>,
) -> Result<Json<InvalidateResponse>, AppError> {
    let invalidated = state.exchanger.invalidate_session().await?;
    let message = if invalidated {
        "Session invalidated; log in again to continue trading"
    } else {
        "No session stored"
    };

    Ok(Json(InvalidateResponse {
        success: true,
        invalidated,
        message: message.to_string(),
    }))
}
