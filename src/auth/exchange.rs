//! Request token exchange.
//!
//! Trades the one-time `request_token` from the login redirect for an access
//! token by POSTing to the broker's session endpoint.

use super::ExchangeError;
use crate::credentials::CredentialRecord;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};

/// Broker API version header value
pub const KITE_API_VERSION: &str = "3";

/// Where and as whom to exchange.
#[derive(Clone, Debug)]
pub struct ExchangeSettings {
    pub token_url: String,
    pub api_key: String,
    pub api_secret: String,
}

/// Session endpoint response envelope
#[derive(Deserialize, Debug)]
struct SessionEnvelope {
    status: String,
    #[serde(default)]
    data: Option<SessionData>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error_type: Option<String>,
}

#[derive(Deserialize, Debug)]
struct SessionData {
    access_token: String,
    #[serde(default)]
    user_id: Option<String>,
    /// Only some deployments report an explicit lifetime
    #[serde(default)]
    expires_in: Option<i64>,
}

/// SHA-256 of `api_key + request_token + api_secret`, hex encoded.
pub fn checksum(api_key: &str, request_token: &str, api_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hasher.update(request_token.as_bytes());
    hasher.update(api_secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn transport_error(e: reqwest::Error) -> ExchangeError {
    if e.is_timeout() {
        ExchangeError::Timeout
    } else {
        ExchangeError::Transport(e.to_string())
    }
}

/// Exchange a request token for a credential record.
///
/// The client's own timeout bounds the call.
pub async fn exchange_request_token(
    client: &Client,
    settings: &ExchangeSettings,
    request_token: &str,
) -> Result<CredentialRecord, ExchangeError> {
    let checksum = checksum(&settings.api_key, request_token, &settings.api_secret);
    let form = [
        ("api_key", settings.api_key.as_str()),
        ("request_token", request_token),
        ("checksum", checksum.as_str()),
    ];

    tracing::debug!("Exchanging request token at {}", settings.token_url);

    let response = client
        .post(&settings.token_url)
        .header("X-Kite-Version", KITE_API_VERSION)
        .form(&form)
        .send()
        .await
        .map_err(transport_error)?;

    let status = response.status();
    let body = response.text().await.map_err(transport_error)?;
    let envelope: Option<SessionEnvelope> = serde_json::from_str(&body).ok();

    if !status.is_success() {
        let message = envelope
            .and_then(|e| e.message)
            .unwrap_or_else(|| body.chars().take(200).collect());
        return Err(ExchangeError::Rejected {
            status: status.as_u16(),
            message,
        });
    }

    let envelope = envelope.ok_or_else(|| ExchangeError::Rejected {
        status: status.as_u16(),
        message: "Unparseable session response".to_string(),
    })?;

    if envelope.status != "success" {
        return Err(ExchangeError::Rejected {
            status: status.as_u16(),
            message: envelope
                .message
                .or(envelope.error_type)
                .unwrap_or_else(|| format!("Session status '{}'", envelope.status)),
        });
    }

    let data = envelope
        .data
        .filter(|d| !d.access_token.is_empty())
        .ok_or_else(|| ExchangeError::Rejected {
            status: status.as_u16(),
            message: "No access token in session response".to_string(),
        })?;

    tracing::debug!(
        user_id = ?data.user_id,
        expires_in = ?data.expires_in,
        "Request token exchange successful"
    );

    Ok(CredentialRecord::issued(
        data.access_token,
        settings.api_key.clone(),
        data.user_id,
        Utc::now(),
        data.expires_in,
    ))
}
