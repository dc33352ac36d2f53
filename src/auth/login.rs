//! Login URL construction and callback URL parsing.

use serde::Deserialize;
use std::collections::HashMap;

/// Build the broker login URL the user opens in a browser.
///
/// Deterministic for a given configuration; no state is created.
pub fn build_login_url(login_base: &str, api_key: &str, redirect_url: &str) -> String {
    format!(
        "{}?v=3&api_key={}&redirect_url={}",
        login_base,
        urlencoding::encode(api_key),
        urlencoding::encode(redirect_url)
    )
}

/// Query parameters the broker appends to the redirect URL
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub request_token: Option<String>,
    pub status: Option<String>,
    pub action: Option<String>,
    /// Some failure redirects carry an error description instead of a status
    pub error: Option<String>,
}

impl CallbackParams {
    /// `status` is absent on some redirects. `success` and `ok` both mean the
    /// login went through; any other explicit status is a failure.
    pub fn failure(&self) -> Option<String> {
        if let Some(error) = self.error.as_deref().filter(|e| !e.is_empty()) {
            return Some(error.to_string());
        }
        match self.status.as_deref().map(str::trim) {
            None | Some("success") | Some("ok") => None,
            Some(status) => Some(format!("Login status '{}'", status)),
        }
    }
}

/// Pull `request_token` out of a full callback URL pasted by the user.
///
/// Accepts anything with a query string, e.g.
/// `http://localhost:8080/callback?request_token=abc&action=login&status=success`.
pub fn extract_request_token(callback_url: &str) -> Option<String> {
    let query = callback_url.split_once('?')?.1;
    let query = query.split('#').next().unwrap_or(query);
    let params: HashMap<String, String> = serde_urlencoded::from_str(query).ok()?;
    params
        .get("request_token")
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}
