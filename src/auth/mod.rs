//! Broker login: request token capture and exchange.
//!
//! Flow:
//! 1. Agent calls `get_kite_login_url`, user opens it in a browser
//! 2. User logs in on the broker's site
//! 3. Broker redirects to `GET /callback?request_token=...&status=success`
//! 4. [`TokenExchanger::exchange_once`] trades the token for an access token
//! 5. The new credential record replaces the old one in the token store

mod consumed;
mod exchange;
mod login;

pub use consumed::{fingerprint, run_code_cleanup, Claim, CodeStatus, ConsumedCodes};
pub use exchange::{checksum, exchange_request_token, ExchangeSettings, KITE_API_VERSION};
pub use login::{build_login_url, extract_request_token, CallbackParams};

use crate::config::KiteConfig;
use crate::credentials::{CredentialRecord, TokenStore};
use anyhow::{Context, Result};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Result of a capture attempt that did not fail.
#[derive(Clone, Debug, PartialEq)]
pub enum ExchangeOutcome {
    /// Token exchanged and committed to the store
    Exchanged(CredentialRecord),
    /// Request token was already exchanged successfully; nothing was done
    Duplicate,
}

impl ExchangeOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ExchangeOutcome::Exchanged(_) => "exchanged",
            ExchangeOutcome::Duplicate => "duplicate",
        }
    }
}

/// Exchange failures. The previously stored record is never touched.
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeError {
    /// Request token empty or malformed
    InvalidCode(String),
    /// Broker answered and refused
    Rejected { status: u16, message: String },
    /// Broker unreachable
    Transport(String),
    /// Broker did not answer in time
    Timeout,
    /// Exchange succeeded but the record could not be persisted
    Store(String),
    /// An earlier exchange of the same request token was abandoned midway
    Interrupted,
}

impl std::fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExchangeError::InvalidCode(msg) => write!(f, "Invalid request token: {}", msg),
            ExchangeError::Rejected { status, message } => {
                write!(f, "Broker rejected token exchange ({}): {}", status, message)
            }
            ExchangeError::Transport(msg) => write!(f, "Could not reach broker: {}", msg),
            ExchangeError::Timeout => write!(f, "Token exchange timed out"),
            ExchangeError::Store(msg) => write!(f, "Failed to store session: {}", msg),
            ExchangeError::Interrupted => {
                write!(f, "An earlier exchange of this request token did not finish")
            }
        }
    }
}

impl std::error::Error for ExchangeError {}

/// Validate request token shape before anything else sees it
pub fn validate_request_token(code: &str) -> Result<&str, ExchangeError> {
    let code = code.trim();
    if code.is_empty() {
        return Err(ExchangeError::InvalidCode("request token is empty".to_string()));
    }
    if !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ExchangeError::InvalidCode(
            "request token must be alphanumeric".to_string(),
        ));
    }
    Ok(code)
}

/// Log-safe request token prefix
fn token_hint(code: &str) -> String {
    let prefix: String = code.chars().take(6).collect();
    format!("{}...", prefix)
}

/// Exchanges each request token at most once and commits the result.
pub struct TokenExchanger {
    settings: ExchangeSettings,
    store: Arc<dyn TokenStore>,
    consumed: ConsumedCodes,
    client: Client,
    /// One exchange in flight at a time; the last to finish owns the store
    in_flight: Mutex<()>,
}

impl TokenExchanger {
    pub fn new(config: &KiteConfig, store: Arc<dyn TokenStore>) -> Result<Self> {
        Self::with_settings(
            ExchangeSettings {
                token_url: config.token_url.clone(),
                api_key: config.api_key.clone(),
                api_secret: config.api_secret.clone(),
            },
            store,
            config.exchange_timeout,
            config.duplicate_window_seconds,
        )
    }

    pub fn with_settings(
        settings: ExchangeSettings,
        store: Arc<dyn TokenStore>,
        timeout: Duration,
        duplicate_window_seconds: i64,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            settings,
            store,
            consumed: ConsumedCodes::new(duplicate_window_seconds),
            client,
            in_flight: Mutex::new(()),
        })
    }

    /// Tracker handle, for the periodic cleanup task
    pub fn consumed_codes(&self) -> ConsumedCodes {
        self.consumed.clone()
    }

    /// Exchange `code` unless it was already consumed.
    ///
    /// The code is claimed before the broker is called and stays claimed
    /// whatever the outcome: request tokens are single-use at the broker, so
    /// a retry could only fail. A replay gets the recorded outcome of the
    /// first exchange (`Duplicate` after success, the same error after a
    /// failure), waiting for it if that exchange is still running.
    pub async fn exchange_once(&self, code: &str) -> Result<ExchangeOutcome, ExchangeError> {
        let code = validate_request_token(code)?;

        match self.consumed.claim(code) {
            Claim::Fresh => {}
            Claim::Replay(CodeStatus::Pending) => return self.replay_after_pending(code).await,
            Claim::Replay(status) => return replay_outcome(code, status),
        }

        let mut claim = PendingClaim {
            codes: &self.consumed,
            code,
            settled: false,
        };

        let _permit = self.in_flight.lock().await;
        let result = self.exchange_and_store(code).await;
        claim.settle(match &result {
            Ok(_) => CodeStatus::Exchanged,
            Err(e) => CodeStatus::Failed(e.clone()),
        });

        result.map(ExchangeOutcome::Exchanged)
    }

    /// A replay that arrived while the first exchange was running. The owner
    /// queued on `in_flight` first and settles before releasing it.
    async fn replay_after_pending(&self, code: &str) -> Result<ExchangeOutcome, ExchangeError> {
        let _permit = self.in_flight.lock().await;
        match self.consumed.status(code) {
            Some(CodeStatus::Pending) | None => {
                warn!(request_token = %token_hint(code), "Replayed request token has no settled exchange");
                Err(ExchangeError::Interrupted)
            }
            Some(status) => replay_outcome(code, status),
        }
    }

    async fn exchange_and_store(&self, code: &str) -> Result<CredentialRecord, ExchangeError> {
        let record = match exchange_request_token(&self.client, &self.settings, code).await {
            Ok(record) => record,
            Err(e) => {
                warn!(request_token = %token_hint(code), error = %e, "Token exchange failed");
                return Err(e);
            }
        };

        let store = Arc::clone(&self.store);
        let to_write = record.clone();
        tokio::task::spawn_blocking(move || store.write(&to_write))
            .await
            .map_err(|e| ExchangeError::Store(format!("store task failed: {}", e)))?
            .map_err(|e| {
                warn!(error = %format!("{:#}", e), "Failed to store broker session");
                ExchangeError::Store(format!("{:#}", e))
            })?;

        info!(
            user_id = record.user_id.as_deref().unwrap_or("unknown"),
            expires_at = %record.expires_at.to_rfc3339(),
            "Broker session stored"
        );

        Ok(record)
    }

    /// Mark the stored session invalid so the next privileged call asks for
    /// a new login. The record itself is kept.
    ///
    /// Returns `false` when no session was stored.
    pub async fn invalidate_session(&self) -> Result<bool, ExchangeError> {
        let _permit = self.in_flight.lock().await;

        let store = Arc::clone(&self.store);
        let invalidated = tokio::task::spawn_blocking(move || store.invalidate())
            .await
            .map_err(|e| ExchangeError::Store(format!("store task failed: {}", e)))?
            .map_err(|e| ExchangeError::Store(format!("{:#}", e)))?;

        info!(invalidated = invalidated, "Session invalidation requested");
        Ok(invalidated)
    }
}

fn replay_outcome(code: &str, status: CodeStatus) -> Result<ExchangeOutcome, ExchangeError> {
    match status {
        CodeStatus::Failed(e) => {
            info!(request_token = %token_hint(code), error = %e, "Replayed request token already failed");
            Err(e)
        }
        _ => {
            info!(request_token = %token_hint(code), "Duplicate request token ignored");
            Ok(ExchangeOutcome::Duplicate)
        }
    }
}

/// Claimed token whose exchange has not reported back. Dropping it unsettled
/// (the handler future was cancelled) records the exchange as interrupted.
struct PendingClaim<'a> {
    codes: &'a ConsumedCodes,
    code: &'a str,
    settled: bool,
}

impl PendingClaim<'_> {
    fn settle(&mut self, status: CodeStatus) {
        self.codes.settle(self.code, status);
        self.settled = true;
    }
}

impl Drop for PendingClaim<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.codes
                .settle(self.code, CodeStatus::Failed(ExchangeError::Interrupted));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::FileTokenStore;
    use chrono::{Duration as ChronoDuration, Utc};
    use mockito::{Matcher, Server, ServerGuard};

    fn exchanger(server: &ServerGuard, store: Arc<dyn TokenStore>, timeout: Duration) -> TokenExchanger {
        TokenExchanger::with_settings(
            ExchangeSettings {
                token_url: format!("{}/session/token", server.url()),
                api_key: "test_key".to_string(),
                api_secret: "test_secret".to_string(),
            },
            store,
            timeout,
            600,
        )
        .unwrap()
    }

    fn file_store(dir: &tempfile::TempDir) -> Arc<FileTokenStore> {
        Arc::new(FileTokenStore::new(dir.path().join("kite_tokens.json")).unwrap())
    }

    fn success_body(token: &str) -> String {
        format!(
            r#"{{"status":"success","data":{{"access_token":"{}","user_id":"AB1234"}}}}"#,
            token
        )
    }

    #[test]
    fn test_validate_request_token() {
        assert_eq!(validate_request_token(" abc123 ").unwrap(), "abc123");
        assert!(matches!(validate_request_token(""), Err(ExchangeError::InvalidCode(_))));
        assert!(matches!(validate_request_token("   "), Err(ExchangeError::InvalidCode(_))));
        assert!(matches!(
            validate_request_token("abc&status=x"),
            Err(ExchangeError::InvalidCode(_))
        ));
    }

    #[tokio::test]
    async fn test_exchange_commits_record() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/session/token")
            .with_status(200)
            .with_body(success_body("acc_1"))
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        let exchanger = exchanger(&server, store.clone(), Duration::from_secs(5));

        let outcome = exchanger.exchange_once("req1").await.unwrap();
        let ExchangeOutcome::Exchanged(record) = outcome else {
            panic!("expected exchange");
        };
        assert_eq!(record.access_token, "acc_1");
        assert_eq!(store.read().unwrap(), Some(record));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_duplicate_code_exchanges_once() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/session/token")
            .with_status(200)
            .with_body(success_body("acc_1"))
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        let exchanger = exchanger(&server, store.clone(), Duration::from_secs(5));

        let first = exchanger.exchange_once("req1").await.unwrap();
        let stored = store.read().unwrap();
        let second = exchanger.exchange_once("req1").await.unwrap();

        assert_eq!(first.label(), "exchanged");
        assert_eq!(second, ExchangeOutcome::Duplicate);
        assert_eq!(store.read().unwrap(), stored);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_single_exchange() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/session/token")
            .with_status(200)
            .with_body(success_body("acc_1"))
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let exchanger = exchanger(&server, file_store(&dir), Duration::from_secs(5));

        let (a, b) = tokio::join!(exchanger.exchange_once("req1"), exchanger.exchange_once("req1"));
        let mut labels = vec![a.unwrap().label(), b.unwrap().label()];
        labels.sort();
        assert_eq!(labels, vec!["duplicate", "exchanged"]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejection_preserves_prior_record() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/session/token")
            .with_status(403)
            .with_body(r#"{"status":"error","message":"Token is invalid or has expired.","error_type":"TokenException"}"#)
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        let prior = CredentialRecord::issued(
            "old_token".to_string(),
            "test_key".to_string(),
            None,
            Utc::now() - ChronoDuration::hours(1),
            Some(7200),
        );
        store.write(&prior).unwrap();

        let exchanger = exchanger(&server, store.clone(), Duration::from_secs(5));
        let err = exchanger.exchange_once("stale1").await.unwrap_err();

        assert!(matches!(err, ExchangeError::Rejected { status: 403, .. }));
        assert_eq!(store.read().unwrap(), Some(prior.clone()));

        // Replay reports the same failure without a second broker call
        assert_eq!(exchanger.exchange_once("stale1").await.unwrap_err(), err);
        assert_eq!(store.read().unwrap(), Some(prior));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_concurrent_replay_of_failing_code() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/session/token")
            .with_status(503)
            .with_body(r#"{"status":"error","message":"upstream down","error_type":"NetworkException"}"#)
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        let exchanger = exchanger(&server, store.clone(), Duration::from_secs(5));

        let (a, b) = tokio::join!(exchanger.exchange_once("req503"), exchanger.exchange_once("req503"));

        let a = a.unwrap_err();
        assert!(matches!(a, ExchangeError::Rejected { status: 503, .. }));
        assert_eq!(b.unwrap_err(), a);
        assert!(store.read().unwrap().is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_cancelled_exchange_is_not_reported_as_success() {
        // Accepts connections but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let exchanger = TokenExchanger::with_settings(
            ExchangeSettings {
                token_url: format!("http://{}/session/token", addr),
                api_key: "test_key".to_string(),
                api_secret: "test_secret".to_string(),
            },
            file_store(&dir),
            Duration::from_secs(30),
            600,
        )
        .unwrap();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), exchanger.exchange_once("gone1")).await;
        assert!(abandoned.is_err());

        assert_eq!(
            exchanger.exchange_once("gone1").await.unwrap_err(),
            ExchangeError::Interrupted
        );
    }

    #[tokio::test]
    async fn test_invalidate_session_keeps_record() {
        let server = Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        let exchanger = exchanger(&server, store.clone(), Duration::from_secs(5));

        assert!(!exchanger.invalidate_session().await.unwrap());

        let prior = CredentialRecord::issued(
            "old_token".to_string(),
            "test_key".to_string(),
            None,
            Utc::now(),
            Some(7200),
        );
        store.write(&prior).unwrap();
        assert!(exchanger.invalidate_session().await.unwrap());

        let stored = store.read().unwrap().unwrap();
        assert_eq!(stored.access_token, "old_token");
        assert!(stored.invalidated_at.is_some());
    }

    #[tokio::test]
    async fn test_invalid_code_never_reaches_broker() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/session/token")
            .expect(0)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        let exchanger = exchanger(&server, store.clone(), Duration::from_secs(5));

        let err = exchanger.exchange_once("").await.unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidCode(_)));
        assert!(store.read().unwrap().is_none());
        assert_eq!(exchanger.consumed_codes().count(), 0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_exchange_timeout() {
        // Accepts connections but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        let exchanger = TokenExchanger::with_settings(
            ExchangeSettings {
                token_url: format!("http://{}/session/token", addr),
                api_key: "test_key".to_string(),
                api_secret: "test_secret".to_string(),
            },
            store.clone(),
            Duration::from_millis(200),
            600,
        )
        .unwrap();

        let started = std::time::Instant::now();
        let err = exchanger.exchange_once("slow1").await.unwrap_err();
        assert_eq!(err, ExchangeError::Timeout);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(store.read().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_racing_codes_last_completed_wins() {
        let mut server = Server::new_async().await;
        let mock_a = server
            .mock("POST", "/session/token")
            .match_body(Matcher::UrlEncoded("request_token".into(), "codeA".into()))
            .with_status(200)
            .with_body(success_body("token_a"))
            .expect(1)
            .create_async()
            .await;
        let mock_b = server
            .mock("POST", "/session/token")
            .match_body(Matcher::UrlEncoded("request_token".into(), "codeB".into()))
            .with_status(200)
            .with_body(success_body("token_b"))
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        let exchanger = exchanger(&server, store.clone(), Duration::from_secs(5));

        let (a, b) = tokio::join!(exchanger.exchange_once("codeA"), exchanger.exchange_once("codeB"));
        let (ExchangeOutcome::Exchanged(a), ExchangeOutcome::Exchanged(b)) = (a.unwrap(), b.unwrap())
        else {
            panic!("both codes should exchange");
        };

        // Serialized exchanges: the later-issued record is the one left standing
        let stored = store.read().unwrap().unwrap();
        let latest = if a.issued_at > b.issued_at { &a } else { &b };
        assert!(stored == a || stored == b);
        assert!(stored.issued_at >= latest.issued_at);

        mock_a.assert_async().await;
        mock_b.assert_async().await;
    }
}
