//! Request tokens that have already been handed to the exchange.
//!
//! A request token is single-use at the broker, but browsers retry and users
//! refresh the callback page. Remembering consumed tokens and how their
//! exchange ended lets the callback answer a replay with that outcome instead
//! of a second exchange.
//! Only SHA-256 fingerprints are kept, never the tokens themselves.

use super::ExchangeError;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// What became of a consumed request token
#[derive(Clone, Debug, PartialEq)]
pub enum CodeStatus {
    /// Exchange started and has not reported back
    Pending,
    Exchanged,
    Failed(ExchangeError),
}

/// Result of [`ConsumedCodes::claim`]
#[derive(Clone, Debug, PartialEq)]
pub enum Claim {
    /// First delivery inside the window; the caller owns the exchange
    Fresh,
    /// Replay of a token already handed to the exchange
    Replay(CodeStatus),
}

#[derive(Clone, Debug)]
struct CodeEntry {
    claimed_at: DateTime<Utc>,
    status: CodeStatus,
}

/// Consumed request token fingerprints with automatic expiration
#[derive(Clone)]
pub struct ConsumedCodes {
    entries: Arc<Mutex<HashMap<String, CodeEntry>>>,
    window: Duration,
}

/// Hex SHA-256 of a request token
pub fn fingerprint(code: &str) -> String {
    format!("{:x}", Sha256::digest(code.as_bytes()))
}

impl ConsumedCodes {
    /// Create a tracker
    ///
    /// # Arguments
    /// * `window_seconds` - How long a consumed token is remembered (default: 600)
    pub fn new(window_seconds: i64) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            window: Duration::seconds(window_seconds),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CodeEntry>> {
        // The map holds no invariant a panicking holder could break
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark a token consumed.
    ///
    /// The first claim inside the window records the token as `Pending` and
    /// returns [`Claim::Fresh`]; later claims return the recorded status.
    /// Check and insert happen under one lock, so two concurrent claims of
    /// the same token never both come back fresh.
    pub fn claim(&self, code: &str) -> Claim {
        self.claim_at(code, Utc::now())
    }

    fn claim_at(&self, code: &str, now: DateTime<Utc>) -> Claim {
        let key = fingerprint(code);
        let mut entries = self.entries();

        if let Some(entry) = entries.get(&key) {
            if now - entry.claimed_at <= self.window {
                return Claim::Replay(entry.status.clone());
            }
        }

        entries.insert(
            key,
            CodeEntry {
                claimed_at: now,
                status: CodeStatus::Pending,
            },
        );
        Claim::Fresh
    }

    /// Record how the exchange of a claimed token ended
    pub fn settle(&self, code: &str, status: CodeStatus) {
        if let Some(entry) = self.entries().get_mut(&fingerprint(code)) {
            entry.status = status;
        }
    }

    /// Recorded status of a token still inside the window
    pub fn status(&self, code: &str) -> Option<CodeStatus> {
        let now = Utc::now();
        self.entries()
            .get(&fingerprint(code))
            .filter(|entry| now - entry.claimed_at <= self.window)
            .map(|entry| entry.status.clone())
    }

    pub fn is_consumed(&self, code: &str) -> bool {
        self.status(code).is_some()
    }

    /// Drop fingerprints older than the window
    pub fn cleanup_expired(&self) {
        let now = Utc::now();
        let window = self.window;
        self.entries()
            .retain(|_, entry| now - entry.claimed_at <= window);
    }

    pub fn count(&self) -> usize {
        self.entries().len()
    }
}

/// Background task to periodically forget old fingerprints
pub async fn run_code_cleanup(codes: ConsumedCodes, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        codes.cleanup_expired();
        tracing::debug!("Request token cleanup complete, {} remembered", codes.count());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_claim_wins() {
        let codes = ConsumedCodes::new(600);

        assert_eq!(codes.claim("abc123"), Claim::Fresh);
        assert_eq!(codes.claim("abc123"), Claim::Replay(CodeStatus::Pending));
        assert!(codes.is_consumed("abc123"));
        assert!(!codes.is_consumed("def456"));
    }

    #[test]
    fn test_fingerprints_only() {
        let codes = ConsumedCodes::new(600);
        codes.claim("secret_request_token");

        let entries = codes.entries();
        assert!(!entries.contains_key("secret_request_token"));
        assert!(entries.contains_key(&fingerprint("secret_request_token")));
    }

    #[test]
    fn test_claim_allowed_again_after_window() {
        let codes = ConsumedCodes::new(60);
        let start = Utc::now();

        assert_eq!(codes.claim_at("abc", start), Claim::Fresh);
        assert!(matches!(
            codes.claim_at("abc", start + Duration::seconds(60)),
            Claim::Replay(_)
        ));
        assert_eq!(codes.claim_at("abc", start + Duration::seconds(61)), Claim::Fresh);
    }

    #[test]
    fn test_cleanup_removes_expired() {
        let codes = ConsumedCodes::new(60);
        codes.claim_at("old", Utc::now() - Duration::seconds(120));
        codes.claim("recent");
        assert_eq!(codes.count(), 2);

        codes.cleanup_expired();
        assert_eq!(codes.count(), 1);
        assert!(codes.is_consumed("recent"));
    }

    #[test]
    fn test_replay_reports_settled_outcome() {
        let codes = ConsumedCodes::new(600);
        let rejected = ExchangeError::Rejected {
            status: 503,
            message: "upstream down".to_string(),
        };

        assert_eq!(codes.claim("failed1"), Claim::Fresh);
        codes.settle("failed1", CodeStatus::Failed(rejected.clone()));
        assert_eq!(codes.claim("failed1"), Claim::Replay(CodeStatus::Failed(rejected)));

        assert_eq!(codes.claim("good1"), Claim::Fresh);
        codes.settle("good1", CodeStatus::Exchanged);
        assert_eq!(codes.claim("good1"), Claim::Replay(CodeStatus::Exchanged));
        assert_eq!(codes.status("good1"), Some(CodeStatus::Exchanged));

        // Settling a token that was never claimed records nothing
        codes.settle("unknown", CodeStatus::Exchanged);
        assert_eq!(codes.status("unknown"), None);
    }

    #[test]
    fn test_concurrent_claims_single_winner() {
        let codes = ConsumedCodes::new(600);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let codes = codes.clone();
                std::thread::spawn(move || codes.claim("racy") == Claim::Fresh)
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
