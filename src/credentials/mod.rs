//! Durable storage for the broker session credential.
//!
//! Exactly one [`CredentialRecord`] is authoritative at a time. The callback
//! process is the only writer; the MCP process reads the record before every
//! privileged call.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       TokenStore (trait)                 │
//! │  - read / write / invalidate             │
//! │  - atomic replace, never partial         │
//! └─────────────────────────────────────────┘
//!          ↓                    ↓
//! ┌──────────────────┐  ┌──────────────────────┐
//! │  FileTokenStore  │  │  SqliteTokenStore     │
//! │  JSON + rename   │  │  AES-256-GCM at rest  │
//! └──────────────────┘  └──────────────────────┘
//! ```
//!
//! Invalidation never erases the record: an expired or invalidated record
//! stays on disk so status output can tell "never logged in" apart from
//! "session ended".

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::KiteConfig;

mod encryption;
mod file;
mod storage;

pub use encryption::{SealedToken, TokenCipher};
pub use file::FileTokenStore;
pub use storage::SqliteTokenStore;

/// Broker sessions end every day at 06:00 IST, which is 00:30 UTC.
const SESSION_RESET_UTC_MINUTES: i64 = 30;

/// The persisted broker session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Access token sent with every privileged broker call
    pub access_token: String,

    /// Application key the token was issued under
    pub api_key: String,

    /// Broker user id reported at exchange time
    #[serde(default)]
    pub user_id: Option<String>,

    /// When the exchange completed (UTC)
    pub issued_at: DateTime<Utc>,

    /// When the session stops being valid (UTC)
    pub expires_at: DateTime<Utc>,

    /// Set when the session was explicitly invalidated
    #[serde(default)]
    pub invalidated_at: Option<DateTime<Utc>>,
}

impl CredentialRecord {
    /// Builds a record for a freshly exchanged token.
    ///
    /// An explicit lifetime from the exchange response wins; otherwise the
    /// session ends at the next daily reset.
    pub fn issued(
        access_token: String,
        api_key: String,
        user_id: Option<String>,
        issued_at: DateTime<Utc>,
        expires_in_seconds: Option<i64>,
    ) -> Self {
        let expires_at = match expires_in_seconds {
            Some(seconds) => issued_at + Duration::seconds(seconds),
            None => next_session_reset(issued_at),
        };
        Self {
            access_token,
            api_key,
            user_id,
            issued_at,
            expires_at,
            invalidated_at: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// First daily session reset strictly after `issued_at`.
pub fn next_session_reset(issued_at: DateTime<Utc>) -> DateTime<Utc> {
    let midnight = Utc.from_utc_datetime(&issued_at.date_naive().and_time(chrono::NaiveTime::MIN));
    let reset = midnight + Duration::minutes(SESSION_RESET_UTC_MINUTES);
    if reset > issued_at {
        reset
    } else {
        reset + Duration::days(1)
    }
}

/// Single-record credential storage.
///
/// `write` must replace the record atomically: a concurrent `read` observes
/// either the previous record or the new one in full.
pub trait TokenStore: Send + Sync {
    /// Current record, if one was ever written.
    fn read(&self) -> Result<Option<CredentialRecord>>;

    /// Replace the current record.
    fn write(&self, record: &CredentialRecord) -> Result<()>;

    /// Mark the current record invalid without erasing it.
    ///
    /// Returns `false` when there is no record.
    fn invalidate(&self) -> Result<bool>;
}

/// Opens the store selected by the configuration.
///
/// `KITE_TOKEN_DB` selects the encrypted SQLite store (and requires
/// `KITE_ENCRYPTION_KEY`); otherwise the JSON file store is used.
pub fn open_token_store(config: &KiteConfig) -> Result<Arc<dyn TokenStore>> {
    match &config.token_db {
        Some(db_path) => {
            let key = config
                .encryption_key
                .as_deref()
                .ok_or_else(|| anyhow!("KITE_ENCRYPTION_KEY is required when KITE_TOKEN_DB is set"))?;
            let store = SqliteTokenStore::new(db_path, key)
                .context("Failed to initialize SQLite token store")?;
            tracing::info!(path = %db_path.display(), "Using encrypted SQLite token store");
            Ok(Arc::new(store))
        }
        None => {
            let store = FileTokenStore::new(&config.token_file)
                .context("Failed to initialize token file store")?;
            tracing::info!(path = %config.token_file.display(), "Using token file store");
            Ok(Arc::new(store))
        }
    }
}
