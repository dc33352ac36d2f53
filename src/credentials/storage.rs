//! Encrypted token store backed by SQLite.
//!
//! Keeps the session in a single-row table. The access token is encrypted at
//! rest with AES-256-GCM; the remaining columns are plain metadata.

use super::{CredentialRecord, SealedToken, TokenCipher, TokenStore};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// Single-record credential storage in SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE session (
///     id INTEGER PRIMARY KEY CHECK (id = 1),
///     api_key TEXT NOT NULL,
///     access_token TEXT NOT NULL,        -- Encrypted
///     access_token_nonce TEXT NOT NULL,
///     user_id TEXT,
///     issued_at TEXT NOT NULL,           -- RFC 3339
///     expires_at TEXT NOT NULL,          -- RFC 3339
///     invalidated_at TEXT,               -- RFC 3339
///     updated_at TEXT NOT NULL
/// );
/// ```
///
/// The upsert replaces every column in one statement, so a reader in another
/// process sees either the old row or the new one.
pub struct SqliteTokenStore {
    conn: Mutex<Connection>,
    cipher: TokenCipher,
}

impl SqliteTokenStore {
    /// Creates or opens a store.
    ///
    /// # Arguments
    /// * `db_path` - Path to SQLite database file (`:memory:` for tests)
    /// * `encryption_key` - Base64-encoded 32-byte master key
    pub fn new<P: AsRef<Path>>(db_path: P, encryption_key: &str) -> Result<Self> {
        let cipher = TokenCipher::from_base64_key(encryption_key).context("Invalid encryption key")?;

        let conn = Connection::open(db_path).context("Failed to open database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS session (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                api_key TEXT NOT NULL,
                access_token TEXT NOT NULL,
                access_token_nonce TEXT NOT NULL,
                user_id TEXT,
                issued_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                invalidated_at TEXT,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create session table")?;

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Token database lock poisoned"))
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp '{}'", value))
}

/// Raw row before decryption and timestamp parsing.
struct SessionRow {
    api_key: String,
    sealed: SealedToken,
    user_id: Option<String>,
    issued_at: String,
    expires_at: String,
    invalidated_at: Option<String>,
}

impl TokenStore for SqliteTokenStore {
    fn read(&self) -> Result<Option<CredentialRecord>> {
        let row = self
            .conn()?
            .query_row(
                r#"
                SELECT api_key, access_token, access_token_nonce, user_id,
                       issued_at, expires_at, invalidated_at
                FROM session WHERE id = 1
                "#,
                [],
                |row| {
                    Ok(SessionRow {
                        api_key: row.get(0)?,
                        sealed: SealedToken {
                            ciphertext: row.get(1)?,
                            nonce: row.get(2)?,
                        },
                        user_id: row.get(3)?,
                        issued_at: row.get(4)?,
                        expires_at: row.get(5)?,
                        invalidated_at: row.get(6)?,
                    })
                },
            )
            .optional()
            .context("Failed to read session")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let access_token = self
            .cipher
            .open(&row.sealed)
            .context("Failed to decrypt access token")?;

        Ok(Some(CredentialRecord {
            access_token,
            api_key: row.api_key,
            user_id: row.user_id,
            issued_at: parse_timestamp(&row.issued_at)?,
            expires_at: parse_timestamp(&row.expires_at)?,
            invalidated_at: row
                .invalidated_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
        }))
    }

    fn write(&self, record: &CredentialRecord) -> Result<()> {
        let sealed = self
            .cipher
            .seal(&record.access_token)
            .context("Failed to encrypt access token")?;

        self.conn()?
            .execute(
                r#"
                INSERT INTO session (
                    id, api_key, access_token, access_token_nonce, user_id,
                    issued_at, expires_at, invalidated_at, updated_at
                )
                VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(id) DO UPDATE SET
                    api_key = excluded.api_key,
                    access_token = excluded.access_token,
                    access_token_nonce = excluded.access_token_nonce,
                    user_id = excluded.user_id,
                    issued_at = excluded.issued_at,
                    expires_at = excluded.expires_at,
                    invalidated_at = excluded.invalidated_at,
                    updated_at = excluded.updated_at
                "#,
                params![
                    record.api_key,
                    sealed.ciphertext,
                    sealed.nonce,
                    record.user_id,
                    record.issued_at.to_rfc3339(),
                    record.expires_at.to_rfc3339(),
                    record.invalidated_at.map(|dt| dt.to_rfc3339()),
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to store session")?;

        Ok(())
    }

    fn invalidate(&self) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let rows = self
            .conn()?
            .execute(
                r#"
                UPDATE session
                SET invalidated_at = COALESCE(invalidated_at, ?1), updated_at = ?1
                WHERE id = 1
                "#,
                params![now],
            )
            .context("Failed to invalidate session")?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use chrono::Duration;

    fn make_store() -> SqliteTokenStore {
        SqliteTokenStore::new(":memory:", &BASE64.encode([0u8; 32])).unwrap()
    }

    fn record(token: &str) -> CredentialRecord {
        CredentialRecord {
            access_token: token.to_string(),
            api_key: "test_key".to_string(),
            user_id: Some("AB1234".to_string()),
            issued_at: Utc::now(),
            expires_at: Utc::now() + Duration::hours(8),
            invalidated_at: None,
        }
    }

    #[test]
    fn test_read_absent() {
        let store = make_store();
        assert!(store.read().unwrap().is_none());
    }

    #[test]
    fn test_write_then_read() {
        let store = make_store();
        let original = record("access_token_123");
        store.write(&original).unwrap();

        let stored = store.read().unwrap().unwrap();
        assert_eq!(stored.access_token, "access_token_123");
        assert_eq!(stored.api_key, "test_key");
        assert_eq!(stored.user_id.as_deref(), Some("AB1234"));
        assert_eq!(stored.expires_at.timestamp(), original.expires_at.timestamp());
    }

    #[test]
    fn test_write_replaces_previous() {
        let store = make_store();
        store.write(&record("first")).unwrap();
        store.write(&record("second")).unwrap();

        assert_eq!(store.read().unwrap().unwrap().access_token, "second");

        let count: i64 = store
            .conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM session", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_token_encrypted_at_rest() {
        let store = make_store();
        store.write(&record("plaintext_token")).unwrap();

        let raw: String = store
            .conn()
            .unwrap()
            .query_row("SELECT access_token FROM session", [], |row| row.get(0))
            .unwrap();
        assert_ne!(raw, "plaintext_token");
    }

    #[test]
    fn test_invalidate() {
        let store = make_store();
        assert!(!store.invalidate().unwrap());

        store.write(&record("tok")).unwrap();
        assert!(store.invalidate().unwrap());

        let stored = store.read().unwrap().unwrap();
        assert_eq!(stored.access_token, "tok");
        assert!(stored.invalidated_at.is_some());

        // A fresh exchange clears the marker
        store.write(&record("fresh")).unwrap();
        assert!(store.read().unwrap().unwrap().invalidated_at.is_none());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.db");
        let key = BASE64.encode([3u8; 32]);

        SqliteTokenStore::new(&path, &key)
            .unwrap()
            .write(&record("durable"))
            .unwrap();

        let reopened = SqliteTokenStore::new(&path, &key).unwrap();
        assert_eq!(reopened.read().unwrap().unwrap().access_token, "durable");

        let wrong_key = SqliteTokenStore::new(&path, &BASE64.encode([4u8; 32])).unwrap();
        assert!(wrong_key.read().is_err());
    }
}
