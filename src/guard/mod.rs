//! Session guard run before every privileged operation.
//!
//! Classification is a pure function of the stored record, the configured
//! API key and the current time. No network calls, no caching: every check
//! reads the store again, so a token written by the callback process is
//! visible on the very next request.

use crate::credentials::{CredentialRecord, TokenStore};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Classification of the stored session.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionState {
    /// Never authenticated
    Absent,
    /// Issued under a different application key
    ForeignIdentity(CredentialRecord),
    /// Explicitly invalidated
    Invalidated(CredentialRecord),
    /// Past its validity boundary
    Expired(CredentialRecord),
    Valid(CredentialRecord),
}

impl SessionState {
    /// Short machine-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Absent => "no_session",
            SessionState::ForeignIdentity(_) => "identity_mismatch",
            SessionState::Invalidated(_) => "invalidated",
            SessionState::Expired(_) => "expired",
            SessionState::Valid(_) => "valid",
        }
    }

    pub fn record(&self) -> Option<&CredentialRecord> {
        match self {
            SessionState::Absent => None,
            SessionState::ForeignIdentity(r)
            | SessionState::Invalidated(r)
            | SessionState::Expired(r)
            | SessionState::Valid(r) => Some(r),
        }
    }
}

/// Why the caller has to log in again.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ReauthReason {
    NoSession,
    Expired { expires_at: DateTime<Utc> },
    Invalidated { invalidated_at: DateTime<Utc> },
    IdentityMismatch,
}

impl std::fmt::Display for ReauthReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReauthReason::NoSession => write!(f, "No broker session found"),
            ReauthReason::Expired { expires_at } => {
                write!(f, "Broker session expired at {}", expires_at.to_rfc3339())
            }
            ReauthReason::Invalidated { invalidated_at } => {
                write!(f, "Broker session was invalidated at {}", invalidated_at.to_rfc3339())
            }
            ReauthReason::IdentityMismatch => {
                write!(f, "Stored session belongs to a different API key")
            }
        }
    }
}

/// Outcome of a guard check.
#[derive(Clone, Debug, PartialEq)]
pub enum Directive {
    /// Proceed with this session
    Pass(CredentialRecord),
    /// Do not call the broker; obtain a new login URL
    Reauthenticate(ReauthReason),
}

/// Classifies a record. Pure.
pub fn classify(record: Option<CredentialRecord>, api_key: &str, now: DateTime<Utc>) -> SessionState {
    let Some(record) = record else {
        return SessionState::Absent;
    };

    if record.api_key != api_key {
        SessionState::ForeignIdentity(record)
    } else if record.invalidated_at.is_some() {
        SessionState::Invalidated(record)
    } else if record.is_expired_at(now) {
        SessionState::Expired(record)
    } else {
        SessionState::Valid(record)
    }
}

impl From<SessionState> for Directive {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Valid(record) => Directive::Pass(record),
            SessionState::Absent => Directive::Reauthenticate(ReauthReason::NoSession),
            SessionState::ForeignIdentity(_) => {
                Directive::Reauthenticate(ReauthReason::IdentityMismatch)
            }
            SessionState::Invalidated(record) => Directive::Reauthenticate(ReauthReason::Invalidated {
                invalidated_at: record.invalidated_at.unwrap_or(record.issued_at),
            }),
            SessionState::Expired(record) => Directive::Reauthenticate(ReauthReason::Expired {
                expires_at: record.expires_at,
            }),
        }
    }
}

/// Guard bound to a store and the configured application key.
#[derive(Clone)]
pub struct SessionGuard {
    store: Arc<dyn TokenStore>,
    api_key: String,
}

impl SessionGuard {
    pub fn new(store: Arc<dyn TokenStore>, api_key: String) -> Self {
        Self { store, api_key }
    }

    /// Current classification of the stored session.
    pub fn state(&self) -> Result<SessionState> {
        self.state_at(Utc::now())
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> Result<SessionState> {
        let record = self.store.read()?;
        Ok(classify(record, &self.api_key, now))
    }

    /// Pass-through or re-authentication directive for a privileged call.
    pub fn check(&self) -> Result<Directive> {
        Ok(self.state()?.into())
    }
}
