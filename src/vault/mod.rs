//! Credential vault: the registry of keys and their probe history.
//!
//! The monitoring core only talks to the two traits below. `KeyStore`
//! implements both on SQLite; secrets are sealed before they hit disk
//! and only ever held in memory inside a [`Secret`].

pub mod crypto;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

use crate::adapters::ServiceKind;

/// Free-form per-credential settings (model name, endpoint, probe definition).
pub type Metadata = serde_json::Map<String, serde_json::Value>;

// ── Secrets ─────────────────────────────────────────────────────────

/// An API key value. Wiped on drop, redacted in `Debug`, never serialized.
#[derive(Clone)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    /// Borrow the raw value. Callers must not log or persist it.
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

// ── Records ─────────────────────────────────────────────────────────

/// A registered API key plus everything needed to probe it.
#[derive(Debug, Clone, Serialize)]
pub struct Credential {
    pub id: String,
    pub service: ServiceKind,
    pub name: String,
    #[serde(skip)]
    pub secret: Secret,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    /// `None` until the first probe lands.
    pub last_checked: Option<DateTime<Utc>>,
}

/// Registration input; the registry assigns id and creation time.
#[derive(Debug, Clone)]
pub struct NewCredential {
    pub service: ServiceKind,
    pub name: String,
    pub secret: Secret,
    pub metadata: Metadata,
}

/// Status taxonomy for a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Ok,
    Expired,
    RateLimited,
    Error,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Ok => "OK",
            HealthStatus::Expired => "EXPIRED",
            HealthStatus::RateLimited => "RATE_LIMITED",
            HealthStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(HealthStatus::Ok),
            "EXPIRED" => Ok(HealthStatus::Expired),
            "RATE_LIMITED" => Ok(HealthStatus::RateLimited),
            "ERROR" => Ok(HealthStatus::Error),
            other => Err(StoreError::Corrupt(format!("unknown health status '{}'", other))),
        }
    }
}

/// One recorded probe attempt. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub id: i64,
    pub credential_id: String,
    pub checked_at: DateTime<Utc>,
    pub status: HealthStatus,
    pub latency_ms: f64,
    /// Present exactly when `status` is not `OK`.
    pub error_message: Option<String>,
}

/// An outcome about to be appended. `checked_at` defaults to now.
#[derive(Debug, Clone)]
pub struct NewOutcome {
    pub credential_id: String,
    pub checked_at: Option<DateTime<Utc>>,
    pub status: HealthStatus,
    pub latency_ms: f64,
    pub error_message: Option<String>,
}

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("credential '{0}' not found")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("store lock poisoned")]
    Poisoned,
}

// ── Collaborator contracts ──────────────────────────────────────────

/// The set of credentials being monitored.
pub trait CredentialRegistry: Send + Sync {
    fn list(&self) -> Result<Vec<Credential>, StoreError>;
    fn get(&self, id: &str) -> Result<Credential, StoreError>;
    fn add(&self, new: NewCredential) -> Result<Credential, StoreError>;
    fn remove(&self, id: &str) -> Result<Credential, StoreError>;
}

/// Probe history, per credential.
pub trait HistoryStore: Send + Sync {
    /// Append an outcome and move the owner's `last_checked` to its
    /// timestamp, atomically for that credential.
    fn append(&self, outcome: NewOutcome) -> Result<Outcome, StoreError>;

    /// Outcomes for one credential, newest first.
    fn list_for(&self, credential_id: &str, limit: Option<usize>) -> Result<Vec<Outcome>, StoreError>;
}
