//! Key store for sealed credentials and their probe history, backed by SQLite.
//!
//! Secrets are sealed before hitting disk and opened in memory only.
//! History rows cascade with their credential. Timestamps are written as
//! fixed-width RFC 3339 (microseconds, UTC) so text order is time order.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::crypto::SecretSealer;
use super::{
    Credential, CredentialRegistry, HistoryStore, Metadata, NewCredential, NewOutcome, Outcome,
    StoreError,
};
use crate::adapters::ServiceKind;

const VERIFIER: &[u8] = b"keywatch-vault-v1";

/// The key store backed by SQLite.
pub struct KeyStore {
    db: Mutex<Connection>,
    sealer: SecretSealer,
}

/// A credential row before its secret is opened.
struct CredentialRow {
    id: String,
    service: String,
    name: String,
    sealed_secret: Vec<u8>,
    metadata: String,
    created_at: String,
    last_checked: Option<String>,
}

struct OutcomeRow {
    id: i64,
    credential_id: String,
    checked_at: String,
    status: String,
    latency_ms: f64,
    error_message: Option<String>,
}

impl KeyStore {
    /// Open (or create) the store. Fails if `master_passphrase` does not
    /// match the one the database was created with.
    pub fn open(db_path: &Path, master_passphrase: &[u8]) -> Result<Self, StoreError> {
        let db = Connection::open(db_path)?;

        // WAL mode for concurrent reads
        db.pragma_update(None, "journal_mode", "WAL")?;
        db.pragma_update(None, "foreign_keys", "ON")?;

        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS vault_meta (
                name TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS credentials (
                id TEXT PRIMARY KEY,
                service TEXT NOT NULL,
                name TEXT NOT NULL,
                sealed_secret BLOB NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                last_checked TEXT
            );

            CREATE TABLE IF NOT EXISTS health_checks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                credential_id TEXT NOT NULL REFERENCES credentials(id) ON DELETE CASCADE,
                checked_at TEXT NOT NULL,
                status TEXT NOT NULL,
                latency_ms REAL NOT NULL,
                error_message TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_health_checks_credential
                ON health_checks(credential_id, checked_at);
            ",
        )?;

        let sealer = unlock(&db, master_passphrase)?;

        Ok(Self {
            db: Mutex::new(db),
            sealer,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.db.lock().map_err(|_| StoreError::Poisoned)
    }

    fn hydrate(&self, row: CredentialRow) -> Result<Credential, StoreError> {
        let service: ServiceKind = row
            .service
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("unknown service '{}' on key '{}'", row.service, row.id)))?;
        let metadata: Metadata = serde_json::from_str(&row.metadata)
            .map_err(|e| StoreError::Corrupt(format!("metadata for key '{}': {}", row.id, e)))?;

        Ok(Credential {
            secret: self.sealer.open_secret(&row.sealed_secret)?,
            service,
            name: row.name,
            metadata,
            created_at: parse_timestamp(&row.created_at)?,
            last_checked: row.last_checked.as_deref().map(parse_timestamp).transpose()?,
            id: row.id,
        })
    }

    /// Number of registered credentials, without opening any secret.
    pub fn count(&self) -> Result<usize, StoreError> {
        let db = self.conn()?;
        let n: i64 = db.query_row("SELECT COUNT(*) FROM credentials", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

/// Load the salt (or create it on first open) and check the passphrase
/// against the sealed verifier.
fn unlock(db: &Connection, passphrase: &[u8]) -> Result<SecretSealer, StoreError> {
    let salt: Option<Vec<u8>> = db
        .query_row("SELECT value FROM vault_meta WHERE name = 'salt'", [], |row| row.get(0))
        .optional()?;

    match salt {
        Some(salt) => {
            let sealer = SecretSealer::derive(passphrase, &salt)?;
            let verifier: Vec<u8> = db
                .query_row("SELECT value FROM vault_meta WHERE name = 'verifier'", [], |row| row.get(0))
                .optional()?
                .ok_or_else(|| StoreError::Corrupt("vault verifier missing".into()))?;
            let opened = sealer
                .open(&verifier)
                .map_err(|_| StoreError::Crypto("master key does not match this database".into()))?;
            if opened.as_slice() != VERIFIER {
                return Err(StoreError::Crypto("master key does not match this database".into()));
            }
            Ok(sealer)
        }
        None => {
            let salt = SecretSealer::generate_salt();
            let sealer = SecretSealer::derive(passphrase, &salt)?;
            let verifier = sealer.seal(VERIFIER)?;
            db.execute(
                "INSERT INTO vault_meta (name, value) VALUES ('salt', ?1), ('verifier', ?2)",
                params![salt.to_vec(), verifier],
            )?;
            tracing::info!("Initialised new vault");
            Ok(sealer)
        }
    }
}

fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{}': {}", s, e)))
}

/// Drop sub-microsecond precision so the returned value equals the stored one.
fn to_stored_precision(dt: DateTime<Utc>) -> Result<DateTime<Utc>, StoreError> {
    parse_timestamp(&format_timestamp(&dt))
}

fn read_credential_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CredentialRow> {
    Ok(CredentialRow {
        id: row.get(0)?,
        service: row.get(1)?,
        name: row.get(2)?,
        sealed_secret: row.get(3)?,
        metadata: row.get(4)?,
        created_at: row.get(5)?,
        last_checked: row.get(6)?,
    })
}

const CREDENTIAL_COLUMNS: &str =
    "id, service, name, sealed_secret, metadata, created_at, last_checked";

impl CredentialRegistry for KeyStore {
    fn list(&self) -> Result<Vec<Credential>, StoreError> {
        let rows = {
            let db = self.conn()?;
            let mut stmt = db.prepare(&format!(
                "SELECT {} FROM credentials ORDER BY created_at, id",
                CREDENTIAL_COLUMNS
            ))?;
            let rows = stmt
                .query_map([], read_credential_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        rows.into_iter().map(|row| self.hydrate(row)).collect()
    }

    fn get(&self, id: &str) -> Result<Credential, StoreError> {
        let row = {
            let db = self.conn()?;
            db.query_row(
                &format!("SELECT {} FROM credentials WHERE id = ?1", CREDENTIAL_COLUMNS),
                params![id],
                read_credential_row,
            )
            .optional()?
        };
        match row {
            Some(row) => self.hydrate(row),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    fn add(&self, new: NewCredential) -> Result<Credential, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let created_at = to_stored_precision(Utc::now())?;
        let sealed = self.sealer.seal(new.secret.expose().as_bytes())?;
        let metadata = serde_json::to_string(&new.metadata)
            .map_err(|e| StoreError::Corrupt(format!("metadata not serializable: {}", e)))?;

        let db = self.conn()?;
        db.execute(
            "INSERT INTO credentials (id, service, name, sealed_secret, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                new.service.as_str(),
                new.name,
                sealed,
                metadata,
                format_timestamp(&created_at)
            ],
        )?;

        tracing::info!(key_id = %id, service = %new.service, "Key added to vault");

        Ok(Credential {
            id,
            service: new.service,
            name: new.name,
            secret: new.secret,
            metadata: new.metadata,
            created_at,
            last_checked: None,
        })
    }

    fn remove(&self, id: &str) -> Result<Credential, StoreError> {
        let credential = self.get(id)?;

        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let purged = tx.execute("DELETE FROM health_checks WHERE credential_id = ?1", params![id])?;
        let rows = tx.execute("DELETE FROM credentials WHERE id = ?1", params![id])?;
        tx.commit()?;

        if rows == 0 {
            // Lost a race with another remove.
            return Err(StoreError::NotFound(id.to_string()));
        }
        tracing::info!(key_id = id, history_purged = purged, "Key removed from vault");
        Ok(credential)
    }
}

impl HistoryStore for KeyStore {
    fn append(&self, outcome: NewOutcome) -> Result<Outcome, StoreError> {
        let requested = to_stored_precision(outcome.checked_at.unwrap_or_else(Utc::now))?;

        let mut db = self.conn()?;
        let tx = db.transaction()?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM credentials WHERE id = ?1)",
            params![outcome.credential_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(StoreError::NotFound(outcome.credential_id));
        }

        // Keep per-credential history strictly ordered even when two
        // probes finish within the same microsecond.
        let latest: Option<String> = tx.query_row(
            "SELECT MAX(checked_at) FROM health_checks WHERE credential_id = ?1",
            params![outcome.credential_id],
            |row| row.get(0),
        )?;
        let checked_at = match latest.as_deref().map(parse_timestamp).transpose()? {
            Some(latest) if requested <= latest => latest + Duration::microseconds(1),
            _ => requested,
        };
        let stamp = format_timestamp(&checked_at);

        tx.execute(
            "INSERT INTO health_checks (credential_id, checked_at, status, latency_ms, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                outcome.credential_id,
                stamp,
                outcome.status.as_str(),
                outcome.latency_ms,
                outcome.error_message
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE credentials SET last_checked = ?1 WHERE id = ?2",
            params![stamp, outcome.credential_id],
        )?;
        tx.commit()?;

        Ok(Outcome {
            id,
            credential_id: outcome.credential_id,
            checked_at,
            status: outcome.status,
            latency_ms: outcome.latency_ms,
            error_message: outcome.error_message,
        })
    }

    fn list_for(&self, credential_id: &str, limit: Option<usize>) -> Result<Vec<Outcome>, StoreError> {
        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit.map(|n| n as i64).unwrap_or(-1);
        let rows = {
            let db = self.conn()?;
            let mut stmt = db.prepare(
                "SELECT id, credential_id, checked_at, status, latency_ms, error_message
                 FROM health_checks
                 WHERE credential_id = ?1
                 ORDER BY checked_at DESC, id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![credential_id, limit], |row| {
                    Ok(OutcomeRow {
                        id: row.get(0)?,
                        credential_id: row.get(1)?,
                        checked_at: row.get(2)?,
                        status: row.get(3)?,
                        latency_ms: row.get(4)?,
                        error_message: row.get(5)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        rows.into_iter()
            .map(|row| -> Result<Outcome, StoreError> {
                Ok(Outcome {
                    id: row.id,
                    credential_id: row.credential_id,
                    checked_at: parse_timestamp(&row.checked_at)?,
                    status: row.status.parse()?,
                    latency_ms: row.latency_ms,
                    error_message: row.error_message,
                })
            })
            .collect()
    }
}
