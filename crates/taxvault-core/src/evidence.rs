//! Evidence artifacts.
//!
//! An artifact is an immutable JSON payload stored with the SHA-256 digest of
//! its canonical serialization and a WORM-style URI. Reconciliation
//! discrepancies are escalated as artifacts rather than corrected.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::ledger::{LedgerStore, from_millis, to_millis};

/// URI scheme prefix for artifacts held in this database.
pub const WORM_URI_PREFIX: &str = "internal:designated/";

/// Errors from the evidence store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EvidenceError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Payload could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No artifact with this id.
    #[error("evidence artifact not found: {id}")]
    NotFound {
        /// The missing id.
        id: String,
    },
}

/// A stored evidence artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvidenceArtifact {
    /// Artifact identifier.
    pub id: String,
    /// Organisation.
    pub org_id: String,
    /// Artifact kind.
    pub kind: String,
    /// Hex SHA-256 of the canonical payload.
    pub sha256: String,
    /// Write-once location.
    pub worm_uri: String,
    /// Payload.
    pub payload: serde_json::Value,
    /// When it was recorded.
    pub created_at: DateTime<Utc>,
}

/// Serializes a payload canonically (sorted object keys, no whitespace) and
/// returns the bytes with their hex SHA-256.
///
/// # Errors
///
/// Returns an error if the payload cannot be serialized.
pub fn canonical_digest<T: Serialize>(
    payload: &T,
) -> Result<(serde_json::Value, String), serde_json::Error> {
    // Round-trip through `Value`: its map type keeps keys sorted.
    let value = serde_json::to_value(payload)?;
    let bytes = serde_json::to_vec(&value)?;
    Ok((value, hex::encode(Sha256::digest(&bytes))))
}

/// Stores and retrieves evidence artifacts.
#[derive(Debug, Clone)]
pub struct EvidenceStore {
    store: LedgerStore,
}

impl EvidenceStore {
    /// Creates an evidence store over the given database.
    #[must_use]
    pub const fn new(store: LedgerStore) -> Self {
        Self { store }
    }

    /// Records a new artifact.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the insert fails.
    pub fn record<T: Serialize>(
        &self,
        org_id: &str,
        kind: &str,
        payload: &T,
    ) -> Result<EvidenceArtifact, EvidenceError> {
        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let artifact = record_in(&tx, org_id, kind, payload)?;
        tx.commit()?;
        Ok(artifact)
    }

    /// Loads an artifact by id.
    ///
    /// # Errors
    ///
    /// Returns [`EvidenceError::NotFound`] if the id is unknown.
    pub fn get(&self, id: &str) -> Result<EvidenceArtifact, EvidenceError> {
        let conn = self.store.lock();
        get_in(&conn, id)?.ok_or_else(|| EvidenceError::NotFound { id: id.to_string() })
    }

    /// Lists artifacts of one kind for an organisation, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list(&self, org_id: &str, kind: &str) -> Result<Vec<EvidenceArtifact>, EvidenceError> {
        let conn = self.store.lock();
        let mut stmt = conn.prepare(
            "SELECT id, org_id, kind, sha256, worm_uri, payload, created_at_ms
             FROM evidence_artifacts WHERE org_id = ?1 AND kind = ?2
             ORDER BY created_at_ms ASC, rowid ASC",
        )?;
        let rows = stmt
            .query_map(params![org_id, kind], raw_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawArtifact::into_artifact).collect()
    }

    /// Recomputes an artifact's digest and compares it with the stored one.
    ///
    /// # Errors
    ///
    /// Returns [`EvidenceError::NotFound`] if the id is unknown.
    pub fn verify(&self, id: &str) -> Result<bool, EvidenceError> {
        let artifact = self.get(id)?;
        let (_, digest) = canonical_digest(&artifact.payload)?;
        Ok(digest == artifact.sha256)
    }
}

/// Records an artifact inside a caller-owned transaction.
pub(crate) fn record_in<T: Serialize>(
    conn: &Connection,
    org_id: &str,
    kind: &str,
    payload: &T,
) -> Result<EvidenceArtifact, EvidenceError> {
    let (value, sha256) = canonical_digest(payload)?;
    let id = Uuid::new_v4().to_string();
    let worm_uri = format!("{WORM_URI_PREFIX}{id}");
    let created_at = Utc::now();

    conn.execute(
        "INSERT INTO evidence_artifacts (id, org_id, kind, sha256, worm_uri, payload, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            id,
            org_id,
            kind,
            sha256,
            worm_uri,
            serde_json::to_string(&value)?,
            to_millis(created_at),
        ],
    )?;

    tracing::info!(org_id, kind, artifact_id = %id, sha256 = %sha256, "evidence artifact recorded");

    Ok(EvidenceArtifact {
        id,
        org_id: org_id.to_string(),
        kind: kind.to_string(),
        sha256,
        worm_uri,
        payload: value,
        created_at: from_millis(to_millis(created_at))?,
    })
}

fn get_in(conn: &Connection, id: &str) -> Result<Option<EvidenceArtifact>, EvidenceError> {
    conn.query_row(
        "SELECT id, org_id, kind, sha256, worm_uri, payload, created_at_ms
         FROM evidence_artifacts WHERE id = ?1",
        params![id],
        raw_row,
    )
    .optional()?
    .map(RawArtifact::into_artifact)
    .transpose()
}

struct RawArtifact {
    id: String,
    org_id: String,
    kind: String,
    sha256: String,
    worm_uri: String,
    payload: String,
    created_at: DateTime<Utc>,
}

impl RawArtifact {
    fn into_artifact(self) -> Result<EvidenceArtifact, EvidenceError> {
        Ok(EvidenceArtifact {
            id: self.id,
            org_id: self.org_id,
            kind: self.kind,
            sha256: self.sha256,
            worm_uri: self.worm_uri,
            payload: serde_json::from_str(&self.payload)?,
            created_at: self.created_at,
        })
    }
}

fn raw_row(row: &Row<'_>) -> rusqlite::Result<RawArtifact> {
    Ok(RawArtifact {
        id: row.get(0)?,
        org_id: row.get(1)?,
        kind: row.get(2)?,
        sha256: row.get(3)?,
        worm_uri: row.get(4)?,
        payload: row.get(5)?,
        created_at: from_millis(row.get(6)?)?,
    })
}
