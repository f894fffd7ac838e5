//! Audit trail for designated-account activity.
//!
//! Every credit, violation, lock change, and reconciliation run produces an
//! [`AuditEntry`]. The default sink appends entries to the `audit_log` table
//! as a per-organisation BLAKE3 hash chain; [`TracingAuditSink`] only logs.

// SQLite row IDs are always non-negative.
#![allow(clippy::cast_sign_loss)]

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::{LedgerStore, from_millis, to_millis};

/// Errors from audit sinks.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuditError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Metadata could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The audit chain does not verify.
    #[error("audit chain broken for org {org_id} at entry {id}")]
    ChainBroken {
        /// Organisation identifier.
        org_id: String,
        /// Row identifier of the first bad entry.
        id: u64,
    },
}

/// A single audit event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Organisation the action belongs to.
    pub org_id: String,
    /// Who performed the action.
    pub actor_id: String,
    /// Dotted action name, e.g. `designatedAccount.credit`.
    pub action: String,
    /// Structured detail.
    pub metadata: serde_json::Value,
}

impl AuditEntry {
    /// Creates an entry.
    #[must_use]
    pub fn new(
        org_id: impl Into<String>,
        actor_id: impl Into<String>,
        action: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            org_id: org_id.into(),
            actor_id: actor_id.into(),
            action: action.into(),
            metadata,
        }
    }
}

/// A stored audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    /// Row identifier.
    pub id: u64,
    /// The entry.
    #[serde(flatten)]
    pub entry: AuditEntry,
    /// Hash of the previous entry for this organisation.
    pub prev_hash: Option<String>,
    /// Hash of this entry.
    pub hash: String,
    /// When it was recorded.
    pub created_at: DateTime<Utc>,
}

/// Destination for audit entries.
pub trait AuditSink: Send + Sync {
    /// Records an entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry could not be recorded.
    fn record(&self, entry: &AuditEntry) -> Result<(), AuditError>;
}

/// Sink that only emits `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        tracing::info!(
            org_id = %entry.org_id,
            actor_id = %entry.actor_id,
            action = %entry.action,
            metadata = %entry.metadata,
            "audit"
        );
        Ok(())
    }
}

/// Sink that appends hash-chained entries to the `audit_log` table.
#[derive(Debug, Clone)]
pub struct SqliteAuditSink {
    store: LedgerStore,
}

impl SqliteAuditSink {
    /// Creates a sink over the given store.
    #[must_use]
    pub const fn new(store: LedgerStore) -> Self {
        Self { store }
    }

    /// Returns all entries for an organisation, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or stored metadata is not JSON.
    pub fn entries(&self, org_id: &str) -> Result<Vec<AuditRecord>, AuditError> {
        let conn = self.store.lock();
        let mut stmt = conn.prepare(
            "SELECT id, org_id, actor_id, action, metadata, prev_hash, hash, created_at_ms
             FROM audit_log WHERE org_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![org_id], |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                    from_millis(row.get(7)?)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(id, org_id, actor_id, action, metadata, prev_hash, hash, created_at)| {
                    Ok(AuditRecord {
                        id,
                        entry: AuditEntry {
                            org_id,
                            actor_id,
                            action,
                            metadata: serde_json::from_str(&metadata)?,
                        },
                        prev_hash,
                        hash,
                        created_at,
                    })
                },
            )
            .collect()
    }

    /// Recomputes the audit hash chain for an organisation.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::ChainBroken`] at the first inconsistent entry.
    pub fn verify_chain(&self, org_id: &str) -> Result<usize, AuditError> {
        let records = self.entries(org_id)?;
        let mut prev: Option<String> = None;
        for record in &records {
            let expected = entry_hash(prev.as_deref(), &record.entry)?;
            if record.prev_hash != prev || record.hash != expected {
                return Err(AuditError::ChainBroken {
                    org_id: org_id.to_string(),
                    id: record.id,
                });
            }
            prev = Some(record.hash.clone());
        }
        Ok(records.len())
    }
}

impl AuditSink for SqliteAuditSink {
    fn record(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let prev_hash: Option<String> = tx
            .query_row(
                "SELECT hash FROM audit_log WHERE org_id = ?1 ORDER BY id DESC LIMIT 1",
                params![entry.org_id],
                |row| row.get(0),
            )
            .optional()?;
        let hash = entry_hash(prev_hash.as_deref(), entry)?;

        tx.execute(
            "INSERT INTO audit_log
                 (org_id, actor_id, action, metadata, prev_hash, hash, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.org_id,
                entry.actor_id,
                entry.action,
                serde_json::to_string(&entry.metadata)?,
                prev_hash,
                hash,
                to_millis(Utc::now()),
            ],
        )?;
        tx.commit()?;

        tracing::debug!(org_id = %entry.org_id, action = %entry.action, "audit entry recorded");
        Ok(())
    }
}

fn entry_hash(prev_hash: Option<&str>, entry: &AuditEntry) -> Result<String, AuditError> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(prev_hash.unwrap_or("").as_bytes());
    hasher.update(&serde_json::to_vec(entry)?);
    Ok(hex::encode(hasher.finalize().as_bytes()))
}
