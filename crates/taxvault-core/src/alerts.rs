//! Operational alerts raised by policy violations, funding shortfalls, and
//! reconciliation discrepancies.

// SQLite row IDs are always non-negative.
#![allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use crate::ledger::{from_millis, to_millis};
use crate::policy::Severity;

/// Alert raised when a designated account is asked to pay out.
pub const ALERT_WITHDRAWAL_ATTEMPT: &str = "DESIGNATED_WITHDRAWAL_ATTEMPT";
/// Alert raised for any other rejected designated-account credit.
pub const ALERT_POLICY_VIOLATION: &str = "DESIGNATED_POLICY_VIOLATION";
/// Alert raised when a designated account cannot cover an obligation.
pub const ALERT_FUNDS_SHORTFALL: &str = "DESIGNATED_FUNDS_SHORTFALL";
/// Alert raised when reconciliation finds a mismatch.
pub const ALERT_RECONCILIATION_DISCREPANCY: &str = "DESIGNATED_RECONCILIATION_DISCREPANCY";

/// A stored alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    /// Row identifier.
    pub id: u64,
    /// Organisation.
    pub org_id: String,
    /// Alert type, one of the `ALERT_*` constants.
    pub alert_type: String,
    /// Severity name.
    pub severity: String,
    /// Human-readable message.
    pub message: String,
    /// When it was raised.
    pub created_at: DateTime<Utc>,
    /// When it was resolved, if ever.
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Raises an alert unless an unresolved one of the same type and severity is
/// already open for the organisation. Returns the id of the open alert.
pub(crate) fn raise_once(
    conn: &Connection,
    org_id: &str,
    alert_type: &str,
    severity: Severity,
    message: &str,
) -> rusqlite::Result<u64> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM alerts
             WHERE org_id = ?1 AND alert_type = ?2 AND severity = ?3 AND resolved_at_ms IS NULL
             ORDER BY id ASC LIMIT 1",
            params![org_id, alert_type, severity.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id as u64);
    }
    raise(conn, org_id, alert_type, severity, message)
}

/// Raises an alert unconditionally.
fn raise(
    conn: &Connection,
    org_id: &str,
    alert_type: &str,
    severity: Severity,
    message: &str,
) -> rusqlite::Result<u64> {
    conn.execute(
        "INSERT INTO alerts (org_id, alert_type, severity, message, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            org_id,
            alert_type,
            severity.as_str(),
            message,
            to_millis(Utc::now())
        ],
    )?;
    tracing::warn!(org_id, alert_type, severity = %severity, message, "alert raised");
    Ok(conn.last_insert_rowid() as u64)
}

/// Lists unresolved alerts for an organisation, oldest first.
pub(crate) fn open_alerts(conn: &Connection, org_id: &str) -> rusqlite::Result<Vec<Alert>> {
    let mut stmt = conn.prepare(
        "SELECT id, org_id, alert_type, severity, message, created_at_ms, resolved_at_ms
         FROM alerts WHERE org_id = ?1 AND resolved_at_ms IS NULL ORDER BY id ASC",
    )?;
    stmt.query_map(params![org_id], |row| {
        Ok(Alert {
            id: row.get::<_, i64>(0)? as u64,
            org_id: row.get(1)?,
            alert_type: row.get(2)?,
            severity: row.get(3)?,
            message: row.get(4)?,
            created_at: from_millis(row.get(5)?)?,
            resolved_at: row
                .get::<_, Option<i64>>(6)?
                .map(from_millis)
                .transpose()?,
        })
    })?
    .collect()
}

/// Marks an alert resolved. Returns `false` if it was not open.
pub(crate) fn resolve(conn: &Connection, org_id: &str, alert_id: u64) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE alerts SET resolved_at_ms = ?1
         WHERE id = ?2 AND org_id = ?3 AND resolved_at_ms IS NULL",
        params![to_millis(Utc::now()), alert_id as i64, org_id],
    )?;
    Ok(changed == 1)
}
