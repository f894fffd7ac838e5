//! Designated-account reconciliation.
//!
//! A run compares each account's recorded balance with the sum of ledger
//! postings against it, summarises inflows over a trailing window, and
//! stores the report as a snapshot together with its SHA-256 digest.
//!
//! Any non-zero discrepancy is escalated: the report becomes an evidence
//! artifact and a HIGH alert is raised. Balances are never corrected
//! automatically.

// SQLite counts are always non-negative.
#![allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]

mod scheduler;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, TransactionBehavior, params};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub use scheduler::ReconcileScheduler;

use crate::alerts::{self, ALERT_RECONCILIATION_DISCREPANCY};
use crate::audit::{AuditEntry, AuditSink, SqliteAuditSink};
use crate::designated::{AccountKind, DesignatedAccount, list_accounts_in};
use crate::evidence::{self, EvidenceError, canonical_digest};
use crate::ledger::{LedgerError, LedgerStore, account_balance_in, from_millis, to_millis};
use crate::policy::Severity;

/// Schema identifier embedded in every report.
pub const RECONCILE_REPORT_SCHEMA: &str = "taxvault.reconcile_report.v1";

/// Evidence kind used when a discrepancy is escalated.
pub const DISCREPANCY_EVIDENCE_KIND: &str = "designated-reconciliation-discrepancy";

/// Default trailing window for movement totals.
pub const DEFAULT_MOVEMENT_WINDOW: Duration = Duration::hours(24);

/// Errors from reconciliation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReconcileError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Ledger error.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Evidence could not be stored.
    #[error(transparent)]
    Evidence(#[from] EvidenceError),

    /// The report could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The movement window reaches past the representable date range.
    #[error("movement window of {window_secs}s cannot be applied to {now}")]
    WindowOutOfRange {
        /// Window length in seconds.
        window_secs: i64,
        /// The run's reference time.
        now: DateTime<Utc>,
    },

    /// A scheduled run panicked or was cancelled.
    #[error("reconciliation task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Reconciliation of one designated account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountReconciliation {
    /// Account identifier.
    pub account_id: String,
    /// Account kind.
    pub kind: AccountKind,
    /// Balance recorded on the account row.
    pub recorded_balance_cents: i64,
    /// Sum of ledger postings against the account.
    pub ledger_balance_cents: i64,
    /// `recorded - ledger`.
    pub discrepancy_cents: i64,
    /// Credits within the movement window.
    pub inflow_cents: i64,
    /// Number of transfers within the movement window.
    pub transfer_count: u64,
}

/// Recorded balances per account kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileTotals {
    /// PAYGW buffer balance.
    pub paygw_balance_cents: i64,
    /// GST buffer balance.
    pub gst_balance_cents: i64,
}

/// The output of one reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    /// Always [`RECONCILE_REPORT_SCHEMA`].
    pub schema: String,
    /// Organisation.
    pub org_id: String,
    /// When the run happened.
    pub generated_at: DateTime<Utc>,
    /// Start of the movement window.
    pub window_start: DateTime<Utc>,
    /// Per-account results, ordered by kind.
    pub accounts: Vec<AccountReconciliation>,
    /// Balance totals.
    pub totals: ReconcileTotals,
    /// Accounts with a non-zero discrepancy.
    pub discrepancy_count: u64,
}

/// Where an escalated discrepancy was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Escalation {
    /// Evidence artifact holding the report.
    pub artifact_id: String,
    /// Write-once location of the artifact.
    pub worm_uri: String,
    /// Alert raised (or already open) for the discrepancy.
    pub alert_id: u64,
}

/// Result of [`Reconciler::run`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    /// The report.
    pub report: ReconciliationReport,
    /// Hex SHA-256 of the canonical report.
    pub sha256: String,
    /// Snapshot row identifier.
    pub snapshot_id: String,
    /// Present when a discrepancy was escalated.
    pub escalation: Option<Escalation>,
}

/// A stored reconciliation snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationSnapshot {
    /// Snapshot identifier.
    pub id: String,
    /// Organisation.
    pub org_id: String,
    /// Balance totals at the time of the run.
    pub totals: ReconcileTotals,
    /// Accounts with a discrepancy.
    pub discrepancy_count: u64,
    /// Hex SHA-256 of the report.
    pub sha256: String,
    /// Evidence artifact, when escalated.
    pub evidence_artifact_id: Option<String>,
    /// Who ran it.
    pub actor_id: String,
    /// When.
    pub created_at: DateTime<Utc>,
}

/// Runs reconciliation for one organisation at a time.
#[derive(Clone)]
pub struct Reconciler {
    store: LedgerStore,
    audit: Arc<dyn AuditSink>,
    window: Duration,
    actor_id: String,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("store", &self.store)
            .field("window", &self.window)
            .field("actor_id", &self.actor_id)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a reconciler with a 24 hour movement window, auditing into
    /// the same database.
    #[must_use]
    pub fn new(store: LedgerStore) -> Self {
        let audit = Arc::new(SqliteAuditSink::new(store.clone()));
        Self {
            store,
            audit,
            window: DEFAULT_MOVEMENT_WINDOW,
            actor_id: "system".to_string(),
        }
    }

    /// Replaces the audit sink.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Sets the trailing window used for movement totals.
    #[must_use]
    pub const fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Sets the actor recorded on snapshots and audit entries.
    #[must_use]
    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = actor_id.into();
        self
    }

    /// Reconciles an organisation now.
    ///
    /// # Errors
    ///
    /// Returns an error if reading balances or storing the snapshot fails.
    pub fn run(&self, org_id: &str) -> Result<ReconcileOutcome, ReconcileError> {
        self.run_at(org_id, Utc::now())
    }

    /// Reconciles an organisation as of `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if reading balances or storing the snapshot fails.
    pub fn run_at(
        &self,
        org_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let report = build_report(&tx, org_id, now, self.window)?;
        let (_, sha256) = canonical_digest(&report)?;

        let escalation = if report.discrepancy_count > 0 {
            let artifact = evidence::record_in(&tx, org_id, DISCREPANCY_EVIDENCE_KIND, &report)?;
            let message = format!(
                "{} designated account(s) disagree with the ledger; see {}",
                report.discrepancy_count, artifact.worm_uri
            );
            let alert_id = alerts::raise_once(
                &tx,
                org_id,
                ALERT_RECONCILIATION_DISCREPANCY,
                Severity::High,
                &message,
            )?;
            Some(Escalation {
                artifact_id: artifact.id,
                worm_uri: artifact.worm_uri,
                alert_id,
            })
        } else {
            None
        };

        let snapshot_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO reconciliation_snapshots
                 (id, org_id, paygw_balance_cents, gst_balance_cents, discrepancy_count,
                  sha256, payload, actor_id, evidence_artifact_id, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                snapshot_id,
                org_id,
                report.totals.paygw_balance_cents,
                report.totals.gst_balance_cents,
                report.discrepancy_count as i64,
                sha256,
                serde_json::to_string(&report)?,
                self.actor_id,
                escalation.as_ref().map(|e| e.artifact_id.as_str()),
                to_millis(now),
            ],
        )?;
        tx.commit()?;
        drop(conn);

        if let Some(escalation) = &escalation {
            warn!(
                org_id,
                discrepancy_count = report.discrepancy_count,
                artifact_id = %escalation.artifact_id,
                "reconciliation discrepancy escalated"
            );
        } else {
            info!(org_id, accounts = report.accounts.len(), "reconciliation clean");
        }

        let entry = AuditEntry::new(
            org_id,
            &self.actor_id,
            "designatedAccount.reconciliation",
            json!({
                "snapshotId": snapshot_id,
                "sha256": sha256,
                "discrepancyCount": report.discrepancy_count,
                "evidenceArtifactId": escalation.as_ref().map(|e| e.artifact_id.clone()),
            }),
        );
        if let Err(e) = self.audit.record(&entry) {
            tracing::error!(org_id, error = %e, "failed to record audit entry");
        }

        Ok(ReconcileOutcome {
            report,
            sha256,
            snapshot_id,
            escalation,
        })
    }

    /// Lists snapshots for an organisation, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn snapshots(
        &self,
        org_id: &str,
        limit: u64,
    ) -> Result<Vec<ReconciliationSnapshot>, ReconcileError> {
        let conn = self.store.lock();
        let mut stmt = conn.prepare(
            "SELECT id, org_id, paygw_balance_cents, gst_balance_cents, discrepancy_count,
                    sha256, evidence_artifact_id, actor_id, created_at_ms
             FROM reconciliation_snapshots
             WHERE org_id = ?1 ORDER BY created_at_ms DESC, rowid DESC LIMIT ?2",
        )?;
        let snapshots = stmt
            .query_map(params![org_id, limit.min(i64::MAX as u64) as i64], |row| {
                Ok(ReconciliationSnapshot {
                    id: row.get(0)?,
                    org_id: row.get(1)?,
                    totals: ReconcileTotals {
                        paygw_balance_cents: row.get(2)?,
                        gst_balance_cents: row.get(3)?,
                    },
                    discrepancy_count: row.get::<_, i64>(4)? as u64,
                    sha256: row.get(5)?,
                    evidence_artifact_id: row.get(6)?,
                    actor_id: row.get(7)?,
                    created_at: from_millis(row.get(8)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(snapshots)
    }
}

fn build_report(
    conn: &Connection,
    org_id: &str,
    now: DateTime<Utc>,
    window: Duration,
) -> Result<ReconciliationReport, ReconcileError> {
    let window_start = now
        .checked_sub_signed(window)
        .ok_or(ReconcileError::WindowOutOfRange {
            window_secs: window.num_seconds(),
            now,
        })?;
    let accounts = list_accounts_in(conn, org_id)?;

    let mut totals = ReconcileTotals::default();
    let mut results = Vec::with_capacity(accounts.len());
    for account in &accounts {
        let result = reconcile_account(conn, account, window_start, now)?;
        match account.kind {
            AccountKind::PaygwBuffer => totals.paygw_balance_cents += account.balance_cents,
            AccountKind::GstBuffer => totals.gst_balance_cents += account.balance_cents,
        }
        results.push(result);
    }

    let discrepancy_count = results.iter().filter(|a| a.discrepancy_cents != 0).count() as u64;
    Ok(ReconciliationReport {
        schema: RECONCILE_REPORT_SCHEMA.to_string(),
        org_id: org_id.to_string(),
        generated_at: now,
        window_start,
        accounts: results,
        totals,
        discrepancy_count,
    })
}

fn reconcile_account(
    conn: &Connection,
    account: &DesignatedAccount,
    window_start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<AccountReconciliation, ReconcileError> {
    let ledger_balance_cents = account_balance_in(conn, &account.org_id, &account.id)?;
    let (inflow_cents, transfer_count): (i64, i64) = conn.query_row(
        "SELECT COALESCE(SUM(amount_cents), 0), COUNT(*) FROM designated_transfers
         WHERE account_id = ?1 AND created_at_ms >= ?2 AND created_at_ms <= ?3",
        params![account.id, to_millis(window_start), to_millis(now)],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    Ok(AccountReconciliation {
        account_id: account.id.clone(),
        kind: account.kind,
        recorded_balance_cents: account.balance_cents,
        ledger_balance_cents,
        discrepancy_cents: account.balance_cents - ledger_balance_cents,
        inflow_cents,
        transfer_count: transfer_count as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::designated::{DesignatedAccounts, TransferRequest};
    use crate::evidence::EvidenceStore;

    fn funded() -> (Reconciler, DesignatedAccounts, DesignatedAccount) {
        let store = LedgerStore::in_memory().unwrap();
        let accounts = DesignatedAccounts::with_sqlite_audit(store.clone());
        let paygw = accounts
            .open_account("org-1", AccountKind::PaygwBuffer, "system")
            .unwrap();
        accounts
            .open_account("org-1", AccountKind::GstBuffer, "system")
            .unwrap();
        for amount in [100.0, 25.5] {
            accounts
                .apply_transfer(&TransferRequest {
                    org_id: "org-1".to_string(),
                    account_id: paygw.id.clone(),
                    amount,
                    source: "PAYROLL_CAPTURE".to_string(),
                    actor_id: "alice".to_string(),
                })
                .unwrap();
        }
        (Reconciler::new(store), accounts, paygw)
    }

    #[test]
    fn test_oversized_window_is_an_error() {
        let (reconciler, _, _) = funded();
        let reconciler = reconciler.with_window(Duration::try_days(365 * 1_000_000).unwrap());

        let err = reconciler.run("org-1").unwrap_err();
        assert!(matches!(err, ReconcileError::WindowOutOfRange { .. }), "{err}");
        assert!(reconciler.snapshots("org-1", 10).unwrap().is_empty());
    }

    #[test]
    fn test_clean_run_stores_snapshot_without_escalation() {
        let (reconciler, _, paygw) = funded();

        let outcome = reconciler.run("org-1").unwrap();
        assert_eq!(outcome.report.schema, RECONCILE_REPORT_SCHEMA);
        assert_eq!(outcome.report.discrepancy_count, 0);
        assert!(outcome.escalation.is_none());
        assert_eq!(outcome.report.totals.paygw_balance_cents, 12_550);
        assert_eq!(outcome.report.totals.gst_balance_cents, 0);

        let paygw_row = outcome
            .report
            .accounts
            .iter()
            .find(|a| a.account_id == paygw.id)
            .unwrap();
        assert_eq!(paygw_row.ledger_balance_cents, 12_550);
        assert_eq!(paygw_row.inflow_cents, 12_550);
        assert_eq!(paygw_row.transfer_count, 2);

        let (_, digest) = canonical_digest(&outcome.report).unwrap();
        assert_eq!(digest, outcome.sha256);

        let snapshots = reconciler.snapshots("org-1", 10).unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].id, outcome.snapshot_id);
        assert_eq!(snapshots[0].sha256, outcome.sha256);
    }

    #[test]
    fn test_movements_outside_window_are_excluded() {
        let (reconciler, _, paygw) = funded();
        let later = Utc::now() + Duration::hours(48);

        let outcome = reconciler.run_at("org-1", later).unwrap();
        let paygw_row = outcome
            .report
            .accounts
            .iter()
            .find(|a| a.account_id == paygw.id)
            .unwrap();
        assert_eq!(paygw_row.inflow_cents, 0);
        assert_eq!(paygw_row.transfer_count, 0);
        assert_eq!(paygw_row.ledger_balance_cents, 12_550);
    }

    #[test]
    fn test_discrepancy_is_escalated_not_corrected() {
        let (reconciler, accounts, paygw) = funded();
        accounts
            .store()
            .lock()
            .execute(
                "UPDATE designated_accounts SET balance_cents = balance_cents + 7 WHERE id = ?1",
                params![paygw.id],
            )
            .unwrap();

        let outcome = reconciler.run("org-1").unwrap();
        assert_eq!(outcome.report.discrepancy_count, 1);
        let escalation = outcome.escalation.clone().unwrap();

        let evidence = EvidenceStore::new(accounts.store().clone());
        let artifact = evidence.get(&escalation.artifact_id).unwrap();
        assert_eq!(artifact.kind, DISCREPANCY_EVIDENCE_KIND);
        assert_eq!(artifact.sha256, outcome.sha256);
        assert!(evidence.verify(&artifact.id).unwrap());

        let alerts = accounts.open_alerts("org-1").unwrap();
        assert!(alerts
            .iter()
            .any(|a| a.alert_type == ALERT_RECONCILIATION_DISCREPANCY && a.severity == "HIGH"));

        // The recorded balance is left as found.
        assert_eq!(
            accounts.get_account("org-1", &paygw.id).unwrap().balance_cents,
            12_557
        );
        assert_eq!(
            reconciler.snapshots("org-1", 1).unwrap()[0]
                .evidence_artifact_id
                .as_deref(),
            Some(escalation.artifact_id.as_str())
        );
    }

    #[test]
    fn test_org_without_accounts_reconciles_empty() {
        let reconciler = Reconciler::new(LedgerStore::in_memory().unwrap());
        let outcome = reconciler.run("org-empty").unwrap();
        assert!(outcome.report.accounts.is_empty());
        assert_eq!(outcome.report.totals, ReconcileTotals::default());
    }
}
