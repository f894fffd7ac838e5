//! Designated-account service.

// SQLite row IDs and sequence numbers are always non-negative.
#![allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]

use std::sync::Arc;

use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    AccountKind, AccountSnapshot, AccountState, DESIGNATED_CREDIT_JOURNAL, DesignatedAccount,
    DesignatedError, StateTransition, TransferReceipt, TransferRequest, ViolationFlag,
    clearing_account,
};
use crate::alerts::{
    self, ALERT_FUNDS_SHORTFALL, ALERT_POLICY_VIOLATION, ALERT_WITHDRAWAL_ATTEMPT, Alert,
};
use crate::audit::{AuditEntry, AuditSink, SqliteAuditSink};
use crate::ledger::{
    JournalInput, LedgerStore, PostingInput, from_millis, to_millis, write_in_tx,
};
use crate::money::{Cents, MoneyError};
use crate::policy::{
    DesignatedAccountPolicyInput, PolicyEvaluation, PolicyViolation, Severity, ViolationCode,
    evaluate_designated_account_policy,
};

const ACCOUNT_COLUMNS: &str = "id, org_id, kind, balance_cents, updated_at_ms";

/// Operations on designated accounts.
///
/// Cloning is cheap; clones share the store and the audit sink.
#[derive(Clone)]
pub struct DesignatedAccounts {
    store: LedgerStore,
    audit: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for DesignatedAccounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DesignatedAccounts")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl DesignatedAccounts {
    /// Creates the service with an explicit audit sink.
    #[must_use]
    pub fn new(store: LedgerStore, audit: Arc<dyn AuditSink>) -> Self {
        Self { store, audit }
    }

    /// Creates the service auditing into the same database.
    #[must_use]
    pub fn with_sqlite_audit(store: LedgerStore) -> Self {
        let audit = Arc::new(SqliteAuditSink::new(store.clone()));
        Self { store, audit }
    }

    /// Returns the underlying store.
    #[must_use]
    pub const fn store(&self) -> &LedgerStore {
        &self.store
    }

    /// Opens the organisation's account of `kind`, or returns the existing
    /// one.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub fn open_account(
        &self,
        org_id: &str,
        kind: AccountKind,
        actor_id: &str,
    ) -> Result<DesignatedAccount, DesignatedError> {
        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = account_by_kind_in(&tx, org_id, kind)? {
            return Ok(existing);
        }

        let id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO designated_accounts (id, org_id, kind, balance_cents, updated_at_ms)
             VALUES (?1, ?2, ?3, 0, ?4)",
            params![id, org_id, kind, to_millis(Utc::now())],
        )?;
        record_transition_in(
            &tx,
            org_id,
            &id,
            None,
            AccountState::Active,
            actor_id,
            "account opened",
            &json!({ "kind": kind }),
        )?;
        let account = require_account_in(&tx, org_id, &id)?;
        tx.commit()?;
        drop(conn);

        info!(org_id, account_id = %account.id, kind = %kind, "designated account opened");
        self.emit(AuditEntry::new(
            org_id,
            actor_id,
            "designatedAccount.open",
            json!({ "accountId": account.id, "kind": kind }),
        ));
        Ok(account)
    }

    /// Loads an account by id.
    ///
    /// # Errors
    ///
    /// Returns [`DesignatedError::AccountNotFound`] if it does not exist.
    pub fn get_account(
        &self,
        org_id: &str,
        account_id: &str,
    ) -> Result<DesignatedAccount, DesignatedError> {
        let conn = self.store.lock();
        require_account_in(&conn, org_id, account_id)
    }

    /// Loads the organisation's account of `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`DesignatedError::AccountKindNotFound`] if none is open.
    pub fn account_by_kind(
        &self,
        org_id: &str,
        kind: AccountKind,
    ) -> Result<DesignatedAccount, DesignatedError> {
        let conn = self.store.lock();
        account_by_kind_in(&conn, org_id, kind)?.ok_or_else(|| {
            DesignatedError::AccountKindNotFound {
                org_id: org_id.to_string(),
                kind,
            }
        })
    }

    /// Lists the organisation's accounts.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_accounts(&self, org_id: &str) -> Result<Vec<DesignatedAccount>, DesignatedError> {
        let conn = self.store.lock();
        Ok(list_accounts_in(&conn, org_id)?)
    }

    /// Returns the account's current state, initialising it to ACTIVE on
    /// first touch.
    ///
    /// # Errors
    ///
    /// Returns [`DesignatedError::AccountNotFound`] if it does not exist.
    pub fn current_state(
        &self,
        org_id: &str,
        account_id: &str,
    ) -> Result<AccountState, DesignatedError> {
        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let account = require_account_in(&tx, org_id, account_id)?;
        let state = ensure_state_in(&tx, &account, "system")?;
        tx.commit()?;
        Ok(state)
    }

    /// Returns the account's state history, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn transitions(
        &self,
        org_id: &str,
        account_id: &str,
    ) -> Result<Vec<StateTransition>, DesignatedError> {
        let conn = self.store.lock();
        let mut stmt = conn.prepare(
            "SELECT from_state, to_state, actor_id, reason, metadata, created_at_ms
             FROM designated_state_transitions
             WHERE org_id = ?1 AND account_id = ?2 ORDER BY id ASC",
        )?;
        let transitions = stmt
            .query_map(params![org_id, account_id], |row| {
                Ok(StateTransition {
                    from: row.get(0)?,
                    to: row.get(1)?,
                    actor_id: row.get(2)?,
                    reason: row.get(3)?,
                    metadata: serde_json::from_str(&row.get::<_, String>(4)?).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e))
                    })?,
                    created_at: from_millis(row.get(5)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(transitions)
    }

    /// Credits a designated account.
    ///
    /// A policy denial is recorded (alert, violation flag, state change to
    /// INVESTIGATING, audit entry) and returned as
    /// [`DesignatedError::Policy`]; nothing is credited. An allowed credit
    /// updates the balance, stores the transfer, and appends a balanced
    /// journal atomically.
    ///
    /// # Errors
    ///
    /// Returns the policy violation, [`DesignatedError::AccountLocked`] for
    /// LOCKED or CLOSED accounts, or a storage error.
    pub fn apply_transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<TransferReceipt, DesignatedError> {
        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let outcome = process_transfer_in(&tx, request)?;
        tx.commit()?;
        drop(conn);

        match outcome {
            TransferOutcome::Applied { receipt, audit } => {
                self.emit(audit);
                Ok(receipt)
            },
            TransferOutcome::Rejected { violation, audit } => {
                self.emit(audit);
                Err(DesignatedError::Policy(violation))
            },
        }
    }

    /// Checks that the account of `kind` holds at least `required_cents`.
    ///
    /// On a shortfall a `DESIGNATED_FUNDS_SHORTFALL` alert is raised and the
    /// account is locked.
    ///
    /// # Errors
    ///
    /// Returns [`DesignatedError::InsufficientFunds`] on a shortfall.
    pub fn ensure_coverage(
        &self,
        org_id: &str,
        kind: AccountKind,
        required_cents: i64,
        actor_id: &str,
    ) -> Result<AccountSnapshot, DesignatedError> {
        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let account = account_by_kind_in(&tx, org_id, kind)?.ok_or_else(|| {
            DesignatedError::AccountKindNotFound {
                org_id: org_id.to_string(),
                kind,
            }
        })?;
        let state = ensure_state_in(&tx, &account, actor_id)?;

        if account.balance_cents >= required_cents {
            tx.commit()?;
            return Ok(AccountSnapshot { account, state });
        }

        let message = format!(
            "Designated {kind} account holds {} but {} is required",
            Cents::new(account.balance_cents),
            Cents::new(required_cents)
        );
        alerts::raise_once(&tx, org_id, ALERT_FUNDS_SHORTFALL, Severity::High, &message)?;
        if state != AccountState::Locked && state != AccountState::Closed {
            record_transition_in(
                &tx,
                org_id,
                &account.id,
                Some(state),
                AccountState::Locked,
                actor_id,
                "funding shortfall",
                &json!({
                    "balanceCents": account.balance_cents,
                    "requiredCents": required_cents,
                }),
            )?;
        }
        tx.commit()?;
        drop(conn);

        warn!(
            org_id,
            account_id = %account.id,
            balance_cents = account.balance_cents,
            required_cents,
            "designated account shortfall"
        );
        self.emit(AuditEntry::new(
            org_id,
            actor_id,
            "designatedAccount.shortfall",
            json!({
                "accountId": account.id,
                "kind": kind,
                "balanceCents": account.balance_cents,
                "requiredCents": required_cents,
            }),
        ));

        Err(DesignatedError::InsufficientFunds {
            org_id: org_id.to_string(),
            kind,
            required_cents,
            balance_cents: account.balance_cents,
        })
    }

    /// Returns a LOCKED or INVESTIGATING account to ACTIVE.
    ///
    /// # Errors
    ///
    /// Returns [`DesignatedError::InvalidTransition`] from any other state.
    pub fn release_lock(
        &self,
        org_id: &str,
        account_id: &str,
        actor_id: &str,
        reason: &str,
    ) -> Result<AccountSnapshot, DesignatedError> {
        self.transition(
            org_id,
            account_id,
            AccountState::Active,
            actor_id,
            reason,
            |from| matches!(from, AccountState::Locked | AccountState::Investigating),
            "designatedAccount.unlock",
        )
    }

    /// Closes an account permanently.
    ///
    /// # Errors
    ///
    /// Returns [`DesignatedError::InvalidTransition`] if already closed.
    pub fn close_account(
        &self,
        org_id: &str,
        account_id: &str,
        actor_id: &str,
        reason: &str,
    ) -> Result<AccountSnapshot, DesignatedError> {
        self.transition(
            org_id,
            account_id,
            AccountState::Closed,
            actor_id,
            reason,
            |from| from != AccountState::Closed,
            "designatedAccount.close",
        )
    }

    /// Returns the account of `kind` with its current state.
    ///
    /// # Errors
    ///
    /// Returns [`DesignatedError::AccountKindNotFound`] if none is open.
    pub fn snapshot(
        &self,
        org_id: &str,
        kind: AccountKind,
    ) -> Result<AccountSnapshot, DesignatedError> {
        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let account = account_by_kind_in(&tx, org_id, kind)?.ok_or_else(|| {
            DesignatedError::AccountKindNotFound {
                org_id: org_id.to_string(),
                kind,
            }
        })?;
        let state = ensure_state_in(&tx, &account, "system")?;
        tx.commit()?;
        Ok(AccountSnapshot { account, state })
    }

    /// Lists open violation flags, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn open_violation_flags(
        &self,
        org_id: &str,
    ) -> Result<Vec<ViolationFlag>, DesignatedError> {
        let conn = self.store.lock();
        let mut stmt = conn.prepare(
            "SELECT id, org_id, account_id, code, severity, status, metadata, detected_at_ms
             FROM designated_violation_flags
             WHERE org_id = ?1 AND status = 'OPEN' ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![org_id], |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    from_millis(row.get(7)?)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut flags = Vec::with_capacity(rows.len());
        for (id, org_id, account_id, code, severity, status, metadata, detected_at) in rows {
            flags.push(ViolationFlag {
                id,
                org_id,
                account_id,
                code,
                severity,
                status,
                metadata: serde_json::from_str(&metadata)?,
                detected_at,
            });
        }
        Ok(flags)
    }

    /// Lists unresolved alerts, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn open_alerts(&self, org_id: &str) -> Result<Vec<Alert>, DesignatedError> {
        let conn = self.store.lock();
        Ok(alerts::open_alerts(&conn, org_id)?)
    }

    /// Resolves an alert. Returns `false` if it was not open.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn resolve_alert(&self, org_id: &str, alert_id: u64) -> Result<bool, DesignatedError> {
        let conn = self.store.lock();
        Ok(alerts::resolve(&conn, org_id, alert_id)?)
    }

    #[allow(clippy::too_many_arguments)]
    fn transition(
        &self,
        org_id: &str,
        account_id: &str,
        to: AccountState,
        actor_id: &str,
        reason: &str,
        allowed_from: impl Fn(AccountState) -> bool,
        action: &str,
    ) -> Result<AccountSnapshot, DesignatedError> {
        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let account = require_account_in(&tx, org_id, account_id)?;
        let from = ensure_state_in(&tx, &account, actor_id)?;
        if !allowed_from(from) {
            return Err(DesignatedError::InvalidTransition {
                account_id: account_id.to_string(),
                from,
                to,
            });
        }
        record_transition_in(
            &tx,
            org_id,
            account_id,
            Some(from),
            to,
            actor_id,
            reason,
            &json!({}),
        )?;
        tx.commit()?;
        drop(conn);

        info!(org_id, account_id, from = %from, to = %to, "designated account state changed");
        self.emit(AuditEntry::new(
            org_id,
            actor_id,
            action,
            json!({ "accountId": account_id, "from": from, "to": to, "reason": reason }),
        ));
        Ok(AccountSnapshot { account, state: to })
    }

    /// Hands an entry to the audit sink.
    ///
    /// The database change it describes is already committed, so a sink
    /// failure is logged rather than returned.
    pub(crate) fn emit(&self, entry: AuditEntry) {
        if let Err(e) = self.audit.record(&entry) {
            tracing::error!(
                org_id = %entry.org_id,
                action = %entry.action,
                error = %e,
                "failed to record audit entry"
            );
        }
    }
}

/// Result of [`process_transfer_in`]. Both arms carry the audit entry to
/// emit once the transaction has committed.
#[derive(Debug)]
pub(crate) enum TransferOutcome {
    Applied {
        receipt: TransferReceipt,
        audit: AuditEntry,
    },
    Rejected {
        violation: PolicyViolation,
        audit: AuditEntry,
    },
}

/// Evaluates and applies a transfer inside a caller-owned write
/// transaction.
///
/// Rejections still write (alert, flag, state change), so the caller must
/// commit for both outcomes. An `Err` leaves partial writes that the caller
/// must roll back.
pub(crate) fn process_transfer_in(
    conn: &Connection,
    request: &TransferRequest,
) -> Result<TransferOutcome, DesignatedError> {
    process_in(conn, request, None)
}

/// Like [`process_transfer_in`], but credits exactly `amount` once the
/// policy has passed `request.amount`.
pub(crate) fn process_credit_in(
    conn: &Connection,
    request: &TransferRequest,
    amount: Cents,
) -> Result<TransferOutcome, DesignatedError> {
    process_in(conn, request, Some(amount))
}

fn process_in(
    conn: &Connection,
    request: &TransferRequest,
    exact: Option<Cents>,
) -> Result<TransferOutcome, DesignatedError> {
    let evaluation = evaluate_designated_account_policy(DesignatedAccountPolicyInput {
        amount: request.amount,
        source: &request.source,
    });
    let source = match evaluation {
        PolicyEvaluation::Allowed(source) => source,
        PolicyEvaluation::Denied(violation) => {
            let audit = record_violation_in(conn, request, &violation)?;
            return Ok(TransferOutcome::Rejected { violation, audit });
        },
    };

    let account = require_account_in(conn, &request.org_id, &request.account_id)?;
    let state = ensure_state_in(conn, &account, &request.actor_id)?;
    if !state.accepts_credits() {
        return Err(DesignatedError::AccountLocked {
            account_id: account.id,
            state,
        });
    }

    let amount = match exact {
        Some(amount) => amount,
        None => Cents::from_dollars(request.amount)?,
    };
    if !amount.is_positive() {
        return Err(DesignatedError::InvalidAmount {
            reason: format!("{} rounds to {amount}", request.amount),
        });
    }
    let new_balance = Cents::new(account.balance_cents)
        .checked_add(amount)
        .ok_or_else(|| MoneyError::OutOfRange {
            input: format!("{} + {amount}", Cents::new(account.balance_cents)),
        })?;

    let now = Utc::now();
    let transfer_id = Uuid::new_v4().to_string();
    let journal = JournalInput::new(
        &request.org_id,
        &transfer_id,
        format!("transfer:{transfer_id}"),
        DESIGNATED_CREDIT_JOURNAL,
        source.as_str(),
        now,
    )
    .with_description(format!("{} credit from {source}", account.kind))
    .with_posting(PostingInput::new(&account.id, amount.get()).with_memo("designated credit"))
    .with_posting(PostingInput::new(clearing_account(source), -amount.get()));
    let written = write_in_tx(conn, &journal)?;

    conn.execute(
        "UPDATE designated_accounts SET balance_cents = ?1, updated_at_ms = ?2 WHERE id = ?3",
        params![new_balance.get(), to_millis(now), account.id],
    )?;
    conn.execute(
        "INSERT INTO designated_transfers
             (id, org_id, account_id, amount_cents, source, actor_id, journal_seq, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            transfer_id,
            request.org_id,
            account.id,
            amount.get(),
            source.as_str(),
            request.actor_id,
            written.journal.seq as i64,
            to_millis(now),
        ],
    )?;

    info!(
        org_id = %request.org_id,
        account_id = %account.id,
        amount_cents = amount.get(),
        source = %source,
        journal_seq = written.journal.seq,
        "designated account credited"
    );

    let receipt = TransferReceipt {
        transfer_id,
        org_id: request.org_id.clone(),
        account_id: account.id,
        amount_cents: amount.get(),
        new_balance_cents: new_balance.get(),
        source,
        journal_seq: written.journal.seq,
    };
    let audit = AuditEntry::new(
        &request.org_id,
        &request.actor_id,
        "designatedAccount.credit",
        json!({
            "accountId": receipt.account_id,
            "transferId": receipt.transfer_id,
            "amountCents": receipt.amount_cents,
            "newBalanceCents": receipt.new_balance_cents,
            "source": source,
            "journalSeq": receipt.journal_seq,
        }),
    );
    Ok(TransferOutcome::Applied { receipt, audit })
}

fn record_violation_in(
    conn: &Connection,
    request: &TransferRequest,
    violation: &PolicyViolation,
) -> Result<AuditEntry, DesignatedError> {
    let alert_type = if violation.code == ViolationCode::WithdrawalAttempt {
        ALERT_WITHDRAWAL_ATTEMPT
    } else {
        ALERT_POLICY_VIOLATION
    };
    alerts::raise_once(
        conn,
        &request.org_id,
        alert_type,
        violation.severity,
        &violation.message,
    )?;

    let account = account_by_id_in(conn, &request.org_id, &request.account_id)?;
    let account_id = account.as_ref().map(|a| a.id.as_str());
    let metadata = json!({
        "accountId": request.account_id,
        "amount": request.amount.to_string(),
        "source": request.source,
        "message": violation.message,
    });

    let already_open: Option<i64> = conn
        .query_row(
            "SELECT id FROM designated_violation_flags
             WHERE org_id = ?1 AND account_id IS ?2 AND code = ?3 AND status = 'OPEN'
             LIMIT 1",
            params![request.org_id, account_id, violation.code.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    if already_open.is_none() {
        conn.execute(
            "INSERT INTO designated_violation_flags
                 (org_id, account_id, code, severity, status, metadata, detected_at_ms)
             VALUES (?1, ?2, ?3, ?4, 'OPEN', ?5, ?6)",
            params![
                request.org_id,
                account_id,
                violation.code.as_str(),
                violation.severity.as_str(),
                serde_json::to_string(&metadata)?,
                to_millis(Utc::now()),
            ],
        )?;
    }

    if let Some(account) = &account {
        let state = ensure_state_in(conn, account, &request.actor_id)?;
        if state == AccountState::Active {
            record_transition_in(
                conn,
                &request.org_id,
                &account.id,
                Some(state),
                AccountState::Investigating,
                &request.actor_id,
                violation.code.as_str(),
                &json!({ "code": violation.code, "severity": violation.severity }),
            )?;
        }
    }

    warn!(
        org_id = %request.org_id,
        account_id = %request.account_id,
        code = %violation.code,
        severity = %violation.severity,
        "designated account transfer rejected"
    );

    Ok(AuditEntry::new(
        &request.org_id,
        &request.actor_id,
        "designatedAccount.violation",
        json!({
            "accountId": request.account_id,
            "code": violation.code,
            "severity": violation.severity,
            "message": violation.message,
        }),
    ))
}

fn map_account_row(row: &Row<'_>) -> rusqlite::Result<DesignatedAccount> {
    Ok(DesignatedAccount {
        id: row.get(0)?,
        org_id: row.get(1)?,
        kind: row.get(2)?,
        balance_cents: row.get(3)?,
        updated_at: from_millis(row.get(4)?)?,
    })
}

fn account_by_id_in(
    conn: &Connection,
    org_id: &str,
    account_id: &str,
) -> rusqlite::Result<Option<DesignatedAccount>> {
    let sql =
        format!("SELECT {ACCOUNT_COLUMNS} FROM designated_accounts WHERE org_id = ?1 AND id = ?2");
    conn.query_row(&sql, params![org_id, account_id], map_account_row)
        .optional()
}

fn require_account_in(
    conn: &Connection,
    org_id: &str,
    account_id: &str,
) -> Result<DesignatedAccount, DesignatedError> {
    account_by_id_in(conn, org_id, account_id)?.ok_or_else(|| DesignatedError::AccountNotFound {
        org_id: org_id.to_string(),
        account_id: account_id.to_string(),
    })
}

pub(crate) fn account_by_kind_in(
    conn: &Connection,
    org_id: &str,
    kind: AccountKind,
) -> rusqlite::Result<Option<DesignatedAccount>> {
    let sql = format!(
        "SELECT {ACCOUNT_COLUMNS} FROM designated_accounts
         WHERE org_id = ?1 AND kind = ?2"
    );
    conn.query_row(&sql, params![org_id, kind], map_account_row)
        .optional()
}

pub(crate) fn list_accounts_in(
    conn: &Connection,
    org_id: &str,
) -> rusqlite::Result<Vec<DesignatedAccount>> {
    let sql = format!(
        "SELECT {ACCOUNT_COLUMNS} FROM designated_accounts WHERE org_id = ?1 ORDER BY kind ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    stmt.query_map(params![org_id], map_account_row)?.collect()
}

fn ensure_state_in(
    conn: &Connection,
    account: &DesignatedAccount,
    actor_id: &str,
) -> Result<AccountState, DesignatedError> {
    let current: Option<AccountState> = conn
        .query_row(
            "SELECT to_state FROM designated_state_transitions
             WHERE account_id = ?1 ORDER BY id DESC LIMIT 1",
            params![account.id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(state) = current {
        return Ok(state);
    }
    record_transition_in(
        conn,
        &account.org_id,
        &account.id,
        None,
        AccountState::Active,
        actor_id,
        "initialised on first use",
        &json!({}),
    )?;
    Ok(AccountState::Active)
}

#[allow(clippy::too_many_arguments)]
fn record_transition_in(
    conn: &Connection,
    org_id: &str,
    account_id: &str,
    from: Option<AccountState>,
    to: AccountState,
    actor_id: &str,
    reason: &str,
    metadata: &serde_json::Value,
) -> Result<(), DesignatedError> {
    conn.execute(
        "INSERT INTO designated_state_transitions
             (org_id, account_id, from_state, to_state, actor_id, reason, metadata, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            org_id,
            account_id,
            from,
            to,
            actor_id,
            reason,
            serde_json::to_string(metadata)?,
            to_millis(Utc::now()),
        ],
    )?;
    Ok(())
}
