//! Payroll and point-of-sale contributions.
//!
//! Upstream systems report withheld PAYGW (payroll) and collected GST (POS)
//! as contributions. Recording is idempotent on the caller's idempotency
//! key; [`ContributionLedger::apply_pending`] later credits each pending
//! contribution into the matching designated account.
//!
//! Each contribution is applied in its own transaction together with its
//! status change, so a crash never credits a contribution twice.

// SQLite row IDs are always non-negative.
#![allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]

use std::fmt;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::audit::AuditEntry;
use crate::designated::{
    AccountKind, DesignatedAccounts, DesignatedError, TransferOutcome, TransferReceipt,
    TransferRequest, account_by_kind_in, process_credit_in,
};
use crate::ledger::{from_millis, to_millis};
use crate::money::Cents;
use crate::policy::TransferSource;

/// Errors from contribution ingestion.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IngestError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Payload could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Applying a contribution failed.
    #[error(transparent)]
    Designated(#[from] DesignatedError),

    /// A stored row holds a value this version does not write.
    #[error("corrupt contribution row {id}: {details}")]
    CorruptRow {
        /// Row identifier.
        id: u64,
        /// Details about the failure.
        details: String,
    },
}

/// Where a contribution comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContributionChannel {
    /// Payroll run; credits the PAYGW buffer.
    Payroll,
    /// Point-of-sale takings; credits the GST buffer.
    Pos,
}

impl ContributionChannel {
    /// Channels in the order [`ContributionLedger::apply_pending`] drains
    /// them.
    pub const ALL: [Self; 2] = [Self::Payroll, Self::Pos];

    /// Returns the stored name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Payroll => "payroll",
            Self::Pos => "pos",
        }
    }

    /// Account kind credited by this channel.
    #[must_use]
    pub const fn account_kind(self) -> AccountKind {
        match self {
            Self::Payroll => AccountKind::PaygwBuffer,
            Self::Pos => AccountKind::GstBuffer,
        }
    }

    /// Transfer source used for credits from this channel.
    #[must_use]
    pub const fn source(self) -> TransferSource {
        match self {
            Self::Payroll => TransferSource::PayrollCapture,
            Self::Pos => TransferSource::GstCapture,
        }
    }
}

impl fmt::Display for ContributionChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing status of a contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContributionStatus {
    /// Waiting to be applied.
    Pending,
    /// Credited to its designated account.
    Applied,
    /// Rejected by the deposit-only policy.
    Rejected,
}

impl ContributionStatus {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Applied => "APPLIED",
            Self::Rejected => "REJECTED",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "APPLIED" => Some(Self::Applied),
            "REJECTED" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// A contribution to record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionInput {
    /// Organisation.
    pub org_id: String,
    /// Origin channel.
    pub channel: ContributionChannel,
    /// Amount in cents.
    pub amount_cents: i64,
    /// Reporting system or user.
    pub actor_id: Option<String>,
    /// Raw upstream payload, kept for audit.
    pub payload: Option<serde_json::Value>,
    /// Caller-chosen key; a second record with the same key is ignored.
    pub idempotency_key: Option<String>,
}

/// Outcome of [`ContributionLedger::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// A new row was stored.
    Recorded {
        /// Row identifier.
        id: u64,
    },
    /// The idempotency key was already used.
    Duplicate {
        /// Identifier of the existing row.
        id: u64,
    },
}

impl RecordOutcome {
    /// Row identifier in either case.
    #[must_use]
    pub const fn id(self) -> u64 {
        match self {
            Self::Recorded { id } | Self::Duplicate { id } => id,
        }
    }
}

/// A stored contribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Contribution {
    /// Row identifier.
    pub id: u64,
    /// Organisation.
    pub org_id: String,
    /// Origin channel.
    pub channel: ContributionChannel,
    /// Amount in cents.
    pub amount_cents: i64,
    /// Processing status.
    pub status: ContributionStatus,
    /// Transfer created when applied.
    pub transfer_id: Option<String>,
    /// When recorded.
    pub created_at: DateTime<Utc>,
    /// When applied or rejected.
    pub applied_at: Option<DateTime<Utc>>,
}

/// Totals from one [`ContributionLedger::apply_pending`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    /// Contributions credited.
    pub applied: u64,
    /// Contributions rejected by policy.
    pub rejected: u64,
    /// Contributions left pending because their account is missing or
    /// locked.
    pub deferred: u64,
    /// Receipts for the credited contributions, in application order.
    pub receipts: Vec<TransferReceipt>,
}

/// What happened to one pending contribution.
enum RowOutcome {
    Transfer(TransferOutcome),
    /// The amount passed policy but cannot be credited.
    Unprocessable { reason: String },
}

/// Records and applies contributions.
#[derive(Debug, Clone)]
pub struct ContributionLedger {
    accounts: DesignatedAccounts,
}

impl ContributionLedger {
    /// Creates a ledger that applies contributions through `accounts`.
    #[must_use]
    pub const fn new(accounts: DesignatedAccounts) -> Self {
        Self { accounts }
    }

    /// Records a contribution.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized or the insert
    /// fails.
    pub fn record(&self, input: &ContributionInput) -> Result<RecordOutcome, IngestError> {
        let payload = input
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.accounts.store().lock();
        let inserted = conn.execute(
            "INSERT INTO contributions
                 (org_id, channel, amount_cents, actor_id, payload, idempotency_key, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(org_id, channel, idempotency_key) DO NOTHING",
            params![
                input.org_id,
                input.channel.as_str(),
                input.amount_cents,
                input.actor_id,
                payload,
                input.idempotency_key,
                to_millis(Utc::now()),
            ],
        )?;

        if inserted == 1 {
            let id = conn.last_insert_rowid() as u64;
            debug!(org_id = %input.org_id, channel = %input.channel, id, "contribution recorded");
            return Ok(RecordOutcome::Recorded { id });
        }

        let id: i64 = conn.query_row(
            "SELECT id FROM contributions
             WHERE org_id = ?1 AND channel = ?2 AND idempotency_key = ?3",
            params![input.org_id, input.channel.as_str(), input.idempotency_key],
            |row| row.get(0),
        )?;
        debug!(
            org_id = %input.org_id,
            channel = %input.channel,
            id,
            "duplicate contribution ignored"
        );
        Ok(RecordOutcome::Duplicate { id: id as u64 })
    }

    /// Lists contributions still pending, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn pending(&self, org_id: &str) -> Result<Vec<Contribution>, IngestError> {
        self.query(org_id, Some(ContributionStatus::Pending))
    }

    /// Lists every contribution for an organisation, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn all(&self, org_id: &str) -> Result<Vec<Contribution>, IngestError> {
        self.query(org_id, None)
    }

    /// Credits every pending contribution: payroll into the PAYGW buffer,
    /// then POS into the GST buffer, each in creation order.
    ///
    /// Policy rejections mark the contribution REJECTED. When the target
    /// account is missing or locked, the channel's remaining contributions
    /// stay pending.
    ///
    /// # Errors
    ///
    /// Returns the first storage error; contributions applied before it stay
    /// applied.
    pub fn apply_pending(&self, org_id: &str, actor_id: &str) -> Result<ApplySummary, IngestError> {
        let mut summary = ApplySummary::default();

        for channel in ContributionChannel::ALL {
            let pending: Vec<Contribution> = self
                .pending(org_id)?
                .into_iter()
                .filter(|c| c.channel == channel)
                .collect();
            if pending.is_empty() {
                continue;
            }

            let account = {
                let conn = self.accounts.store().lock();
                account_by_kind_in(&conn, org_id, channel.account_kind())?
            };
            let Some(account) = account else {
                warn!(
                    org_id,
                    channel = %channel,
                    count = pending.len(),
                    "no designated account; contributions deferred"
                );
                summary.deferred += pending.len() as u64;
                continue;
            };

            for (index, contribution) in pending.iter().enumerate() {
                let request = TransferRequest {
                    org_id: org_id.to_string(),
                    account_id: account.id.clone(),
                    amount: Cents::new(contribution.amount_cents).as_dollars(),
                    source: channel.source().as_str().to_string(),
                    actor_id: actor_id.to_string(),
                };

                match self.apply_one(contribution, &request) {
                    Ok(Some(RowOutcome::Transfer(TransferOutcome::Applied { receipt, audit }))) => {
                        self.accounts.emit(audit);
                        summary.applied += 1;
                        summary.receipts.push(receipt);
                    },
                    Ok(Some(RowOutcome::Transfer(TransferOutcome::Rejected { audit, .. }))) => {
                        self.accounts.emit(audit);
                        summary.rejected += 1;
                    },
                    Ok(Some(RowOutcome::Unprocessable { reason })) => {
                        warn!(
                            org_id,
                            contribution_id = contribution.id,
                            amount_cents = contribution.amount_cents,
                            reason = %reason,
                            "contribution cannot be credited; rejected"
                        );
                        self.accounts.emit(AuditEntry::new(
                            org_id,
                            actor_id,
                            "contribution.rejected",
                            json!({
                                "contributionId": contribution.id,
                                "channel": channel,
                                "amountCents": contribution.amount_cents,
                                "reason": reason,
                            }),
                        ));
                        summary.rejected += 1;
                    },
                    Ok(None) => {},
                    Err(IngestError::Designated(DesignatedError::AccountLocked { state, .. })) => {
                        let remaining = (pending.len() - index) as u64;
                        warn!(
                            org_id,
                            channel = %channel,
                            state = %state,
                            remaining,
                            "designated account not accepting credits; contributions deferred"
                        );
                        summary.deferred += remaining;
                        break;
                    },
                    Err(e) => return Err(e),
                }
            }
        }

        info!(
            org_id,
            applied = summary.applied,
            rejected = summary.rejected,
            deferred = summary.deferred,
            "pending contributions processed"
        );
        Ok(summary)
    }

    /// Applies one contribution and updates its status atomically. Returns
    /// `None` if another worker already processed it.
    ///
    /// The policy sees the amount in dollars, but the credit is the stored
    /// cent amount. An amount the account cannot absorb rejects the row
    /// instead of failing the run.
    fn apply_one(
        &self,
        contribution: &Contribution,
        request: &TransferRequest,
    ) -> Result<Option<RowOutcome>, IngestError> {
        let contribution_id = contribution.id;
        let mut conn = self.accounts.store().lock();
        let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let still_pending: Option<i64> = tx
            .query_row(
                "SELECT id FROM contributions WHERE id = ?1 AND status = 'PENDING'",
                params![contribution_id as i64],
                |row| row.get(0),
            )
            .optional()?;
        if still_pending.is_none() {
            return Ok(None);
        }

        let outcome = {
            let sp = tx.savepoint()?;
            match process_credit_in(&sp, request, Cents::new(contribution.amount_cents)) {
                Ok(outcome) => {
                    sp.commit()?;
                    RowOutcome::Transfer(outcome)
                },
                Err(e @ (DesignatedError::Money(_) | DesignatedError::InvalidAmount { .. })) => {
                    RowOutcome::Unprocessable {
                        reason: e.to_string(),
                    }
                },
                Err(e) => return Err(e.into()),
            }
        };
        let (status, transfer_id) = match &outcome {
            RowOutcome::Transfer(TransferOutcome::Applied { receipt, .. }) => {
                (ContributionStatus::Applied, Some(receipt.transfer_id.as_str()))
            },
            RowOutcome::Transfer(TransferOutcome::Rejected { .. })
            | RowOutcome::Unprocessable { .. } => (ContributionStatus::Rejected, None),
        };
        tx.execute(
            "UPDATE contributions SET status = ?1, transfer_id = ?2, applied_at_ms = ?3
             WHERE id = ?4",
            params![
                status.as_str(),
                transfer_id,
                to_millis(Utc::now()),
                contribution_id as i64
            ],
        )?;
        tx.commit()?;
        Ok(Some(outcome))
    }

    fn query(
        &self,
        org_id: &str,
        status: Option<ContributionStatus>,
    ) -> Result<Vec<Contribution>, IngestError> {
        let status = status.map(ContributionStatus::as_str);

        let conn = self.accounts.store().lock();
        let mut stmt = conn.prepare(
            "SELECT id, org_id, channel, amount_cents, status, transfer_id, created_at_ms,
                    applied_at_ms
             FROM contributions
             WHERE org_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at_ms ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![org_id, status], |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    from_millis(row.get(6)?)?,
                    row.get::<_, Option<i64>>(7)?
                        .map(from_millis)
                        .transpose()?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(id, org_id, channel, amount_cents, status, transfer_id, created_at, applied_at)|
                 -> Result<Contribution, IngestError> {
                    let channel = match channel.as_str() {
                        "payroll" => ContributionChannel::Payroll,
                        "pos" => ContributionChannel::Pos,
                        other => {
                            return Err(IngestError::CorruptRow {
                                id,
                                details: format!("unknown channel {other:?}"),
                            });
                        },
                    };
                    let status = ContributionStatus::parse(&status).ok_or_else(|| {
                        IngestError::CorruptRow {
                            id,
                            details: format!("unknown status {status:?}"),
                        }
                    })?;
                    Ok(Contribution {
                        id,
                        org_id,
                        channel,
                        amount_cents,
                        status,
                        transfer_id,
                        created_at,
                        applied_at,
                    })
                },
            )
            .collect()
    }
}
