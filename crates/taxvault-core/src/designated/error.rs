//! Error types for designated-account operations.

use thiserror::Error;

use super::{AccountKind, AccountState};
use crate::audit::AuditError;
use crate::ledger::LedgerError;
use crate::money::MoneyError;
use crate::policy::PolicyViolation;

/// Errors that can occur while operating on designated accounts.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DesignatedError {
    /// The deposit-only policy rejected the transfer.
    #[error("{0}")]
    Policy(PolicyViolation),

    /// The amount rounds to zero cents or cannot be represented.
    #[error("invalid transfer amount: {reason}")]
    InvalidAmount {
        /// Why the amount was rejected.
        reason: String,
    },

    /// No account with this id exists for the organisation.
    #[error("designated account not found: org_id={org_id} account_id={account_id}")]
    AccountNotFound {
        /// Organisation identifier.
        org_id: String,
        /// Requested account.
        account_id: String,
    },

    /// The organisation has no account of this kind.
    #[error("no {kind} account for org {org_id}")]
    AccountKindNotFound {
        /// Organisation identifier.
        org_id: String,
        /// Requested kind.
        kind: AccountKind,
    },

    /// The account does not accept credits in its current state.
    #[error("designated account {account_id} is {state}")]
    AccountLocked {
        /// Account identifier.
        account_id: String,
        /// Current state.
        state: AccountState,
    },

    /// The account balance does not cover the required amount.
    #[error(
        "designated {kind} account for org {org_id} holds {balance_cents} cents, \
         {required_cents} required"
    )]
    InsufficientFunds {
        /// Organisation identifier.
        org_id: String,
        /// Account kind.
        kind: AccountKind,
        /// Amount required, in cents.
        required_cents: i64,
        /// Amount held, in cents.
        balance_cents: i64,
    },

    /// The requested state change is not allowed.
    #[error("designated account {account_id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Account identifier.
        account_id: String,
        /// Current state.
        from: AccountState,
        /// Requested state.
        to: AccountState,
    },

    /// Amount conversion failed.
    #[error(transparent)]
    Money(#[from] MoneyError),

    /// Ledger error.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Audit sink error.
    #[error(transparent)]
    Audit(#[from] AuditError),

    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Metadata could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DesignatedError {
    /// Stable machine-readable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Policy(violation) => violation.code.as_str(),
            Self::InvalidAmount { .. } | Self::Money(_) => "designated_invalid_amount",
            Self::AccountNotFound { .. } | Self::AccountKindNotFound { .. } => {
                "designated_account_not_found"
            },
            Self::AccountLocked { .. } => "designated_account_locked",
            Self::InsufficientFunds { .. } => "designated_insufficient_funds",
            Self::InvalidTransition { .. } => "designated_invalid_transition",
            Self::Ledger(_) | Self::Audit(_) | Self::Database(_) | Self::Serialization(_) => {
                "internal_error"
            },
        }
    }

    /// Returns the policy violation, if this error is one.
    #[must_use]
    pub const fn violation(&self) -> Option<&PolicyViolation> {
        match self {
            Self::Policy(violation) => Some(violation),
            _ => None,
        }
    }
}

/// A stored enum value that this version does not recognise.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    /// Name of the enum being parsed.
    pub kind: &'static str,
    /// The unrecognised value.
    pub value: String,
}
