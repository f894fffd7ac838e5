//! Designated (tax-holding) accounts.
//!
//! Each organisation holds at most one account per [`AccountKind`]. Accounts
//! are deposit-only: every credit passes through the policy in
//! [`crate::policy`], and an allowed credit updates the recorded balance,
//! stores a transfer row, and appends a balanced journal in one transaction.
//!
//! Account state is an append-only transition log:
//!
//! ```text
//! (none) -> ACTIVE -> INVESTIGATING -> ACTIVE
//!              |  \-> LOCKED --------> ACTIVE
//!              \----> CLOSED
//! ```
//!
//! A rejected credit moves an ACTIVE account to INVESTIGATING; a funding
//! shortfall locks it. LOCKED and CLOSED accounts refuse credits.

mod error;
mod service;

#[cfg(test)]
mod tests;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

pub use error::{DesignatedError, ParseEnumError};
pub use service::DesignatedAccounts;
pub(crate) use service::{
    TransferOutcome, account_by_kind_in, list_accounts_in, process_credit_in,
};

use crate::policy::TransferSource;

/// Journal type used for designated-account credits.
pub const DESIGNATED_CREDIT_JOURNAL: &str = "DESIGNATED_CREDIT";

/// Ledger account that is debited when a designated account is credited
/// from `source`.
#[must_use]
pub fn clearing_account(source: TransferSource) -> String {
    format!("clearing:{source}")
}

/// Kind of designated account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountKind {
    /// Holds PAYGW withheld from wages.
    PaygwBuffer,
    /// Holds GST collected on sales.
    GstBuffer,
}

impl AccountKind {
    /// Every account kind.
    pub const ALL: [Self; 2] = [Self::PaygwBuffer, Self::GstBuffer];

    /// Returns the stored name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PaygwBuffer => "PAYGW_BUFFER",
            Self::GstBuffer => "GST_BUFFER",
        }
    }
}

/// Lifecycle state of a designated account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountState {
    /// Accepting credits.
    Active,
    /// A policy violation is under review; credits are still accepted.
    Investigating,
    /// Frozen after a funding shortfall.
    Locked,
    /// Permanently closed.
    Closed,
}

impl AccountState {
    /// Returns the stored name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Investigating => "INVESTIGATING",
            Self::Locked => "LOCKED",
            Self::Closed => "CLOSED",
        }
    }

    /// Returns `true` if credits may be applied.
    #[must_use]
    pub const fn accepts_credits(self) -> bool {
        matches!(self, Self::Active | Self::Investigating)
    }
}

macro_rules! string_enum {
    ($ty:ident, $name:literal, [$($variant:ident),+]) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(
                    if s.eq_ignore_ascii_case(Self::$variant.as_str()) {
                        return Ok(Self::$variant);
                    }
                )+
                Err(ParseEnumError {
                    kind: $name,
                    value: s.to_string(),
                })
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: ParseEnumError| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

string_enum!(AccountKind, "account kind", [PaygwBuffer, GstBuffer]);
string_enum!(AccountState, "account state", [Active, Investigating, Locked, Closed]);

/// A designated account row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DesignatedAccount {
    /// Account identifier; also the ledger account id for its postings.
    pub id: String,
    /// Owning organisation.
    pub org_id: String,
    /// Account kind.
    pub kind: AccountKind,
    /// Recorded balance in cents.
    pub balance_cents: i64,
    /// Last balance change.
    pub updated_at: DateTime<Utc>,
}

/// Account together with its current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountSnapshot {
    /// The account.
    #[serde(flatten)]
    pub account: DesignatedAccount,
    /// Current lifecycle state.
    pub state: AccountState,
}

/// A request to credit a designated account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Owning organisation.
    pub org_id: String,
    /// Target account.
    pub account_id: String,
    /// Amount in dollars.
    pub amount: f64,
    /// Declared origin of the funds.
    pub source: String,
    /// Who initiated the transfer.
    pub actor_id: String,
}

/// Result of an applied credit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferReceipt {
    /// Transfer identifier.
    pub transfer_id: String,
    /// Owning organisation.
    pub org_id: String,
    /// Credited account.
    pub account_id: String,
    /// Credited amount in cents.
    pub amount_cents: i64,
    /// Balance after the credit.
    pub new_balance_cents: i64,
    /// Canonical source.
    pub source: TransferSource,
    /// Sequence number of the backing journal.
    pub journal_seq: u64,
}

/// One entry in an account's state history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    /// Previous state; `None` for the initial transition.
    pub from: Option<AccountState>,
    /// New state.
    pub to: AccountState,
    /// Who caused the change.
    pub actor_id: String,
    /// Why.
    pub reason: String,
    /// Detail, e.g. the violation code and severity.
    pub metadata: serde_json::Value,
    /// When.
    pub created_at: DateTime<Utc>,
}

/// A recorded policy violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViolationFlag {
    /// Row identifier.
    pub id: u64,
    /// Organisation.
    pub org_id: String,
    /// Account the rejected transfer targeted, if it exists.
    pub account_id: Option<String>,
    /// Violation code.
    pub code: String,
    /// Severity name.
    pub severity: String,
    /// `OPEN` until reviewed.
    pub status: String,
    /// Request detail.
    pub metadata: serde_json::Value,
    /// When first detected.
    pub detected_at: DateTime<Utc>,
}
