//! Double-entry journal ledger.
//!
//! Journals belong to an organisation and carry an ordered list of postings
//! whose amounts must sum to exactly zero. Each organisation has its own
//! gap-free sequence and BLAKE3 hash chain. Writes are idempotent on
//! `(org_id, dedupe_id)`: replaying a delivery returns the stored journal
//! with `created == false`.
//!
//! # Example
//!
//! ```rust,no_run
//! use chrono::Utc;
//! use taxvault_core::ledger::{JournalInput, JournalWriter, LedgerStore, PostingInput};
//!
//! # fn example() -> Result<(), taxvault_core::ledger::LedgerError> {
//! let store = LedgerStore::open("/var/lib/taxvault/ledger.db")?;
//! let writer = JournalWriter::new(store);
//!
//! let input = JournalInput::new("org-1", "evt-1", "dup-1", "PAYROLL_HOLD", "payroll", Utc::now())
//!     .with_posting(PostingInput::new("designated:paygw", 12_500))
//!     .with_posting(PostingInput::new("operating", -12_500));
//!
//! let result = writer.write(&input)?;
//! assert!(result.created);
//! # Ok(())
//! # }
//! ```

mod journal;
mod storage;
mod writer;

#[cfg(test)]
mod tests;

pub use journal::{
    HASH_SIZE, Journal, JournalError, JournalInput, JournalWriteResult, Posting, PostingInput,
    journal_hash, validate_postings,
};
pub use storage::{LedgerError, LedgerStats, LedgerStore};
pub use writer::JournalWriter;

pub(crate) use storage::{from_millis, to_millis};
pub(crate) use writer::{account_balance_in, write_in_tx};
