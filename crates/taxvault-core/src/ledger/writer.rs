//! Idempotent, transactional journal writer.
//!
//! A write either returns the journal already stored under
//! `(org_id, dedupe_id)` unchanged, or validates, sequences, hashes, and
//! inserts a new journal with its postings in one transaction. Writers take
//! an IMMEDIATE transaction so the database write lock is held from the
//! sequence read to the commit; two writers for the same org can never
//! observe the same head.

// SQLite stores sequence numbers and row IDs as i64; they are always
// non-negative.
#![allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use tracing::{debug, info};

use super::journal::{Journal, JournalInput, JournalWriteResult, Posting, journal_hash};
use super::storage::{LedgerError, LedgerStore, from_millis, is_unique_violation, to_millis};

const JOURNAL_COLUMNS: &str = "id, org_id, seq, event_id, dedupe_id, journal_type, source, \
                               occurred_at_ms, description, prev_hash, hash";

/// Batch size used when walking a chain.
const VERIFY_BATCH: u64 = 1000;

/// Writes and reads balanced journals.
#[derive(Debug, Clone)]
pub struct JournalWriter {
    store: LedgerStore,
}

impl JournalWriter {
    /// Creates a writer over the given store.
    #[must_use]
    pub const fn new(store: LedgerStore) -> Self {
        Self { store }
    }

    /// Returns the underlying store.
    #[must_use]
    pub const fn store(&self) -> &LedgerStore {
        &self.store
    }

    /// Writes a journal, or returns the existing one for its dedupe key.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Journal`] if the journal is unbalanced or
    /// missing identifiers (nothing is written), or a database error.
    pub fn write(&self, input: &JournalInput) -> Result<JournalWriteResult, LedgerError> {
        input.validate()?;

        let mut conn = self.store.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = write_in_tx(&tx, input)?;
        tx.commit()?;

        if result.created {
            info!(
                org_id = %result.journal.org_id,
                seq = result.journal.seq,
                dedupe_id = %result.journal.dedupe_id,
                postings = result.journal.postings.len(),
                "journal written"
            );
        } else {
            debug!(
                org_id = %result.journal.org_id,
                dedupe_id = %result.journal.dedupe_id,
                "duplicate journal write ignored"
            );
        }
        Ok(result)
    }

    /// Looks up a journal by its dedupe key.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_by_dedupe(
        &self,
        org_id: &str,
        dedupe_id: &str,
    ) -> Result<Option<Journal>, LedgerError> {
        let conn = self.store.lock();
        find_by_dedupe(&conn, org_id, dedupe_id)
    }

    /// Reads a journal by sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::JournalNotFound`] if nothing is stored there.
    pub fn get_by_seq(&self, org_id: &str, seq: u64) -> Result<Journal, LedgerError> {
        let conn = self.store.lock();
        let sql = format!("SELECT {JOURNAL_COLUMNS} FROM journals WHERE org_id = ?1 AND seq = ?2");
        let journal = conn
            .query_row(&sql, params![org_id, seq as i64], map_journal_row)
            .optional()?
            .ok_or_else(|| LedgerError::JournalNotFound {
                org_id: org_id.to_string(),
                seq,
            })?;
        with_postings(&conn, journal)
    }

    /// Lists journals for an organisation with `seq >= from_seq`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list(
        &self,
        org_id: &str,
        from_seq: u64,
        limit: u64,
    ) -> Result<Vec<Journal>, LedgerError> {
        let conn = self.store.lock();
        list_in(&conn, org_id, from_seq, limit)
    }

    /// Returns the highest sequence number for the organisation (0 if none).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn head(&self, org_id: &str) -> Result<u64, LedgerError> {
        let conn = self.store.lock();
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(seq) FROM journals WHERE org_id = ?1",
            params![org_id],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0) as u64)
    }

    /// Sums all postings against an account.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn account_balance(&self, org_id: &str, account_id: &str) -> Result<i64, LedgerError> {
        let conn = self.store.lock();
        account_balance_in(&conn, org_id, account_id)
    }

    /// Recomputes the hash chain of an organisation from genesis.
    ///
    /// Also checks that sequence numbers start at 1 without gaps and that
    /// every stored journal still balances.
    ///
    /// Returns the number of journals verified.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::HashChainBroken`] at the first inconsistency.
    pub fn verify_chain(&self, org_id: &str) -> Result<u64, LedgerError> {
        let mut expected_seq = 1u64;
        let mut prev_hash: Option<String> = None;

        loop {
            let batch = self.list(org_id, expected_seq, VERIFY_BATCH)?;
            if batch.is_empty() {
                break;
            }

            for journal in batch {
                let broken = |details: String| LedgerError::HashChainBroken {
                    org_id: org_id.to_string(),
                    seq: journal.seq,
                    details,
                };

                if journal.seq != expected_seq {
                    return Err(broken(format!("expected seq {expected_seq}")));
                }
                if journal.prev_hash != prev_hash {
                    return Err(broken("prev_hash mismatch".to_string()));
                }
                let input = journal.as_input();
                if let Err(e) = super::journal::validate_postings(&input.postings) {
                    return Err(broken(e.to_string()));
                }
                let computed = journal_hash(prev_hash.as_deref(), &input);
                if computed != journal.hash {
                    return Err(broken("hash mismatch".to_string()));
                }

                prev_hash = Some(journal.hash);
                expected_seq += 1;
            }
        }

        Ok(expected_seq - 1)
    }
}

/// Writes a journal inside a caller-owned transaction.
///
/// The caller must hold a write transaction (IMMEDIATE or already
/// upgraded) so that the sequence read and the insert are atomic.
pub(crate) fn write_in_tx(
    conn: &Connection,
    input: &JournalInput,
) -> Result<JournalWriteResult, LedgerError> {
    input.validate()?;

    if let Some(existing) = find_by_dedupe(conn, &input.org_id, &input.dedupe_id)? {
        return Ok(JournalWriteResult {
            journal: existing,
            created: false,
        });
    }

    let last: Option<(i64, String)> = conn
        .query_row(
            "SELECT seq, hash FROM journals WHERE org_id = ?1 ORDER BY seq DESC LIMIT 1",
            params![input.org_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let next_seq = last.as_ref().map_or(0, |(seq, _)| *seq) + 1;
    let prev_hash = last.map(|(_, hash)| hash);
    let hash = journal_hash(prev_hash.as_deref(), input);

    let inserted = conn.execute(
        "INSERT INTO journals
             (org_id, seq, event_id, dedupe_id, journal_type, source, occurred_at_ms,
              description, prev_hash, hash, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            input.org_id,
            next_seq,
            input.event_id,
            input.dedupe_id,
            input.journal_type,
            input.source,
            to_millis(input.occurred_at),
            input.description,
            prev_hash,
            hash,
            to_millis(Utc::now()),
        ],
    );

    match inserted {
        Ok(_) => {},
        Err(e) if is_unique_violation(&e) => {
            // Another connection won the race; the store already holds the
            // journal for this dedupe key.
            if let Some(existing) = find_by_dedupe(conn, &input.org_id, &input.dedupe_id)? {
                return Ok(JournalWriteResult {
                    journal: existing,
                    created: false,
                });
            }
            return Err(e.into());
        },
        Err(e) => return Err(e.into()),
    }

    let journal_id = conn.last_insert_rowid();
    {
        let mut stmt = conn.prepare(
            "INSERT INTO postings (journal_id, org_id, position, account_id, amount_cents, memo)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for (position, posting) in input.postings.iter().enumerate() {
            stmt.execute(params![
                journal_id,
                input.org_id,
                position as i64,
                posting.account_id,
                posting.amount_cents,
                posting.memo,
            ])?;
        }
    }

    let sql = format!("SELECT {JOURNAL_COLUMNS} FROM journals WHERE id = ?1");
    let journal = conn.query_row(&sql, params![journal_id], map_journal_row)?;
    Ok(JournalWriteResult {
        journal: with_postings(conn, journal)?,
        created: true,
    })
}

pub(crate) fn find_by_dedupe(
    conn: &Connection,
    org_id: &str,
    dedupe_id: &str,
) -> Result<Option<Journal>, LedgerError> {
    let sql =
        format!("SELECT {JOURNAL_COLUMNS} FROM journals WHERE org_id = ?1 AND dedupe_id = ?2");
    let journal = conn
        .query_row(&sql, params![org_id, dedupe_id], map_journal_row)
        .optional()?;
    journal.map(|j| with_postings(conn, j)).transpose()
}

pub(crate) fn account_balance_in(
    conn: &Connection,
    org_id: &str,
    account_id: &str,
) -> Result<i64, LedgerError> {
    let total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(amount_cents), 0) FROM postings WHERE org_id = ?1 AND account_id = ?2",
        params![org_id, account_id],
        |row| row.get(0),
    )?;
    Ok(total)
}

fn list_in(
    conn: &Connection,
    org_id: &str,
    from_seq: u64,
    limit: u64,
) -> Result<Vec<Journal>, LedgerError> {
    let sql = format!(
        "SELECT {JOURNAL_COLUMNS} FROM journals
         WHERE org_id = ?1 AND seq >= ?2 ORDER BY seq ASC LIMIT ?3"
    );
    let mut stmt = conn.prepare(&sql)?;
    let journals = stmt
        .query_map(
            params![org_id, from_seq as i64, limit.min(i64::MAX as u64) as i64],
            map_journal_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;

    journals
        .into_iter()
        .map(|j| with_postings(conn, j))
        .collect()
}

fn map_journal_row(row: &Row<'_>) -> rusqlite::Result<Journal> {
    Ok(Journal {
        id: row.get::<_, i64>(0)? as u64,
        org_id: row.get(1)?,
        seq: row.get::<_, i64>(2)? as u64,
        event_id: row.get(3)?,
        dedupe_id: row.get(4)?,
        journal_type: row.get(5)?,
        source: row.get(6)?,
        occurred_at: from_millis(row.get(7)?)?,
        description: row.get(8)?,
        prev_hash: row.get(9)?,
        hash: row.get(10)?,
        postings: Vec::new(),
    })
}

fn with_postings(conn: &Connection, mut journal: Journal) -> Result<Journal, LedgerError> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, account_id, amount_cents, memo FROM postings
         WHERE journal_id = ?1
         ORDER BY position ASC",
    )?;
    journal.postings = stmt
        .query_map(params![journal.id as i64], |row| {
            Ok(Posting {
                id: row.get::<_, i64>(0)? as u64,
                account_id: row.get(1)?,
                amount_cents: row.get(2)?,
                memo: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(journal)
}
