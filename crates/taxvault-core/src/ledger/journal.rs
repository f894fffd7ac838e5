//! Journal and posting types, the balance invariant, and chain hashing.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of a journal hash in bytes.
pub const HASH_SIZE: usize = 32;

/// Errors raised when a journal violates the double-entry invariant or is
/// missing identity fields. Nothing is persisted when these occur.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum JournalError {
    /// The journal has no postings.
    #[error("unbalanced journal: journal requires at least one posting")]
    NoPostings,

    /// The signed sum of postings is not zero.
    #[error("unbalanced journal: postings must balance to zero (net {net_cents} cents)")]
    Unbalanced {
        /// The non-zero net amount.
        net_cents: i128,
    },

    /// A required identifier is empty.
    #[error("journal field '{field}' must not be empty")]
    EmptyField {
        /// Name of the offending field.
        field: &'static str,
    },
}

impl JournalError {
    /// Returns `true` for the two balance failures.
    #[must_use]
    pub const fn is_unbalanced(&self) -> bool {
        matches!(self, Self::NoPostings | Self::Unbalanced { .. })
    }
}

/// A posting to be written as part of a journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingInput {
    /// Ledger account receiving the amount.
    pub account_id: String,
    /// Signed amount in cents.
    pub amount_cents: i64,
    /// Optional free-text memo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

impl PostingInput {
    /// Creates a posting without a memo.
    #[must_use]
    pub fn new(account_id: impl Into<String>, amount_cents: i64) -> Self {
        Self {
            account_id: account_id.into(),
            amount_cents,
            memo: None,
        }
    }

    /// Attaches a memo (builder pattern).
    #[must_use]
    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }
}

/// A journal to be written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalInput {
    /// Owning organisation.
    pub org_id: String,
    /// Upstream event that produced this journal.
    pub event_id: String,
    /// Idempotency key, unique per organisation.
    pub dedupe_id: String,
    /// Journal type, e.g. `PAYROLL_HOLD`.
    #[serde(rename = "type")]
    pub journal_type: String,
    /// Producer of the journal.
    pub source: String,
    /// When the underlying event happened.
    pub occurred_at: DateTime<Utc>,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ordered postings.
    pub postings: Vec<PostingInput>,
}

impl JournalInput {
    /// Creates a journal with no postings.
    #[must_use]
    pub fn new(
        org_id: impl Into<String>,
        event_id: impl Into<String>,
        dedupe_id: impl Into<String>,
        journal_type: impl Into<String>,
        source: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            org_id: org_id.into(),
            event_id: event_id.into(),
            dedupe_id: dedupe_id.into(),
            journal_type: journal_type.into(),
            source: source.into(),
            occurred_at,
            description: None,
            postings: Vec::new(),
        }
    }

    /// Sets the description (builder pattern).
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Appends a posting (builder pattern).
    #[must_use]
    pub fn with_posting(mut self, posting: PostingInput) -> Self {
        self.postings.push(posting);
        self
    }

    /// Checks identity fields and the balance invariant.
    ///
    /// # Errors
    ///
    /// Returns the first violated rule.
    pub fn validate(&self) -> Result<(), JournalError> {
        for (field, value) in [
            ("org_id", &self.org_id),
            ("event_id", &self.event_id),
            ("dedupe_id", &self.dedupe_id),
            ("type", &self.journal_type),
            ("source", &self.source),
        ] {
            if value.trim().is_empty() {
                return Err(JournalError::EmptyField { field });
            }
        }
        if self.postings.iter().any(|p| p.account_id.trim().is_empty()) {
            return Err(JournalError::EmptyField {
                field: "account_id",
            });
        }
        validate_postings(&self.postings)
    }
}

/// Enforces the double-entry invariant: at least one posting, and amounts
/// summing to exactly zero.
///
/// # Errors
///
/// Returns [`JournalError::NoPostings`] or [`JournalError::Unbalanced`].
pub fn validate_postings(postings: &[PostingInput]) -> Result<(), JournalError> {
    if postings.is_empty() {
        return Err(JournalError::NoPostings);
    }
    // i128 cannot overflow for any realistic posting count.
    let net: i128 = postings.iter().map(|p| i128::from(p.amount_cents)).sum();
    if net != 0 {
        return Err(JournalError::Unbalanced { net_cents: net });
    }
    Ok(())
}

/// A stored posting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    /// Row identifier.
    pub id: u64,
    /// Ledger account.
    pub account_id: String,
    /// Signed amount in cents.
    pub amount_cents: i64,
    /// Optional memo.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

/// A stored journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Journal {
    /// Row identifier.
    pub id: u64,
    /// Owning organisation.
    pub org_id: String,
    /// Per-organisation sequence number, starting at 1.
    pub seq: u64,
    /// Upstream event identifier.
    pub event_id: String,
    /// Idempotency key.
    pub dedupe_id: String,
    /// Journal type.
    #[serde(rename = "type")]
    pub journal_type: String,
    /// Producer of the journal.
    pub source: String,
    /// When the underlying event happened.
    pub occurred_at: DateTime<Utc>,
    /// Optional description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Hash of the previous journal for this organisation.
    pub prev_hash: Option<String>,
    /// Hash of this journal (hex).
    pub hash: String,
    /// Ordered postings.
    pub postings: Vec<Posting>,
}

impl Journal {
    /// Rebuilds the hashable view of a stored journal.
    #[must_use]
    pub fn as_input(&self) -> JournalInput {
        JournalInput {
            org_id: self.org_id.clone(),
            event_id: self.event_id.clone(),
            dedupe_id: self.dedupe_id.clone(),
            journal_type: self.journal_type.clone(),
            source: self.source.clone(),
            occurred_at: self.occurred_at,
            description: self.description.clone(),
            postings: self
                .postings
                .iter()
                .map(|p| PostingInput {
                    account_id: p.account_id.clone(),
                    amount_cents: p.amount_cents,
                    memo: p.memo.clone(),
                })
                .collect(),
        }
    }
}

/// Result of [`super::JournalWriter::write`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JournalWriteResult {
    /// The stored journal (new or pre-existing).
    pub journal: Journal,
    /// `false` when the dedupe key already existed.
    pub created: bool,
}

/// Computes the chained hash of a journal.
///
/// The hash is BLAKE3 over `prev_hash || fields`, where every field is
/// length-prefixed so that adjacent fields cannot be shifted into each
/// other. `occurred_at` is hashed at millisecond precision, the precision it
/// is stored at.
#[must_use]
pub fn journal_hash(prev_hash: Option<&str>, input: &JournalInput) -> String {
    let mut hasher = blake3::Hasher::new();
    let genesis = [0u8; HASH_SIZE];
    match prev_hash.and_then(|h| hex::decode(h).ok()) {
        Some(bytes) => hasher.update(&bytes),
        None => hasher.update(&genesis),
    };

    let mut field = |bytes: &[u8]| {
        hasher.update(&(bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    };
    field(input.org_id.as_bytes());
    field(input.event_id.as_bytes());
    field(input.dedupe_id.as_bytes());
    field(input.journal_type.as_bytes());
    field(
        input
            .occurred_at
            .to_rfc3339_opts(SecondsFormat::Millis, true)
            .as_bytes(),
    );
    field(input.source.as_bytes());
    field(input.description.as_deref().unwrap_or("").as_bytes());
    for posting in &input.postings {
        field(posting.account_id.as_bytes());
        field(&posting.amount_cents.to_le_bytes());
        field(posting.memo.as_deref().unwrap_or("").as_bytes());
    }

    hex::encode(hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-10-24T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn balanced() -> JournalInput {
        JournalInput::new("org-1", "event-1", "dup-1", "PAYROLL_HOLD", "test", at())
            .with_posting(PostingInput::new("acct-a", 100))
            .with_posting(PostingInput::new("acct-b", -100))
    }

    #[test]
    fn test_accepts_balanced_postings() {
        assert_eq!(balanced().validate(), Ok(()));
    }

    #[test]
    fn test_rejects_empty_and_unbalanced() {
        assert_eq!(validate_postings(&[]), Err(JournalError::NoPostings));
        let err = validate_postings(&[
            PostingInput::new("acct-a", 100),
            PostingInput::new("acct-b", 10),
        ])
        .unwrap_err();
        assert_eq!(err, JournalError::Unbalanced { net_cents: 110 });
        assert!(err.is_unbalanced());
    }

    #[test]
    fn test_extreme_amounts_do_not_overflow_the_check() {
        let postings = [
            PostingInput::new("a", i64::MAX),
            PostingInput::new("b", i64::MAX),
            PostingInput::new("c", i64::MIN),
            PostingInput::new("d", i64::MIN),
        ];
        assert_eq!(
            validate_postings(&postings),
            Err(JournalError::Unbalanced { net_cents: -2 })
        );
    }

    #[test]
    fn test_rejects_blank_identifiers() {
        let mut input = balanced();
        input.dedupe_id = "  ".to_string();
        assert_eq!(
            input.validate(),
            Err(JournalError::EmptyField { field: "dedupe_id" })
        );

        let input = balanced().with_posting(PostingInput::new("", 0));
        assert_eq!(
            input.validate(),
            Err(JournalError::EmptyField {
                field: "account_id"
            })
        );
    }

    #[test]
    fn test_hash_depends_on_previous_hash_and_content() {
        let input = balanced();
        let genesis = journal_hash(None, &input);
        assert_eq!(genesis.len(), HASH_SIZE * 2);
        assert_eq!(genesis, journal_hash(None, &input));

        let chained = journal_hash(Some(&genesis), &input);
        assert_ne!(genesis, chained);

        let mut altered = input.clone();
        altered.postings[0].memo = Some("x".to_string());
        assert_ne!(genesis, journal_hash(None, &altered));
    }

    #[test]
    fn test_field_boundaries_are_unambiguous() {
        let mut a = balanced();
        a.event_id = "ab".to_string();
        a.dedupe_id = "c".to_string();
        let mut b = balanced();
        b.event_id = "a".to_string();
        b.dedupe_id = "bc".to_string();
        assert_ne!(journal_hash(None, &a), journal_hash(None, &b));
    }

    #[test]
    fn test_deserializes_type_field() {
        let json = r#"{
            "org_id": "org-1", "event_id": "e", "dedupe_id": "d", "type": "GST_HOLD",
            "source": "pos", "occurred_at": "2025-10-24T00:00:00Z",
            "postings": [
                {"account_id": "a", "amount_cents": 5},
                {"account_id": "b", "amount_cents": -5, "memo": "m"}
            ]
        }"#;
        let input: JournalInput = serde_json::from_str(json).unwrap();
        assert_eq!(input.journal_type, "GST_HOLD");
        assert_eq!(input.postings[1].memo.as_deref(), Some("m"));
        assert!(input.validate().is_ok());
    }
}
