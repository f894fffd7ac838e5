//! Tests for designated accounts.

use super::*;
use crate::alerts::{ALERT_FUNDS_SHORTFALL, ALERT_POLICY_VIOLATION, ALERT_WITHDRAWAL_ATTEMPT};
use crate::audit::SqliteAuditSink;
use crate::ledger::{JournalWriter, LedgerStore};
use crate::policy::{Severity, ViolationCode};

fn service() -> (DesignatedAccounts, LedgerStore) {
    let store = LedgerStore::in_memory().unwrap();
    (DesignatedAccounts::with_sqlite_audit(store.clone()), store)
}

fn request(account: &DesignatedAccount, amount: f64, source: &str) -> TransferRequest {
    TransferRequest {
        org_id: account.org_id.clone(),
        account_id: account.id.clone(),
        amount,
        source: source.to_string(),
        actor_id: "alice".to_string(),
    }
}

fn audit_actions(store: &LedgerStore, org_id: &str) -> Vec<String> {
    SqliteAuditSink::new(store.clone())
        .entries(org_id)
        .unwrap()
        .into_iter()
        .map(|r| r.entry.action)
        .collect()
}

#[test]
fn test_open_account_is_idempotent_per_kind() {
    let (accounts, _) = service();

    let first = accounts
        .open_account("org-1", AccountKind::PaygwBuffer, "alice")
        .unwrap();
    let again = accounts
        .open_account("org-1", AccountKind::PaygwBuffer, "bob")
        .unwrap();
    let gst = accounts
        .open_account("org-1", AccountKind::GstBuffer, "alice")
        .unwrap();

    assert_eq!(first, again);
    assert_ne!(first.id, gst.id);
    assert_eq!(first.balance_cents, 0);
    assert_eq!(accounts.list_accounts("org-1").unwrap().len(), 2);
    assert_eq!(
        accounts.current_state("org-1", &first.id).unwrap(),
        AccountState::Active
    );

    let history = accounts.transitions("org-1", &first.id).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].from, None);
    assert_eq!(history[0].to, AccountState::Active);
}

#[test]
fn test_credit_updates_balance_and_writes_balanced_journal() {
    let (accounts, store) = service();
    let account = accounts
        .open_account("org-1", AccountKind::PaygwBuffer, "alice")
        .unwrap();

    let receipt = accounts
        .apply_transfer(&request(&account, 125.005, " payroll_capture"))
        .unwrap();

    assert_eq!(receipt.amount_cents, 12_501);
    assert_eq!(receipt.new_balance_cents, 12_501);
    assert_eq!(receipt.source, TransferSource::PayrollCapture);
    assert_eq!(receipt.journal_seq, 1);

    let writer = JournalWriter::new(store.clone());
    let journal = writer
        .get_by_dedupe("org-1", &format!("transfer:{}", receipt.transfer_id))
        .unwrap()
        .unwrap();
    assert_eq!(journal.journal_type, DESIGNATED_CREDIT_JOURNAL);
    assert_eq!(journal.postings.len(), 2);
    assert_eq!(journal.postings.iter().map(|p| p.amount_cents).sum::<i64>(), 0);

    assert_eq!(writer.account_balance("org-1", &account.id).unwrap(), 12_501);
    assert_eq!(
        writer
            .account_balance("org-1", &clearing_account(TransferSource::PayrollCapture))
            .unwrap(),
        -12_501
    );
    assert_eq!(
        accounts.get_account("org-1", &account.id).unwrap().balance_cents,
        12_501
    );
    assert!(audit_actions(&store, "org-1").contains(&"designatedAccount.credit".to_string()));
}

#[test]
fn test_withdrawal_attempt_is_recorded_and_rejected() {
    let (accounts, store) = service();
    let account = accounts
        .open_account("org-1", AccountKind::GstBuffer, "alice")
        .unwrap();

    for _ in 0..2 {
        let err = accounts
            .apply_transfer(&request(&account, -50.0, "GST_CAPTURE"))
            .unwrap_err();
        assert_eq!(err.code(), "designated_withdrawal_attempt");
        assert!(!err.violation().unwrap().is_retryable());
    }

    assert_eq!(
        accounts.get_account("org-1", &account.id).unwrap().balance_cents,
        0
    );
    assert_eq!(JournalWriter::new(store.clone()).head("org-1").unwrap(), 0);

    let alerts = accounts.open_alerts("org-1").unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, ALERT_WITHDRAWAL_ATTEMPT);
    assert_eq!(alerts[0].severity, "HIGH");

    let flags = accounts.open_violation_flags("org-1").unwrap();
    assert_eq!(flags.len(), 1);
    assert_eq!(flags[0].code, "designated_withdrawal_attempt");
    assert_eq!(flags[0].account_id.as_deref(), Some(account.id.as_str()));

    assert_eq!(
        accounts.current_state("org-1", &account.id).unwrap(),
        AccountState::Investigating
    );
    let history = accounts.transitions("org-1", &account.id).unwrap();
    assert_eq!(history.len(), 2);
    let investigating = &history[1];
    assert_eq!(investigating.from, Some(AccountState::Active));
    assert_eq!(investigating.to, AccountState::Investigating);
    assert_eq!(investigating.reason, "designated_withdrawal_attempt");
    assert_eq!(
        investigating.metadata,
        serde_json::json!({ "code": "designated_withdrawal_attempt", "severity": "HIGH" })
    );

    let violations = audit_actions(&store, "org-1")
        .into_iter()
        .filter(|a| a == "designatedAccount.violation")
        .count();
    assert_eq!(violations, 2);
}

#[test]
fn test_untrusted_source_raises_policy_alert() {
    let (accounts, _) = service();
    let account = accounts
        .open_account("org-1", AccountKind::PaygwBuffer, "alice")
        .unwrap();

    let err = accounts
        .apply_transfer(&request(&account, 10.0, "ATM_DEPOSIT"))
        .unwrap_err();
    assert_eq!(err.code(), "designated_untrusted_source");

    let alerts = accounts.open_alerts("org-1").unwrap();
    assert_eq!(alerts[0].alert_type, ALERT_POLICY_VIOLATION);
}

#[test]
fn test_non_finite_amount_is_medium_violation() {
    let (accounts, _) = service();
    let account = accounts
        .open_account("org-1", AccountKind::PaygwBuffer, "alice")
        .unwrap();

    let err = accounts
        .apply_transfer(&request(&account, f64::NAN, "PAYROLL_CAPTURE"))
        .unwrap_err();
    let violation = err.violation().unwrap();
    assert_eq!(violation.code, ViolationCode::InvalidAmount);
    assert_eq!(violation.severity, Severity::Medium);
    assert_eq!(accounts.open_alerts("org-1").unwrap()[0].severity, "MEDIUM");
}

#[test]
fn test_investigating_account_still_accepts_credits() {
    let (accounts, _) = service();
    let account = accounts
        .open_account("org-1", AccountKind::PaygwBuffer, "alice")
        .unwrap();

    accounts
        .apply_transfer(&request(&account, 0.0, "PAYROLL_CAPTURE"))
        .unwrap_err();
    let receipt = accounts
        .apply_transfer(&request(&account, 1.0, "PAYROLL_CAPTURE"))
        .unwrap();
    assert_eq!(receipt.new_balance_cents, 100);
}

#[test]
fn test_amount_rounding_to_zero_is_rejected_without_flag() {
    let (accounts, _) = service();
    let account = accounts
        .open_account("org-1", AccountKind::PaygwBuffer, "alice")
        .unwrap();

    let err = accounts
        .apply_transfer(&request(&account, 0.004, "PAYROLL_CAPTURE"))
        .unwrap_err();
    assert!(matches!(err, DesignatedError::InvalidAmount { .. }));
    assert_eq!(err.code(), "designated_invalid_amount");
    assert!(accounts.open_violation_flags("org-1").unwrap().is_empty());
}

#[test]
fn test_shortfall_locks_account_until_released() {
    let (accounts, _) = service();
    let account = accounts
        .open_account("org-1", AccountKind::PaygwBuffer, "alice")
        .unwrap();
    accounts
        .apply_transfer(&request(&account, 40.0, "PAYROLL_CAPTURE"))
        .unwrap();

    let snapshot = accounts
        .ensure_coverage("org-1", AccountKind::PaygwBuffer, 4_000, "system")
        .unwrap();
    assert_eq!(snapshot.state, AccountState::Active);

    let err = accounts
        .ensure_coverage("org-1", AccountKind::PaygwBuffer, 10_000, "system")
        .unwrap_err();
    assert_eq!(err.code(), "designated_insufficient_funds");
    assert!(matches!(
        err,
        DesignatedError::InsufficientFunds {
            balance_cents: 4_000,
            required_cents: 10_000,
            ..
        }
    ));
    assert_eq!(
        accounts.open_alerts("org-1").unwrap()[0].alert_type,
        ALERT_FUNDS_SHORTFALL
    );

    let err = accounts
        .apply_transfer(&request(&account, 1.0, "PAYROLL_CAPTURE"))
        .unwrap_err();
    assert_eq!(err.code(), "designated_account_locked");

    let released = accounts
        .release_lock("org-1", &account.id, "bob", "topped up externally")
        .unwrap();
    assert_eq!(released.state, AccountState::Active);
    accounts
        .apply_transfer(&request(&account, 1.0, "PAYROLL_CAPTURE"))
        .unwrap();
}

#[test]
fn test_closed_account_cannot_be_released() {
    let (accounts, _) = service();
    let account = accounts
        .open_account("org-1", AccountKind::GstBuffer, "alice")
        .unwrap();

    accounts
        .close_account("org-1", &account.id, "alice", "deregistered")
        .unwrap();
    let err = accounts
        .release_lock("org-1", &account.id, "alice", "oops")
        .unwrap_err();
    assert!(matches!(
        err,
        DesignatedError::InvalidTransition {
            from: AccountState::Closed,
            to: AccountState::Active,
            ..
        }
    ));
    assert!(accounts.release_lock("org-1", "missing", "alice", "x").is_err());
}

#[test]
fn test_active_account_has_no_lock_to_release() {
    let (accounts, _) = service();
    let account = accounts
        .open_account("org-1", AccountKind::GstBuffer, "alice")
        .unwrap();
    assert_eq!(
        accounts
            .release_lock("org-1", &account.id, "alice", "noop")
            .unwrap_err()
            .code(),
        "designated_invalid_transition"
    );
}

#[test]
fn test_violation_against_unknown_account_is_flagged_without_account() {
    let (accounts, _) = service();
    let req = TransferRequest {
        org_id: "org-1".to_string(),
        account_id: "missing".to_string(),
        amount: -1.0,
        source: "PAYROLL_CAPTURE".to_string(),
        actor_id: "alice".to_string(),
    };

    assert!(accounts.apply_transfer(&req).unwrap_err().violation().is_some());
    let flags = accounts.open_violation_flags("org-1").unwrap();
    assert_eq!(flags[0].account_id, None);

    let req = TransferRequest {
        amount: 1.0,
        ..req
    };
    assert_eq!(
        accounts.apply_transfer(&req).unwrap_err().code(),
        "designated_account_not_found"
    );
}

#[test]
fn test_accounts_are_scoped_to_their_org() {
    let (accounts, _) = service();
    let account = accounts
        .open_account("org-1", AccountKind::GstBuffer, "alice")
        .unwrap();

    let mut req = request(&account, 5.0, "GST_CAPTURE");
    req.org_id = "org-2".to_string();
    assert!(matches!(
        accounts.apply_transfer(&req),
        Err(DesignatedError::AccountNotFound { .. })
    ));
    assert!(accounts.snapshot("org-2", AccountKind::GstBuffer).is_err());
}

#[test]
fn test_kind_and_state_parse_from_stored_names() {
    assert_eq!("GST_BUFFER".parse::<AccountKind>().unwrap(), AccountKind::GstBuffer);
    assert_eq!("locked".parse::<AccountState>().unwrap(), AccountState::Locked);
    assert!("SAVINGS".parse::<AccountKind>().is_err());
}
