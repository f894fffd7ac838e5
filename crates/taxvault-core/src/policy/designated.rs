//! Deposit-only policy for designated accounts.
//!
//! Rules are checked in a fixed order and the first failure wins:
//!
//! 1. the amount must be finite ([`ViolationCode::InvalidAmount`], MEDIUM);
//! 2. the amount must be strictly positive
//!    ([`ViolationCode::WithdrawalAttempt`], HIGH);
//! 3. the source must be on the allow-list
//!    ([`ViolationCode::UntrustedSource`], HIGH).
//!
//! A denial is final. Callers must surface it as a rejection and never
//! retry the same request.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Allowed origins of a designated-account credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferSource {
    /// PAYGW withheld at payroll time.
    PayrollCapture,
    /// GST captured from point-of-sale takings.
    GstCapture,
    /// Funds escrowed ahead of a BAS lodgment.
    BasEscrow,
}

impl TransferSource {
    /// Every source on the allow-list.
    pub const ALL: [Self; 3] = [Self::PayrollCapture, Self::GstCapture, Self::BasEscrow];

    /// Returns the canonical wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PayrollCapture => "PAYROLL_CAPTURE",
            Self::GstCapture => "GST_CAPTURE",
            Self::BasEscrow => "BAS_ESCROW",
        }
    }
}

impl fmt::Display for TransferSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a caller-supplied source string onto the allow-list.
///
/// Surrounding whitespace and letter case are ignored. Anything that is not
/// one of the three canonical names yields `None`.
#[must_use]
pub fn normalize_transfer_source(source: &str) -> Option<TransferSource> {
    let candidate = source.trim();
    TransferSource::ALL
        .into_iter()
        .find(|s| s.as_str().eq_ignore_ascii_case(candidate))
}

/// Severity attached to a policy violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Malformed input, not an attack signal on its own.
    Medium,
    /// Attempted withdrawal or untrusted funding.
    High,
}

impl Severity {
    /// Returns the canonical wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable violation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViolationCode {
    /// Amount was NaN or infinite.
    #[serde(rename = "designated_invalid_amount")]
    InvalidAmount,
    /// Amount was zero or negative.
    #[serde(rename = "designated_withdrawal_attempt")]
    WithdrawalAttempt,
    /// Source is not on the allow-list.
    #[serde(rename = "designated_untrusted_source")]
    UntrustedSource,
}

impl ViolationCode {
    /// Returns the canonical wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidAmount => "designated_invalid_amount",
            Self::WithdrawalAttempt => "designated_withdrawal_attempt",
            Self::UntrustedSource => "designated_untrusted_source",
        }
    }

    /// Returns the severity associated with this code.
    #[must_use]
    pub const fn severity(self) -> Severity {
        match self {
            Self::InvalidAmount => Severity::Medium,
            Self::WithdrawalAttempt | Self::UntrustedSource => Severity::High,
        }
    }
}

impl fmt::Display for ViolationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected designated-account transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyViolation {
    /// Violation code.
    pub code: ViolationCode,
    /// Severity of the violation.
    pub severity: Severity,
    /// Human-readable explanation.
    pub message: String,
}

impl PolicyViolation {
    fn new(code: ViolationCode, message: String) -> Self {
        Self {
            code,
            severity: code.severity(),
            message,
        }
    }

    /// Policy denials are never retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        false
    }
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.severity, self.message)
    }
}

/// Input to [`evaluate_designated_account_policy`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DesignatedAccountPolicyInput<'a> {
    /// Transfer amount in dollars.
    pub amount: f64,
    /// Declared origin of the funds.
    pub source: &'a str,
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyEvaluation {
    /// All rules passed; carries the normalized source.
    Allowed(TransferSource),
    /// A rule failed; the transfer must be rejected.
    Denied(PolicyViolation),
}

impl PolicyEvaluation {
    /// Returns `true` if the transfer may proceed.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }

    /// Returns the violation, if any.
    #[must_use]
    pub const fn violation(&self) -> Option<&PolicyViolation> {
        match self {
            Self::Allowed(_) => None,
            Self::Denied(v) => Some(v),
        }
    }

    /// Converts the evaluation into a `Result`.
    ///
    /// # Errors
    ///
    /// Returns the violation when the transfer was denied.
    pub fn into_result(self) -> Result<TransferSource, PolicyViolation> {
        match self {
            Self::Allowed(source) => Ok(source),
            Self::Denied(v) => Err(v),
        }
    }
}

/// Evaluates a designated-account credit against the deposit-only rules.
#[must_use]
pub fn evaluate_designated_account_policy(
    input: DesignatedAccountPolicyInput<'_>,
) -> PolicyEvaluation {
    if !input.amount.is_finite() {
        return PolicyEvaluation::Denied(PolicyViolation::new(
            ViolationCode::InvalidAmount,
            "Designated account transfers require a finite amount".to_string(),
        ));
    }

    if input.amount <= 0.0 {
        return PolicyEvaluation::Denied(PolicyViolation::new(
            ViolationCode::WithdrawalAttempt,
            format!(
                "Designated accounts are deposit-only; transfer of {} rejected",
                input.amount
            ),
        ));
    }

    let Some(source) = normalize_transfer_source(input.source) else {
        return PolicyEvaluation::Denied(PolicyViolation::new(
            ViolationCode::UntrustedSource,
            format!(
                "Designated account funding source '{}' is not whitelisted",
                input.source
            ),
        ));
    };

    PolicyEvaluation::Allowed(source)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn eval(amount: f64, source: &str) -> PolicyEvaluation {
        evaluate_designated_account_policy(DesignatedAccountPolicyInput { amount, source })
    }

    fn code_of(evaluation: &PolicyEvaluation) -> Option<ViolationCode> {
        evaluation.violation().map(|v| v.code)
    }

    #[test]
    fn test_allows_positive_amount_from_trusted_source() {
        for source in TransferSource::ALL {
            assert_eq!(
                eval(100.0, source.as_str()),
                PolicyEvaluation::Allowed(source)
            );
        }
        assert_eq!(
            eval(0.01, " bas_escrow").into_result(),
            Ok(TransferSource::BasEscrow)
        );
    }

    #[test]
    fn test_source_matching_ignores_case_and_whitespace() {
        assert_eq!(
            normalize_transfer_source("  payroll_capture "),
            Some(TransferSource::PayrollCapture)
        );
        assert_eq!(
            normalize_transfer_source("Gst_Capture"),
            Some(TransferSource::GstCapture)
        );
        assert_eq!(normalize_transfer_source("PAYROLL"), None);
        assert_eq!(normalize_transfer_source(""), None);
    }

    #[test]
    fn test_non_finite_amount_is_medium_severity() {
        for amount in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let evaluation = eval(amount, "PAYROLL_CAPTURE");
            let violation = evaluation.violation().expect("must be denied");
            assert_eq!(violation.code, ViolationCode::InvalidAmount);
            assert_eq!(violation.severity, Severity::Medium);
        }
    }

    #[test]
    fn test_rules_are_checked_in_order() {
        // Non-finite beats untrusted source.
        assert_eq!(
            code_of(&eval(f64::NAN, "ATM")),
            Some(ViolationCode::InvalidAmount)
        );
        // Withdrawal beats untrusted source.
        assert_eq!(
            code_of(&eval(-5.0, "ATM")),
            Some(ViolationCode::WithdrawalAttempt)
        );
    }

    #[test]
    fn test_zero_and_negative_zero_are_withdrawals() {
        assert_eq!(
            code_of(&eval(0.0, "BAS_ESCROW")),
            Some(ViolationCode::WithdrawalAttempt)
        );
        assert_eq!(
            code_of(&eval(-0.0, "BAS_ESCROW")),
            Some(ViolationCode::WithdrawalAttempt)
        );
    }

    #[test]
    fn test_denials_are_not_retryable() {
        let violation = eval(-1.0, "GST_CAPTURE").into_result().unwrap_err();
        assert!(!violation.is_retryable());
        assert_eq!(violation.severity, Severity::High);
    }

    #[test]
    fn test_codes_serialize_to_wire_names() {
        let json = serde_json::to_string(&ViolationCode::UntrustedSource).unwrap();
        assert_eq!(json, "\"designated_untrusted_source\"");
        let json = serde_json::to_string(&Severity::High).unwrap();
        assert_eq!(json, "\"HIGH\"");
    }

    proptest! {
        #[test]
        fn test_prop_non_positive_amounts_are_withdrawal_attempts(
            amount in prop_oneof![Just(0.0f64), (-1.0e12f64..0.0)],
            source in prop::sample::select(
                vec!["PAYROLL_CAPTURE", "GST_CAPTURE", "BAS_ESCROW", "ATM", ""],
            ),
        ) {
            let evaluation = eval(amount, source);
            prop_assert!(!evaluation.is_allowed());
            prop_assert_eq!(code_of(&evaluation), Some(ViolationCode::WithdrawalAttempt));
        }

        #[test]
        fn test_prop_unlisted_sources_are_untrusted(
            amount in 0.01f64..1.0e9,
            source in "[A-Za-z_ ]{0,24}",
        ) {
            prop_assume!(normalize_transfer_source(&source).is_none());
            let evaluation = eval(amount, &source);
            prop_assert_eq!(code_of(&evaluation), Some(ViolationCode::UntrustedSource));
        }
    }
}
