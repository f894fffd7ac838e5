//! Transfer policies for designated (tax-holding) accounts.
//!
//! Designated accounts hold PAYGW and GST funds on behalf of the ATO and are
//! deposit-only. Every credit is screened by
//! [`evaluate_designated_account_policy`] before it reaches storage. The
//! evaluation is pure: no I/O, no clock, no configuration.

mod designated;

pub use designated::{
    DesignatedAccountPolicyInput, PolicyEvaluation, PolicyViolation, Severity, TransferSource,
    ViolationCode, evaluate_designated_account_policy, normalize_transfer_source,
};
