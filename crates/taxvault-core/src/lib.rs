#![allow(clippy::doc_markdown)]

//! taxvault-core - designated-account ledger
//!
//! Designated accounts hold PAYGW and GST on behalf of the tax office and
//! may only ever receive deposits. This crate enforces that rule and keeps
//! an auditable double-entry record of every credit.
//!
//! # Modules
//!
//! - [`policy`]: pure deposit-only policy for designated-account transfers
//! - [`ledger`]: balanced, idempotent, hash-chained journals on `SQLite`
//! - [`designated`]: accounts, credits, coverage checks, and lock lifecycle
//! - [`ingest`]: payroll and POS contributions awaiting transfer
//! - [`reconcile`]: ledger-vs-recorded reconciliation and its scheduler
//! - [`evidence`]: SHA-256 addressed evidence artifacts
//! - [`audit`]: audit sinks, including a hash-chained `SQLite` log
//! - [`alerts`]: operational alerts
//! - [`money`]: integer cents with deterministic rounding
//! - [`config`]: TOML configuration

pub mod alerts;
pub mod audit;
pub mod config;
pub mod designated;
pub mod evidence;
pub mod ingest;
pub mod ledger;
pub mod money;
pub mod policy;
pub mod reconcile;
