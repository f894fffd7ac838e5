//! CLI command implementations.
//!
//! Every command returns an exit code: [`exit_codes::SUCCESS`], or
//! [`exit_codes::REJECTED`] when the ledger refused the request (policy
//! denial, locked account, shortfall, broken chain). Other failures surface
//! as errors and exit with 1 via `anyhow`.

use anyhow::{Context as _, Result};
use serde::Serialize;
use taxvault_core::config::TaxvaultConfig;
use taxvault_core::designated::DesignatedError;
use taxvault_core::ledger::LedgerStore;

pub mod account;
pub mod contribution;
pub mod journal;
pub mod policy;
pub mod reconcile;

/// Exit codes for taxvault commands.
pub mod exit_codes {
    /// Success exit code.
    pub const SUCCESS: u8 = 0;
    /// The request was understood but refused.
    pub const REJECTED: u8 = 2;
}

/// Shared state for a single CLI invocation.
#[derive(Debug)]
pub struct Context {
    pub config: TaxvaultConfig,
    pub json: bool,
}

impl Context {
    pub const fn new(config: TaxvaultConfig, json: bool) -> Self {
        Self { config, json }
    }

    /// Opens the configured database.
    pub fn open_store(&self) -> Result<LedgerStore> {
        self.config.database.open().with_context(|| {
            format!(
                "failed to open database {}",
                self.config.database.path.display()
            )
        })
    }

    /// Prints `value` as pretty JSON, or the text rendering otherwise.
    pub fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce(&T) -> String) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{}", text(value));
        }
        Ok(())
    }

    /// Reports a refusal with its machine-readable code.
    pub fn reject(&self, code: &str, message: &str) -> Result<u8> {
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "error": code,
                    "message": message,
                }))?
            );
        } else {
            eprintln!("rejected: {code}: {message}");
        }
        Ok(exit_codes::REJECTED)
    }

    /// Emits a designated-account result. Refusals exit with
    /// [`exit_codes::REJECTED`]; storage failures are errors.
    pub fn settle<T: Serialize>(
        &self,
        result: Result<T, DesignatedError>,
        text: impl FnOnce(&T) -> String,
    ) -> Result<u8> {
        match result {
            Ok(value) => {
                self.emit(&value, text)?;
                Ok(exit_codes::SUCCESS)
            },
            Err(e) if e.code() != "internal_error" => self.reject(e.code(), &e.to_string()),
            Err(e) => Err(e.into()),
        }
    }
}

/// `taxvault init`
pub fn init(ctx: &Context) -> Result<u8> {
    let store = ctx.open_store()?;
    let wal = store.verify_wal_mode()?;
    let stats = store.stats()?;
    ctx.emit(
        &serde_json::json!({
            "database": ctx.config.database.path,
            "wal": wal,
            "journals": stats.journal_count,
        }),
        |_| {
            format!(
                "initialised {} (wal: {wal}, journals: {})",
                ctx.config.database.path.display(),
                stats.journal_count
            )
        },
    )?;
    Ok(exit_codes::SUCCESS)
}
