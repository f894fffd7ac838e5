//! Designated account commands.
//!
//! - `account open` creates (or returns) the org's PAYGW or GST buffer
//! - `account transfer` credits an account through the deposit-only policy
//! - `account coverage` checks the balance against an obligation and locks
//!   the account on shortfall
//! - `account unlock` / `account close` move the account through its
//!   lifecycle
//! - `account list`, `account history`, `account alerts` and
//!   `account flags` read state back

use anyhow::{Context as _, Result};
use clap::{Args, Subcommand, ValueEnum};
use taxvault_core::designated::{
    AccountKind, AccountSnapshot, DesignatedAccount, DesignatedAccounts, TransferRequest,
};
use taxvault_core::money::Cents;

use super::{Context, exit_codes};

/// Account kind as written on the command line.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindArg {
    /// PAYGW buffer
    Paygw,
    /// GST buffer
    Gst,
}

impl From<KindArg> for AccountKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Paygw => Self::PaygwBuffer,
            KindArg::Gst => Self::GstBuffer,
        }
    }
}

/// Account command group.
#[derive(Debug, Args)]
pub struct AccountCommand {
    #[command(subcommand)]
    pub subcommand: AccountSubcommand,
}

/// Account subcommands.
#[derive(Debug, Subcommand)]
pub enum AccountSubcommand {
    /// Open a designated account (idempotent).
    Open {
        #[arg(long)]
        org: String,

        #[arg(long, value_enum)]
        kind: KindArg,

        #[arg(long, default_value = "cli")]
        actor: String,
    },

    /// Credit a designated account.
    Transfer {
        #[arg(long)]
        org: String,

        /// Account identifier
        #[arg(long)]
        account: String,

        /// Amount in dollars
        #[arg(long, allow_hyphen_values = true)]
        amount: f64,

        /// Declared funding source (PAYROLL_CAPTURE, GST_CAPTURE, BAS_ESCROW)
        #[arg(long)]
        source: String,

        #[arg(long, default_value = "cli")]
        actor: String,
    },

    /// Check that an account covers an obligation.
    Coverage {
        #[arg(long)]
        org: String,

        #[arg(long, value_enum)]
        kind: KindArg,

        /// Required amount in dollars (e.g. 1250.00)
        #[arg(long)]
        required: String,

        #[arg(long, default_value = "cli")]
        actor: String,
    },

    /// Return a locked or investigated account to ACTIVE.
    Unlock {
        #[arg(long)]
        org: String,

        #[arg(long)]
        account: String,

        #[arg(long)]
        reason: String,

        #[arg(long, default_value = "cli")]
        actor: String,
    },

    /// Close an account permanently.
    Close {
        #[arg(long)]
        org: String,

        #[arg(long)]
        account: String,

        #[arg(long)]
        reason: String,

        #[arg(long, default_value = "cli")]
        actor: String,
    },

    /// List the org's accounts with their states.
    List {
        #[arg(long)]
        org: String,
    },

    /// Show an account's state history.
    History {
        #[arg(long)]
        org: String,

        #[arg(long)]
        account: String,
    },

    /// List open alerts.
    Alerts {
        #[arg(long)]
        org: String,
    },

    /// Resolve an alert.
    ResolveAlert {
        #[arg(long)]
        org: String,

        #[arg(long)]
        id: u64,
    },

    /// List open violation flags.
    Flags {
        #[arg(long)]
        org: String,
    },
}

pub fn run(ctx: &Context, cmd: &AccountCommand) -> Result<u8> {
    let accounts = DesignatedAccounts::with_sqlite_audit(ctx.open_store()?);

    match &cmd.subcommand {
        AccountSubcommand::Open { org, kind, actor } => ctx.settle(
            accounts.open_account(org, (*kind).into(), actor),
            |a| format!("{} {} ({})", a.kind, a.id, Cents::new(a.balance_cents)),
        ),
        AccountSubcommand::Transfer {
            org,
            account,
            amount,
            source,
            actor,
        } => {
            let request = TransferRequest {
                org_id: org.clone(),
                account_id: account.clone(),
                amount: *amount,
                source: source.clone(),
                actor_id: actor.clone(),
            };
            ctx.settle(accounts.apply_transfer(&request), |r| {
                format!(
                    "credited {} to {} from {} (balance {}, journal #{})",
                    Cents::new(r.amount_cents),
                    r.account_id,
                    r.source,
                    Cents::new(r.new_balance_cents),
                    r.journal_seq
                )
            })
        },
        AccountSubcommand::Coverage {
            org,
            kind,
            required,
            actor,
        } => {
            let required = Cents::parse_dollars(required)
                .with_context(|| format!("invalid amount {required}"))?;
            ctx.settle(
                accounts.ensure_coverage(org, (*kind).into(), required.get(), actor),
                |s| {
                    format!(
                        "{} covers {required} (balance {})",
                        s.account.kind,
                        Cents::new(s.account.balance_cents)
                    )
                },
            )
        },
        AccountSubcommand::Unlock {
            org,
            account,
            reason,
            actor,
        } => ctx.settle(accounts.release_lock(org, account, actor, reason), snapshot_line),
        AccountSubcommand::Close {
            org,
            account,
            reason,
            actor,
        } => ctx.settle(accounts.close_account(org, account, actor, reason), snapshot_line),
        AccountSubcommand::List { org } => {
            let listed = accounts.list_accounts(org)?;
            let mut snapshots = Vec::with_capacity(listed.len());
            for account in listed {
                let state = accounts.current_state(org, &account.id)?;
                snapshots.push(AccountSnapshot { account, state });
            }
            ctx.emit(&snapshots, |s| {
                s.iter().map(snapshot_line).collect::<Vec<_>>().join("\n")
            })?;
            Ok(exit_codes::SUCCESS)
        },
        AccountSubcommand::History { org, account } => {
            ctx.settle(accounts.transitions(org, account), |history| {
                history
                    .iter()
                    .map(|t| {
                        let from = t.from.map_or_else(|| "-".to_string(), |s| s.to_string());
                        format!(
                            "{} {from} -> {} by {}: {}",
                            t.created_at.to_rfc3339(),
                            t.to,
                            t.actor_id,
                            t.reason
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        },
        AccountSubcommand::Alerts { org } => {
            let alerts = accounts.open_alerts(org)?;
            ctx.emit(&alerts, |alerts| {
                alerts
                    .iter()
                    .map(|a| format!("#{} [{}] {}: {}", a.id, a.severity, a.alert_type, a.message))
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
            Ok(exit_codes::SUCCESS)
        },
        AccountSubcommand::ResolveAlert { org, id } => {
            if accounts.resolve_alert(org, *id)? {
                ctx.emit(&serde_json::json!({ "resolved": id }), |_| {
                    format!("resolved alert #{id}")
                })?;
                Ok(exit_codes::SUCCESS)
            } else {
                ctx.reject("alert_not_open", &format!("alert #{id} is not open"))
            }
        },
        AccountSubcommand::Flags { org } => {
            let flags = accounts.open_violation_flags(org)?;
            ctx.emit(&flags, |flags| {
                flags
                    .iter()
                    .map(|f| {
                        format!(
                            "#{} [{}] {} {}",
                            f.id,
                            f.severity,
                            f.code,
                            f.account_id.as_deref().unwrap_or("-")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
            Ok(exit_codes::SUCCESS)
        },
    }
}

fn snapshot_line(snapshot: &AccountSnapshot) -> String {
    let DesignatedAccount {
        id,
        kind,
        balance_cents,
        ..
    } = &snapshot.account;
    format!(
        "{kind} {id} {} {}",
        snapshot.state,
        Cents::new(*balance_cents)
    )
}
