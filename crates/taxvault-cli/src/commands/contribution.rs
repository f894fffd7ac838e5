//! `taxvault contribution record|apply|list`

use anyhow::{Context as _, Result};
use clap::{Args, Subcommand, ValueEnum};
use taxvault_core::designated::DesignatedAccounts;
use taxvault_core::ingest::{
    ContributionChannel, ContributionInput, ContributionLedger, RecordOutcome,
};
use taxvault_core::money::Cents;

use super::{Context, exit_codes};

/// Contribution channel as written on the command line.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ChannelArg {
    /// Payroll withholding (credits the PAYGW buffer)
    Payroll,
    /// Point-of-sale GST (credits the GST buffer)
    Pos,
}

impl From<ChannelArg> for ContributionChannel {
    fn from(channel: ChannelArg) -> Self {
        match channel {
            ChannelArg::Payroll => Self::Payroll,
            ChannelArg::Pos => Self::Pos,
        }
    }
}

/// Contribution command group.
#[derive(Debug, Args)]
pub struct ContributionCommand {
    #[command(subcommand)]
    pub subcommand: ContributionSubcommand,
}

/// Contribution subcommands.
#[derive(Debug, Subcommand)]
pub enum ContributionSubcommand {
    /// Record a pending contribution.
    Record {
        #[arg(long)]
        org: String,

        #[arg(long, value_enum)]
        channel: ChannelArg,

        /// Amount in dollars (e.g. 4500.00)
        #[arg(long)]
        amount: String,

        /// Idempotency key; repeats are ignored
        #[arg(long)]
        key: Option<String>,

        #[arg(long)]
        actor: Option<String>,
    },

    /// Apply pending contributions to the designated accounts.
    Apply {
        #[arg(long)]
        org: String,

        #[arg(long, default_value = "cli")]
        actor: String,
    },

    /// List contributions.
    List {
        #[arg(long)]
        org: String,

        /// Only pending contributions
        #[arg(long)]
        pending: bool,
    },
}

pub fn run(ctx: &Context, cmd: &ContributionCommand) -> Result<u8> {
    let accounts = DesignatedAccounts::with_sqlite_audit(ctx.open_store()?);
    let ledger = ContributionLedger::new(accounts);

    match &cmd.subcommand {
        ContributionSubcommand::Record {
            org,
            channel,
            amount,
            key,
            actor,
        } => {
            let cents =
                Cents::parse_dollars(amount).with_context(|| format!("invalid amount {amount}"))?;
            let outcome = ledger.record(&ContributionInput {
                org_id: org.clone(),
                channel: (*channel).into(),
                amount_cents: cents.get(),
                actor_id: actor.clone(),
                payload: None,
                idempotency_key: key.clone(),
            })?;
            let duplicate = matches!(outcome, RecordOutcome::Duplicate { .. });
            ctx.emit(
                &serde_json::json!({ "id": outcome.id(), "duplicate": duplicate }),
                |_| {
                    if duplicate {
                        format!("duplicate of contribution #{}", outcome.id())
                    } else {
                        format!("recorded contribution #{} ({cents})", outcome.id())
                    }
                },
            )?;
            Ok(exit_codes::SUCCESS)
        },
        ContributionSubcommand::Apply { org, actor } => {
            let summary = ledger.apply_pending(org, actor)?;
            ctx.emit(&summary, |s| {
                format!(
                    "applied {}, rejected {}, deferred {}",
                    s.applied, s.rejected, s.deferred
                )
            })?;
            Ok(exit_codes::SUCCESS)
        },
        ContributionSubcommand::List { org, pending } => {
            let rows = if *pending {
                ledger.pending(org)?
            } else {
                ledger.all(org)?
            };
            ctx.emit(&rows, |rows| {
                rows.iter()
                    .map(|c| {
                        format!(
                            "#{} {} {} {:?}",
                            c.id,
                            c.channel.as_str(),
                            Cents::new(c.amount_cents),
                            c.status
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
            Ok(exit_codes::SUCCESS)
        },
    }
}
