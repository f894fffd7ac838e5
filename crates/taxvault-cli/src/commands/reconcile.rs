//! `taxvault reconcile run|history|serve`
//!
//! `serve` runs the scheduler from the `[reconcile]` configuration section
//! until Ctrl-C.

use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use taxvault_core::reconcile::{ReconcileOutcome, ReconcileScheduler, Reconciler};
use tokio::sync::watch;
use tracing::info;

use super::{Context, exit_codes};

/// Reconcile command group.
#[derive(Debug, Args)]
pub struct ReconcileCommand {
    #[command(subcommand)]
    pub subcommand: ReconcileSubcommand,
}

/// Reconcile subcommands.
#[derive(Debug, Subcommand)]
pub enum ReconcileSubcommand {
    /// Reconcile one organisation now.
    Run {
        #[arg(long)]
        org: String,
    },

    /// Show recent reconciliation snapshots.
    History {
        #[arg(long)]
        org: String,

        #[arg(long, default_value = "10")]
        limit: u64,
    },

    /// Reconcile the configured organisations on an interval.
    Serve,
}

pub fn run(ctx: &Context, cmd: &ReconcileCommand) -> Result<u8> {
    let settings = &ctx.config.reconcile;
    let reconciler = Reconciler::new(ctx.open_store()?)
        .with_window(settings.movement_window())
        .with_actor(settings.actor_id.clone());

    match &cmd.subcommand {
        ReconcileSubcommand::Run { org } => {
            let outcome = reconciler.run(org)?;
            ctx.emit(&outcome, outcome_line)?;
            Ok(exit_codes::SUCCESS)
        },
        ReconcileSubcommand::History { org, limit } => {
            let snapshots = reconciler.snapshots(org, *limit)?;
            ctx.emit(&snapshots, |rows| {
                rows.iter()
                    .map(|s| {
                        format!(
                            "{} {} discrepancies={} sha256={}",
                            s.created_at.to_rfc3339(),
                            s.id,
                            s.discrepancy_count,
                            s.sha256
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
            Ok(exit_codes::SUCCESS)
        },
        ReconcileSubcommand::Serve => {
            if !settings.enabled {
                bail!("reconciliation is disabled; set [reconcile] enabled = true");
            }
            if settings.org_ids.is_empty() {
                bail!("no organisations configured in [reconcile] org_ids");
            }
            let scheduler =
                ReconcileScheduler::new(reconciler, settings.org_ids.clone(), settings.interval());

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            let passes = runtime.block_on(async move {
                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("shutdown requested");
                    }
                    let _ = shutdown_tx.send(true);
                });
                scheduler.run(shutdown_rx).await
            });

            info!(passes, "reconciliation scheduler stopped");
            Ok(exit_codes::SUCCESS)
        },
    }
}

fn outcome_line(outcome: &ReconcileOutcome) -> String {
    let report = &outcome.report;
    let mut line = format!(
        "{}: {} account(s), {} discrepancy(ies), sha256 {}",
        report.org_id,
        report.accounts.len(),
        report.discrepancy_count,
        outcome.sha256
    );
    if let Some(escalation) = &outcome.escalation {
        line.push_str(&format!(
            "\nescalated: {} (alert #{})",
            escalation.worm_uri, escalation.alert_id
        ));
    }
    line
}
