//! `taxvault policy check`

use anyhow::Result;
use clap::{Args, Subcommand};
use taxvault_core::policy::{
    DesignatedAccountPolicyInput, PolicyEvaluation, evaluate_designated_account_policy,
};

use super::{Context, exit_codes};

/// Policy command group.
#[derive(Debug, Args)]
pub struct PolicyCommand {
    #[command(subcommand)]
    pub subcommand: PolicySubcommand,
}

/// Policy subcommands.
#[derive(Debug, Subcommand)]
pub enum PolicySubcommand {
    /// Check whether a designated-account transfer would be allowed.
    Check {
        /// Amount in dollars
        #[arg(long, allow_hyphen_values = true)]
        amount: f64,

        /// Declared funding source
        #[arg(long)]
        source: String,
    },
}

pub fn run(ctx: &Context, cmd: &PolicyCommand) -> Result<u8> {
    match &cmd.subcommand {
        PolicySubcommand::Check { amount, source } => {
            let evaluation = evaluate_designated_account_policy(DesignatedAccountPolicyInput {
                amount: *amount,
                source,
            });
            match evaluation {
                PolicyEvaluation::Allowed(source) => {
                    ctx.emit(&serde_json::json!({ "allowed": true, "source": source }), |_| {
                        format!("allowed ({source})")
                    })?;
                    Ok(exit_codes::SUCCESS)
                },
                PolicyEvaluation::Denied(violation) => {
                    ctx.reject(violation.code.as_str(), &violation.message)
                },
            }
        },
    }
}
