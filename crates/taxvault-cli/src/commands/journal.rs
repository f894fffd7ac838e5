//! `taxvault journal` and `taxvault verify-chain`.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use clap::{Args, Subcommand};
use taxvault_core::ledger::{Journal, JournalInput, JournalWriter, LedgerError};

use super::{Context, exit_codes};

/// Journal command group.
#[derive(Debug, Args)]
pub struct JournalCommand {
    #[command(subcommand)]
    pub subcommand: JournalSubcommand,
}

/// Journal subcommands.
#[derive(Debug, Subcommand)]
pub enum JournalSubcommand {
    /// Write a journal from a JSON document (`-` reads stdin).
    ///
    /// Replaying the same `org_id` and `dedupe_id` returns the stored
    /// journal unchanged.
    Write {
        /// JSON file holding the journal
        file: PathBuf,
    },

    /// Show one journal by sequence number or dedupe key.
    Show {
        /// Organisation identifier
        #[arg(long)]
        org: String,

        /// Sequence number
        #[arg(long, conflicts_with = "dedupe")]
        seq: Option<u64>,

        /// Dedupe key
        #[arg(long)]
        dedupe: Option<String>,
    },

    /// List journals in sequence order.
    List {
        /// Organisation identifier
        #[arg(long)]
        org: String,

        /// First sequence number to include
        #[arg(long, default_value = "1")]
        from: u64,

        /// Maximum number of journals
        #[arg(long, default_value = "50")]
        limit: u64,
    },
}

pub fn run(ctx: &Context, cmd: &JournalCommand) -> Result<u8> {
    let writer = JournalWriter::new(ctx.open_store()?);

    match &cmd.subcommand {
        JournalSubcommand::Write { file } => {
            let input = read_input(file)?;
            match writer.write(&input) {
                Ok(result) => {
                    ctx.emit(&result, |r| {
                        let verb = if r.created { "created" } else { "replayed" };
                        format!("{verb} {}", summary(&r.journal))
                    })?;
                    Ok(exit_codes::SUCCESS)
                },
                Err(LedgerError::Journal(e)) => ctx.reject("journal_invalid", &e.to_string()),
                Err(e) => Err(e).context("failed to write journal"),
            }
        },
        JournalSubcommand::Show { org, seq, dedupe } => {
            let journal = match (seq, dedupe) {
                (Some(seq), _) => writer.get_by_seq(org, *seq)?,
                (None, Some(dedupe)) => writer
                    .get_by_dedupe(org, dedupe)?
                    .with_context(|| format!("no journal with dedupe key {dedupe}"))?,
                (None, None) => bail!("pass --seq or --dedupe"),
            };
            ctx.emit(&journal, render)?;
            Ok(exit_codes::SUCCESS)
        },
        JournalSubcommand::List { org, from, limit } => {
            let journals = writer.list(org, *from, *limit)?;
            ctx.emit(&journals, |js| {
                js.iter().map(summary).collect::<Vec<_>>().join("\n")
            })?;
            Ok(exit_codes::SUCCESS)
        },
    }
}

/// `taxvault verify-chain`
pub fn verify_chain(ctx: &Context, org: &str) -> Result<u8> {
    let writer = JournalWriter::new(ctx.open_store()?);
    match writer.verify_chain(org) {
        Ok(count) => {
            ctx.emit(&serde_json::json!({ "org_id": org, "verified": count }), |_| {
                format!("{org}: {count} journal(s) verified")
            })?;
            Ok(exit_codes::SUCCESS)
        },
        Err(e @ LedgerError::HashChainBroken { .. }) => {
            ctx.reject("hash_chain_broken", &e.to_string())
        },
        Err(e) => Err(e).context("failed to verify chain"),
    }
}

fn read_input(file: &Path) -> Result<JournalInput> {
    let mut content = String::new();
    if file.as_os_str() == "-" {
        std::io::stdin()
            .read_to_string(&mut content)
            .context("failed to read stdin")?;
    } else {
        content = std::fs::read_to_string(file)
            .with_context(|| format!("failed to read {}", file.display()))?;
    }
    serde_json::from_str(&content).context("invalid journal JSON")
}

fn summary(journal: &Journal) -> String {
    format!(
        "#{} {} {} ({} postings) {}",
        journal.seq,
        journal.journal_type,
        journal.dedupe_id,
        journal.postings.len(),
        &journal.hash[..12.min(journal.hash.len())]
    )
}

fn render(journal: &Journal) -> String {
    let mut out = format!(
        "seq:         {}\ntype:        {}\nsource:      {}\nevent:       {}\n\
         dedupe:      {}\noccurred_at: {}\nhash:        {}\n",
        journal.seq,
        journal.journal_type,
        journal.source,
        journal.event_id,
        journal.dedupe_id,
        journal.occurred_at.to_rfc3339(),
        journal.hash,
    );
    for posting in &journal.postings {
        out.push_str(&format!(
            "  {:<32} {:>14}\n",
            posting.account_id,
            taxvault_core::money::Cents::new(posting.amount_cents)
        ));
    }
    out.trim_end().to_string()
}
