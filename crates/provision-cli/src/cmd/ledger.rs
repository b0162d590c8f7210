use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use provision_core::{ledger::StateLedger, paths};
use std::path::Path;

#[derive(Subcommand)]
pub enum LedgerSubcommand {
    /// List steps recorded as done
    Show,

    /// Forget one step (or every step) so the next run executes it again
    Reset {
        /// Step id; omit to clear the whole ledger
        step: Option<String>,
    },
}

pub fn run(root: &Path, subcmd: LedgerSubcommand, json: bool) -> anyhow::Result<()> {
    let path = paths::ledger_path(root);
    let mut ledger = StateLedger::load(&path).context("failed to load ledger")?;

    match subcmd {
        LedgerSubcommand::Show => {
            if json {
                return print_json(&ledger.entries());
            }
            if ledger.is_empty() {
                println!("No completed steps recorded.");
                return Ok(());
            }
            let rows = ledger
                .entries()
                .iter()
                .map(|e| {
                    vec![
                        e.step_id.clone(),
                        e.completed_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                    ]
                })
                .collect();
            print_table(&["STEP", "COMPLETED"], rows);
        }
        LedgerSubcommand::Reset { step: Some(step) } => {
            if !ledger.unmark(&step) {
                anyhow::bail!("step '{step}' is not in the ledger");
            }
            ledger.save(&path).context("failed to save ledger")?;
            println!("Reset: {step}");
        }
        LedgerSubcommand::Reset { step: None } => {
            let n = ledger.entries().len();
            ledger.clear();
            ledger.save(&path).context("failed to save ledger")?;
            println!("Cleared {n} step(s) from the ledger.");
        }
    }
    Ok(())
}
