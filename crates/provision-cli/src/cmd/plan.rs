use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use provision_core::{
    config::{Config, WarnLevel},
    ledger::StateLedger,
    paths,
};
use std::path::Path;

#[derive(Subcommand)]
pub enum PlanSubcommand {
    /// Print the execution order of a plan
    Show {
        plan: String,
        /// Restrict to one category (plus dependencies)
        #[arg(long)]
        category: Option<String>,
    },

    /// Check a plan and the config for errors without running anything
    Validate { plan: String },
}

pub fn run(root: &Path, subcmd: PlanSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        PlanSubcommand::Show { plan, category } => show(root, &plan, category.as_deref(), json),
        PlanSubcommand::Validate { plan } => validate(root, &plan, json),
    }
}

// ---------------------------------------------------------------------------
// show
// ---------------------------------------------------------------------------

fn show(root: &Path, name: &str, category: Option<&str>, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let file = super::load_plan_file(root, name)?;
    let defs = file.steps.clone();
    let plan = super::build_plan(file, &config, root, category)?;
    let ledger =
        StateLedger::load(&paths::ledger_path(root)).context("failed to load ledger")?;

    if json {
        let steps: Vec<serde_json::Value> = plan
            .steps()
            .iter()
            .map(|s| {
                serde_json::json!({
                    "id": s.id,
                    "description": s.description,
                    "category": s.category,
                    "depends_on": s.depends_on,
                    "idempotent": s.idempotent,
                    "has_undo": s.has_undo(),
                    "done": ledger.is_done(&s.id),
                })
            })
            .collect();
        return print_json(&serde_json::json!({
            "plan": plan.name(),
            "backup_paths": plan.backup_paths(),
            "steps": steps,
        }));
    }

    let rows = plan
        .steps()
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let action = s.description.clone().unwrap_or_else(|| {
                defs.iter()
                    .find(|d| d.id == s.id)
                    .map(|d| d.action.summary())
                    .unwrap_or_default()
            });
            vec![
                (i + 1).to_string(),
                s.id.clone(),
                s.category.clone().unwrap_or_else(|| "-".to_string()),
                if ledger.is_done(&s.id) { "yes" } else { "" }.to_string(),
                action,
            ]
        })
        .collect();
    print_table(&["#", "STEP", "CATEGORY", "DONE", "DESCRIPTION"], rows);
    Ok(())
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn validate(root: &Path, name: &str, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let warnings = config.validate();
    let file = super::load_plan_file(root, name)?;
    let checks = file.checks.len();
    let plan = super::build_plan(file, &config, root, None)?;

    if json {
        print_json(&serde_json::json!({
            "plan": plan.name(),
            "steps": plan.len(),
            "checks": checks,
            "categories": plan.categories(),
            "warnings": warnings,
        }))?;
    } else {
        println!(
            "Plan '{}' is valid: {} step(s), {} check(s).",
            plan.name(),
            plan.len(),
            checks
        );
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}
