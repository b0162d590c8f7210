use crate::output::{print_json, print_table};
use anyhow::Context;
use provision_core::{
    backup::BackupManager,
    config::{Config, WarnLevel},
    facts::Facts,
    ledger::StateLedger,
    orchestrator::Orchestrator,
    paths,
    report::{RunReport, RunStatus},
    step::{RunContext, StepStatus},
};
use std::path::Path;

// ---------------------------------------------------------------------------
// RunExit: typed non-zero exit codes, mapped to process exit in main
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum RunExit {
    InvalidPlan(String),
    Failed { step: String },
    Interrupted,
    DryRun,
}

impl RunExit {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunExit::Failed { .. } => 1,
            RunExit::InvalidPlan(_) => 2,
            RunExit::DryRun => 3,
            RunExit::Interrupted => 130,
        }
    }

    /// Dry runs always end aborted; they print no error line.
    pub fn is_error(&self) -> bool {
        !matches!(self, RunExit::DryRun)
    }
}

impl std::fmt::Display for RunExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunExit::InvalidPlan(msg) => write!(f, "invalid plan: {msg}"),
            RunExit::Failed { step } => write!(f, "step '{step}' failed"),
            RunExit::Interrupted => f.write_str("interrupted"),
            RunExit::DryRun => f.write_str("dry run; nothing executed"),
        }
    }
}

impl std::error::Error for RunExit {}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

pub struct RunFlags {
    pub dry_run: bool,
    pub force: bool,
    pub no_cleanup_on_error: bool,
    pub category: Option<String>,
}

pub fn run(root: &Path, plan_name: &str, flags: RunFlags, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let warnings = config.validate();
    for w in &warnings {
        tracing::warn!("config: {}", w.message);
    }
    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config validation found errors");
    }

    let file = super::load_plan_file(root, plan_name)?;
    let plan = super::build_plan(file, &config, root, flags.category.as_deref())?;

    let ledger_path = paths::ledger_path(root);
    let mut ledger = StateLedger::load(&ledger_path).context("failed to load ledger")?;

    let facts = if flags.dry_run {
        Facts::default()
    } else {
        Facts::gather()
    };
    let ctx = RunContext::new(facts)
        .dry_run(flags.dry_run)
        .force_rerun(flags.force)
        .cleanup_on_error(config.cleanup_on_error && !flags.no_cleanup_on_error);

    let interrupt = crate::signal::interrupt_flag()?;
    let mut orchestrator = Orchestrator::with_interrupt(interrupt).with_checkpoint(&ledger_path);
    if config.backup.enabled {
        orchestrator =
            orchestrator.with_backups(BackupManager::new(config.backup.resolved_dir(root)));
    }

    let report = orchestrator.run(plan, &ctx, &mut ledger);

    if !report.dry_run {
        ledger.save(&ledger_path).context("failed to save ledger")?;
        report.save(root).context("failed to save run report")?;
    }

    if json {
        print_json(&report)?;
    } else {
        print_report(&report, root);
    }

    match report.status {
        RunStatus::Completed => Ok(()),
        RunStatus::Aborted => Err(RunExit::DryRun.into()),
        RunStatus::Failed if report.interrupted => Err(RunExit::Interrupted.into()),
        RunStatus::Failed => {
            let step = report
                .failed_step()
                .map(|o| o.step_id.clone())
                .unwrap_or_default();
            Err(RunExit::Failed { step }.into())
        }
    }
}

fn print_report(report: &RunReport, root: &Path) {
    if report.dry_run {
        println!(
            "Dry run of '{}': {} step(s) would run in this order:",
            report.plan,
            report.planned.len()
        );
        for (i, id) in report.planned.iter().enumerate() {
            println!("  {:>2}. {id}", i + 1);
        }
        return;
    }

    let rows = report
        .outcomes
        .iter()
        .map(|o| {
            let detail = match o.status {
                StepStatus::Failed => o.error_detail.clone().unwrap_or_default(),
                StepStatus::Skipped => o
                    .skip_reason
                    .as_ref()
                    .map(|r| r.to_string())
                    .unwrap_or_default(),
                StepStatus::Success => String::new(),
            };
            vec![
                o.step_id.clone(),
                o.status.to_string(),
                format!("{}ms", o.duration_ms),
                detail,
            ]
        })
        .collect();
    print_table(&["STEP", "STATUS", "DURATION", "DETAIL"], rows);

    let never = report.never_attempted();
    if !never.is_empty() {
        println!("\nNot attempted: {}", never.join(", "));
    }
    if !report.rolled_back.is_empty() {
        println!("Rolled back:   {}", report.rolled_back.join(", "));
    }
    if let Some(id) = &report.backup {
        let state = if report.restored_backup {
            "restored"
        } else {
            "kept"
        };
        println!("Backup:        {id} ({state})");
    }
    for e in &report.rollback_errors {
        println!("Rollback error: {e}");
    }

    let report_path = paths::run_report_path(root, &report.run_id);
    println!(
        "\nRun {}: {} ({} succeeded, {} skipped, {} failed)",
        report.status,
        report_path.strip_prefix(root).unwrap_or(report_path.as_path()).display(),
        report.count(StepStatus::Success),
        report.count(StepStatus::Skipped),
        report.count(StepStatus::Failed),
    );
}
