//! Drives a plan: skip-or-run each step, checkpoint the ledger, and unwind
//! on failure.
//!
//! Rollback is an explicit stack: the indices of steps that succeeded in this
//! run, undone in reverse, followed by a backup restore. It runs on the first
//! failed step and on interrupt, and only when `cleanup_on_error` is set.

use crate::backup::{BackupManager, BackupRecord};
use crate::command::CommandRunner;
use crate::error::StepError;
use crate::health::HealthChecker;
use crate::ledger::StateLedger;
use crate::plan::Plan;
use crate::report::{RunReport, RunStatus};
use crate::step::{RunContext, SkipReason, StepContext, StepOutcome};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub struct Orchestrator {
    commands: CommandRunner,
    health: HealthChecker,
    backups: Option<BackupManager>,
    checkpoint: Option<PathBuf>,
    interrupt: Arc<AtomicBool>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::with_interrupt(Arc::new(AtomicBool::new(false)))
    }

    /// Share `flag` with signal handlers; setting it interrupts the run.
    pub fn with_interrupt(flag: Arc<AtomicBool>) -> Self {
        Self {
            commands: CommandRunner::new().with_interrupt(flag.clone()),
            health: HealthChecker::new().with_interrupt(flag.clone()),
            backups: None,
            checkpoint: None,
            interrupt: flag,
        }
    }

    pub fn with_backups(mut self, manager: BackupManager) -> Self {
        self.backups = Some(manager);
        self
    }

    /// Persist the ledger to `path` after every change.
    pub fn with_checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint = Some(path.into());
        self
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    fn checkpoint(&self, ledger: &StateLedger) {
        if let Some(path) = &self.checkpoint {
            if let Err(e) = ledger.save(path) {
                tracing::warn!(ledger = %path.display(), error = %e, "failed to checkpoint ledger");
            }
        }
    }

    /// Execute `plan`. Step failures are captured in the report; this never
    /// fails once the plan has been built.
    pub fn run(&mut self, mut plan: Plan, ctx: &RunContext, ledger: &mut StateLedger) -> RunReport {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let planned: Vec<String> = plan.order().into_iter().map(String::from).collect();

        let mut report = RunReport {
            run_id,
            plan: plan.name().to_string(),
            status: RunStatus::Completed,
            dry_run: ctx.dry_run,
            planned,
            outcomes: Vec::new(),
            rolled_back: Vec::new(),
            rollback_errors: Vec::new(),
            backup: None,
            restored_backup: false,
            interrupted: false,
            audit: Vec::new(),
            started_at,
            finished_at: started_at,
        };

        if ctx.dry_run {
            tracing::info!(plan = %report.plan, steps = report.planned.len(), "dry run; nothing executed");
            report.status = RunStatus::Aborted;
            report.finished_at = Utc::now();
            return report;
        }

        tracing::info!(plan = %report.plan, run = %report.run_id, steps = report.planned.len(), "starting run");

        let backup_paths = plan.backup_paths().to_vec();
        let mut snapshot_taken = false;
        let mut backup: Option<BackupRecord> = None;
        let mut completed: Vec<usize> = Vec::new();
        let mut failed = false;

        for i in 0..plan.len() {
            let step = &mut plan.steps_mut()[i];

            if self.interrupt.load(Ordering::SeqCst) {
                tracing::warn!(step = %step.id, "interrupted before step");
                report
                    .outcomes
                    .push(StepOutcome::failed(&step.id, 0, StepError::Interrupted.to_string()));
                report.interrupted = true;
                failed = true;
                break;
            }

            if !ctx.force_rerun && step.idempotent && ledger.is_done(&step.id) {
                tracing::info!(step = %step.id, "already done; skipping");
                report
                    .outcomes
                    .push(StepOutcome::skipped(&step.id, SkipReason::AlreadyDone));
                continue;
            }

            if let Some(detail) = step.requirements.unmet(&ctx.facts) {
                tracing::info!(step = %step.id, reason = %detail, "requirement unmet; skipping");
                report
                    .outcomes
                    .push(StepOutcome::skipped(&step.id, SkipReason::RequirementUnmet { detail }));
                continue;
            }

            if step.mutates && !snapshot_taken {
                snapshot_taken = true;
                if let Some(mgr) = &self.backups {
                    if !backup_paths.is_empty() {
                        match mgr.snapshot(&backup_paths) {
                            Ok(record) => {
                                report.backup = Some(record.id.clone());
                                backup = Some(record);
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "backup snapshot failed; continuing without backup")
                            }
                        }
                    }
                }
            }

            tracing::info!(step = %step.id, "running step");
            let started = Instant::now();
            let result = {
                let mut sctx = StepContext {
                    step_id: &step.id,
                    run: ctx,
                    commands: &mut self.commands,
                    health: &self.health,
                };
                (step.body)(&mut sctx)
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(()) => {
                    tracing::info!(step = %step.id, duration_ms, "step succeeded");
                    ledger.mark_done(&step.id);
                    self.checkpoint(ledger);
                    completed.push(i);
                    report
                        .outcomes
                        .push(StepOutcome::success(&step.id, duration_ms));
                }
                Err(e) => {
                    tracing::error!(step = %step.id, duration_ms, error = %e, "step failed");
                    if matches!(e, StepError::Interrupted) || self.interrupted() {
                        report.interrupted = true;
                    }
                    report
                        .outcomes
                        .push(StepOutcome::failed(&step.id, duration_ms, e.to_string()));
                    failed = true;
                    break;
                }
            }
        }

        if failed {
            report.status = RunStatus::Failed;
            if ctx.cleanup_on_error {
                self.rollback(&mut plan, &completed, backup.as_ref(), ctx, &mut report);
            } else {
                tracing::warn!("cleanup on error disabled; leaving completed steps in place");
            }
        }

        report.audit = self.commands.take_audit();
        report.finished_at = Utc::now();
        tracing::info!(plan = %report.plan, status = %report.status, "run finished");
        report
    }

    /// Undo `completed` in reverse, then restore `backup`. Errors are logged
    /// and recorded; they never replace the original failure. The ledger is
    /// left as it was.
    fn rollback(
        &mut self,
        plan: &mut Plan,
        completed: &[usize],
        backup: Option<&BackupRecord>,
        ctx: &RunContext,
        report: &mut RunReport,
    ) {
        // Clear a pending interrupt so undo commands can run; a second signal
        // sets it again and cuts the rollback short.
        self.interrupt.store(false, Ordering::SeqCst);
        tracing::warn!(steps = completed.len(), "rolling back");

        for &i in completed.iter().rev() {
            let step = &mut plan.steps_mut()[i];
            let Some(undo) = step.undo.as_mut() else {
                tracing::debug!(step = %step.id, "no undo action");
                continue;
            };
            let result = {
                let mut sctx = StepContext {
                    step_id: &step.id,
                    run: ctx,
                    commands: &mut self.commands,
                    health: &self.health,
                };
                undo(&mut sctx)
            };
            match result {
                Ok(()) => {
                    tracing::info!(step = %step.id, "undo succeeded");
                    report.rolled_back.push(step.id.clone());
                }
                Err(e) => {
                    tracing::warn!(step = %step.id, error = %e, "undo failed");
                    report.rollback_errors.push(format!("undo {}: {e}", step.id));
                }
            }
        }

        if let (Some(mgr), Some(record)) = (&self.backups, backup) {
            match mgr.restore(record) {
                Ok(()) => report.restored_backup = true,
                Err(e) => {
                    tracing::error!(backup = %record.id, error = %e, "backup restore failed");
                    report
                        .rollback_errors
                        .push(format!("restore {}: {e}", record.id));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
