use crate::command::AuditEntry;
use crate::error::Result;
use crate::paths;
use crate::step::{StepOutcome, StepStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every step succeeded or was skipped.
    Completed,
    /// A step failed (or the run was interrupted); rollback ran if enabled.
    Failed,
    /// Dry run: nothing executed.
    Aborted,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Completed => f.write_str("completed"),
            RunStatus::Failed => f.write_str("failed"),
            RunStatus::Aborted => f.write_str("aborted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub plan: String,
    pub status: RunStatus,
    pub dry_run: bool,
    /// Full execution order of the plan.
    pub planned: Vec<String>,
    /// Outcomes in execution order. Planned steps missing here were never attempted.
    pub outcomes: Vec<StepOutcome>,
    /// Steps whose undo ran successfully, in the order they were undone.
    #[serde(default)]
    pub rolled_back: Vec<String>,
    #[serde(default)]
    pub rollback_errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<String>,
    #[serde(default)]
    pub restored_backup: bool,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub audit: Vec<AuditEntry>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn outcome(&self, step_id: &str) -> Option<&StepOutcome> {
        self.outcomes.iter().find(|o| o.step_id == step_id)
    }

    pub fn failed_step(&self) -> Option<&StepOutcome> {
        self.outcomes
            .iter()
            .find(|o| o.status == StepStatus::Failed)
    }

    pub fn never_attempted(&self) -> Vec<&str> {
        self.planned
            .iter()
            .filter(|id| self.outcome(id).is_none())
            .map(String::as_str)
            .collect()
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Write to `.provision/runs/<run_id>.yaml`.
    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::run_report_path(root, &self.run_id);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())?;
        Ok(())
    }
}
