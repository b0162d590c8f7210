//! Step definitions, the per-step execution context, and step outcomes.

use crate::command::{CommandResult, CommandRunner, CommandSpec, RetryPolicy};
use crate::error::StepError;
use crate::facts::Facts;
use crate::health::HealthChecker;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Body or undo action of a step.
pub type StepFn = Box<dyn FnMut(&mut StepContext<'_>) -> Result<(), StepError>>;

// ---------------------------------------------------------------------------
// RunContext
// ---------------------------------------------------------------------------

/// Run-scoped flags and facts. Built once, then only read.
#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    pub dry_run: bool,
    pub force_rerun: bool,
    pub cleanup_on_error: bool,
    pub facts: Facts,
}

impl RunContext {
    pub fn new(facts: Facts) -> Self {
        Self {
            dry_run: false,
            force_rerun: false,
            cleanup_on_error: true,
            facts,
        }
    }

    pub fn dry_run(mut self, yes: bool) -> Self {
        self.dry_run = yes;
        self
    }

    pub fn force_rerun(mut self, yes: bool) -> Self {
        self.force_rerun = yes;
        self
    }

    pub fn cleanup_on_error(mut self, yes: bool) -> Self {
        self.cleanup_on_error = yes;
        self
    }
}

// ---------------------------------------------------------------------------
// Requirements / Ownership
// ---------------------------------------------------------------------------

/// Host preconditions a step needs. Unmet requirements skip the step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Requirements {
    #[serde(default)]
    pub gpu: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_memory_mb: Option<u64>,
}

impl Requirements {
    pub fn is_empty(&self) -> bool {
        !self.gpu && self.min_memory_mb.is_none()
    }

    /// Describe the first unmet requirement, if any.
    pub fn unmet(&self, facts: &Facts) -> Option<String> {
        if self.gpu && !facts.gpu {
            return Some("requires a GPU".to_string());
        }
        match self.min_memory_mb {
            Some(min) if facts.memory_mb < min => Some(format!(
                "requires {min} MiB of memory, host has {}",
                facts.memory_mb
            )),
            _ => None,
        }
    }
}

/// Owner applied to files and directories a step creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Ownership {
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl std::fmt::Display for Ownership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.group {
            Some(g) => write!(f, "{}:{}", self.user, g),
            None => f.write_str(&self.user),
        }
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

pub struct Step {
    pub id: String,
    pub description: Option<String>,
    pub depends_on: Vec<String>,
    pub idempotent: bool,
    pub category: Option<String>,
    /// False for read-only steps; those never trigger a backup snapshot.
    pub mutates: bool,
    pub requirements: Requirements,
    pub(crate) body: StepFn,
    pub(crate) undo: Option<StepFn>,
}

impl Step {
    pub fn new<F>(id: impl Into<String>, body: F) -> Self
    where
        F: FnMut(&mut StepContext<'_>) -> Result<(), StepError> + 'static,
    {
        Self {
            id: id.into(),
            description: None,
            depends_on: Vec::new(),
            idempotent: true,
            category: None,
            mutates: true,
            requirements: Requirements::default(),
            body: Box::new(body),
            undo: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for id in ids {
            let id = id.into();
            if !self.depends_on.contains(&id) {
                self.depends_on.push(id);
            }
        }
        self
    }

    pub fn idempotent(mut self, yes: bool) -> Self {
        self.idempotent = yes;
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn read_only(mut self) -> Self {
        self.mutates = false;
        self
    }

    pub fn requires(mut self, requirements: Requirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_undo<F>(mut self, undo: F) -> Self
    where
        F: FnMut(&mut StepContext<'_>) -> Result<(), StepError> + 'static,
    {
        self.undo = Some(Box::new(undo));
        self
    }

    pub fn has_undo(&self) -> bool {
        self.undo.is_some()
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("depends_on", &self.depends_on)
            .field("idempotent", &self.idempotent)
            .field("category", &self.category)
            .field("mutates", &self.mutates)
            .field("requirements", &self.requirements)
            .field("has_undo", &self.has_undo())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// StepContext
// ---------------------------------------------------------------------------

/// What a step body can reach while it runs.
pub struct StepContext<'a> {
    pub step_id: &'a str,
    pub run: &'a RunContext,
    pub commands: &'a mut CommandRunner,
    pub health: &'a HealthChecker,
}

impl StepContext<'_> {
    /// Run a command and turn an unsuccessful final result into a `StepError`.
    pub fn run_command(
        &mut self,
        spec: &CommandSpec,
        timeout: Option<Duration>,
        policy: &RetryPolicy,
    ) -> Result<CommandResult, StepError> {
        let result = self.commands.execute(spec, timeout, policy);
        if result.success() {
            return Ok(result);
        }
        if result.interrupted {
            return Err(StepError::Interrupted);
        }
        if result.timed_out {
            return Err(StepError::Timeout {
                command: result.command,
                attempts: result.attempts,
            });
        }
        Err(StepError::Command {
            command: result.command,
            exit_code: result.exit_code,
            attempts: result.attempts,
            stderr: result.stderr,
        })
    }

    /// Wait for `probe` to report ready; `target` names it in the error.
    pub fn wait_ready<P>(
        &self,
        target: &str,
        probe: P,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<(), StepError>
    where
        P: FnMut() -> bool,
    {
        if self.health.wait_until_ready(probe, timeout, poll_interval) {
            return Ok(());
        }
        if self.health.interrupted() {
            return Err(StepError::Interrupted);
        }
        Err(StepError::NotReady {
            target: target.to_string(),
            waited_secs: timeout.as_secs(),
        })
    }
}

// ---------------------------------------------------------------------------
// StepOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Success => f.write_str("success"),
            StepStatus::Failed => f.write_str("failed"),
            StepStatus::Skipped => f.write_str("skipped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyDone,
    RequirementUnmet { detail: String },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::AlreadyDone => f.write_str("already done"),
            SkipReason::RequirementUnmet { detail } => f.write_str(detail),
        }
    }
}

/// Result of one step execution attempt. `error_detail` is set iff Failed,
/// `skip_reason` iff Skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_id: String,
    pub status: StepStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
}

impl StepOutcome {
    pub fn success(step_id: &str, duration_ms: u64) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Success,
            duration_ms,
            error_detail: None,
            skip_reason: None,
        }
    }

    pub fn failed(step_id: &str, duration_ms: u64, detail: impl Into<String>) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Failed,
            duration_ms,
            error_detail: Some(detail.into()),
            skip_reason: None,
        }
    }

    pub fn skipped(step_id: &str, reason: SkipReason) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Skipped,
            duration_ms: 0,
            error_detail: None,
            skip_reason: Some(reason),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
