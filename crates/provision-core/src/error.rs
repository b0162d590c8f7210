use std::path::PathBuf;
use thiserror::Error;

/// A malformed step graph. Always raised before any step executes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("invalid step id '{0}': must be lowercase alphanumeric with '-' or '_'")]
    InvalidStepId(String),

    #[error("duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    MissingDependency { step: String, dependency: String },

    #[error("step '{0}' depends on itself")]
    SelfDependency(String),

    #[error("dependency cycle among steps: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("no steps in category: {0}")]
    UnknownCategory(String),
}

/// Failure of a single step body. Caught by the orchestrator and turned into
/// a `Failed` outcome; never propagates past `Orchestrator::run`.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("command `{command}` exited with code {exit_code} after {attempts} attempt(s){}", tail_suffix(.stderr))]
    Command {
        command: String,
        exit_code: i32,
        attempts: u32,
        stderr: String,
    },

    #[error("command `{command}` timed out after {attempts} attempt(s)")]
    Timeout { command: String, attempts: u32 },

    #[error("{target} not ready after {waited_secs}s")]
    NotReady { target: String, waited_secs: u64 },

    #[error("interrupted")]
    Interrupted,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}

fn tail_suffix(stderr: &str) -> String {
    let line = stderr.lines().rev().find(|l| !l.trim().is_empty());
    match line {
        Some(l) => format!(": {}", l.trim()),
        None => String::new(),
    }
}

impl StepError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        StepError::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("failed to archive {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Manifest(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("backup archive missing: {0}")]
    MissingArchive(PathBuf),

    #[error("failed to restore {path}: {source}")]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("plan not found: {0}")]
    PlanNotFound(String),

    #[error("backup not found: {0}")]
    BackupNotFound(String),

    #[error("invalid plan file {path}: {source}")]
    InvalidPlanFile {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("step '{step}': invalid file mode '{mode}' (expected octal, e.g. 0644)")]
    InvalidMode { step: String, mode: String },

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Restore(#[from] RestoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, ProvisionError>;
