//! YAML plan files and their conversion into executable [`Plan`]s.

use crate::command::{CommandSpec, RetryPolicy};
use crate::config::{Config, Defaults};
use crate::diagnose::CheckDef;
use crate::error::{ProvisionError, Result, StepError};
use crate::health::{HttpProbe, ServiceProbe};
use crate::paths;
use crate::plan::Plan;
use crate::step::{Ownership, Requirements, Step, StepContext};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// File format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanFile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub backup: BackupSection,
    #[serde(default)]
    pub steps: Vec<StepDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<CheckDef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupSection {
    #[serde(default)]
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_idempotent")]
    pub idempotent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Ownership>,
    #[serde(default, skip_serializing_if = "Requirements::is_empty")]
    pub requirements: Requirements,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undo: Option<Action>,
}

fn default_idempotent() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Shell(ShellAction),
    WriteFile(WriteFileAction),
    EnsureDir(EnsureDirAction),
    HttpReady(HttpReadyAction),
    ServiceActive(ServiceActiveAction),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShellAction {
    pub command: String,
    /// Per-attempt limit; 0 disables the timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WriteFileAction {
    pub path: PathBuf,
    pub contents: String,
    /// Octal permission string such as `"0644"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnsureDirAction {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpReadyAction {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceActiveAction {
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
}

impl Action {
    /// Readiness waits only observe the host.
    pub fn mutates(&self) -> bool {
        !matches!(self, Action::HttpReady(_) | Action::ServiceActive(_))
    }

    fn mode(&self) -> Option<&str> {
        match self {
            Action::WriteFile(a) => a.mode.as_deref(),
            Action::EnsureDir(a) => a.mode.as_deref(),
            _ => None,
        }
    }

    /// One-line summary for plan listings.
    pub fn summary(&self) -> String {
        match self {
            Action::Shell(a) => format!("shell: {}", a.command),
            Action::WriteFile(a) => format!("write {}", a.path.display()),
            Action::EnsureDir(a) => format!("mkdir {}", a.path.display()),
            Action::HttpReady(a) => format!("wait for {}", a.url),
            Action::ServiceActive(a) => format!("wait for service {}", a.service),
        }
    }
}

/// Parse an octal mode such as `0644`, `644` or `0o755`.
pub fn parse_mode(mode: &str) -> Option<u32> {
    let digits = mode.strip_prefix("0o").unwrap_or(mode);
    if digits.is_empty() || digits.len() > 4 {
        return None;
    }
    u32::from_str_radix(digits, 8).ok()
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl PlanFile {
    pub fn load(path: &Path) -> Result<Self> {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProvisionError::PlanNotFound(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        serde_yaml::from_str(&data).map_err(|source| ProvisionError::InvalidPlanFile {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load by name (`.provision/plans/<name>.yaml`) or path.
    pub fn load_named(root: &Path, plan: &str) -> Result<Self> {
        Self::load(&paths::plan_path(root, plan))
    }

    /// Build an executable plan. Relative paths resolve against `root`; unset
    /// timing fields come from `config.defaults`.
    pub fn into_plan(self, config: &Config, root: &Path) -> Result<Plan> {
        let mut steps = Vec::with_capacity(self.steps.len());
        for def in self.steps {
            for action in std::iter::once(&def.action).chain(def.undo.as_ref()) {
                if let Some(mode) = action.mode() {
                    if parse_mode(mode).is_none() {
                        return Err(ProvisionError::InvalidMode {
                            step: def.id.clone(),
                            mode: mode.to_string(),
                        });
                    }
                }
            }
            steps.push(build_step(def, &config.defaults, root));
        }
        let backup_paths = self
            .backup
            .paths
            .iter()
            .map(|p| resolve(root, p))
            .collect();
        Ok(Plan::build(self.name, steps)?.with_backup_paths(backup_paths))
    }
}

fn build_step(def: StepDef, defaults: &Defaults, root: &Path) -> Step {
    let mutates = def.action.mutates();
    let body = bind(def.action, def.owner.clone(), defaults, root);
    let mut step = Step::new(def.id, body)
        .depends_on(def.depends_on)
        .idempotent(def.idempotent)
        .requires(def.requirements);
    if !mutates {
        step = step.read_only();
    }
    if let Some(description) = def.description {
        step = step.describe(description);
    }
    if let Some(category) = def.category {
        step = step.category(category);
    }
    if let Some(undo) = def.undo {
        step = step.with_undo(bind(undo, def.owner, defaults, root));
    }
    step
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Turn an action into a step closure with every default already applied.
fn bind(
    action: Action,
    owner: Option<Ownership>,
    defaults: &Defaults,
    root: &Path,
) -> impl FnMut(&mut StepContext<'_>) -> std::result::Result<(), StepError> + 'static {
    let defaults = defaults.clone();
    let root = root.to_path_buf();
    move |ctx| run_action(ctx, &action, owner.as_ref(), &defaults, &root)
}

fn run_action(
    ctx: &mut StepContext<'_>,
    action: &Action,
    owner: Option<&Ownership>,
    defaults: &Defaults,
    root: &Path,
) -> std::result::Result<(), StepError> {
    match action {
        Action::Shell(a) => {
            let mut spec = CommandSpec::shell(&a.command)
                .with_cwd(a.cwd.as_deref().map_or_else(|| root.to_path_buf(), |c| resolve(root, c)));
            for (k, v) in &a.env {
                spec = spec.with_env(k, v);
            }
            let timeout = match a.timeout_seconds {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.command_timeout(),
            };
            let policy = RetryPolicy::new(
                a.attempts.unwrap_or(defaults.attempts),
                Duration::from_millis(a.backoff_ms.unwrap_or(defaults.backoff_ms)),
            )
            .with_max_delay(Duration::from_millis(defaults.max_backoff_ms));
            ctx.run_command(&spec, timeout, &policy)?;
            Ok(())
        }
        Action::WriteFile(a) => {
            let path = resolve(root, &a.path);
            crate::io::atomic_write(&path, a.contents.as_bytes())
                .map_err(|e| StepError::io(format!("writing {}", path.display()), e))?;
            finish_path(&path, a.mode.as_deref(), owner)
        }
        Action::EnsureDir(a) => {
            let path = resolve(root, &a.path);
            crate::io::ensure_dir(&path)
                .map_err(|e| StepError::io(format!("creating {}", path.display()), e))?;
            finish_path(&path, a.mode.as_deref(), owner)
        }
        Action::HttpReady(a) => {
            let (timeout, interval) = wait_times(a.timeout_seconds, a.poll_interval_ms, defaults);
            let probe = HttpProbe::new(a.url.as_str(), interval.max(Duration::from_secs(1)));
            ctx.wait_ready(&a.url, || probe.check(), timeout, interval)
        }
        Action::ServiceActive(a) => {
            let (timeout, interval) = wait_times(a.timeout_seconds, a.poll_interval_ms, defaults);
            let probe = ServiceProbe::new(a.service.as_str());
            ctx.wait_ready(&format!("service {}", a.service), || probe.check(), timeout, interval)
        }
    }
}

fn wait_times(
    timeout_seconds: Option<u64>,
    poll_interval_ms: Option<u64>,
    defaults: &Defaults,
) -> (Duration, Duration) {
    let timeout = timeout_seconds.map_or_else(|| defaults.health_timeout(), Duration::from_secs);
    let interval = poll_interval_ms.map_or_else(|| defaults.poll_interval(), Duration::from_millis);
    (timeout, interval)
}

/// Apply mode then owner to a freshly written path.
fn finish_path(
    path: &Path,
    mode: Option<&str>,
    owner: Option<&Ownership>,
) -> std::result::Result<(), StepError> {
    if let Some(bits) = mode.and_then(parse_mode) {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(bits))
            .map_err(|e| StepError::io(format!("chmod {}", path.display()), e))?;
    }
    if let Some(owner) = owner {
        apply_owner(path, owner)?;
    }
    Ok(())
}

fn apply_owner(path: &Path, owner: &Ownership) -> std::result::Result<(), StepError> {
    use nix::unistd::{chown, Group, User};

    let user = User::from_name(&owner.user)
        .map_err(|e| StepError::Other(format!("looking up user {}: {e}", owner.user)))?
        .ok_or_else(|| StepError::Other(format!("unknown user: {}", owner.user)))?;
    let gid = match &owner.group {
        Some(name) => {
            Group::from_name(name)
                .map_err(|e| StepError::Other(format!("looking up group {name}: {e}")))?
                .ok_or_else(|| StepError::Other(format!("unknown group: {name}")))?
                .gid
        }
        None => user.gid,
    };
    chown(path, Some(user.uid), Some(gid))
        .map_err(|e| StepError::io(format!("chown {owner} {}", path.display()), e.into()))?;
    tracing::debug!(path = %path.display(), owner = %owner, "applied ownership");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::Facts;
    use crate::ledger::StateLedger;
    use crate::orchestrator::Orchestrator;
    use crate::report::RunStatus;
    use crate::step::{RunContext, StepStatus};
    use tempfile::TempDir;

    fn parse(yaml: &str) -> PlanFile {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.defaults.attempts = 1;
        config.defaults.backoff_ms = 10;
        config.defaults.health_timeout_seconds = 1;
        config.defaults.poll_interval_ms = 100;
        config
    }

    fn run(file: PlanFile, root: &Path) -> crate::report::RunReport {
        let plan = file.into_plan(&fast_config(), root).unwrap();
        let mut ledger = StateLedger::new();
        Orchestrator::new().run(plan, &RunContext::new(Facts::default()), &mut ledger)
    }

    const SAMPLE: &str = r#"
name: ai-stack
description: Ollama runtime plus Open WebUI
backup:
  paths: [etc/ollama]
steps:
  - id: install_docker
    category: docker
    action: { type: shell, command: "apt-get install -y docker.io", attempts: 3 }
    undo: { type: shell, command: "apt-get remove -y docker.io" }
  - id: ollama_ready
    depends_on: [install_docker]
    requirements: { gpu: true }
    action: { type: http_ready, url: "http://127.0.0.1:11434/api/tags" }
checks:
  - category: ollama
    check: { type: service, name: ollama }
"#;

    #[test]
    fn parses_sample_plan() {
        let file = parse(SAMPLE);
        assert_eq!(file.name, "ai-stack");
        assert_eq!(file.steps.len(), 2);
        assert!(file.steps[0].idempotent);
        assert_eq!(
            file.steps[0].action,
            Action::Shell(ShellAction {
                command: "apt-get install -y docker.io".into(),
                timeout_seconds: None,
                attempts: Some(3),
                backoff_ms: None,
                cwd: None,
                env: BTreeMap::new(),
            })
        );
        assert!(file.steps[1].requirements.gpu);
        assert!(!file.steps[1].action.mutates());
        assert_eq!(file.checks.len(), 1);
    }

    #[test]
    fn into_plan_orders_steps_and_resolves_backup_paths() {
        let root = Path::new("/srv/provision");
        let plan = parse(SAMPLE).into_plan(&Config::default(), root).unwrap();
        assert_eq!(plan.order(), vec!["install_docker", "ollama_ready"]);
        assert_eq!(plan.backup_paths(), &[root.join("etc/ollama")]);
        assert!(plan.steps()[0].has_undo());
        assert!(!plan.steps()[1].mutates);
        assert_eq!(plan.steps()[0].category.as_deref(), Some("docker"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let bad_step = "name: p\nsteps:\n  - id: a\n    action: { type: shell, command: x }\n    retries: 3\n";
        assert!(serde_yaml::from_str::<PlanFile>(bad_step).is_err());

        let bad_action = "name: p\nsteps:\n  - id: a\n    action: { type: shell, command: x, retries: 3 }\n";
        assert!(serde_yaml::from_str::<PlanFile>(bad_action).is_err());

        let bad_type = "name: p\nsteps:\n  - id: a\n    action: { type: reboot }\n";
        assert!(serde_yaml::from_str::<PlanFile>(bad_type).is_err());
    }

    #[test]
    fn load_reports_missing_and_invalid_files() {
        let dir = TempDir::new().unwrap();
        let err = PlanFile::load_named(dir.path(), "nope").unwrap_err();
        assert!(matches!(err, ProvisionError::PlanNotFound(_)));

        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "name: [unclosed").unwrap();
        let err = PlanFile::load_named(dir.path(), "broken.yaml").unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidPlanFile { .. }));
    }

    #[test]
    fn cyclic_plan_file_is_a_plan_error() {
        let file = parse(
            "name: p\nsteps:\n  - id: a\n    depends_on: [b]\n    action: { type: shell, command: 'true' }\n  - id: b\n    depends_on: [a]\n    action: { type: shell, command: 'true' }\n",
        );
        let err = file.into_plan(&Config::default(), Path::new("/")).unwrap_err();
        assert!(matches!(err, ProvisionError::Plan(crate::error::PlanError::Cycle(_))));
    }

    #[test]
    fn invalid_mode_is_rejected() {
        let file = parse(
            "name: p\nsteps:\n  - id: a\n    action: { type: ensure_dir, path: x, mode: '0999' }\n",
        );
        let err = file.into_plan(&Config::default(), Path::new("/")).unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidMode { .. }));
    }

    #[test]
    fn mode_parsing() {
        assert_eq!(parse_mode("0644"), Some(0o644));
        assert_eq!(parse_mode("755"), Some(0o755));
        assert_eq!(parse_mode("0o700"), Some(0o700));
        assert_eq!(parse_mode("rw-r--r--"), None);
        assert_eq!(parse_mode(""), None);
    }

    #[test]
    fn file_actions_write_relative_to_root() {
        let dir = TempDir::new().unwrap();
        let file = parse(
            r#"
name: files
steps:
  - id: models_dir
    action: { type: ensure_dir, path: data/models, mode: "0750" }
  - id: override
    depends_on: [models_dir]
    action: { type: write_file, path: data/override.conf, contents: "OLLAMA_HOST=0.0.0.0\n", mode: "0600" }
  - id: marker
    action: { type: shell, command: "echo $GREETING > marker.txt", env: { GREETING: hello } }
"#,
        );
        let report = run(file, dir.path());
        assert_eq!(report.status, RunStatus::Completed);

        let models = dir.path().join("data/models");
        assert!(models.is_dir());
        assert_eq!(
            std::fs::metadata(&models).unwrap().permissions().mode() & 0o777,
            0o750
        );
        let conf = dir.path().join("data/override.conf");
        assert_eq!(std::fs::read_to_string(&conf).unwrap(), "OLLAMA_HOST=0.0.0.0\n");
        assert_eq!(
            std::fs::metadata(&conf).unwrap().permissions().mode() & 0o777,
            0o600
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("marker.txt")).unwrap(),
            "hello\n"
        );
    }

    #[test]
    fn owner_is_applied_explicitly() {
        let dir = TempDir::new().unwrap();
        let me = nix::unistd::User::from_uid(nix::unistd::getuid())
            .unwrap()
            .unwrap()
            .name;
        let file = parse(&format!(
            "name: own\nsteps:\n  - id: mine\n    owner: {{ user: {me} }}\n    action: {{ type: ensure_dir, path: owned }}\n  - id: theirs\n    owner: {{ user: no-such-user-for-provision-tests }}\n    action: {{ type: ensure_dir, path: other }}\n"
        ));
        let report = run(file, dir.path());
        assert_eq!(report.outcome("mine").unwrap().status, StepStatus::Success);
        let theirs = report.outcome("theirs").unwrap();
        assert_eq!(theirs.status, StepStatus::Failed);
        assert_eq!(
            theirs.error_detail.as_deref(),
            Some("unknown user: no-such-user-for-provision-tests")
        );
    }

    #[test]
    fn failing_shell_runs_undo_of_earlier_step() {
        let dir = TempDir::new().unwrap();
        let file = parse(
            r#"
name: undo
steps:
  - id: create
    action: { type: shell, command: "touch created" }
    undo: { type: shell, command: "rm -f created" }
  - id: explode
    depends_on: [create]
    action: { type: shell, command: "echo nope >&2; exit 4" }
"#,
        );
        let report = run(file, dir.path());
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.rolled_back, vec!["create"]);
        assert!(!dir.path().join("created").exists());
        let detail = report.failed_step().unwrap().error_detail.clone().unwrap();
        assert!(detail.contains("exited with code 4"), "{detail}");
        assert!(detail.ends_with(": nope"), "{detail}");
    }

    #[test]
    fn http_ready_polls_until_success() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/api/tags")
            .with_status(200)
            .expect_at_least(1)
            .create();
        let dir = TempDir::new().unwrap();
        let file = parse(&format!(
            "name: ready\nsteps:\n  - id: ollama_ready\n    action: {{ type: http_ready, url: '{}/api/tags' }}\n",
            server.url()
        ));
        let report = run(file, dir.path());
        mock.assert();
        assert_eq!(report.status, RunStatus::Completed);
    }

    #[test]
    fn http_ready_times_out() {
        let mut server = mockito::Server::new();
        server.mock("GET", "/").with_status(503).create();
        let dir = TempDir::new().unwrap();
        let file = parse(&format!(
            "name: ready\nsteps:\n  - id: webui_ready\n    action: {{ type: http_ready, url: '{}/', timeout_seconds: 1, poll_interval_ms: 200 }}\n",
            server.url()
        ));
        let report = run(file, dir.path());
        assert_eq!(report.status, RunStatus::Failed);
        assert!(report
            .failed_step()
            .unwrap()
            .error_detail
            .as_deref()
            .unwrap()
            .ends_with("not ready after 1s"));
    }
}
