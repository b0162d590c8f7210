//! Read-only host checks, grouped into a typed problem registry.
//!
//! Checks come from a plan's `checks:` list. Each failing check yields one
//! [`Finding`] under its category; an empty registry means the host looks
//! healthy for that plan.

use crate::error::PlanError;
use crate::facts::Facts;
use crate::health::{query_service, HttpProbe, ServiceState};
use crate::step::Ownership;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CATEGORY: &str = "general";
const DEFAULT_ENDPOINT_TIMEOUT_SECS: u64 = 5;

// ---------------------------------------------------------------------------
// Findings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Finding {
    MissingDirectory {
        path: PathBuf,
    },
    WrongOwnership {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    MissingCommand {
        program: String,
    },
    ServiceNotActive {
        service: String,
        state: ServiceState,
    },
    EndpointUnreachable {
        url: String,
    },
    InsufficientMemory {
        required_mb: u64,
        available_mb: u64,
    },
    GpuMissing,
}

impl Finding {
    /// Suggested fix, phrased as something the operator can run.
    pub fn hint(&self) -> String {
        match self {
            Finding::MissingDirectory { path } => {
                format!("create it with `mkdir -p {}`", path.display())
            }
            Finding::WrongOwnership { path, expected, .. } => {
                format!("run `chown -R {expected} {}`", path.display())
            }
            Finding::MissingCommand { program } => {
                format!("install `{program}` and make sure it is on PATH")
            }
            Finding::ServiceNotActive {
                service,
                state: ServiceState::NotFound,
            } => format!("install the `{service}` unit, then `systemctl enable --now {service}`"),
            Finding::ServiceNotActive { service, .. } => {
                format!("start it with `systemctl enable --now {service}`")
            }
            Finding::EndpointUnreachable { url } => {
                format!("check that the service behind {url} is running and listening")
            }
            Finding::InsufficientMemory { required_mb, .. } => {
                format!("this host needs at least {required_mb} MiB of memory")
            }
            Finding::GpuMissing => {
                "install the NVIDIA driver so `nvidia-smi` can see a GPU".to_string()
            }
        }
    }
}

impl std::fmt::Display for Finding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Finding::MissingDirectory { path } => {
                write!(f, "directory {} does not exist", path.display())
            }
            Finding::WrongOwnership {
                path,
                expected,
                actual,
            } => write!(
                f,
                "{} is owned by {actual}, expected {expected}",
                path.display()
            ),
            Finding::MissingCommand { program } => write!(f, "command `{program}` not found"),
            Finding::ServiceNotActive { service, state } => {
                write!(f, "service {service} is {state}")
            }
            Finding::EndpointUnreachable { url } => write!(f, "{url} is unreachable"),
            Finding::InsufficientMemory {
                required_mb,
                available_mb,
            } => write!(
                f,
                "{available_mb} MiB of memory available, {required_mb} MiB required"
            ),
            Finding::GpuMissing => f.write_str("no GPU detected"),
        }
    }
}

// ---------------------------------------------------------------------------
// ProblemRegistry
// ---------------------------------------------------------------------------

/// Findings keyed by category, in category name order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProblemRegistry {
    problems: BTreeMap<String, Vec<Finding>>,
}

impl ProblemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, category: &str, finding: Finding) {
        self.problems
            .entry(category.to_string())
            .or_default()
            .push(finding);
    }

    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }

    /// Total number of findings across categories.
    pub fn len(&self) -> usize {
        self.problems.values().map(Vec::len).sum()
    }

    pub fn findings(&self, category: &str) -> &[Finding] {
        self.problems
            .get(category)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Finding)> {
        self.problems
            .iter()
            .flat_map(|(cat, fs)| fs.iter().map(move |f| (cat.as_str(), f)))
    }
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckDef {
    #[serde(default = "default_category")]
    pub category: String,
    pub check: CheckKind,
}

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckKind {
    Directory {
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner: Option<Ownership>,
    },
    Command {
        program: String,
    },
    Service {
        name: String,
    },
    Endpoint {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_seconds: Option<u64>,
    },
    Memory {
        min_mb: u64,
    },
    Gpu,
}

/// Run `checks` (only `category`'s when given). Relative directory paths are
/// resolved against `root`.
pub fn run_checks(
    checks: &[CheckDef],
    facts: &Facts,
    category: Option<&str>,
    root: &Path,
) -> Result<ProblemRegistry, PlanError> {
    let selected: Vec<&CheckDef> = checks
        .iter()
        .filter(|c| category.is_none_or(|cat| c.category == cat))
        .collect();
    if let Some(cat) = category {
        if selected.is_empty() {
            return Err(PlanError::UnknownCategory(cat.to_string()));
        }
    }

    let mut registry = ProblemRegistry::new();
    for check in selected {
        if let Some(finding) = evaluate(&check.check, facts, root) {
            tracing::info!(category = %check.category, finding = %finding, "check failed");
            registry.record(&check.category, finding);
        }
    }
    Ok(registry)
}

fn evaluate(kind: &CheckKind, facts: &Facts, root: &Path) -> Option<Finding> {
    match kind {
        CheckKind::Directory { path, owner } => {
            let path = if path.is_absolute() {
                path.clone()
            } else {
                root.join(path)
            };
            if !path.is_dir() {
                return Some(Finding::MissingDirectory { path });
            }
            let owner = owner.as_ref()?;
            let actual = current_owner(&path)?;
            if owner_matches(owner, &actual) {
                None
            } else {
                Some(Finding::WrongOwnership {
                    path,
                    expected: owner.to_string(),
                    actual: actual.to_string(),
                })
            }
        }
        CheckKind::Command { program } => match which::which(program) {
            Ok(_) => None,
            Err(_) => Some(Finding::MissingCommand {
                program: program.clone(),
            }),
        },
        CheckKind::Service { name } => match query_service(name) {
            ServiceState::Active => None,
            state => Some(Finding::ServiceNotActive {
                service: name.clone(),
                state,
            }),
        },
        CheckKind::Endpoint {
            url,
            timeout_seconds,
        } => {
            let timeout =
                Duration::from_secs(timeout_seconds.unwrap_or(DEFAULT_ENDPOINT_TIMEOUT_SECS));
            if HttpProbe::new(url.as_str(), timeout).check() {
                None
            } else {
                Some(Finding::EndpointUnreachable { url: url.clone() })
            }
        }
        CheckKind::Memory { min_mb } => {
            if facts.memory_mb >= *min_mb {
                None
            } else {
                Some(Finding::InsufficientMemory {
                    required_mb: *min_mb,
                    available_mb: facts.memory_mb,
                })
            }
        }
        CheckKind::Gpu => (!facts.gpu).then_some(Finding::GpuMissing),
    }
}

/// Owner of `path` by name. Ids with no passwd/group entry are shown numerically.
fn current_owner(path: &Path) -> Option<Ownership> {
    use nix::unistd::{Gid, Group, Uid, User};
    use std::os::unix::fs::MetadataExt;

    let meta = std::fs::metadata(path).ok()?;
    let user = User::from_uid(Uid::from_raw(meta.uid()))
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_else(|| meta.uid().to_string());
    let group = Group::from_gid(Gid::from_raw(meta.gid()))
        .ok()
        .flatten()
        .map(|g| g.name)
        .unwrap_or_else(|| meta.gid().to_string());
    Some(Ownership {
        user,
        group: Some(group),
    })
}

fn owner_matches(expected: &Ownership, actual: &Ownership) -> bool {
    expected.user == actual.user
        && expected
            .group
            .as_ref()
            .is_none_or(|g| actual.group.as_ref() == Some(g))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
