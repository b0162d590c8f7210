use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const PROVISION_DIR: &str = ".provision";
pub const PLANS_DIR: &str = ".provision/plans";
pub const BACKUPS_DIR: &str = ".provision/backups";
pub const RUNS_DIR: &str = ".provision/runs";

pub const CONFIG_FILE: &str = ".provision/config.yaml";
pub const LEDGER_FILE: &str = ".provision/ledger.yaml";

pub const PLAN_EXT: &str = "yaml";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn provision_dir(root: &Path) -> PathBuf {
    root.join(PROVISION_DIR)
}

pub fn plans_dir(root: &Path) -> PathBuf {
    root.join(PLANS_DIR)
}

pub fn runs_dir(root: &Path) -> PathBuf {
    root.join(RUNS_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn ledger_path(root: &Path) -> PathBuf {
    root.join(LEDGER_FILE)
}

pub fn run_report_path(root: &Path, run_id: &str) -> PathBuf {
    runs_dir(root).join(format!("{run_id}.yaml"))
}

/// Resolve a plan argument to a file.
///
/// A bare name (`ai-stack`) maps to `.provision/plans/ai-stack.yaml`. Anything
/// that looks like a path (contains a separator or ends in `.yaml`/`.yml`) is
/// taken relative to `root` unless absolute.
pub fn plan_path(root: &Path, plan: &str) -> PathBuf {
    let looks_like_path =
        plan.contains('/') || plan.ends_with(".yaml") || plan.ends_with(".yml");
    if looks_like_path {
        let p = Path::new(plan);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            root.join(p)
        }
    } else {
        plans_dir(root).join(format!("{plan}.{PLAN_EXT}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_helpers() {
        let root = Path::new("/tmp/host");
        assert_eq!(
            config_path(root),
            PathBuf::from("/tmp/host/.provision/config.yaml")
        );
        assert_eq!(
            ledger_path(root),
            PathBuf::from("/tmp/host/.provision/ledger.yaml")
        );
        assert_eq!(
            run_report_path(root, "abc"),
            PathBuf::from("/tmp/host/.provision/runs/abc.yaml")
        );
    }

    #[test]
    fn plan_names_resolve_into_plans_dir() {
        let root = Path::new("/tmp/host");
        assert_eq!(
            plan_path(root, "ai-stack"),
            PathBuf::from("/tmp/host/.provision/plans/ai-stack.yaml")
        );
        assert_eq!(
            plan_path(root, "custom/plan.yml"),
            PathBuf::from("/tmp/host/custom/plan.yml")
        );
        assert_eq!(
            plan_path(root, "/etc/provision/base.yaml"),
            PathBuf::from("/etc/provision/base.yaml")
        );
    }
}
