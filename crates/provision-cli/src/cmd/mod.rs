pub mod backup;
pub mod diagnose;
pub mod facts;
pub mod init;
pub mod ledger;
pub mod plan;
pub mod run;

use provision_core::{config::Config, manifest::PlanFile, plan::Plan};
use run::RunExit;
use std::path::Path;

/// Load a plan file. Any failure is a plan error (exit code 2).
pub fn load_plan_file(root: &Path, name: &str) -> anyhow::Result<PlanFile> {
    PlanFile::load_named(root, name).map_err(|e| RunExit::InvalidPlan(e.to_string()).into())
}

/// Build the executable plan, optionally restricted to one category.
pub fn build_plan(
    file: PlanFile,
    config: &Config,
    root: &Path,
    category: Option<&str>,
) -> anyhow::Result<Plan> {
    let plan = file
        .into_plan(config, root)
        .map_err(|e| RunExit::InvalidPlan(e.to_string()))?;
    match category {
        Some(cat) => Ok(plan
            .restrict_to_category(cat)
            .map_err(|e| RunExit::InvalidPlan(e.to_string()))?),
        None => Ok(plan),
    }
}
