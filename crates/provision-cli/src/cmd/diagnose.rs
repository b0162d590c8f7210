use super::run::RunExit;
use crate::output::print_json;
use provision_core::{diagnose::run_checks, facts::Facts};
use std::path::Path;

pub fn run(root: &Path, plan: &str, category: Option<&str>, json: bool) -> anyhow::Result<()> {
    let file = super::load_plan_file(root, plan)?;
    if file.checks.is_empty() {
        println!("Plan '{}' declares no checks.", file.name);
        return Ok(());
    }

    let facts = Facts::gather();
    let registry = run_checks(&file.checks, &facts, category, root)
        .map_err(|e| RunExit::InvalidPlan(e.to_string()))?;

    if json {
        print_json(&serde_json::json!({
            "plan": file.name,
            "problems": registry,
            "count": registry.len(),
        }))?;
    } else if registry.is_empty() {
        println!("No problems found.");
    } else {
        for (cat, finding) in registry.iter() {
            println!("[{cat}] {finding}");
            println!("    fix: {}", finding.hint());
        }
    }

    if !registry.is_empty() {
        anyhow::bail!("{} problem(s) found", registry.len());
    }
    Ok(())
}
