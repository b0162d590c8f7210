use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use provision_core::{backup::BackupManager, config::Config, ProvisionError};
use std::path::Path;

#[derive(Subcommand)]
pub enum BackupSubcommand {
    /// List snapshots, newest first
    List,

    /// Restore every path in a snapshot, overwriting current contents
    Restore { id: String },
}

pub fn run(root: &Path, subcmd: BackupSubcommand, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let manager = BackupManager::new(config.backup.resolved_dir(root));

    match subcmd {
        BackupSubcommand::List => {
            let records = manager.list().context("failed to list backups")?;
            if json {
                return print_json(&records);
            }
            if records.is_empty() {
                println!("No backups in {}.", manager.dir().display());
                return Ok(());
            }
            let rows = records
                .iter()
                .map(|r| {
                    let paths: Vec<String> = r
                        .paths
                        .iter()
                        .map(|p| {
                            let mark = if p.existed { "" } else { " (absent)" };
                            format!("{}{mark}", p.path.display())
                        })
                        .collect();
                    vec![
                        r.id.clone(),
                        r.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                        paths.join(", "),
                    ]
                })
                .collect();
            print_table(&["ID", "CREATED", "PATHS"], rows);
        }
        BackupSubcommand::Restore { id } => {
            let record = manager
                .load_record(&id)
                .context("failed to read backup manifest")?
                .ok_or_else(|| ProvisionError::BackupNotFound(id.clone()))?;
            manager
                .restore(&record)
                .with_context(|| format!("failed to restore backup {id}"))?;
            if json {
                print_json(&record)?;
            } else {
                println!("Restored {} path(s) from {id}.", record.paths.len());
            }
        }
    }
    Ok(())
}
