pub mod backup;
pub mod command;
pub mod config;
pub mod diagnose;
pub mod error;
pub mod facts;
pub mod health;
pub mod io;
pub mod ledger;
pub mod manifest;
pub mod orchestrator;
pub mod paths;
pub mod plan;
pub mod report;
pub mod step;

pub use error::{ProvisionError, Result};
