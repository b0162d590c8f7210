//! Record of completed steps, used to skip finished work and to decide what
//! a rollback must unwind.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub step_id: String,
    pub completed_at: DateTime<Utc>,
}

/// Completed step ids in insertion order. A step id appears at most once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateLedger {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    entries: Vec<LedgerEntry>,
}

fn default_version() -> u32 {
    1
}

impl StateLedger {
    pub fn new() -> Self {
        Self {
            version: 1,
            entries: Vec::new(),
        }
    }

    // ---------------------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------------------

    /// Load the ledger from `path`. A missing file is an empty ledger.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let data = std::fs::read_to_string(path)?;
        let ledger: StateLedger = serde_yaml::from_str(&data)?;
        Ok(ledger)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(path, data.as_bytes())?;
        Ok(())
    }

    // ---------------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------------

    pub fn is_done(&self, step_id: &str) -> bool {
        self.entries.iter().any(|e| e.step_id == step_id)
    }

    /// Completed step ids in the order they were first marked.
    pub fn all_done(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.step_id.as_str()).collect()
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn get(&self, step_id: &str) -> Option<&LedgerEntry> {
        self.entries.iter().find(|e| e.step_id == step_id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // ---------------------------------------------------------------------------
    // Mutations
    // ---------------------------------------------------------------------------

    /// Mark a step complete. Re-marking refreshes the timestamp in place.
    pub fn mark_done(&mut self, step_id: &str) {
        let now = Utc::now();
        match self.entries.iter_mut().find(|e| e.step_id == step_id) {
            Some(entry) => entry.completed_at = now,
            None => self.entries.push(LedgerEntry {
                step_id: step_id.to_string(),
                completed_at: now,
            }),
        }
    }

    /// Forget a step. Returns true if it was present.
    pub fn unmark(&mut self, step_id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.step_id != step_id);
        self.entries.len() != before
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
