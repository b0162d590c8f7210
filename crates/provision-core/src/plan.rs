//! Validated, topologically ordered step lists.

use crate::error::PlanError;
use crate::step::Step;
use regex::Regex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Step id validation
// ---------------------------------------------------------------------------

static STEP_ID_RE: OnceLock<Regex> = OnceLock::new();

fn step_id_re() -> &'static Regex {
    STEP_ID_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_\-]*$").unwrap())
}

pub fn validate_step_id(id: &str) -> Result<(), PlanError> {
    if id.is_empty() || id.len() > 64 || !step_id_re().is_match(id) {
        return Err(PlanError::InvalidStepId(id.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Steps in execution order: dependencies first, ties broken by declaration
/// order. A `Plan` can only be obtained through `build`, so it is always a DAG.
#[derive(Debug)]
pub struct Plan {
    name: String,
    steps: Vec<Step>,
    backup_paths: Vec<PathBuf>,
}

impl Plan {
    pub fn build(name: impl Into<String>, steps: Vec<Step>) -> Result<Self, PlanError> {
        let order = execution_order(&steps)?;
        let mut slots: Vec<Option<Step>> = steps.into_iter().map(Some).collect();
        let ordered = order
            .into_iter()
            .filter_map(|i| slots[i].take())
            .collect();
        Ok(Self {
            name: name.into(),
            steps: ordered,
            backup_paths: Vec::new(),
        })
    }

    /// Paths snapshotted before the first mutating step runs.
    pub fn with_backup_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.backup_paths = paths;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn backup_paths(&self) -> &[PathBuf] {
        &self.backup_paths
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn order(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.id.as_str()).collect()
    }

    pub fn categories(&self) -> BTreeSet<&str> {
        self.steps
            .iter()
            .filter_map(|s| s.category.as_deref())
            .collect()
    }

    pub(crate) fn steps_mut(&mut self) -> &mut [Step] {
        &mut self.steps
    }

    /// Keep only `category`'s steps plus everything they transitively depend
    /// on, so the restricted plan is still closed under `depends_on`.
    pub fn restrict_to_category(self, category: &str) -> Result<Self, PlanError> {
        let mut keep: HashSet<String> = self
            .steps
            .iter()
            .filter(|s| s.category.as_deref() == Some(category))
            .map(|s| s.id.clone())
            .collect();
        if keep.is_empty() {
            return Err(PlanError::UnknownCategory(category.to_string()));
        }

        // Steps are already in dependency order, so one reverse sweep pulls in
        // every transitive dependency.
        for step in self.steps.iter().rev() {
            if keep.contains(&step.id) {
                keep.extend(step.depends_on.iter().cloned());
            }
        }

        let steps = self
            .steps
            .into_iter()
            .filter(|s| keep.contains(&s.id))
            .collect();
        Ok(Self {
            name: self.name,
            steps,
            backup_paths: self.backup_paths,
        })
    }
}

/// Kahn's algorithm over declaration indices. The ready set is ordered, so
/// among runnable steps the earliest-declared always goes first.
fn execution_order(steps: &[Step]) -> Result<Vec<usize>, PlanError> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        validate_step_id(&step.id)?;
        if index.insert(step.id.as_str(), i).is_some() {
            return Err(PlanError::DuplicateStep(step.id.clone()));
        }
    }

    let mut indegree = vec![0usize; steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            if *dep == step.id {
                return Err(PlanError::SelfDependency(step.id.clone()));
            }
            let Some(&j) = index.get(dep.as_str()) else {
                return Err(PlanError::MissingDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                });
            };
            indegree[i] += 1;
            dependents[j].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..steps.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &d in &dependents[i] {
            indegree[d] -= 1;
            if indegree[d] == 0 {
                ready.insert(d);
            }
        }
    }

    if order.len() < steps.len() {
        let stuck = (0..steps.len())
            .filter(|&i| indegree[i] > 0)
            .map(|i| steps[i].id.clone())
            .collect();
        return Err(PlanError::Cycle(stuck));
    }
    Ok(order)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
