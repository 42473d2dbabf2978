//! The explicit story context.
//!
//! Everything the engine learns while generating lives here, keyed by
//! branch: the thread ledger and fact log of each branch, plus the
//! consequence cache shared by all of them. A branch seen for the first time
//! starts from a copy of its nearest recorded ancestor, so a chapter-3 branch
//! `"AB"` inherits what `"A"` (or failing that `ROOT`) already established.
//!
//! ```text
//!   ROOT ──┬── A ──┬── AA
//!          │       └── AB   (first access clones A)
//!          └── B
//! ```

use crate::canon::StoryCanon;
use crate::config::ThreadPolicy;
use crate::consequence::ConsequenceCache;
use crate::facts::BranchFacts;
use crate::path::{BranchKey, CaseNumber};
use crate::threads::{IngestReport, ThreadLedger};
use crate::unit::GeneratedUnit;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// State accumulated along one branch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BranchState {
    #[serde(default)]
    pub ledger: ThreadLedger,
    #[serde(default)]
    pub facts: BranchFacts,
    /// Latest position folded into this state.
    #[serde(default)]
    pub last_folded: Option<CaseNumber>,
}

impl BranchState {
    /// Fold an accepted (or fallback) unit into this branch.
    pub fn fold(&mut self, unit: &GeneratedUnit, policy: &ThreadPolicy, canon: &StoryCanon) -> IngestReport {
        let case = unit.case_number;
        let report = self.ledger.ingest(case, &unit.threads, policy, canon);

        for revelation in &unit.revelations {
            self.facts.record_revelation(revelation, case.chapter);
        }
        for name in &unit.removed_characters {
            self.facts.record_removal(name, case.chapter);
        }

        self.last_folded = Some(self.last_folded.map_or(case, |last| last.max(case)));
        report
    }
}

/// All persisted engine state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoryContext {
    #[serde(default)]
    pub branches: BTreeMap<BranchKey, BranchState>,
    #[serde(default)]
    pub consequences: ConsequenceCache,
}

impl StoryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The recorded state of exactly `key`.
    pub fn branch(&self, key: &BranchKey) -> Option<&BranchState> {
        self.branches.get(key)
    }

    /// State to generate from on `key`: its own, else the nearest ancestor's.
    pub fn branch_state_for(&self, key: &BranchKey) -> BranchState {
        if let Some(state) = self.branches.get(key) {
            return state.clone();
        }
        key.ancestors()
            .iter()
            .find_map(|ancestor| self.branches.get(ancestor))
            .cloned()
            .unwrap_or_default()
    }

    /// Mutable state of `key`, materialized from its ancestry if missing.
    pub fn branch_mut(&mut self, key: &BranchKey) -> &mut BranchState {
        if !self.branches.contains_key(key) {
            let inherited = self.branch_state_for(key);
            self.branches.insert(key.clone(), inherited);
        }
        self.branches.entry(key.clone()).or_default()
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }
}
