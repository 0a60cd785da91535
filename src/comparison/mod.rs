//! Comparison engine.
//!
//! Pure read/compute layer over the result store: resolves which candidates
//! participate in the active comparison, normalizes them for display, and
//! derives relative metrics. Never mutates stored results.

use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::models::{MethodType, SavedResult, StructureResult};
use crate::store::{ResultRef, ResultStore};

/// Chart series colors, assigned by candidate position.
const COLOR_PALETTE: [&str; 3] = ["#2563eb", "#f59e0b", "#10b981"];

/// Relative difference of `candidate` against `baseline`, in percent.
/// Undefined (not infinite, not NaN) when the baseline is zero or either
/// side is not a finite number.
pub fn percent_diff(candidate: f64, baseline: f64) -> Option<f64> {
    if baseline == 0.0 || !candidate.is_finite() || !baseline.is_finite() {
        return None;
    }
    Some((candidate - baseline) / baseline * 100.0)
}

/// One normalized comparison candidate
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonEntry {
    pub label: String,
    pub category: Option<MethodType>,
    pub color_key: &'static str,
    /// Minimum-buffer threshold check, reported independently per candidate.
    /// Never feeds the percent-diff math.
    pub buffer_ok: bool,
    pub structure: StructureResult,
}

/// Derived relative metrics for one candidate/baseline pair.
/// Totals are recomputed from principal/interest parts, never read as
/// aggregates from the payload.
#[derive(Debug, Clone, Serialize)]
pub struct PairwiseDiff {
    pub baseline_label: String,
    pub candidate_label: String,
    pub class_a_total_diff: Option<f64>,
    pub class_b_total_diff: Option<f64>,
    pub grand_total_diff: Option<f64>,
    pub financing_cost_diff: Option<f64>,
    pub min_buffer_diff: Option<f64>,
    pub total_principal_paid_diff: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparisonReport {
    pub entries: Vec<ComparisonEntry>,
    pub pairwise: Vec<PairwiseDiff>,
    /// Candidate labels ordered by recomputed financing cost, cheapest first.
    pub ranking: Vec<String>,
}

pub struct ComparisonEngine {
    store: Arc<ResultStore>,
}

impl ComparisonEngine {
    pub fn new(store: Arc<ResultStore>) -> Self {
        Self { store }
    }

    /// Build the active comparison view. `min_buffer` is the deal-level
    /// threshold each candidate is checked against.
    pub fn report(&self, min_buffer: f64) -> ComparisonReport {
        let candidates = self.resolve();
        debug!(candidates = candidates.len(), "Resolved comparison candidates");

        let entries: Vec<ComparisonEntry> = candidates
            .into_iter()
            .enumerate()
            .map(|(i, (label, category, structure))| ComparisonEntry {
                label,
                category,
                color_key: COLOR_PALETTE[i % COLOR_PALETTE.len()],
                buffer_ok: structure.min_buffer_actual >= min_buffer,
                structure,
            })
            .collect();

        let pairwise = pairwise_diffs(&entries);

        let mut ranking: Vec<(String, f64)> = entries
            .iter()
            .map(|e| (e.label.clone(), e.structure.financing_cost))
            .collect();
        ranking.sort_by(|a, b| a.1.total_cmp(&b.1));

        ComparisonReport {
            entries,
            pairwise,
            ranking: ranking.into_iter().map(|(label, _)| label).collect(),
        }
    }

    /// Resolve the participating candidates: the explicit selection when one
    /// exists, otherwise the auto-derived set.
    fn resolve(&self) -> Vec<(String, Option<MethodType>, StructureResult)> {
        let selection = self.store.selection();
        if !selection.is_empty() {
            return selection
                .into_iter()
                .filter_map(|r| self.resolve_ref(r))
                .collect();
        }
        self.auto_select()
    }

    fn resolve_ref(&self, r: ResultRef) -> Option<(String, Option<MethodType>, StructureResult)> {
        match r {
            ResultRef::Saved(id) => {
                let saved = self.store.get(&id)?;
                Some((saved.name, Some(saved.method_type), saved.structure))
            }
            ResultRef::Current => self
                .store
                .current()
                .map(|s| ("Current calculation".to_string(), None, s)),
            ResultRef::Previous => self
                .store
                .previous()
                .map(|s| ("Previous calculation".to_string(), None, s)),
        }
    }

    /// Auto-selection: the most recent result of each category in the fixed
    /// [manual, standard, genetic] order; the single most recent result if
    /// no category scan produced anything; the working slots as a last
    /// resort when both are populated.
    fn auto_select(&self) -> Vec<(String, Option<MethodType>, StructureResult)> {
        // Named results and unnamed comparison-history entries are both
        // candidates; an explicit save lands in both, so dedup by id.
        let mut pool: Vec<SavedResult> = self.store.list();
        for entry in self.store.history() {
            if !pool.iter().any(|r| r.id == entry.id) {
                pool.push(entry);
            }
        }

        let mut picked: Vec<(String, Option<MethodType>, StructureResult)> = Vec::new();
        for method in MethodType::ALL {
            let best = pool
                .iter()
                .filter(|r| r.method_type == method)
                .max_by_key(|r| r.created_at);
            if let Some(r) = best {
                picked.push((r.name.clone(), Some(r.method_type), r.structure.clone()));
            }
        }
        if !picked.is_empty() {
            return picked;
        }

        if let Some(r) = pool.iter().max_by_key(|r| r.created_at) {
            return vec![(r.name.clone(), Some(r.method_type), r.structure.clone())];
        }

        match (self.store.current(), self.store.previous()) {
            (Some(current), Some(previous)) => vec![
                ("Current calculation".to_string(), None, current),
                ("Previous calculation".to_string(), None, previous),
            ],
            _ => Vec::new(),
        }
    }
}

/// Pairwise metrics for every unordered pair. When a manual candidate is
/// present, only pairs anchored on a manual baseline are reported.
fn pairwise_diffs(entries: &[ComparisonEntry]) -> Vec<PairwiseDiff> {
    let has_manual = entries
        .iter()
        .any(|e| e.category == Some(MethodType::Manual));

    let mut diffs = Vec::new();
    for i in 0..entries.len() {
        for j in (i + 1)..entries.len() {
            let (a, b) = (&entries[i], &entries[j]);
            let a_manual = a.category == Some(MethodType::Manual);
            let b_manual = b.category == Some(MethodType::Manual);
            if has_manual && !a_manual && !b_manual {
                continue;
            }
            // The manual side is the baseline; otherwise the earlier entry.
            let (baseline, candidate) = if b_manual && !a_manual { (b, a) } else { (a, b) };
            diffs.push(diff_pair(baseline, candidate));
        }
    }
    diffs
}

fn diff_pair(baseline: &ComparisonEntry, candidate: &ComparisonEntry) -> PairwiseDiff {
    let (b, c) = (&baseline.structure, &candidate.structure);
    PairwiseDiff {
        baseline_label: baseline.label.clone(),
        candidate_label: candidate.label.clone(),
        class_a_total_diff: percent_diff(c.class_a_total(), b.class_a_total()),
        class_b_total_diff: percent_diff(c.class_b_total(), b.class_b_total()),
        grand_total_diff: percent_diff(c.grand_total(), b.grand_total()),
        financing_cost_diff: percent_diff(c.financing_cost, b.financing_cost),
        min_buffer_diff: percent_diff(c.min_buffer_actual, b.min_buffer_actual),
        total_principal_paid_diff: percent_diff(c.total_principal_paid, b.total_principal_paid),
    }
}
