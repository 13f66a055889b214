use crate::combination::GenotypeTable;
use crate::dataset::GenotypeDataset;
use crate::param::EvaluationFunction;
use serde::{Deserialize, Serialize};
use std::fmt;

/// MDR high-risk rule for one genotype cell.
///
/// The unaffected count is scaled by A/U and the cell total is redistributed between
/// normalized-affected and normalized-unaffected counts; the cell is high-risk when the
/// affected share is at least the unaffected one. Both normalized counts share the same
/// positive factor, so the comparison reduces to `a * U >= u * A`, computed exactly.
/// An empty cell is never high-risk, and neither is any cell of a subset missing one of the
/// two classes, since its normalized counts are undefined.
///
/// # Examples
/// ```
/// # use gepistasis::model::is_high_risk;
/// assert!(is_high_risk(3, 1, 10, 10));
/// assert!(is_high_risk(2, 4, 10, 20)); // tie after normalization
/// assert!(!is_high_risk(0, 0, 10, 10));
/// assert!(!is_high_risk(0, 3, 0, 10));
/// ```
pub fn is_high_risk(a: u32, u: u32, total_affected: usize, total_unaffected: usize) -> bool {
    if (a == 0 && u == 0) || total_affected == 0 || total_unaffected == 0 {
        return false;
    }
    (a as u64) * (total_unaffected as u64) >= (u as u64) * (total_affected as u64)
}

/// Indices of the high-risk cells given per-cell class counts.
pub fn risky_cells(
    affected: &[u32],
    unaffected: &[u32],
    total_affected: usize,
    total_unaffected: usize,
    out: &mut Vec<usize>,
) {
    out.clear();
    for (cell, (&a, &u)) in affected.iter().zip(unaffected.iter()).enumerate() {
        if is_high_risk(a, u, total_affected, total_unaffected) {
            out.push(cell);
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub tp: usize,
    pub fn_count: usize,
    pub fp: usize,
    pub tn: usize,
}

impl ConfusionMatrix {
    /// Confusion matrix of a subset from its per-cell counts: samples in a risky cell are
    /// predicted affected, every other sample unaffected.
    pub fn from_cell_counts(
        risky: &[usize],
        affected: &[u32],
        unaffected: &[u32],
        subset_affected: usize,
        subset_unaffected: usize,
    ) -> ConfusionMatrix {
        let tp: usize = risky.iter().map(|&c| affected[c] as usize).sum();
        let fp: usize = risky.iter().map(|&c| unaffected[c] as usize).sum();
        ConfusionMatrix {
            tp,
            fn_count: subset_affected - tp,
            fp,
            tn: subset_unaffected - fp,
        }
    }

    pub fn total(&self) -> usize {
        self.tp + self.fn_count + self.fp + self.tn
    }

    pub fn sensitivity(&self) -> f64 {
        ratio(self.tp as f64, (self.tp + self.fn_count) as f64)
    }

    pub fn specificity(&self) -> f64 {
        ratio(self.tn as f64, (self.tn + self.fp) as f64)
    }

    pub fn balanced_accuracy(&self) -> f64 {
        (self.sensitivity() + self.specificity()) / 2.0
    }

    pub fn accuracy(&self) -> f64 {
        ratio((self.tp + self.tn) as f64, self.total() as f64)
    }

    /// Goodman-Kruskal gamma
    pub fn gamma(&self) -> f64 {
        let concordant = self.tp as f64 * self.tn as f64;
        let discordant = self.fp as f64 * self.fn_count as f64;
        ratio(concordant - discordant, concordant + discordant)
    }

    /// Kendall tau-b
    pub fn tau_b(&self) -> f64 {
        let (tp, fn_, fp, tn) = (
            self.tp as f64,
            self.fn_count as f64,
            self.fp as f64,
            self.tn as f64,
        );
        let denominator = ((tp + fn_) * (tn + fp) * (tp + fp) * (tn + fn_)).sqrt();
        ratio(tp * tn - fp * fn_, denominator)
    }

    pub fn score(&self, function: EvaluationFunction) -> f64 {
        match function {
            EvaluationFunction::balanced_accuracy => self.balanced_accuracy(),
            EvaluationFunction::accuracy => self.accuracy(),
            EvaluationFunction::gamma => self.gamma(),
            EvaluationFunction::tau_b => self.tau_b(),
        }
    }
}

// 0.0 where the rate is undefined
fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

/// Classifies samples one by one: predicted affected iff the joint genotype of the
/// combination is one of the risky cells. `include` selects the samples to score.
pub fn confusion_per_sample<F>(
    dataset: &GenotypeDataset,
    combination: &[usize],
    risky: &[usize],
    include: F,
) -> ConfusionMatrix
where
    F: Fn(usize) -> bool,
{
    let rows: Vec<&[u8]> = combination.iter().map(|&v| dataset.row(v)).collect();
    let mut cm = ConfusionMatrix::default();
    let mut genotypes = vec![0u8; combination.len()];

    for sample in (0..dataset.num_samples()).filter(|&s| include(s)) {
        for (g, row) in genotypes.iter_mut().zip(rows.iter()) {
            *g = row[sample];
        }
        let predicted = risky.contains(&GenotypeTable::cell_index(&genotypes));
        match (dataset.is_affected(sample), predicted) {
            (true, true) => cm.tp += 1,
            (true, false) => cm.fn_count += 1,
            (false, true) => cm.fp += 1,
            (false, false) => cm.tn += 1,
        }
    }
    cm
}

/// A combination with at least one high-risk genotype cell and its score.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RiskyCombination {
    /// Strictly increasing variant indices
    pub combination: Vec<usize>,
    /// Sorted indices into the genotype table
    pub risky_genotypes: Vec<usize>,
    pub accuracy: f64,
    /// Number of folds the combination was ranked in
    pub cv_count: usize,
}

impl RiskyCombination {
    pub fn new(combination: Vec<usize>, risky_genotypes: Vec<usize>, accuracy: f64) -> RiskyCombination {
        RiskyCombination {
            combination,
            risky_genotypes,
            accuracy,
            cv_count: 1,
        }
    }

    pub fn order(&self) -> usize {
        self.combination.len()
    }

    pub fn display(&self, table: &GenotypeTable) -> String {
        format!(
            "({}) risky {} | accuracy {:.4} | cv count {}",
            format_combination(&self.combination),
            format_genotypes(table, &self.risky_genotypes),
            self.accuracy,
            self.cv_count
        )
    }
}

impl fmt::Display for RiskyCombination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}) {} risky cells, accuracy {:.4}, cv count {}",
            format_combination(&self.combination),
            self.risky_genotypes.len(),
            self.accuracy,
            self.cv_count
        )
    }
}

pub fn format_combination(combination: &[usize]) -> String {
    combination
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Risky cells as genotype tuples, e.g. `(2,2) (0,1)`
pub fn format_genotypes(table: &GenotypeTable, cells: &[usize]) -> String {
    cells
        .iter()
        .map(|&c| {
            let genotypes: Vec<String> = table.cell(c).iter().map(|g| g.to_string()).collect();
            format!("({})", genotypes.join(","))
        })
        .collect::<Vec<_>>()
        .join(" ")
}
