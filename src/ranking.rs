use crate::model::RiskyCombination;
use crate::param::RankingCriterion;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};

/// Total order on models, greater meaning better: higher accuracy, then higher cv count,
/// then the lexicographically smaller combination.
pub fn compare_models(a: &RiskyCombination, b: &RiskyCombination) -> Ordering {
    a.accuracy
        .total_cmp(&b.accuracy)
        .then(a.cv_count.cmp(&b.cv_count))
        .then_with(|| b.combination.cmp(&a.combination))
}

#[derive(Clone, Debug)]
struct Ranked(RiskyCombination);

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        compare_models(&self.0, &other.0) == Ordering::Equal
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_models(&self.0, &other.0)
    }
}

/// What happened to a model offered to a full ranking
#[derive(Debug, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    /// The model went in and pushed out the previous worst one
    Evicted(RiskyCombination),
    /// The model did not beat the worst one and is handed back
    Rejected(RiskyCombination),
}

/// Bounded collection keeping the best `capacity` models offered to it.
///
/// A min-heap on the model order: the root is the model to evict next. A full ranking only
/// accepts a model strictly better than its root.
#[derive(Clone, Debug)]
pub struct Ranking {
    capacity: usize,
    heap: BinaryHeap<Reverse<Ranked>>,
}

impl Ranking {
    pub fn new(capacity: usize) -> Ranking {
        Ranking {
            capacity,
            heap: BinaryHeap::with_capacity(capacity.min(1 << 16) + 1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn worst(&self) -> Option<&RiskyCombination> {
        self.heap.peek().map(|r| &r.0 .0)
    }

    /// Whether a model with this accuracy and combination would get in (cv count 1).
    /// Lets callers skip building models that would be rejected anyway.
    pub fn accepts(&self, accuracy: f64, combination: &[usize]) -> bool {
        if self.heap.len() < self.capacity {
            return true;
        }
        match self.worst() {
            Some(worst) => accuracy
                .total_cmp(&worst.accuracy)
                .then(1usize.cmp(&worst.cv_count))
                .then_with(|| worst.combination.as_slice().cmp(combination))
                .is_gt(),
            None => false,
        }
    }

    pub fn insert(&mut self, model: RiskyCombination) -> InsertOutcome {
        if self.capacity == 0 {
            return InsertOutcome::Rejected(model);
        }
        if self.heap.len() < self.capacity {
            self.heap.push(Reverse(Ranked(model)));
            return InsertOutcome::Inserted;
        }
        let better = match self.heap.peek() {
            Some(Reverse(worst)) => compare_models(&model, &worst.0).is_gt(),
            None => true,
        };
        if !better {
            return InsertOutcome::Rejected(model);
        }
        let evicted = self.heap.pop().map(|Reverse(Ranked(m))| m);
        self.heap.push(Reverse(Ranked(model)));
        match evicted {
            Some(m) => InsertOutcome::Evicted(m),
            None => InsertOutcome::Inserted,
        }
    }

    /// Offers every model of `other` to this ranking
    pub fn merge(&mut self, other: Ranking) {
        for Reverse(Ranked(model)) in other.heap.into_vec() {
            self.insert(model);
        }
    }

    /// Best first
    pub fn into_sorted_vec(self) -> Vec<RiskyCombination> {
        // ascending Reverse order is descending model order
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(Ranked(m))| m)
            .collect()
    }

    pub fn to_sorted_vec(&self) -> Vec<RiskyCombination> {
        self.clone().into_sorted_vec()
    }
}

/// Merges the per-fold rankings of one repetition.
///
/// Models of the same combination have their accuracies summed and their occurrences
/// counted; the summed accuracy is divided by the number of folds, so a combination missing
/// from a fold's ranking scores 0 there. The risky cells come from the lowest fold ranking the
/// combination. The result is bounded by `capacity`.
pub fn merge_fold_rankings(fold_rankings: Vec<Ranking>, capacity: usize) -> Ranking {
    let num_folds = fold_rankings.len().max(1);
    let mut merged: BTreeMap<Vec<usize>, RiskyCombination> = BTreeMap::new();

    for ranking in fold_rankings {
        for model in ranking.into_sorted_vec() {
            match merged.get_mut(&model.combination) {
                Some(entry) => {
                    entry.accuracy += model.accuracy;
                    entry.cv_count += model.cv_count;
                }
                None => {
                    merged.insert(model.combination.clone(), model);
                }
            }
        }
    }

    let mut ranking = Ranking::new(capacity);
    for (_, mut model) in merged {
        model.accuracy /= num_folds as f64;
        ranking.insert(model);
    }
    ranking
}

/// The model retained across repetitions.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConsensusModel {
    pub combination: Vec<usize>,
    pub risky_genotypes: Vec<usize>,
    /// Number of repetitions where this combination ranked first
    pub cvc: usize,
    /// Mean accuracy over those repetitions
    pub cva: f64,
    pub repetitions: usize,
}

/// Tallies the top model of each repetition and picks the consensus.
///
/// CVC prefers the highest tally, then the highest CVA; CVA prefers the highest CVA, then the
/// highest tally. Remaining ties go to the smaller combination.
pub fn select_consensus(
    top_models: &[RiskyCombination],
    criterion: RankingCriterion,
) -> Option<ConsensusModel> {
    let mut tally: BTreeMap<&[usize], (usize, f64, &[usize])> = BTreeMap::new();
    for model in top_models {
        let entry = tally
            .entry(model.combination.as_slice())
            .or_insert((0, 0.0, model.risky_genotypes.as_slice()));
        entry.0 += 1;
        entry.1 += model.accuracy;
    }

    let candidates: Vec<ConsensusModel> = tally
        .into_iter()
        .map(|(combination, (count, sum, risky))| ConsensusModel {
            combination: combination.to_vec(),
            risky_genotypes: risky.to_vec(),
            cvc: count,
            cva: sum / count as f64,
            repetitions: top_models.len(),
        })
        .collect();

    // BTreeMap order makes the first maximum the smaller combination
    candidates.into_iter().reduce(|best, c| {
        let ord = match criterion {
            RankingCriterion::cvc => c.cvc.cmp(&best.cvc).then(c.cva.total_cmp(&best.cva)),
            RankingCriterion::cva => c.cva.total_cmp(&best.cva).then(c.cvc.cmp(&best.cvc)),
        };
        if ord.is_gt() {
            c
        } else {
            best
        }
    })
}
