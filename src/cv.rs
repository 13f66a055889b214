use log::{debug, warn};
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// One cross-validation fold: the samples it holds out.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Fold {
    pub id: usize,
    /// Sorted sample indices (affected samples are 0..num_affected)
    pub members: Vec<usize>,
    pub affected: usize,
    pub unaffected: usize,
}

impl Fold {
    pub fn total(&self) -> usize {
        self.affected + self.unaffected
    }

    /// (total, affected, unaffected) held out by this fold
    pub fn sizes(&self) -> (usize, usize, usize) {
        (self.total(), self.affected, self.unaffected)
    }
}

/// This class implements a stratified k-fold partition of the samples of one CV repetition.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CV {
    pub folds: Vec<Fold>,
    pub num_affected: usize,
    pub num_unaffected: usize,
}

impl CV {
    /// Shuffles affected and unaffected samples separately, then deals them round-robin, the
    /// unaffected pool continuing where the affected one stopped. Fold totals differ by at most
    /// one and each class is spread as evenly as it can be.
    pub fn new(num_affected: usize, num_unaffected: usize, num_folds: usize, rng: &mut ChaCha8Rng) -> CV {
        let mut affected: Vec<usize> = (0..num_affected).collect();
        let mut unaffected: Vec<usize> = (num_affected..num_affected + num_unaffected).collect();
        affected.shuffle(rng);
        unaffected.shuffle(rng);

        let mut folds: Vec<Fold> = (0..num_folds)
            .map(|id| Fold {
                id,
                members: Vec::new(),
                affected: 0,
                unaffected: 0,
            })
            .collect();

        for (position, sample) in affected.into_iter().enumerate() {
            let fold = &mut folds[position % num_folds];
            fold.members.push(sample);
            fold.affected += 1;
        }
        for (position, sample) in unaffected.into_iter().enumerate() {
            let fold = &mut folds[(num_affected + position) % num_folds];
            fold.members.push(sample);
            fold.unaffected += 1;
        }

        for fold in folds.iter_mut() {
            fold.members.sort_unstable();
            debug!(
                "Fold {}: {} samples ({} affected, {} unaffected)",
                fold.id,
                fold.total(),
                fold.affected,
                fold.unaffected
            );
            if fold.affected == 0 || fold.unaffected == 0 {
                warn!(
                    "Fold {} holds {} affected and {} unaffected samples: one class is missing from its testing set",
                    fold.id, fold.affected, fold.unaffected
                );
            }
        }

        CV {
            folds,
            num_affected,
            num_unaffected,
        }
    }

    pub fn num_folds(&self) -> usize {
        self.folds.len()
    }

    pub fn num_samples(&self) -> usize {
        self.num_affected + self.num_unaffected
    }

    /// (total, affected, unaffected) of the training set of a fold
    pub fn training_sizes(&self, fold: usize) -> (usize, usize, usize) {
        let f = &self.folds[fold];
        (
            self.num_samples() - f.total(),
            self.num_affected - f.affected,
            self.num_unaffected - f.unaffected,
        )
    }

    pub fn testing_sizes(&self, fold: usize) -> (usize, usize, usize) {
        self.folds[fold].sizes()
    }

    /// Fold holding out each sample
    pub fn assignment(&self) -> Vec<usize> {
        let mut assignment = vec![0; self.num_samples()];
        for fold in &self.folds {
            for &sample in &fold.members {
                assignment[sample] = fold.id;
            }
        }
        assignment
    }

    /// Per-sample membership mask of a fold
    pub fn mask(&self, fold: usize) -> Vec<bool> {
        let mut mask = vec![false; self.num_samples()];
        for &sample in &self.folds[fold].members {
            mask[sample] = true;
        }
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::collections::HashSet;

    impl CV {
        pub fn test() -> CV {
            let mut rng = ChaCha8Rng::seed_from_u64(42);
            CV::new(8, 12, 8, &mut rng)
        }
    }

    fn check_partition(cv: &CV) {
        let total: usize = cv.folds.iter().map(|f| f.total()).sum();
        assert_eq!(total, cv.num_samples());

        let mut seen = HashSet::new();
        for fold in &cv.folds {
            assert_eq!(fold.members.len(), fold.total());
            assert!(fold.members.windows(2).all(|w| w[0] < w[1]));
            let affected = fold.members.iter().filter(|&&s| s < cv.num_affected).count();
            assert_eq!(affected, fold.affected);
            assert_eq!(fold.members.len() - affected, fold.unaffected);
            for &s in &fold.members {
                assert!(seen.insert(s), "sample {} in two folds", s);
            }
        }
        assert_eq!(seen.len(), cv.num_samples());

        let max = cv.folds.iter().map(|f| f.total()).max().unwrap();
        let min = cv.folds.iter().map(|f| f.total()).min().unwrap();
        assert!(max - min <= 1);
    }

    #[test]
    fn test_eight_affected_twelve_unaffected_eight_folds() {
        let cv = CV::test();
        check_partition(&cv);
        let mut sizes: Vec<(usize, usize, usize)> = cv.folds.iter().map(|f| f.sizes()).collect();
        sizes.sort();
        assert_eq!(
            sizes,
            vec![
                (2, 1, 1),
                (2, 1, 1),
                (2, 1, 1),
                (2, 1, 1),
                (3, 1, 2),
                (3, 1, 2),
                (3, 1, 2),
                (3, 1, 2)
            ]
        );
    }

    #[test]
    fn test_partition_properties_over_grid() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for a in 0..15 {
            for u in 0..15 {
                for k in 2..7 {
                    let cv = CV::new(a, u, k, &mut rng);
                    assert_eq!(cv.num_folds(), k);
                    check_partition(&cv);
                    let max_a = cv.folds.iter().map(|f| f.affected).max().unwrap();
                    let min_a = cv.folds.iter().map(|f| f.affected).min().unwrap();
                    assert!(max_a - min_a <= 1);
                }
            }
        }
    }

    #[test]
    fn test_training_sizes_complement_fold() {
        let cv = CV::test();
        for i in 0..cv.num_folds() {
            let (t, a, u) = cv.training_sizes(i);
            let (ft, fa, fu) = cv.testing_sizes(i);
            assert_eq!(t + ft, 20);
            assert_eq!(a + fa, 8);
            assert_eq!(u + fu, 12);
        }
    }

    #[test]
    fn test_assignment_and_mask_agree() {
        let cv = CV::test();
        let assignment = cv.assignment();
        for fold in 0..cv.num_folds() {
            let mask = cv.mask(fold);
            for sample in 0..cv.num_samples() {
                assert_eq!(mask[sample], assignment[sample] == fold);
            }
        }
    }

    #[test]
    fn test_same_seed_same_folds_new_draw_differs() {
        let mut rng1 = ChaCha8Rng::seed_from_u64(42);
        let mut rng2 = ChaCha8Rng::seed_from_u64(42);
        let first = CV::new(30, 30, 5, &mut rng1);
        assert_eq!(first, CV::new(30, 30, 5, &mut rng2));
        let second = CV::new(30, 30, 5, &mut rng1);
        assert_ne!(first, second);
    }
}
