//! Counting kernels: for each combination of a batch, the number of affected and unaffected
//! samples falling in every joint genotype cell, split by fold membership.
//!
//! `BitslicedKernel` keeps one bitmask per (variant, genotype) with affected and unaffected
//! samples in separate word ranges, so a cell count is a chain of ANDs and a popcount.
//! `ScalarKernel` walks the genotype bytes sample by sample and serves as the portable
//! reference. Both write into the same `BatchCounts` layout.

use crate::combination::GenotypeTable;
use crate::cv::CV;
use crate::dataset::GenotypeDataset;
use crate::param::KernelKind;

/// Dense row-major 2D buffer addressed by (row, column).
#[derive(Clone, Debug, PartialEq)]
pub struct Grid<T> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

impl<T: Copy + Default> Grid<T> {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![T::default(); rows * cols],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Reshapes without shrinking the allocation; contents are reset
    pub fn reshape(&mut self, rows: usize, cols: usize) {
        self.rows = rows;
        self.cols = cols;
        self.data.clear();
        self.data.resize(rows * cols, T::default());
    }

    pub fn row(&self, r: usize) -> &[T] {
        assert!(r < self.rows, "row {} out of {}", r, self.rows);
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn row_mut(&mut self, r: usize) -> &mut [T] {
        assert!(r < self.rows, "row {} out of {}", r, self.rows);
        &mut self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn get(&self, r: usize, c: usize) -> T {
        self.row(r)[c]
    }

    pub fn get_mut(&mut self, r: usize, c: usize) -> &mut T {
        &mut self.row_mut(r)[c]
    }

    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }
}

/// Cell counts of a batch of combinations.
///
/// Totals are indexed by (slot, cell); testing and training counts by
/// (slot * num_folds + fold, cell).
#[derive(Clone, Debug)]
pub struct BatchCounts {
    num_folds: usize,
    num_cells: usize,
    len: usize,
    total_affected: Grid<u32>,
    total_unaffected: Grid<u32>,
    testing_affected: Grid<u32>,
    testing_unaffected: Grid<u32>,
    training_affected: Grid<u32>,
    training_unaffected: Grid<u32>,
}

impl BatchCounts {
    pub fn new(capacity: usize, num_folds: usize, num_cells: usize) -> Self {
        Self {
            num_folds,
            num_cells,
            len: 0,
            total_affected: Grid::new(capacity, num_cells),
            total_unaffected: Grid::new(capacity, num_cells),
            testing_affected: Grid::new(capacity * num_folds, num_cells),
            testing_unaffected: Grid::new(capacity * num_folds, num_cells),
            training_affected: Grid::new(capacity * num_folds, num_cells),
            training_unaffected: Grid::new(capacity * num_folds, num_cells),
        }
    }

    pub fn capacity(&self) -> usize {
        self.total_affected.rows()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn num_folds(&self) -> usize {
        self.num_folds
    }

    pub fn num_cells(&self) -> usize {
        self.num_cells
    }

    /// Zeroes the counts before a new batch of `len` combinations
    fn begin(&mut self, len: usize) {
        assert!(
            len <= self.capacity(),
            "batch of {} combinations exceeds capacity {}",
            len,
            self.capacity()
        );
        self.len = len;
        self.total_affected.fill(0);
        self.total_unaffected.fill(0);
        self.testing_affected.fill(0);
        self.testing_unaffected.fill(0);
    }

    fn fold_row(&self, slot: usize, fold: usize) -> usize {
        slot * self.num_folds + fold
    }

    /// Training counts are what the fold does not hold out
    fn derive_training(&mut self, slot: usize) {
        for fold in 0..self.num_folds {
            let r = self.fold_row(slot, fold);
            for cell in 0..self.num_cells {
                *self.training_affected.get_mut(r, cell) =
                    self.total_affected.get(slot, cell) - self.testing_affected.get(r, cell);
                *self.training_unaffected.get_mut(r, cell) =
                    self.total_unaffected.get(slot, cell) - self.testing_unaffected.get(r, cell);
            }
        }
    }

    /// (affected, unaffected) per cell, training samples of `fold`
    pub fn training(&self, slot: usize, fold: usize) -> (&[u32], &[u32]) {
        let r = self.fold_row(slot, fold);
        (self.training_affected.row(r), self.training_unaffected.row(r))
    }

    /// (affected, unaffected) per cell, samples held out by `fold`
    pub fn testing(&self, slot: usize, fold: usize) -> (&[u32], &[u32]) {
        let r = self.fold_row(slot, fold);
        (self.testing_affected.row(r), self.testing_unaffected.row(r))
    }

    pub fn totals(&self, slot: usize) -> (&[u32], &[u32]) {
        (self.total_affected.row(slot), self.total_unaffected.row(slot))
    }
}

pub trait CountingKernel: Send {
    fn name(&self) -> &'static str;

    /// Takes the fold membership of a new repetition.
    fn assign_folds(&mut self, cv: &CV);

    /// Prepares the genotype rows of every variant covered by `block`.
    fn load_block(&mut self, dataset: &GenotypeDataset, block: &[usize], stride: usize);

    /// Counts each combination of `batch` (flat, `order` indices per combination, every member
    /// inside the loaded block) into the matching slot of `counts`.
    fn count_batch(&mut self, dataset: &GenotypeDataset, batch: &[usize], counts: &mut BatchCounts);
}

pub fn build_kernel(kind: KernelKind, cv: &CV, order: usize) -> Box<dyn CountingKernel> {
    match kind {
        KernelKind::bitsliced => Box::new(BitslicedKernel::new(cv, order)),
        KernelKind::scalar => Box::new(ScalarKernel::new(cv, order)),
    }
}

pub struct BitslicedKernel {
    table: GenotypeTable,
    num_affected: usize,
    affected_words: usize,
    words: usize,
    /// One row per fold
    fold_masks: Grid<u64>,
    /// Row (slot_rows[slot] + variant - slot_first[slot]) * 3 + genotype, slot being the
    /// block's position in `block_ids`
    variant_masks: Grid<u64>,
    block_ids: Vec<usize>,
    dim_slots: Vec<usize>,
    /// First variant of each loaded block
    slot_first: Vec<usize>,
    /// Variants of the blocks loaded before each slot
    slot_rows: Vec<usize>,
    bases: Vec<usize>,
    intersection: Vec<u64>,
}

impl BitslicedKernel {
    pub fn new(cv: &CV, order: usize) -> Self {
        let affected_words = cv.num_affected.div_ceil(64);
        let words = affected_words + cv.num_unaffected.div_ceil(64);

        let mut kernel = Self {
            table: GenotypeTable::new(order),
            num_affected: cv.num_affected,
            affected_words,
            words,
            fold_masks: Grid::new(cv.num_folds(), words),
            variant_masks: Grid::new(0, words),
            block_ids: Vec::with_capacity(order),
            dim_slots: vec![0; order],
            slot_first: Vec::with_capacity(order),
            slot_rows: Vec::with_capacity(order),
            bases: Vec::with_capacity(order),
            intersection: vec![0; words],
        };
        kernel.assign_folds(cv);
        kernel
    }

    fn bit_position(&self, sample: usize) -> (usize, u64) {
        if sample < self.num_affected {
            (sample / 64, 1u64 << (sample % 64))
        } else {
            let s = sample - self.num_affected;
            (self.affected_words + s / 64, 1u64 << (s % 64))
        }
    }
}

fn popcount(words: &[u64]) -> u32 {
    words.iter().map(|w| w.count_ones()).sum()
}

fn popcount_and(a: &[u64], b: &[u64]) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x & y).count_ones()).sum()
}

impl CountingKernel for BitslicedKernel {
    fn name(&self) -> &'static str {
        "bitsliced"
    }

    fn assign_folds(&mut self, cv: &CV) {
        self.fold_masks.reshape(cv.num_folds(), self.words);
        for fold in &cv.folds {
            for &sample in &fold.members {
                let (w, bit) = self.bit_position(sample);
                self.fold_masks.row_mut(fold.id)[w] |= bit;
            }
        }
    }

    fn load_block(&mut self, dataset: &GenotypeDataset, block: &[usize], stride: usize) {
        self.block_ids.clear();
        for &b in block {
            if !self.block_ids.contains(&b) {
                self.block_ids.push(b);
            }
        }
        for (j, b) in block.iter().enumerate() {
            self.dim_slots[j] = self.block_ids.iter().position(|id| id == b).unwrap_or(0);
        }

        // a block never holds more rows than the variants it actually covers
        let num_variants = dataset.num_variants();
        self.slot_first.clear();
        self.slot_rows.clear();
        let mut rows = 0;
        for &b in &self.block_ids {
            let first = b.saturating_mul(stride).min(num_variants);
            self.slot_first.push(first);
            self.slot_rows.push(rows);
            rows += stride.min(num_variants - first);
        }

        self.variant_masks.reshape(rows * 3, self.words);
        for slot in 0..self.block_ids.len() {
            let first = self.slot_first[slot];
            for variant in first..(first + stride.min(num_variants - first)) {
                let base = (self.slot_rows[slot] + variant - first) * 3;
                for (sample, &g) in dataset.row(variant).iter().enumerate() {
                    let (w, bit) = self.bit_position(sample);
                    self.variant_masks.row_mut(base + g as usize)[w] |= bit;
                }
            }
        }
    }

    fn count_batch(&mut self, _dataset: &GenotypeDataset, batch: &[usize], counts: &mut BatchCounts) {
        let order = self.table.order();
        let aw = self.affected_words;
        counts.begin(batch.len() / order);

        for (slot, combination) in batch.chunks_exact(order).enumerate() {
            self.bases.clear();
            for (j, &variant) in combination.iter().enumerate() {
                let s = self.dim_slots[j];
                self.bases
                    .push((self.slot_rows[s] + variant - self.slot_first[s]) * 3);
            }

            for cell in 0..self.table.len() {
                let genotypes = self.table.cell(cell);
                self.intersection
                    .copy_from_slice(self.variant_masks.row(self.bases[0] + genotypes[0] as usize));
                for j in 1..order {
                    let mask = self.variant_masks.row(self.bases[j] + genotypes[j] as usize);
                    for (x, m) in self.intersection.iter_mut().zip(mask) {
                        *x &= m;
                    }
                }

                let a = popcount(&self.intersection[..aw]);
                let u = popcount(&self.intersection[aw..]);
                *counts.total_affected.get_mut(slot, cell) = a;
                *counts.total_unaffected.get_mut(slot, cell) = u;
                if a + u == 0 {
                    continue;
                }

                for fold in 0..counts.num_folds {
                    let fm = self.fold_masks.row(fold);
                    let r = counts.fold_row(slot, fold);
                    *counts.testing_affected.get_mut(r, cell) =
                        popcount_and(&self.intersection[..aw], &fm[..aw]);
                    *counts.testing_unaffected.get_mut(r, cell) =
                        popcount_and(&self.intersection[aw..], &fm[aw..]);
                }
            }
            counts.derive_training(slot);
        }
    }
}

pub struct ScalarKernel {
    order: usize,
    num_cells: usize,
    num_affected: usize,
    assignment: Vec<usize>,
    cells: Vec<usize>,
}

impl ScalarKernel {
    pub fn new(cv: &CV, order: usize) -> Self {
        Self {
            order,
            num_cells: 3usize.pow(order as u32),
            num_affected: cv.num_affected,
            assignment: cv.assignment(),
            cells: vec![0; cv.num_samples()],
        }
    }
}

impl CountingKernel for ScalarKernel {
    fn name(&self) -> &'static str {
        "scalar"
    }

    fn assign_folds(&mut self, cv: &CV) {
        self.assignment.clear();
        self.assignment.extend(cv.assignment());
    }

    // Rows are read straight from the dataset in count_batch
    fn load_block(&mut self, _dataset: &GenotypeDataset, _block: &[usize], _stride: usize) {}

    fn count_batch(&mut self, dataset: &GenotypeDataset, batch: &[usize], counts: &mut BatchCounts) {
        counts.begin(batch.len() / self.order);
        debug_assert_eq!(counts.num_cells, self.num_cells);

        for (slot, combination) in batch.chunks_exact(self.order).enumerate() {
            self.cells.fill(0);
            for &variant in combination {
                for (c, &g) in self.cells.iter_mut().zip(dataset.row(variant)) {
                    *c = *c * 3 + g as usize;
                }
            }

            for (sample, &cell) in self.cells.iter().enumerate() {
                let r = counts.fold_row(slot, self.assignment[sample]);
                if sample < self.num_affected {
                    *counts.total_affected.get_mut(slot, cell) += 1;
                    *counts.testing_affected.get_mut(r, cell) += 1;
                } else {
                    *counts.total_unaffected.get_mut(slot, cell) += 1;
                    *counts.testing_unaffected.get_mut(r, cell) += 1;
                }
            }
            counts.derive_training(slot);
        }
    }
}

/// Scratch owned by one worker at a time. Allocated once per run and handed the folds of each
/// repetition with `prepare`.
pub struct Workspace {
    pub kernel: Box<dyn CountingKernel>,
    pub counts: BatchCounts,
    /// Flat combinations of the current batch
    pub batch: Vec<usize>,
    pub risky: Vec<usize>,
    pub batch_size: usize,
}

impl Workspace {
    pub fn new(kind: KernelKind, cv: &CV, order: usize, batch_size: usize) -> Self {
        let num_cells = 3usize.pow(order as u32);
        Self {
            kernel: build_kernel(kind, cv, order),
            counts: BatchCounts::new(batch_size, cv.num_folds(), num_cells),
            batch: Vec::with_capacity(batch_size * order),
            risky: Vec::with_capacity(num_cells),
            batch_size,
        }
    }

    /// Switches to the folds of `cv`, keeping every buffer.
    pub fn prepare(&mut self, cv: &CV) {
        self.kernel.assign_folds(cv);
        self.batch.clear();
        self.risky.clear();
    }

    pub fn batch_is_full(&self, order: usize) -> bool {
        self.batch.len() >= self.batch_size * order
    }

    /// Counts the pending batch and leaves the combinations in place for evaluation
    pub fn count(&mut self, dataset: &GenotypeDataset) {
        self.kernel.count_batch(dataset, &self.batch, &mut self.counts);
    }
}
