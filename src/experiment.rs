use crate::combination::{all_block_coordinates, auto_stride, binomial, num_blocks, GenotypeTable};
use crate::cv::CV;
use crate::dataset::{DatasetSummary, GenotypeDataset};
use crate::error::{EpistasisError, Result};
use crate::kernel::Workspace;
use crate::model::{format_combination, format_genotypes, ConfusionMatrix, RiskyCombination};
use crate::param::Param;
use crate::ranking::ConsensusModel;
use crate::utils::mean_and_std;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Everything a search needs, owned by one invocation of `run` and released at its end.
pub struct RunContext {
    pub param: Param,
    pub dataset: GenotypeDataset,
    pub table: GenotypeTable,
    pub stride: usize,
    pub num_blocks: usize,
    /// Non-decreasing block coordinates of the whole search, in enumeration order
    pub block_coordinates: Vec<Vec<usize>>,
    /// Worker scratch released by finished workers, reused by later ones
    workspaces: Mutex<Vec<Workspace>>,
}

impl RunContext {
    /// Validates a copy of `param` and prepares the block layout of the search.
    pub fn new(param: &Param, dataset: GenotypeDataset) -> Result<RunContext> {
        let mut param = param.clone();
        crate::param::validate(&mut param)?;
        let epistasis = &param.epistasis;
        let order = epistasis.order;

        let requested = if epistasis.stride > 0 {
            epistasis.stride
        } else {
            auto_stride(epistasis.block_operations, order)
        };
        // one block already spans every variant
        let stride = requested.min(dataset.num_variants().max(1));
        let num_blocks = num_blocks(dataset.num_variants(), stride);
        let block_coordinates = all_block_coordinates(order, num_blocks);

        if order > dataset.num_variants() {
            warn!(
                "order={} exceeds the {} variants of the dataset: no combination to search",
                order,
                dataset.num_variants()
            );
        }
        let smallest_class = dataset.num_affected().min(dataset.num_unaffected());
        if epistasis.num_folds > smallest_class {
            warn!(
                "num_folds={} exceeds the smallest class ({} samples): some folds will lack a class",
                epistasis.num_folds, smallest_class
            );
        }

        info!(
            "{} combinations of order {} in {} blocks (stride {})",
            binomial(dataset.num_variants(), order),
            order,
            block_coordinates.len(),
            stride
        );

        Ok(RunContext {
            param,
            dataset,
            table: GenotypeTable::new(order),
            stride,
            num_blocks,
            block_coordinates,
            workspaces: Mutex::new(Vec::new()),
        })
    }

    pub fn order(&self) -> usize {
        self.table.order()
    }

    fn idle_workspaces(&self) -> MutexGuard<'_, Vec<Workspace>> {
        match self.workspaces.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Hands out an idle workspace set to the folds of `cv`, allocating one only when none is
    /// left. The number of allocations over a run is bounded by the number of concurrent workers.
    pub fn take_workspace(&self, cv: &CV) -> Workspace {
        let idle = self.idle_workspaces().pop();
        match idle {
            Some(mut ws) => {
                ws.prepare(cv);
                ws
            }
            None => {
                let epistasis = &self.param.epistasis;
                Workspace::new(epistasis.kernel, cv, self.order(), epistasis.combinations_per_batch)
            }
        }
    }

    pub fn release_workspace(&self, ws: Workspace) {
        self.idle_workspaces().push(ws);
    }

    pub fn idle_workspace_count(&self) -> usize {
        self.idle_workspaces().len()
    }

    pub fn close(&mut self) {
        self.dataset.close();
        self.block_coordinates.clear();
        self.idle_workspaces().clear();
    }
}

/// Outcome of one cross-validation repetition
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RepetitionResult {
    /// Counted from 1
    pub repetition: usize,
    pub cv: CV,
    /// Merged ranking, best first
    pub ranking: Vec<RiskyCombination>,
    pub report: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Experiment {
    /// Experiment ID, i.e., report prefix and timestamp
    pub id: String,
    pub timestamp: String,
    /// gepistasis version and git hash used
    pub gepistasis_version: String,
    pub parameters: Param,
    pub dataset: DatasetSummary,
    pub repetitions: Vec<RepetitionResult>,
    pub consensus: Option<ConsensusModel>,
    /// Consensus model classifying the whole dataset
    pub consensus_confusion: Option<ConfusionMatrix>,
    pub consensus_score: Option<f64>,
    /// Execution time in seconds
    pub execution_time: f64,
}

impl Experiment {
    pub fn display_results(&self) -> String {
        let table = GenotypeTable::new(self.parameters.epistasis.order);
        let mut text = String::new();
        text.push_str(&format!(
            "\n=============== Experiment {} ===============\n\n",
            self.id
        ));
        text.push_str(&format!("gepistasis version: v{}\n", self.gepistasis_version));
        text.push_str(&format!("Timestamp: {}\n", self.timestamp));
        text.push_str(&format!("Execution time: {:.2}s\n", self.execution_time));
        text.push_str(&format!(
            "Dataset: {} ({} variants, {} affected, {} unaffected) sha256 {}\n",
            self.dataset.path,
            self.dataset.num_variants,
            self.dataset.num_affected,
            self.dataset.num_unaffected,
            self.dataset.fingerprint
        ));
        text.push_str(&format!(
            "Parameters: \x1b[2;97m{:?}\x1b[0m\n",
            &self.parameters.epistasis
        ));
        text.push_str("Experiment results:\n\n");

        let n = self.parameters.general.n_model_to_display;
        for repetition in &self.repetitions {
            text.push_str(&format!(
                "\x1b[1;93mCV repetition #{}\x1b[0m ({} models, report {})\n",
                repetition.repetition,
                repetition.ranking.len(),
                repetition.report
            ));
            for (rank, model) in repetition.ranking.iter().take(n).enumerate() {
                text.push_str(&format!("  #{} {}\n", rank + 1, model.display(&table)));
            }
        }

        let top_accuracies: Vec<f64> = self
            .repetitions
            .iter()
            .filter_map(|r| r.ranking.first().map(|m| m.accuracy))
            .collect();
        if !top_accuracies.is_empty() {
            let (mean, std) = mean_and_std(&top_accuracies);
            text.push_str(&format!(
                "\nTop model accuracy across repetitions: {:.4} ± {:.4}\n",
                mean, std
            ));
        }

        match &self.consensus {
            Some(consensus) => {
                text.push_str(&format!(
                    "\x1b[1;92mBest model ({:?}): ({}) risky {} | CVC {}/{} | CVA {:.4}\x1b[0m\n",
                    self.parameters.epistasis.ranking_criterion,
                    format_combination(&consensus.combination),
                    format_genotypes(&table, &consensus.risky_genotypes),
                    consensus.cvc,
                    consensus.repetitions,
                    consensus.cva
                ));
                if let (Some(cm), Some(score)) = (&self.consensus_confusion, self.consensus_score) {
                    text.push_str(&format!(
                        "Whole dataset: TP {} FN {} FP {} TN {} | {:?} {:.4}\n",
                        cm.tp,
                        cm.fn_count,
                        cm.fp,
                        cm.tn,
                        self.parameters.epistasis.evaluation_function,
                        score
                    ));
                }
            }
            None => text.push_str("No risky combination found in any repetition.\n"),
        }

        text
    }

    /// Saves the experiment in a suitable format based on file extension.
    pub fn save_auto<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        match ext.as_str() {
            "json" => self.save_json(path),
            "bin" | "bincode" => self.save_bincode(path),
            _ => {
                warn!("Unknown format. Saving experiment in bincode.");
                self.save_bincode(path.with_extension("bin"))
            }
        }
    }

    fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    fn save_bincode<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let bytes = bincode::serialize(self)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn load_auto<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        match ext.as_str() {
            "json" => Self::load_json(path),
            "bin" | "bincode" => Self::load_bincode(path),
            _ => Self::load_with_fallback(path),
        }
    }

    fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn load_bincode<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    fn load_with_fallback<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Ok(experiment) = Self::load_bincode(path) {
            return Ok(experiment);
        }

        if let Ok(experiment) = Self::load_json(path) {
            return Ok(experiment);
        }

        Err(EpistasisError::Serialization(format!(
            "Unable to load the experiment {}",
            path.display()
        )))
    }
}
