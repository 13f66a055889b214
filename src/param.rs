use crate::error::{EpistasisError, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum EvaluationSubset {
    training,
    testing,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum RankingCriterion {
    cvc,
    cva,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum EvaluationFunction {
    balanced_accuracy,
    accuracy,
    gamma,
    tau_b,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum KernelKind {
    bitsliced,
    scalar,
}

// Field definitions and associated default values

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Param {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub data: Data,
    #[serde(default)]
    pub epistasis: Epistasis,
    #[serde(default)]
    pub distribution: Distribution,
    #[serde(skip)]
    pub tag: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct General {
    #[serde(default = "seed_default")]
    pub seed: u64,
    #[serde(default = "one_default")]
    pub thread_number: usize,
    #[serde(default = "empty_string")]
    pub log_base: String,
    #[serde(default = "log_suffix_default")]
    pub log_suffix: String,
    #[serde(default = "log_level_default")]
    pub log_level: String,
    #[serde(default = "true_default")]
    pub display_colorful: bool,
    #[serde(default = "output_directory_default")]
    pub output_directory: String,
    #[serde(default = "report_prefix_default")]
    pub report_prefix: String,
    #[serde(default = "empty_string")]
    pub save_exp: String,
    #[serde(default = "n_model_to_display_default")]
    pub n_model_to_display: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Data {
    #[serde(default = "empty_string")]
    pub dataset: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Epistasis {
    #[serde(default = "order_default")]
    pub order: usize,
    /// 0 lets the block stride follow from `block_operations`
    #[serde(default = "uzero_default")]
    pub stride: usize,
    #[serde(default = "block_operations_default")]
    pub block_operations: usize,
    #[serde(default = "num_folds_default")]
    pub num_folds: usize,
    #[serde(default = "one_default")]
    pub num_cv_repetitions: usize,
    #[serde(default = "max_ranking_size_default")]
    pub max_ranking_size: usize,
    #[serde(default = "evaluation_subset_default")]
    pub evaluation_subset: EvaluationSubset,
    #[serde(default = "ranking_criterion_default")]
    pub ranking_criterion: RankingCriterion,
    #[serde(default = "evaluation_function_default")]
    pub evaluation_function: EvaluationFunction,
    #[serde(default = "combinations_per_batch_default")]
    pub combinations_per_batch: usize,
    #[serde(default = "kernel_default")]
    pub kernel: KernelKind,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Distribution {
    #[serde(default = "one_default")]
    pub num_nodes: usize,
}

// Default section definitions

impl Default for General {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for Data {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for Epistasis {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for Distribution {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for Param {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Param {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Parses a parameter file without checking it.
pub fn load(param_file: &str) -> Result<Param> {
    let param_file_reader = File::open(param_file).map_err(|e| {
        EpistasisError::config(format!("Can't open parameter file {}: {}", param_file, e))
    })?;
    let param_reader = BufReader::new(param_file_reader);

    let mut config: Param = serde_yaml::from_reader(param_reader)
        .map_err(|e| EpistasisError::config(format!("Can't parse {}: {}", param_file, e)))?;

    Ok(config)
}

pub fn get(param_file: &str) -> Result<Param> {
    let mut config = load(param_file)?;
    validate(&mut config)?;
    Ok(config)
}

pub fn validate(param: &mut Param) -> Result<()> {
    if !param.general.log_base.is_empty() {
        param.general.display_colorful = false;
    }

    if param.general.thread_number == 0 {
        return Err(EpistasisError::config("thread_number must be at least 1."));
    }

    if param.distribution.num_nodes == 0 {
        return Err(EpistasisError::config("num_nodes must be at least 1."));
    }

    validate_epistasis(&param.epistasis)?;

    if param.data.dataset.is_empty() {
        warn!("No dataset given (data.dataset is empty): the run will fail to load anything.");
    }

    Ok(())
}

fn validate_epistasis(epistasis: &Epistasis) -> Result<()> {
    if epistasis.order == 0 {
        return Err(EpistasisError::config(
            "Invalid order=0. A combination holds at least one variant.",
        ));
    }

    if epistasis.num_folds < 2 {
        return Err(EpistasisError::config(format!(
            "Invalid num_folds={}. Cross-validation needs at least 2 folds.",
            epistasis.num_folds
        )));
    }

    if epistasis.num_cv_repetitions == 0 {
        return Err(EpistasisError::config("num_cv_repetitions must be at least 1."));
    }

    if epistasis.max_ranking_size == 0 {
        return Err(EpistasisError::config("max_ranking_size must be at least 1."));
    }

    if epistasis.combinations_per_batch == 0 {
        return Err(EpistasisError::config(
            "combinations_per_batch must be at least 1.",
        ));
    }

    if epistasis.stride == 0 && epistasis.block_operations == 0 {
        return Err(EpistasisError::config(
            "Either stride or block_operations must be positive.",
        ));
    }

    if epistasis.order > 8 {
        warn!(
            "order={} means 3^{} = {} genotype cells per combination: expect a very slow search.",
            epistasis.order,
            epistasis.order,
            3usize.pow(epistasis.order as u32)
        );
    }

    if epistasis.evaluation_subset == EvaluationSubset::training {
        warn!("Models are scored on their own training samples: accuracies will be optimistic.");
    }

    Ok(())
}

// Default value definitions

fn seed_default() -> u64 {
    4815162342
}
fn empty_string() -> String {
    "".to_string()
}
fn log_suffix_default() -> String {
    "log".to_string()
}
fn log_level_default() -> String {
    "info".to_string()
}
fn output_directory_default() -> String {
    ".".to_string()
}
fn report_prefix_default() -> String {
    "gepistasis".to_string()
}
fn n_model_to_display_default() -> usize {
    10
}
fn true_default() -> bool {
    true
}
fn uzero_default() -> usize {
    0
}
fn one_default() -> usize {
    1
}
fn order_default() -> usize {
    2
}
fn block_operations_default() -> usize {
    100
}
fn num_folds_default() -> usize {
    10
}
fn max_ranking_size_default() -> usize {
    10
}
fn evaluation_subset_default() -> EvaluationSubset {
    EvaluationSubset::testing
}
fn ranking_criterion_default() -> RankingCriterion {
    RankingCriterion::cvc
}
fn evaluation_function_default() -> EvaluationFunction {
    EvaluationFunction::balanced_accuracy
}
fn combinations_per_batch_default() -> usize {
    16
}
fn kernel_default() -> KernelKind {
    KernelKind::bitsliced
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_come_from_serde() {
        let param = Param::default();
        assert_eq!(param.epistasis.order, 2);
        assert_eq!(param.epistasis.num_folds, 10);
        assert_eq!(param.epistasis.evaluation_subset, EvaluationSubset::testing);
        assert_eq!(param.epistasis.ranking_criterion, RankingCriterion::cvc);
        assert_eq!(param.epistasis.kernel, KernelKind::bitsliced);
        assert_eq!(param.distribution.num_nodes, 1);
        assert_eq!(param.general.thread_number, 1);
    }

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let yaml = "epistasis:\n  order: 3\n  ranking_criterion: cva\ndata:\n  dataset: data.bin\n";
        let mut param: Param = serde_yaml::from_str(yaml).unwrap();
        validate(&mut param).unwrap();
        assert_eq!(param.epistasis.order, 3);
        assert_eq!(param.epistasis.ranking_criterion, RankingCriterion::cva);
        assert_eq!(param.epistasis.max_ranking_size, 10);
        assert_eq!(param.data.dataset, "data.bin");
    }

    #[test]
    fn test_validate_rejects_single_fold() {
        let mut param = Param::default();
        param.epistasis.num_folds = 1;
        assert!(matches!(validate(&mut param), Err(EpistasisError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_order_and_zero_nodes() {
        let mut param = Param::default();
        param.epistasis.order = 0;
        assert!(validate(&mut param).is_err());

        let mut param = Param::default();
        param.distribution.num_nodes = 0;
        assert!(validate(&mut param).is_err());
    }

    #[test]
    fn test_log_base_disables_colors() {
        let mut param = Param::default();
        param.general.log_base = "run".to_string();
        validate(&mut param).unwrap();
        assert!(!param.general.display_colorful);
    }

    #[test]
    fn test_load_parses_and_get_checks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("param.yaml");
        std::fs::write(&path, "epistasis:\n  num_folds: 0\n").unwrap();
        let path = path.to_str().unwrap();

        assert_eq!(load(path).unwrap().epistasis.num_folds, 0);
        assert!(matches!(get(path), Err(EpistasisError::Config(_))));
    }

    #[test]
    fn test_get_reports_missing_file() {
        let err = get("/nonexistent/param.yaml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/param.yaml"));
    }
}
