pub mod combination;
pub mod cv;
pub mod dataset;
pub mod distribution;
pub mod error;
pub mod experiment;
pub mod kernel;
pub mod model;
pub mod param;
pub mod ranking;
pub mod report;
pub mod utils;

use crate::cv::CV;
use crate::dataset::GenotypeDataset;
use crate::error::Result;
use crate::experiment::{Experiment, RepetitionResult, RunContext};
use crate::model::{confusion_per_sample, RiskyCombination};
use crate::param::Param;
use crate::ranking::{merge_fold_rankings, select_consensus};
use chrono::Local;
use log::{debug, info, warn};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

pub fn version() -> String {
    let git_hash = option_env!("GEPISTASIS_GIT_SHA").unwrap_or("unknown");
    format!("{}#{}", env!("CARGO_PKG_VERSION"), git_hash)
}

/// Loads the dataset named in `param` and runs the search.
pub fn run(param: &Param) -> Result<Experiment> {
    let dataset = GenotypeDataset::open(&param.data.dataset)?;
    run_on_dataset(dataset, param)
}

/// Runs every cross-validation repetition on `dataset`, writes one report per repetition and
/// selects the consensus model. Invalid parameters are rejected before any search. The dataset
/// is released before returning.
pub fn run_on_dataset(dataset: GenotypeDataset, param: &Param) -> Result<Experiment> {
    let start = std::time::Instant::now();
    let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();

    let mut ctx = RunContext::new(param, dataset)?;
    let param = ctx.param.clone();
    let colorful = param.general.display_colorful;
    let epistasis = &param.epistasis;

    cinfo!(colorful, "\x1b[2;97m{}\x1b[0m", ctx.dataset);
    let output_directory = report::ensure_output_directory(&param.general.output_directory)?;

    let mut rng = ChaCha8Rng::seed_from_u64(param.general.seed);
    let mut repetitions: Vec<RepetitionResult> = Vec::with_capacity(epistasis.num_cv_repetitions);

    for repetition in 1..=epistasis.num_cv_repetitions {
        cinfo!(
            colorful,
            "\x1b[1;93mCV repetition {}/{}...\x1b[0m",
            repetition,
            epistasis.num_cv_repetitions
        );
        let cv = CV::new(
            ctx.dataset.num_affected(),
            ctx.dataset.num_unaffected(),
            epistasis.num_folds,
            &mut rng,
        );

        let fold_rankings = distribution::search_repetition(&ctx, &cv, repetition)?;
        for (fold, ranking) in fold_rankings.iter().enumerate() {
            debug!("Fold {}: {} models ranked", fold, ranking.len());
        }
        let ranking = merge_fold_rankings(fold_rankings, epistasis.max_ranking_size).into_sorted_vec();

        let report_path = report::report_path(&output_directory, &param.general.report_prefix, repetition);
        report::write_report(&report_path, &ranking, &ctx.table)?;

        match ranking.first() {
            Some(best) => cinfo!(
                colorful,
                "Repetition {} best model: \x1b[1;92m{}\x1b[0m",
                repetition,
                best.display(&ctx.table)
            ),
            None => warn!("Repetition {}: no combination has a high-risk genotype", repetition),
        }

        repetitions.push(RepetitionResult {
            repetition,
            cv,
            ranking,
            report: report_path.display().to_string(),
        });
    }

    let top_models: Vec<RiskyCombination> = repetitions
        .iter()
        .filter_map(|r| r.ranking.first().cloned())
        .collect();
    let consensus = select_consensus(&top_models, epistasis.ranking_criterion);

    let consensus_confusion = consensus.as_ref().map(|c| {
        confusion_per_sample(&ctx.dataset, &c.combination, &c.risky_genotypes, |_| true)
    });
    let consensus_score = consensus_confusion.map(|cm| cm.score(epistasis.evaluation_function));

    if let Some(c) = &consensus {
        cinfo!(
            colorful,
            "\x1b[1;92mConsensus ({:?}): ({}) CVC {}/{} CVA {:.4}\x1b[0m",
            epistasis.ranking_criterion,
            model::format_combination(&c.combination),
            c.cvc,
            c.repetitions,
            c.cva
        );
    }

    let dataset_summary = ctx.dataset.summary();
    ctx.close();

    let exec_time = start.elapsed().as_secs_f64();
    info!("Search completed in {:.2}s", exec_time);

    Ok(Experiment {
        id: format!("{}_{}", param.general.report_prefix, timestamp),
        timestamp,
        gepistasis_version: version(),
        parameters: param.clone(),
        dataset: dataset_summary,
        repetitions,
        consensus,
        consensus_confusion,
        consensus_score,
        execution_time: exec_time,
    })
}
