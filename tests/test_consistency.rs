/// Integration tests for run-to-run consistency and fatal input errors
///
/// These tests ensure that:
/// 1. The final rankings do not depend on the number of nodes, threads or on the kernel
/// 2. The same seed gives the same folds and rankings
/// 3. Malformed inputs abort the run with a descriptive error
///
/// Run with: cargo test --test test_consistency -- --nocapture
use gepistasis::dataset::pack;
use gepistasis::error::EpistasisError;
use gepistasis::experiment::Experiment;
use gepistasis::param::{KernelKind, Param, RankingCriterion};
use gepistasis::run;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::fs;
use std::path::Path;

/// Noisy dataset with a weak interaction between variants 1 and 6
fn write_noisy_dataset(dir: &Path, name: &str) -> String {
    let (affected, unaffected, variants) = (45usize, 55usize, 12usize);
    let mut rng = ChaCha8Rng::seed_from_u64(99);
    let mut rows: Vec<Vec<u8>> = (0..variants)
        .map(|_| (0..affected + unaffected).map(|_| rng.gen_range(0..3u8)).collect())
        .collect();
    for sample in 0..affected {
        if rng.gen_bool(0.6) {
            rows[1][sample] = 2;
            rows[6][sample] = 1;
        }
    }
    let path = dir.join(name);
    fs::write(&path, pack(affected as u32, unaffected as u32, &rows)).unwrap();
    path.display().to_string()
}

fn noisy_params(dir: &Path, tag: &str) -> Param {
    let mut param = Param::default();
    param.general.seed = 1234;
    param.general.display_colorful = false;
    param.general.output_directory = dir.join(tag).display().to_string();
    param.data.dataset = write_noisy_dataset(dir, "noisy.bin");
    param.epistasis.order = 2;
    param.epistasis.stride = 4;
    param.epistasis.num_folds = 5;
    param.epistasis.num_cv_repetitions = 2;
    param.epistasis.max_ranking_size = 8;
    param.epistasis.combinations_per_batch = 3;
    param
}

fn assert_same_results(a: &Experiment, b: &Experiment) {
    assert_eq!(a.repetitions.len(), b.repetitions.len());
    for (ra, rb) in a.repetitions.iter().zip(b.repetitions.iter()) {
        assert_eq!(ra.cv, rb.cv, "folds differ in repetition {}", ra.repetition);
        assert_eq!(ra.ranking, rb.ranking, "rankings differ in repetition {}", ra.repetition);
    }
    assert_eq!(a.consensus, b.consensus);
    assert_eq!(a.consensus_confusion, b.consensus_confusion);
}

#[test]
fn test_one_worker_versus_many_workers() {
    let dir = tempfile::tempdir().unwrap();
    let single = noisy_params(dir.path(), "single");
    let single_exp = run(&single).unwrap();
    assert!(single_exp.repetitions.iter().all(|r| r.ranking.len() == 8));

    let mut threads = noisy_params(dir.path(), "threads");
    threads.general.thread_number = 4;
    assert_same_results(&single_exp, &run(&threads).unwrap());

    let mut nodes = noisy_params(dir.path(), "nodes");
    nodes.distribution.num_nodes = 3;
    nodes.general.thread_number = 2;
    assert_same_results(&single_exp, &run(&nodes).unwrap());
}

#[test]
fn test_more_workers_than_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let reference = run(&noisy_params(dir.path(), "reference")).unwrap();

    // 12 variants, stride 4: only 6 blocks to share
    let mut crowded = noisy_params(dir.path(), "crowded");
    crowded.distribution.num_nodes = 4;
    crowded.general.thread_number = 3;
    assert_same_results(&reference, &run(&crowded).unwrap());
}

#[test]
fn test_kernel_and_block_shape_do_not_change_results() {
    let dir = tempfile::tempdir().unwrap();
    let reference = run(&noisy_params(dir.path(), "bitsliced")).unwrap();

    let mut scalar = noisy_params(dir.path(), "scalar");
    scalar.epistasis.kernel = KernelKind::scalar;
    assert_same_results(&reference, &run(&scalar).unwrap());

    let mut auto_stride = noisy_params(dir.path(), "auto");
    auto_stride.epistasis.stride = 0;
    auto_stride.epistasis.block_operations = 50;
    auto_stride.epistasis.combinations_per_batch = 16;
    assert_same_results(&reference, &run(&auto_stride).unwrap());
}

#[test]
fn test_seed_controls_folds() {
    let dir = tempfile::tempdir().unwrap();
    let a = run(&noisy_params(dir.path(), "a")).unwrap();
    let b = run(&noisy_params(dir.path(), "b")).unwrap();
    assert_same_results(&a, &b);
    assert_ne!(a.repetitions[0].cv, a.repetitions[1].cv);

    let mut other_seed = noisy_params(dir.path(), "c");
    other_seed.general.seed = 4321;
    let c = run(&other_seed).unwrap();
    assert_ne!(a.repetitions[0].cv, c.repetitions[0].cv);
}

#[test]
fn test_consensus_criterion_is_selectable() {
    let dir = tempfile::tempdir().unwrap();
    let mut param = noisy_params(dir.path(), "cva");
    param.epistasis.num_cv_repetitions = 4;
    param.epistasis.ranking_criterion = RankingCriterion::cva;
    let experiment = run(&param).unwrap();

    let consensus = experiment.consensus.unwrap();
    let best_top = experiment
        .repetitions
        .iter()
        .map(|r| r.ranking[0].accuracy)
        .fold(f64::MIN, f64::max);
    assert!(consensus.cva <= best_top + 1e-12);
    assert_eq!(consensus.repetitions, 4);
    assert!(consensus.cvc >= 1);
}

#[test]
fn test_missing_dataset_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut param = noisy_params(dir.path(), "missing");
    param.data.dataset = dir.path().join("absent.bin").display().to_string();
    match run(&param) {
        Err(EpistasisError::FileNotFound { path }) => assert!(path.ends_with("absent.bin")),
        other => panic!("expected FileNotFound, got {:?}", other.map(|e| e.id)),
    }
}

#[test]
fn test_truncated_dataset_reports_sizes() {
    let dir = tempfile::tempdir().unwrap();
    let mut bytes = pack(2, 2, &[vec![0, 1, 2, 0], vec![1, 1, 1, 1]]);
    bytes.truncate(bytes.len() - 3);
    let path = dir.path().join("truncated.bin");
    fs::write(&path, bytes).unwrap();

    let mut param = noisy_params(dir.path(), "truncated");
    param.data.dataset = path.display().to_string();
    let err = run(&param).unwrap_err();
    let msg = err.to_string();
    assert!(matches!(err, EpistasisError::Format { .. }));
    assert!(msg.contains("truncated.bin"), "{}", msg);
    assert!(msg.contains("expected 24 bytes"), "{}", msg);
    assert!(msg.contains("found 21"), "{}", msg);
}

#[test]
fn test_missing_genotype_sentinel_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sentinel.bin");
    fs::write(&path, pack(1, 2, &[vec![0, 1, 2], vec![2, 255, 0]])).unwrap();

    let mut param = noisy_params(dir.path(), "sentinel");
    param.data.dataset = path.display().to_string();
    match run(&param) {
        Err(EpistasisError::InvalidGenotype { variant, sample, value, .. }) => {
            assert_eq!((variant, sample, value), (1, 1, 255))
        }
        other => panic!("expected InvalidGenotype, got {:?}", other.map(|e| e.id)),
    }
}

#[test]
fn test_uncreatable_output_directory_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not_a_dir");
    fs::write(&blocker, b"file").unwrap();

    let mut param = noisy_params(dir.path(), "unused");
    param.general.output_directory = blocker.join("reports").display().to_string();
    assert!(matches!(
        run(&param),
        Err(EpistasisError::OutputDirectory { .. })
    ));
}

#[test]
fn test_invalid_settings_are_config_errors() {
    let dir = tempfile::tempdir().unwrap();

    let mut no_folds = noisy_params(dir.path(), "no_folds");
    no_folds.epistasis.num_folds = 0;
    match run(&no_folds) {
        Err(EpistasisError::Config(msg)) => assert!(msg.contains("num_folds"), "{}", msg),
        other => panic!("expected Config error, got {:?}", other.map(|e| e.id)),
    }

    let mut empty_batch = noisy_params(dir.path(), "empty_batch");
    empty_batch.epistasis.combinations_per_batch = 0;
    match run(&empty_batch) {
        Err(EpistasisError::Config(msg)) => {
            assert!(msg.contains("combinations_per_batch"), "{}", msg)
        }
        other => panic!("expected Config error, got {:?}", other.map(|e| e.id)),
    }

    // rejected before any report is written
    assert!(!dir.path().join("no_folds").exists());
    assert!(!dir.path().join("empty_batch").exists());
}

#[test]
fn test_stride_larger_than_the_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let reference = run(&noisy_params(dir.path(), "reference")).unwrap();

    let mut wide = noisy_params(dir.path(), "wide");
    wide.epistasis.stride = 1_000_000;
    assert_same_results(&reference, &run(&wide).unwrap());
}
