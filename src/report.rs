use crate::combination::GenotypeTable;
use crate::error::{EpistasisError, Result};
use crate::model::{format_combination, format_genotypes, RiskyCombination};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// One line of a repetition report
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReportRow {
    pub rank: usize,
    /// Variant indices, comma separated
    pub combination: String,
    /// Risky genotype tuples, e.g. `(2,2) (0,1)`
    pub risky_genotypes: String,
    pub cv_count: usize,
    pub accuracy: f64,
}

pub fn ensure_output_directory(directory: &str) -> Result<PathBuf> {
    let path = PathBuf::from(directory);
    fs::create_dir_all(&path).map_err(|source| EpistasisError::OutputDirectory {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

/// `<directory>/<prefix>.cv<repetition>.epi`, repetitions counted from 1
pub fn report_path(directory: &Path, prefix: &str, repetition: usize) -> PathBuf {
    directory.join(format!("{}.cv{}.epi", prefix, repetition))
}

/// Writes a ranking (best first) as a tab-separated report.
pub fn write_report<P: AsRef<Path>>(path: P, ranking: &[RiskyCombination], table: &GenotypeTable) -> Result<()> {
    let mut wtr = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path.as_ref())?;

    for (i, model) in ranking.iter().enumerate() {
        wtr.serialize(ReportRow {
            rank: i + 1,
            combination: format_combination(&model.combination),
            risky_genotypes: format_genotypes(table, &model.risky_genotypes),
            cv_count: model.cv_count,
            accuracy: model.accuracy,
        })?;
    }
    wtr.flush()?;
    info!("Report written to {}", path.as_ref().display());
    Ok(())
}

pub fn read_report<P: AsRef<Path>>(path: P) -> Result<Vec<ReportRow>> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .from_path(path.as_ref())?;
    let mut rows = Vec::new();
    for row in rdr.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_path() {
        assert_eq!(
            report_path(Path::new("/out"), "gepistasis", 2),
            PathBuf::from("/out/gepistasis.cv2.epi")
        );
    }

    #[test]
    fn test_write_then_read_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = report_path(dir.path(), "run", 1);
        let table = GenotypeTable::new(2);
        let mut first = RiskyCombination::new(vec![3, 7], vec![8, 2], 0.9);
        first.cv_count = 4;
        let second = RiskyCombination::new(vec![0, 1], vec![4], 0.61);

        write_report(&path, &[first, second], &table).unwrap();

        let rows = read_report(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0],
            ReportRow {
                rank: 1,
                combination: "3,7".to_string(),
                risky_genotypes: "(2,2) (0,2)".to_string(),
                cv_count: 4,
                accuracy: 0.9,
            }
        );
        assert_eq!(rows[1].rank, 2);

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("rank\tcombination\trisky_genotypes\tcv_count\taccuracy\n"));
    }

    #[test]
    fn test_output_directory_under_a_file_fails() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let below_file = file.path().join("reports");
        let err = ensure_output_directory(below_file.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, EpistasisError::OutputDirectory { .. }));
    }
}
