// timeseries.rs
//
// Time-Series Aligner: finds each subject's extracted region time series for
// one strategy and relabels it with the canonical region ordering.

use crate::error::{BenchError, Result};
use crate::tsv;
use log::{debug, info, warn};
use ndarray::Array2;
use std::path::{Path, PathBuf};

pub const ROI_LABEL_FILE: &str = "final_roi_labels.csv";
const ROI_NAME_COLUMN: &str = "roi_name";
const TIMESERIES_SUFFIX: &str = "_timeseries.tsv";
/// Files at or below this many bytes are leftovers of a failed extraction.
const MIN_TIMESERIES_BYTES: u64 = 1;

/// File-name fragment identifying one atlas, dimension and strategy.
pub fn file_pattern(atlas: &str, dimension: &str, strategy_name: &str) -> String {
    format!("atlas-{}_nroi-{}_desc-{}", atlas, dimension, strategy_name)
}

/// Canonical regions from `final_roi_labels.csv` (column `roi_name`).
pub fn load_region_labels(path: &Path) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
    let idx = reader
        .headers()?
        .iter()
        .position(|h| h == ROI_NAME_COLUMN)
        .ok_or_else(|| BenchError::MalformedTable {
            path: path.to_path_buf(),
            reason: format!("missing column '{}'", ROI_NAME_COLUMN),
        })?;
    let mut labels = Vec::new();
    for record in reader.records() {
        let record = record?;
        labels.push(record.get(idx).unwrap_or_default().to_string());
    }
    info!("Loaded {} canonical regions from {}", labels.len(), path.display());
    Ok(labels)
}

/// Canonical regions from a headerless atlas description (second column).
pub fn load_atlas_region_labels(path: &Path) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;
    let mut labels = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let label = record.get(1).ok_or_else(|| BenchError::MalformedTable {
            path: path.to_path_buf(),
            reason: format!("row {} has no second column", row + 1),
        })?;
        labels.push(label.to_string());
    }
    Ok(labels)
}

fn matches_subject_pattern(file_name: &str, subject: &str, pattern: &str) -> bool {
    let suffix = format!("_{}{}", pattern, TIMESERIES_SUFFIX);
    file_name
        .strip_prefix(subject)
        .and_then(|rest| rest.strip_prefix('_'))
        .map_or(false, |rest| rest.ends_with(&suffix))
}

fn subject_files(root: &Path, subject: &str, pattern: &str) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(root.join(subject)) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| matches_subject_pattern(n, subject, pattern))
        })
        .collect();
    files.sort();
    files
}

/// Whether any `sub-*` directory under `root` holds a time series for `pattern`.
pub fn any_timeseries_for(root: &Path, pattern: &str) -> bool {
    let suffix = format!("{}{}", pattern, TIMESERIES_SUFFIX);
    let Ok(entries) = std::fs::read_dir(root) else {
        return false;
    };
    entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_dir() && p.file_name().and_then(|n| n.to_str()).map_or(false, |n| n.starts_with("sub-")))
        .filter_map(|dir| std::fs::read_dir(dir).ok())
        .flatten()
        .filter_map(|e| e.ok())
        .any(|e| e.file_name().to_str().map_or(false, |n| n.ends_with(&suffix)))
}

/// Usable time series of the subjects that have them.
#[derive(Debug, Clone)]
pub struct AlignedTimeSeries {
    pub regions: Vec<String>,
    pub subject_ids: Vec<String>,
    /// One T x R matrix per subject; T may differ between subjects.
    pub series: Vec<Array2<f64>>,
}

impl AlignedTimeSeries {
    pub fn len(&self) -> usize {
        self.subject_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subject_ids.is_empty()
    }
}

/// Loads one time series per candidate subject. More than one matching file
/// for a subject is fatal; missing or empty files skip the subject.
pub fn align(
    root: &Path,
    candidate_subjects: &[String],
    pattern: &str,
    canonical_regions: &[String],
) -> Result<AlignedTimeSeries> {
    let mut aligned = AlignedTimeSeries {
        regions: canonical_regions.to_vec(),
        subject_ids: Vec::new(),
        series: Vec::new(),
    };
    for subject in candidate_subjects {
        let mut files = subject_files(root, subject, pattern);
        if files.len() > 1 {
            return Err(BenchError::AmbiguousTimeSeries(files));
        }
        let Some(path) = files.pop() else {
            debug!("No time series for {} matching {}", subject, pattern);
            continue;
        };
        if std::fs::metadata(&path)?.len() <= MIN_TIMESERIES_BYTES {
            info!("Time series {} is empty; skipping {}", path.display(), subject);
            continue;
        }
        let data = tsv::read_headerless_matrix(&path)?;
        if data.ncols() != canonical_regions.len() {
            warn!(
                "Time series {} has {} columns but the atlas lists {} regions; skipping {}",
                path.display(),
                data.ncols(),
                canonical_regions.len(),
                subject
            );
            continue;
        }
        debug!("Loaded {} ({} timepoints)", path.display(), data.nrows());
        aligned.subject_ids.push(subject.clone());
        aligned.series.push(data);
    }
    info!(
        "Loaded {} of {} candidate time series for {}",
        aligned.len(),
        candidate_subjects.len(),
        pattern
    );
    Ok(aligned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn regions(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("roi{}", i)).collect()
    }

    fn write_series(root: &Path, subject: &str, name: &str, body: &str) {
        let dir = root.join(subject);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn pattern_matching_requires_subject_prefix_and_strategy_suffix() {
        let pattern = file_pattern("schaefer7networks", "100", "simple");
        let ok = format!("sub-01_task-rest_{}_timeseries.tsv", pattern);
        assert!(matches_subject_pattern(&ok, "sub-01", &pattern));
        assert!(!matches_subject_pattern(&ok, "sub-011", &pattern));
        let gsr = format!("sub-01_task-rest_{}+gsr_timeseries.tsv", pattern);
        assert!(!matches_subject_pattern(&gsr, "sub-01", &pattern));
    }

    #[test]
    fn skips_missing_empty_and_misshapen_series() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = file_pattern("a", "3", "simple");
        let name = |s: &str| format!("{}_task-rest_{}_timeseries.tsv", s, pattern);
        write_series(dir.path(), "sub-01", &name("sub-01"), "1\t2\t3\n2\t3\t5\n4\t1\t0\n");
        write_series(dir.path(), "sub-02", &name("sub-02"), "");
        write_series(dir.path(), "sub-04", &name("sub-04"), "1\t2\n3\t4\n");
        let candidates: Vec<String> = ["sub-01", "sub-02", "sub-03", "sub-04"].iter().map(|s| s.to_string()).collect();
        let aligned = align(dir.path(), &candidates, &pattern, &regions(3)).unwrap();
        assert_eq!(aligned.subject_ids, vec!["sub-01"]);
        assert_eq!(aligned.series[0].dim(), (3, 3));
        assert_eq!(aligned.regions, regions(3));
        assert!(any_timeseries_for(dir.path(), &pattern));
        assert!(!any_timeseries_for(dir.path(), &file_pattern("a", "3", "compcor")));
    }

    #[test]
    fn ambiguous_match_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = file_pattern("a", "2", "simple");
        write_series(dir.path(), "sub-01", &format!("sub-01_run-1_{}_timeseries.tsv", pattern), "1\t2\n");
        write_series(dir.path(), "sub-01", &format!("sub-01_run-2_{}_timeseries.tsv", pattern), "1\t2\n");
        let err = align(dir.path(), &["sub-01".to_string()], &pattern, &regions(2)).unwrap_err();
        match err {
            BenchError::AmbiguousTimeSeries(files) => assert_eq!(files.len(), 2),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn series_with_wrong_region_count_skips_only_that_subject() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = file_pattern("a", "3", "simple");
        let name = |s: &str| format!("{}_task-rest_{}_timeseries.tsv", s, pattern);
        write_series(dir.path(), "sub-01", &name("sub-01"), "1\t2\t3\n4\t5\t7\n");
        // extracted with a different atlas version: one region short
        write_series(dir.path(), "sub-02", &name("sub-02"), "1\t2\n4\t5\n");
        write_series(dir.path(), "sub-03", &name("sub-03"), "1\t2\t3\t4\n4\t5\t6\t7\n");
        write_series(dir.path(), "sub-04", &name("sub-04"), "3\t2\t1\n0\t5\t9\n");
        let candidates: Vec<String> = (1..=4).map(|i| format!("sub-0{}", i)).collect();

        let aligned = align(dir.path(), &candidates, &pattern, &regions(3)).unwrap();
        assert_eq!(aligned.subject_ids, vec!["sub-01", "sub-04"]);
        assert!(aligned.series.iter().all(|s| s.dim() == (2, 3)));
        assert_eq!(aligned.regions, regions(3));
    }

    #[test]
    fn region_lists_load_from_both_sources() {
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join(ROI_LABEL_FILE);
        fs::write(&csv_path, "index,roi_name\n0,Vis_1\n1,SomMot_1\n").unwrap();
        assert_eq!(load_region_labels(&csv_path).unwrap(), vec!["Vis_1", "SomMot_1"]);
        let tsv_path = dir.path().join("atlas.tsv");
        fs::write(&tsv_path, "1\tVis_1\tx\n2\tSomMot_1\ty\n").unwrap();
        assert_eq!(load_atlas_region_labels(&tsv_path).unwrap(), vec!["Vis_1", "SomMot_1"]);
    }
}
