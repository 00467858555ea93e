// confounds.rs
//
// Regressor Selector and Confound Loader.
//
// A subject's fMRIPrep confounds file is reduced to the regressors a strategy
// asks for. Scrubbing strategies with a BOLD image next to the confounds file
// go through a `ScrubResolver` instead, which also decides which volumes are
// censored.

use crate::error::{BenchError, Result};
use crate::strategy::{ConfoundLevel, DenoiseMethod, ScrubSettings, Strategy};
use crate::tsv;
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub const MOTION_BASES: [&str; 6] = ["trans_x", "trans_y", "trans_z", "rot_x", "rot_y", "rot_z"];
pub const WM_CSF_COLUMNS: [&str; 2] = ["white_matter", "csf"];
pub const GLOBAL_SIGNAL: &str = "global_signal";
pub const COMPCOR_PREFIX: &str = "c_comp_cor_0";
pub const MAX_COMPCOR_COMPONENTS: usize = 5;
pub const AROMA_PLACEHOLDER_PREFIX: &str = "aroma_comp_";
const HIGH_PASS: &str = "high_pass";
const FRAMEWISE_DISPLACEMENT: &str = "framewise_displacement";
const STD_DVARS: &str = "std_dvars";
const NON_STEADY_STATE_PREFIX: &str = "non_steady_state_outlier";
const CONFOUNDS_DESC: &str = "desc-confounds";
const BOLD_SUFFIX: &str = "_desc-preproc_bold.nii.gz";

// --- Confound Table ---

/// Named regressor columns over a fixed number of timepoints.
/// A table may have zero columns and still carry its row count.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfoundTable {
    names: Vec<String>,
    columns: Vec<Vec<f64>>,
    n_rows: usize,
}

impl ConfoundTable {
    pub fn new(names: Vec<String>, columns: Vec<Vec<f64>>, n_rows: usize) -> Result<Self> {
        if names.len() != columns.len() {
            return Err(BenchError::ShapeMismatch(format!(
                "{} column names for {} columns",
                names.len(),
                columns.len()
            )));
        }
        if let Some((name, column)) = names.iter().zip(&columns).find(|(_, c)| c.len() != n_rows) {
            return Err(BenchError::ShapeMismatch(format!(
                "column '{}' has {} rows, expected {}",
                name,
                column.len(),
                n_rows
            )));
        }
        Ok(Self { names, columns, n_rows })
    }

    pub fn empty(n_rows: usize) -> Self {
        Self { names: Vec::new(), columns: Vec::new(), n_rows }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let (names, columns, n_rows) = tsv::read_numeric_columns(path)?;
        Self::new(names, columns, n_rows)
    }

    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_columns(&self) -> usize {
        self.names.len()
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|idx| self.columns[idx].as_slice())
    }

    /// Sub-table of the requested columns that exist, in request order.
    pub fn select(&self, requested: &[String]) -> Self {
        let mut names = Vec::new();
        let mut columns = Vec::new();
        for name in requested {
            if let Some(values) = self.column(name) {
                names.push(name.clone());
                columns.push(values.to_vec());
            }
        }
        Self { names, columns, n_rows: self.n_rows }
    }

    fn with_names(mut self, names: Vec<String>) -> Self {
        debug_assert_eq!(names.len(), self.columns.len());
        self.names = names;
        self
    }

    /// Column-wise concatenation. Row counts must match exactly.
    pub fn hconcat(&mut self, other: ConfoundTable) -> Result<()> {
        if other.n_rows != self.n_rows {
            return Err(BenchError::ShapeMismatch(format!(
                "cannot concatenate {} rows onto {} rows",
                other.n_rows, self.n_rows
            )));
        }
        self.names.extend(other.names);
        self.columns.extend(other.columns);
        Ok(())
    }
}

// --- Sample Mask ---

/// Per-timepoint validity. Tabular loading yields boolean flags; image-based
/// scrubbing yields the indices of the volumes that were kept.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleMask {
    Flags(Vec<bool>),
    KeptIndices { kept: Vec<usize>, n_timepoints: usize },
}

impl SampleMask {
    pub fn all_valid(n_timepoints: usize) -> Self {
        Self::Flags(vec![true; n_timepoints])
    }

    pub fn from_flags(flags: Vec<bool>) -> Self {
        Self::Flags(flags)
    }

    pub fn from_kept_indices(kept: Vec<usize>, n_timepoints: usize) -> Self {
        Self::KeptIndices { kept, n_timepoints }
    }

    pub fn n_timepoints(&self) -> usize {
        match self {
            Self::Flags(flags) => flags.len(),
            Self::KeptIndices { n_timepoints, .. } => *n_timepoints,
        }
    }

    /// Number of timepoints removed from the analysis.
    pub fn excised_count(&self) -> usize {
        match self {
            Self::Flags(flags) => flags.iter().filter(|&&valid| !valid).count(),
            Self::KeptIndices { kept, n_timepoints } => n_timepoints.saturating_sub(kept.len()),
        }
    }
}

// --- Regressor Selector ---

/// Where a subject's auxiliary AROMA table is looked up.
#[derive(Debug, Clone, Copy)]
pub struct SubjectContext<'a> {
    pub subject_id: &'a str,
    pub specifier: &'a str,
    pub aroma_root: Option<&'a Path>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegressorSelection {
    /// Nothing to regress; callers short-circuit to an empty table and an
    /// all-valid mask.
    NoRegressors,
    Selected {
        columns: Vec<String>,
        auxiliary: Option<ConfoundTable>,
    },
}

fn motion_columns(available: &[String]) -> Vec<String> {
    available
        .iter()
        .filter(|col| MOTION_BASES.iter().any(|base| col.starts_with(base)))
        .cloned()
        .collect()
}

pub fn aroma_path(aroma_root: &Path, subject_id: &str, specifier: &str) -> PathBuf {
    aroma_root
        .join(subject_id)
        .join("func")
        .join(format!("{}_{}_desc-aroma_timeseries.tsv", subject_id, specifier))
}

fn load_aroma_components(strategy_name: &str, ctx: &SubjectContext) -> Option<ConfoundTable> {
    let aroma_root = ctx.aroma_root?;
    let path = aroma_path(aroma_root, ctx.subject_id, ctx.specifier);
    if !path.is_file() {
        warn!("[{}] AROMA file not found: {}", strategy_name, path.display());
        return None;
    }
    match ConfoundTable::from_path(&path) {
        Ok(table) => {
            info!(
                "[{}] Found {} AROMA components for {}",
                strategy_name,
                table.n_columns(),
                ctx.subject_id
            );
            Some(table)
        }
        Err(e) => {
            warn!("[{}] Could not load AROMA file {}: {}", strategy_name, path.display(), e);
            None
        }
    }
}

/// Chooses the confound columns a strategy uses for one subject.
pub fn select_regressors(
    strategy: &Strategy,
    available: &[String],
    ctx: &SubjectContext,
) -> RegressorSelection {
    let has = |name: &str| available.iter().any(|col| col == name);
    let mut auxiliary = None;

    let columns: Vec<String> = match &strategy.method {
        DenoiseMethod::Simple { wm_csf, global_signal }
        | DenoiseMethod::Scrubbing { wm_csf, global_signal } => {
            let mut cols = motion_columns(available);
            if *wm_csf {
                cols.extend(WM_CSF_COLUMNS.iter().map(|c| c.to_string()));
            }
            if *global_signal && has(GLOBAL_SIGNAL) {
                cols.push(GLOBAL_SIGNAL.to_string());
            }
            cols
        }
        DenoiseMethod::Compcor => available
            .iter()
            .filter(|col| col.starts_with(COMPCOR_PREFIX))
            .take(MAX_COMPCOR_COMPONENTS)
            .cloned()
            .collect(),
        DenoiseMethod::IcaAroma { global_signal } => {
            let mut cols = Vec::new();
            if *global_signal && has(GLOBAL_SIGNAL) {
                cols.push(GLOBAL_SIGNAL.to_string());
            }
            if let Some(components) = load_aroma_components(&strategy.name, ctx) {
                let placeholders: Vec<String> = (0..components.n_columns())
                    .map(|i| format!("{}{}", AROMA_PLACEHOLDER_PREFIX, i))
                    .collect();
                cols.extend(placeholders.iter().cloned());
                auxiliary = Some(components.with_names(placeholders));
            }
            cols
        }
        DenoiseMethod::Baseline => Vec::new(),
        DenoiseMethod::Explicit { columns } => {
            let mut cols = Vec::new();
            for item in columns {
                if item == HIGH_PASS {
                    debug!("[{}] Ignoring 'high_pass' since temporal filtering is applied upstream.", strategy.name);
                } else if has(item) {
                    cols.push(item.clone());
                } else {
                    warn!("[{}] Column '{}' not found in confounds file.", strategy.name, item);
                }
            }
            cols
        }
    };

    if columns.is_empty() && auxiliary.is_none() {
        warn!("[{}] No valid regressors found in file.", strategy.name);
        return RegressorSelection::NoRegressors;
    }
    debug!("[{}] Final columns: {:?}", strategy.name, columns);
    RegressorSelection::Selected { columns, auxiliary }
}

// --- Confound file naming ---

/// Subject and specifier parsed from `<sub>_<specifier>_desc-confounds_timeseries.tsv`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfoundFileName {
    pub subject_id: String,
    pub specifier: String,
}

impl ConfoundFileName {
    pub fn parse(path: &Path) -> Result<Self> {
        let malformed = || BenchError::MalformedTable {
            path: path.to_path_buf(),
            reason: "file name does not follow <sub>_<specifier>_desc-confounds_timeseries.tsv".to_string(),
        };
        let file_name = path.file_name().and_then(|n| n.to_str()).ok_or_else(malformed)?;
        let parts: Vec<&str> = file_name.split('_').collect();
        let desc_idx = parts.iter().position(|p| *p == CONFOUNDS_DESC).ok_or_else(malformed)?;
        if desc_idx == 0 {
            return Err(malformed());
        }
        Ok(Self {
            subject_id: parts[0].to_string(),
            specifier: parts[1..desc_idx].join("_"),
        })
    }
}

/// Preprocessed BOLD image beside a confounds file, preferring files that
/// carry a resolution entity.
pub fn find_bold_image(confounds_path: &Path, name: &ConfoundFileName) -> Option<PathBuf> {
    let func_dir = confounds_path.parent()?;
    let prefix = format!("{}_{}_space-", name.subject_id, name.specifier);
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(func_dir)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with(&prefix) && n.ends_with(BOLD_SUFFIX))
        })
        .collect();
    candidates.sort();
    let with_resolution = candidates.iter().find(|p| {
        p.file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n[prefix.len()..].contains("_res-"))
    });
    with_resolution.or_else(|| candidates.first()).cloned()
}

// --- Image-based scrubbing ---

/// Resolves confounds and the censoring mask from a subject's BOLD image.
pub trait ScrubResolver {
    fn resolve(
        &self,
        bold_path: &Path,
        confounds_path: &Path,
        settings: &ScrubSettings,
    ) -> Result<(ConfoundTable, SampleMask)>;
}

/// Framewise-displacement / DVARS scrubbing computed from the confounds file
/// that accompanies the image.
#[derive(Debug, Clone, Copy, Default)]
pub struct FramewiseScrubber;

impl FramewiseScrubber {
    fn level_columns(bases: &[&str], level: ConfoundLevel, available: &[String]) -> Vec<String> {
        let mut cols = Vec::new();
        for base in bases {
            for suffix in level.suffixes() {
                let name = format!("{}{}", base, suffix);
                if available.contains(&name) {
                    cols.push(name);
                }
            }
        }
        cols
    }

    /// Volumes exceeding either threshold.
    pub fn motion_outliers(table: &ConfoundTable, settings: &ScrubSettings) -> BTreeSet<usize> {
        let mut outliers = BTreeSet::new();
        let criteria = [
            (FRAMEWISE_DISPLACEMENT, settings.fd_threshold),
            (STD_DVARS, settings.std_dvars_threshold),
        ];
        for (column, threshold) in criteria {
            let (Some(values), Some(threshold)) = (table.column(column), threshold) else {
                continue;
            };
            outliers.extend(
                values
                    .iter()
                    .enumerate()
                    .filter(|(_, v)| **v > threshold)
                    .map(|(idx, _)| idx),
            );
        }
        outliers
    }

    /// Extends the censored set with short uncensored runs. A leading or
    /// trailing run is censored when it has fewer than `min_segment` volumes;
    /// a run between two outliers when the distance between those outliers
    /// is below `min_segment`. Runs are measured against the original outliers.
    pub fn optimize_scrub(outliers: &BTreeSet<usize>, n_scans: usize, min_segment: usize) -> BTreeSet<usize> {
        let mut censored = outliers.clone();
        if outliers.is_empty() || min_segment == 0 {
            return censored;
        }
        let mut run_start: Option<usize> = None;
        for idx in 0..=n_scans {
            let is_kept = idx < n_scans && !outliers.contains(&idx);
            match (is_kept, run_start) {
                (true, None) => run_start = Some(idx),
                (false, Some(start)) => {
                    let interior = start > 0 && idx < n_scans;
                    let span = if interior { idx - start + 1 } else { idx - start };
                    if span < min_segment {
                        censored.extend(start..idx);
                    }
                    run_start = None;
                }
                _ => {}
            }
        }
        censored
    }
}

impl ScrubResolver for FramewiseScrubber {
    fn resolve(
        &self,
        bold_path: &Path,
        confounds_path: &Path,
        settings: &ScrubSettings,
    ) -> Result<(ConfoundTable, SampleMask)> {
        debug!(
            "Resolving scrubbing mask for {} from {}",
            bold_path.display(),
            confounds_path.display()
        );
        let raw = ConfoundTable::from_path(confounds_path)?;
        let n_scans = raw.n_rows();

        let mut columns = Vec::new();
        if let Some(level) = settings.motion {
            columns.extend(Self::level_columns(&MOTION_BASES, level, raw.column_names()));
        }
        if let Some(level) = settings.global_signal {
            columns.extend(Self::level_columns(&[GLOBAL_SIGNAL], level, raw.column_names()));
        }
        let mut selected = raw.select(&columns);
        for column in selected.columns.iter_mut() {
            column.iter_mut().filter(|v| v.is_nan()).for_each(|v| *v = 0.0);
        }

        let outliers = Self::motion_outliers(&raw, settings);
        let mut censored = Self::optimize_scrub(&outliers, n_scans, settings.scrub);
        for (name, values) in raw.names.iter().zip(&raw.columns) {
            if name.starts_with(NON_STEADY_STATE_PREFIX) {
                censored.extend(values.iter().enumerate().filter(|(_, v)| **v == 1.0).map(|(i, _)| i));
            }
        }
        let kept: Vec<usize> = (0..n_scans).filter(|idx| !censored.contains(idx)).collect();
        debug!(
            "Scrubbing kept {}/{} volumes ({} motion outliers)",
            kept.len(),
            n_scans,
            outliers.len()
        );
        Ok((selected, SampleMask::from_kept_indices(kept, n_scans)))
    }
}

// --- Confound Loader ---

pub struct ConfoundLoader<R: ScrubResolver = FramewiseScrubber> {
    resolver: R,
    /// Root of the AROMA derivatives; defaults to the directory above the
    /// fMRIPrep derivative root of each confounds file.
    aroma_root: Option<PathBuf>,
}

impl Default for ConfoundLoader<FramewiseScrubber> {
    fn default() -> Self {
        Self { resolver: FramewiseScrubber, aroma_root: None }
    }
}

impl<R: ScrubResolver> ConfoundLoader<R> {
    pub fn new(resolver: R, aroma_root: Option<PathBuf>) -> Self {
        Self { resolver, aroma_root }
    }

    fn aroma_root_for(&self, confounds_path: &Path) -> Option<PathBuf> {
        self.aroma_root
            .clone()
            .or_else(|| confounds_path.ancestors().nth(4).map(Path::to_path_buf))
    }

    /// Reduced confound table and sample mask for one subject and strategy.
    pub fn load(&self, strategy: &Strategy, confounds_path: &Path) -> Result<(ConfoundTable, SampleMask)> {
        let file_name = ConfoundFileName::parse(confounds_path)?;

        if let Some(settings) = &strategy.scrubbing {
            match find_bold_image(confounds_path, &file_name) {
                Some(bold_path) => {
                    warn!(
                        "[{}] Found BOLD image: {} - using image-based sample mask.",
                        strategy.name,
                        bold_path.display()
                    );
                    return self.resolver.resolve(&bold_path, confounds_path, settings);
                }
                None => warn!(
                    "[{}] BOLD file not found - falling back to TSV-based loader; no volumes will be scrubbed.",
                    strategy.name
                ),
            }
        }

        self.load_tabular(strategy, confounds_path, &file_name)
    }

    fn load_tabular(
        &self,
        strategy: &Strategy,
        confounds_path: &Path,
        file_name: &ConfoundFileName,
    ) -> Result<(ConfoundTable, SampleMask)> {
        let table = ConfoundTable::from_path(confounds_path)?;
        let n_timepoints = table.n_rows();
        let aroma_root = self.aroma_root_for(confounds_path);
        let ctx = SubjectContext {
            subject_id: &file_name.subject_id,
            specifier: &file_name.specifier,
            aroma_root: aroma_root.as_deref(),
        };

        let (columns, auxiliary) = match select_regressors(strategy, table.column_names(), &ctx) {
            RegressorSelection::NoRegressors => {
                warn!(
                    "[{}] No valid regressors found in TSV. Proceeding with empty confounds.",
                    strategy.name
                );
                return Ok((ConfoundTable::empty(n_timepoints), SampleMask::all_valid(n_timepoints)));
            }
            RegressorSelection::Selected { columns, auxiliary } => (columns, auxiliary),
        };

        let mut reduced = table.select(&columns);
        if let Some(components) = auxiliary {
            if components.n_rows() == n_timepoints {
                reduced.hconcat(components)?;
            } else {
                warn!(
                    "[{}] AROMA file shape mismatch: expected {} rows, got {} - skipping AROMA components.",
                    strategy.name,
                    n_timepoints,
                    components.n_rows()
                );
            }
        }

        debug!(
            "TSV loader ({}): keeping {} cols, {} timepoints, mask of all valid",
            strategy.name,
            reduced.n_columns(),
            n_timepoints
        );
        Ok((reduced, SampleMask::all_valid(n_timepoints)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::StrategyParameters;
    use std::fs;

    fn strategy(name: &str, json: &str) -> Strategy {
        let params: StrategyParameters = serde_json::from_str(json).unwrap();
        Strategy::from_parameters(name, params).unwrap()
    }

    fn names(cols: &[&str]) -> Vec<String> {
        cols.iter().map(|c| c.to_string()).collect()
    }

    const NO_AROMA: SubjectContext<'static> = SubjectContext {
        subject_id: "sub-01",
        specifier: "task-rest",
        aroma_root: None,
    };

    fn write_confounds(dir: &Path, subject: &str, header: &[&str], rows: &[Vec<f64>]) -> PathBuf {
        let func = dir.join("fmriprep").join(subject).join("func");
        fs::create_dir_all(&func).unwrap();
        let path = func.join(format!("{}_task-rest_desc-confounds_timeseries.tsv", subject));
        let mut text = header.join("\t");
        text.push('\n');
        for row in rows {
            let cells: Vec<String> = row.iter().map(|v| tsv::format_cell(*v)).collect();
            text.push_str(&cells.join("\t"));
            text.push('\n');
        }
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn explicit_override_is_ordered_intersection() {
        let s = strategy("custom", r#"{"strategy": ["csf", "missing", "high_pass", "trans_x"]}"#);
        let available = names(&["trans_x", "trans_y", "csf", "white_matter"]);
        match select_regressors(&s, &available, &NO_AROMA) {
            RegressorSelection::Selected { columns, auxiliary } => {
                assert_eq!(columns, names(&["csf", "trans_x"]));
                assert!(auxiliary.is_none());
            }
            other => panic!("unexpected selection {:?}", other),
        }
    }

    #[test]
    fn simple_selects_motion_family_wm_csf_and_gsr() {
        let s = strategy(
            "simple+gsr",
            r#"{"denoise_strategy": "simple", "wm_csf": "basic", "global_signal": "basic"}"#,
        );
        let available = names(&["global_signal", "trans_x", "trans_x_derivative1", "rot_z", "csf", "framewise_displacement"]);
        let RegressorSelection::Selected { columns, .. } = select_regressors(&s, &available, &NO_AROMA) else {
            panic!("expected a selection");
        };
        assert_eq!(
            columns,
            names(&["trans_x", "trans_x_derivative1", "rot_z", "white_matter", "csf", "global_signal"])
        );
    }

    #[test]
    fn compcor_takes_first_five_components() {
        let s = strategy("compcor", r#"{"denoise_strategy": "compcor"}"#);
        let available: Vec<String> = (0..8).map(|i| format!("c_comp_cor_0{}", i)).chain(["a_comp_cor_00".to_string()]).collect();
        let RegressorSelection::Selected { columns, .. } = select_regressors(&s, &available, &NO_AROMA) else {
            panic!("expected a selection");
        };
        assert_eq!(columns.len(), 5);
        assert_eq!(columns[4], "c_comp_cor_04");
    }

    #[test]
    fn baseline_and_missing_aroma_signal_no_regressors() {
        let baseline = strategy("baseline", r#"{"denoise_strategy": "baseline"}"#);
        assert_eq!(
            select_regressors(&baseline, &names(&["trans_x"]), &NO_AROMA),
            RegressorSelection::NoRegressors
        );
        let dir = tempfile::tempdir().unwrap();
        let ctx = SubjectContext { aroma_root: Some(dir.path()), ..NO_AROMA };
        let aroma = strategy("aroma", r#"{"denoise_strategy": "ica_aroma"}"#);
        assert_eq!(
            select_regressors(&aroma, &names(&["trans_x"]), &ctx),
            RegressorSelection::NoRegressors
        );
    }

    #[test]
    fn aroma_components_become_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let path = aroma_path(dir.path(), "sub-01", "task-rest");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "aroma_motion_01\taroma_motion_02\n0.1\t0.2\n0.3\t0.4\n").unwrap();
        let ctx = SubjectContext { aroma_root: Some(dir.path()), ..NO_AROMA };
        let aroma = strategy("aroma+gsr", r#"{"denoise_strategy": "ica_aroma", "global_signal": "basic"}"#);
        let RegressorSelection::Selected { columns, auxiliary } =
            select_regressors(&aroma, &names(&["global_signal"]), &ctx)
        else {
            panic!("expected a selection");
        };
        assert_eq!(columns, names(&["global_signal", "aroma_comp_0", "aroma_comp_1"]));
        let auxiliary = auxiliary.unwrap();
        assert_eq!(auxiliary.column_names(), &names(&["aroma_comp_0", "aroma_comp_1"])[..]);
        assert_eq!(auxiliary.column("aroma_comp_1").unwrap(), &[0.2, 0.4]);
    }

    #[test]
    fn sample_mask_representations_agree_on_excised_count() {
        assert_eq!(SampleMask::from_flags(vec![true, false, true, false]).excised_count(), 2);
        assert_eq!(SampleMask::from_kept_indices(vec![0, 2], 4).excised_count(), 2);
        assert_eq!(SampleMask::all_valid(7).excised_count(), 0);
        assert_eq!(SampleMask::from_kept_indices(vec![], 0).excised_count(), 0);
    }

    #[test]
    fn short_segments_between_outliers_are_censored() {
        let outliers: BTreeSet<usize> = [2, 5, 12].into_iter().collect();
        let censored = FramewiseScrubber::optimize_scrub(&outliers, 20, 3);
        // leading run 0..2 is shorter than 3 volumes; outliers 2 and 5 are 3 apart
        let expected: BTreeSet<usize> = [0, 1, 2, 5, 12].into_iter().collect();
        assert_eq!(censored, expected);

        let outliers: BTreeSet<usize> = [5, 8, 13, 17].into_iter().collect();
        let censored = FramewiseScrubber::optimize_scrub(&outliers, 20, 5);
        // 8 and 13 are 5 apart, so only 9..13 survives besides the leading run
        let expected: BTreeSet<usize> = [5, 6, 7, 8, 13, 14, 15, 16, 17, 18, 19].into_iter().collect();
        assert_eq!(censored, expected);
        assert!(FramewiseScrubber::optimize_scrub(&BTreeSet::new(), 20, 5).is_empty());
    }

    #[test]
    fn interior_run_as_long_as_the_segment_minimum_is_kept() {
        let outliers: BTreeSet<usize> = [5, 10].into_iter().collect();
        let censored = FramewiseScrubber::optimize_scrub(&outliers, 20, 5);
        assert_eq!(censored, outliers);
    }

    #[test]
    fn confound_file_name_parsing() {
        let name = ConfoundFileName::parse(Path::new(
            "/d/sub-01/func/sub-01_ses-1_task-rest_run-1_desc-confounds_timeseries.tsv",
        ))
        .unwrap();
        assert_eq!(name.subject_id, "sub-01");
        assert_eq!(name.specifier, "ses-1_task-rest_run-1");
        assert!(ConfoundFileName::parse(Path::new("sub-01_bold.tsv")).is_err());
    }

    #[test]
    fn loader_drops_mismatched_aroma_rows() {
        let dir = tempfile::tempdir().unwrap();
        let confounds = write_confounds(
            dir.path(),
            "sub-01",
            &["trans_x", "global_signal"],
            &[vec![0.1, 1.0], vec![0.2, 2.0], vec![0.3, 3.0]],
        );
        let aroma_file = aroma_path(dir.path(), "sub-01", "task-rest");
        fs::create_dir_all(aroma_file.parent().unwrap()).unwrap();
        fs::write(&aroma_file, "c1\n0.1\n0.2\n").unwrap();

        let loader = ConfoundLoader::new(FramewiseScrubber, Some(dir.path().to_path_buf()));
        let aroma = strategy("aroma+gsr", r#"{"denoise_strategy": "ica_aroma", "global_signal": "basic"}"#);
        let (table, mask) = loader.load(&aroma, &confounds).unwrap();
        assert_eq!(table.column_names(), &names(&["global_signal"])[..]);
        assert_eq!(mask.excised_count(), 0);
        assert_eq!(mask.n_timepoints(), 3);
    }

    #[test]
    fn loader_short_circuits_without_regressors() {
        let dir = tempfile::tempdir().unwrap();
        let confounds = write_confounds(dir.path(), "sub-02", &["trans_x"], &[vec![0.0], vec![0.1]]);
        let loader = ConfoundLoader::default();
        let baseline = strategy("baseline", r#"{"denoise_strategy": "baseline"}"#);
        let (table, mask) = loader.load(&baseline, &confounds).unwrap();
        assert_eq!(table.n_columns(), 0);
        assert_eq!(table.n_rows(), 2);
        assert_eq!(mask, SampleMask::all_valid(2));
    }

    #[test]
    fn scrubbing_uses_image_path_when_bold_exists() {
        let dir = tempfile::tempdir().unwrap();
        let mut rows = Vec::new();
        for t in 0..12 {
            let fd = if t == 6 { 0.9 } else if t == 0 { f64::NAN } else { 0.05 };
            rows.push(vec![0.01 * t as f64, f64::NAN, fd, if t == 0 { 1.0 } else { 0.0 }]);
        }
        let confounds = write_confounds(
            dir.path(),
            "sub-03",
            &["trans_x", "trans_x_derivative1", "framewise_displacement", "non_steady_state_outlier00"],
            &rows,
        );
        let scrub = strategy(
            "scrubbing.5",
            r#"{"denoise_strategy": "scrubbing", "fd_threshold": 0.5, "std_dvars_threshold": null, "scrub": 5}"#,
        );
        let loader = ConfoundLoader::default();

        // Without the image, the tabular path keeps every volume.
        let (_, mask) = loader.load(&scrub, &confounds).unwrap();
        assert_eq!(mask.excised_count(), 0);

        let bold = confounds
            .parent()
            .unwrap()
            .join("sub-03_task-rest_space-MNI152NLin2009cAsym_res-2_desc-preproc_bold.nii.gz");
        fs::write(&bold, b"").unwrap();
        let (table, mask) = loader.load(&scrub, &confounds).unwrap();
        assert_eq!(table.column_names(), &names(&["trans_x", "trans_x_derivative1"])[..]);
        assert_eq!(table.column("trans_x_derivative1").unwrap()[0], 0.0);
        // volume 6 is an outlier; the trailing run 7..12 has exactly 5 volumes
        // and survives, the leading run 0..6 survives apart from the
        // non-steady-state volume 0.
        match &mask {
            SampleMask::KeptIndices { kept, n_timepoints } => {
                assert_eq!(*n_timepoints, 12);
                assert_eq!(kept, &vec![1, 2, 3, 4, 5, 7, 8, 9, 10, 11]);
            }
            other => panic!("unexpected mask {:?}", other),
        }
        assert_eq!(mask.excised_count(), 2);
    }

    #[test]
    fn bold_lookup_prefers_resolution_entity() {
        let dir = tempfile::tempdir().unwrap();
        let func = dir.path();
        let confounds = func.join("sub-01_task-rest_desc-confounds_timeseries.tsv");
        fs::write(&confounds, "trans_x\n0\n").unwrap();
        fs::write(func.join("sub-01_task-rest_space-A_desc-preproc_bold.nii.gz"), b"").unwrap();
        fs::write(func.join("sub-01_task-rest_space-B_res-2_desc-preproc_bold.nii.gz"), b"").unwrap();
        let name = ConfoundFileName::parse(&confounds).unwrap();
        let found = find_bold_image(&confounds, &name).unwrap();
        assert!(found.to_string_lossy().ends_with("space-B_res-2_desc-preproc_bold.nii.gz"));
    }
}
