// dof.rs
//
// Degrees-of-Freedom Accountant.

use crate::confounds::{ConfoundTable, SampleMask};
use crate::error::Result;
use crate::metric_table::{ColumnKey, HeaderLayout, MetricTable};
use crate::strategy::Strategy;
use log::warn;
use std::collections::BTreeMap;
use std::path::Path;

pub const EXCISED_VOL: &str = "excised_vol";
pub const EXCISED_VOL_PROPORTION: &str = "excised_vol_proportion";

/// Degrees of freedom consumed by one strategy for one subject.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DofRecord {
    pub excised_vol: usize,
    pub excised_vol_proportion: f64,
    /// Temporal filtering happens upstream; always zero here.
    pub high_pass: usize,
    pub fixed_regressors: usize,
    pub compcor: usize,
    pub aroma: usize,
    pub scrub: usize,
    pub total: usize,
    pub full_length: usize,
}

impl DofRecord {
    pub fn from_loaded(strategy: &Strategy, confounds: &ConfoundTable, mask: &SampleMask) -> Self {
        let names = confounds.column_names();
        let compcor = names.iter().filter(|n| n.contains("comp_cor")).count();
        let aroma = names.iter().filter(|n| n.to_lowercase().contains("aroma")).count();
        let scrub = names.iter().filter(|n| n.starts_with("motion_outlier")).count();
        let n_regressors = names.len();

        let full_length = confounds.n_rows();
        let excised_vol = mask.excised_count();
        let excised_vol_proportion = if full_length == 0 {
            0.0
        } else {
            excised_vol as f64 / full_length as f64
        };
        let total = if strategy.is_scrubbing() {
            n_regressors + excised_vol
        } else {
            n_regressors
        };

        Self {
            excised_vol,
            excised_vol_proportion,
            high_pass: 0,
            fixed_regressors: n_regressors.saturating_sub(compcor + aroma),
            compcor,
            aroma,
            scrub,
            total,
            full_length,
        }
    }

    /// Metric name and value pairs in output column order.
    pub fn fields(&self) -> [(&'static str, f64); 9] {
        [
            (EXCISED_VOL, self.excised_vol as f64),
            (EXCISED_VOL_PROPORTION, self.excised_vol_proportion),
            ("high_pass", self.high_pass as f64),
            ("fixed_regressors", self.fixed_regressors as f64),
            ("compcor", self.compcor as f64),
            ("aroma", self.aroma as f64),
            ("scrub", self.scrub as f64),
            ("total", self.total as f64),
            ("full_length", self.full_length as f64),
        ]
    }
}

/// Records keyed by subject, then by strategy in insertion order.
#[derive(Debug, Default)]
pub struct DofAccountant {
    subjects: BTreeMap<String, Vec<(String, DofRecord)>>,
}

impl DofAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one strategy's record for a subject. A strategy already recorded
    /// for that subject keeps its first record.
    pub fn accumulate(&mut self, subject_id: &str, strategy: &Strategy, confounds: &ConfoundTable, mask: &SampleMask) {
        let entries = self.subjects.entry(subject_id.to_string()).or_default();
        if entries.iter().any(|(name, _)| *name == strategy.name) {
            warn!(
                "DoF for {} under '{}' was already recorded; keeping the first record.",
                subject_id,
                strategy.name
            );
            return;
        }
        entries.push((strategy.name.clone(), DofRecord::from_loaded(strategy, confounds, mask)));
    }

    pub fn record(&self, subject_id: &str, strategy_name: &str) -> Option<&DofRecord> {
        self.subjects
            .get(subject_id)?
            .iter()
            .find(|(name, _)| name == strategy_name)
            .map(|(_, record)| record)
    }

    pub fn n_subjects(&self) -> usize {
        self.subjects.len()
    }

    /// Wide table: subjects sorted, columns keyed by (strategy, metric).
    pub fn to_table(&self) -> MetricTable {
        let mut table = MetricTable::new("", HeaderLayout::Hierarchical);
        for (subject, entries) in &self.subjects {
            for (strategy, record) in entries {
                for (metric, value) in record.fields() {
                    table.set(subject, ColumnKey::grouped(strategy.as_str(), metric), value);
                }
            }
        }
        table.sort_rows();
        table
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        self.to_table().write_to_path(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::StrategyParameters;

    fn strategy(name: &str, json: &str) -> Strategy {
        let params: StrategyParameters = serde_json::from_str(json).unwrap();
        Strategy::from_parameters(name, params).unwrap()
    }

    fn table(names: &[&str], n_rows: usize) -> ConfoundTable {
        ConfoundTable::new(
            names.iter().map(|s| s.to_string()).collect(),
            vec![vec![0.0; n_rows]; names.len()],
            n_rows,
        )
        .unwrap()
    }

    #[test]
    fn categorises_regressors() {
        let s = strategy("mixed", r#"{"denoise_strategy": "simple"}"#);
        let confounds = table(
            &["trans_x", "c_comp_cor_00", "a_comp_cor_01", "aroma_comp_0", "AROMA_motion_2", "motion_outlier_00"],
            10,
        );
        let record = DofRecord::from_loaded(&s, &confounds, &SampleMask::all_valid(10));
        assert_eq!(record.compcor, 2);
        assert_eq!(record.aroma, 2);
        assert_eq!(record.scrub, 1);
        assert_eq!(record.fixed_regressors, 2);
        assert_eq!(record.total, 6);
        assert_eq!(record.high_pass, 0);
    }

    #[test]
    fn scrubbing_total_counts_excised_volumes() {
        let s = strategy("scrubbing.5", r#"{"denoise_strategy": "scrubbing", "scrub": 5}"#);
        let confounds = table(&["trans_x", "rot_z"], 8);
        let mask = SampleMask::from_kept_indices(vec![0, 1, 2, 3, 4, 5], 8);
        let record = DofRecord::from_loaded(&s, &confounds, &mask);
        assert_eq!(record.excised_vol, 2);
        assert_eq!(record.total, 4);
        assert_eq!(record.excised_vol_proportion, 0.25);

        let plain = strategy("simple", r#"{"denoise_strategy": "simple"}"#);
        let record = DofRecord::from_loaded(&plain, &confounds, &SampleMask::from_flags(vec![false; 8]));
        assert_eq!(record.excised_vol, 8);
        assert_eq!(record.total, 2);
    }

    #[test]
    fn empty_run_has_zero_proportion() {
        let s = strategy("baseline", r#"{"denoise_strategy": "baseline"}"#);
        let record = DofRecord::from_loaded(&s, &ConfoundTable::empty(0), &SampleMask::all_valid(0));
        assert_eq!(record.excised_vol_proportion, 0.0);
        assert_eq!(record.full_length, 0);
    }

    #[test]
    fn table_is_sorted_by_subject_and_keeps_first_record() {
        let simple = strategy("simple", r#"{"denoise_strategy": "simple"}"#);
        let baseline = strategy("baseline", r#"{"denoise_strategy": "baseline"}"#);
        let mut accountant = DofAccountant::new();
        accountant.accumulate("sub-02", &simple, &table(&["trans_x"], 4), &SampleMask::all_valid(4));
        accountant.accumulate("sub-01", &simple, &table(&["trans_x", "rot_x"], 4), &SampleMask::all_valid(4));
        accountant.accumulate("sub-01", &baseline, &ConfoundTable::empty(4), &SampleMask::all_valid(4));
        accountant.accumulate("sub-01", &simple, &ConfoundTable::empty(4), &SampleMask::all_valid(4));

        assert_eq!(accountant.record("sub-01", "simple").unwrap().total, 2);
        let out = accountant.to_table();
        assert_eq!(out.row_labels(), &["sub-01", "sub-02"]);
        assert_eq!(out.n_columns(), 18);
        assert!(out
            .value("sub-02", &ColumnKey::grouped("baseline", "total"))
            .unwrap()
            .is_nan());
        assert_eq!(out.value("sub-02", &ColumnKey::grouped("simple", "total")), Some(1.0));
    }
}
