// config.rs
//
// Externally supplied configuration that is consumed by name: motion QC
// presets and the per-dataset phenotype column conventions.

use crate::error::{BenchError, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Thresholds of one motion QC preset. All `None` means "no filtering".
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MotionQc {
    pub gross_fd: Option<f64>,
    pub fd_thresh: Option<f64>,
    pub proportion_thresh: Option<f64>,
}

impl MotionQc {
    pub fn is_disabled(&self) -> bool {
        self.gross_fd.is_none() && self.fd_thresh.is_none() && self.proportion_thresh.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct MotionQcPresets {
    presets: BTreeMap<String, MotionQc>,
}

impl Default for MotionQcPresets {
    fn default() -> Self {
        let mut presets = BTreeMap::new();
        presets.insert(
            "minimal".to_string(),
            MotionQc { gross_fd: Some(0.55), fd_thresh: Some(0.2), proportion_thresh: Some(0.2) },
        );
        presets.insert(
            "stringent".to_string(),
            MotionQc { gross_fd: Some(0.25), fd_thresh: Some(0.2), proportion_thresh: Some(0.2) },
        );
        Self { presets }
    }
}

impl MotionQcPresets {
    pub fn from_path(path: &Path) -> Result<Self> {
        info!("Loading motion QC presets from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let presets: BTreeMap<String, MotionQc> = serde_json::from_str(text)?;
        Ok(Self { presets })
    }

    /// `None` selects no filtering; an unknown name is a configuration error.
    pub fn criteria(&self, name: Option<&str>) -> Result<MotionQc> {
        match name {
            None => {
                info!("No motion QC.");
                Ok(MotionQc::default())
            }
            Some(name) => self.presets.get(name).copied().ok_or_else(|| BenchError::UnknownQcPreset {
                requested: name.to_string(),
                available: self.presets.keys().cloned().collect(),
            }),
        }
    }
}

/// Column naming of one dataset's participants.tsv.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetPhenotypeColumns {
    pub age: String,
    pub gender: String,
    pub group: String,
    /// Maps string gender codes to the 0/1 encoding used as a covariate.
    #[serde(default = "default_gender_codes")]
    pub gender_codes: BTreeMap<String, f64>,
}

fn default_gender_codes() -> BTreeMap<String, f64> {
    BTreeMap::from([("F".to_string(), 1.0), ("M".to_string(), 0.0)])
}

/// Dataset identifier to phenotype column conventions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhenotypeConfig {
    pub datasets: BTreeMap<String, DatasetPhenotypeColumns>,
}

impl Default for PhenotypeConfig {
    fn default() -> Self {
        let mut datasets = BTreeMap::new();
        datasets.insert(
            "ds000228".to_string(),
            DatasetPhenotypeColumns {
                age: "Age".to_string(),
                gender: "Gender".to_string(),
                group: "Child_Adult".to_string(),
                gender_codes: default_gender_codes(),
            },
        );
        datasets.insert(
            "ds000030".to_string(),
            DatasetPhenotypeColumns {
                age: "age".to_string(),
                gender: "gender".to_string(),
                group: "diagnosis".to_string(),
                gender_codes: default_gender_codes(),
            },
        );
        Self { datasets }
    }
}

impl PhenotypeConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        info!("Loading phenotype configuration from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn columns_for(&self, dataset: &str) -> Result<&DatasetPhenotypeColumns> {
        self.datasets
            .get(dataset)
            .ok_or_else(|| BenchError::UnknownDataset(dataset.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_preset_disables_filtering() {
        let qc = MotionQcPresets::default().criteria(None).unwrap();
        assert!(qc.is_disabled());
    }

    #[test]
    fn named_preset_lookup() {
        let presets = MotionQcPresets::from_json_str(
            r#"{"stringent": {"gross_fd": 0.25, "fd_thresh": 0.2, "proportion_thresh": 0.2}}"#,
        )
        .unwrap();
        let qc = presets.criteria(Some("stringent")).unwrap();
        assert_eq!(qc.gross_fd, Some(0.25));
        assert!(matches!(
            presets.criteria(Some("lenient")),
            Err(BenchError::UnknownQcPreset { .. })
        ));
    }

    #[test]
    fn phenotype_config_parses_with_default_gender_codes() {
        let config: PhenotypeConfig = serde_json::from_str(
            r#"{"datasets": {"dsX": {"age": "Age", "gender": "Sex", "group": "Dx"}}}"#,
        )
        .unwrap();
        let cols = config.columns_for("dsX").unwrap();
        assert_eq!(cols.gender_codes.get("F"), Some(&1.0));
        assert!(config.columns_for("ds000228").is_err());
        assert_eq!(PhenotypeConfig::default().columns_for("ds000228").unwrap().group, "Child_Adult");
    }
}
