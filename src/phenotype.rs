// phenotype.rs
//
// Movement summary and participant phenotype: mean framewise displacement per
// subject joined with age, gender and group from participants.tsv, plus the
// motion QC filter applied before any connectome statistics.

use crate::config::{DatasetPhenotypeColumns, MotionQc};
use crate::dof::EXCISED_VOL_PROPORTION;
use crate::error::{BenchError, Result};
use crate::metric_table::{ColumnKey, MetricTable};
use crate::tsv::{self, StringTable};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

pub const PARTICIPANTS_FILE: &str = "participants.tsv";
pub const PARTICIPANT_ID: &str = "participant_id";
pub const MEAN_FD: &str = "mean_framewise_displacement";
const FRAMEWISE_DISPLACEMENT: &str = "framewise_displacement";
const HEADER: [&str; 5] = [PARTICIPANT_ID, MEAN_FD, "age", "gender", "groups"];

#[derive(Debug, Clone, PartialEq)]
pub struct PhenotypeRow {
    pub mean_fd: f64,
    pub age: f64,
    /// 0/1 encoded.
    pub gender: f64,
    pub group: String,
}

/// Per-subject phenotype, ordered by subject identifier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhenotypeTable {
    rows: BTreeMap<String, PhenotypeRow>,
}

impl PhenotypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, subject_id: impl Into<String>, row: PhenotypeRow) {
        self.rows.insert(subject_id.into(), row);
    }

    pub fn get(&self, subject_id: &str) -> Option<&PhenotypeRow> {
        self.rows.get(subject_id)
    }

    pub fn subject_ids(&self) -> Vec<String> {
        self.rows.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Distinct group labels in subject order of first appearance.
    pub fn groups(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.rows
            .values()
            .filter(|row| seen.insert(row.group.clone()))
            .map(|row| row.group.clone())
            .collect()
    }

    pub fn retain<F: Fn(&str, &PhenotypeRow) -> bool>(&mut self, keep: F) {
        self.rows.retain(|id, row| keep(id, row));
    }

    pub fn read(path: &Path) -> Result<Self> {
        let table = tsv::read_string_table(path)?;
        let column = |name: &str| {
            table.column_index(name).ok_or_else(|| BenchError::MalformedTable {
                path: path.to_path_buf(),
                reason: format!("missing column '{}'", name),
            })
        };
        let (id_col, fd_col, age_col, gender_col, group_col) =
            (column(HEADER[0])?, column(HEADER[1])?, column(HEADER[2])?, column(HEADER[3])?, column(HEADER[4])?);
        let number = |cell: &str| tsv::parse_cell(cell).unwrap_or(f64::NAN);
        let mut out = Self::new();
        for row in &table.rows {
            out.insert(
                row[id_col].clone(),
                PhenotypeRow {
                    mean_fd: number(&row[fd_col]),
                    age: number(&row[age_col]),
                    gender: number(&row[gender_col]),
                    group: row[group_col].clone(),
                },
            );
        }
        Ok(out)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = tsv::tsv_writer(std::fs::File::create(path)?);
        writer.write_record(HEADER)?;
        for (id, row) in &self.rows {
            writer.write_record([
                id.clone(),
                tsv::format_cell(row.mean_fd),
                tsv::format_cell(row.age),
                tsv::format_cell(row.gender),
                row.group.clone(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }
}

// --- Participants ---

/// Reads the BIDS participants file. The file must exist and be named
/// `participants.tsv`.
pub fn load_participants(path: &Path) -> Result<StringTable> {
    if !path.is_file() {
        return Err(BenchError::ParticipantsMissing(path.to_path_buf()));
    }
    if path.file_name().and_then(|n| n.to_str()) != Some(PARTICIPANTS_FILE) {
        return Err(BenchError::ParticipantsMisnamed(path.to_path_buf()));
    }
    let table = tsv::read_string_table(path)?;
    if table.column_index(PARTICIPANT_ID).is_none() {
        return Err(BenchError::MalformedTable {
            path: path.to_path_buf(),
            reason: format!("missing index column '{}'", PARTICIPANT_ID),
        });
    }
    debug!("Loaded {} with {} rows", path.display(), table.rows.len());
    Ok(table)
}

/// Mean framewise displacement over the run, skipping missing values.
/// `None` when the confounds file has no framewise displacement column.
pub fn mean_framewise_displacement(confounds_path: &Path) -> Result<Option<f64>> {
    let (names, columns, _) = tsv::read_numeric_columns(confounds_path)?;
    let Some(idx) = names.iter().position(|n| n == FRAMEWISE_DISPLACEMENT) else {
        return Ok(None);
    };
    let finite: Vec<f64> = columns[idx].iter().copied().filter(|v| !v.is_nan()).collect();
    if finite.is_empty() {
        return Ok(Some(f64::NAN));
    }
    Ok(Some(finite.iter().sum::<f64>() / finite.len() as f64))
}

fn encode_gender(value: &str, columns: &DatasetPhenotypeColumns) -> f64 {
    if let Some(code) = columns.gender_codes.get(value.trim()) {
        return *code;
    }
    tsv::parse_cell(value).unwrap_or_else(|| {
        warn!("Unrecognised gender code '{}'; recorded as missing.", value);
        f64::NAN
    })
}

/// Inner join of per-subject mean FD with the participants' age, gender and group.
pub fn movement_summary(
    mean_fd: &BTreeMap<String, f64>,
    participants: &StringTable,
    columns: &DatasetPhenotypeColumns,
) -> Result<PhenotypeTable> {
    let missing = |name: &str| BenchError::MalformedTable {
        path: Path::new(PARTICIPANTS_FILE).to_path_buf(),
        reason: format!("missing column '{}'", name),
    };
    let id_col = participants.column_index(PARTICIPANT_ID).ok_or_else(|| missing(PARTICIPANT_ID))?;
    let age_col = participants.column_index(&columns.age).ok_or_else(|| missing(&columns.age))?;
    let gender_col = participants.column_index(&columns.gender).ok_or_else(|| missing(&columns.gender))?;
    let group_col = participants.column_index(&columns.group).ok_or_else(|| missing(&columns.group))?;

    let mut summary = PhenotypeTable::new();
    for row in &participants.rows {
        let Some(fd) = mean_fd.get(&row[id_col]) else {
            continue;
        };
        summary.insert(
            row[id_col].clone(),
            PhenotypeRow {
                mean_fd: *fd,
                age: tsv::parse_cell(&row[age_col]).unwrap_or(f64::NAN),
                gender: encode_gender(&row[gender_col], columns),
                group: row[group_col].clone(),
            },
        );
    }
    info!(
        "Movement summary: {} subjects with motion estimates, {} in participants file, {} joined.",
        mean_fd.len(),
        participants.rows.len(),
        summary.len()
    );
    Ok(summary)
}

/// DoF column holding the excised proportion for the scrubbing strategy that
/// matches the QC FD threshold, e.g. 0.2 -> `scrubbing.2`.
pub fn scrubbing_proportion_key(fd_thresh: f64) -> ColumnKey {
    let text = fd_thresh.to_string();
    let digits = text.split('.').nth(1).unwrap_or(&text);
    ColumnKey::grouped(format!("scrubbing.{}", digits), EXCISED_VOL_PROPORTION)
}

/// Drops subjects failing the motion QC preset.
pub fn apply_motion_qc(phenotype: &mut PhenotypeTable, dof: Option<&MetricTable>, qc: &MotionQc) {
    if qc.is_disabled() {
        return;
    }
    let before = phenotype.len();
    if let Some(gross_fd) = qc.gross_fd {
        phenotype.retain(|_, row| !(row.mean_fd > gross_fd));
    }
    if let (Some(fd_thresh), Some(proportion_thresh)) = (qc.fd_thresh, qc.proportion_thresh) {
        let key = scrubbing_proportion_key(fd_thresh);
        match dof.filter(|table| table.column(&key).is_some()) {
            Some(table) => phenotype.retain(|id, _| {
                !table
                    .value(id, &key)
                    .map_or(false, |proportion| proportion > proportion_thresh)
            }),
            None => warn!(
                "DoF column {:?} not available; excised-volume proportion filter skipped.",
                key
            ),
        }
    }
    info!("Motion QC kept {} of {} subjects.", phenotype.len(), before);
}
