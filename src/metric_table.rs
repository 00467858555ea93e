// metric_table.rs
//
// Aggregation/Merge Layer. A `MetricTable` is the on-disk result of one
// (dataset, version, atlas, dimension, metric) key. New columns are merged
// into the prior table under an exclusive lock and committed by atomic rename.

use crate::error::{BenchError, Result};
use crate::tsv;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

pub const QCFC_CORRELATION_SUFFIX: &str = "_correlation";
pub const QCFC_P_VALUE_SUFFIX: &str = "_p_value";

/// Column key: a strategy name, or a (group, label) pair for hierarchical tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ColumnKey {
    Flat(String),
    Grouped { group: String, label: String },
}

impl ColumnKey {
    pub fn flat(name: impl Into<String>) -> Self {
        Self::Flat(name.into())
    }

    pub fn grouped(group: impl Into<String>, label: impl Into<String>) -> Self {
        Self::Grouped { group: group.into(), label: label.into() }
    }

    /// Strategy a column belongs to. QC-FC labels carry a metric suffix.
    pub fn strategy(&self) -> &str {
        match self {
            Self::Flat(name) => name,
            Self::Grouped { label, .. } => label
                .strip_suffix(QCFC_CORRELATION_SUFFIX)
                .or_else(|| label.strip_suffix(QCFC_P_VALUE_SUFFIX))
                .unwrap_or(label),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderLayout {
    /// One header row.
    Flat,
    /// Two header rows: group, then label.
    Hierarchical,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricTable {
    index_name: String,
    layout: HeaderLayout,
    row_labels: Vec<String>,
    keys: Vec<ColumnKey>,
    columns: Vec<Vec<f64>>,
}

impl MetricTable {
    pub fn new(index_name: impl Into<String>, layout: HeaderLayout) -> Self {
        Self {
            index_name: index_name.into(),
            layout,
            row_labels: Vec::new(),
            keys: Vec::new(),
            columns: Vec::new(),
        }
    }

    pub fn with_rows(index_name: impl Into<String>, layout: HeaderLayout, row_labels: Vec<String>) -> Self {
        Self { row_labels, ..Self::new(index_name, layout) }
    }

    pub fn layout(&self) -> HeaderLayout {
        self.layout
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn row_labels(&self) -> &[String] {
        &self.row_labels
    }

    pub fn column_keys(&self) -> &[ColumnKey] {
        &self.keys
    }

    pub fn n_rows(&self) -> usize {
        self.row_labels.len()
    }

    pub fn n_columns(&self) -> usize {
        self.keys.len()
    }

    pub fn column(&self, key: &ColumnKey) -> Option<&[f64]> {
        self.keys.iter().position(|k| k == key).map(|i| self.columns[i].as_slice())
    }

    pub fn value(&self, row_label: &str, key: &ColumnKey) -> Option<f64> {
        let row = self.row_labels.iter().position(|r| r == row_label)?;
        self.column(key).map(|col| col[row])
    }

    /// Adds or replaces a whole column aligned with the current rows.
    pub fn insert_column(&mut self, key: ColumnKey, values: Vec<f64>) -> Result<()> {
        if values.len() != self.row_labels.len() {
            return Err(BenchError::ShapeMismatch(format!(
                "column {:?} has {} values for {} rows",
                key,
                values.len(),
                self.row_labels.len()
            )));
        }
        match self.keys.iter().position(|k| *k == key) {
            Some(idx) => self.columns[idx] = values,
            None => {
                self.keys.push(key);
                self.columns.push(values);
            }
        }
        Ok(())
    }

    /// Sets one cell, growing rows and columns as needed. New cells are NaN.
    pub fn set(&mut self, row_label: &str, key: ColumnKey, value: f64) {
        let row = match self.row_labels.iter().position(|r| r == row_label) {
            Some(row) => row,
            None => {
                self.row_labels.push(row_label.to_string());
                self.columns.iter_mut().for_each(|col| col.push(f64::NAN));
                self.row_labels.len() - 1
            }
        };
        let col = match self.keys.iter().position(|k| *k == key) {
            Some(col) => col,
            None => {
                self.keys.push(key);
                self.columns.push(vec![f64::NAN; self.row_labels.len()]);
                self.keys.len() - 1
            }
        };
        self.columns[col][row] = value;
    }

    pub fn sort_rows(&mut self) {
        let mut order: Vec<usize> = (0..self.row_labels.len()).collect();
        order.sort_by(|&a, &b| self.row_labels[a].cmp(&self.row_labels[b]));
        self.permute_rows(&order);
    }

    pub fn retain_rows<F: Fn(&str) -> bool>(&mut self, keep: F) {
        let order: Vec<usize> = (0..self.row_labels.len()).filter(|&i| keep(&self.row_labels[i])).collect();
        self.permute_rows(&order);
    }

    fn permute_rows(&mut self, order: &[usize]) {
        self.row_labels = order.iter().map(|&i| self.row_labels[i].clone()).collect();
        for col in self.columns.iter_mut() {
            *col = order.iter().map(|&i| col[i]).collect();
        }
    }

    // --- Merge ---

    /// Replace-on-overlap outer join. Prior columns whose key appears in `new`
    /// are dropped; prior rows keep their order and new rows are appended.
    pub fn merge_replace(self, new: MetricTable) -> MetricTable {
        let replaced: HashSet<&ColumnKey> = new.keys.iter().collect();
        let mut merged = MetricTable::with_rows(self.index_name.clone(), new.layout, self.row_labels.clone());
        for (key, values) in self.keys.iter().zip(&self.columns) {
            if !replaced.contains(key) {
                merged.keys.push(key.clone());
                merged.columns.push(values.clone());
            }
        }

        let mut row_position: HashMap<String, usize> =
            merged.row_labels.iter().enumerate().map(|(i, r)| (r.clone(), i)).collect();
        for label in &new.row_labels {
            if !row_position.contains_key(label) {
                row_position.insert(label.clone(), merged.row_labels.len());
                merged.row_labels.push(label.clone());
            }
        }
        let n_rows = merged.row_labels.len();
        for col in merged.columns.iter_mut() {
            col.resize(n_rows, f64::NAN);
        }
        for (key, values) in new.keys.into_iter().zip(new.columns) {
            let mut aligned = vec![f64::NAN; n_rows];
            for (label, value) in new.row_labels.iter().zip(values) {
                aligned[row_position[label]] = value;
            }
            merged.keys.push(key);
            merged.columns.push(aligned);
        }
        merged
    }

    /// Reorders columns by the canonical strategy ordering. Flat columns of
    /// strategies not in `canonical` are dropped; grouped ones follow the
    /// known strategies within their group, sorted by name.
    pub fn apply_canonical_order(&mut self, canonical: &[String]) {
        let known = |key: &ColumnKey| {
            matches!(key, ColumnKey::Grouped { .. }) || canonical.iter().any(|s| s == key.strategy())
        };
        if !self.keys.iter().all(|key| known(key)) {
            let (keys, columns): (Vec<ColumnKey>, Vec<Vec<f64>>) = std::mem::take(&mut self.keys)
                .into_iter()
                .zip(std::mem::take(&mut self.columns))
                .filter(|(key, _)| {
                    let keep = known(key);
                    if !keep {
                        warn!("Dropping column '{}': not a registered strategy.", key.strategy());
                    }
                    keep
                })
                .unzip();
            self.keys = keys;
            self.columns = columns;
        }
        let rank = |key: &ColumnKey| {
            let strategy = key.strategy();
            canonical
                .iter()
                .position(|s| s == strategy)
                .unwrap_or(canonical.len())
        };
        let mut order: Vec<usize> = (0..self.keys.len()).collect();
        order.sort_by(|&a, &b| {
            let (ka, kb) = (&self.keys[a], &self.keys[b]);
            match (ka, kb) {
                (ColumnKey::Grouped { group: ga, label: la }, ColumnKey::Grouped { group: gb, label: lb }) => ga
                    .cmp(gb)
                    .then(rank(ka).cmp(&rank(kb)))
                    .then(ka.strategy().cmp(kb.strategy()))
                    .then(la.cmp(lb)),
                _ => rank(ka).cmp(&rank(kb)).then(ka.cmp(kb)),
            }
        });
        self.keys = order.iter().map(|&i| self.keys[i].clone()).collect();
        self.columns = order.iter().map(|&i| std::mem::take(&mut self.columns[i])).collect();
    }

    // --- I/O ---

    pub fn read(path: &Path, layout: HeaderLayout) -> Result<Self> {
        let malformed = |reason: String| BenchError::MalformedTable { path: path.to_path_buf(), reason };
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .flexible(true)
            .from_path(path)?;
        let mut records = reader.records();
        let first = records
            .next()
            .ok_or_else(|| malformed("missing header row".to_string()))??;
        let index_name = first.get(0).unwrap_or_default().to_string();
        let keys: Vec<ColumnKey> = match layout {
            HeaderLayout::Flat => first.iter().skip(1).map(ColumnKey::flat).collect(),
            HeaderLayout::Hierarchical => {
                let second = records
                    .next()
                    .ok_or_else(|| malformed("missing second header row".to_string()))??;
                if second.len() != first.len() {
                    return Err(malformed("header rows differ in length".to_string()));
                }
                first
                    .iter()
                    .zip(second.iter())
                    .skip(1)
                    .map(|(group, label)| ColumnKey::grouped(group, label))
                    .collect()
            }
        };

        let mut table = MetricTable::new(index_name, layout);
        table.columns = vec![Vec::new(); keys.len()];
        table.keys = keys;
        for record in records {
            let record = record?;
            if record.len() != table.keys.len() + 1 {
                return Err(malformed(format!(
                    "row has {} cells, expected {}",
                    record.len(),
                    table.keys.len() + 1
                )));
            }
            table.row_labels.push(record.get(0).unwrap_or_default().to_string());
            for (col, cell) in table.columns.iter_mut().zip(record.iter().skip(1)) {
                col.push(tsv::parse_cell(cell).ok_or_else(|| malformed(format!("non-numeric cell '{}'", cell)))?);
            }
        }
        Ok(table)
    }

    pub fn write<W: std::io::Write>(&self, inner: W) -> Result<()> {
        let mut writer = tsv::tsv_writer(inner);
        match self.layout {
            HeaderLayout::Flat => {
                let mut header = vec![self.index_name.clone()];
                for key in &self.keys {
                    header.push(match key {
                        ColumnKey::Flat(name) => name.clone(),
                        ColumnKey::Grouped { group, label } => format!("{}_{}", group, label),
                    });
                }
                writer.write_record(&header)?;
            }
            HeaderLayout::Hierarchical => {
                let mut groups = vec![self.index_name.clone()];
                let mut labels = vec![String::new()];
                for key in &self.keys {
                    match key {
                        ColumnKey::Grouped { group, label } => {
                            groups.push(group.clone());
                            labels.push(label.clone());
                        }
                        ColumnKey::Flat(name) => {
                            groups.push(name.clone());
                            labels.push(String::new());
                        }
                    }
                }
                writer.write_record(&groups)?;
                writer.write_record(&labels)?;
            }
        }
        for (row, label) in self.row_labels.iter().enumerate() {
            let mut record = vec![label.clone()];
            record.extend(self.columns.iter().map(|col| tsv::format_cell(col[row])));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn write_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.write(File::create(path)?)
    }
}

// --- Locking ---

/// Advisory exclusive lock on `<output>.lock`, held until drop.
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn acquire(target: &Path) -> Result<Self> {
        let mut lock_name = target.as_os_str().to_owned();
        lock_name.push(".lock");
        let path = PathBuf::from(lock_name);
        let file = OpenOptions::new().create(true).write(true).truncate(false).open(&path)?;
        Self::lock_exclusive(&file)?;
        debug!("Acquired lock {}", path.display());
        Ok(Self { file, path })
    }

    #[cfg(unix)]
    fn lock_exclusive(file: &File) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn lock_exclusive(_file: &File) -> Result<()> {
        warn!("Advisory file locking is unavailable on this platform; concurrent writers are not serialized.");
        Ok(())
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: see `lock_exclusive`.
            let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
            if rc != 0 {
                warn!("Failed to release lock {}: {}", self.path.display(), std::io::Error::last_os_error());
            }
        }
        debug!("Released lock {}", self.path.display());
    }
}

// --- Transaction ---

/// Open, merge with replace-on-overlap, commit atomically.
pub struct MetricTransaction {
    path: PathBuf,
    layout: HeaderLayout,
    current: Option<MetricTable>,
    _lock: FileLock,
}

impl MetricTransaction {
    pub fn open(path: &Path, layout: HeaderLayout) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock = FileLock::acquire(path)?;
        let current = if path.is_file() {
            info!("Merging into existing metric table {}", path.display());
            Some(MetricTable::read(path, layout)?)
        } else {
            None
        };
        Ok(Self { path: path.to_path_buf(), layout, current, _lock: lock })
    }

    pub fn merge(&mut self, new: MetricTable) {
        if new.layout != self.layout {
            warn!(
                "Merging a {:?} table into {:?} output {}",
                new.layout,
                self.layout,
                self.path.display()
            );
        }
        self.current = Some(match self.current.take() {
            Some(old) => old.merge_replace(new),
            None => new,
        });
    }

    /// Writes the merged table next to the destination and renames it over
    /// the destination. The lock is released afterwards.
    pub fn commit(self, canonical: &[String]) -> Result<()> {
        let Some(mut table) = self.current else {
            debug!("Nothing to commit for {}", self.path.display());
            return Ok(());
        };
        table.apply_canonical_order(canonical);
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let tmp = tempfile::NamedTempFile::new_in(parent)?;
        table.write(tmp.as_file())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| BenchError::Io(e.error))?;
        info!(
            "Wrote {} rows x {} columns to {}",
            table.n_rows(),
            table.n_columns(),
            self.path.display()
        );
        Ok(())
    }
}

/// Lock, merge `new` into `path` and commit in canonical order.
pub fn commit_merged(path: &Path, new: MetricTable, canonical: &[String]) -> Result<()> {
    let mut transaction = MetricTransaction::open(path, new.layout())?;
    transaction.merge(new);
    transaction.commit(canonical)
}
