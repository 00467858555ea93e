// error.rs

use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort a whole invocation.
///
/// Conditions local to one subject (a missing confound file, an empty time
/// series, an unreadable AROMA table) are never reported through this type;
/// they are logged and the subject is skipped.
#[derive(Error, Debug)]
pub enum BenchError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TSV/CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Strategy '{requested}' is not implemented. Available: {available:?}")]
    UnknownStrategy {
        requested: String,
        available: Vec<String>,
    },

    #[error("Strategy index {index} is out of range 0-{max}")]
    StrategyIndexOutOfRange { index: usize, max: usize },

    #[error("Malformed parameters for strategy '{strategy}': {reason}")]
    MalformedStrategy { strategy: String, reason: String },

    #[error("Motion QC preset '{requested}' is not implemented. Select from: None, {available:?}")]
    UnknownQcPreset {
        requested: String,
        available: Vec<String>,
    },

    #[error("No phenotype configuration for dataset '{0}'")]
    UnknownDataset(String),

    #[error("Cannot find participants file {0}")]
    ParticipantsMissing(PathBuf),

    #[error("File {0} is not a BIDS participant file")]
    ParticipantsMisnamed(PathBuf),

    #[error("Found more than one valid time series file: {0:?}")]
    AmbiguousTimeSeries(Vec<PathBuf>),

    #[error("No connectivity matrices provided")]
    EmptyConnectivity,

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Malformed table {path}: {reason}")]
    MalformedTable { path: PathBuf, reason: String },

    #[error("Progress bar template error: {0}")]
    ProgressTemplate(#[from] indicatif::style::TemplateError),

    #[error("Worker pool error: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T, E = BenchError> = std::result::Result<T, E>;
