//! Benchmarking of fMRI denoising strategies.
//!
//! Confound regressors from fMRIPrep are reduced per strategy and accounted
//! for in degrees of freedom; extracted region time series are turned into
//! connectomes and scored with QC-FC and modularity, and the scores are merged
//! into per-dataset metric tables.

pub mod config;
pub mod confounds;
pub mod connectome;
pub mod dof;
pub mod error;
pub mod metric_table;
pub mod modularity;
pub mod phenotype;
pub mod qcfc;
pub mod strategy;
pub mod timeseries;
pub mod tsv;

pub use error::{BenchError, Result};
