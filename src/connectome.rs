// connectome.rs
//
// Connectome Builder: per-subject Pearson correlation between regions,
// vectorised to the strict lower triangle in row-major order
// ((1,0), (2,0), (2,1), (3,0), ...).

use crate::error::{BenchError, Result};
use crate::phenotype::PhenotypeTable;
use crate::timeseries::AlignedTimeSeries;
use log::{debug, warn};
use ndarray::{Array1, Array2, Axis};
use std::collections::HashSet;

pub fn edge_count(n_regions: usize) -> usize {
    n_regions * n_regions.saturating_sub(1) / 2
}

/// Inverse of `edge_count`; `None` unless `n_edges` is triangular.
pub fn regions_for_edges(n_edges: usize) -> Option<usize> {
    let guess = ((1.0 + (1.0 + 8.0 * n_edges as f64).sqrt()) / 2.0).round() as usize;
    (guess.saturating_sub(1)..=guess + 1).find(|&r| r >= 2 && edge_count(r) == n_edges)
}

/// `(i, j)` with `i > j`, row-major.
pub fn lower_triangle_indices(n_regions: usize) -> Vec<(usize, usize)> {
    (0..n_regions).flat_map(|i| (0..i).map(move |j| (i, j))).collect()
}

pub fn edge_labels(n_regions: usize) -> Vec<String> {
    lower_triangle_indices(n_regions)
        .into_iter()
        .map(|(i, j)| format!("{}_{}", i, j))
        .collect()
}

/// Pearson correlation between the columns of a T x R matrix.
/// Constant columns yield NaN correlations.
pub fn correlation_matrix(series: &Array2<f64>) -> Array2<f64> {
    let n_regions = series.ncols();
    let means = series
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::from_elem(n_regions, f64::NAN));
    let centered = series - &means;
    let covariance = centered.t().dot(&centered);
    let scale: Array1<f64> = covariance.diag().mapv(f64::sqrt);
    let mut corr = Array2::<f64>::zeros((n_regions, n_regions));
    for i in 0..n_regions {
        for j in 0..n_regions {
            corr[[i, j]] = (covariance[[i, j]] / (scale[i] * scale[j])).clamp(-1.0, 1.0);
        }
    }
    corr
}

pub fn vectorize_lower(matrix: &Array2<f64>) -> Vec<f64> {
    lower_triangle_indices(matrix.nrows())
        .into_iter()
        .map(|(i, j)| matrix[[i, j]])
        .collect()
}

/// Subjects x edges connectivity for one strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct Connectome {
    pub subject_ids: Vec<String>,
    pub n_regions: usize,
    pub edges: Array2<f64>,
}

impl Connectome {
    pub fn from_timeseries(aligned: &AlignedTimeSeries) -> Result<Self> {
        let n_regions = aligned.regions.len();
        let n_edges = edge_count(n_regions);
        let mut edges = Array2::<f64>::zeros((aligned.len(), n_edges));
        for (row, (subject, series)) in aligned.subject_ids.iter().zip(&aligned.series).enumerate() {
            if series.ncols() != n_regions {
                return Err(BenchError::ShapeMismatch(format!(
                    "{} has {} regions, expected {}",
                    subject,
                    series.ncols(),
                    n_regions
                )));
            }
            let vector = vectorize_lower(&correlation_matrix(series));
            if vector.iter().any(|v| v.is_nan()) {
                warn!("Connectome of {} contains undefined correlations (constant region signal).", subject);
            }
            edges.row_mut(row).assign(&Array1::from(vector));
        }
        debug!("Built connectome of {} subjects x {} edges", aligned.len(), n_edges);
        Ok(Self {
            subject_ids: aligned.subject_ids.clone(),
            n_regions,
            edges,
        })
    }

    pub fn n_subjects(&self) -> usize {
        self.subject_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subject_ids.is_empty()
    }

    pub fn edge_labels(&self) -> Vec<String> {
        edge_labels(self.n_regions)
    }

    /// Mean of each edge over the subjects where it is defined. NaN only when
    /// no subject defines the edge.
    pub fn mean_per_edge(&self) -> Vec<f64> {
        self.edges
            .axis_iter(Axis(1))
            .map(|column| {
                let (sum, count) = column
                    .iter()
                    .filter(|v| !v.is_nan())
                    .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
                if count == 0 {
                    f64::NAN
                } else {
                    sum / count as f64
                }
            })
            .collect()
    }

    /// Rows of the given subjects, in the order given. Unknown ids are ignored.
    pub fn select_subjects(&self, ids: &[String]) -> Self {
        let rows: Vec<usize> = ids
            .iter()
            .filter_map(|id| self.subject_ids.iter().position(|s| s == id))
            .collect();
        Self {
            subject_ids: rows.iter().map(|&r| self.subject_ids[r].clone()).collect(),
            n_regions: self.n_regions,
            edges: self.edges.select(Axis(0), &rows),
        }
    }

    /// Restricts connectome and phenotype to the subjects present in both.
    pub fn intersect_with(&self, phenotype: &PhenotypeTable) -> (Self, PhenotypeTable) {
        let shared: Vec<String> = self
            .subject_ids
            .iter()
            .filter(|id| phenotype.get(id).is_some())
            .cloned()
            .collect();
        if shared.len() != self.n_subjects() || shared.len() != phenotype.len() {
            warn!(
                "Taking conjunction of the phenotype ({} rows) and connectome ({} rows): {} subjects kept.",
                phenotype.len(),
                self.n_subjects(),
                shared.len()
            );
        }
        let keep: HashSet<&str> = shared.iter().map(String::as_str).collect();
        let mut reduced = phenotype.clone();
        reduced.retain(|id, _| keep.contains(id));
        (self.select_subjects(&shared), reduced)
    }
}
