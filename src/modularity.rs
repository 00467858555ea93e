// modularity.rs
//
// Modularity Evaluator. Each subject's vectorised connectome is rebuilt into a
// signed symmetric network and partitioned with the Louvain method, treating
// negative weights asymmetrically. Subjects run on a dedicated worker pool.

use crate::connectome::{regions_for_edges, Connectome};
use crate::error::{BenchError, Result};
use crate::metric_table::{ColumnKey, HeaderLayout, MetricTable};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use ndarray::{Array2, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_SEED: u64 = 42;
const GAIN_TOLERANCE: f64 = 1e-10;
const MAX_PASSES: usize = 1000;

/// Rebuilds the symmetric matrix (zero diagonal) from a strict lower-triangle
/// vector.
pub fn symmetric_from_vector(vector: &[f64]) -> Result<Array2<f64>> {
    let n = regions_for_edges(vector.len()).ok_or_else(|| {
        BenchError::ShapeMismatch(format!(
            "{} edges is not R(R-1)/2 for any region count",
            vector.len()
        ))
    })?;
    let mut matrix = Array2::<f64>::zeros((n, n));
    let mut values = vector.iter();
    for i in 0..n {
        for j in 0..i {
            if let Some(&v) = values.next() {
                matrix[[i, j]] = v;
                matrix[[j, i]] = v;
            }
        }
    }
    Ok(matrix)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    /// Community of each node, numbered from 0.
    pub communities: Vec<usize>,
    pub modularity: f64,
}

/// Modularity matrix with asymmetric negative weighting:
/// `B = B+ / s+ - B- / (s+ + s-)`, symmetrised.
fn signed_modularity_matrix(w: &Array2<f64>) -> Array2<f64> {
    let positive = w.mapv(|v| v.max(0.0));
    let negative = w.mapv(|v| (-v).max(0.0));
    let null_model = |part: &Array2<f64>| -> (Array2<f64>, f64) {
        let total = part.sum();
        if total == 0.0 {
            return (Array2::zeros(part.raw_dim()), 0.0);
        }
        let rows = part.sum_axis(Axis(1)).insert_axis(Axis(1));
        let cols = part.sum_axis(Axis(0)).insert_axis(Axis(0));
        (part - &(rows.dot(&cols) / total), total)
    };
    let (b_pos, s_pos) = null_model(&positive);
    let (b_neg, s_neg) = null_model(&negative);

    let mut b = Array2::<f64>::zeros(w.raw_dim());
    if s_pos > 0.0 {
        b = b + b_pos / s_pos;
    }
    if s_neg > 0.0 {
        b = b - b_neg / (s_pos + s_neg);
    }
    (&b + &b.t()) / 2.0
}

/// Relabels communities to 0..k in ascending order of their current label.
fn compact_labels(labels: &mut [usize]) -> usize {
    let mut distinct: Vec<usize> = labels.to_vec();
    distinct.sort_unstable();
    distinct.dedup();
    for label in labels.iter_mut() {
        // present by construction
        *label = distinct.binary_search(label).unwrap_or(0);
    }
    distinct.len()
}

/// Louvain community detection on a signed weighted network.
pub fn community_louvain(w: &Array2<f64>, rng: &mut ChaCha8Rng) -> Partition {
    let n_nodes = w.nrows();
    if n_nodes == 0 {
        return Partition { communities: Vec::new(), modularity: 0.0 };
    }
    let mut b = signed_modularity_matrix(w);
    let mut n = n_nodes;
    let mut membership: Vec<usize> = (0..n_nodes).collect();
    let mut q = b.diag().sum();
    let mut q_previous = f64::NEG_INFINITY;

    while q - q_previous > GAIN_TOLERANCE {
        let mut ci: Vec<usize> = (0..n).collect();
        let mut hnm = b.clone();
        let mut order: Vec<usize> = (0..n).collect();

        let mut moved = true;
        let mut passes = 0;
        while moved {
            passes += 1;
            if passes > MAX_PASSES {
                warn!("Louvain node moves did not settle after {} passes; stopping early.", MAX_PASSES);
                break;
            }
            moved = false;
            order.shuffle(rng);
            for &u in &order {
                let ma = ci[u];
                let base = hnm[[u, ma]] - b[[u, u]];
                let mut best = ma;
                let mut best_gain = 0.0;
                for m in 0..n {
                    if m == ma {
                        continue;
                    }
                    let gain = hnm[[u, m]] - base;
                    if gain > best_gain {
                        best_gain = gain;
                        best = m;
                    }
                }
                if best_gain > GAIN_TOLERANCE {
                    moved = true;
                    let column = b.column(u).to_owned();
                    let mut to = hnm.column_mut(best);
                    to += &column;
                    let mut from = hnm.column_mut(ma);
                    from -= &column;
                    ci[u] = best;
                }
            }
        }

        let n_communities = compact_labels(&mut ci);
        for node in membership.iter_mut() {
            *node = ci[*node];
        }

        let mut aggregated = Array2::<f64>::zeros((n_communities, n_communities));
        for i in 0..n {
            for j in 0..n {
                aggregated[[ci[i], ci[j]]] += b[[i, j]];
            }
        }
        b = aggregated;
        n = n_communities;
        q_previous = q;
        q = b.diag().sum();
    }

    Partition { communities: membership, modularity: q }
}

/// Modularity of one subject's vectorised connectome.
pub fn louvain_modularity(vector: &[f64], seed: u64) -> Result<f64> {
    let matrix = symmetric_from_vector(vector)?;
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    Ok(community_louvain(&matrix, &mut rng).modularity)
}

pub struct ModularityEvaluator {
    workers: usize,
    seed: u64,
}

impl Default for ModularityEvaluator {
    fn default() -> Self {
        Self { workers: DEFAULT_WORKERS, seed: DEFAULT_SEED }
    }
}

impl ModularityEvaluator {
    pub fn new(workers: usize, seed: u64) -> Self {
        Self { workers: workers.max(1), seed }
    }

    /// Per-subject modularity as a one-column table, or `None` when the
    /// connectome has no subjects.
    pub fn evaluate(&self, strategy_name: &str, connectome: &Connectome) -> Result<Option<MetricTable>> {
        if connectome.is_empty() {
            warn!("Connectome is empty for strategy {}. Skipping modularity computation.", strategy_name);
            return Ok(None);
        }
        info!(
            "Starting modularity computation for {} subjects on {} workers",
            connectome.n_subjects(),
            self.workers
        );
        let pool = rayon::ThreadPoolBuilder::new().num_threads(self.workers).build()?;

        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} subjects ({percent}%) ETA: {eta}")?
            .progress_chars("=> ");
        let progress = ProgressBar::new(connectome.n_subjects() as u64).with_style(style);

        // Seeds depend on the subject's row only, so results do not change
        // with the worker count.
        let rows: Vec<Vec<f64>> = connectome.edges.axis_iter(Axis(0)).map(|r| r.to_vec()).collect();
        let values: Vec<f64> = pool.install(|| {
            rows.par_iter()
                .enumerate()
                .map(|(row, edges)| {
                    let q = louvain_modularity(edges, self.seed.wrapping_add(row as u64));
                    progress.inc(1);
                    q
                })
                .collect::<Result<Vec<f64>>>()
        })?;
        progress.finish_and_clear();

        let mut table = MetricTable::with_rows("", HeaderLayout::Flat, connectome.subject_ids.clone());
        table.insert_column(ColumnKey::flat(strategy_name), values)?;
        debug!("Modularity computation completed for strategy {}", strategy_name);
        Ok(Some(table))
    }
}
