// qcfc.rs
//
// QC-FC Evaluator: correlation between each connectivity edge and mean
// framewise displacement across subjects, after regressing age and gender
// out of both.

use crate::connectome::Connectome;
use crate::error::{BenchError, Result};
use crate::metric_table::{ColumnKey, HeaderLayout, MetricTable, QCFC_CORRELATION_SUFFIX, QCFC_P_VALUE_SUFFIX};
use crate::phenotype::PhenotypeTable;
use log::{debug, info, warn};
use ndarray::{Array1, Array2, Axis};
use statrs::distribution::{ContinuousCDF, StudentsT};

pub const FULL_SAMPLE: &str = "full_sample";
/// A design column whose norm shrinks below this fraction of its original
/// norm during orthogonalisation is linearly dependent on earlier columns.
const RANK_TOLERANCE: f64 = 1e-10;

/// Per-edge correlation with motion and its two-tailed p-value.
#[derive(Debug, Clone, PartialEq)]
pub struct QcfcResult {
    pub correlation: Vec<f64>,
    pub p_value: Vec<f64>,
    pub dof: f64,
}

// --- Design matrix ---

/// `[intercept, age, gender]`, each non-constant column z-scored (population
/// standard deviation). Constant columns are left as they are.
pub fn covariate_design(age: &[f64], gender: &[f64]) -> Array2<f64> {
    let n = age.len();
    let mut design = Array2::<f64>::ones((n, 3));
    design.column_mut(1).assign(&Array1::from(age.to_vec()));
    design.column_mut(2).assign(&Array1::from(gender.to_vec()));
    for mut column in design.columns_mut() {
        if n == 0 {
            break;
        }
        let mean = column.sum() / n as f64;
        let std = (column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64).sqrt();
        if std > 0.0 && std.is_finite() {
            column.mapv_inplace(|v| (v - mean) / std);
        }
    }
    design
}

/// Orthonormal basis of the design's column space, by modified Gram-Schmidt
/// with one reorthogonalisation pass. Its length is the design rank.
fn orthonormal_basis(design: &Array2<f64>) -> Vec<Array1<f64>> {
    let mut basis: Vec<Array1<f64>> = Vec::new();
    for column in design.columns() {
        let mut v = column.to_owned();
        let original_norm = v.dot(&v).sqrt();
        if !(original_norm.is_finite() && original_norm > 0.0) {
            continue;
        }
        for _ in 0..2 {
            for q in &basis {
                let projection = q.dot(&v);
                v.scaled_add(-projection, q);
            }
        }
        let norm = v.dot(&v).sqrt();
        if norm > RANK_TOLERANCE * original_norm {
            basis.push(v / norm);
        }
    }
    basis
}

fn residualize_matrix(basis: &[Array1<f64>], mut values: Array2<f64>) -> Array2<f64> {
    for q in basis {
        let coefficients = q.dot(&values);
        let fitted = q
            .view()
            .insert_axis(Axis(1))
            .dot(&coefficients.view().insert_axis(Axis(0)));
        values -= &fitted;
    }
    values
}

fn residualize_vector(basis: &[Array1<f64>], mut values: Array1<f64>) -> Array1<f64> {
    for q in basis {
        let projection = q.dot(&values);
        values.scaled_add(-projection, q);
    }
    values
}

/// Two-tailed p-value of Student's t. NaN when `dof` is not positive.
pub fn two_tailed_p(t: f64, dof: f64) -> f64 {
    if t.is_nan() || !(dof > 0.0) {
        return f64::NAN;
    }
    if t.is_infinite() {
        return 0.0;
    }
    match StudentsT::new(0.0, 1.0, dof) {
        Ok(dist) => (2.0 * dist.sf(t.abs())).clamp(0.0, 1.0),
        Err(_) => f64::NAN,
    }
}

// --- Evaluation ---

/// QC-FC over all edges at once.
///
/// `edges` is subjects x edges, aligned row by row with `motion`, `age` and
/// `gender`. Subjects missing motion, age or gender are left out. Degrees of
/// freedom are the remaining subjects minus covariate rank minus two.
pub fn evaluate(motion: &[f64], edges: &Array2<f64>, age: &[f64], gender: &[f64]) -> Result<QcfcResult> {
    if edges.nrows() == 0 {
        return Err(BenchError::EmptyConnectivity);
    }
    if motion.len() != edges.nrows() || age.len() != edges.nrows() || gender.len() != edges.nrows() {
        return Err(BenchError::ShapeMismatch(format!(
            "{} connectomes but {} motion, {} age, {} gender values",
            edges.nrows(),
            motion.len(),
            age.len(),
            gender.len()
        )));
    }

    let complete: Vec<usize> = (0..edges.nrows())
        .filter(|&i| motion[i].is_finite() && age[i].is_finite() && gender[i].is_finite())
        .collect();
    if complete.len() < edges.nrows() {
        warn!(
            "Dropping {} of {} subjects with missing motion, age or gender from QC-FC.",
            edges.nrows() - complete.len(),
            edges.nrows()
        );
        if complete.is_empty() {
            return Err(BenchError::EmptyConnectivity);
        }
    }
    let pick = |values: &[f64]| -> Vec<f64> { complete.iter().map(|&i| values[i]).collect() };
    let (motion, age, gender) = (pick(motion), pick(age), pick(gender));
    let edges = edges.select(Axis(0), &complete);
    let n_subjects = edges.nrows();

    let design = covariate_design(&age, &gender);
    let basis = orthonormal_basis(&design);
    let x = residualize_matrix(&basis, edges);
    let y = residualize_vector(&basis, Array1::from(motion));
    let dof = n_subjects as f64 - basis.len() as f64 - 2.0;

    let xy = x.t().dot(&y);
    let xx = x.mapv(|v| v * v).sum_axis(Axis(0));
    let yy = y.dot(&y);

    let correlation: Vec<f64> = xy
        .iter()
        .zip(xx.iter())
        .map(|(xy, xx)| (xy / (xx * yy).sqrt()).clamp(-1.0, 1.0))
        .collect();
    let p_value = correlation
        .iter()
        .map(|&r| two_tailed_p(r * (dof / (1.0 - r * r)).sqrt(), dof))
        .collect();

    debug!(
        "QC-FC over {} subjects x {} edges (covariate rank {}, dof {})",
        n_subjects,
        x.ncols(),
        basis.len(),
        dof
    );
    Ok(QcfcResult { correlation, p_value, dof })
}

fn evaluate_subset(connectome: &Connectome, phenotype: &PhenotypeTable) -> Result<QcfcResult> {
    let mut motion = Vec::with_capacity(connectome.n_subjects());
    let mut age = Vec::with_capacity(connectome.n_subjects());
    let mut gender = Vec::with_capacity(connectome.n_subjects());
    for id in &connectome.subject_ids {
        let row = phenotype
            .get(id)
            .ok_or_else(|| BenchError::ShapeMismatch(format!("no phenotype row for {}", id)))?;
        motion.push(row.mean_fd);
        age.push(row.age);
        gender.push(row.gender);
    }
    evaluate(&motion, &connectome.edges, &age, &gender)
}

/// Full-sample and per-group QC-FC for one strategy, keyed
/// `(group, "<strategy>_correlation" | "<strategy>_p_value")` over edge rows.
///
/// `connectome` and `phenotype` must cover the same subjects.
pub fn evaluate_groups(strategy_name: &str, connectome: &Connectome, phenotype: &PhenotypeTable) -> Result<MetricTable> {
    let mut table = MetricTable::with_rows("", HeaderLayout::Hierarchical, connectome.edge_labels());
    let mut insert = |group: &str, result: QcfcResult| -> Result<()> {
        table.insert_column(
            ColumnKey::grouped(group, format!("{}{}", strategy_name, QCFC_CORRELATION_SUFFIX)),
            result.correlation,
        )?;
        table.insert_column(
            ColumnKey::grouped(group, format!("{}{}", strategy_name, QCFC_P_VALUE_SUFFIX)),
            result.p_value,
        )
    };

    insert(FULL_SAMPLE, evaluate_subset(connectome, phenotype)?)?;
    for group in phenotype.groups() {
        let members: Vec<String> = connectome
            .subject_ids
            .iter()
            .filter(|id| phenotype.get(id).map_or(false, |row| row.group == group))
            .cloned()
            .collect();
        info!("QC-FC for group '{}' ({} subjects)", group, members.len());
        insert(&group, evaluate_subset(&connectome.select_subjects(&members), phenotype)?)?;
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phenotype::PhenotypeRow;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, Normal};

    fn synthetic(n: usize, n_edges: usize, seed: u64) -> (Vec<f64>, Array2<f64>, Vec<f64>, Vec<f64>) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let normal = Normal::<f64>::new(0.0, 1.0).unwrap();
        let motion: Vec<f64> = (0..n).map(|_| normal.sample(&mut rng).abs() * 0.1).collect();
        let age: Vec<f64> = (0..n).map(|i| 8.0 + i as f64 * 1.5).collect();
        let gender: Vec<f64> = (0..n).map(|i| (i % 2) as f64).collect();
        let edges = Array2::from_shape_fn((n, n_edges), |_| normal.sample(&mut rng));
        (motion, edges, age, gender)
    }

    #[test]
    fn empty_input_is_an_error() {
        let edges = Array2::<f64>::zeros((0, 3));
        assert!(matches!(evaluate(&[], &edges, &[], &[]), Err(BenchError::EmptyConnectivity)));
    }

    #[test]
    fn results_are_bounded_and_reproducible() {
        let (motion, edges, age, gender) = synthetic(20, 15, 7);
        let first = evaluate(&motion, &edges, &age, &gender).unwrap();
        let second = evaluate(&motion, &edges, &age, &gender).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.dof, 15.0);
        assert!(first.correlation.iter().all(|r| (-1.0..=1.0).contains(r)));
        assert!(first.p_value.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn edge_tracking_motion_is_perfectly_correlated() {
        let (motion, mut edges, age, gender) = synthetic(12, 2, 3);
        edges.column_mut(0).assign(&Array1::from(motion.iter().map(|m| 3.0 * m + 1.0).collect::<Vec<_>>()));
        let result = evaluate(&motion, &edges, &age, &gender).unwrap();
        assert_abs_diff_eq!(result.correlation[0], 1.0, epsilon = 1e-9);
        assert!(result.p_value[0] < 1e-6);
    }

    #[test]
    fn constant_covariates_reduce_rank_without_failing() {
        let (motion, edges, _, _) = synthetic(6, 3, 11);
        let result = evaluate(&motion, &edges, &[10.0; 6], &[1.0; 6]).unwrap();
        assert_eq!(result.dof, 3.0);
        assert!(result.p_value.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn subjects_missing_covariates_are_left_out() {
        let (motion, edges, mut age, gender) = synthetic(10, 3, 13);
        assert_eq!(evaluate(&motion, &edges, &age, &gender).unwrap().dof, 5.0);

        age[3] = f64::NAN;
        let result = evaluate(&motion, &edges, &age, &gender).unwrap();
        assert_eq!(result.dof, 4.0);

        let keep: Vec<usize> = (0..10).filter(|&i| i != 3).collect();
        let pick = |v: &[f64]| keep.iter().map(|&i| v[i]).collect::<Vec<f64>>();
        let reduced = evaluate(&pick(&motion[..]), &edges.select(Axis(0), &keep), &pick(&age[..]), &pick(&gender[..])).unwrap();
        assert_eq!(result, reduced);

        let no_motion = vec![f64::NAN; 10];
        assert!(matches!(
            evaluate(&no_motion, &edges, &age, &gender),
            Err(BenchError::EmptyConnectivity)
        ));
    }

    #[test]
    fn non_positive_dof_gives_nan_p_values() {
        let motion = [0.1, 0.4, 0.2];
        let edges = array![[0.3, 0.1], [0.5, 0.9], [0.2, 0.4]];
        let result = evaluate(&motion, &edges, &[8.0, 9.0, 30.0], &[0.0, 1.0, 1.0]).unwrap();
        assert_eq!(result.dof, -2.0);
        assert!(result.p_value.iter().all(|p| p.is_nan()));
        assert_eq!(two_tailed_p(f64::INFINITY, 4.0), 0.0);
        assert_abs_diff_eq!(two_tailed_p(0.0, 4.0), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn group_table_has_full_sample_and_each_group() {
        let (motion, edges, age, gender) = synthetic(10, 3, 5);
        let ids: Vec<String> = (0..10).map(|i| format!("sub-{:02}", i)).collect();
        let mut phenotype = PhenotypeTable::new();
        for i in 0..10 {
            phenotype.insert(
                ids[i].clone(),
                PhenotypeRow {
                    mean_fd: motion[i],
                    age: age[i],
                    gender: gender[i],
                    group: if i < 5 { "child".to_string() } else { "adult".to_string() },
                },
            );
        }
        let connectome = Connectome { subject_ids: ids, n_regions: 3, edges };
        let table = evaluate_groups("simple", &connectome, &phenotype).unwrap();
        assert_eq!(table.row_labels(), &["1_0", "2_0", "2_1"]);
        assert_eq!(table.n_columns(), 6);
        let full = table.column(&ColumnKey::grouped(FULL_SAMPLE, "simple_correlation")).unwrap();
        assert_eq!(full.len(), 3);
        assert!(table.column(&ColumnKey::grouped("child", "simple_p_value")).is_some());
        assert!(table.column(&ColumnKey::grouped("adult", "simple_correlation")).is_some());
    }
}
