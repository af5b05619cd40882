use ndarray::{Array, Array1, Array2, ArrayView1, Zip};
use thiserror::Error;

/// Largest spline degree supported by the model.
pub const MAX_DEGREE: usize = 5;

/// Largest order of the derivative penalty.
pub const MAX_DIFF_ORDER: usize = 2;

/// Diagonal stabilizer added to the rescaled penalty matrix.
pub const DEFAULT_PENALTY_EPSILON: f64 = 1e-6;

/// A comprehensive error type for all operations within the basis module.
#[derive(Error, Debug)]
pub enum BasisError {
    #[error("Spline degree must be between 0 and 5, but was {0}.")]
    InvalidDegree(usize),

    #[error("Derivative penalty order must be between 0 and 2, but was {0}.")]
    InvalidPenaltyOrder(usize),

    #[error("Spline degree ({degree}) must be at least the derivative penalty order ({order}).")]
    DegreeBelowPenaltyOrder { degree: usize, order: usize },

    #[error(
        "Knots must be non-decreasing, start at 0 and end at 1 with at least 2 entries; got {0:?}."
    )]
    InvalidKnots(Vec<f64>),

    #[error("The evaluation grid needs at least 2 points, but {0} were requested.")]
    GridTooSmall(usize),

    #[error("The penalty matrix has no positive entry (max = {0}); it cannot be rescaled.")]
    DegeneratePenalty(f64),
}

/// Builds the normalized B-spline design matrix and the derivative penalty
/// for a set of knots on `[0, 1]`.
///
/// # Arguments
/// * `knots`: normalized knots, first = 0, last = 1, non-decreasing.
/// * `degree`: polynomial degree of the splines (order = degree + 1).
/// * `n_grid_points`: number of evenly spaced evaluation points on `[0, 1]`.
/// * `diff_matrix_order`: order of the derivative whose squared integral is penalized.
/// * `epsilon`: diagonal stabilizer added after rescaling the penalty.
///
/// # Returns
/// 1. The basis matrix, shape `[n_grid_points, knots.len() + degree - 1]`, with
///    each column divided by its support width over the order.
/// 2. The penalty matrix, square in the number of basis functions, rescaled so
///    its largest entry is 1 and then shifted by `epsilon * I`.
pub fn init_basis_and_penalty(
    knots: ArrayView1<f64>,
    degree: usize,
    n_grid_points: usize,
    diff_matrix_order: usize,
    epsilon: f64,
) -> Result<(Array2<f64>, Array2<f64>), BasisError> {
    validate_basis_inputs(knots, degree, n_grid_points, diff_matrix_order)?;

    let full_knots = full_knot_vector(knots, degree);
    let grid = Array::linspace(0.0, 1.0, n_grid_points);

    let mut basis = create_bspline_basis(grid.view(), full_knots.view(), degree);
    let norm_factor = normalization_factors(full_knots.view(), degree);
    Zip::from(basis.columns_mut())
        .and(&norm_factor)
        .for_each(|mut column, &factor| column.mapv_inplace(|b| b / factor));

    let mut penalty = create_derivative_penalty(full_knots.view(), degree, diff_matrix_order)?;
    let max_entry = penalty.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !(max_entry > 0.0) {
        return Err(BasisError::DegeneratePenalty(max_entry));
    }
    penalty.mapv_inplace(|p| p / max_entry);
    penalty.diag_mut().mapv_inplace(|d| d + epsilon);

    log::info!(
        "Built B-spline basis {:?} (degree {}) and order-{} penalty {:?}",
        basis.dim(),
        degree,
        diff_matrix_order,
        penalty.dim()
    );

    Ok((basis, penalty))
}

/// Checks every basis precondition before any numeric work happens.
pub fn validate_basis_inputs(
    knots: ArrayView1<f64>,
    degree: usize,
    n_grid_points: usize,
    diff_matrix_order: usize,
) -> Result<(), BasisError> {
    if degree > MAX_DEGREE {
        return Err(BasisError::InvalidDegree(degree));
    }
    if diff_matrix_order > MAX_DIFF_ORDER {
        return Err(BasisError::InvalidPenaltyOrder(diff_matrix_order));
    }
    if degree < diff_matrix_order {
        return Err(BasisError::DegreeBelowPenaltyOrder {
            degree,
            order: diff_matrix_order,
        });
    }
    if n_grid_points < 2 {
        return Err(BasisError::GridTooSmall(n_grid_points));
    }
    let sorted = knots.iter().zip(knots.iter().skip(1)).all(|(a, b)| a <= b);
    if knots.len() < 2 || knots[0] != 0.0 || knots[knots.len() - 1] != 1.0 || !sorted {
        return Err(BasisError::InvalidKnots(knots.to_vec()));
    }
    Ok(())
}

/// Pads the knots with `degree` extra copies of each boundary, giving the
/// clamped knot vector with `degree + 1` repeats at 0 and at 1.
pub fn full_knot_vector(knots: ArrayView1<f64>, degree: usize) -> Array1<f64> {
    let mut full = Vec::with_capacity(knots.len() + 2 * degree);
    full.extend(std::iter::repeat_n(0.0, degree));
    full.extend(knots.iter());
    full.extend(std::iter::repeat_n(1.0, degree));
    Array1::from_vec(full)
}

/// Per-column normalization `(t[i + order] - t[i]) / order`.
///
/// Zero-width supports map to infinity so the divided column becomes zero
/// instead of NaN.
pub fn normalization_factors(full_knots: ArrayView1<f64>, degree: usize) -> Array1<f64> {
    let order = degree + 1;
    let num_basis = full_knots.len() - order;
    Array1::from_shape_fn(num_basis, |i| {
        let width = (full_knots[i + order] - full_knots[i]) / order as f64;
        if width == 0.0 { f64::INFINITY } else { width }
    })
}

/// Evaluates every B-spline basis function on each grid point.
///
/// The basis matrix has shape `[grid.len(), full_knots.len() - degree - 1]`.
/// Rows are evaluated in parallel; each row depends only on its grid point.
pub fn create_bspline_basis(
    grid: ArrayView1<f64>,
    full_knots: ArrayView1<f64>,
    degree: usize,
) -> Array2<f64> {
    let num_basis = full_knots.len() - degree - 1;
    let mut basis_matrix = Array2::zeros((grid.len(), num_basis));

    Zip::from(basis_matrix.rows_mut())
        .and(&grid)
        .par_for_each(|mut row, &x| {
            row.assign(&internal::evaluate_splines_at_point(x, degree, full_knots));
        });

    basis_matrix
}

/// Gram matrix `P[i, j] = ∫ D^m B_i(x) D^m B_j(x) dx` over `[0, 1]`, where `m` is
/// the derivative order and `B_i` the unnormalized B-splines on `full_knots`.
///
/// The integrand is a piecewise polynomial of degree at most `2 * degree`, so a
/// `(degree + 1)`-point Gauss-Legendre rule on each knot interval is exact.
pub fn create_derivative_penalty(
    full_knots: ArrayView1<f64>,
    degree: usize,
    order: usize,
) -> Result<Array2<f64>, BasisError> {
    if order > degree {
        return Err(BasisError::DegreeBelowPenaltyOrder { degree, order });
    }
    if full_knots.len() < 2 * (degree + 1) {
        return Err(BasisError::InvalidKnots(full_knots.to_vec()));
    }
    let num_basis = full_knots.len() - degree - 1;
    let (nodes, weights) = internal::gauss_legendre(degree + 1);
    let mut penalty = Array2::<f64>::zeros((num_basis, num_basis));

    for j in 0..full_knots.len() - 1 {
        let (a, b) = (full_knots[j], full_knots[j + 1]);
        if b <= a {
            continue;
        }
        let half_width = 0.5 * (b - a);
        let mid = 0.5 * (a + b);

        for (&node, &weight) in nodes.iter().zip(weights.iter()) {
            let x = mid + half_width * node;
            let derivs = internal::derivative_basis_at_point(x, degree, full_knots, order);
            let w = weight * half_width;

            // Only `degree + 1` functions are non-zero on this interval.
            let lo = j.saturating_sub(degree);
            let hi = j.min(num_basis - 1);
            for r in lo..=hi {
                let dr = derivs[r];
                if dr == 0.0 {
                    continue;
                }
                for c in r..=hi {
                    penalty[[r, c]] += w * dr * derivs[c];
                }
            }
        }
    }

    // Mirror the accumulated upper triangle.
    for r in 0..num_basis {
        for c in 0..r {
            penalty[[r, c]] = penalty[[c, r]];
        }
    }
    Ok(penalty)
}

/// Internal module for implementation details not exposed in the public API.
mod internal {
    use super::*;

    /// Index `mu` of the knot interval `[t[mu], t[mu+1])` containing `x`.
    ///
    /// Degenerate (zero-width) intervals are skipped, and `x` at the right end
    /// of the domain belongs to the last non-degenerate interval.
    pub(super) fn find_span(x: f64, knots: ArrayView1<f64>, degree: usize) -> usize {
        let last = knots.len() - 1;
        let lo = degree;
        let hi = last - degree - 1;
        (lo..=hi)
            .rev()
            .find(|&i| knots[i] <= x && knots[i] < knots[i + 1])
            .or_else(|| (lo..=hi).find(|&i| knots[i] < knots[i + 1]))
            .unwrap_or(lo)
    }

    /// Evaluates all B-spline basis functions of the given degree at `x`
    /// with the Cox-de Boor recurrence, using the triangular scheme that
    /// only touches the `degree + 1` functions that are non-zero at `x`.
    pub(super) fn evaluate_splines_at_point(
        x: f64,
        degree: usize,
        knots: ArrayView1<f64>,
    ) -> Array1<f64> {
        let num_basis = knots.len() - degree - 1;
        let mu = find_span(x, knots, degree);

        let mut b = vec![0.0; degree + 1];
        let mut left = vec![0.0; degree + 1];
        let mut right = vec![0.0; degree + 1];
        b[0] = 1.0;

        for d in 1..=degree {
            left[d] = x - knots[mu + 1 - d];
            right[d] = knots[mu + d] - x;
            let mut saved = 0.0;
            for r in 0..d {
                let denom = right[r + 1] + left[d - r];
                let temp = if denom != 0.0 { b[r] / denom } else { 0.0 };
                b[r] = saved + right[r + 1] * temp;
                saved = left[d - r] * temp;
            }
            b[d] = saved;
        }

        // b[r] holds B_{mu - degree + r}.
        let mut basis_values = Array1::zeros(num_basis);
        let start_index = mu - degree;
        for (r, &value) in b.iter().enumerate() {
            basis_values[start_index + r] = value;
        }
        basis_values
    }

    /// Evaluates the `order`-th derivative of every degree-`degree` B-spline at `x`.
    ///
    /// Uses `D B_{i,d} = d * (B_{i,d-1} / (t[i+d] - t[i]) - B_{i+1,d-1} / (t[i+d+1] - t[i+1]))`
    /// applied `order` times to the degree `degree - order` basis.
    pub(super) fn derivative_basis_at_point(
        x: f64,
        degree: usize,
        knots: ArrayView1<f64>,
        order: usize,
    ) -> Array1<f64> {
        let base_degree = degree - order;
        let mut values = evaluate_splines_at_point(x, base_degree, knots);

        for d in base_degree + 1..=degree {
            let num = knots.len() - d - 1;
            let scale = d as f64;
            values = Array1::from_shape_fn(num, |i| {
                let left_width = knots[i + d] - knots[i];
                let right_width = knots[i + d + 1] - knots[i + 1];
                let left = if left_width > 0.0 {
                    values[i] / left_width
                } else {
                    0.0
                };
                let right = if right_width > 0.0 {
                    values[i + 1] / right_width
                } else {
                    0.0
                };
                scale * (left - right)
            });
        }
        values
    }

    /// Nodes and weights of the `m`-point Gauss-Legendre rule on `[-1, 1]`.
    pub(super) fn gauss_legendre(m: usize) -> (Vec<f64>, Vec<f64>) {
        let mut nodes = vec![0.0; m];
        let mut weights = vec![0.0; m];
        let mf = m as f64;

        for i in 0..m.div_ceil(2) {
            // Chebyshev-like initial guess for the i-th root.
            let mut z = (std::f64::consts::PI * (i as f64 + 0.75) / (mf + 0.5)).cos();
            for _ in 0..100 {
                let (p, p_prev) = legendre(m, z);
                let dp = mf * (z * p - p_prev) / (z * z - 1.0);
                let step = p / dp;
                z -= step;
                if step.abs() < 1e-15 {
                    break;
                }
            }
            let (p, p_prev) = legendre(m, z);
            let dp = mf * (z * p - p_prev) / (z * z - 1.0);
            let w = 2.0 / ((1.0 - z * z) * dp * dp);
            nodes[i] = -z;
            nodes[m - 1 - i] = z;
            weights[i] = w;
            weights[m - 1 - i] = w;
        }
        (nodes, weights)
    }

    /// Returns `(P_m(z), P_{m-1}(z))` via the three-term recurrence.
    fn legendre(m: usize, z: f64) -> (f64, f64) {
        let mut p = 1.0;
        let mut p_prev = 0.0;
        for j in 1..=m {
            let jf = j as f64;
            let p_next = ((2.0 * jf - 1.0) * z * p - (jf - 1.0) * p_prev) / jf;
            p_prev = p;
            p = p_next;
        }
        (p, p_prev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Axis, array, s};
    use ndarray_linalg::{Eigh, UPLO};

    fn uniform_knots(n: usize) -> Array1<f64> {
        Array::linspace(0.0, 1.0, n)
    }

    #[test]
    fn full_knot_vector_is_clamped() {
        let full = full_knot_vector(array![0.0, 0.5, 1.0].view(), 2);
        assert_eq!(full, array![0.0, 0.0, 0.0, 0.5, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn unnormalized_basis_is_a_partition_of_unity() {
        let full = full_knot_vector(uniform_knots(8).view(), 3);
        let grid = Array::linspace(0.0, 1.0, 101);
        let basis = create_bspline_basis(grid.view(), full.view(), 3);
        assert_eq!(basis.dim(), (101, 10));
        for &sum in basis.sum_axis(Axis(1)).iter() {
            assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-12);
        }
        // Clamped ends interpolate the first and last functions.
        assert_abs_diff_eq!(basis[[0, 0]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(basis[[100, 9]], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn degree_one_hand_computed_values() {
        // Linear splines on t = [0, 0, 1, 2, 2]: hats centred at 0, 1 and 2.
        let knots = array![0.0, 0.0, 1.0, 2.0, 2.0];
        let values = internal::evaluate_splines_at_point(0.5, 1, knots.view());
        assert_eq!(values.len(), 3);
        assert_abs_diff_eq!(values[0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(values[1], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(values[2], 0.0, epsilon = 1e-12);

        let at_end = internal::evaluate_splines_at_point(2.0, 1, knots.view());
        assert_abs_diff_eq!(at_end[2], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn degree_zero_basis_is_indicator() {
        let full = full_knot_vector(array![0.0, 0.5, 1.0].view(), 0);
        let grid = array![0.0, 0.25, 0.5, 0.75, 1.0];
        let basis = create_bspline_basis(grid.view(), full.view(), 0);
        let expected = array![[1.0, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 1.0], [0.0, 1.0]];
        assert_eq!(basis, expected);
    }

    #[test]
    fn derivative_matches_finite_difference() {
        let full = full_knot_vector(array![0.0, 0.2, 0.45, 0.7, 1.0].view(), 3);
        let h = 1e-6;
        for &x in &[0.1, 0.33, 0.61, 0.9] {
            let d1 = internal::derivative_basis_at_point(x, 3, full.view(), 1);
            let plus = internal::evaluate_splines_at_point(x + h, 3, full.view());
            let minus = internal::evaluate_splines_at_point(x - h, 3, full.view());
            for i in 0..d1.len() {
                let fd = (plus[i] - minus[i]) / (2.0 * h);
                assert_abs_diff_eq!(d1[i], fd, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn gauss_legendre_integrates_polynomials_exactly() {
        for m in 1..=6 {
            let (nodes, weights) = internal::gauss_legendre(m);
            assert_abs_diff_eq!(weights.iter().sum::<f64>(), 2.0, epsilon = 1e-13);
            for k in 0..(2 * m) {
                let exact = if k % 2 == 1 { 0.0 } else { 2.0 / (k as f64 + 1.0) };
                let approx: f64 = nodes
                    .iter()
                    .zip(weights.iter())
                    .map(|(&x, &w)| w * x.powi(k as i32))
                    .sum();
                assert_abs_diff_eq!(approx, exact, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn order_zero_penalty_of_linear_hats() {
        // Mass matrix of linear hats on [0, 0.5, 1] is h/6 * [[2,1,0],[1,4,1],[0,1,2]].
        let full = full_knot_vector(array![0.0, 0.5, 1.0].view(), 1);
        let p = create_derivative_penalty(full.view(), 1, 0).unwrap();
        let expected = array![[2.0, 1.0, 0.0], [1.0, 4.0, 1.0], [0.0, 1.0, 2.0]] * (0.5 / 6.0);
        for (a, b) in p.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn second_derivative_penalty_annihilates_linear_coefficients() {
        // Cubic B-splines reproduce a line when the coefficients are the Greville abscissae.
        let knots = array![0.0, 0.15, 0.4, 0.55, 0.8, 1.0];
        let degree = 3;
        let full = full_knot_vector(knots.view(), degree);
        let p = create_derivative_penalty(full.view(), degree, 2).unwrap();
        let n_basis = full.len() - degree - 1;
        let greville = Array1::from_shape_fn(n_basis, |i| {
            full.slice(s![i + 1..i + 1 + degree]).sum() / degree as f64
        });
        let quad = greville.dot(&p.dot(&greville));
        assert_abs_diff_eq!(quad, 0.0, epsilon = 1e-7);
    }

    #[test]
    fn penalty_is_symmetric_scaled_and_positive_definite() {
        let (_, penalty) =
            init_basis_and_penalty(uniform_knots(10).view(), 3, 64, 2, DEFAULT_PENALTY_EPSILON)
                .unwrap();
        assert_eq!(penalty.dim(), (12, 12));
        assert_eq!(penalty, penalty.t());

        let unstabilized = &penalty - &(Array2::<f64>::eye(12) * DEFAULT_PENALTY_EPSILON);
        let max = unstabilized.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        assert_abs_diff_eq!(max, 1.0, epsilon = 1e-12);

        let (eigenvalues, _) = penalty.eigh(UPLO::Lower).unwrap();
        assert!(eigenvalues.iter().all(|&e| e > 0.0), "{:?}", eigenvalues);
    }

    #[test]
    fn basis_columns_are_normalized_by_support() {
        let knots = uniform_knots(6);
        let (basis, _) = init_basis_and_penalty(knots.view(), 2, 5001, 1, 1e-6).unwrap();
        assert_eq!(basis.dim(), (5001, 7));
        // Each normalized column integrates to one.
        let h = 1.0 / 5000.0;
        for column in basis.columns() {
            let integral = h * (column.sum() - 0.5 * (column[0] + column[5000]));
            assert_abs_diff_eq!(integral, 1.0, epsilon = 1e-3);
        }
    }

    #[test]
    fn repeated_interior_knots_never_produce_nan() {
        // A triple knot at 0.5 with degree 0 gives zero-width supports.
        let knots = array![0.0, 0.5, 0.5, 0.5, 1.0];
        let factors = normalization_factors(full_knot_vector(knots.view(), 0).view(), 0);
        assert!(factors.iter().any(|f| f.is_infinite()));

        let (basis, penalty) = init_basis_and_penalty(knots.view(), 0, 33, 0, 1e-6).unwrap();
        assert_eq!(basis.dim(), (33, 4));
        assert!(basis.iter().all(|v| v.is_finite()));
        assert!(penalty.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn invalid_inputs_fail_before_numeric_work() {
        let knots = uniform_knots(5);
        assert!(matches!(
            init_basis_and_penalty(knots.view(), 6, 10, 2, 1e-6),
            Err(BasisError::InvalidDegree(6))
        ));
        assert!(matches!(
            init_basis_and_penalty(knots.view(), 3, 10, 3, 1e-6),
            Err(BasisError::InvalidPenaltyOrder(3))
        ));
        assert!(matches!(
            init_basis_and_penalty(knots.view(), 1, 10, 2, 1e-6),
            Err(BasisError::DegreeBelowPenaltyOrder { degree: 1, order: 2 })
        ));
        assert!(matches!(
            init_basis_and_penalty(knots.view(), 3, 1, 2, 1e-6),
            Err(BasisError::GridTooSmall(1))
        ));
        assert!(matches!(
            init_basis_and_penalty(array![0.0, 0.7, 0.3, 1.0].view(), 3, 10, 2, 1e-6),
            Err(BasisError::InvalidKnots(_))
        ));
    }

    #[test]
    fn derivative_penalty_rejects_order_above_degree() {
        let full = full_knot_vector(uniform_knots(5).view(), 1);
        assert!(matches!(
            create_derivative_penalty(full.view(), 1, 2),
            Err(BasisError::DegreeBelowPenaltyOrder { degree: 1, order: 2 })
        ));
        assert!(matches!(
            create_derivative_penalty(array![0.0, 1.0].view(), 1, 0),
            Err(BasisError::InvalidKnots(_))
        ));
    }
}
