use linfa::Float;
use linfa_linalg::{cholesky::*, triangular::*, LinalgError};
use ndarray::{Array2, ArrayBase, Data, Ix2, Zip};

/// Inverse and log-determinant of a symmetric positive definite matrix
/// using its cholesky decomposition.
pub(crate) fn spd_inverse<F: Float>(
    k: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Result<(Array2<F>, F), LinalgError> {
    let l = k.cholesky()?;
    let logdet = F::cast(2.) * l.diag().mapv(|v| v.ln()).sum();
    let linv = l.solve_triangular(&Array2::eye(k.nrows()), UPLO::Lower)?;
    let inv = l.t().solve_triangular_into(linv, UPLO::Upper)?;
    Ok((inv, logdet))
}

/// Largest absolute entry of `inv . k - I`, NaN when inputs are not finite
pub(crate) fn inverse_residual<F: Float>(
    k: &ArrayBase<impl Data<Elem = F>, Ix2>,
    inv: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> F {
    let mut res = inv.dot(k);
    res.diag_mut().mapv_inplace(|v| v - F::one());
    res.iter().fold(F::zero(), |acc, &v| {
        if v.is_nan() || acc.is_nan() {
            F::nan()
        } else {
            acc.max(v.abs())
        }
    })
}

/// Euclidean distances between rows of `a` and rows of `b`
pub(crate) fn pairwise_distances<F: Float>(
    a: &ArrayBase<impl Data<Elem = F>, Ix2>,
    b: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Array2<F> {
    Array2::from_shape_fn((a.nrows(), b.nrows()), |(i, j)| {
        let mut d2 = F::zero();
        Zip::from(a.row(i)).and(b.row(j)).for_each(|&u, &v| {
            d2 += (u - v) * (u - v);
        });
        d2.sqrt()
    })
}

/// Force exact symmetry: `(m + m^T) / 2`
pub(crate) fn symmetrize<F: Float>(m: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F> {
    (m.to_owned() + m.t()) * F::cast(0.5)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::StandardNormal;
    use ndarray_rand::RandomExt;
    use rand_xoshiro::Xoshiro256Plus;

    /// Draw `dy` columns from a zero mean gaussian with covariance `k`
    pub(crate) fn sample_gaussian(k: &Array2<f64>, dy: usize, seed: u64) -> Array2<f64> {
        let mut rng = Xoshiro256Plus::seed_from_u64(seed);
        let l = k.cholesky().expect("covariance should be positive definite");
        let z = Array2::<f64>::random_using((k.nrows(), dy), StandardNormal, &mut rng);
        l.dot(&z)
    }

    #[test]
    fn test_spd_inverse() {
        let k = array![[4., 1., 0.5], [1., 3., 0.2], [0.5, 0.2, 2.]];
        let (inv, logdet) = spd_inverse(&k).unwrap();
        assert_abs_diff_eq!(inv.dot(&k), Array2::eye(3), epsilon = 1e-12);
        // det = 4*(6-0.04) - 1*(2-0.1) + 0.5*(0.2-1.5)
        let det: f64 = 4. * 5.96 - 1.9 + 0.5 * (-1.3);
        assert_abs_diff_eq!(logdet, det.ln(), epsilon = 1e-12);
        assert!(inverse_residual(&k, &inv) < 1e-12);
    }

    #[test]
    fn test_spd_inverse_fails_on_singular() {
        let k = array![[1., 1.], [1., 1.]];
        let res = spd_inverse(&k);
        assert!(res.is_err() || !(inverse_residual(&k, &res.unwrap().0) <= 1e-4));
    }

    #[test]
    fn test_inverse_residual_nan() {
        let k = array![[1., 0.], [0., 1.]];
        let inv = array![[f64::NAN, 0.], [0., 1.]];
        assert!(inverse_residual(&k, &inv).is_nan());
    }

    #[test]
    fn test_pairwise_distances() {
        let a = array![[0., 0.], [1., 1.]];
        let b = array![[3., 4.]];
        let d = pairwise_distances(&a, &b);
        assert_abs_diff_eq!(d, array![[5.], [13f64.sqrt()]], epsilon = 1e-12);
    }

    #[test]
    fn test_symmetrize() {
        let m = array![[1., 2.], [4., 3.]];
        assert_abs_diff_eq!(symmetrize(&m), array![[1., 3.], [3., 3.]]);
    }
}
