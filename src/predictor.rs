//! BCM prediction: per-block gaussian posteriors fused in precision space.
//!
//! For query points `X*`, each block `b` gives a posterior `N(m_b, C_b)` and a prior
//! `N(0, Kss_b)` at `X*`. The fused precision is the query prior precision plus the messages
//! `C_b^-1 - Kss_b^-1`, the fused mean is `C (sum_b C_b^-1 m_b)`.
use crate::covariance::KernelEvaluator;
use crate::errors::{BcmError, Result};
use crate::utils::{pairwise_distances, spd_inverse, symmetrize};
use linfa::Float;
use ndarray::{s, Array1, Array2, ArrayBase, Data, Ix2};
use ndarray_stats::QuantileExt;
use std::ops::Range;

#[derive(Clone, Debug)]
struct TrainedBlock<F: Float> {
    x: Array2<F>,
    kernel: KernelEvaluator<F>,
    kinv: Array2<F>,
    alpha: Array2<F>,
}

/// Predictor trained from the blocks of a [`MultiSharedBcm`](crate::MultiSharedBcm).
///
/// It owns copies of the block points and cached inverses, and stays valid when the engine
/// it comes from is updated.
#[derive(Clone, Debug)]
pub struct BcmPredictor<F: Float> {
    blocks: Vec<TrainedBlock<F>>,
    prior: KernelEvaluator<F>,
    dy: usize,
}

impl<F: Float> BcmPredictor<F> {
    /// Cache `K_b^-1` and `K_b^-1 Y_b` of each non empty block.
    ///
    /// `kernel(b)` gives the evaluator of block `b`, `prior` is used for the query prior only.
    pub(crate) fn train(
        x: &Array2<F>,
        y: &Array2<F>,
        boundaries: &[Range<usize>],
        kernel: impl Fn(usize) -> KernelEvaluator<F>,
        prior: KernelEvaluator<F>,
    ) -> Result<Self> {
        let blocks = boundaries
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.is_empty())
            .map(|(b, r)| {
                let xb = x.slice(s![r.clone(), ..]).to_owned();
                let kernel = kernel(b);
                let (kinv, _) = spd_inverse(&kernel.covariance(&xb))?;
                let alpha = kinv.dot(&y.slice(s![r.clone(), ..]));
                Ok(TrainedBlock {
                    x: xb,
                    kernel,
                    kinv,
                    alpha,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if blocks.is_empty() {
            return Err(BcmError::InvalidValueError(
                "Cannot train a predictor without training points".to_string(),
            ));
        }
        Ok(BcmPredictor {
            blocks,
            prior,
            dy: y.ncols(),
        })
    }

    /// Number of trained (non empty) blocks
    pub fn n_blocks(&self) -> usize {
        self.blocks.len()
    }

    fn nearest_block(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> &TrainedBlock<F> {
        let dists = self
            .blocks
            .iter()
            .map(|b| {
                pairwise_distances(x, &b.x)
                    .iter()
                    .fold(F::infinity(), |acc, &d| acc.min(d))
            })
            .collect::<Array1<F>>();
        &self.blocks[dists.argmin().unwrap_or(0)]
    }

    /// Predictive mean (m, dy) and covariance (m, m) at query points `x`.
    ///
    /// `test_noise_var` is added to the diagonal of the query prior covariance. When it is
    /// positive, each block adds its own noise variance to its covariance at the queries,
    /// otherwise block predictions are noiseless. When `local` is set, only the block nearest
    /// to the query points is used.
    pub fn predict(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        test_noise_var: F,
        local: bool,
    ) -> Result<(Array2<F>, Array2<F>)> {
        if x.ncols() != self.prior.dim() {
            return Err(BcmError::InvalidValueError(format!(
                "Query points should be of dimension {}, got {}",
                self.prior.dim(),
                x.ncols()
            )));
        }
        let m = x.nrows();
        let noise = Array2::eye(m) * test_noise_var;
        let prior_cov = self.prior.kernel_matrix(x, x) + &noise;
        let (mut prec, _) = spd_inverse(&prior_cov)?;
        let mut weighted = Array2::zeros((m, self.dy));

        let selected = if local {
            vec![self.nearest_block(x)]
        } else {
            self.blocks.iter().collect()
        };
        for block in selected {
            let kstar = block.kernel.kernel_matrix(x, &block.x);
            let block_noise = if test_noise_var > F::zero() {
                block.kernel.spec().noise_var()
            } else {
                F::zero()
            };
            let kss = block.kernel.kernel_matrix(x, x) + &(Array2::eye(m) * block_noise);
            let mean = kstar.dot(&block.alpha);
            let cov = symmetrize(&(&kss - &kstar.dot(&block.kinv).dot(&kstar.t())));
            let (block_prec, _) = spd_inverse(&cov)?;
            let (kss_prec, _) = spd_inverse(&kss)?;
            weighted += &block_prec.dot(&mean);
            prec += &(block_prec - kss_prec);
        }

        let (cov, _) = spd_inverse(&symmetrize(&prec))?;
        let mean = cov.dot(&weighted);
        Ok((mean, symmetrize(&cov)))
    }

    /// Predictive gaussian log-density of held-out observations `y` at `x`, divided by the
    /// number of scalar observations.
    ///
    /// When `marginal` is set, each query point is predicted alone and densities are summed,
    /// otherwise the joint predictive distribution of all query points is used.
    pub fn log_density(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        y: &ArrayBase<impl Data<Elem = F>, Ix2>,
        test_noise_var: F,
        marginal: bool,
    ) -> Result<F> {
        if y.nrows() != x.nrows() || y.ncols() != self.dy {
            return Err(BcmError::InvalidValueError(format!(
                "Observations should be of shape ({}, {}), got {:?}",
                x.nrows(),
                self.dy,
                y.dim()
            )));
        }
        let ll = if marginal {
            let mut ll = F::zero();
            for k in 0..x.nrows() {
                let xk = x.slice(s![k..k + 1, ..]);
                let (mean, cov) = self.predict(&xk, test_noise_var, false)?;
                ll += gaussian_log_density(&(&y.slice(s![k..k + 1, ..]) - &mean), &cov)?;
            }
            ll
        } else {
            let (mean, cov) = self.predict(x, test_noise_var, false)?;
            gaussian_log_density(&(y - &mean), &cov)?
        };
        Ok(ll / F::cast(x.nrows() * self.dy))
    }
}

/// Log-density of residuals `r` (n, dy) whose columns are independent `N(0, cov)`
fn gaussian_log_density<F: Float>(r: &Array2<F>, cov: &Array2<F>) -> Result<F> {
    let (prec, logdet) = spd_inverse(cov)?;
    let n = F::cast(r.nrows());
    let dy = F::cast(r.ncols());
    let half = F::cast(0.5);
    let quad = (&prec * &r.dot(&r.t())).sum();
    Ok(-half * quad - half * dy * logdet - half * n * dy * F::cast(2. * std::f64::consts::PI).ln())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance::CovSpec;
    use crate::likelihood::Observations;
    use crate::MultiSharedBcm;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn posterior(
        cov: &CovSpec<f64>,
        x: &Array2<f64>,
        y: &Array2<f64>,
        xq: &Array2<f64>,
        test_noise: f64,
    ) -> (Array2<f64>, Array2<f64>) {
        let kernel = cov.evaluator(x.ncols()).unwrap();
        let (kinv, _) = spd_inverse(&kernel.covariance(x)).unwrap();
        let kstar = kernel.kernel_matrix(xq, x);
        let kss = kernel.kernel_matrix(xq, xq) + Array2::<f64>::eye(xq.nrows()) * test_noise;
        (
            kstar.dot(&kinv).dot(y),
            kss - kstar.dot(&kinv).dot(&kstar.t()),
        )
    }

    #[test]
    fn test_reproduce_training_observation() {
        let cov = CovSpec::squared_exponential(0.3, 1., 1e-8);
        let x = array![[0.], [0.5], [1.]];
        let y = array![[0.7], [-0.4], [1.2]];
        let bcm = MultiSharedBcm::params(cov)
            .neighbor_threshold(0.)
            .build(x, Observations::Raw(y), vec![0..3])
            .unwrap();
        let predictor = bcm.make_predictor(None).unwrap();
        let (mean, cov) = predictor.predict(&array![[0.5]], 0., false).unwrap();
        assert_abs_diff_eq!(mean[[0, 0]], -0.4, epsilon = 1e-6);
        assert!(cov[[0, 0]] < 1e-6);
    }

    #[test]
    fn test_single_block_is_exact_posterior() {
        let cov = CovSpec::squared_exponential(0.4, 1.5, 0.01);
        let x = array![[0.1, 0.2], [0.4, 0.5], [0.8, 0.3], [0.6, 0.9]];
        let y = array![[0.3, 1.], [-0.2, 0.5], [0.5, 0.1], [1.1, -0.4]];
        let xq = array![[0.3, 0.3], [0.7, 0.7]];
        let bcm = MultiSharedBcm::params(cov.clone())
            .build(x.clone(), Observations::Raw(y.clone()), vec![0..4])
            .unwrap();
        let predictor = bcm.make_predictor(None).unwrap();
        let (mean, pcov) = predictor.predict(&xq, 0.01, false).unwrap();
        let (expected_mean, expected_cov) = posterior(&cov, &x, &y, &xq, 0.01);
        assert_abs_diff_eq!(mean, expected_mean, epsilon = 1e-8);
        assert_abs_diff_eq!(pcov, expected_cov, epsilon = 1e-8);
    }

    #[test]
    fn test_local_uses_nearest_block() {
        let cov = CovSpec::squared_exponential(0.2, 1., 0.01);
        let x = array![[0.], [0.1], [5.], [5.1]];
        let y = array![[1.], [0.8], [-1.], [-0.7]];
        let bcm = MultiSharedBcm::params(cov.clone())
            .build(x.clone(), Observations::Raw(y.clone()), vec![0..2, 2..4])
            .unwrap();
        let predictor = bcm.make_predictor(None).unwrap();
        assert_eq!(predictor.n_blocks(), 2);
        let xq = array![[4.95]];
        let (mean, pcov) = predictor.predict(&xq, 0.01, true).unwrap();
        let xb = x.slice(s![2..4, ..]).to_owned();
        let yb = y.slice(s![2..4, ..]).to_owned();
        let (expected_mean, expected_cov) = posterior(&cov, &xb, &yb, &xq, 0.01);
        assert_abs_diff_eq!(mean, expected_mean, epsilon = 1e-8);
        assert_abs_diff_eq!(pcov, expected_cov, epsilon = 1e-8);
    }

    #[test]
    fn test_nonstationary_blocks_use_their_own_noise() {
        let ci = CovSpec::squared_exponential(0.3, 1., 0.01);
        let cj = CovSpec::squared_exponential(0.5, 0.8, 0.2);
        let x = array![[0.], [0.2], [0.6], [0.9]];
        let y = array![[0.4], [0.1], [-0.3], [0.5]];
        let bcm = MultiSharedBcm::params(ci.clone())
            .block_covariances(vec![ci.clone(), cj.clone()])
            .build(x.clone(), Observations::Raw(y.clone()), vec![0..2, 2..4])
            .unwrap();
        let predictor = bcm.make_predictor(None).unwrap();
        let xq = array![[0.4], [0.7]];
        let test_noise = 0.05;
        let (mean, pcov) = predictor.predict(&xq, test_noise, false).unwrap();

        let prior = CovSpec::mean_of(&[ci.clone(), cj.clone()])
            .unwrap()
            .evaluator(1)
            .unwrap();
        let prior_cov = prior.kernel_matrix(&xq, &xq) + Array2::<f64>::eye(2) * test_noise;
        let mut prec = spd_inverse(&prior_cov).unwrap().0;
        let mut weighted = Array2::<f64>::zeros((2, 1));
        for (cov, r) in [(&ci, 0..2), (&cj, 2..4)] {
            let xb = x.slice(s![r.clone(), ..]).to_owned();
            let yb = y.slice(s![r, ..]).to_owned();
            let (mb, cb) = posterior(cov, &xb, &yb, &xq, cov.noise_var());
            let kernel = cov.evaluator(1).unwrap();
            let kss = kernel.kernel_matrix(&xq, &xq) + Array2::<f64>::eye(2) * cov.noise_var();
            let cb_prec = spd_inverse(&cb).unwrap().0;
            weighted = weighted + cb_prec.dot(&mb);
            prec = prec + cb_prec - spd_inverse(&kss).unwrap().0;
        }
        let expected_cov = spd_inverse(&prec).unwrap().0;
        let expected_mean = expected_cov.dot(&weighted);
        assert_abs_diff_eq!(mean, expected_mean, epsilon = 1e-8);
        assert_abs_diff_eq!(pcov, expected_cov, epsilon = 1e-8);
    }

    #[test]
    fn test_predictor_outlives_engine_update() {
        let cov = CovSpec::squared_exponential(0.3, 1., 0.01);
        let x = array![[0.], [0.5], [1.]];
        let y = array![[0.7], [-0.4], [1.2]];
        let mut bcm = MultiSharedBcm::params(cov)
            .build(x, Observations::Raw(y), vec![0..1, 1..3])
            .unwrap();
        let predictor = bcm.make_predictor(None).unwrap();
        let before = predictor.predict(&array![[0.2]], 0., false).unwrap();
        bcm.update_points(array![[3.], [4.], [5.]]).unwrap();
        let after = predictor.predict(&array![[0.2]], 0., false).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_log_density() {
        let cov = CovSpec::squared_exponential(0.3, 1., 0.01);
        let x = array![[0.], [0.3], [0.6], [1.]];
        let y = array![[0.7], [0.2], [-0.4], [1.2]];
        let bcm = MultiSharedBcm::params(cov)
            .build(x, Observations::Raw(y), vec![0..2, 2..4])
            .unwrap();
        let predictor = bcm.make_predictor(None).unwrap();
        let xq = array![[0.45]];
        let yq = array![[-0.1]];
        let joint: f64 = predictor.log_density(&xq, &yq, 0.01, false).unwrap();
        let marginal = predictor.log_density(&xq, &yq, 0.01, true).unwrap();
        assert!(joint.is_finite());
        assert_abs_diff_eq!(joint, marginal, epsilon = 1e-12);
        let (mean, pcov) = predictor.predict(&xq, 0.01, false).unwrap();
        let v = pcov[[0, 0]];
        let r = -0.1 - mean[[0, 0]];
        let expected = -0.5 * r * r / v - 0.5 * (2. * std::f64::consts::PI * v).ln();
        assert_abs_diff_eq!(joint, expected, epsilon = 1e-10);
        assert!(predictor.log_density(&xq, &array![[1., 2.]], 0.01, false).is_err());
    }

    #[test]
    fn test_query_dimension_mismatch() {
        let cov = CovSpec::squared_exponential(0.3, 1., 0.01);
        let bcm = MultiSharedBcm::params(cov)
            .build(array![[0.], [1.]], Observations::Raw(array![[0.], [1.]]), vec![0..2])
            .unwrap();
        let predictor = bcm.make_predictor(None).unwrap();
        assert!(predictor.predict(&array![[0., 1.]], 0., false).is_err());
    }
}
