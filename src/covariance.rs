//! A module for the stationary covariance functions used by the block likelihood engine.
//!
//! A covariance is described by a [`CovSpec`]: a distance function with its length scales,
//! a weight function of the scaled distance `r`, a signal variance and a noise variance:
//!
//! `k(x, x') = signal_var * w(r) + noise_var * 1[x == x']`
//!
//! The following weight functions are implemented:
//! * squared exponential `exp(-r^2 / 2)`,
//! * absolute exponential `exp(-r)`,
//! * matern 3/2,
//! * matern 5/2.
//!
//! Specifications are immutable values. A [`KernelEvaluator`] is built from a specification
//! and a point dimension, and is rebuilt whenever the specification changes.

use crate::errors::{BcmError, Result};
use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, ArrayView1, Data, Ix1, Ix2, Zip};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;

/// Distance function used to compute the scaled distance `r` between two points
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub enum DistanceFunction {
    /// `r = sqrt(sum_d ((x_d - x'_d) / l_d)^2)`
    #[default]
    Euclidean,
}

impl From<DistanceFunction> for String {
    fn from(item: DistanceFunction) -> String {
        item.to_string()
    }
}

impl TryFrom<String> for DistanceFunction {
    type Error = &'static str;
    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "euclidean" => Ok(DistanceFunction::Euclidean),
            _ => Err("Bad string value for DistanceFunction, should be \'euclidean\'"),
        }
    }
}

impl fmt::Display for DistanceFunction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DistanceFunction::Euclidean => write!(f, "euclidean"),
        }
    }
}

/// Weight function `w(r)` applied to the scaled distance
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub enum WeightFunction {
    /// `exp(-r^2 / 2)`
    #[default]
    SquaredExponential,
    /// `exp(-r)`
    AbsoluteExponential,
    /// `(1 + sqrt(3) r) exp(-sqrt(3) r)`
    Matern32,
    /// `(1 + sqrt(5) r + 5 r^2 / 3) exp(-sqrt(5) r)`
    Matern52,
}

impl From<WeightFunction> for String {
    fn from(item: WeightFunction) -> String {
        item.to_string()
    }
}

impl TryFrom<String> for WeightFunction {
    type Error = &'static str;
    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "se" | "squared_exponential" | "squaredexponential" => {
                Ok(WeightFunction::SquaredExponential)
            }
            "exponential" | "absolute_exponential" | "absoluteexponential" => {
                Ok(WeightFunction::AbsoluteExponential)
            }
            "matern32" => Ok(WeightFunction::Matern32),
            "matern52" => Ok(WeightFunction::Matern52),
            _ => Err("Bad string value for WeightFunction, should be one of \'se\', \'exponential\', \'matern32\', \'matern52\'"),
        }
    }
}

impl fmt::Display for WeightFunction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            WeightFunction::SquaredExponential => "se",
            WeightFunction::AbsoluteExponential => "exponential",
            WeightFunction::Matern32 => "matern32",
            WeightFunction::Matern52 => "matern52",
        };
        write!(f, "{s}")
    }
}

impl WeightFunction {
    /// Value of the weight function at scaled distance `r`
    pub fn value<F: Float>(&self, r: F) -> F {
        match self {
            WeightFunction::SquaredExponential => F::exp(F::cast(-0.5) * r * r),
            WeightFunction::AbsoluteExponential => F::exp(-r),
            WeightFunction::Matern32 => {
                let a = F::cast(3.).sqrt() * r;
                (F::one() + a) * F::exp(-a)
            }
            WeightFunction::Matern52 => {
                let a = F::cast(5.).sqrt() * r;
                (F::one() + a + a * a / F::cast(3.)) * F::exp(-a)
            }
        }
    }

    /// `w'(r) / r`, the factor shared by every derivative of the kernel.
    ///
    /// The absolute exponential is not differentiable at `r = 0`, its factor is taken as zero there.
    pub fn scaled_derivative<F: Float>(&self, r: F) -> F {
        match self {
            WeightFunction::SquaredExponential => -self.value(r),
            WeightFunction::AbsoluteExponential => {
                if r > F::zero() {
                    -F::exp(-r) / r
                } else {
                    F::zero()
                }
            }
            WeightFunction::Matern32 => F::cast(-3.) * F::exp(-F::cast(3.).sqrt() * r),
            WeightFunction::Matern52 => {
                let a = F::cast(5.).sqrt() * r;
                F::cast(-5. / 3.) * (F::one() + a) * F::exp(-a)
            }
        }
    }
}

/// Covariance specification: distance function, length scales, weight function,
/// signal variance and noise variance.
///
/// Length scales are either shared by every input dimension (one value) or given per dimension.
/// Flat hyperparameter layout, used for gradients and updates, is
/// `[noise_var, signal_var, lengthscale_0, ..., lengthscale_{L-1}]`.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(serialize = "F: Serialize", deserialize = "F: Deserialize<'de>"))
)]
pub struct CovSpec<F: Float> {
    pub(crate) dfn: DistanceFunction,
    pub(crate) lengthscales: Array1<F>,
    pub(crate) wfn: WeightFunction,
    pub(crate) signal_var: F,
    pub(crate) noise_var: F,
}

impl<F: Float> CovSpec<F> {
    /// Constructor of a euclidean-distance covariance specification
    pub fn new(wfn: WeightFunction, lengthscales: Array1<F>, signal_var: F, noise_var: F) -> Self {
        CovSpec {
            dfn: DistanceFunction::Euclidean,
            lengthscales,
            wfn,
            signal_var,
            noise_var,
        }
    }

    /// Squared exponential covariance with a single length scale shared by all dimensions
    pub fn squared_exponential(lengthscale: F, signal_var: F, noise_var: F) -> Self {
        Self::new(
            WeightFunction::SquaredExponential,
            Array1::from_elem(1, lengthscale),
            signal_var,
            noise_var,
        )
    }

    /// Set distance function
    pub fn with_distance(mut self, dfn: DistanceFunction) -> Self {
        self.dfn = dfn;
        self
    }

    /// Distance function
    pub fn distance(&self) -> DistanceFunction {
        self.dfn
    }

    /// Weight function
    pub fn weight(&self) -> WeightFunction {
        self.wfn
    }

    /// Length scales (one shared value or one per dimension)
    pub fn lengthscales(&self) -> &Array1<F> {
        &self.lengthscales
    }

    /// Signal variance
    pub fn signal_var(&self) -> F {
        self.signal_var
    }

    /// Noise variance
    pub fn noise_var(&self) -> F {
        self.noise_var
    }

    /// Whether a single length scale is shared by every dimension
    pub fn is_shared(&self) -> bool {
        self.lengthscales.len() == 1
    }

    /// Number of hyperparameters in the flat layout
    pub fn n_params(&self) -> usize {
        2 + self.lengthscales.len()
    }

    /// Flat hyperparameters `[noise_var, signal_var, lengthscales...]`
    pub fn to_params(&self) -> Array1<F> {
        let mut params = Array1::zeros(self.n_params());
        params[0] = self.noise_var;
        params[1] = self.signal_var;
        params
            .slice_mut(ndarray::s![2..])
            .assign(&self.lengthscales);
        params
    }

    /// A new specification with the same functions and the given flat hyperparameters
    pub fn with_params(&self, params: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<Self> {
        if params.len() != self.n_params() {
            return Err(BcmError::InvalidValueError(format!(
                "Expected {} covariance parameters, got {}",
                self.n_params(),
                params.len()
            )));
        }
        Ok(CovSpec {
            dfn: self.dfn,
            lengthscales: params.slice(ndarray::s![2..]).to_owned(),
            wfn: self.wfn,
            signal_var: params[1],
            noise_var: params[0],
        })
    }

    /// Check the specification is usable for points of dimension `dim`
    pub fn validate(&self, dim: usize) -> Result<()> {
        let nl = self.lengthscales.len();
        if nl != 1 && nl != dim {
            return Err(BcmError::InvalidValueError(format!(
                "Length scales should be of size 1 or {dim} (point dimension), got {nl}"
            )));
        }
        if self.lengthscales.iter().any(|l| !(l.is_finite() && *l > F::zero())) {
            return Err(BcmError::InvalidValueError(format!(
                "Length scales should be positive, got {}",
                self.lengthscales
            )));
        }
        if !(self.signal_var.is_finite() && self.signal_var > F::zero()) {
            return Err(BcmError::InvalidValueError(format!(
                "Signal variance should be positive, got {}",
                self.signal_var
            )));
        }
        if !(self.noise_var.is_finite() && self.noise_var >= F::zero()) {
            return Err(BcmError::InvalidValueError(format!(
                "Noise variance should be non negative, got {}",
                self.noise_var
            )));
        }
        Ok(())
    }

    /// Whether `other` has the same functions and length scale layout
    pub fn same_layout(&self, other: &CovSpec<F>) -> bool {
        self.dfn == other.dfn
            && self.wfn == other.wfn
            && self.lengthscales.len() == other.lengthscales.len()
    }

    /// Arithmetic mean of specifications sharing one layout
    pub fn mean_of(specs: &[CovSpec<F>]) -> Result<Self> {
        let first = specs.first().ok_or_else(|| {
            BcmError::InvalidValueError("Cannot average an empty set of covariances".to_string())
        })?;
        if let Some(other) = specs.iter().find(|s| !first.same_layout(s)) {
            return Err(BcmError::InvalidValueError(format!(
                "Covariances {} and {} do not share the same layout",
                first, other
            )));
        }
        let n = F::cast(specs.len());
        let sum = specs
            .iter()
            .skip(1)
            .fold(first.to_params(), |acc, s| acc + s.to_params());
        first.with_params(&(sum / n))
    }

    /// Build the evaluator of this specification for points of dimension `dim`
    pub fn evaluator(&self, dim: usize) -> Result<KernelEvaluator<F>> {
        KernelEvaluator::new(self, dim)
    }
}

impl<F: Float> fmt::Display for CovSpec<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}({}, lengthscales={}, signal_var={}, noise_var={})",
            self.wfn, self.dfn, self.lengthscales, self.signal_var, self.noise_var
        )
    }
}

/// Kernel evaluator: kernel matrices and their derivatives w.r.t. point coordinates
/// and hyperparameters for a fixed [`CovSpec`].
#[derive(Clone, Debug)]
pub struct KernelEvaluator<F: Float> {
    spec: CovSpec<F>,
    /// Length scales broadcast to the point dimension
    scales: Array1<F>,
}

impl<F: Float> KernelEvaluator<F> {
    /// Build an evaluator, fails if the specification is invalid for dimension `dim`
    pub fn new(spec: &CovSpec<F>, dim: usize) -> Result<Self> {
        spec.validate(dim)?;
        let scales = if spec.is_shared() {
            Array1::from_elem(dim, spec.lengthscales[0])
        } else {
            spec.lengthscales.to_owned()
        };
        Ok(KernelEvaluator {
            spec: spec.clone(),
            scales,
        })
    }

    /// Specification of this evaluator
    pub fn spec(&self) -> &CovSpec<F> {
        &self.spec
    }

    /// Point dimension
    pub fn dim(&self) -> usize {
        self.scales.len()
    }

    /// Number of hyperparameters
    pub fn n_params(&self) -> usize {
        self.spec.n_params()
    }

    /// Scaled distance between two points
    pub fn distance(&self, a: &ArrayView1<F>, b: &ArrayView1<F>) -> F {
        let mut r2 = F::zero();
        Zip::from(a).and(b).and(&self.scales).for_each(|&u, &v, &l| {
            let t = (u - v) / l;
            r2 += t * t;
        });
        r2.sqrt()
    }

    /// Noiseless kernel value between two points
    pub fn entry(&self, a: &ArrayView1<F>, b: &ArrayView1<F>) -> F {
        self.spec.signal_var * self.spec.wfn.value(self.distance(a, b))
    }

    /// Derivative of `k(a, b)` w.r.t. the `d`-th coordinate of `a`
    pub fn entry_dx(&self, a: &ArrayView1<F>, b: &ArrayView1<F>, d: usize) -> F {
        let r = self.distance(a, b);
        let l = self.scales[d];
        self.spec.signal_var * self.spec.wfn.scaled_derivative(r) * (a[d] - b[d]) / (l * l)
    }

    /// Derivative of the noiseless `k(a, b)` w.r.t. the `index`-th flat hyperparameter
    pub fn entry_dparam(&self, a: &ArrayView1<F>, b: &ArrayView1<F>, index: usize) -> F {
        match index {
            0 => F::zero(),
            1 => self.spec.wfn.value(self.distance(a, b)),
            k => {
                let r = self.distance(a, b);
                let g = self.spec.signal_var * self.spec.wfn.scaled_derivative(r);
                if self.spec.is_shared() {
                    let l = self.spec.lengthscales[0];
                    -g * r * r / l
                } else {
                    let d = k - 2;
                    let l = self.scales[d];
                    let delta = a[d] - b[d];
                    -g * delta * delta / (l * l * l)
                }
            }
        }
    }

    /// Noiseless cross covariance matrix `k(a_i, b_j)`
    pub fn kernel_matrix(
        &self,
        a: &ArrayBase<impl Data<Elem = F>, Ix2>,
        b: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Array2<F> {
        Array2::from_shape_fn((a.nrows(), b.nrows()), |(i, j)| {
            self.entry(&a.row(i), &b.row(j))
        })
    }

    /// Covariance matrix of `x` including the noise variance on the diagonal
    pub fn covariance(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F> {
        let mut k = self.kernel_matrix(x, x);
        k.diag_mut().mapv_inplace(|v| v + self.spec.noise_var);
        k
    }

    /// Row `p` of the derivative of `k(x, x)` w.r.t. coordinate `x[p, d]`, entry `p` is zero.
    pub fn dk_dx_row(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        p: usize,
        d: usize,
    ) -> Array1<F> {
        let xp = x.row(p);
        Array1::from_shape_fn(x.nrows(), |j| {
            if j == p {
                F::zero()
            } else {
                self.entry_dx(&xp, &x.row(j), d)
            }
        })
    }

    /// Derivative of the covariance matrix of `x` w.r.t. the `index`-th flat hyperparameter
    pub fn dk_dparam(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>, index: usize) -> Array2<F> {
        if index == 0 {
            return Array2::eye(x.nrows());
        }
        Array2::from_shape_fn((x.nrows(), x.nrows()), |(i, j)| {
            self.entry_dparam(&x.row(i), &x.row(j), index)
        })
    }

    /// Largest absolute cross covariance between `a` and `b` normalized by the signal variance
    pub fn max_correlation(
        &self,
        a: &ArrayBase<impl Data<Elem = F>, Ix2>,
        b: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> F {
        let mut max = F::zero();
        for ai in a.rows() {
            for bj in b.rows() {
                let v = self.spec.wfn.value(self.distance(&ai, &bj)).abs();
                if v > max {
                    max = v;
                }
            }
        }
        max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};
    use paste::paste;

    #[test]
    fn test_weight_function_values() {
        let r = 0.7f64;
        assert_abs_diff_eq!(
            WeightFunction::SquaredExponential.value(r),
            (-0.245f64).exp(),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            WeightFunction::AbsoluteExponential.value(r),
            (-0.7f64).exp(),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(WeightFunction::Matern32.value(0.), 1., epsilon = 1e-12);
        assert_abs_diff_eq!(WeightFunction::Matern52.value(0.), 1., epsilon = 1e-12);
    }

    #[test]
    fn test_weight_function_string_ids() {
        for w in [
            WeightFunction::SquaredExponential,
            WeightFunction::AbsoluteExponential,
            WeightFunction::Matern32,
            WeightFunction::Matern52,
        ] {
            assert_eq!(WeightFunction::try_from(w.to_string()), Ok(w));
        }
        assert!(WeightFunction::try_from("gaussian".to_string()).is_err());
        assert_eq!(
            DistanceFunction::try_from("Euclidean".to_string()),
            Ok(DistanceFunction::Euclidean)
        );
    }

    #[test]
    fn test_params_layout() {
        let spec = CovSpec::new(
            WeightFunction::Matern52,
            array![0.5, 2.0],
            1.5,
            0.01,
        );
        assert_eq!(spec.n_params(), 4);
        assert_abs_diff_eq!(spec.to_params(), array![0.01, 1.5, 0.5, 2.0]);
        let other = spec.with_params(&array![0.1, 2.0, 1.0, 1.0]).unwrap();
        assert_eq!(other.weight(), WeightFunction::Matern52);
        assert_abs_diff_eq!(other.noise_var(), 0.1);
        assert!(spec.with_params(&array![0.1, 2.0]).is_err());
    }

    #[test]
    fn test_validate() {
        let spec = CovSpec::new(WeightFunction::SquaredExponential, array![0.5, 2.0], 1., 0.);
        assert!(spec.validate(2).is_ok());
        assert!(spec.validate(3).is_err());
        let spec = CovSpec::squared_exponential(-1., 1., 0.);
        assert!(spec.validate(2).is_err());
        let spec = CovSpec::squared_exponential(1., 0., 0.);
        assert!(spec.validate(2).is_err());
    }

    #[test]
    fn test_mean_of() {
        let a = CovSpec::squared_exponential(1., 1., 0.1);
        let b = CovSpec::squared_exponential(3., 2., 0.3);
        let m = CovSpec::mean_of(&[a.clone(), b]).unwrap();
        assert_abs_diff_eq!(m.to_params(), array![0.2, 1.5, 2.0], epsilon = 1e-12);
        let c = CovSpec::new(WeightFunction::Matern32, array![1.], 1., 0.);
        assert!(CovSpec::mean_of(&[a, c]).is_err());
    }

    #[test]
    fn test_covariance_matrix() {
        let spec = CovSpec::squared_exponential(1., 2., 0.5);
        let kernel = spec.evaluator(1).unwrap();
        let x = array![[0.], [1.]];
        let k = kernel.covariance(&x);
        let expected = array![
            [2.5, 2. * (-0.5f64).exp()],
            [2. * (-0.5f64).exp(), 2.5]
        ];
        assert_abs_diff_eq!(k, expected, epsilon = 1e-12);
    }

    fn sample_points() -> Array2<f64> {
        array![[0.1, 0.2], [0.5, -0.3], [0.9, 0.4], [-0.2, 0.7]]
    }

    macro_rules! test_kernel_derivatives {
        ($wfn:ident, $lengthscales:expr, $suffix:ident) => {
            paste! {
                #[test]
                fn [<test_ $wfn:lower _ $suffix _dk_dx>]() {
                    let spec = CovSpec::new(WeightFunction::$wfn, $lengthscales, 1.3, 0.1);
                    let kernel = spec.evaluator(2).unwrap();
                    let x = sample_points();
                    let e = 1e-6;
                    for p in 0..x.nrows() {
                        for d in 0..2 {
                            let row = kernel.dk_dx_row(&x, p, d);
                            let mut xp = x.clone();
                            xp[[p, d]] += e;
                            let mut xm = x.clone();
                            xm[[p, d]] -= e;
                            let fd = (kernel.kernel_matrix(&xp, &xp).row(p).to_owned()
                                - kernel.kernel_matrix(&xm, &xm).row(p))
                                / (2. * e);
                            for j in 0..x.nrows() {
                                if j != p {
                                    assert_abs_diff_eq!(row[j], fd[j], epsilon = 1e-6);
                                }
                            }
                            assert_abs_diff_eq!(row[p], 0.);
                        }
                    }
                }

                #[test]
                fn [<test_ $wfn:lower _ $suffix _dk_dparam>]() {
                    let spec = CovSpec::new(WeightFunction::$wfn, $lengthscales, 1.3, 0.1);
                    let x = sample_points();
                    let kernel = spec.evaluator(2).unwrap();
                    let params = spec.to_params();
                    let e = 1e-6;
                    for t in 0..spec.n_params() {
                        let mut pp = params.clone();
                        pp[t] += e;
                        let mut pm = params.clone();
                        pm[t] -= e;
                        let kp = spec.with_params(&pp).unwrap().evaluator(2).unwrap().covariance(&x);
                        let km = spec.with_params(&pm).unwrap().evaluator(2).unwrap().covariance(&x);
                        let fd = (kp - km) / (2. * e);
                        assert_abs_diff_eq!(kernel.dk_dparam(&x, t), fd, epsilon = 1e-6);
                    }
                }
            }
        };
    }

    test_kernel_derivatives!(SquaredExponential, array![0.7], shared);
    test_kernel_derivatives!(AbsoluteExponential, array![0.7], shared);
    test_kernel_derivatives!(Matern32, array![0.7], shared);
    test_kernel_derivatives!(Matern52, array![0.7], shared);
    test_kernel_derivatives!(SquaredExponential, array![0.6, 1.1], ard);
    test_kernel_derivatives!(AbsoluteExponential, array![0.6, 1.1], ard);
    test_kernel_derivatives!(Matern32, array![0.6, 1.1], ard);
    test_kernel_derivatives!(Matern52, array![0.6, 1.1], ard);
}
