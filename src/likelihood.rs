//! Gaussian log-likelihood and gradients of blocks and block pairs.
//!
//! Given a covariance `K` over `n` points and observations `Y` with `dy` columns:
//!
//! `ll = -1/2 tr(Y^T K^-1 Y) - dy/2 logdet(K) - n dy/2 log(2 pi)`
//!
//! When observations are kernelized, only `YY = Y Y^T` is known and the quadratic term
//! becomes `tr(K^-1 YY)`.
//!
//! A numerically degenerate covariance never makes an evaluation fail: it yields the
//! [`DEGENERATE_LIKELIHOOD`] sentinel with zero point gradients and hyperparameter
//! gradients of `-1`, steering a caller optimizer away.

use crate::covariance::{CovSpec, KernelEvaluator};
use crate::errors::{BcmError, Result};
use crate::utils::{inverse_residual, spd_inverse};
use linfa::Float;
use log::warn;
use ndarray::{concatenate, s, Array1, Array2, ArrayBase, ArrayView2, Axis, Data, Ix2};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Log-likelihood returned for a numerically degenerate block
pub const DEGENERATE_LIKELIHOOD: f64 = -1e10;
/// Max residual `|K^-1 K - I|` accepted for a block covariance inverse
pub const INVERSE_TOLERANCE: f64 = 1e-4;

/// Observations attached to the points
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(serialize = "F: Serialize", deserialize = "F: Deserialize<'de>"))
)]
pub enum Observations<F: Float> {
    /// Raw observation matrix (n, dy)
    Raw(Array2<F>),
    /// Kernelized observations `YY = Y Y^T` (n, n) where `Y` has `dy` columns
    Kernelized {
        /// outer product of observations
        yy: Array2<F>,
        /// number of observation columns
        dy: usize,
    },
}

impl<F: Float> Observations<F> {
    /// Number of observed points
    pub fn n_points(&self) -> usize {
        match self {
            Observations::Raw(y) => y.nrows(),
            Observations::Kernelized { yy, .. } => yy.nrows(),
        }
    }

    /// Number of observation columns
    pub fn dy(&self) -> usize {
        match self {
            Observations::Raw(y) => y.ncols(),
            Observations::Kernelized { dy, .. } => *dy,
        }
    }

    /// Whether observations are kernelized
    pub fn is_kernelized(&self) -> bool {
        matches!(self, Observations::Kernelized { .. })
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            Observations::Raw(y) if y.ncols() == 0 => Err(BcmError::InvalidValueError(
                "Observations should have at least one column".to_string(),
            )),
            Observations::Kernelized { yy, dy } => {
                if yy.nrows() != yy.ncols() {
                    Err(BcmError::InvalidValueError(format!(
                        "Kernelized observations should be square, got {:?}",
                        yy.dim()
                    )))
                } else if *dy == 0 {
                    Err(BcmError::InvalidValueError(
                        "Kernelized observations should have dy > 0".to_string(),
                    ))
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    /// Observations reordered so that row `k` is the former row `perm[k]`
    /// (rows and columns for kernelized observations)
    pub fn permuted(&self, perm: &[usize]) -> Self {
        match self {
            Observations::Raw(y) => Observations::Raw(y.select(Axis(0), perm)),
            Observations::Kernelized { yy, dy } => Observations::Kernelized {
                yy: yy.select(Axis(0), perm).select(Axis(1), perm),
                dy: *dy,
            },
        }
    }
}

/// Joint evaluation policy of two blocks with different covariances
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum NonstationaryJoint {
    /// Average of the joint likelihoods computed under each block covariance.
    /// This is a symmetric approximation, not a proper joint density.
    #[default]
    PrecisionAverage,
    /// Each block keeps its own covariance, the cross covariance uses the
    /// arithmetic mean of both block specifications.
    CovarianceAverage,
}

/// Evaluation options
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EvalOptions {
    /// compute gradient w.r.t. point coordinates
    pub grad_x: bool,
    /// compute gradient w.r.t. covariance hyperparameters
    pub grad_cov: bool,
    /// use the neighbor graph, otherwise every block pair is used
    pub local: bool,
    /// fan block evaluations out on the rayon thread pool
    pub parallel: bool,
}

impl Default for EvalOptions {
    fn default() -> Self {
        EvalOptions {
            grad_x: true,
            grad_cov: true,
            local: true,
            parallel: false,
        }
    }
}

impl EvalOptions {
    /// Log-likelihood only, no gradient
    pub fn ll_only() -> Self {
        EvalOptions {
            grad_x: false,
            grad_cov: false,
            ..Default::default()
        }
    }
}

/// Log-likelihood of a block or a block pair with its optional gradients
#[derive(Clone, Debug, PartialEq)]
pub struct LlGrad<F: Float> {
    /// log-likelihood
    pub ll: F,
    /// gradient w.r.t. point coordinates (n, dim)
    pub grad_x: Option<Array2<F>>,
    /// gradient w.r.t. covariance hyperparameters
    pub grad_cov: Option<Array1<F>>,
    degenerate: bool,
}

impl<F: Float> LlGrad<F> {
    fn new(ll: F, grad_x: Option<Array2<F>>, grad_cov: Option<Array1<F>>) -> Self {
        LlGrad {
            ll,
            grad_x,
            grad_cov,
            degenerate: false,
        }
    }

    fn empty(dim: usize, ncov: usize, opts: &EvalOptions) -> Self {
        Self::new(
            F::zero(),
            opts.grad_x.then(|| Array2::zeros((0, dim))),
            opts.grad_cov.then(|| Array1::zeros(ncov)),
        )
    }

    pub(crate) fn degenerate(n: usize, dim: usize, ncov: usize, opts: &EvalOptions) -> Self {
        LlGrad {
            ll: F::cast(DEGENERATE_LIKELIHOOD),
            grad_x: opts.grad_x.then(|| Array2::zeros((n, dim))),
            grad_cov: opts.grad_cov.then(|| Array1::from_elem(ncov, -F::one())),
            degenerate: true,
        }
    }

    /// Whether this result is the degenerate sentinel rather than a computed likelihood
    pub fn is_degenerate(&self) -> bool {
        self.degenerate
    }
}

pub(crate) enum Targets<'a, F: Float> {
    Raw(ArrayView2<'a, F>),
    Kernelized { yy: ArrayView2<'a, F>, dy: usize },
}

impl<F: Float> Targets<'_, F> {
    fn dy(&self) -> usize {
        match self {
            Targets::Raw(y) => y.ncols(),
            Targets::Kernelized { dy, .. } => *dy,
        }
    }
}

/// Gaussian log-likelihood and gradients for covariance `k` of `n` points of dimension `dim`.
///
/// `dk_dx(p, i)` returns row `p` of `dK/dx[p, i]` with a zero at position `p`,
/// `dk_dparam(t)` returns `dK/dtheta_t` for the `ncov` hyperparameters.
pub(crate) fn gaussian_llgrad<F: Float>(
    k: &Array2<F>,
    dim: usize,
    targets: Targets<F>,
    ncov: usize,
    opts: &EvalOptions,
    dk_dx: impl Fn(usize, usize) -> Array1<F>,
    dk_dparam: impl Fn(usize) -> Array2<F>,
) -> LlGrad<F> {
    let n = k.nrows();
    if n == 0 {
        return LlGrad::empty(dim, ncov, opts);
    }
    let (prec, logdet) = match spd_inverse(k) {
        Ok(res) => res,
        Err(err) => {
            warn!("Degenerate block covariance of {n} points: {err}");
            return LlGrad::degenerate(n, dim, ncov, opts);
        }
    };
    let residual = inverse_residual(k, &prec);
    if !(residual <= F::cast(INVERSE_TOLERANCE)) {
        warn!("Inaccurate inverse of block covariance of {n} points (residual {residual})");
        return LlGrad::degenerate(n, dim, ncov, opts);
    }

    let dy = F::cast(targets.dy());
    let half = F::cast(0.5);
    let norm = half * dy * (logdet + F::cast(n) * F::cast(2. * std::f64::consts::PI).ln());
    // raw: alpha = K^-1 Y, kernelized: K^-1 YY
    let (quad, left) = match &targets {
        Targets::Raw(y) => {
            let alpha = prec.dot(y);
            ((y * &alpha).sum(), alpha)
        }
        Targets::Kernelized { yy, .. } => {
            let kyy = prec.dot(yy);
            (kyy.diag().sum(), kyy)
        }
    };
    let ll = -half * quad - norm;
    if !ll.is_finite() {
        warn!("Non finite log-likelihood for block of {n} points");
        return LlGrad::degenerate(n, dim, ncov, opts);
    }
    if !(opts.grad_x || opts.grad_cov) {
        return LlGrad::new(ll, None, None);
    }

    // gradients of the quadratic term are 1/2 sum(W o dK)
    let w = match &targets {
        Targets::Raw(_) => left.dot(&left.t()),
        Targets::Kernelized { .. } => left.dot(&prec),
    };

    let grad_x = opts.grad_x.then(|| {
        let mut grad = Array2::zeros((n, dim));
        for p in 0..n {
            for i in 0..dim {
                let dcv = dk_dx(p, i);
                grad[[p, i]] = w.row(p).dot(&dcv) - dy * prec.row(p).dot(&dcv);
            }
        }
        grad
    });
    let grad_cov = opts.grad_cov.then(|| {
        Array1::from_shape_fn(ncov, |t| {
            let dk = dk_dparam(t);
            half * ((&w * &dk).sum() - dy * (&prec * &dk).sum())
        })
    });

    LlGrad::new(ll, grad_x, grad_cov)
}

/// Unary and joint likelihood of blocks
pub trait BlockLikelihood<F: Float>: Sync {
    /// Number of blocks
    fn n_blocks(&self) -> usize;
    /// Likelihood of block `i` alone
    fn unary(&self, i: usize, opts: &EvalOptions) -> LlGrad<F>;
    /// Likelihood of blocks `i` and `j` taken together, point gradient rows are
    /// the points of `i` followed by the points of `j`.
    fn joint(&self, i: usize, j: usize, opts: &EvalOptions) -> LlGrad<F>;
}

/// Points sorted by block with their contiguous block ranges
#[derive(Clone, Debug)]
pub(crate) struct Blocks<F: Float> {
    pub(crate) x: Array2<F>,
    pub(crate) boundaries: Vec<Range<usize>>,
}

impl<F: Float> Blocks<F> {
    pub(crate) fn new(x: Array2<F>, boundaries: Vec<Range<usize>>) -> Result<Self> {
        if boundaries.is_empty() {
            return Err(BcmError::InvalidValueError(
                "At least one block is required".to_string(),
            ));
        }
        let mut start = 0;
        for (i, r) in boundaries.iter().enumerate() {
            if r.start != start || r.end < r.start {
                return Err(BcmError::InvalidValueError(format!(
                    "Block {i} range {r:?} does not follow previous block ending at {start}"
                )));
            }
            start = r.end;
        }
        if start != x.nrows() {
            return Err(BcmError::InvalidValueError(format!(
                "Block ranges cover {start} points, expected {}",
                x.nrows()
            )));
        }
        Ok(Blocks { x, boundaries })
    }

    pub(crate) fn n_blocks(&self) -> usize {
        self.boundaries.len()
    }

    pub(crate) fn dim(&self) -> usize {
        self.x.ncols()
    }

    pub(crate) fn len(&self, i: usize) -> usize {
        self.boundaries[i].len()
    }

    pub(crate) fn points(&self, i: usize) -> ArrayView2<F> {
        self.x.slice(s![self.boundaries[i].clone(), ..])
    }

    pub(crate) fn joint_indices(&self, i: usize, j: usize) -> Vec<usize> {
        self.boundaries[i]
            .clone()
            .chain(self.boundaries[j].clone())
            .collect()
    }

    pub(crate) fn set_points(&mut self, x: Array2<F>) -> Result<()> {
        if x.dim() != self.x.dim() {
            return Err(BcmError::InvalidValueError(format!(
                "Points should be of shape {:?}, got {:?}",
                self.x.dim(),
                x.dim()
            )));
        }
        self.x = x;
        Ok(())
    }
}

fn stationary_llgrad<F: Float>(
    kernel: &KernelEvaluator<F>,
    x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    targets: Targets<F>,
    opts: &EvalOptions,
) -> LlGrad<F> {
    let k = kernel.covariance(x);
    gaussian_llgrad(
        &k,
        x.ncols(),
        targets,
        kernel.n_params(),
        opts,
        |p, i| kernel.dk_dx_row(x, p, i),
        |t| kernel.dk_dparam(x, t),
    )
}

fn check_observations<F: Float>(blocks: &Blocks<F>, n_obs: usize) -> Result<()> {
    if n_obs != blocks.x.nrows() {
        return Err(BcmError::InvalidValueError(format!(
            "{} points but {n_obs} observations",
            blocks.x.nrows()
        )));
    }
    Ok(())
}

/// Shared covariance with raw observations
#[derive(Clone, Debug)]
pub struct StationaryRaw<F: Float> {
    blocks: Blocks<F>,
    y: Array2<F>,
    kernel: KernelEvaluator<F>,
}

impl<F: Float> StationaryRaw<F> {
    /// Constructor
    pub fn new(
        x: Array2<F>,
        y: Array2<F>,
        boundaries: Vec<Range<usize>>,
        cov: &CovSpec<F>,
    ) -> Result<Self> {
        let blocks = Blocks::new(x, boundaries)?;
        check_observations(&blocks, y.nrows())?;
        let kernel = cov.evaluator(blocks.dim())?;
        Ok(StationaryRaw { blocks, y, kernel })
    }
}

impl<F: Float> BlockLikelihood<F> for StationaryRaw<F> {
    fn n_blocks(&self) -> usize {
        self.blocks.n_blocks()
    }

    fn unary(&self, i: usize, opts: &EvalOptions) -> LlGrad<F> {
        let y = self.y.slice(s![self.blocks.boundaries[i].clone(), ..]);
        stationary_llgrad(&self.kernel, &self.blocks.points(i), Targets::Raw(y), opts)
    }

    fn joint(&self, i: usize, j: usize, opts: &EvalOptions) -> LlGrad<F> {
        let idx = self.blocks.joint_indices(i, j);
        let x = self.blocks.x.select(Axis(0), &idx);
        let y = self.y.select(Axis(0), &idx);
        stationary_llgrad(&self.kernel, &x, Targets::Raw(y.view()), opts)
    }
}

/// Shared covariance with kernelized observations
#[derive(Clone, Debug)]
pub struct StationaryKernelized<F: Float> {
    blocks: Blocks<F>,
    yy: Array2<F>,
    dy: usize,
    kernel: KernelEvaluator<F>,
}

impl<F: Float> StationaryKernelized<F> {
    /// Constructor
    pub fn new(
        x: Array2<F>,
        yy: Array2<F>,
        dy: usize,
        boundaries: Vec<Range<usize>>,
        cov: &CovSpec<F>,
    ) -> Result<Self> {
        let blocks = Blocks::new(x, boundaries)?;
        check_observations(&blocks, yy.nrows())?;
        if yy.ncols() != yy.nrows() || dy == 0 {
            return Err(BcmError::InvalidValueError(format!(
                "Kernelized observations should be square with dy > 0, got {:?} and dy = {dy}",
                yy.dim()
            )));
        }
        let kernel = cov.evaluator(blocks.dim())?;
        Ok(StationaryKernelized {
            blocks,
            yy,
            dy,
            kernel,
        })
    }
}

impl<F: Float> BlockLikelihood<F> for StationaryKernelized<F> {
    fn n_blocks(&self) -> usize {
        self.blocks.n_blocks()
    }

    fn unary(&self, i: usize, opts: &EvalOptions) -> LlGrad<F> {
        let r = self.blocks.boundaries[i].clone();
        let yy = self.yy.slice(s![r.clone(), r]);
        let targets = Targets::Kernelized { yy, dy: self.dy };
        stationary_llgrad(&self.kernel, &self.blocks.points(i), targets, opts)
    }

    fn joint(&self, i: usize, j: usize, opts: &EvalOptions) -> LlGrad<F> {
        let idx = self.blocks.joint_indices(i, j);
        let x = self.blocks.x.select(Axis(0), &idx);
        let yy = self.yy.select(Axis(0), &idx).select(Axis(1), &idx);
        let targets = Targets::Kernelized {
            yy: yy.view(),
            dy: self.dy,
        };
        stationary_llgrad(&self.kernel, &x, targets, opts)
    }
}

/// Covariance of a block pair where each block keeps its own covariance and
/// the cross terms use the averaged specification.
struct MixedKernel<'a, F: Float> {
    ki: &'a KernelEvaluator<F>,
    kj: &'a KernelEvaluator<F>,
    kavg: KernelEvaluator<F>,
    /// number of points of the first block
    ni: usize,
}

impl<F: Float> MixedKernel<'_, F> {
    /// Evaluator of entry (p, q) and whether it is a cross block entry
    fn pick(&self, p: usize, q: usize) -> (&KernelEvaluator<F>, bool) {
        match (p < self.ni, q < self.ni) {
            (true, true) => (self.ki, false),
            (false, false) => (self.kj, false),
            _ => (&self.kavg, true),
        }
    }

    fn covariance(&self, x: &Array2<F>) -> Array2<F> {
        let n = x.nrows();
        Array2::from_shape_fn((n, n), |(p, q)| {
            let (kernel, _) = self.pick(p, q);
            let v = kernel.entry(&x.row(p), &x.row(q));
            if p == q {
                v + kernel.spec().noise_var()
            } else {
                v
            }
        })
    }

    fn dk_dx_row(&self, x: &Array2<F>, p: usize, d: usize) -> Array1<F> {
        Array1::from_shape_fn(x.nrows(), |q| {
            if q == p {
                F::zero()
            } else {
                self.pick(p, q).0.entry_dx(&x.row(p), &x.row(q), d)
            }
        })
    }

    /// Derivative w.r.t. parameter `t` of `[theta_i, theta_j]`
    fn dk_dparam(&self, x: &Array2<F>, t: usize) -> Array2<F> {
        let ncov = self.ki.n_params();
        let (first, index) = (t < ncov, t % ncov);
        let n = x.nrows();
        Array2::from_shape_fn((n, n), |(p, q)| {
            let (kernel, cross) = self.pick(p, q);
            if cross {
                F::cast(0.5) * self.kavg.entry_dparam(&x.row(p), &x.row(q), index)
            } else if (p < self.ni) != first {
                F::zero()
            } else if index == 0 {
                if p == q {
                    F::one()
                } else {
                    F::zero()
                }
            } else {
                kernel.entry_dparam(&x.row(p), &x.row(q), index)
            }
        })
    }
}

/// Per-block covariances with raw observations
#[derive(Clone, Debug)]
pub struct NonstationaryRaw<F: Float> {
    blocks: Blocks<F>,
    y: Array2<F>,
    kernels: Vec<KernelEvaluator<F>>,
    joint: NonstationaryJoint,
}

impl<F: Float> NonstationaryRaw<F> {
    /// Constructor, one covariance per block
    pub fn new(
        x: Array2<F>,
        y: Array2<F>,
        boundaries: Vec<Range<usize>>,
        covs: &[CovSpec<F>],
        joint: NonstationaryJoint,
    ) -> Result<Self> {
        let blocks = Blocks::new(x, boundaries)?;
        check_observations(&blocks, y.nrows())?;
        let kernels = block_kernels(covs, blocks.n_blocks(), blocks.dim())?;
        Ok(NonstationaryRaw {
            blocks,
            y,
            kernels,
            joint,
        })
    }

    fn precision_average_joint(&self, i: usize, j: usize, opts: &EvalOptions) -> LlGrad<F> {
        let idx = self.blocks.joint_indices(i, j);
        let x = self.blocks.x.select(Axis(0), &idx);
        let y = self.y.select(Axis(0), &idx);
        let a = stationary_llgrad(&self.kernels[i], &x, Targets::Raw(y.view()), opts);
        let b = stationary_llgrad(&self.kernels[j], &x, Targets::Raw(y.view()), opts);
        let ncov = self.kernels[i].n_params();
        if a.is_degenerate() || b.is_degenerate() {
            return LlGrad::degenerate(x.nrows(), x.ncols(), 2 * ncov, opts);
        }
        let half = F::cast(0.5);
        LlGrad::new(
            half * (a.ll + b.ll),
            a.grad_x.zip(b.grad_x).map(|(ga, gb)| (ga + gb) * half),
            a.grad_cov
                .zip(b.grad_cov)
                .map(|(ga, gb)| concatenate![Axis(0), ga, gb] * half),
        )
    }

    fn covariance_average_joint(&self, i: usize, j: usize, opts: &EvalOptions) -> LlGrad<F> {
        let idx = self.blocks.joint_indices(i, j);
        let x = self.blocks.x.select(Axis(0), &idx);
        let y = self.y.select(Axis(0), &idx);
        let ncov = self.kernels[i].n_params();
        let kavg = CovSpec::mean_of(&[
            self.kernels[i].spec().clone(),
            self.kernels[j].spec().clone(),
        ])
        .and_then(|spec| spec.evaluator(self.blocks.dim()));
        let kavg = match kavg {
            Ok(kavg) => kavg,
            Err(err) => {
                warn!("Cannot average covariances of blocks {i} and {j}: {err}");
                return LlGrad::degenerate(x.nrows(), x.ncols(), 2 * ncov, opts);
            }
        };
        let mixed = MixedKernel {
            ki: &self.kernels[i],
            kj: &self.kernels[j],
            kavg,
            ni: self.blocks.len(i),
        };
        let k = mixed.covariance(&x);
        gaussian_llgrad(
            &k,
            x.ncols(),
            Targets::Raw(y.view()),
            2 * ncov,
            opts,
            |p, d| mixed.dk_dx_row(&x, p, d),
            |t| mixed.dk_dparam(&x, t),
        )
    }
}

impl<F: Float> BlockLikelihood<F> for NonstationaryRaw<F> {
    fn n_blocks(&self) -> usize {
        self.blocks.n_blocks()
    }

    fn unary(&self, i: usize, opts: &EvalOptions) -> LlGrad<F> {
        let y = self.y.slice(s![self.blocks.boundaries[i].clone(), ..]);
        stationary_llgrad(&self.kernels[i], &self.blocks.points(i), Targets::Raw(y), opts)
    }

    fn joint(&self, i: usize, j: usize, opts: &EvalOptions) -> LlGrad<F> {
        match self.joint {
            NonstationaryJoint::PrecisionAverage => self.precision_average_joint(i, j, opts),
            NonstationaryJoint::CovarianceAverage => self.covariance_average_joint(i, j, opts),
        }
    }
}

fn block_kernels<F: Float>(
    covs: &[CovSpec<F>],
    n_blocks: usize,
    dim: usize,
) -> Result<Vec<KernelEvaluator<F>>> {
    if covs.len() != n_blocks {
        return Err(BcmError::InvalidValueError(format!(
            "Expected {n_blocks} block covariances, got {}",
            covs.len()
        )));
    }
    if let Some(first) = covs.first() {
        if let Some(other) = covs.iter().find(|c| !first.same_layout(c)) {
            return Err(BcmError::InvalidValueError(format!(
                "Block covariances {first} and {other} do not share the same layout"
            )));
        }
    }
    covs.iter().map(|c| c.evaluator(dim)).collect()
}

/// The block likelihood variants an engine can hold
#[derive(Clone, Debug)]
pub enum BlockModel<F: Float> {
    /// shared covariance, raw observations
    StationaryRaw(StationaryRaw<F>),
    /// shared covariance, kernelized observations
    StationaryKernelized(StationaryKernelized<F>),
    /// per-block covariances, raw observations
    NonstationaryRaw(NonstationaryRaw<F>),
}

impl<F: Float> BlockModel<F> {
    /// Shared covariance model
    pub fn stationary(
        x: Array2<F>,
        observations: Observations<F>,
        boundaries: Vec<Range<usize>>,
        cov: &CovSpec<F>,
    ) -> Result<Self> {
        observations.validate()?;
        match observations {
            Observations::Raw(y) => Ok(BlockModel::StationaryRaw(StationaryRaw::new(
                x, y, boundaries, cov,
            )?)),
            Observations::Kernelized { yy, dy } => Ok(BlockModel::StationaryKernelized(
                StationaryKernelized::new(x, yy, dy, boundaries, cov)?,
            )),
        }
    }

    /// Per-block covariance model, only raw observations are supported
    pub fn nonstationary(
        x: Array2<F>,
        observations: Observations<F>,
        boundaries: Vec<Range<usize>>,
        covs: &[CovSpec<F>],
        joint: NonstationaryJoint,
    ) -> Result<Self> {
        observations.validate()?;
        match observations {
            Observations::Raw(y) => Ok(BlockModel::NonstationaryRaw(NonstationaryRaw::new(
                x, y, boundaries, covs, joint,
            )?)),
            Observations::Kernelized { .. } => Err(BcmError::InvalidValueError(
                "Per-block covariances are not supported with kernelized observations"
                    .to_string(),
            )),
        }
    }

    pub(crate) fn blocks(&self) -> &Blocks<F> {
        match self {
            BlockModel::StationaryRaw(m) => &m.blocks,
            BlockModel::StationaryKernelized(m) => &m.blocks,
            BlockModel::NonstationaryRaw(m) => &m.blocks,
        }
    }

    fn blocks_mut(&mut self) -> &mut Blocks<F> {
        match self {
            BlockModel::StationaryRaw(m) => &mut m.blocks,
            BlockModel::StationaryKernelized(m) => &mut m.blocks,
            BlockModel::NonstationaryRaw(m) => &mut m.blocks,
        }
    }

    /// Whether each block has its own covariance
    pub fn is_nonstationary(&self) -> bool {
        matches!(self, BlockModel::NonstationaryRaw(_))
    }

    /// Whether observations are kernelized
    pub fn is_kernelized(&self) -> bool {
        matches!(self, BlockModel::StationaryKernelized(_))
    }

    /// Number of hyperparameters of one covariance
    pub fn ncov(&self) -> usize {
        self.kernel(0).n_params()
    }

    /// Evaluator used for block `i`
    pub fn kernel(&self, i: usize) -> &KernelEvaluator<F> {
        match self {
            BlockModel::StationaryRaw(m) => &m.kernel,
            BlockModel::StationaryKernelized(m) => &m.kernel,
            BlockModel::NonstationaryRaw(m) => &m.kernels[i],
        }
    }

    /// Covariance specifications: one when stationary, one per block otherwise
    pub fn covariances(&self) -> Vec<CovSpec<F>> {
        match self {
            BlockModel::NonstationaryRaw(m) => m.kernels.iter().map(|k| k.spec().clone()).collect(),
            _ => vec![self.kernel(0).spec().clone()],
        }
    }

    /// Joint policy of per-block covariances
    pub fn joint_policy(&self) -> Option<NonstationaryJoint> {
        match self {
            BlockModel::NonstationaryRaw(m) => Some(m.joint),
            _ => None,
        }
    }

    /// Observations sorted by block
    pub fn observations(&self) -> Observations<F> {
        match self {
            BlockModel::StationaryRaw(m) => Observations::Raw(m.y.to_owned()),
            BlockModel::StationaryKernelized(m) => Observations::Kernelized {
                yy: m.yy.to_owned(),
                dy: m.dy,
            },
            BlockModel::NonstationaryRaw(m) => Observations::Raw(m.y.to_owned()),
        }
    }

    /// Raw observations if any
    pub fn raw_observations(&self) -> Option<&Array2<F>> {
        match self {
            BlockModel::StationaryRaw(m) => Some(&m.y),
            BlockModel::StationaryKernelized(_) => None,
            BlockModel::NonstationaryRaw(m) => Some(&m.y),
        }
    }

    pub(crate) fn set_points(&mut self, x: Array2<F>) -> Result<()> {
        self.blocks_mut().set_points(x)
    }

    /// Install a shared covariance, every block of a nonstationary model gets a copy
    pub(crate) fn set_covariance(&mut self, cov: &CovSpec<F>) -> Result<()> {
        let dim = self.blocks().dim();
        match self {
            BlockModel::StationaryRaw(m) => m.kernel = cov.evaluator(dim)?,
            BlockModel::StationaryKernelized(m) => m.kernel = cov.evaluator(dim)?,
            BlockModel::NonstationaryRaw(m) => {
                let covs = vec![cov.clone(); m.kernels.len()];
                m.kernels = block_kernels(&covs, m.kernels.len(), dim)?;
            }
        }
        Ok(())
    }

    pub(crate) fn set_block_covariances(&mut self, covs: &[CovSpec<F>]) -> Result<()> {
        let dim = self.blocks().dim();
        match self {
            BlockModel::NonstationaryRaw(m) => {
                m.kernels = block_kernels(covs, m.kernels.len(), dim)?;
                Ok(())
            }
            _ => Err(BcmError::InvalidValueError(
                "Per-block covariances require a nonstationary model".to_string(),
            )),
        }
    }

    /// Largest cross covariance between blocks `i` and `j` normalized by the signal variance,
    /// nonstationary blocks use their averaged specification.
    pub(crate) fn max_correlation(&self, i: usize, j: usize) -> Result<F> {
        let blocks = self.blocks();
        let (a, b) = (blocks.points(i), blocks.points(j));
        match self {
            BlockModel::NonstationaryRaw(m) => {
                let avg = CovSpec::mean_of(&[
                    m.kernels[i].spec().clone(),
                    m.kernels[j].spec().clone(),
                ])?
                .evaluator(blocks.dim())?;
                Ok(avg.max_correlation(&a, &b))
            }
            _ => Ok(self.kernel(0).max_correlation(&a, &b)),
        }
    }
}

impl<F: Float> BlockLikelihood<F> for BlockModel<F> {
    fn n_blocks(&self) -> usize {
        self.blocks().n_blocks()
    }

    fn unary(&self, i: usize, opts: &EvalOptions) -> LlGrad<F> {
        match self {
            BlockModel::StationaryRaw(m) => m.unary(i, opts),
            BlockModel::StationaryKernelized(m) => m.unary(i, opts),
            BlockModel::NonstationaryRaw(m) => m.unary(i, opts),
        }
    }

    fn joint(&self, i: usize, j: usize, opts: &EvalOptions) -> LlGrad<F> {
        match self {
            BlockModel::StationaryRaw(m) => m.joint(i, j, opts),
            BlockModel::StationaryKernelized(m) => m.joint(i, j, opts),
            BlockModel::NonstationaryRaw(m) => m.joint(i, j, opts),
        }
    }
}
