use crate::blocker::Blocker;
use crate::covariance::CovSpec;
use crate::errors::{BcmError, Result};
use crate::likelihood::{
    BlockLikelihood, BlockModel, EvalOptions, LlGrad, NonstationaryJoint, Observations,
    DEGENERATE_LIKELIHOOD,
};
use crate::neighbors::NeighborGraph;
use crate::parameters::{BcmParams, BcmValidParams, NeighborPolicy};
use crate::predictor::BcmPredictor;
use linfa::{Float, ParamGuard};
use log::{debug, warn};
use ndarray::{s, Array2, ArrayBase, Data, Ix2};
use rayon::prelude::*;
use std::ops::Range;
use std::time::Instant;

#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
#[cfg(feature = "persistent")]
use std::fs;
#[cfg(feature = "persistent")]
use std::io::Write;

/// Result of a BCM log-likelihood evaluation
#[derive(Clone, Debug, PartialEq)]
pub struct Evaluation<F: Float> {
    /// approximate log-likelihood
    pub ll: F,
    /// gradient w.r.t. point coordinates (n, dim)
    pub grad_x: Option<Array2<F>>,
    /// gradient w.r.t. covariance hyperparameters, one row when stationary,
    /// one row per block otherwise
    pub grad_cov: Option<Array2<F>>,
}

/// Everything needed to rebuild an engine. Kernel evaluators are not part of it,
/// they are rebuilt from the covariance specifications.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(serialize = "F: Serialize", deserialize = "F: Deserialize<'de>"))
)]
pub struct BcmState<F: Float> {
    /// points sorted by block
    pub x: Array2<F>,
    /// observations sorted by block
    pub observations: Observations<F>,
    /// block ranges
    pub boundaries: Vec<Range<usize>>,
    /// one covariance when stationary, one per block otherwise
    pub covariances: Vec<CovSpec<F>>,
    /// joint policy of per-block covariances, `None` when stationary
    pub nonstationary: Option<NonstationaryJoint>,
    /// policy used by [`MultiSharedBcm::recompute_neighbors`]
    pub neighbor_policy: NeighborPolicy<F>,
    /// current neighbor graph
    pub neighbors: NeighborGraph,
}

/// Block-structured BCM approximation of a gaussian process log-likelihood.
///
/// Points are partitioned into contiguous blocks. The log-likelihood is approximated by
///
/// `sum_{(i, j) neighbors} ll(i, j) - sum_i (degree(i) - 1) ll(i)`
///
/// where `ll(i)` is the gaussian log-likelihood of the observations of block `i` and
/// `ll(i, j)` the one of blocks `i` and `j` taken together.
/// Gradients w.r.t. point coordinates and covariance hyperparameters are combined the same way.
///
/// ```no_run
/// use egobox_bcm::{CovSpec, EvalOptions, MultiSharedBcm, Observations};
/// use ndarray::array;
///
/// let x = array![[0.1, 0.1], [0.2, 0.3], [0.8, 0.7], [0.9, 0.9]];
/// let y = array![[0.5], [0.4], [-0.2], [-0.1]];
/// let bcm = MultiSharedBcm::params(CovSpec::squared_exponential(0.3, 1., 0.01))
///     .neighbor_threshold(1e-3)
///     .build(x, Observations::Raw(y), vec![0..2, 2..4])
///     .expect("BCM engine");
/// let eval = bcm.evaluate(&EvalOptions::default());
/// println!("ll = {}, grad_x = {:?}", eval.ll, eval.grad_x);
/// ```
#[derive(Clone, Debug)]
pub struct MultiSharedBcm<F: Float> {
    model: BlockModel<F>,
    neighbors: NeighborGraph,
    policy: NeighborPolicy<F>,
}

impl<F: Float> MultiSharedBcm<F> {
    /// BCM parameters given the covariance shared by all blocks
    pub fn params(cov: CovSpec<F>) -> BcmParams<F> {
        BcmParams::new(cov)
    }

    /// Number of blocks
    pub fn n_blocks(&self) -> usize {
        self.model.n_blocks()
    }

    /// Number of points
    pub fn n_points(&self) -> usize {
        self.model.blocks().x.nrows()
    }

    /// Point dimension
    pub fn dim(&self) -> usize {
        self.model.blocks().dim()
    }

    /// Points sorted by block
    pub fn points(&self) -> &Array2<F> {
        &self.model.blocks().x
    }

    /// Block ranges
    pub fn boundaries(&self) -> &[Range<usize>] {
        &self.model.blocks().boundaries
    }

    /// Current neighbor graph
    pub fn neighbors(&self) -> &NeighborGraph {
        &self.neighbors
    }

    /// Underlying block likelihood model
    pub fn model(&self) -> &BlockModel<F> {
        &self.model
    }

    /// Covariance specifications: one when stationary, one per block otherwise
    pub fn covariances(&self) -> Vec<CovSpec<F>> {
        self.model.covariances()
    }

    /// Whether each block has its own covariance
    pub fn is_nonstationary(&self) -> bool {
        self.model.is_nonstationary()
    }

    /// Whether observations are kernelized
    pub fn is_kernelized(&self) -> bool {
        self.model.is_kernelized()
    }

    /// Replace all point coordinates, block membership is unchanged.
    ///
    /// The neighbor graph is not refreshed, see [`MultiSharedBcm::recompute_neighbors`].
    pub fn update_points(&mut self, x: Array2<F>) -> Result<()> {
        self.model.set_points(x)
    }

    /// Rebuild the neighbor graph from current points and covariances
    pub fn recompute_neighbors(&mut self) -> Result<()> {
        self.neighbors = compute_neighbors(&self.model, &self.policy)?;
        Ok(())
    }

    /// Install a new shared covariance (every block gets it when nonstationary)
    pub fn update_covariance(&mut self, cov: CovSpec<F>) -> Result<()> {
        self.model.set_covariance(&cov)
    }

    /// Install new per-block covariances, nonstationary engines only
    pub fn update_block_covariances(&mut self, covs: Vec<CovSpec<F>>) -> Result<()> {
        self.model.set_block_covariances(&covs)
    }

    /// Install covariances from flat hyperparameters laid out as `grad_cov` rows:
    /// one row when stationary, one row per block otherwise.
    pub fn update_covariance_params(
        &mut self,
        params: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<()> {
        let covs = self.covariances();
        if params.nrows() != covs.len() {
            return Err(BcmError::InvalidValueError(format!(
                "Expected {} rows of covariance parameters, got {}",
                covs.len(),
                params.nrows()
            )));
        }
        let updated = covs
            .iter()
            .zip(params.rows())
            .map(|(cov, p)| cov.with_params(&p))
            .collect::<Result<Vec<_>>>()?;
        if self.is_nonstationary() {
            self.model.set_block_covariances(&updated)
        } else {
            self.model.set_covariance(&updated[0])
        }
    }

    /// Log-likelihood of block `i` alone
    pub fn unary(&self, i: usize, opts: &EvalOptions) -> LlGrad<F> {
        self.model.unary(i, opts)
    }

    /// Log-likelihood of blocks `i` and `j` together
    pub fn joint(&self, i: usize, j: usize, opts: &EvalOptions) -> LlGrad<F> {
        self.model.joint(i, j, opts)
    }

    /// BCM log-likelihood and requested gradients
    pub fn evaluate(&self, opts: &EvalOptions) -> Evaluation<F> {
        let now = Instant::now();
        let n_blocks = self.n_blocks();
        let all_pairs;
        let graph = if opts.local {
            &self.neighbors
        } else {
            all_pairs = NeighborGraph::fully_connected(n_blocks);
            &all_pairs
        };
        let degrees = graph.degrees();
        // a block with exactly one neighbor has a zero unary weight
        let unary_ids = (0..n_blocks)
            .filter(|&i| degrees[i] != 1)
            .collect::<Vec<_>>();

        let (unaries, joints): (Vec<LlGrad<F>>, Vec<LlGrad<F>>) = if opts.parallel {
            rayon::join(
                || {
                    unary_ids
                        .par_iter()
                        .map(|&i| self.model.unary(i, opts))
                        .collect()
                },
                || {
                    graph
                        .pairs()
                        .par_iter()
                        .map(|&(i, j)| self.model.joint(i, j, opts))
                        .collect()
                },
            )
        } else {
            (
                unary_ids
                    .iter()
                    .map(|&i| self.model.unary(i, opts))
                    .collect(),
                graph
                    .pairs()
                    .iter()
                    .map(|&(i, j)| self.model.joint(i, j, opts))
                    .collect(),
            )
        };

        let n_unaries = unary_ids.len();
        let unary_terms = unary_ids.into_iter().zip(unaries).collect();
        let joint_terms = graph.pairs().iter().copied().zip(joints).collect();
        let eval = self.combine(degrees, unary_terms, joint_terms, opts);
        debug!(
            "BCM evaluation: {} unary and {} joint terms, ll = {}, elapsed = {:?}",
            n_unaries,
            graph.len(),
            eval.ll,
            now.elapsed().as_millis()
        );
        eval
    }

    /// BCM combination of unary terms weighted by `1 - degree` and joint terms.
    ///
    /// Joint gradients hold the points of `i` followed by the points of `j` for pair `(i, j)`.
    fn combine(
        &self,
        degrees: &[usize],
        unary_terms: Vec<(usize, LlGrad<F>)>,
        joint_terms: Vec<((usize, usize), LlGrad<F>)>,
        opts: &EvalOptions,
    ) -> Evaluation<F> {
        let nonstationary = self.is_nonstationary();
        let ncov = self.model.ncov();
        let boundaries = self.boundaries();
        let cov_row = |i: usize| if nonstationary { i } else { 0 };
        let mut degenerate = false;
        let mut ll = F::zero();
        let mut grad_x = opts
            .grad_x
            .then(|| Array2::zeros((self.n_points(), self.dim())));
        let mut grad_cov = opts.grad_cov.then(|| {
            Array2::zeros((if nonstationary { self.n_blocks() } else { 1 }, ncov))
        });

        for (i, res) in unary_terms {
            degenerate |= res.is_degenerate();
            let w = F::one() - F::cast(degrees[i]);
            ll += w * res.ll;
            if let (Some(gx), Some(g)) = (grad_x.as_mut(), res.grad_x) {
                gx.slice_mut(s![boundaries[i].clone(), ..]).scaled_add(w, &g);
            }
            if let (Some(gc), Some(g)) = (grad_cov.as_mut(), res.grad_cov) {
                gc.row_mut(cov_row(i)).scaled_add(w, &g);
            }
        }
        for ((i, j), res) in joint_terms {
            degenerate |= res.is_degenerate();
            ll += res.ll;
            let ni = boundaries[i].len();
            if let (Some(gx), Some(g)) = (grad_x.as_mut(), res.grad_x) {
                gx.slice_mut(s![boundaries[i].clone(), ..])
                    .scaled_add(F::one(), &g.slice(s![..ni, ..]));
                gx.slice_mut(s![boundaries[j].clone(), ..])
                    .scaled_add(F::one(), &g.slice(s![ni.., ..]));
            }
            if let (Some(gc), Some(g)) = (grad_cov.as_mut(), res.grad_cov) {
                if nonstationary {
                    gc.row_mut(i).scaled_add(F::one(), &g.slice(s![..ncov]));
                    gc.row_mut(j).scaled_add(F::one(), &g.slice(s![ncov..]));
                } else {
                    gc.row_mut(0).scaled_add(F::one(), &g);
                }
            }
        }
        if degenerate {
            warn!("Degenerate block covariance, log-likelihood set to {DEGENERATE_LIKELIHOOD}");
            ll = F::cast(DEGENERATE_LIKELIHOOD);
        }

        Evaluation {
            ll,
            grad_x,
            grad_cov,
        }
    }

    /// Train a predictor from the current blocks.
    ///
    /// `test_cov` replaces the prior covariance at query points, by default it is the shared
    /// covariance or the mean of block covariances. Kernelized engines cannot predict,
    /// see [`MultiSharedBcm::make_predictor_with`].
    pub fn make_predictor(&self, test_cov: Option<CovSpec<F>>) -> Result<BcmPredictor<F>> {
        let y = self.model.raw_observations().ok_or_else(|| {
            BcmError::InvalidValueError(
                "Prediction requires raw observations, not kernelized ones".to_string(),
            )
        })?;
        self.train_predictor(y, test_cov)
    }

    /// Train a predictor from the current blocks with observations `y` instead of the engine
    /// ones. Rows of `y` follow the engine point order (sorted by block).
    pub fn make_predictor_with(
        &self,
        y: &ArrayBase<impl Data<Elem = F>, Ix2>,
        test_cov: Option<CovSpec<F>>,
    ) -> Result<BcmPredictor<F>> {
        if y.nrows() != self.n_points() || y.ncols() == 0 {
            return Err(BcmError::InvalidValueError(format!(
                "Observations should have {} rows and at least one column, got {:?}",
                self.n_points(),
                y.dim()
            )));
        }
        self.train_predictor(&y.to_owned(), test_cov)
    }

    fn train_predictor(
        &self,
        y: &Array2<F>,
        test_cov: Option<CovSpec<F>>,
    ) -> Result<BcmPredictor<F>> {
        let prior = match test_cov {
            Some(cov) => cov,
            None => CovSpec::mean_of(&self.covariances())?,
        };
        BcmPredictor::train(
            self.points(),
            y,
            self.boundaries(),
            |i| self.model.kernel(i).clone(),
            prior.evaluator(self.dim())?,
        )
    }

    /// Snapshot of the engine state
    pub fn state(&self) -> BcmState<F> {
        BcmState {
            x: self.points().to_owned(),
            observations: self.model.observations(),
            boundaries: self.boundaries().to_vec(),
            covariances: self.covariances(),
            nonstationary: self.model.joint_policy(),
            neighbor_policy: self.policy.clone(),
            neighbors: self.neighbors.clone(),
        }
    }

    /// Rebuild an engine from a state snapshot, the neighbor graph is restored as is.
    pub fn from_state(state: BcmState<F>) -> Result<Self> {
        let model = match state.nonstationary {
            None => {
                let cov = match state.covariances.as_slice() {
                    [cov] => cov,
                    covs => {
                        return Err(BcmError::LoadError(format!(
                            "Stationary state expects one covariance, got {}",
                            covs.len()
                        )))
                    }
                };
                BlockModel::stationary(state.x, state.observations, state.boundaries, cov)?
            }
            Some(joint) => BlockModel::nonstationary(
                state.x,
                state.observations,
                state.boundaries,
                &state.covariances,
                joint,
            )?,
        };
        state.neighbors.check(model.n_blocks())?;
        Ok(MultiSharedBcm {
            model,
            neighbors: state.neighbors,
            policy: state.neighbor_policy,
        })
    }

    /// Save the engine state in a json file
    #[cfg(feature = "persistent")]
    pub fn save(&self, path: &str) -> Result<()>
    where
        F: Serialize,
    {
        let bytes = serde_json::to_vec(&self.state())?;
        let mut file = fs::File::create(path).map_err(BcmError::SaveIoError)?;
        file.write_all(&bytes).map_err(BcmError::SaveIoError)?;
        Ok(())
    }

    /// Load an engine from a json file written by [`MultiSharedBcm::save`]
    #[cfg(feature = "persistent")]
    pub fn load(path: &str) -> Result<Self>
    where
        F: for<'de> Deserialize<'de>,
    {
        let data = fs::read(path)?;
        let state: BcmState<F> =
            serde_json::from_slice(&data).map_err(|err| BcmError::LoadError(err.to_string()))?;
        Self::from_state(state)
    }
}

fn compute_neighbors<F: Float>(
    model: &BlockModel<F>,
    policy: &NeighborPolicy<F>,
) -> Result<NeighborGraph> {
    let n_blocks = model.n_blocks();
    match policy {
        NeighborPolicy::Kernel { threshold } => {
            NeighborGraph::from_kernel(n_blocks, *threshold, |i, j| model.max_correlation(i, j))
        }
        NeighborPolicy::Geometric { centers, diagonal } => {
            if centers.nrows() != n_blocks {
                return Err(BcmError::InvalidValueError(format!(
                    "Geometric neighbor policy expects {n_blocks} centers, got {}",
                    centers.nrows()
                )));
            }
            Ok(NeighborGraph::from_centers(centers, *diagonal))
        }
        NeighborPolicy::Explicit(pairs) => NeighborGraph::from_pairs(n_blocks, pairs),
    }
}

impl<F: Float> BcmValidParams<F> {
    /// Build the engine from points sorted by block, their observations and block ranges
    pub fn build(
        &self,
        x: Array2<F>,
        observations: Observations<F>,
        boundaries: Vec<Range<usize>>,
    ) -> Result<MultiSharedBcm<F>> {
        let n_blocks = boundaries.len();
        let model = match self.nonstationary {
            None => BlockModel::stationary(x, observations, boundaries, &self.cov)?,
            Some(joint) => {
                let covs = self
                    .block_covs
                    .clone()
                    .unwrap_or_else(|| vec![self.cov.clone(); n_blocks]);
                BlockModel::nonstationary(x, observations, boundaries, &covs, joint)?
            }
        };
        let neighbors = compute_neighbors(&model, &self.neighbors)?;
        debug!(
            "BCM engine with {} blocks, {} neighbor pairs",
            n_blocks,
            neighbors.len()
        );
        Ok(MultiSharedBcm {
            model,
            neighbors,
            policy: self.neighbors.clone(),
        })
    }

    /// Sort points by nearest block center then build the engine.
    ///
    /// Returns the engine and the permutation applied to input points
    /// (`perm[k]` is the input index of the `k`-th engine point).
    pub fn build_blocked(
        &self,
        blocker: &Blocker<F>,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        observations: &Observations<F>,
    ) -> Result<(MultiSharedBcm<F>, Vec<usize>)> {
        let sorted = blocker.sort_by_block(x, Some(observations))?;
        let observations = sorted.observations.ok_or_else(|| {
            BcmError::InvalidValueError("Missing sorted observations".to_string())
        })?;
        let bcm = self.build(sorted.x, observations, sorted.boundaries)?;
        Ok((bcm, sorted.perm))
    }
}

impl<F: Float> BcmParams<F> {
    /// Check parameters then build the engine, see [`BcmValidParams::build`]
    pub fn build(
        &self,
        x: Array2<F>,
        observations: Observations<F>,
        boundaries: Vec<Range<usize>>,
    ) -> Result<MultiSharedBcm<F>> {
        self.check_ref()?.build(x, observations, boundaries)
    }

    /// Check parameters then sort points by block and build the engine,
    /// see [`BcmValidParams::build_blocked`]
    pub fn build_blocked(
        &self,
        blocker: &Blocker<F>,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        observations: &Observations<F>,
    ) -> Result<(MultiSharedBcm<F>, Vec<usize>)> {
        self.check_ref()?.build_blocked(blocker, x, observations)
    }
}
