use crate::covariance::CovSpec;
use crate::errors::{BcmError, Result};
use crate::likelihood::NonstationaryJoint;
use crate::neighbors::DEFAULT_NEIGHBOR_THRESHOLD;
use linfa::{Float, ParamGuard};
use ndarray::Array2;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Policy used to build the neighbor graph of blocks
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(serialize = "F: Serialize", deserialize = "F: Deserialize<'de>"))
)]
pub enum NeighborPolicy<F: Float> {
    /// Blocks are neighbors when their largest normalized cross covariance exceeds `threshold`
    Kernel {
        /// correlation threshold
        threshold: F,
    },
    /// Blocks are neighbors when their centers are nearest on a grid (plus diagonals)
    Geometric {
        /// one center per block
        centers: Array2<F>,
        /// connect diagonal neighbors too
        diagonal: bool,
    },
    /// Given list of block pairs
    Explicit(Vec<(usize, usize)>),
}

impl<F: Float> Default for NeighborPolicy<F> {
    fn default() -> Self {
        NeighborPolicy::Kernel {
            threshold: F::cast(DEFAULT_NEIGHBOR_THRESHOLD),
        }
    }
}

/// A set of validated BCM parameters.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(serialize = "F: Serialize", deserialize = "F: Deserialize<'de>"))
)]
pub struct BcmValidParams<F: Float> {
    /// Covariance shared by all blocks, initial covariance of each block when nonstationary
    pub(crate) cov: CovSpec<F>,
    /// Initial per-block covariances
    pub(crate) block_covs: Option<Vec<CovSpec<F>>>,
    /// Neighbor graph policy
    pub(crate) neighbors: NeighborPolicy<F>,
    /// Per-block covariances joint policy, stationary when `None`
    pub(crate) nonstationary: Option<NonstationaryJoint>,
}

impl<F: Float> BcmValidParams<F> {
    /// Get covariance specification
    pub fn cov(&self) -> &CovSpec<F> {
        &self.cov
    }

    /// Get initial per-block covariances if any
    pub fn block_covs(&self) -> Option<&Vec<CovSpec<F>>> {
        self.block_covs.as_ref()
    }

    /// Get neighbor graph policy
    pub fn neighbors(&self) -> &NeighborPolicy<F> {
        &self.neighbors
    }

    /// Get nonstationary joint policy, `None` when stationary
    pub fn nonstationary(&self) -> Option<NonstationaryJoint> {
        self.nonstationary
    }
}

#[derive(Clone, Debug)]
/// The set of parameters that can be specified to build a
/// [BCM likelihood engine](crate::MultiSharedBcm).
pub struct BcmParams<F: Float>(BcmValidParams<F>);

impl<F: Float> BcmParams<F> {
    /// A constructor for BCM parameters given the shared covariance
    pub fn new(cov: CovSpec<F>) -> BcmParams<F> {
        Self(BcmValidParams {
            cov,
            block_covs: None,
            neighbors: NeighborPolicy::default(),
            nonstationary: None,
        })
    }

    /// A constructor for BCM parameters from validated parameters
    pub fn new_from_valid(params: &BcmValidParams<F>) -> Self {
        Self(params.clone())
    }

    /// Set covariance specification
    pub fn cov(mut self, cov: CovSpec<F>) -> Self {
        self.0.cov = cov;
        self
    }

    /// Use the kernel magnitude neighbor policy with the given threshold.
    ///
    /// A threshold close to zero disables joint terms: blocks are independent.
    pub fn neighbor_threshold(mut self, threshold: F) -> Self {
        self.0.neighbors = NeighborPolicy::Kernel { threshold };
        self
    }

    /// Use the geometric neighbor policy given one center per block
    pub fn geometric_neighbors(mut self, centers: Array2<F>, diagonal: bool) -> Self {
        self.0.neighbors = NeighborPolicy::Geometric { centers, diagonal };
        self
    }

    /// Use the given block pairs as neighbors
    pub fn explicit_neighbors(mut self, pairs: Vec<(usize, usize)>) -> Self {
        self.0.neighbors = NeighborPolicy::Explicit(pairs);
        self
    }

    /// Give each block its own covariance, initialized with the shared one
    pub fn nonstationary(mut self, joint: NonstationaryJoint) -> Self {
        self.0.nonstationary = Some(joint);
        self
    }

    /// Set initial per-block covariances, switches to nonstationary mode if needed
    pub fn block_covariances(mut self, covs: Vec<CovSpec<F>>) -> Self {
        if self.0.nonstationary.is_none() {
            self.0.nonstationary = Some(NonstationaryJoint::default());
        }
        self.0.block_covs = Some(covs);
        self
    }
}

impl<F: Float> From<BcmValidParams<F>> for BcmParams<F> {
    fn from(valid: BcmValidParams<F>) -> Self {
        BcmParams(valid)
    }
}

impl<F: Float> ParamGuard for BcmParams<F> {
    type Checked = BcmValidParams<F>;
    type Error = BcmError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        if let NeighborPolicy::Kernel { threshold } = self.0.neighbors {
            if !(threshold.is_finite() && threshold >= F::zero()) {
                return Err(BcmError::InvalidValueError(format!(
                    "Neighbor threshold should be non negative, got {threshold}"
                )));
            }
        }
        if let NeighborPolicy::Geometric { centers, .. } = &self.0.neighbors {
            if centers.nrows() == 0 {
                return Err(BcmError::InvalidValueError(
                    "Geometric neighbor policy requires block centers".to_string(),
                ));
            }
        }
        if let Some(covs) = &self.0.block_covs {
            if let Some(other) = covs.iter().find(|c| !self.0.cov.same_layout(c)) {
                return Err(BcmError::InvalidValueError(format!(
                    "Block covariance {other} does not share the layout of {}",
                    self.0.cov
                )));
            }
        }
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance::WeightFunction;
    use ndarray::array;

    #[test]
    fn test_default_params() {
        let params = BcmParams::new(CovSpec::squared_exponential(0.3, 1., 0.01))
            .check()
            .unwrap();
        assert_eq!(
            params.neighbors(),
            &NeighborPolicy::Kernel { threshold: 1e-3 }
        );
        assert!(params.nonstationary().is_none());
    }

    #[test]
    fn test_invalid_params() {
        let cov = CovSpec::squared_exponential(0.3, 1., 0.01);
        assert!(BcmParams::new(cov.clone())
            .neighbor_threshold(-1.)
            .check()
            .is_err());
        assert!(BcmParams::new(cov.clone())
            .geometric_neighbors(Array2::zeros((0, 2)), false)
            .check()
            .is_err());
        let other = CovSpec::new(WeightFunction::Matern32, array![0.3], 1., 0.01);
        assert!(BcmParams::new(cov).block_covariances(vec![other]).check().is_err());
    }

    #[test]
    fn test_block_covariances_imply_nonstationary() {
        let cov = CovSpec::squared_exponential(0.3, 1., 0.01);
        let params = BcmParams::new(cov.clone())
            .block_covariances(vec![cov.clone(), cov])
            .check()
            .unwrap();
        assert_eq!(
            params.nonstationary(),
            Some(NonstationaryJoint::PrecisionAverage)
        );
        assert_eq!(params.block_covs().unwrap().len(), 2);
    }
}
