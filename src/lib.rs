//! This library implements a block-structured approximation of the
//! [Gaussian Process](https://en.wikipedia.org/wiki/Gaussian_process) log-likelihood
//! based on the Bayesian Committee Machine (BCM).
//!
//! Exact GP likelihood evaluation costs O(N^3) in processing time and O(N^2) in memory where N is the
//! number of points. Points are here partitioned into contiguous blocks and the likelihood is approximated
//! from gaussian likelihoods of single blocks and of neighbor block pairs, reducing the cost to
//! O(P.B^3) where B is the block size and P the number of neighbor pairs.
//! Gradients w.r.t. point coordinates and covariance hyperparameters are provided so that the
//! approximate likelihood can be driven by an outer optimizer.
//!
//! The likelihood engine is implemented by [MultiSharedBcm] parameterized by [BcmParams],
//! points can be partitioned with a [Blocker] and predictions are made with a [BcmPredictor].
#![warn(missing_docs)]
mod algorithm;
mod blocker;
pub mod covariance;
mod errors;
mod likelihood;
mod neighbors;
mod parameters;
mod predictor;
mod utils;

pub use algorithm::*;
pub use blocker::*;
pub use covariance::{CovSpec, DistanceFunction, KernelEvaluator, WeightFunction};
pub use errors::*;
pub use likelihood::*;
pub use neighbors::*;
pub use parameters::*;
pub use predictor::*;
