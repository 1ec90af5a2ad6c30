//! Sparse graph of interacting block pairs.
//!
//! Only neighbor pairs get a joint likelihood term in the BCM combination. Pairs are built either
//! from the cross covariance magnitude between blocks or from the geometry of block centers,
//! or given explicitly.
use crate::errors::{BcmError, Result};
use crate::utils::pairwise_distances;
use linfa::Float;
use log::debug;
use ndarray::{ArrayBase, Data, Ix2};
use rayon::prelude::*;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Default threshold on normalized cross covariance for two blocks to be neighbors
pub const DEFAULT_NEIGHBOR_THRESHOLD: f64 = 1e-3;
/// Below this threshold no block pair is computed at all
pub const NEIGHBOR_THRESHOLD_EPS: f64 = 1e-8;
/// Distance tolerance of the geometric policy
pub const GEOMETRIC_TOLERANCE: f64 = 1e-6;

/// Undirected graph of blocks as a list of pairs `(i, j)` with `i < j`
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct NeighborGraph {
    pairs: Vec<(usize, usize)>,
    degrees: Vec<usize>,
}

impl NeighborGraph {
    fn with_pairs(n_blocks: usize, pairs: Vec<(usize, usize)>) -> Self {
        let mut degrees = vec![0; n_blocks];
        for &(i, j) in pairs.iter() {
            degrees[i] += 1;
            degrees[j] += 1;
        }
        NeighborGraph { pairs, degrees }
    }

    /// Graph without any edge
    pub fn empty(n_blocks: usize) -> Self {
        Self::with_pairs(n_blocks, vec![])
    }

    /// Graph with every block pair
    pub fn fully_connected(n_blocks: usize) -> Self {
        let pairs = (0..n_blocks)
            .flat_map(|i| (i + 1..n_blocks).map(move |j| (i, j)))
            .collect();
        Self::with_pairs(n_blocks, pairs)
    }

    /// Graph from a list of pairs in any orientation, duplicates are merged.
    pub fn from_pairs(n_blocks: usize, pairs: &[(usize, usize)]) -> Result<Self> {
        let mut normalized = Vec::with_capacity(pairs.len());
        for &(i, j) in pairs {
            if i >= n_blocks || j >= n_blocks {
                return Err(BcmError::InvalidValueError(format!(
                    "Neighbor pair ({i}, {j}) out of range for {n_blocks} blocks"
                )));
            }
            if i == j {
                return Err(BcmError::InvalidValueError(format!(
                    "Block {i} cannot be its own neighbor"
                )));
            }
            normalized.push((i.min(j), i.max(j)));
        }
        normalized.sort_unstable();
        normalized.dedup();
        Ok(Self::with_pairs(n_blocks, normalized))
    }

    /// Connect blocks `i < j` when `max_correlation(i, j) > threshold`.
    ///
    /// `max_correlation` is the largest absolute cross covariance between the points of both blocks
    /// normalized by the signal variance. A threshold below [`NEIGHBOR_THRESHOLD_EPS`] gives
    /// an empty graph without computing anything.
    pub fn from_kernel<F: Float>(
        n_blocks: usize,
        threshold: F,
        max_correlation: impl Fn(usize, usize) -> Result<F> + Sync,
    ) -> Result<Self> {
        if threshold < F::cast(NEIGHBOR_THRESHOLD_EPS) {
            return Ok(Self::empty(n_blocks));
        }
        let now = Instant::now();
        let candidates = Self::fully_connected(n_blocks).pairs;
        let kept = candidates
            .into_par_iter()
            .map(|(i, j)| max_correlation(i, j).map(|c| (c > threshold).then_some((i, j))))
            .collect::<Result<Vec<_>>>()?;
        let graph = Self::with_pairs(n_blocks, kept.into_iter().flatten().collect());
        debug!(
            "{} neighbor pairs among {} blocks (threshold {}), elapsed = {:?}",
            graph.pairs.len(),
            n_blocks,
            threshold,
            now.elapsed().as_millis()
        );
        Ok(graph)
    }

    /// Connect blocks whose centers are nearest neighbors on a grid, and their diagonals if asked.
    ///
    /// The nearest distance is the smallest distance between two distinct centers, the diagonal
    /// distance is the next larger one.
    pub fn from_centers<F: Float>(
        centers: &ArrayBase<impl Data<Elem = F>, Ix2>,
        diagonal: bool,
    ) -> Self {
        let n_blocks = centers.nrows();
        if n_blocks < 2 {
            return Self::empty(n_blocks);
        }
        let tol = F::cast(GEOMETRIC_TOLERANCE);
        let dists = pairwise_distances(centers, centers);
        let off_diagonal =
            move || (0..n_blocks).flat_map(move |i| (i + 1..n_blocks).map(move |j| (i, j)));
        let nearest = off_diagonal()
            .map(|(i, j)| dists[[i, j]])
            .fold(F::infinity(), |a, b| a.min(b));
        let diag = off_diagonal()
            .map(|(i, j)| dists[[i, j]])
            .filter(|&d| d > nearest + tol)
            .fold(F::infinity(), |a, b| a.min(b));
        let diag = if diag.is_finite() { diag } else { nearest };
        let cutoff = if diagonal { diag } else { nearest } + tol;
        let pairs = off_diagonal()
            .filter(|&(i, j)| dists[[i, j]] < cutoff)
            .collect();
        Self::with_pairs(n_blocks, pairs)
    }

    /// Block pairs `(i, j)` with `i < j`
    pub fn pairs(&self) -> &[(usize, usize)] {
        &self.pairs
    }

    /// Number of neighbors of each block
    pub fn degrees(&self) -> &[usize] {
        &self.degrees
    }

    /// Number of blocks
    pub fn n_blocks(&self) -> usize {
        self.degrees.len()
    }

    /// Number of pairs
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether there is no pair
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Whether blocks `i` and `j` are neighbors
    pub fn contains(&self, i: usize, j: usize) -> bool {
        self.pairs.binary_search(&(i.min(j), i.max(j))).is_ok()
    }

    /// Check pairs and degrees are consistent with `n_blocks` blocks
    pub(crate) fn check(&self, n_blocks: usize) -> Result<()> {
        let rebuilt = Self::from_pairs(n_blocks, &self.pairs)?;
        if rebuilt != *self {
            return Err(BcmError::InvalidValueError(
                "Inconsistent neighbor graph".to_string(),
            ));
        }
        Ok(())
    }
}
