//! Spatial blocking of points by nearest block center.
use crate::errors::{BcmError, Result};
use crate::likelihood::Observations;
use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix1, Ix2};
use ndarray_stats::QuantileExt;
use std::ops::Range;

/// Points reordered by block
#[derive(Clone, Debug)]
pub struct SortedBlocks<F: Float> {
    /// points sorted by block
    pub x: Array2<F>,
    /// observations sorted consistently with points if any
    pub observations: Option<Observations<F>>,
    /// `perm[k]` is the input index of the `k`-th sorted point
    pub perm: Vec<usize>,
    /// contiguous range of each block in the sorted order, in center order
    pub boundaries: Vec<Range<usize>>,
}

impl<F: Float> SortedBlocks<F> {
    /// `inv[i]` is the sorted position of the `i`-th input point
    pub fn inverse_perm(&self) -> Vec<usize> {
        let mut inv = vec![0; self.perm.len()];
        for (k, &i) in self.perm.iter().enumerate() {
            inv[i] = k;
        }
        inv
    }
}

/// Assign points to the nearest of a fixed set of block centers
#[derive(Clone, Debug)]
pub struct Blocker<F: Float> {
    centers: Array2<F>,
}

impl<F: Float> Blocker<F> {
    /// Constructor given (n_blocks, dim) centers
    pub fn new(centers: Array2<F>) -> Result<Self> {
        if centers.nrows() == 0 {
            return Err(BcmError::InvalidValueError(
                "Blocker requires at least one center".to_string(),
            ));
        }
        Ok(Blocker { centers })
    }

    /// Block centers
    pub fn centers(&self) -> &Array2<F> {
        &self.centers
    }

    /// Number of blocks
    pub fn n_blocks(&self) -> usize {
        self.centers.nrows()
    }

    /// Index of the nearest center, ties resolved to the lowest index
    pub fn block_of(&self, point: &ArrayBase<impl Data<Elem = F>, Ix1>) -> usize {
        let d2 = self
            .centers
            .rows()
            .into_iter()
            .map(|c| (&c - point).mapv(|v| v * v).sum())
            .collect::<Array1<F>>();
        d2.argmin().unwrap_or(0)
    }

    /// Block index of each row of `x`
    pub fn assign(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array1<usize>> {
        if x.ncols() != self.centers.ncols() {
            return Err(BcmError::InvalidValueError(format!(
                "Points of dimension {} cannot be blocked with centers of dimension {}",
                x.ncols(),
                self.centers.ncols()
            )));
        }
        Ok(x.rows().into_iter().map(|p| self.block_of(&p)).collect())
    }

    /// Reorder points (and observations) so that each block is contiguous.
    ///
    /// Within a block, points keep their input order. Empty blocks get empty ranges.
    pub fn sort_by_block(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        observations: Option<&Observations<F>>,
    ) -> Result<SortedBlocks<F>> {
        if let Some(obs) = observations {
            if obs.n_points() != x.nrows() {
                return Err(BcmError::InvalidValueError(format!(
                    "{} points but {} observations",
                    x.nrows(),
                    obs.n_points()
                )));
            }
        }
        let labels = self.assign(x)?;
        let mut perm: Vec<usize> = (0..x.nrows()).collect();
        perm.sort_by_key(|&i| labels[i]);

        let mut counts = vec![0; self.n_blocks()];
        labels.iter().for_each(|&b| counts[b] += 1);
        let mut start = 0;
        let boundaries = counts
            .iter()
            .map(|&c| {
                let r = start..start + c;
                start += c;
                r
            })
            .collect();

        Ok(SortedBlocks {
            x: x.select(Axis(0), &perm),
            observations: observations.map(|obs| obs.permuted(&perm)),
            perm,
            boundaries,
        })
    }
}
