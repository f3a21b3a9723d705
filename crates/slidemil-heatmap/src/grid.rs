//! Patch-resolution attention grid.
//!
//! The grid has the shape of the slide's low-resolution mask. Each patch
//! covers a `size × size` square starting at its downsampled offset, and
//! every cell of that square takes the patch's weight. Cells no patch covers
//! stay zero.

use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use slidemil_train::dataset::TileCoord;

use crate::error::{HeatmapError, HeatmapResult};

/// How to treat two footprints that cover the same cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Abort with [`HeatmapError::Overlap`].
    Reject,
    /// Later patches overwrite earlier ones.
    LastWriteWins,
}

/// One patch placed on the grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridPatch {
    /// Footprint origin in grid cells.
    pub origin: TileCoord,
    /// Attention weight.
    pub weight: f32,
}

/// 2-D float grid sized to the slide mask.
#[derive(Debug, Clone, PartialEq)]
pub struct HeatmapGrid {
    values: Array2<f32>,
}

impl HeatmapGrid {
    /// All-zero grid of `rows × cols` cells.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        HeatmapGrid { values: Array2::zeros((rows, cols)) }
    }

    /// `(rows, cols)`.
    pub fn dim(&self) -> (usize, usize) {
        self.values.dim()
    }

    /// Cell values.
    pub fn values(&self) -> ArrayView2<'_, f32> {
        self.values.view()
    }

    /// Consume the grid and return its values.
    pub fn into_values(self) -> Array2<f32> {
        self.values
    }

    /// Fill the `size × size` footprint of every patch with its weight.
    ///
    /// A footprint that extends past the grid or carries a non-finite weight
    /// aborts before any cell is written. Overlaps are handled per `policy`.
    pub fn scatter(&mut self, patches: &[GridPatch], size: usize, policy: OverlapPolicy) -> HeatmapResult<()> {
        let (rows, cols) = self.dim();
        for (index, p) in patches.iter().enumerate() {
            let TileCoord { row, col } = p.origin;
            if size == 0 || row + size > rows || col + size > cols {
                return Err(HeatmapError::OutOfBounds { index, row, col, size, rows, cols });
            }
            if !p.weight.is_finite() {
                return Err(HeatmapError::NonFiniteWeight { index, value: p.weight });
            }
        }

        if policy == OverlapPolicy::Reject {
            let mut covered = Array2::<bool>::from_elem((rows, cols), false);
            for (index, p) in patches.iter().enumerate() {
                let TileCoord { row, col } = p.origin;
                let mut block = covered.slice_mut(s![row..row + size, col..col + size]);
                if block.iter().any(|&c| c) {
                    return Err(HeatmapError::Overlap { index, row, col });
                }
                block.fill(true);
            }
        }

        for p in patches {
            let TileCoord { row, col } = p.origin;
            self.values.slice_mut(s![row..row + size, col..col + size]).fill(p.weight);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch(row: usize, col: usize, weight: f32) -> GridPatch {
        GridPatch { origin: TileCoord { row, col }, weight }
    }

    #[test]
    fn single_patch_fills_its_footprint_only() {
        let mut grid = HeatmapGrid::zeros(20, 20);
        grid.scatter(&[patch(0, 0, 0.8)], 7, OverlapPolicy::Reject).unwrap();
        let v = grid.values();
        for r in 0..20 {
            for c in 0..20 {
                let expected = if r < 7 && c < 7 { 0.8 } else { 0.0 };
                assert_eq!(v[[r, c]], expected, "cell ({r}, {c})");
            }
        }
    }

    #[test]
    fn footprint_touching_the_edge_fits() {
        let mut grid = HeatmapGrid::zeros(7, 14);
        grid.scatter(&[patch(0, 7, 0.5)], 7, OverlapPolicy::Reject).unwrap();
        assert_eq!(grid.values()[[6, 13]], 0.5);
    }

    #[test]
    fn out_of_bounds_footprint_is_an_error_and_writes_nothing() {
        let mut grid = HeatmapGrid::zeros(10, 10);
        let err = grid
            .scatter(&[patch(0, 0, 0.3), patch(5, 5, 0.9)], 7, OverlapPolicy::Reject)
            .unwrap_err();
        assert!(matches!(err, HeatmapError::OutOfBounds { index: 1, .. }));
        assert!(grid.values().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn overlap_is_rejected_by_default_policy() {
        let mut grid = HeatmapGrid::zeros(20, 20);
        let err = grid
            .scatter(&[patch(0, 0, 0.1), patch(3, 3, 0.2)], 7, OverlapPolicy::Reject)
            .unwrap_err();
        assert!(matches!(err, HeatmapError::Overlap { index: 1, row: 3, col: 3 }));
    }

    #[test]
    fn last_write_wins_when_overlap_is_allowed() {
        let mut grid = HeatmapGrid::zeros(20, 20);
        grid.scatter(&[patch(0, 0, 0.1), patch(3, 3, 0.2)], 7, OverlapPolicy::LastWriteWins)
            .unwrap();
        assert_eq!(grid.values()[[4, 4]], 0.2);
        assert_eq!(grid.values()[[0, 0]], 0.1);
    }

    #[test]
    fn nan_weight_is_rejected() {
        let mut grid = HeatmapGrid::zeros(8, 8);
        assert!(matches!(
            grid.scatter(&[patch(0, 0, f32::NAN)], 2, OverlapPolicy::Reject),
            Err(HeatmapError::NonFiniteWeight { index: 0, .. })
        ));
    }
}
