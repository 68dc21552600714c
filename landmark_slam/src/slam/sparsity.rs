//! Jacobian sparsity pattern
//!
//! One row per constraint (in residual order), one column per state entry.
//! A row marks the entries its constraint reads:
//!
//! - odometry `i`: the 6 entries of poses `i` and `i + 1`
//! - landmark: the 3 entries of the observing pose and the 2 of the landmark
//! - GPS: the x/y entries of the referenced pose
//! - GIS: the 2 entries of the referenced landmark
//!
//! The pattern depends only on the constraint structure, never on the state,
//! so it is rebuilt cheaply whenever the graph grows. For a chain of `n`
//! poses the Jacobian has `O(n)` non-zeros instead of `O(n²)`.

use crate::slam::constraints::ConstraintGraph;
use crate::slam::state::state_len;
use nalgebra::DMatrix;
use sprs::{CsMat, TriMat};
use std::fmt;
use std::ops::Range;

/// Structural non-zeros of the Jacobian, stored row-wise
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparsityPattern {
    rows: Vec<Vec<usize>>,
    cols: usize,
}

impl SparsityPattern {
    /// Build the constraint-level pattern.
    pub fn from_constraints(
        constraints: &ConstraintGraph,
        pose_count: usize,
        landmark_count: usize,
    ) -> Self {
        let rows = constraints
            .iter()
            .map(|c| {
                let mut cols = c.state_columns(pose_count);
                cols.sort_unstable();
                cols
            })
            .collect();

        Self {
            rows,
            cols: state_len(pose_count, landmark_count),
        }
    }

    pub fn rows(&self) -> usize {
        self.rows.len()
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Sorted column indices marked in `row`
    pub fn row(&self, row: usize) -> &[usize] {
        &self.rows[row]
    }

    pub fn contains(&self, row: usize, col: usize) -> bool {
        self.rows
            .get(row)
            .is_some_and(|cols| cols.binary_search(&col).is_ok())
    }

    pub fn nnz(&self) -> usize {
        self.rows.iter().map(Vec::len).sum()
    }

    /// Repeat row `k` `dims[k]` times, giving the pattern of the stacked
    /// residual blocks.
    pub fn expand(&self, dims: &[usize]) -> SparsityPattern {
        debug_assert_eq!(dims.len(), self.rows.len());
        let rows = self
            .rows
            .iter()
            .zip(dims)
            .flat_map(|(cols, &dim)| std::iter::repeat(cols.clone()).take(dim))
            .collect();

        Self {
            rows,
            cols: self.cols,
        }
    }

    /// For each column, the rows that mark it
    pub fn column_rows(&self) -> Vec<Vec<usize>> {
        let mut columns = vec![Vec::new(); self.cols];
        for (row, cols) in self.rows.iter().enumerate() {
            for &col in cols {
                columns[col].push(row);
            }
        }
        columns
    }

    /// Partition `columns` into groups whose rows never overlap.
    ///
    /// Columns in one group can be perturbed together: each row responds to
    /// at most one of them. Columns with no rows are left out. Greedy
    /// first-fit colouring in column order.
    pub fn column_groups(&self, columns: Range<usize>) -> Vec<Vec<usize>> {
        let column_rows = self.column_rows();
        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut used: Vec<Vec<bool>> = Vec::new();

        for col in columns {
            let rows = &column_rows[col];
            if rows.is_empty() {
                continue;
            }
            let slot = used
                .iter()
                .position(|taken| rows.iter().all(|&r| !taken[r]));
            let slot = match slot {
                Some(slot) => slot,
                None => {
                    groups.push(Vec::new());
                    used.push(vec![false; self.rows.len()]);
                    groups.len() - 1
                }
            };
            groups[slot].push(col);
            for &r in rows {
                used[slot][r] = true;
            }
        }

        groups
    }

    /// Dense 0/1 matrix
    pub fn to_dense(&self) -> DMatrix<u8> {
        let mut dense = DMatrix::zeros(self.rows.len(), self.cols);
        for (row, cols) in self.rows.iter().enumerate() {
            for &col in cols {
                dense[(row, col)] = 1;
            }
        }
        dense
    }

    /// CSR matrix with a `1.0` at every structural non-zero
    pub fn to_csr(&self) -> CsMat<f64> {
        let mut tri = TriMat::with_capacity((self.rows.len(), self.cols), self.nnz());
        for (row, cols) in self.rows.iter().enumerate() {
            for &col in cols {
                tri.add_triplet(row, col, 1.0);
            }
        }
        tri.to_csr()
    }

    pub fn stats(&self) -> SparsityStats {
        let rows = self.rows();
        let cols = self.cols;
        let nnz = self.nnz();
        let total = rows * cols;
        let density = if total > 0 {
            nnz as f64 / total as f64
        } else {
            0.0
        };

        SparsityStats {
            rows,
            cols,
            nnz,
            density,
        }
    }
}

/// Statistics about sparse matrix structure
#[derive(Debug, Clone)]
pub struct SparsityStats {
    pub rows: usize,
    pub cols: usize,
    pub nnz: usize,
    pub density: f64,
}

impl fmt::Display for SparsityStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} matrix, {} non-zeros ({:.2}% dense)",
            self.rows,
            self.cols,
            self.nnz,
            self.density * 100.0
        )
    }
}
