//! Sparse linear algebra for the trust-region step
//!
//! Each Levenberg-Marquardt iteration solves the damped normal equations
//!
//! ```text
//! (JᵀJ + D) dx = -Jᵀr,    D = diag(λ (1 + diag(JᵀJ)) + ε)
//! ```
//!
//! The Jacobian is inherently sparse:
//!
//! - Each odometry constraint connects only 2 poses (6 non-zeros per row in J)
//! - Each observation connects 1 pose and 1 landmark (5 non-zeros per row in J)
//! - Each GPS/GIS prior touches 2 entries
//!
//! Two strategies are offered. `Exact` factorizes the damped Hessian with
//! a dense LU, which costs `O(n³)` in the number of state entries and is
//! meant for graphs of up to a few hundred poses. `Iterative` runs
//! Jacobi-preconditioned conjugate gradient using only products with `J`
//! and `Jᵀ`, never forming `JᵀJ`; each iteration is linear in the number of
//! non-zeros, so it is the choice for long trajectories.
//!
//! ## References
//! - [Efficient Sparse Pose Adjustment](https://www.cs.jhu.edu/~misha/Fall07/konolige10.pdf)
//! - [g2o: A General Framework for Graph Optimization](https://github.com/RainerKuemmerle/g2o)

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use sprs::{CsMat, TriMat};

/// Sparse triplet for building CSR/CSC matrices
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triplet {
    pub row: usize,
    pub col: usize,
    pub value: f64,
}

/// Strategy used to solve the damped normal equations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinearSolverKind {
    /// Direct factorization of `JᵀJ + D`
    #[default]
    Exact,
    /// Preconditioned conjugate gradient
    Iterative,
}

/// Configuration for sparse solver
#[derive(Debug, Clone)]
pub struct SparseSolverConfig {
    /// Regularization added to the diagonal
    pub regularization: f64,
    pub kind: LinearSolverKind,
    /// Conjugate gradient iteration cap (0 = number of unknowns)
    pub cg_max_iterations: usize,
    /// Relative residual at which conjugate gradient stops
    pub cg_tolerance: f64,
}

impl Default for SparseSolverConfig {
    fn default() -> Self {
        Self {
            regularization: 1e-8,
            kind: LinearSolverKind::Exact,
            cg_max_iterations: 0,
            cg_tolerance: 1e-10,
        }
    }
}

/// Jacobian in the storage selected by the optimizer
#[derive(Debug, Clone)]
pub enum Jacobian {
    /// CSR, rows are residuals
    Sparse(CsMat<f64>),
    Dense(DMatrix<f64>),
}

impl Jacobian {
    /// Assemble from triplets; duplicate entries are summed.
    pub fn from_triplets(triplets: &[Triplet], rows: usize, cols: usize, sparse: bool) -> Self {
        if sparse {
            Jacobian::Sparse(triplets_to_csr(triplets, rows, cols))
        } else {
            let mut dense = DMatrix::zeros(rows, cols);
            for t in triplets {
                dense[(t.row, t.col)] += t.value;
            }
            Jacobian::Dense(dense)
        }
    }

    pub fn rows(&self) -> usize {
        match self {
            Jacobian::Sparse(j) => j.rows(),
            Jacobian::Dense(j) => j.nrows(),
        }
    }

    pub fn cols(&self) -> usize {
        match self {
            Jacobian::Sparse(j) => j.cols(),
            Jacobian::Dense(j) => j.ncols(),
        }
    }

    /// `J v`
    pub fn mul(&self, v: &DVector<f64>) -> DVector<f64> {
        match self {
            Jacobian::Sparse(j) => {
                let mut out = DVector::zeros(j.rows());
                for (row, vec) in j.outer_iterator().enumerate() {
                    out[row] = vec.iter().map(|(col, &val)| val * v[col]).sum();
                }
                out
            }
            Jacobian::Dense(j) => j * v,
        }
    }

    /// `Jᵀ u`
    pub fn transpose_mul(&self, u: &DVector<f64>) -> DVector<f64> {
        match self {
            Jacobian::Sparse(j) => {
                let mut out = DVector::zeros(j.cols());
                for (row, vec) in j.outer_iterator().enumerate() {
                    for (col, &val) in vec.iter() {
                        out[col] += val * u[row];
                    }
                }
                out
            }
            Jacobian::Dense(j) => j.tr_mul(u),
        }
    }

    /// Diagonal of `JᵀJ`
    pub fn column_norms_squared(&self) -> DVector<f64> {
        match self {
            Jacobian::Sparse(j) => {
                let mut out = DVector::zeros(j.cols());
                for vec in j.outer_iterator() {
                    for (col, &val) in vec.iter() {
                        out[col] += val * val;
                    }
                }
                out
            }
            Jacobian::Dense(j) => DVector::from_iterator(
                j.ncols(),
                j.column_iter().map(|c| c.norm_squared()),
            ),
        }
    }

    /// `JᵀJ` as a dense matrix
    fn gram(&self) -> DMatrix<f64> {
        match self {
            Jacobian::Sparse(j) => {
                let jt = j.transpose_view();
                let jtj: CsMat<f64> = &jt * j;
                let mut h = DMatrix::zeros(j.cols(), j.cols());
                for (val, (row, col)) in jtj.iter() {
                    h[(row, col)] = *val;
                }
                h
            }
            Jacobian::Dense(j) => j.tr_mul(j),
        }
    }
}

/// Linear solver for the damped normal equations
pub struct SparseSlamSolver {
    config: SparseSolverConfig,
}

impl Default for SparseSlamSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SparseSlamSolver {
    pub fn new() -> Self {
        Self {
            config: SparseSolverConfig::default(),
        }
    }

    pub fn with_config(config: SparseSolverConfig) -> Self {
        Self { config }
    }

    /// Solve `(JᵀJ + λ(I + diag(JᵀJ))) dx = -Jᵀr`.
    ///
    /// Returns `None` if the system is singular or the solution is not finite.
    pub fn solve(
        &self,
        jacobian: &Jacobian,
        residuals: &DVector<f64>,
        lambda: f64,
    ) -> Option<DVector<f64>> {
        let n_vars = jacobian.cols();
        if n_vars == 0 {
            return Some(DVector::zeros(0));
        }

        let neg_gradient = -jacobian.transpose_mul(residuals);
        let diag = jacobian.column_norms_squared();
        let damping = diag.map(|d| lambda * (1.0 + d) + self.config.regularization);

        let dx = match self.config.kind {
            LinearSolverKind::Exact => {
                let mut h = jacobian.gram();
                for i in 0..n_vars {
                    h[(i, i)] += damping[i];
                }
                h.lu().solve(&neg_gradient)?
            }
            LinearSolverKind::Iterative => {
                let max_iterations = if self.config.cg_max_iterations == 0 {
                    n_vars
                } else {
                    self.config.cg_max_iterations
                };
                let preconditioner = &diag + &damping;
                conjugate_gradient(
                    |v| jacobian.transpose_mul(&jacobian.mul(v)) + damping.component_mul(v),
                    &neg_gradient,
                    &preconditioner,
                    max_iterations,
                    self.config.cg_tolerance,
                )?
            }
        };

        dx.iter().all(|v| v.is_finite()).then_some(dx)
    }
}

/// Jacobi-preconditioned conjugate gradient for a symmetric positive-definite operator
fn conjugate_gradient<F>(
    apply: F,
    b: &DVector<f64>,
    preconditioner: &DVector<f64>,
    max_iterations: usize,
    tolerance: f64,
) -> Option<DVector<f64>>
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
{
    let mut x = DVector::zeros(b.len());
    let b_norm = b.norm();
    if b_norm == 0.0 {
        return Some(x);
    }

    let mut r = b.clone();
    let mut z = r.component_div(preconditioner);
    let mut p = z.clone();
    let mut rz = r.dot(&z);

    for _ in 0..max_iterations {
        let ap = apply(&p);
        let pap = p.dot(&ap);
        if !(pap > 0.0) {
            return None;
        }

        let alpha = rz / pap;
        x.axpy(alpha, &p, 1.0);
        r.axpy(-alpha, &ap, 1.0);

        if r.norm() <= tolerance * b_norm {
            break;
        }

        z = r.component_div(preconditioner);
        let rz_next = r.dot(&z);
        p = &z + &p * (rz_next / rz);
        rz = rz_next;
    }

    Some(x)
}

/// Convert triplets to CSR sparse matrix
fn triplets_to_csr(triplets: &[Triplet], rows: usize, cols: usize) -> CsMat<f64> {
    let mut tri_mat = TriMat::with_capacity((rows, cols), triplets.len());
    for t in triplets {
        tri_mat.add_triplet(t.row, t.col, t.value);
    }
    tri_mat.to_csr()
}
