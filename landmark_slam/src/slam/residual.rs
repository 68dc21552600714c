//! Residual function of the pose graph
//!
//! Every constraint `k` yields an error vector `e_k`:
//!
//! - odometry:  `pose[i+1] - z.absolute(pose[i])`
//! - landmark:  `landmark[j] - z.absolute(pose[i])`
//! - GPS:       `z - pose[i].position`
//! - GIS:       `z - landmark[j]`
//!
//! Its scalar contribution is the quadratic form `e_kᵀ Ω_k e_k`. For the
//! solver the same term is exposed as a whitened block `r_k = Lᵀ e_k` with
//! `Ω_k = L Lᵀ`, so that `‖r_k‖²` equals the scalar term.
//!
//! Before any evaluation the first three state entries are overwritten
//! with the origin pose. The optimizer can propose anything for them; the
//! graph stays anchored.

use crate::error::{Result, SlamError};
use crate::slam::constraints::{Constraint, ConstraintGraph};
use crate::slam::geometry::{Point2D, Pose2D};
use crate::slam::sparse_solver::Triplet;
use crate::slam::sparsity::SparsityPattern;
use crate::slam::state::{self, pose_count};
use nalgebra::{DMatrix, DVector};

/// Number of pinned state entries (the origin pose)
pub const PINNED_ENTRIES: usize = 3;

/// Error vector of one constraint and its Jacobian over the constraint's columns
struct ErrorBlock {
    error: DVector<f64>,
    jacobian: DMatrix<f64>,
}

/// Residuals and Jacobian of the whitened system at one state
#[derive(Debug, Clone)]
pub struct Linearization {
    /// Stacked whitened residual blocks
    pub residuals: DVector<f64>,
    /// Non-zero Jacobian entries of the whitened residuals
    pub jacobian: Vec<Triplet>,
}

/// Evaluates constraint residuals for candidate states
#[derive(Debug, Clone, Copy)]
pub struct ResidualModel<'a> {
    origin: Pose2D,
    landmark_count: usize,
    constraints: &'a ConstraintGraph,
}

impl<'a> ResidualModel<'a> {
    pub fn new(origin: Pose2D, landmark_count: usize, constraints: &'a ConstraintGraph) -> Self {
        Self {
            origin,
            landmark_count,
            constraints,
        }
    }

    /// Overwrite the origin pose entries of `state`.
    pub fn pin(&self, state: &mut DVector<f64>) {
        state[0] = self.origin.x;
        state[1] = self.origin.y;
        state[2] = self.origin.theta;
    }

    /// Residual dimension of every constraint, in residual order
    pub fn block_dims(&self) -> Vec<usize> {
        self.constraints.iter().map(|c| c.dof()).collect()
    }

    /// Total number of whitened residual rows
    pub fn residual_len(&self) -> usize {
        self.constraints.iter().map(|c| c.dof()).sum()
    }

    /// Constraint-level sparsity pattern for this graph.
    pub fn sparsity(&self) -> SparsityPattern {
        SparsityPattern::from_constraints(self.constraints, self.pose_count(), self.landmark_count)
    }

    fn pose_count(&self) -> usize {
        self.constraints.steps() + 1
    }

    /// Pin a copy of `state` and split it into poses and landmarks.
    fn decode(&self, state: &DVector<f64>) -> Result<(Vec<Pose2D>, Vec<Point2D>)> {
        if pose_count(state.len(), self.landmark_count)? != self.pose_count() {
            return Err(SlamError::StateLength {
                len: state.len(),
                landmark_count: self.landmark_count,
            });
        }
        let mut pinned = state.clone();
        self.pin(&mut pinned);
        state::unpack(&pinned, self.landmark_count)
    }

    /// Scalar weighted quadratic form `eᵀ Ω e` of every constraint.
    ///
    /// Ordered odometry, landmark, GPS, GIS; row `k` matches row `k` of
    /// [`ResidualModel::sparsity`].
    pub fn costs(&self, state: &DVector<f64>) -> Result<Vec<f64>> {
        let (trajectory, landmarks) = self.decode(state)?;
        Ok(self
            .constraints
            .iter()
            .map(|c| {
                let e = error_block(&c, &trajectory, &landmarks).error;
                let information = information(&c);
                e.dot(&(&information * &e))
            })
            .collect())
    }

    /// Sum of all scalar terms
    pub fn total_cost(&self, state: &DVector<f64>) -> Result<f64> {
        Ok(self.costs(state)?.iter().sum())
    }

    /// Stacked whitened residual blocks `Lᵀ e`
    pub fn whitened(&self, state: &DVector<f64>) -> Result<DVector<f64>> {
        let (trajectory, landmarks) = self.decode(state)?;
        let mut residuals = DVector::zeros(self.residual_len());
        let mut row = 0;

        for c in self.constraints.iter() {
            let block = error_block(&c, &trajectory, &landmarks);
            let weighted = sqrt_information(&c)? * &block.error;
            residuals.rows_mut(row, c.dof()).copy_from(&weighted);
            row += c.dof();
        }

        Ok(residuals)
    }

    /// Whitened residuals with the closed-form Jacobian.
    pub fn linearize(&self, state: &DVector<f64>) -> Result<Linearization> {
        let (trajectory, landmarks) = self.decode(state)?;
        let pose_count = trajectory.len();

        let mut residuals = DVector::zeros(self.residual_len());
        let mut jacobian = Vec::with_capacity(self.constraints.len() * 12);
        let mut row = 0;

        for c in self.constraints.iter() {
            let block = error_block(&c, &trajectory, &landmarks);
            let sqrt_info = sqrt_information(&c)?;

            let weighted = &sqrt_info * &block.error;
            residuals.rows_mut(row, c.dof()).copy_from(&weighted);

            let wj = &sqrt_info * &block.jacobian;
            for (j, col) in c.state_columns(pose_count).into_iter().enumerate() {
                if col < PINNED_ENTRIES {
                    continue;
                }
                for i in 0..c.dof() {
                    let value = wj[(i, j)];
                    if value.abs() > 1e-12 {
                        jacobian.push(Triplet {
                            row: row + i,
                            col,
                            value,
                        });
                    }
                }
            }

            row += c.dof();
        }

        Ok(Linearization {
            residuals,
            jacobian,
        })
    }

    /// Whitened residuals with a three-point finite-difference Jacobian.
    ///
    /// With a pattern, columns whose rows never overlap are perturbed
    /// together, so one pair of evaluations yields several columns. Without
    /// one, every column is differenced on its own over every row.
    pub fn linearize_numeric(
        &self,
        state: &DVector<f64>,
        pattern: Option<&SparsityPattern>,
    ) -> Result<Linearization> {
        let residuals = self.whitened(state)?;
        let mut jacobian = Vec::new();

        let Some(pattern) = pattern else {
            for col in PINNED_ENTRIES..state.len() {
                let derivative = self.central_difference(state, &[col])?;
                jacobian.extend((0..derivative.len()).filter_map(|row| {
                    nonzero(row, col, derivative[row] / step_size(state[col]))
                }));
            }
            return Ok(Linearization {
                residuals,
                jacobian,
            });
        };

        let expanded = pattern.expand(&self.block_dims());
        let column_rows = expanded.column_rows();
        for group in expanded.column_groups(PINNED_ENTRIES..state.len()) {
            let derivative = self.central_difference(state, &group)?;
            for &col in &group {
                let h = step_size(state[col]);
                jacobian.extend(
                    column_rows[col]
                        .iter()
                        .filter_map(|&row| nonzero(row, col, derivative[row] / h)),
                );
            }
        }

        Ok(Linearization {
            residuals,
            jacobian,
        })
    }

    /// `(r(x + h) - r(x - h)) / 2` with every column of `columns` stepped
    /// by its own `h`; divide by that `h` to get the derivative.
    fn central_difference(&self, state: &DVector<f64>, columns: &[usize]) -> Result<DVector<f64>> {
        let mut shifted = state.clone();
        for &col in columns {
            shifted[col] = state[col] + step_size(state[col]);
        }
        let forward = self.whitened(&shifted)?;
        for &col in columns {
            shifted[col] = state[col] - step_size(state[col]);
        }
        let backward = self.whitened(&shifted)?;
        Ok((forward - backward) * 0.5)
    }
}

fn step_size(x: f64) -> f64 {
    f64::EPSILON.cbrt() * x.abs().max(1.0)
}

fn nonzero(row: usize, col: usize, value: f64) -> Option<Triplet> {
    (value.abs() > 1e-12).then_some(Triplet { row, col, value })
}

fn error_block(c: &Constraint<'_>, trajectory: &[Pose2D], landmarks: &[Point2D]) -> ErrorBlock {
    match c {
        Constraint::Odometry(c) => {
            let a = trajectory[c.from];
            let b = trajectory[c.to()];
            let z = c.measurement;
            let e = b - z.absolute(&a);

            let (s, co) = a.theta.sin_cos();
            #[rustfmt::skip]
            let jacobian = DMatrix::from_row_slice(3, 6, &[
                -1.0, 0.0, s * z.x + co * z.y,  1.0, 0.0, 0.0,
                0.0, -1.0, -co * z.x + s * z.y, 0.0, 1.0, 0.0,
                0.0, 0.0, -1.0,                 0.0, 0.0, 1.0,
            ]);

            ErrorBlock {
                error: DVector::from_column_slice(&[e.x, e.y, e.theta]),
                jacobian,
            }
        }
        Constraint::Landmark(c) => {
            let p = trajectory[c.pose];
            let m = c.measurement;
            let e = landmarks[c.landmark] - m.absolute(&p);

            let (s, co) = p.theta.sin_cos();
            #[rustfmt::skip]
            let jacobian = DMatrix::from_row_slice(2, 5, &[
                -1.0, 0.0, s * m.x + co * m.y,  1.0, 0.0,
                0.0, -1.0, -co * m.x + s * m.y, 0.0, 1.0,
            ]);

            ErrorBlock {
                error: DVector::from_column_slice(&[e.x, e.y]),
                jacobian,
            }
        }
        Constraint::Gps(c) => {
            let e = c.position - trajectory[c.pose].position();
            ErrorBlock {
                error: DVector::from_column_slice(&[e.x, e.y]),
                jacobian: -DMatrix::identity(2, 2),
            }
        }
        Constraint::Gis(c) => {
            let e = c.position - landmarks[c.landmark];
            ErrorBlock {
                error: DVector::from_column_slice(&[e.x, e.y]),
                jacobian: -DMatrix::identity(2, 2),
            }
        }
    }
}

fn information(c: &Constraint<'_>) -> DMatrix<f64> {
    match c {
        Constraint::Odometry(c) => DMatrix::from_column_slice(3, 3, c.information.as_slice()),
        Constraint::Landmark(c) => DMatrix::from_column_slice(2, 2, c.information.as_slice()),
        Constraint::Gps(c) => DMatrix::from_column_slice(2, 2, c.information.as_slice()),
        Constraint::Gis(c) => DMatrix::from_column_slice(2, 2, c.information.as_slice()),
    }
}

/// `Lᵀ` where `Ω = L Lᵀ`; fails if `Ω` is not positive-definite
fn sqrt_information(c: &Constraint<'_>) -> Result<DMatrix<f64>> {
    information(c)
        .cholesky()
        .map(|ch| ch.l().transpose())
        .ok_or(SlamError::SingularCovariance {
            kind: c.kind(),
            distance: measured_distance(c),
        })
}

fn measured_distance(c: &Constraint<'_>) -> f64 {
    match c {
        Constraint::Odometry(c) => c.measurement.translation_norm(),
        Constraint::Landmark(c) => c.measurement.norm(),
        Constraint::Gps(c) => c.position.norm(),
        Constraint::Gis(c) => c.position.norm(),
    }
}
