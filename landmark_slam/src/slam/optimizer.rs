//! Robust Levenberg-Marquardt driver
//!
//! Minimizes `sum_k rho(‖r_k‖)` over the flat state, where `r_k` is the
//! whitened residual block of constraint `k` and `rho` the configured loss.
//! Robustness is handled with iteratively reweighted least squares: the
//! weights are refreshed from the current residuals at every iteration.
//!
//! Termination mirrors the usual trust-region tolerances:
//!
//! - `ftol`: accepted cost reduction below `ftol * cost`
//! - `xtol`: step norm below `xtol * (xtol + ‖x‖)`
//! - `gtol`: gradient infinity-norm below `gtol`
//!
//! Running out of iterations or damping is reported, not treated as an
//! error: the best iterate found so far is always returned.

use crate::error::Result;
use crate::slam::residual::{Linearization, ResidualModel};
use crate::slam::robust_kernels::{chi_squared, Loss, LossKind};
use crate::slam::sparse_solver::{
    Jacobian, LinearSolverKind, SparseSlamSolver, SparseSolverConfig, Triplet,
};
use crate::slam::sparsity::SparsityPattern;
use log::{debug, info, warn};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How the Jacobian is computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JacobianMode {
    /// Closed-form derivatives per constraint kind
    #[default]
    Analytic,
    /// Three-point finite differences
    CentralDifference,
}

/// Configuration for the optimizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Maximum number of accepted-or-exhausted iterations
    pub max_iterations: usize,
    /// Relative cost reduction tolerance
    pub ftol: f64,
    /// Relative step size tolerance
    pub xtol: f64,
    /// Gradient infinity-norm tolerance
    pub gtol: f64,
    /// Initial damping factor for Levenberg-Marquardt
    pub initial_lambda: f64,
    /// Factor to increase lambda on rejection
    pub lambda_up: f64,
    /// Factor to decrease lambda on acceptance
    pub lambda_down: f64,
    /// Damping beyond which the solver gives up
    pub max_lambda: f64,
    /// Robust loss applied per constraint
    pub loss: LossKind,
    /// Mahalanobis distance at which the loss departs from quadratic
    pub loss_scale: f64,
    /// Restrict Jacobian storage and differencing to the sparsity pattern
    pub use_sparsity: bool,
    pub jacobian: JacobianMode,
    pub linear_solver: LinearSolverKind,
    /// Chi-squared confidence used to count outliers in the report
    pub outlier_chi2_confidence: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            ftol: 1e-5,
            xtol: 1e-5,
            gtol: 1e-5,
            initial_lambda: 1e-3,
            lambda_up: 10.0,
            lambda_down: 0.1,
            max_lambda: 1e10,
            loss: LossKind::Huber,
            loss_scale: 1.0,
            use_sparsity: true,
            jacobian: JacobianMode::Analytic,
            linear_solver: LinearSolverKind::Exact,
            outlier_chi2_confidence: 0.95,
        }
    }
}

/// Why the optimizer stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverStatus {
    /// Cost reduction fell below `ftol`
    CostTolerance,
    /// Step size fell below `xtol`
    StepTolerance,
    /// Gradient fell below `gtol`
    GradientTolerance,
    /// Iteration budget exhausted before any tolerance was met
    MaxIterations,
    /// No step could reduce the cost (damping limit or singular system)
    Stalled,
    /// The graph has nothing to optimize
    NoConstraints,
}

impl SolverStatus {
    pub fn is_converged(self) -> bool {
        matches!(
            self,
            SolverStatus::CostTolerance
                | SolverStatus::StepTolerance
                | SolverStatus::GradientTolerance
                | SolverStatus::NoConstraints
        )
    }
}

impl fmt::Display for SolverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SolverStatus::CostTolerance => "converged (cost tolerance)",
            SolverStatus::StepTolerance => "converged (step tolerance)",
            SolverStatus::GradientTolerance => "converged (gradient tolerance)",
            SolverStatus::MaxIterations => "iteration limit reached",
            SolverStatus::Stalled => "stalled",
            SolverStatus::NoConstraints => "nothing to optimize",
        };
        f.write_str(text)
    }
}

/// Result of one optimization
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationReport {
    pub status: SolverStatus,
    pub iterations: usize,
    /// Robust cost before the first iteration
    pub initial_cost: f64,
    /// Robust cost of the returned state
    pub final_cost: f64,
    /// Constraints whose Mahalanobis distance fails the chi-squared test
    pub outliers: usize,
}

impl OptimizationReport {
    pub fn converged(&self) -> bool {
        self.status.is_converged()
    }
}

/// Run Levenberg-Marquardt from `initial`; returns the best state found.
pub fn optimize(
    model: &ResidualModel<'_>,
    initial: DVector<f64>,
    config: &OptimizerConfig,
) -> Result<(DVector<f64>, OptimizationReport)> {
    let loss = Loss::new(config.loss, config.loss_scale);
    let dims = model.block_dims();
    let mut x = initial;
    model.pin(&mut x);

    if dims.is_empty() {
        return Ok((
            x,
            OptimizationReport {
                status: SolverStatus::NoConstraints,
                iterations: 0,
                initial_cost: 0.0,
                final_cost: 0.0,
                outliers: 0,
            },
        ));
    }

    let pattern = config.use_sparsity.then(|| model.sparsity());
    let solver = SparseSlamSolver::with_config(SparseSolverConfig {
        kind: config.linear_solver,
        ..SparseSolverConfig::default()
    });

    let initial_cost = robust_cost(&model.whitened(&x)?, &dims, &loss);
    let mut cost = initial_cost;
    let mut lambda = config.initial_lambda;
    let mut iterations = 0;
    let mut status = SolverStatus::MaxIterations;

    'outer: for iter in 0..config.max_iterations {
        iterations = iter + 1;

        let Linearization {
            residuals,
            jacobian,
        } = linearize(model, &x, config, pattern.as_ref())?;

        let row_scale = irls_row_scale(&residuals, &dims, &loss);
        let r = residuals.component_mul(&row_scale);
        let triplets: Vec<Triplet> = jacobian
            .into_iter()
            .map(|t| Triplet {
                value: t.value * row_scale[t.row],
                ..t
            })
            .collect();
        let j = Jacobian::from_triplets(&triplets, r.len(), x.len(), config.use_sparsity);

        let gradient = j.transpose_mul(&r);
        if gradient.amax() <= config.gtol {
            status = SolverStatus::GradientTolerance;
            break;
        }

        loop {
            let Some(dx) = solver.solve(&j, &r, lambda) else {
                status = SolverStatus::Stalled;
                break 'outer;
            };

            let mut candidate = &x + &dx;
            model.pin(&mut candidate);
            let new_cost = robust_cost(&model.whitened(&candidate)?, &dims, &loss);

            debug!(
                "iter {}: cost {:.6e} -> {:.6e}, lambda {:.1e}, |dx| {:.3e}",
                iterations,
                cost,
                new_cost,
                lambda,
                dx.norm()
            );

            if new_cost.is_finite() && new_cost < cost {
                let reduction = cost - new_cost;
                let step_norm = dx.norm();
                let x_norm = x.norm();

                let previous = cost;
                x = candidate;
                cost = new_cost;
                lambda *= config.lambda_down;

                if reduction < config.ftol * previous {
                    status = SolverStatus::CostTolerance;
                    break 'outer;
                }
                if step_norm < config.xtol * (config.xtol + x_norm) {
                    status = SolverStatus::StepTolerance;
                    break 'outer;
                }
                break;
            }

            lambda *= config.lambda_up;
            if lambda > config.max_lambda {
                status = SolverStatus::Stalled;
                break 'outer;
            }
        }
    }

    let outliers = count_outliers(model, &x, config.outlier_chi2_confidence)?;
    let report = OptimizationReport {
        status,
        iterations,
        initial_cost,
        final_cost: cost,
        outliers,
    };

    if report.converged() {
        info!(
            "optimization {} after {} iterations: cost {:.6e} -> {:.6e}",
            report.status, report.iterations, report.initial_cost, report.final_cost
        );
    } else {
        warn!(
            "optimization {} after {} iterations: cost {:.6e} -> {:.6e}, keeping best iterate",
            report.status, report.iterations, report.initial_cost, report.final_cost
        );
    }

    Ok((x, report))
}

fn linearize(
    model: &ResidualModel<'_>,
    x: &DVector<f64>,
    config: &OptimizerConfig,
    pattern: Option<&SparsityPattern>,
) -> Result<Linearization> {
    match config.jacobian {
        JacobianMode::Analytic => model.linearize(x),
        JacobianMode::CentralDifference => model.linearize_numeric(x, pattern),
    }
}

/// Sum of the loss over every residual block
fn robust_cost(residuals: &DVector<f64>, dims: &[usize], loss: &Loss) -> f64 {
    let mut row = 0;
    let mut cost = 0.0;
    for &dim in dims {
        cost += loss.cost(residuals.rows(row, dim).norm());
        row += dim;
    }
    cost
}

/// `sqrt(weight)` of each block, repeated over the block's rows
fn irls_row_scale(residuals: &DVector<f64>, dims: &[usize], loss: &Loss) -> DVector<f64> {
    let mut scale = DVector::zeros(residuals.len());
    let mut row = 0;
    for &dim in dims {
        let w = loss.weight(residuals.rows(row, dim).norm()).sqrt();
        scale.rows_mut(row, dim).fill(w);
        row += dim;
    }
    scale
}

fn count_outliers(model: &ResidualModel<'_>, x: &DVector<f64>, confidence: f64) -> Result<usize> {
    let costs = model.costs(x)?;
    Ok(costs
        .iter()
        .zip(model.block_dims())
        .filter(|&(&mahalanobis_sq, dof)| chi_squared::is_outlier(mahalanobis_sq, dof, confidence))
        .count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slam::constraints::{ConstraintGraph, LandmarkConstraint, OdometryConstraint};
    use crate::slam::geometry::{Point2D, Pose2D};
    use crate::slam::state::{pack, unpack};
    use approx::assert_abs_diff_eq;
    use nalgebra::{Matrix2, Matrix3};
    use rstest::rstest;

    /// Square loop of 4 steps, 2 landmarks, noiseless measurements
    fn square_loop() -> (ConstraintGraph, Vec<Pose2D>, Vec<Point2D>) {
        let step = Pose2D::new(2.0, 0.0, std::f64::consts::FRAC_PI_2);
        let landmarks = vec![Point2D::new(1.0, 1.0), Point2D::new(3.0, -1.0)];

        let mut trajectory = vec![Pose2D::origin()];
        let mut graph = ConstraintGraph::new();
        for i in 0..4 {
            let pose = step.absolute(&trajectory[i]);
            trajectory.push(pose);

            let observations = landmarks
                .iter()
                .enumerate()
                .map(|(id, lm)| LandmarkConstraint {
                    pose: i + 1,
                    landmark: id,
                    measurement: lm.relative(&pose),
                    information: Matrix2::identity() * 10.0,
                })
                .collect();
            graph.push_step(
                OdometryConstraint {
                    from: i,
                    measurement: step,
                    information: Matrix3::identity() * 10.0,
                },
                observations,
                None,
            );
        }
        (graph, trajectory, landmarks)
    }

    fn perturbed(trajectory: &[Pose2D], landmarks: &[Point2D]) -> DVector<f64> {
        let mut state = pack(trajectory, landmarks);
        for i in 3..state.len() {
            state[i] += 0.15 * ((i as f64) * 1.7).sin();
        }
        state
    }

    fn assert_recovers(state: &DVector<f64>, trajectory: &[Pose2D], landmarks: &[Point2D]) {
        let (t, l) = unpack(state, landmarks.len()).unwrap();
        for (est, truth) in t.iter().zip(trajectory) {
            assert_abs_diff_eq!(est.x, truth.x, epsilon = 1e-4);
            assert_abs_diff_eq!(est.y, truth.y, epsilon = 1e-4);
            assert_abs_diff_eq!(est.theta, truth.theta, epsilon = 1e-4);
        }
        for (est, truth) in l.iter().zip(landmarks) {
            assert_abs_diff_eq!(est.x, truth.x, epsilon = 1e-4);
            assert_abs_diff_eq!(est.y, truth.y, epsilon = 1e-4);
        }
    }

    #[rstest]
    #[case::analytic_sparse_exact(JacobianMode::Analytic, true, LinearSolverKind::Exact)]
    #[case::analytic_dense_exact(JacobianMode::Analytic, false, LinearSolverKind::Exact)]
    #[case::analytic_sparse_iterative(JacobianMode::Analytic, true, LinearSolverKind::Iterative)]
    #[case::numeric_sparse_exact(JacobianMode::CentralDifference, true, LinearSolverKind::Exact)]
    #[case::numeric_dense_iterative(JacobianMode::CentralDifference, false, LinearSolverKind::Iterative)]
    fn test_noiseless_convergence(
        #[case] jacobian: JacobianMode,
        #[case] use_sparsity: bool,
        #[case] linear_solver: LinearSolverKind,
    ) {
        let (graph, trajectory, landmarks) = square_loop();
        let model = ResidualModel::new(Pose2D::origin(), landmarks.len(), &graph);
        let config = OptimizerConfig {
            ftol: 1e-12,
            xtol: 1e-12,
            gtol: 1e-10,
            jacobian,
            use_sparsity,
            linear_solver,
            ..OptimizerConfig::default()
        };

        let (state, report) = optimize(&model, perturbed(&trajectory, &landmarks), &config).unwrap();

        assert!(report.converged(), "status {:?}", report.status);
        assert!(report.final_cost < report.initial_cost);
        assert!(report.final_cost < 1e-8);
        assert_eq!(report.outliers, 0);
        assert_recovers(&state, &trajectory, &landmarks);
    }

    #[rstest]
    #[case(LossKind::Linear)]
    #[case(LossKind::SoftL1)]
    #[case(LossKind::Cauchy)]
    #[case(LossKind::Arctan)]
    #[case(LossKind::Tukey)]
    fn test_every_loss_recovers_noiseless_graph(#[case] loss: LossKind) {
        let (graph, trajectory, landmarks) = square_loop();
        let model = ResidualModel::new(Pose2D::origin(), landmarks.len(), &graph);
        let config = OptimizerConfig {
            loss,
            loss_scale: 10.0,
            ftol: 1e-12,
            xtol: 1e-12,
            gtol: 1e-10,
            ..OptimizerConfig::default()
        };

        let (state, report) = optimize(&model, perturbed(&trajectory, &landmarks), &config).unwrap();
        assert!(report.converged(), "status {:?}", report.status);
        assert_recovers(&state, &trajectory, &landmarks);
    }

    #[test]
    fn test_origin_stays_pinned() {
        let (graph, trajectory, landmarks) = square_loop();
        let model = ResidualModel::new(Pose2D::origin(), landmarks.len(), &graph);
        let mut start = perturbed(&trajectory, &landmarks);
        start[0] = 5.0;
        start[2] = -1.0;

        let (state, _) = optimize(&model, start, &OptimizerConfig::default()).unwrap();
        assert_eq!(&state.as_slice()[..3], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_iteration_limit_is_reported() {
        let (graph, trajectory, landmarks) = square_loop();
        let model = ResidualModel::new(Pose2D::origin(), landmarks.len(), &graph);
        let config = OptimizerConfig {
            max_iterations: 1,
            ftol: 0.0,
            xtol: 0.0,
            gtol: 0.0,
            ..OptimizerConfig::default()
        };

        let (state, report) = optimize(&model, perturbed(&trajectory, &landmarks), &config).unwrap();
        assert_eq!(report.status, SolverStatus::MaxIterations);
        assert!(!report.converged());
        assert_eq!(report.iterations, 1);
        // Best iterate is still an improvement
        assert!(report.final_cost < report.initial_cost);
        assert_abs_diff_eq!(
            robust_cost(
                &model.whitened(&state).unwrap(),
                &model.block_dims(),
                &Loss::new(config.loss, config.loss_scale)
            ),
            report.final_cost,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_empty_graph() {
        let graph = ConstraintGraph::new();
        let model = ResidualModel::new(Pose2D::new(1.0, 2.0, 3.0), 2, &graph);
        let (state, report) =
            optimize(&model, DVector::zeros(7), &OptimizerConfig::default()).unwrap();
        assert_eq!(report.status, SolverStatus::NoConstraints);
        assert_eq!(&state.as_slice()[..3], &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_robust_loss_resists_outlier() {
        let (mut graph, trajectory, landmarks) = square_loop();
        // A fifth step with one grossly wrong observation of landmark 0
        let step = Pose2D::new(1.0, 0.0, 0.0);
        let pose = step.absolute(&trajectory[4]);
        graph.push_step(
            OdometryConstraint {
                from: 4,
                measurement: step,
                information: Matrix3::identity() * 10.0,
            },
            vec![
                LandmarkConstraint {
                    pose: 5,
                    landmark: 0,
                    measurement: landmarks[0].relative(&pose) + Point2D::new(3.0, -3.0),
                    information: Matrix2::identity() * 10.0,
                },
                LandmarkConstraint {
                    pose: 5,
                    landmark: 1,
                    measurement: landmarks[1].relative(&pose),
                    information: Matrix2::identity() * 10.0,
                },
            ],
            None,
        );
        let mut truth = trajectory.clone();
        truth.push(pose);

        let model = ResidualModel::new(Pose2D::origin(), landmarks.len(), &graph);
        let start = pack(&truth, &landmarks);

        let error_with = |loss: LossKind| {
            let config = OptimizerConfig {
                loss,
                ..OptimizerConfig::default()
            };
            let (state, report) = optimize(&model, start.clone(), &config).unwrap();
            let (_, l) = unpack(&state, landmarks.len()).unwrap();
            (l[0].distance(&landmarks[0]), report)
        };

        let (linear_error, _) = error_with(LossKind::Linear);
        let (cauchy_error, cauchy_report) = error_with(LossKind::Cauchy);
        assert!(cauchy_error < linear_error);
        assert!(cauchy_report.outliers >= 1);
    }
}
