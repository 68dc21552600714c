pub mod constraints;
pub mod geometry;
pub mod graph_slam;
pub mod noise;
pub mod optimizer;
pub mod residual;
pub mod robust_kernels;
pub mod sparse_solver;
pub mod sparsity;
pub mod state;

pub use constraints::*;
pub use geometry::*;
pub use graph_slam::*;
pub use noise::*;
pub use optimizer::{JacobianMode, OptimizationReport, OptimizerConfig, SolverStatus};
pub use residual::*;
pub use robust_kernels::*;
pub use sparse_solver::*;
pub use sparsity::*;
