//! Graph-based 2D landmark SLAM
//!
//! Feed one step of odometry, landmark observations and an optional
//! position fix at a time with [`Slam::add_constraints`], then call
//! [`Slam::optimize`] to re-solve the full pose graph.
//!
//! ```no_run
//! use landmark_slam::prelude::*;
//!
//! let mut slam = Slam::new(Pose2D::origin(), 1, NoiseModel::default(), &[])?;
//! slam.add_constraints(Pose2D::new(1.0, 0.0, 0.0), &[(0, Point2D::new(1.0, 1.0))], None)?;
//! let report = slam.optimize(&OptimizerConfig::default())?;
//! println!("{}: {:?}", report.status, slam.landmark(0));
//! # Ok::<(), SlamError>(())
//! ```

pub mod error;
pub mod slam;

pub mod prelude {
    pub use crate::error::{Result, SlamError};
    pub use crate::slam::{
        ConstraintKind, JacobianMode, LinearSolverKind, LossKind, NoiseModel,
        OptimizationReport, OptimizerConfig, Point2D, Pose2D, Slam, SolverStatus,
        SparsityPattern, SparsityStats,
    };
    pub use nalgebra;
}

pub use prelude::*;
