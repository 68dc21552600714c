//! Graph-based landmark SLAM estimator
//!
//! The estimator owns the trajectory, the landmark map and every constraint
//! collected so far. Each time step goes through two calls:
//!
//! 1. [`Slam::add_constraints`] dead-reckons a new pose from the odometry,
//!    attaches information matrices to the new measurements and bootstraps
//!    any landmark seen for the first time from that sighting.
//! 2. [`Slam::optimize`] re-solves the whole graph from the current
//!    estimate and writes the result back.
//!
//! ## Anchoring
//! The first pose is the supplied origin and is never moved: it is pinned
//! on every residual evaluation, including the final write-back.
//!
//! ## Landmarks
//! Landmark identities are small integers fixed at construction. A slot
//! stays `None` until the landmark is observed or given a prior, and
//! optimization never touches an uninitialized slot.

use crate::error::{Result, SlamError};
use crate::slam::constraints::{
    ConstraintGraph, GisConstraint, GpsConstraint, LandmarkConstraint, OdometryConstraint,
};
use crate::slam::geometry::{Point2D, Pose2D};
use crate::slam::noise::NoiseModel;
use crate::slam::optimizer::{self, OptimizationReport, OptimizerConfig};
use crate::slam::residual::ResidualModel;
use crate::slam::sparsity::SparsityPattern;
use crate::slam::state::{pack_map, unpack};
use log::debug;

/// Graph SLAM state containing all nodes and edges
#[derive(Debug, Clone)]
pub struct Slam {
    origin: Pose2D,
    noise: NoiseModel,
    /// Robot poses, index 0 is the origin
    trajectory: Vec<Pose2D>,
    /// Landmark estimates, `None` until first observed
    landmarks: Vec<Option<Point2D>>,
    constraints: ConstraintGraph,
}

impl Slam {
    /// Create an estimator with `landmark_count` landmark slots.
    ///
    /// Each `(id, position)` in `priors` seeds that landmark's estimate and
    /// adds a GIS constraint on it.
    pub fn new(
        origin: Pose2D,
        landmark_count: usize,
        noise: NoiseModel,
        priors: &[(usize, Point2D)],
    ) -> Result<Self> {
        noise.validate()?;
        if !origin.is_finite() {
            return Err(SlamError::NonFiniteMeasurement { what: "origin" });
        }

        let mut slam = Self {
            origin,
            noise,
            trajectory: vec![origin],
            landmarks: vec![None; landmark_count],
            constraints: ConstraintGraph::new(),
        };

        for &(id, _) in priors {
            slam.check_landmark_id(id)?;
        }
        if priors.iter().any(|(_, p)| !p.is_finite()) {
            return Err(SlamError::NonFiniteMeasurement {
                what: "landmark prior",
            });
        }
        for &(id, position) in priors {
            slam.push_prior(id, position);
        }

        Ok(slam)
    }

    fn check_landmark_id(&self, id: usize) -> Result<()> {
        if id < self.landmarks.len() {
            Ok(())
        } else {
            Err(SlamError::LandmarkOutOfRange {
                id,
                count: self.landmarks.len(),
            })
        }
    }

    fn push_prior(&mut self, id: usize, position: Point2D) {
        if self.landmarks[id].is_none() {
            debug!("landmark {} initialized from prior at {}", id, position);
            self.landmarks[id] = Some(position);
        }
        self.constraints.push_gis(GisConstraint {
            landmark: id,
            position,
            information: self.noise.gis_information(),
        });
    }

    /// Record one time step.
    ///
    /// `odometry` is the motion since the last pose, expressed in that
    /// pose's frame. `observations` are `(landmark id, position relative to
    /// the new pose)`. `gps` is an absolute fix of the new pose's position.
    ///
    /// Every input is validated before anything is recorded: on error the
    /// estimator is left unchanged.
    pub fn add_constraints(
        &mut self,
        odometry: Pose2D,
        observations: &[(usize, Point2D)],
        gps: Option<Point2D>,
    ) -> Result<()> {
        if !odometry.is_finite() {
            return Err(SlamError::NonFiniteMeasurement { what: "odometry" });
        }
        let mut seen = vec![false; self.landmarks.len()];
        for &(id, z) in observations {
            self.check_landmark_id(id)?;
            if std::mem::replace(&mut seen[id], true) {
                return Err(SlamError::DuplicateObservation { id });
            }
            if !z.is_finite() {
                return Err(SlamError::NonFiniteMeasurement {
                    what: "landmark observation",
                });
            }
        }
        if gps.is_some_and(|p| !p.is_finite()) {
            return Err(SlamError::NonFiniteMeasurement { what: "gps" });
        }

        let from = self.trajectory.len() - 1;
        let pose = odometry.absolute(&self.trajectory[from]);
        let to = from + 1;

        let odometry_constraint = OdometryConstraint {
            from,
            measurement: odometry,
            information: self.noise.odometry_information(&odometry, pose.theta)?,
        };
        let landmark_constraints = observations
            .iter()
            .map(|&(landmark, measurement)| {
                Ok(LandmarkConstraint {
                    pose: to,
                    landmark,
                    measurement,
                    information: self.noise.landmark_information(&measurement, pose.theta)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let gps_constraint = gps.map(|position| GpsConstraint {
            pose: to,
            position,
            information: self.noise.gps_information(),
        });

        for &(id, z) in observations {
            if self.landmarks[id].is_none() {
                let position = z.absolute(&pose);
                debug!("landmark {} initialized at {} from pose {}", id, position, to);
                self.landmarks[id] = Some(position);
            }
        }
        self.trajectory.push(pose);
        self.constraints
            .push_step(odometry_constraint, landmark_constraints, gps_constraint);

        Ok(())
    }

    /// Add an absolute prior on landmark `id`.
    ///
    /// A landmark that was never observed is initialized at `position`.
    pub fn add_landmark_prior(&mut self, id: usize, position: Point2D) -> Result<()> {
        self.check_landmark_id(id)?;
        if !position.is_finite() {
            return Err(SlamError::NonFiniteMeasurement {
                what: "landmark prior",
            });
        }
        self.push_prior(id, position);
        Ok(())
    }

    /// Re-solve the whole graph and write the estimate back.
    ///
    /// A solver that stops without meeting a tolerance is not an error; the
    /// best iterate is kept and the report says why it stopped.
    pub fn optimize(&mut self, config: &OptimizerConfig) -> Result<OptimizationReport> {
        let model = self.model();
        let state = pack_map(&self.trajectory, &self.landmarks);
        let (state, report) = optimizer::optimize(&model, state, config)?;

        let (trajectory, estimates) = unpack(&state, self.landmarks.len())?;
        self.trajectory = trajectory;
        for (slot, estimate) in self.landmarks.iter_mut().zip(estimates) {
            if let Some(position) = slot {
                *position = estimate;
            }
        }

        Ok(report)
    }

    fn model(&self) -> ResidualModel<'_> {
        ResidualModel::new(self.origin, self.landmarks.len(), &self.constraints)
    }

    /// Sum of every weighted constraint term at the current estimate
    pub fn total_cost(&self) -> Result<f64> {
        self.model()
            .total_cost(&pack_map(&self.trajectory, &self.landmarks))
    }

    /// Jacobian sparsity pattern of the current graph
    pub fn sparsity(&self) -> SparsityPattern {
        self.model().sparsity()
    }

    pub fn trajectory(&self) -> &[Pose2D] {
        &self.trajectory
    }

    /// Every landmark slot, `None` for landmarks not yet initialized
    pub fn landmarks(&self) -> &[Option<Point2D>] {
        &self.landmarks
    }

    pub fn landmark(&self, id: usize) -> Option<Point2D> {
        self.landmarks.get(id).copied().flatten()
    }

    pub fn is_initialized(&self, id: usize) -> bool {
        self.landmark(id).is_some()
    }

    pub fn landmark_count(&self) -> usize {
        self.landmarks.len()
    }

    pub fn origin(&self) -> Pose2D {
        self.origin
    }

    pub fn noise(&self) -> &NoiseModel {
        &self.noise
    }

    pub fn constraints(&self) -> &ConstraintGraph {
        &self.constraints
    }
}
