//! Constraint store for the pose graph
//!
//! Four kinds of edges are recorded, all append-only:
//!
//! - **Odometry**: relative pose from pose `i` to pose `i + 1`
//! - **Landmark**: relative point from a pose to a landmark, grouped per step
//! - **GPS**: absolute position prior on one pose
//! - **GIS**: absolute position prior on one landmark
//!
//! [`ConstraintGraph::iter`] is the only way the residual function and the
//! sparsity builder see the edges. It always yields odometry, then landmark
//! observations in step order, then GPS, then GIS, so residual rows and
//! sparsity rows line up by construction.

use crate::slam::geometry::{Point2D, Pose2D};
use crate::slam::state::{landmark_offset, pose_offset};
use nalgebra::{Matrix2, Matrix3};
use std::fmt;

/// Tag of a constraint kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintKind {
    Odometry,
    Landmark,
    Gps,
    Gis,
}

impl ConstraintKind {
    /// Dimension of the measurement (and of its whitened residual block)
    pub fn dof(self) -> usize {
        match self {
            ConstraintKind::Odometry => 3,
            _ => 2,
        }
    }
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConstraintKind::Odometry => "odometry",
            ConstraintKind::Landmark => "landmark",
            ConstraintKind::Gps => "gps",
            ConstraintKind::Gis => "gis",
        };
        f.write_str(name)
    }
}

/// Odometry constraint between pose `from` and pose `from + 1`
#[derive(Debug, Clone, PartialEq)]
pub struct OdometryConstraint {
    /// Index of the first pose
    pub from: usize,
    /// Relative motion expressed in the first pose's frame
    pub measurement: Pose2D,
    /// Information matrix (inverse of covariance)
    pub information: Matrix3<f64>,
}

impl OdometryConstraint {
    /// Index of the second pose
    pub fn to(&self) -> usize {
        self.from + 1
    }
}

/// Observation of a landmark from a pose
#[derive(Debug, Clone, PartialEq)]
pub struct LandmarkConstraint {
    /// Index of the observing pose
    pub pose: usize,
    /// Landmark id
    pub landmark: usize,
    /// Landmark position in the observing pose's frame
    pub measurement: Point2D,
    /// Information matrix (inverse of covariance)
    pub information: Matrix2<f64>,
}

/// Absolute position fix on a pose
#[derive(Debug, Clone, PartialEq)]
pub struct GpsConstraint {
    pub pose: usize,
    pub position: Point2D,
    pub information: Matrix2<f64>,
}

/// Absolute position prior on a landmark
#[derive(Debug, Clone, PartialEq)]
pub struct GisConstraint {
    pub landmark: usize,
    pub position: Point2D,
    pub information: Matrix2<f64>,
}

/// A borrowed view of any constraint in the graph
#[derive(Debug, Clone, Copy)]
pub enum Constraint<'a> {
    Odometry(&'a OdometryConstraint),
    Landmark(&'a LandmarkConstraint),
    Gps(&'a GpsConstraint),
    Gis(&'a GisConstraint),
}

impl Constraint<'_> {
    pub fn kind(&self) -> ConstraintKind {
        match self {
            Constraint::Odometry(_) => ConstraintKind::Odometry,
            Constraint::Landmark(_) => ConstraintKind::Landmark,
            Constraint::Gps(_) => ConstraintKind::Gps,
            Constraint::Gis(_) => ConstraintKind::Gis,
        }
    }

    pub fn dof(&self) -> usize {
        self.kind().dof()
    }

    /// State entries this constraint depends on, for a graph of `pose_count` poses
    pub fn state_columns(&self, pose_count: usize) -> Vec<usize> {
        match self {
            Constraint::Odometry(c) => (pose_offset(c.from)..pose_offset(c.to()) + 3).collect(),
            Constraint::Landmark(c) => {
                let p = pose_offset(c.pose);
                let l = landmark_offset(pose_count, c.landmark);
                vec![p, p + 1, p + 2, l, l + 1]
            }
            Constraint::Gps(c) => {
                let p = pose_offset(c.pose);
                vec![p, p + 1]
            }
            Constraint::Gis(c) => {
                let l = landmark_offset(pose_count, c.landmark);
                vec![l, l + 1]
            }
        }
    }
}

/// Append-only store of every constraint added to the estimator
#[derive(Debug, Clone, Default)]
pub struct ConstraintGraph {
    odometry: Vec<OdometryConstraint>,
    /// One association list per step; step `k` observes from pose `k + 1`
    observations: Vec<Vec<LandmarkConstraint>>,
    gps: Vec<GpsConstraint>,
    gis: Vec<GisConstraint>,
}

impl ConstraintGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one time step: its odometry edge, observations and optional fix.
    pub fn push_step(
        &mut self,
        odometry: OdometryConstraint,
        observations: Vec<LandmarkConstraint>,
        gps: Option<GpsConstraint>,
    ) {
        debug_assert_eq!(odometry.from, self.odometry.len());
        self.odometry.push(odometry);
        self.observations.push(observations);
        self.gps.extend(gps);
    }

    pub fn push_gis(&mut self, prior: GisConstraint) {
        self.gis.push(prior);
    }

    /// Every constraint in residual order: odometry, landmark, GPS, GIS
    pub fn iter(&self) -> impl Iterator<Item = Constraint<'_>> + '_ {
        self.odometry
            .iter()
            .map(Constraint::Odometry)
            .chain(self.observations.iter().flatten().map(Constraint::Landmark))
            .chain(self.gps.iter().map(Constraint::Gps))
            .chain(self.gis.iter().map(Constraint::Gis))
    }

    /// Number of time steps recorded
    pub fn steps(&self) -> usize {
        self.odometry.len()
    }

    pub fn len(&self) -> usize {
        self.odometry.len()
            + self.observations.iter().map(Vec::len).sum::<usize>()
            + self.gps.len()
            + self.gis.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, kind: ConstraintKind) -> usize {
        match kind {
            ConstraintKind::Odometry => self.odometry.len(),
            ConstraintKind::Landmark => self.observations.iter().map(Vec::len).sum(),
            ConstraintKind::Gps => self.gps.len(),
            ConstraintKind::Gis => self.gis.len(),
        }
    }

    pub fn odometry(&self) -> &[OdometryConstraint] {
        &self.odometry
    }

    /// Observations recorded at step `step`, if that step exists
    pub fn observations(&self, step: usize) -> Option<&[LandmarkConstraint]> {
        self.observations.get(step).map(Vec::as_slice)
    }

    pub fn gps(&self) -> &[GpsConstraint] {
        &self.gps
    }

    pub fn gis(&self) -> &[GisConstraint] {
        &self.gis
    }
}
