//! Measurement noise model
//!
//! Turns scalar variance parameters plus a realized measurement into the
//! information matrix (inverse covariance) attached to each constraint.
//!
//! Relative measurements (odometry, landmark observations) use an
//! anisotropic covariance whose size grows with the measured distance:
//!
//! ```text
//! Σ = R(a) · diag(σ_d · d, sin(σ_θ) · d) · R(a)ᵀ
//! ```
//!
//! where `d` is the displacement and `a` the direction the uncertainty
//! ellipse is aligned with. Odometry adds a heading variance of
//! `σ_θ1 + σ_θ2` (turn before and turn after the translation). Absolute
//! priors (GPS, GIS) are isotropic.

use crate::error::{Result, SlamError};
use crate::slam::constraints::ConstraintKind;
use crate::slam::geometry::{Point2D, Pose2D};
use nalgebra::{Matrix2, Matrix3};
use serde::{Deserialize, Serialize};

/// Noise parameters for every constraint kind
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoiseModel {
    /// Odometry variance per unit of travelled distance, along the heading
    pub odometry_distance: f64,
    /// Odometry angular noise before the translation (radians)
    pub odometry_theta1: f64,
    /// Odometry angular noise after the translation (radians)
    pub odometry_theta2: f64,
    /// Landmark variance per unit of range, along the line of sight
    pub landmark_distance: f64,
    /// Landmark bearing noise (radians)
    pub landmark_theta: f64,
    /// Isotropic variance of absolute position fixes
    pub gps: f64,
    /// Isotropic variance of landmark priors
    pub gis: f64,
    /// Lower bound applied to each distance-scaled variance.
    /// Zero keeps zero-displacement measurements singular, which is rejected.
    pub variance_floor: f64,
}

impl Default for NoiseModel {
    fn default() -> Self {
        Self {
            odometry_distance: 0.05,
            odometry_theta1: 0.02,
            odometry_theta2: 0.02,
            landmark_distance: 0.05,
            landmark_theta: 0.02,
            gps: 1.0,
            gis: 1.0,
            variance_floor: 0.0,
        }
    }
}

fn positive(name: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(SlamError::InvalidNoiseParameter { name, value })
    }
}

fn angular(name: &'static str, value: f64) -> Result<()> {
    positive(name, value)?;
    if value.sin() > 0.0 {
        Ok(())
    } else {
        Err(SlamError::InvalidNoiseParameter { name, value })
    }
}

impl NoiseModel {
    /// Check that every parameter yields a usable covariance.
    pub fn validate(&self) -> Result<()> {
        positive("odometry_distance", self.odometry_distance)?;
        angular("odometry_theta1", self.odometry_theta1)?;
        if !self.odometry_theta2.is_finite() || self.odometry_theta2 < 0.0 {
            return Err(SlamError::InvalidNoiseParameter {
                name: "odometry_theta2",
                value: self.odometry_theta2,
            });
        }
        positive("landmark_distance", self.landmark_distance)?;
        angular("landmark_theta", self.landmark_theta)?;
        positive("gps", self.gps)?;
        positive("gis", self.gis)?;
        if !self.variance_floor.is_finite() || self.variance_floor < 0.0 {
            return Err(SlamError::InvalidNoiseParameter {
                name: "variance_floor",
                value: self.variance_floor,
            });
        }
        Ok(())
    }

    /// Information matrix of an odometry step.
    ///
    /// `heading` is the heading of the pose reached by the step.
    pub fn odometry_information(&self, odometry: &Pose2D, heading: f64) -> Result<Matrix3<f64>> {
        let d = odometry.translation_norm();
        let planar = self
            .anisotropic(self.odometry_distance * d, self.odometry_theta1.sin() * d, heading)
            .ok_or(SlamError::SingularCovariance {
                kind: ConstraintKind::Odometry,
                distance: d,
            })?;

        let mut covariance = Matrix3::zeros();
        covariance.fixed_view_mut::<2, 2>(0, 0).copy_from(&planar);
        covariance[(2, 2)] = self.odometry_theta1 + self.odometry_theta2;

        invert_spd3(&covariance).ok_or(SlamError::SingularCovariance {
            kind: ConstraintKind::Odometry,
            distance: d,
        })
    }

    /// Information matrix of a landmark observation.
    ///
    /// The ellipse is aligned with the global line of sight, i.e. the
    /// observation bearing plus the observing pose's `heading`.
    pub fn landmark_information(&self, observation: &Point2D, heading: f64) -> Result<Matrix2<f64>> {
        let d = observation.norm();
        let singular = SlamError::SingularCovariance {
            kind: ConstraintKind::Landmark,
            distance: d,
        };
        let covariance = self
            .anisotropic(
                self.landmark_distance * d,
                self.landmark_theta.sin() * d,
                observation.bearing() + heading,
            )
            .ok_or_else(|| singular.clone())?;

        invert_spd2(&covariance).ok_or(singular)
    }

    /// Information matrix of an absolute position fix.
    pub fn gps_information(&self) -> Matrix2<f64> {
        Matrix2::identity() / self.gps
    }

    /// Information matrix of a landmark prior.
    pub fn gis_information(&self) -> Matrix2<f64> {
        Matrix2::identity() / self.gis
    }

    /// Rotate `diag(along, across)` by `angle`; `None` if a variance vanishes.
    fn anisotropic(&self, along: f64, across: f64, angle: f64) -> Option<Matrix2<f64>> {
        let along = along.max(self.variance_floor);
        let across = across.max(self.variance_floor);
        if !(along > 0.0 && across > 0.0) {
            return None;
        }

        let (s, c) = angle.sin_cos();
        let rotation = Matrix2::new(c, -s, s, c);
        Some(rotation * Matrix2::new(along, 0.0, 0.0, across) * rotation.transpose())
    }
}

fn invert_spd2(covariance: &Matrix2<f64>) -> Option<Matrix2<f64>> {
    let inverse = covariance.cholesky()?.inverse();
    let symmetric = (inverse + inverse.transpose()) * 0.5;
    symmetric.iter().all(|v| v.is_finite()).then_some(symmetric)
}

fn invert_spd3(covariance: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let inverse = covariance.cholesky()?.inverse();
    let symmetric = (inverse + inverse.transpose()) * 0.5;
    symmetric.iter().all(|v| v.is_finite()).then_some(symmetric)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use quickcheck::TestResult;
    use quickcheck_macros::quickcheck;
    use rstest::rstest;

    fn is_spd2(m: &Matrix2<f64>) -> bool {
        (m - m.transpose()).norm() < 1e-9 * m.norm()
            && m.symmetric_eigenvalues().iter().all(|&e| e > 0.0)
    }

    fn is_spd3(m: &Matrix3<f64>) -> bool {
        (m - m.transpose()).norm() < 1e-9 * m.norm()
            && m.symmetric_eigenvalues().iter().all(|&e| e > 0.0)
    }

    #[test]
    fn test_default_is_valid() {
        assert!(NoiseModel::default().validate().is_ok());
    }

    #[rstest]
    #[case::zero_distance(NoiseModel { odometry_distance: 0.0, ..NoiseModel::default() }, "odometry_distance")]
    #[case::negative_gps(NoiseModel { gps: -1.0, ..NoiseModel::default() }, "gps")]
    #[case::nan_gis(NoiseModel { gis: f64::NAN, ..NoiseModel::default() }, "gis")]
    #[case::angle_beyond_pi(NoiseModel { landmark_theta: 4.0, ..NoiseModel::default() }, "landmark_theta")]
    #[case::negative_turn_after(NoiseModel { odometry_theta2: -0.01, ..NoiseModel::default() }, "odometry_theta2")]
    #[case::negative_floor(NoiseModel { variance_floor: -0.1, ..NoiseModel::default() }, "variance_floor")]
    fn test_invalid_parameter(#[case] model: NoiseModel, #[case] expected: &str) {
        match model.validate() {
            Err(SlamError::InvalidNoiseParameter { name, .. }) => assert_eq!(name, expected),
            other => panic!("expected invalid `{expected}`, got {other:?}"),
        }
    }

    #[test]
    fn test_odometry_information_axis_aligned() {
        let model = NoiseModel::default();
        let info = model
            .odometry_information(&Pose2D::new(2.0, 0.0, 0.0), 0.0)
            .unwrap();

        assert_relative_eq!(info[(0, 0)], 1.0 / (0.05 * 2.0), max_relative = 1e-12);
        assert_relative_eq!(info[(1, 1)], 1.0 / (0.02f64.sin() * 2.0), max_relative = 1e-12);
        assert_relative_eq!(info[(2, 2)], 1.0 / 0.04, max_relative = 1e-12);
        assert!(info[(0, 1)].abs() < 1e-9);
        assert!(info[(0, 2)].abs() < 1e-12);
    }

    #[test]
    fn test_odometry_information_rotates_with_heading() {
        let model = NoiseModel::default();
        let step = Pose2D::new(2.0, 0.0, 0.0);
        let info = model
            .odometry_information(&step, std::f64::consts::FRAC_PI_2)
            .unwrap();

        // Along-track variance is now on the y axis
        assert_relative_eq!(info[(1, 1)], 1.0 / (0.05 * 2.0), max_relative = 1e-9);
        assert_relative_eq!(info[(0, 0)], 1.0 / (0.02f64.sin() * 2.0), max_relative = 1e-9);
    }

    #[test]
    fn test_zero_displacement_is_singular() {
        let model = NoiseModel::default();
        assert_eq!(
            model.odometry_information(&Pose2D::new(0.0, 0.0, 0.3), 0.0),
            Err(SlamError::SingularCovariance {
                kind: ConstraintKind::Odometry,
                distance: 0.0
            })
        );
        assert!(matches!(
            model.landmark_information(&Point2D::origin(), 0.0),
            Err(SlamError::SingularCovariance {
                kind: ConstraintKind::Landmark,
                ..
            })
        ));
    }

    #[test]
    fn test_variance_floor_regularizes_zero_displacement() {
        let model = NoiseModel {
            variance_floor: 1e-3,
            ..NoiseModel::default()
        };
        let info = model
            .odometry_information(&Pose2D::new(0.0, 0.0, 0.3), 1.0)
            .unwrap();
        assert!(is_spd3(&info));
        assert_relative_eq!(info[(0, 0)], 1e3, max_relative = 1e-9);
    }

    #[test]
    fn test_priors_are_isotropic() {
        let model = NoiseModel {
            gps: 4.0,
            gis: 0.5,
            ..NoiseModel::default()
        };
        assert_eq!(model.gps_information(), Matrix2::identity() * 0.25);
        assert_eq!(model.gis_information(), Matrix2::identity() * 2.0);
    }

    #[quickcheck]
    fn prop_information_is_spd(x: i16, y: i16, theta: i16, heading: i16) -> TestResult {
        // Centimetres and milliradians
        let (x, y) = (f64::from(x) / 100.0, f64::from(y) / 100.0);
        let (theta, heading) = (f64::from(theta) / 1000.0, f64::from(heading) / 1000.0);
        if x == 0.0 && y == 0.0 {
            return TestResult::discard();
        }
        let model = NoiseModel::default();
        let odom = model.odometry_information(&Pose2D::new(x, y, theta), heading);
        let lm = model.landmark_information(&Point2D::new(x, y), heading);

        match (odom, lm) {
            (Ok(odom), Ok(lm)) => TestResult::from_bool(is_spd3(&odom) && is_spd2(&lm)),
            _ => TestResult::failed(),
        }
    }

    #[rstest]
    #[case(0.01, 0.0, 0.0)]
    #[case(0.0, 0.01, 1.0)]
    #[case(-3.0, 4.0, -2.5)]
    #[case(250.0, -120.0, 31.0)]
    fn test_information_is_spd_on_grid(#[case] x: f64, #[case] y: f64, #[case] heading: f64) {
        let model = NoiseModel::default();
        let odom = model
            .odometry_information(&Pose2D::new(x, y, 0.3), heading)
            .unwrap();
        let lm = model.landmark_information(&Point2D::new(x, y), heading).unwrap();
        assert!(is_spd3(&odom), "{odom}");
        assert!(is_spd2(&lm), "{lm}");
    }

    #[test]
    fn test_zero_turn_after_is_valid() {
        let model = NoiseModel {
            odometry_theta2: 0.0,
            ..NoiseModel::default()
        };
        assert!(model.validate().is_ok());
        let info = model
            .odometry_information(&Pose2D::new(1.0, 0.0, 0.0), 0.0)
            .unwrap();
        assert_relative_eq!(info[(2, 2)], 1.0 / 0.02, max_relative = 1e-12);
    }
}
