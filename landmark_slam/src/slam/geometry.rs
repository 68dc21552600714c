//! Planar geometric primitives
//!
//! [`Point2D`] and [`Pose2D`] are plain `Copy` values in a local planar frame.
//! Both support rigid-body composition against a pose:
//!
//! - `absolute(frame)` takes a value expressed in `frame`'s local coordinates
//!   and returns it in the global frame
//! - `relative(frame)` is the inverse, expressing a global value in `frame`
//!
//! Headings are kept exactly as composed; they are never wrapped into
//! `[-π, π]`. Equality is exact floating-point comparison.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

/// A position (x, y)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point2D {
    pub x: f64,
    pub y: f64,
}

impl Point2D {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub const fn origin() -> Self {
        Self::new(0.0, 0.0)
    }

    /// Point at distance `range` along direction `bearing`
    pub fn from_polar(bearing: f64, range: f64) -> Self {
        Self::new(bearing.cos() * range, bearing.sin() * range)
    }

    /// Euclidean distance from the frame origin
    pub fn norm(&self) -> f64 {
        self.x.hypot(self.y)
    }

    /// Direction of the point seen from the frame origin
    pub fn bearing(&self) -> f64 {
        self.y.atan2(self.x)
    }

    pub fn distance(&self, other: &Point2D) -> f64 {
        (*self - *other).norm()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    /// Express this global point in the local frame of `pose`.
    pub fn relative(&self, pose: &Pose2D) -> Point2D {
        let dx = self.x - pose.x;
        let dy = self.y - pose.y;
        let (s, c) = pose.theta.sin_cos();
        Point2D::new(c * dx + s * dy, -s * dx + c * dy)
    }

    /// Express this point, given in the local frame of `pose`, globally.
    pub fn absolute(&self, pose: &Pose2D) -> Point2D {
        let (s, c) = pose.theta.sin_cos();
        Point2D::new(
            c * self.x - s * self.y + pose.x,
            s * self.x + c * self.y + pose.y,
        )
    }
}

impl Add for Point2D {
    type Output = Point2D;

    fn add(self, rhs: Point2D) -> Point2D {
        Point2D::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Point2D {
    type Output = Point2D;

    fn sub(self, rhs: Point2D) -> Point2D {
        Point2D::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl fmt::Display for Point2D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3})", self.x, self.y)
    }
}

/// A robot pose (x, y, theta), theta in radians
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose2D {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}

impl Pose2D {
    pub const fn new(x: f64, y: f64, theta: f64) -> Self {
        Self { x, y, theta }
    }

    pub const fn origin() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn position(&self) -> Point2D {
        Point2D::new(self.x, self.y)
    }

    /// Length of the translational part
    pub fn translation_norm(&self) -> f64 {
        self.x.hypot(self.y)
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.theta.is_finite()
    }

    /// Express this global pose in the local frame of `other`.
    pub fn relative(&self, other: &Pose2D) -> Pose2D {
        let local = self.position().relative(other);
        Pose2D::new(local.x, local.y, self.theta - other.theta)
    }

    /// Express this pose, given in the local frame of `other`, globally.
    pub fn absolute(&self, other: &Pose2D) -> Pose2D {
        let global = self.position().absolute(other);
        Pose2D::new(global.x, global.y, other.theta + self.theta)
    }
}

/// Component-wise difference, heading included and left unwrapped
impl Sub for Pose2D {
    type Output = Pose2D;

    fn sub(self, rhs: Pose2D) -> Pose2D {
        Pose2D::new(self.x - rhs.x, self.y - rhs.y, self.theta - rhs.theta)
    }
}

impl fmt::Display for Pose2D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:.3}, {:.3}, {:.1}°)",
            self.x,
            self.y,
            self.theta.to_degrees()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use quickcheck_macros::quickcheck;
    use std::f64::consts::FRAC_PI_2;

    /// Centimetre grid over ±327 m
    fn metres(v: i16) -> f64 {
        f64::from(v) / 100.0
    }

    /// Milliradian grid over ±32 rad, beyond a single turn on purpose
    fn radians(v: i16) -> f64 {
        f64::from(v) / 1000.0
    }

    fn pose(v: (i16, i16, i16)) -> Pose2D {
        Pose2D::new(metres(v.0), metres(v.1), radians(v.2))
    }

    #[test]
    fn test_point_absolute_rotates_then_translates() {
        let pose = Pose2D::new(5.0, 3.0, FRAC_PI_2);
        let p = Point2D::new(1.0, 0.0).absolute(&pose);
        assert_abs_diff_eq!(p.x, 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(p.y, 4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_pose_composition() {
        let a = Pose2D::new(5.0, 3.0, FRAC_PI_2);
        let b = Pose2D::new(8.0, 1.0, 0.0);

        let b_in_a = b.relative(&a);
        assert_abs_diff_eq!(b_in_a.x, -2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(b_in_a.y, -3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(b_in_a.theta, -FRAC_PI_2, epsilon = 1e-12);

        let back = b_in_a.absolute(&a);
        assert_abs_diff_eq!(back.x, b.x, epsilon = 1e-12);
        assert_abs_diff_eq!(back.y, b.y, epsilon = 1e-12);
        assert_abs_diff_eq!(back.theta, b.theta, epsilon = 1e-12);
    }

    #[test]
    fn test_heading_is_not_wrapped() {
        let step = Pose2D::new(0.0, 0.0, 3.0);
        let mut pose = Pose2D::origin();
        for _ in 0..4 {
            pose = step.absolute(&pose);
        }
        assert_eq!(pose.theta, 12.0);
    }

    #[test]
    fn test_polar() {
        let p = Point2D::from_polar(FRAC_PI_2, 2.0);
        assert_abs_diff_eq!(p.x, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(p.y, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(p.bearing(), FRAC_PI_2, epsilon = 1e-12);
        assert_abs_diff_eq!(p.norm(), 2.0, epsilon = 1e-12);
    }

    #[quickcheck]
    fn prop_pose_relative_absolute_inverse(b: (i16, i16, i16), a: (i16, i16, i16)) -> bool {
        let a = pose(a);
        let b = pose(b);
        let back = b.relative(&a).absolute(&a);

        let tol = 1e-9 * (1.0 + a.translation_norm() + b.translation_norm());
        (back.x - b.x).abs() < tol
            && (back.y - b.y).abs() < tol
            && (back.theta - b.theta).abs() < 1e-12 * (1.0 + a.theta.abs() + b.theta.abs())
    }

    #[quickcheck]
    fn prop_point_relative_absolute_inverse(p: (i16, i16), a: (i16, i16, i16)) -> bool {
        let a = pose(a);
        let p = Point2D::new(metres(p.0), metres(p.1));
        let back = p.relative(&a).absolute(&a);

        back.distance(&p) < 1e-9 * (1.0 + a.translation_norm() + p.norm())
    }

    #[test]
    fn test_inverse_law_on_grid() {
        let samples = [
            Pose2D::new(0.0, 0.0, 0.0),
            Pose2D::new(-250.5, 13.25, 7.0),
            Pose2D::new(3.0, -4.0, -FRAC_PI_2),
            Pose2D::new(1e-3, 1e3, 30.0),
        ];
        for a in &samples {
            for b in &samples {
                let back = b.relative(a).absolute(a);
                assert_abs_diff_eq!(back.x, b.x, epsilon = 1e-9);
                assert_abs_diff_eq!(back.y, b.y, epsilon = 1e-9);
                assert_abs_diff_eq!(back.theta, b.theta, epsilon = 1e-12);
            }
        }
    }
}
