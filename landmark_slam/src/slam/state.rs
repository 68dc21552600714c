//! Flat state vector layout
//!
//! The optimizer works on one dense vector:
//!
//! ```text
//! [x0, y0, θ0, x1, y1, θ1, ..., x(N-1), y(N-1), θ(N-1), lx0, ly0, ..., lx(M-1), ly(M-1)]
//! ```
//!
//! Landmarks that have never been observed still occupy their two slots and
//! are packed as `(0, 0)`.

use crate::error::{Result, SlamError};
use crate::slam::geometry::{Point2D, Pose2D};
use nalgebra::DVector;

/// Column of pose `index`'s x entry
pub fn pose_offset(index: usize) -> usize {
    index * 3
}

/// Column of landmark `index`'s x entry in a graph of `pose_count` poses
pub fn landmark_offset(pose_count: usize, index: usize) -> usize {
    pose_count * 3 + index * 2
}

/// Length of the state vector for the given graph size
pub fn state_len(pose_count: usize, landmark_count: usize) -> usize {
    pose_count * 3 + landmark_count * 2
}

/// Concatenate poses then landmarks into one vector.
pub fn pack(trajectory: &[Pose2D], landmarks: &[Point2D]) -> DVector<f64> {
    let mut state = DVector::zeros(state_len(trajectory.len(), landmarks.len()));
    let mut idx = 0;

    for pose in trajectory {
        state[idx] = pose.x;
        state[idx + 1] = pose.y;
        state[idx + 2] = pose.theta;
        idx += 3;
    }

    for lm in landmarks {
        state[idx] = lm.x;
        state[idx + 1] = lm.y;
        idx += 2;
    }

    state
}

/// Pack a landmark map whose unobserved slots are `None`.
pub fn pack_map(trajectory: &[Pose2D], landmarks: &[Option<Point2D>]) -> DVector<f64> {
    pack(trajectory, &placeholder_positions(landmarks))
}

/// Resolve every slot to a concrete position, `(0, 0)` for unobserved ones
pub fn placeholder_positions(landmarks: &[Option<Point2D>]) -> Vec<Point2D> {
    landmarks
        .iter()
        .map(|lm| lm.unwrap_or_else(Point2D::origin))
        .collect()
}

/// Split a state vector back into poses and landmarks.
///
/// The pose count is inferred from the vector length and `landmark_count`.
pub fn unpack(state: &DVector<f64>, landmark_count: usize) -> Result<(Vec<Pose2D>, Vec<Point2D>)> {
    let pose_count = pose_count(state.len(), landmark_count)?;

    let trajectory = (0..pose_count)
        .map(|i| {
            let p = pose_offset(i);
            Pose2D::new(state[p], state[p + 1], state[p + 2])
        })
        .collect();

    let landmarks = (0..landmark_count)
        .map(|j| {
            let l = landmark_offset(pose_count, j);
            Point2D::new(state[l], state[l + 1])
        })
        .collect();

    Ok((trajectory, landmarks))
}

/// Number of poses held by a state vector of length `len`
pub fn pose_count(len: usize, landmark_count: usize) -> Result<usize> {
    let invalid = SlamError::StateLength {
        len,
        landmark_count,
    };
    let pose_entries = len.checked_sub(landmark_count * 2).ok_or(invalid.clone())?;
    if pose_entries % 3 != 0 {
        return Err(invalid);
    }
    Ok(pose_entries / 3)
}
