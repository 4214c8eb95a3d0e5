//! Data handed to the robust estimators and the residuals used to score them.

use cv_core::nalgebra::{Point3, Unit, Vector3};
use cv_core::sample_consensus::Model;
use cv_core::{CameraToCamera, Pose, WorldToCamera};

/// Bearings of the same track in two cameras.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BearingMatch(pub Unit<Vector3<f64>>, pub Unit<Vector3<f64>>);

/// The bearing of a track in a camera and its triangulated world point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BearingWorldMatch(pub Unit<Vector3<f64>>, pub Point3<f64>);

impl Model<BearingMatch> for CameraToCamera {
    /// The epipolar error `|b^T [t]x R a|` with a unit baseline.
    ///
    /// Without a baseline only the rotation can be checked, so this becomes the cosine distance between
    /// `b` and the rotated `a`.
    fn residual(&self, &BearingMatch(a, b): &BearingMatch) -> f64 {
        let isometry = self.isometry();
        let translation = isometry.translation.vector;
        let rotated = isometry.rotation * a.into_inner();
        let baseline = translation.norm();
        if baseline == 0.0 {
            1.0 - b.dot(&rotated)
        } else {
            b.dot(&(translation / baseline).cross(&rotated)).abs()
        }
    }
}

impl Model<BearingWorldMatch> for WorldToCamera {
    /// The cosine distance between the observed bearing and the direction to the point.
    fn residual(&self, &BearingWorldMatch(bearing, point): &BearingWorldMatch) -> f64 {
        let camera_point = self.isometry() * point;
        1.0 - bearing.dot(&camera_point.coords.normalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_core::nalgebra::{IsometryMatrix3, Rotation3, Translation3};

    #[test]
    fn epipolar_residual_vanishes_on_true_pose() {
        let pose = CameraToCamera(IsometryMatrix3::from_parts(
            Translation3::new(-1.0, 0.2, 0.1),
            Rotation3::from_euler_angles(0.05, -0.1, 0.02),
        ));
        let point_a = Point3::new(0.3, -0.4, 5.0);
        let point_b = pose.isometry() * point_a;
        let data = BearingMatch(
            Unit::new_normalize(point_a.coords),
            Unit::new_normalize(point_b.coords),
        );
        assert!(pose.residual(&data) < 1e-12);

        let wrong = BearingMatch(data.0, Unit::new_normalize(Vector3::new(0.4, 0.0, 1.0)));
        assert!(pose.residual(&wrong) > 1e-3);
    }

    #[test]
    fn world_residual_penalizes_points_behind() {
        let pose = WorldToCamera(IsometryMatrix3::identity());
        let bearing = Unit::new_normalize(Vector3::new(0.0, 0.0, 1.0));
        assert!(pose.residual(&BearingWorldMatch(bearing, Point3::new(0.0, 0.0, 3.0))) < 1e-12);
        assert!(
            (pose.residual(&BearingWorldMatch(bearing, Point3::new(0.0, 0.0, -3.0))) - 2.0).abs()
                < 1e-12
        );
    }
}
