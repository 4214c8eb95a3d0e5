use crate::Intrinsics;
use cv_core::nalgebra::{Point2, Point3, Unit, Vector3};
use cv_core::{Pose, WorldToCamera};
use itertools::Itertools;
use std::collections::BTreeMap;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

pub type ViewId = usize;
pub type IntrinsicsId = usize;
/// Index of a feature within the feature list of its view.
pub type FeatureId = usize;
pub type TrackId = usize;

/// Two distinct views, smallest id first.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "serde-serialize",
    derive(Serialize, Deserialize),
    serde(from = "(ViewId, ViewId)", into = "(ViewId, ViewId)")
)]
pub struct Pair(ViewId, ViewId);

impl Pair {
    /// Creates a new pair, cannonicalizing the order of the pair.
    pub fn new(a: ViewId, b: ViewId) -> Self {
        Self(std::cmp::min(a, b), std::cmp::max(a, b))
    }

    pub fn first(&self) -> ViewId {
        self.0
    }

    pub fn second(&self) -> ViewId {
        self.1
    }

    pub fn contains(&self, view: ViewId) -> bool {
        self.0 == view || self.1 == view
    }
}

impl From<(ViewId, ViewId)> for Pair {
    fn from((a, b): (ViewId, ViewId)) -> Self {
        Self::new(a, b)
    }
}

impl From<Pair> for (ViewId, ViewId) {
    fn from(pair: Pair) -> Self {
        (pair.0, pair.1)
    }
}

/// A detected keypoint in pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Feature {
    pub point: Point2<f64>,
    pub color: [u8; 3],
}

impl Feature {
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            point: Point2::new(x, y),
            color: [255, 255, 255],
        }
    }

    pub fn color(self, color: [u8; 3]) -> Self {
        Self { color, ..self }
    }
}

/// The features detected in every view, indexed by [`FeatureId`].
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct FeaturesPerView {
    features: BTreeMap<ViewId, Vec<Feature>>,
}

impl FeaturesPerView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, view: ViewId, features: Vec<Feature>) {
        self.features.insert(view, features);
    }

    /// All features of a view, or an empty slice for a view without features.
    pub fn view(&self, view: ViewId) -> &[Feature] {
        self.features.get(&view).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn feature(&self, view: ViewId, feature: FeatureId) -> Option<&Feature> {
        self.features.get(&view)?.get(feature)
    }

    pub fn views(&self) -> impl Iterator<Item = ViewId> + '_ {
        self.features.keys().copied()
    }
}

/// An input image.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct View {
    pub intrinsics: IntrinsicsId,
    pub width: u32,
    pub height: u32,
    /// Set once the view has been resected into the reconstruction.
    pub pose: Option<WorldToCamera>,
}

impl View {
    pub fn new(intrinsics: IntrinsicsId, width: u32, height: u32) -> Self {
        Self {
            intrinsics,
            width,
            height,
            pose: None,
        }
    }
}

/// A triangulated 3d point and the features that observe it.
///
/// A landmark is keyed by the track it was triangulated from.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Landmark {
    pub point: Point3<f64>,
    pub color: [u8; 3],
    /// Maps every observing view to the feature that observes this landmark in it.
    pub observations: BTreeMap<ViewId, FeatureId>,
}

/// The reconstruction being built: views, camera groups, and structure.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Scene {
    pub views: BTreeMap<ViewId, View>,
    pub intrinsics: BTreeMap<IntrinsicsId, Intrinsics>,
    pub landmarks: BTreeMap<TrackId, Landmark>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_intrinsics(&mut self, id: IntrinsicsId, intrinsics: Intrinsics) {
        self.intrinsics.insert(id, intrinsics);
    }

    pub fn add_view(&mut self, id: ViewId, view: View) {
        self.views.insert(id, view);
    }

    pub fn view_intrinsics(&self, view: ViewId) -> Option<&Intrinsics> {
        self.intrinsics.get(&self.views.get(&view)?.intrinsics)
    }

    pub fn pose(&self, view: ViewId) -> Option<WorldToCamera> {
        self.views.get(&view)?.pose
    }

    /// Views that currently hold a pose.
    pub fn posed_views(&self) -> impl Iterator<Item = ViewId> + '_ {
        self.views
            .iter()
            .filter(|(_, view)| view.pose.is_some())
            .map(|(&id, _)| id)
    }

    /// The calibrated bearing of a feature in its camera frame.
    pub fn bearing(
        &self,
        features: &FeaturesPerView,
        view: ViewId,
        feature: FeatureId,
    ) -> Option<Unit<Vector3<f64>>> {
        let intrinsics = self.view_intrinsics(view)?;
        Some(intrinsics.calibrate(features.feature(view, feature)?.point))
    }

    /// Pixel distance between an observation and the projection of `point` into its view.
    ///
    /// Returns `None` when the view has no pose or the point lies behind the camera.
    pub fn reprojection_error(
        &self,
        features: &FeaturesPerView,
        view: ViewId,
        feature: FeatureId,
        point: &Point3<f64>,
    ) -> Option<f64> {
        let pose = self.pose(view)?;
        let observed = features.feature(view, feature)?.point;
        let projected = self
            .view_intrinsics(view)?
            .project(&(pose.isometry() * point))?;
        Some((projected - observed).norm())
    }

    /// The widest angle, in degrees, between rays from the observing cameras to the landmark.
    pub fn landmark_max_angle(&self, landmark: &Landmark) -> f64 {
        let centers: Vec<Point3<f64>> = landmark
            .observations
            .keys()
            .filter_map(|&view| self.pose(view))
            .map(optical_center)
            .collect();
        max_ray_angle(&centers, &landmark.point)
    }
}

/// The position of the camera in world coordinates.
pub fn optical_center(pose: WorldToCamera) -> Point3<f64> {
    pose.isometry().inverse() * Point3::origin()
}

/// The angle in degrees between the rays from `a` and `b` to `point`.
pub fn ray_angle(a: &Point3<f64>, b: &Point3<f64>, point: &Point3<f64>) -> f64 {
    let ray_a = point - a;
    let ray_b = point - b;
    let cosine = ray_a.dot(&ray_b) / (ray_a.norm() * ray_b.norm());
    if cosine.is_finite() {
        cosine.clamp(-1.0, 1.0).acos().to_degrees()
    } else {
        0.0
    }
}

/// The largest [`ray_angle`] over every pair of camera centers.
pub fn max_ray_angle(centers: &[Point3<f64>], point: &Point3<f64>) -> f64 {
    centers
        .iter()
        .tuple_combinations()
        .map(|(a, b)| ray_angle(a, b, point))
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CameraModelKind;
    use cv_core::nalgebra::{IsometryMatrix3, Rotation3, Translation3};

    #[test]
    fn pair_is_canonical() {
        assert_eq!(Pair::new(7, 3), Pair::new(3, 7));
        assert_eq!(Pair::new(7, 3).first(), 3);
        assert!(Pair::new(7, 3).contains(7));
    }

    #[test]
    fn reprojection_error_uses_pose_and_intrinsics() {
        let mut scene = Scene::new();
        scene.add_intrinsics(
            0,
            Intrinsics::new(CameraModelKind::Pinhole, 100.0, Point2::new(50.0, 50.0)),
        );
        let mut view = View::new(0, 100, 100);
        // Camera one unit along +x looking down +z.
        view.pose = Some(WorldToCamera(IsometryMatrix3::from_parts(
            Translation3::new(-1.0, 0.0, 0.0),
            Rotation3::identity(),
        )));
        scene.add_view(0, view);
        let mut features = FeaturesPerView::new();
        features.insert(0, vec![Feature::new(50.0, 50.0), Feature::new(53.0, 54.0)]);

        let point = Point3::new(1.0, 0.0, 4.0);
        assert!(scene.reprojection_error(&features, 0, 0, &point).unwrap() < 1e-9);
        assert!((scene.reprojection_error(&features, 0, 1, &point).unwrap() - 5.0).abs() < 1e-9);
        assert!(scene
            .reprojection_error(&features, 0, 0, &Point3::new(1.0, 0.0, -4.0))
            .is_none());
        assert_eq!(optical_center(scene.pose(0).unwrap()), Point3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn ray_angles() {
        let point = Point3::new(0.0, 0.0, 1.0);
        let centers = [
            Point3::new(-1.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 0.0, 0.0),
        ];
        assert!((ray_angle(&centers[0], &centers[1], &point) - 90.0).abs() < 1e-9);
        assert!((max_ray_angle(&centers, &point) - 90.0).abs() < 1e-9);
        assert_eq!(max_ray_angle(&centers[..1], &point), 0.0);
    }
}
