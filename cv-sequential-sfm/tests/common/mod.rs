#![allow(dead_code)]

use cv_core::nalgebra::{IsometryMatrix3, Point2, Point3, Rotation3, Translation3, Vector3};
use cv_core::sample_consensus::{Consensus, Estimator, Model};
use cv_core::{CameraToCamera, Pose, WorldToCamera};
use cv_geom::triangulation::LinearEigenTriangulator;
use cv_sequential_sfm::*;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::BTreeMap;

pub const WIDTH: u32 = 640;
pub const HEIGHT: u32 = 480;
pub const FOCAL: f64 = 500.0;
/// Cameras sit on an arc around this point, looking at it.
pub const SCENE_CENTER: [f64; 3] = [0.0, 0.0, 8.0];
pub const ARC_RADIUS: f64 = 8.0;
pub const ARC_STEP_DEGREES: f64 = 8.0;
/// Residual threshold of the test consensus. Synthetic data is noise free.
pub const CONSENSUS_THRESHOLD: f64 = 1e-6;

pub type TestSfm = SequentialSfm<
    BestOfModels,
    KnownRelativePoses,
    KnownPoses,
    LinearEigenTriangulator,
    Retriangulation<LinearEigenTriangulator>,
    StdRng,
>;

/// Picks, among the models the estimator proposes, the one with the most inliers.
pub struct BestOfModels {
    pub threshold: f64,
}

impl<E, Data> Consensus<E, Data> for BestOfModels
where
    E: Estimator<Data>,
{
    type Inliers = Vec<usize>;

    fn model<I>(&mut self, estimator: &E, data: I) -> Option<E::Model>
    where
        I: Iterator<Item = Data> + Clone,
    {
        <Self as Consensus<E, Data>>::model_inliers(self, estimator, data).map(|(model, _)| model)
    }

    fn model_inliers<I>(&mut self, estimator: &E, data: I) -> Option<(E::Model, Self::Inliers)>
    where
        I: Iterator<Item = Data> + Clone,
    {
        let threshold = self.threshold;
        estimator
            .estimate(data.clone())
            .into_iter()
            .map(|model| {
                let inliers: Vec<usize> = data
                    .clone()
                    .enumerate()
                    .filter(|(_, datum)| model.residual(datum) < threshold)
                    .map(|(ix, _)| ix)
                    .collect();
                (model, inliers)
            })
            .filter(|(_, inliers)| inliers.len() >= E::MIN_SAMPLES)
            .max_by_key(|(_, inliers)| inliers.len())
    }
}

/// Proposes the relative pose between every ordered pair of ground truth cameras.
pub struct KnownRelativePoses(pub Vec<CameraToCamera>);

impl KnownRelativePoses {
    pub fn new(poses: &[WorldToCamera]) -> Self {
        Self(
            poses
                .iter()
                .flat_map(|&a| {
                    poses.iter().map(move |&b| {
                        CameraToCamera::from(b.isometry() * a.isometry().inverse())
                    })
                })
                .collect(),
        )
    }
}

impl Estimator<BearingMatch> for KnownRelativePoses {
    type Model = CameraToCamera;
    type ModelIter = Vec<CameraToCamera>;
    const MIN_SAMPLES: usize = 5;

    fn estimate<I>(&self, _data: I) -> Self::ModelIter
    where
        I: Iterator<Item = BearingMatch> + Clone,
    {
        self.0.clone()
    }
}

/// Proposes every ground truth camera expressed in the frame of every other ground truth camera.
pub struct KnownPoses(pub Vec<WorldToCamera>);

impl KnownPoses {
    pub fn new(poses: &[WorldToCamera]) -> Self {
        Self(
            KnownRelativePoses::new(poses)
                .0
                .into_iter()
                .map(|pose| WorldToCamera::from(pose.isometry()))
                .collect(),
        )
    }
}

impl Estimator<BearingWorldMatch> for KnownPoses {
    type Model = WorldToCamera;
    type ModelIter = Vec<WorldToCamera>;
    const MIN_SAMPLES: usize = 4;

    fn estimate<I>(&self, _data: I) -> Self::ModelIter
    where
        I: Iterator<Item = BearingWorldMatch> + Clone,
    {
        self.0.clone()
    }
}

/// An adjuster that always fails.
pub struct FailingAdjuster;

impl BundleAdjuster for FailingAdjuster {
    fn adjust(
        &mut self,
        _problem: &BundleAdjustmentProblem<'_>,
    ) -> Result<BundleAdjustment, BundleAdjustmentError> {
        Err(BundleAdjustmentError::NotConverged { iterations: 100 })
    }
}

pub fn init_logging() {
    let _ = pretty_env_logger::try_init();
}

/// A camera on the arc, `step` arc steps away from the middle, looking at the scene center.
pub fn arc_pose(step: f64) -> WorldToCamera {
    let angle = (step * ARC_STEP_DEGREES).to_radians();
    let camera_to_world = Rotation3::from_axis_angle(&Vector3::y_axis(), angle);
    let forward = camera_to_world * Vector3::z();
    let center = Point3::from(SCENE_CENTER) - forward * ARC_RADIUS;
    pose_from_center(camera_to_world, center)
}

pub fn pose_from_center(camera_to_world: Rotation3<f64>, center: Point3<f64>) -> WorldToCamera {
    let rotation = camera_to_world.inverse();
    WorldToCamera(IsometryMatrix3::from_parts(
        Translation3::from(-(rotation * center.coords)),
        rotation,
    ))
}

/// `count` cameras evenly spread along the arc.
pub fn arc_poses(count: usize) -> Vec<WorldToCamera> {
    (0..count)
        .map(|ix| arc_pose(ix as f64 - (count - 1) as f64 / 2.0))
        .collect()
}

pub fn random_points(count: usize, seed: u64) -> Vec<Point3<f64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            Point3::new(
                rng.gen_range(-2.0..2.0),
                rng.gen_range(-1.5..1.5),
                rng.gen_range(6.0..10.0),
            )
        })
        .collect()
}

pub fn intrinsics() -> Intrinsics {
    Intrinsics::new(
        CameraModelKind::Pinhole,
        FOCAL,
        Point2::new(f64::from(WIDTH) / 2.0, f64::from(HEIGHT) / 2.0),
    )
}

/// A noise free scene with known cameras and structure.
pub struct Synthetic {
    pub poses: Vec<WorldToCamera>,
    pub points: Vec<Point3<f64>>,
    /// For every view, the feature observing each visible point.
    pub point_features: Vec<BTreeMap<usize, FeatureId>>,
    pub input: SfmInput,
}

impl Synthetic {
    /// Every view sees every point.
    pub fn new(views: usize, points: usize, seed: u64) -> Self {
        Self::with_visibility(arc_poses(views), random_points(points, seed), |_, _| true)
    }

    pub fn with_visibility(
        poses: Vec<WorldToCamera>,
        points: Vec<Point3<f64>>,
        visible: impl Fn(ViewId, usize) -> bool,
    ) -> Self {
        let intrinsics = intrinsics();
        let mut scene = Scene::new();
        scene.add_intrinsics(0, intrinsics);
        let mut features = FeaturesPerView::new();
        let mut point_features = vec![];
        for (view, pose) in poses.iter().enumerate() {
            scene.add_view(view, View::new(0, WIDTH, HEIGHT));
            let mut view_features = vec![];
            let mut lookup = BTreeMap::new();
            for (ix, point) in points.iter().enumerate() {
                if !visible(view, ix) {
                    continue;
                }
                let pixel = intrinsics
                    .project(&(pose.isometry() * point))
                    .expect("synthetic points are in front of every camera");
                lookup.insert(ix, view_features.len());
                view_features.push(
                    Feature::new(pixel.x, pixel.y).color([(ix % 256) as u8, 128, 64]),
                );
            }
            features.insert(view, view_features);
            point_features.push(lookup);
        }

        let mut matches = PairwiseMatches::new();
        for a in 0..poses.len() {
            for b in a + 1..poses.len() {
                let pair_matches: Vec<(FeatureId, FeatureId)> = point_features[a]
                    .iter()
                    .filter_map(|(point, &feature_a)| {
                        point_features[b]
                            .get(point)
                            .map(|&feature_b| (feature_a, feature_b))
                    })
                    .collect();
                if !pair_matches.is_empty() {
                    matches.insert(a, b, pair_matches);
                }
            }
        }

        Self {
            poses,
            points,
            point_features,
            input: SfmInput {
                scene,
                features,
                matches,
            },
        }
    }

    pub fn engine(&self, settings: SfmSettings) -> TestSfm {
        self.engine_with(settings, Retriangulation::new(LinearEigenTriangulator::new()))
    }

    pub fn engine_with<B>(
        &self,
        settings: SfmSettings,
        bundle_adjuster: B,
    ) -> SequentialSfm<BestOfModels, KnownRelativePoses, KnownPoses, LinearEigenTriangulator, B, StdRng>
    where
        B: BundleAdjuster,
    {
        SequentialSfm::new(
            settings,
            BestOfModels {
                threshold: CONSENSUS_THRESHOLD,
            },
            KnownRelativePoses::new(&self.poses),
            KnownPoses::new(&self.poses),
            LinearEigenTriangulator::new(),
            bundle_adjuster,
            StdRng::seed_from_u64(0),
        )
    }

    /// A state posed at the ground truth, with every point as a landmark seen by every view that sees it.
    ///
    /// Tracks are numbered like the points, which holds when view 0 sees every point.
    pub fn ground_truth_state(&self) -> ReconstructionState {
        let mut state = ReconstructionState::new(self.input.scene.clone());
        for (view, &pose) in self.poses.iter().enumerate() {
            state.attach_pose(view, pose);
        }
        for (ix, &point) in self.points.iter().enumerate() {
            let observations = self
                .point_features
                .iter()
                .enumerate()
                .filter_map(|(view, lookup)| lookup.get(&ix).map(|&feature| (view, feature)))
                .collect();
            state.insert_landmark(
                ix,
                Landmark {
                    point,
                    color: [255; 3],
                    observations,
                },
            );
        }
        state
    }

    /// The ground truth center of `view` in the frame of camera `origin`.
    pub fn center_in_frame_of(&self, view: ViewId, origin: ViewId) -> Point3<f64> {
        self.poses[origin].isometry() * optical_center(self.poses[view])
    }
}

/// Tracks and pyramid data for driving stages by hand.
pub struct Prepared {
    pub tracks: TrackIndex,
    pub scorer: PyramidScorer,
    pub pyramid: PyramidCache,
}

impl Prepared {
    pub fn new(input: &SfmInput, settings: &SfmSettings) -> Self {
        let tracks = TrackIndex::build(&input.matches, settings.min_input_track_length);
        let scorer = PyramidScorer::from_settings(settings);
        let pyramid = PyramidCache::compute(&scorer, &tracks, &input.features, &input.scene);
        Self {
            tracks,
            scorer,
            pyramid,
        }
    }

    pub fn context<'a>(&'a self, features: &'a FeaturesPerView) -> SfmContext<'a> {
        SfmContext {
            features,
            tracks: &self.tracks,
            scorer: &self.scorer,
            pyramid: &self.pyramid,
        }
    }
}
