use crate::{CameraModelKind, Pair, SnapshotSettings};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The settings for the sequential reconstruction.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct SfmSettings {
    /// Use this pair as the seed instead of selecting one automatically.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_initial_pair")
    )]
    pub initial_pair: Option<Pair>,
    /// The model given to intrinsics groups declared as `CameraModelKind::Unknown`.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_default_camera_model")
    )]
    pub default_camera_model: CameraModelKind,
    /// Tracks built from the matches with fewer observations than this are discarded.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_min_input_track_length")
    )]
    pub min_input_track_length: usize,
    /// The minimum number of posed observations required to triangulate a track.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_min_track_length")
    )]
    pub min_track_length: usize,
    /// The minimum number of 2d-3d correspondences a view needs to be offered for resection.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_min_points_per_pose")
    )]
    pub min_points_per_pose: usize,
    /// Consult the initial pair prompt when automatic selection is ambiguous.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_interactive")
    )]
    pub interactive: bool,
    /// The number of cells each pyramid level splits a cell into along each axis.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_pyramid_base")
    )]
    pub pyramid_base: usize,
    /// The number of pyramid levels below the whole image.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_pyramid_depth")
    )]
    pub pyramid_depth: usize,
    /// The number of observations in a pyramid cell after which the cell stops adding to the score.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_pyramid_threshold")
    )]
    pub pyramid_threshold: usize,
    /// The minimum number of tracks two views must share to be an initial pair candidate.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_initial_pair_minimum_shared_tracks")
    )]
    pub initial_pair_minimum_shared_tracks: usize,
    /// The minimum number of points the initial pair must triangulate.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_initial_pair_minimum_landmarks")
    )]
    pub initial_pair_minimum_landmarks: usize,
    /// The lower bound, in degrees, of the median triangulation angle of an initial pair.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_initial_pair_minimum_angle")
    )]
    pub initial_pair_minimum_angle: f64,
    /// The upper bound, in degrees, of the median triangulation angle of an initial pair.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_initial_pair_maximum_angle")
    )]
    pub initial_pair_maximum_angle: f64,
    /// The maximum reprojection error in pixels of an accepted point or resection inlier.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_triangulation_precision")
    )]
    pub triangulation_precision: f64,
    /// The minimum widest ray angle, in degrees, for a landmark to be kept.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_minimum_triangulation_angle")
    )]
    pub minimum_triangulation_angle: f64,
    /// The ratio of verified inliers to correspondences required for a resection to succeed.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_resection_inlier_minimum_ratio")
    )]
    pub resection_inlier_minimum_ratio: f64,
    /// The maximum number of views resected in one round.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_max_batch_size")
    )]
    pub max_batch_size: usize,
    /// A view joins the batch if its score is at least this fraction of the best score.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_batch_score_ratio")
    )]
    pub batch_score_ratio: f64,
    /// Refine every this many growth rounds. The final refinement always runs.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_refinement_interval")
    )]
    pub refinement_interval: usize,
    /// The maximum number of bundle adjustment and rejection passes in one refinement.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_refinement_max_iterations")
    )]
    pub refinement_max_iterations: usize,
    /// Observations with a reprojection error in pixels above this are rejected after bundle adjustment.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_rejection_precision")
    )]
    pub rejection_precision: f64,
    /// Refinement stops once a rejection pass removes no more than this many observations.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_rejection_tolerance")
    )]
    pub rejection_tolerance: usize,
    /// Never let bundle adjustment refine intrinsics.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_fixed_intrinsics")
    )]
    pub fixed_intrinsics: bool,
    /// The growth loop stops after this many consecutive rounds without a resectable view.
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_max_stalled_rounds")
    )]
    pub max_stalled_rounds: usize,
    /// Where and what to write after refinement passes, if anything.
    #[cfg_attr(feature = "serde-serialize", serde(default))]
    pub snapshot: Option<SnapshotSettings>,
}

impl Default for SfmSettings {
    fn default() -> Self {
        Self {
            initial_pair: default_initial_pair(),
            default_camera_model: default_default_camera_model(),
            min_input_track_length: default_min_input_track_length(),
            min_track_length: default_min_track_length(),
            min_points_per_pose: default_min_points_per_pose(),
            interactive: default_interactive(),
            pyramid_base: default_pyramid_base(),
            pyramid_depth: default_pyramid_depth(),
            pyramid_threshold: default_pyramid_threshold(),
            initial_pair_minimum_shared_tracks: default_initial_pair_minimum_shared_tracks(),
            initial_pair_minimum_landmarks: default_initial_pair_minimum_landmarks(),
            initial_pair_minimum_angle: default_initial_pair_minimum_angle(),
            initial_pair_maximum_angle: default_initial_pair_maximum_angle(),
            triangulation_precision: default_triangulation_precision(),
            minimum_triangulation_angle: default_minimum_triangulation_angle(),
            resection_inlier_minimum_ratio: default_resection_inlier_minimum_ratio(),
            max_batch_size: default_max_batch_size(),
            batch_score_ratio: default_batch_score_ratio(),
            refinement_interval: default_refinement_interval(),
            refinement_max_iterations: default_refinement_max_iterations(),
            rejection_precision: default_rejection_precision(),
            rejection_tolerance: default_rejection_tolerance(),
            fixed_intrinsics: default_fixed_intrinsics(),
            max_stalled_rounds: default_max_stalled_rounds(),
            snapshot: None,
        }
    }
}

fn default_initial_pair() -> Option<Pair> {
    None
}

fn default_default_camera_model() -> CameraModelKind {
    CameraModelKind::RadialK3
}

fn default_min_input_track_length() -> usize {
    2
}

fn default_min_track_length() -> usize {
    2
}

fn default_min_points_per_pose() -> usize {
    30
}

fn default_interactive() -> bool {
    false
}

fn default_pyramid_base() -> usize {
    2
}

fn default_pyramid_depth() -> usize {
    5
}

fn default_pyramid_threshold() -> usize {
    1
}

fn default_initial_pair_minimum_shared_tracks() -> usize {
    30
}

fn default_initial_pair_minimum_landmarks() -> usize {
    30
}

fn default_initial_pair_minimum_angle() -> f64 {
    3.0
}

fn default_initial_pair_maximum_angle() -> f64 {
    60.0
}

fn default_triangulation_precision() -> f64 {
    4.0
}

fn default_minimum_triangulation_angle() -> f64 {
    2.0
}

fn default_resection_inlier_minimum_ratio() -> f64 {
    0.25
}

fn default_max_batch_size() -> usize {
    30
}

fn default_batch_score_ratio() -> f64 {
    0.75
}

fn default_refinement_interval() -> usize {
    1
}

fn default_refinement_max_iterations() -> usize {
    20
}

fn default_rejection_precision() -> f64 {
    4.0
}

fn default_rejection_tolerance() -> usize {
    0
}

fn default_fixed_intrinsics() -> bool {
    false
}

fn default_max_stalled_rounds() -> usize {
    2
}
