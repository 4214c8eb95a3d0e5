use crate::{
    compute_residuals_histogram, BearingMatch, BearingWorldMatch, BundleAdjustmentError,
    FeaturesPerView, Intrinsics, IntrinsicsId, ReconstructionState, ResidualStatistics, Scene,
    SequentialSfm, SfmContext, TrackId, ViewId,
};
use average::Mean;
use cv_core::nalgebra::{Point3, Unit, Vector3};
use cv_core::sample_consensus::{Consensus, Estimator};
use cv_core::{CameraToCamera, Projective, TriangulatorObservances as TriangulatorObservations, WorldToCamera};
use log::*;
use rand::Rng;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The data a bundle adjuster may read.
#[derive(Debug, Clone, Copy)]
pub struct BundleAdjustmentProblem<'a> {
    pub scene: &'a Scene,
    pub features: &'a FeaturesPerView,
    /// Whether unlocked intrinsics groups may be refined.
    pub refine_intrinsics: bool,
}

/// Contains the results of a bundle adjust
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct BundleAdjustment {
    /// Refined poses of reconstructed views.
    pub poses: Vec<(ViewId, WorldToCamera)>,
    /// Refined intrinsics groups.
    pub intrinsics: Vec<(IntrinsicsId, Intrinsics)>,
    /// Refined landmark positions, keyed by track.
    pub points: Vec<(TrackId, Point3<f64>)>,
    /// The final mean squared reprojection error in pixels.
    pub final_cost: f64,
}

/// Jointly refines poses, intrinsics, and structure.
///
/// The adjuster only computes; the reconstruction applies what it returns.
pub trait BundleAdjuster {
    fn adjust(
        &mut self,
        problem: &BundleAdjustmentProblem<'_>,
    ) -> Result<BundleAdjustment, BundleAdjustmentError>;
}

/// An adjuster that only refines structure, by re-triangulating every landmark from its posed
/// observations. Landmarks that fail to triangulate keep their position.
#[derive(Debug, Clone, Copy, Default)]
pub struct Retriangulation<T> {
    pub triangulator: T,
}

impl<T> Retriangulation<T> {
    pub fn new(triangulator: T) -> Self {
        Self { triangulator }
    }
}

impl<T> BundleAdjuster for Retriangulation<T>
where
    T: TriangulatorObservations,
{
    fn adjust(
        &mut self,
        problem: &BundleAdjustmentProblem<'_>,
    ) -> Result<BundleAdjustment, BundleAdjustmentError> {
        let scene = problem.scene;
        if scene.landmarks.is_empty() {
            return Err(BundleAdjustmentError::Degenerate(
                "there are no landmarks to adjust".to_string(),
            ));
        }
        let points: Vec<(TrackId, Point3<f64>)> = scene
            .landmarks
            .iter()
            .filter_map(|(&track, landmark)| {
                let rays: Vec<(WorldToCamera, Unit<Vector3<f64>>)> = landmark
                    .observations
                    .iter()
                    .filter_map(|(&view, &feature)| {
                        Some((
                            scene.pose(view)?,
                            scene.bearing(problem.features, view, feature)?,
                        ))
                    })
                    .collect();
                let point = self
                    .triangulator
                    .triangulate_observances(rays.into_iter())
                    .and_then(Projective::point)?;
                Some((track, point))
            })
            .collect();

        let cost: Mean = points
            .iter()
            .flat_map(|(track, point)| {
                scene.landmarks[track]
                    .observations
                    .iter()
                    .filter_map(move |(&view, &feature)| {
                        scene.reprojection_error(problem.features, view, feature, point)
                    })
            })
            .map(|error| error * error)
            .collect();
        debug!(
            "re-triangulated {} of {} landmarks",
            points.len(),
            scene.landmarks.len()
        );
        Ok(BundleAdjustment {
            poses: vec![],
            intrinsics: vec![],
            points,
            final_cost: cost.mean(),
        })
    }
}

/// What a rejection pass saw and removed.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct RejectionReport {
    /// Residual distribution before anything was removed.
    pub residuals: Option<ResidualStatistics>,
    /// Observations removed for their reprojection error or for lying behind the camera.
    pub residual_observations: usize,
    /// Landmarks removed because the rays meet at too narrow an angle.
    pub angle_landmarks: usize,
    /// Landmarks removed because too few observations were left, including angle rejections.
    pub removed_landmarks: usize,
}

impl RejectionReport {
    /// The amount compared against a rejection tolerance.
    pub fn total(&self) -> usize {
        self.residual_observations + self.angle_landmarks
    }
}

/// A summary of one refinement.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct RefinementReport {
    pub iterations: usize,
    pub bundle_adjustment_failures: usize,
    pub removed_observations: usize,
    pub removed_landmarks: usize,
    /// The cost reported by the last successful bundle adjustment.
    pub final_cost: Option<f64>,
    /// Residual distribution seen by the last rejection pass.
    pub residuals: Option<ResidualStatistics>,
}

impl<C, RE, PE, T, B, R> SequentialSfm<C, RE, PE, T, B, R>
where
    C: Consensus<RE, BearingMatch> + Consensus<PE, BearingWorldMatch>,
    RE: Estimator<BearingMatch, Model = CameraToCamera>,
    PE: Estimator<BearingWorldMatch, Model = WorldToCamera>,
    T: TriangulatorObservations,
    B: BundleAdjuster,
    R: Rng,
{
    /// Alternates bundle adjustment and outlier rejection until a rejection pass removes no more than
    /// `rejection_tolerance` items or `refinement_max_iterations` passes ran.
    ///
    /// A failed bundle adjustment leaves the state as it was and is only logged.
    pub fn refine(&self, ctx: &SfmContext<'_>, state: &mut ReconstructionState) -> RefinementReport {
        let mut report = RefinementReport::default();
        for _ in 0..self.settings.refinement_max_iterations.max(1) {
            report.iterations += 1;
            match self.bundle_adjust(ctx, state) {
                Ok(cost) => report.final_cost = Some(cost),
                Err(e) => {
                    warn!("bundle adjustment failed, keeping the unrefined state: {}", e);
                    report.bundle_adjustment_failures += 1;
                }
            }
            let rejection =
                self.reject_outliers(ctx, state, self.settings.rejection_precision);
            report.removed_observations += rejection.residual_observations;
            report.removed_landmarks += rejection.removed_landmarks;
            let settled = rejection.total() <= self.settings.rejection_tolerance;
            report.residuals = rejection.residuals;
            if settled {
                break;
            }
        }
        info!(
            "refinement finished after {} iterations, removed {} observations and {} landmarks",
            report.iterations, report.removed_observations, report.removed_landmarks
        );
        report
    }

    /// Runs the bundle adjuster and applies its result.
    ///
    /// Returns the final cost reported by the adjuster.
    pub fn bundle_adjust(
        &self,
        ctx: &SfmContext<'_>,
        state: &mut ReconstructionState,
    ) -> Result<f64, BundleAdjustmentError> {
        let adjustment = self.compute_bundle_adjust(ctx, state)?;
        let cost = adjustment.final_cost;
        self.apply_bundle_adjust(state, adjustment);
        Ok(cost)
    }

    fn compute_bundle_adjust(
        &self,
        ctx: &SfmContext<'_>,
        state: &ReconstructionState,
    ) -> Result<BundleAdjustment, BundleAdjustmentError> {
        let problem = BundleAdjustmentProblem {
            scene: state.scene(),
            features: ctx.features,
            refine_intrinsics: !self.settings.fixed_intrinsics,
        };
        info!(
            "bundle adjusting {} views and {} landmarks",
            state.reconstructed().len(),
            state.scene().landmarks.len()
        );
        self.bundle_adjuster.borrow_mut().adjust(&problem)
    }

    fn apply_bundle_adjust(&self, state: &mut ReconstructionState, adjustment: BundleAdjustment) {
        for (view, pose) in adjustment.poses {
            if !state.update_pose(view, pose) {
                warn!("bundle adjustment returned a pose for unreconstructed view {}", view);
            }
        }
        if !self.settings.fixed_intrinsics {
            for (id, refined) in adjustment.intrinsics {
                match state.scene_mut().intrinsics.get_mut(&id) {
                    Some(intrinsics) if !intrinsics.locked => {
                        *intrinsics = Intrinsics {
                            initialized: true,
                            locked: false,
                            ..refined
                        };
                    }
                    Some(_) => debug!("ignoring refinement of locked intrinsics {}", id),
                    None => warn!("bundle adjustment returned unknown intrinsics {}", id),
                }
            }
        }
        let landmarks = &mut state.scene_mut().landmarks;
        for (track, point) in adjustment.points {
            if let Some(landmark) = landmarks.get_mut(&track) {
                landmark.point = point;
            }
        }
    }

    /// Measures the residual distribution, removes outliers, and reports whether more than `count`
    /// items were removed.
    pub fn bad_track_rejector(
        &self,
        ctx: &SfmContext<'_>,
        state: &mut ReconstructionState,
        precision: f64,
        count: usize,
    ) -> bool {
        self.reject_outliers(ctx, state, precision).total() > count
    }

    /// Removes observations that reproject further than `precision` pixels or lie behind their camera,
    /// then landmarks left with fewer than two observations or whose widest ray angle is below
    /// `minimum_triangulation_angle`. Removed landmarks are retired.
    ///
    /// The report carries the residual distribution measured before the removal.
    pub fn reject_outliers(
        &self,
        ctx: &SfmContext<'_>,
        state: &mut ReconstructionState,
        precision: f64,
    ) -> RejectionReport {
        let scene = state.scene();
        let residuals = compute_residuals_histogram(scene, ctx.features);
        if let Some(residuals) = &residuals {
            debug!(
                "rejecting outliers, residual mse {:.6} over {} observations",
                residuals.mean_squared_error,
                residuals.histogram.count()
            );
        }
        let outliers: Vec<(TrackId, ViewId)> = scene
            .landmarks
            .iter()
            .flat_map(|(&track, landmark)| {
                landmark
                    .observations
                    .iter()
                    .filter(move |&(&view, &feature)| {
                        !matches!(
                            scene.reprojection_error(ctx.features, view, feature, &landmark.point),
                            Some(error) if error <= precision
                        )
                    })
                    .map(move |(&view, _)| (track, view))
            })
            .collect();

        let mut report = RejectionReport {
            residuals,
            residual_observations: outliers.len(),
            ..RejectionReport::default()
        };
        let landmarks = &mut state.scene_mut().landmarks;
        for (track, view) in outliers {
            if let Some(landmark) = landmarks.get_mut(&track) {
                landmark.observations.remove(&view);
            }
        }

        let scene = state.scene();
        let mut doomed: Vec<TrackId> = vec![];
        for (&track, landmark) in &scene.landmarks {
            if landmark.observations.len() < 2 {
                doomed.push(track);
            } else if scene.landmark_max_angle(landmark) < self.settings.minimum_triangulation_angle
            {
                report.angle_landmarks += 1;
                doomed.push(track);
            }
        }
        report.removed_landmarks = doomed.len();
        for track in doomed {
            state.remove_landmark(track);
        }

        debug!(
            "rejected {} observations and {} landmarks ({} for their angle)",
            report.residual_observations, report.removed_landmarks, report.angle_landmarks
        );
        report
    }
}
