use crate::{
    BearingMatch, BearingWorldMatch, BundleAdjuster, FeatureId, ReconstructionState,
    SequentialSfm, SfmContext, TrackId, ViewId,
};
use cv_core::sample_consensus::{Consensus, Estimator};
use cv_core::{CameraToCamera, Pose, TriangulatorObservances as TriangulatorObservations, WorldToCamera};
use log::*;
use rand::{seq::SliceRandom, Rng};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Why a view could not be resected. The view stays in the remaining set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum ResectionFailure {
    #[error("the view has no intrinsics")]
    MissingIntrinsics,
    #[error("only {found} 2d-3d correspondences, {required} are required")]
    TooFewCorrespondences { found: usize, required: usize },
    #[error("consensus found no pose")]
    NoConsensus,
    #[error("only {found} verified inliers, {required} are required")]
    TooFewInliers { found: usize, required: usize },
}

/// A successful resection that has not been applied to the state yet.
#[derive(Debug, Clone)]
pub struct Resection {
    pub view: ViewId,
    pub pose: WorldToCamera,
    /// The tracks whose landmark the view observes, with the observing feature.
    pub inliers: Vec<(TrackId, FeatureId)>,
    pub correspondences: usize,
}

/// The outcome of resecting a batch of views.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct ResectionReport {
    pub resected: BTreeSet<ViewId>,
    pub rejected: BTreeMap<ViewId, ResectionFailure>,
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
    /// Estimates the pose of one view from its observations of existing landmarks.
    ///
    /// The state is only read. Consensus inliers are kept only if the point lies in front of the
    /// camera and reprojects within the triangulation precision.
    pub fn resect_view(
        &self,
        ctx: &SfmContext<'_>,
        state: &ReconstructionState,
        view: ViewId,
    ) -> Result<Resection, ResectionFailure> {
        let scene = state.scene();
        let intrinsics = scene
            .view_intrinsics(view)
            .ok_or(ResectionFailure::MissingIntrinsics)?;

        let mut correspondences: Vec<(TrackId, FeatureId, BearingWorldMatch)> = ctx
            .tracks
            .tracks_of_view(view)
            .iter()
            .filter_map(|&track| {
                let landmark = scene.landmarks.get(&track)?;
                let feature = ctx.tracks.feature(track, view)?;
                let bearing = intrinsics.calibrate(ctx.features.feature(view, feature)?.point);
                Some((track, feature, BearingWorldMatch(bearing, landmark.point)))
            })
            .collect();
        let required = self.settings.min_points_per_pose.max(PE::MIN_SAMPLES);
        if correspondences.len() < required {
            return Err(ResectionFailure::TooFewCorrespondences {
                found: correspondences.len(),
                required,
            });
        }

        correspondences.shuffle(&mut *self.rng.borrow_mut());
        let data: Vec<BearingWorldMatch> = correspondences
            .iter()
            .map(|&(_, _, data)| data)
            .collect();
        debug!(
            "estimating pose of view {} from {} correspondences",
            view,
            data.len()
        );
        let (pose, inliers) = <C as Consensus<PE, BearingWorldMatch>>::model_inliers(
            &mut *self.consensus.borrow_mut(),
            &self.pose_estimator,
            data.iter().copied(),
        )
        .ok_or(ResectionFailure::NoConsensus)?;

        let inliers: Vec<(TrackId, FeatureId)> = inliers
            .into_iter()
            .filter_map(|ix| correspondences.get(ix))
            .filter(|&&(_, feature, BearingWorldMatch(_, point))| {
                let camera_point = pose.isometry() * point;
                camera_point.z > 0.0
                    && intrinsics
                        .project(&camera_point)
                        .zip(ctx.features.feature(view, feature))
                        .map_or(false, |(projected, feature)| {
                            (projected - feature.point).norm()
                                < self.settings.triangulation_precision
                        })
            })
            .map(|&(track, feature, _)| (track, feature))
            .collect();
        let required = ((correspondences.len() as f64
            * self.settings.resection_inlier_minimum_ratio)
            .ceil() as usize)
            .max(PE::MIN_SAMPLES);
        if inliers.len() < required {
            return Err(ResectionFailure::TooFewInliers {
                found: inliers.len(),
                required,
            });
        }

        Ok(Resection {
            view,
            pose,
            inliers,
            correspondences: correspondences.len(),
        })
    }

    /// Resects every view of the batch against the same state, then applies the results.
    ///
    /// Successful views get their pose and their inlier observations are added to the landmarks.
    /// Failed views are deferred until the reconstruction grows.
    pub fn robust_resection_of_images(
        &self,
        ctx: &SfmContext<'_>,
        state: &mut ReconstructionState,
        batch: &[ViewId],
    ) -> ResectionReport {
        let outcomes: Vec<(ViewId, Result<Resection, ResectionFailure>)> = batch
            .iter()
            .map(|&view| (view, self.resect_view(ctx, state, view)))
            .collect();

        let mut report = ResectionReport::default();
        let mut resections = vec![];
        for (view, outcome) in outcomes {
            match outcome {
                Ok(resection) => resections.push(resection),
                Err(failure) => {
                    info!("rejecting resection of view {}: {}", view, failure);
                    state.defer(view);
                    report.rejected.insert(view, failure);
                }
            }
        }
        for resection in resections {
            info!(
                "resected view {} with {} inliers out of {} correspondences",
                resection.view,
                resection.inliers.len(),
                resection.correspondences
            );
            if !state.attach_pose(resection.view, resection.pose) {
                continue;
            }
            let landmarks = &mut state.scene_mut().landmarks;
            for (track, feature) in resection.inliers {
                if let Some(landmark) = landmarks.get_mut(&track) {
                    landmark.observations.insert(resection.view, feature);
                }
            }
            report.resected.insert(resection.view);
        }
        report
    }
}
