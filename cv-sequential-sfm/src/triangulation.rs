use crate::{
    max_ray_angle, optical_center, BearingMatch, BearingWorldMatch, BundleAdjuster, FeatureId,
    Landmark, ReconstructionState, Scene, SequentialSfm, SfmContext, TrackId, ViewId,
};
use cv_core::nalgebra::{Point3, Unit, Vector3};
use cv_core::sample_consensus::{Consensus, Estimator};
use cv_core::{CameraToCamera, Pose, Projective, TriangulatorObservances as TriangulatorObservations, WorldToCamera};
use log::*;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Why a track was not turned into a landmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriangulationRejection {
    /// The triangulator found no point, or an observation could not be calibrated.
    Degenerate,
    BehindCamera,
    /// An observation reprojects further than the triangulation precision.
    Reprojection,
    /// The rays meet at too narrow an angle.
    Angle,
}

/// An observation of a track in a view with a known or hypothesized pose.
#[derive(Debug, Clone, Copy)]
pub struct PosedObservation {
    pub view: ViewId,
    pub feature: FeatureId,
    pub pose: WorldToCamera,
}

/// Counts of what happened to the candidate tracks of a triangulation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct TriangulationReport {
    pub candidates: usize,
    pub created: usize,
    pub degenerate: usize,
    pub behind_camera: usize,
    pub reprojection: usize,
    pub angle: usize,
}

impl TriangulationReport {
    fn record(&mut self, rejection: TriangulationRejection) {
        match rejection {
            TriangulationRejection::Degenerate => self.degenerate += 1,
            TriangulationRejection::BehindCamera => self.behind_camera += 1,
            TriangulationRejection::Reprojection => self.reprojection += 1,
            TriangulationRejection::Angle => self.angle += 1,
        }
    }
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
    /// Triangulates a point from the observations and accepts it only if it lies in front of every
    /// camera, reprojects within the triangulation precision everywhere, and is seen under at least
    /// `minimum_angle` degrees.
    pub fn triangulate_verified(
        &self,
        ctx: &SfmContext<'_>,
        scene: &Scene,
        observations: &[PosedObservation],
        minimum_angle: f64,
    ) -> Result<Point3<f64>, TriangulationRejection> {
        let rays = observations
            .iter()
            .map(|observation| {
                scene
                    .bearing(ctx.features, observation.view, observation.feature)
                    .map(|bearing| (observation.pose, bearing))
            })
            .collect::<Option<Vec<(WorldToCamera, Unit<Vector3<f64>>)>>>()
            .ok_or(TriangulationRejection::Degenerate)?;
        if rays.len() < 2 {
            return Err(TriangulationRejection::Degenerate);
        }
        let point = self
            .triangulator
            .triangulate_observances(rays.into_iter())
            .and_then(Projective::point)
            .filter(|point| point.coords.iter().all(|c| c.is_finite()))
            .ok_or(TriangulationRejection::Degenerate)?;

        for observation in observations {
            let camera_point = observation.pose.isometry() * point;
            if camera_point.z <= 0.0 {
                return Err(TriangulationRejection::BehindCamera);
            }
            let error = scene
                .view_intrinsics(observation.view)
                .zip(ctx.features.feature(observation.view, observation.feature))
                .and_then(|(intrinsics, feature)| {
                    intrinsics
                        .project(&camera_point)
                        .map(|projected| (projected - feature.point).norm())
                })
                .ok_or(TriangulationRejection::BehindCamera)?;
            if error.is_nan() || error >= self.settings.triangulation_precision {
                return Err(TriangulationRejection::Reprojection);
            }
        }

        let centers: Vec<Point3<f64>> = observations
            .iter()
            .map(|observation| optical_center(observation.pose))
            .collect();
        if max_ray_angle(&centers, &point) < minimum_angle {
            return Err(TriangulationRejection::Angle);
        }
        Ok(point)
    }

    /// Builds a landmark from accepted observations, colored by its first feature.
    pub(crate) fn make_landmark(
        &self,
        ctx: &SfmContext<'_>,
        point: Point3<f64>,
        observations: &[PosedObservation],
    ) -> Landmark {
        let color = observations
            .first()
            .and_then(|observation| ctx.features.feature(observation.view, observation.feature))
            .map_or([255; 3], |feature| feature.color);
        Landmark {
            point,
            color,
            observations: observations
                .iter()
                .map(|observation| (observation.view, observation.feature))
                .collect::<BTreeMap<ViewId, FeatureId>>(),
        }
    }

    /// Creates landmarks for the tracks seen by the newly reconstructed views.
    ///
    /// A candidate track has no landmark, was never retired, and has at least
    /// `max(2, min_track_length)` observations in reconstructed views, one of which is new.
    /// Candidates are all evaluated against the state as it was before any of them is inserted.
    pub fn triangulate_new_tracks(
        &self,
        ctx: &SfmContext<'_>,
        state: &mut ReconstructionState,
        new_views: &BTreeSet<ViewId>,
    ) -> TriangulationReport {
        let minimum_length = self.settings.min_track_length.max(2);
        let candidates: BTreeSet<TrackId> = new_views
            .iter()
            .flat_map(|&view| ctx.tracks.tracks_of_view(view).iter().copied())
            .filter(|&track| {
                !state.scene().landmarks.contains_key(&track) && !state.is_retired(track)
            })
            .collect();

        let mut report = TriangulationReport::default();
        let accepted: Vec<(TrackId, Landmark)> = candidates
            .into_iter()
            .filter_map(|track| {
                let observations: Vec<PosedObservation> = ctx
                    .tracks
                    .track(track)?
                    .observations
                    .iter()
                    .filter_map(|(&view, &feature)| {
                        Some(PosedObservation {
                            view,
                            feature,
                            pose: state.scene().pose(view)?,
                        })
                    })
                    .collect();
                if observations.len() < minimum_length
                    || !observations
                        .iter()
                        .any(|observation| new_views.contains(&observation.view))
                {
                    return None;
                }
                report.candidates += 1;
                match self.triangulate_verified(
                    ctx,
                    state.scene(),
                    &observations,
                    self.settings.minimum_triangulation_angle,
                ) {
                    Ok(point) => Some((track, self.make_landmark(ctx, point, &observations))),
                    Err(rejection) => {
                        trace!("track {} rejected: {:?}", track, rejection);
                        report.record(rejection);
                        None
                    }
                }
            })
            .collect();

        report.created = accepted.len();
        for (track, landmark) in accepted {
            state.insert_landmark(track, landmark);
        }
        info!(
            "triangulated {} of {} candidate tracks ({} degenerate, {} behind camera, {} reprojection, {} angle)",
            report.created,
            report.candidates,
            report.degenerate,
            report.behind_camera,
            report.reprojection,
            report.angle
        );
        report
    }
}
