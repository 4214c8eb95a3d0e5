use crate::{
    optical_center, ray_angle, BearingMatch, BearingWorldMatch, BundleAdjuster, FeatureId,
    InitialPairFailure, Landmark, Pair, PosedObservation, ReconstructionError,
    ReconstructionState, Scene, SequentialSfm, SfmContext, TrackId, ViewId,
};
use cv_core::sample_consensus::{Consensus, Estimator};
use cv_core::{CameraToCamera, Pose, TriangulatorObservances as TriangulatorObservations, WorldToCamera};
use float_ord::FloatOrd;
use itertools::Itertools;
use log::*;
use rand::{seq::SliceRandom, Rng};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// A pair of views that passed every initial pair check.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct InitialPairCandidate {
    pub pair: Pair,
    pub shared_tracks: usize,
    /// Points that would be created by seeding from this pair.
    pub landmarks: usize,
    /// Median triangulation angle of the relative pose inliers, in degrees.
    pub median_angle: f64,
    /// `median_angle` times the smaller pyramid score of the two views.
    pub score: f64,
}

/// Asked to pick the initial pair in interactive mode. Receives the ranked candidates, which may be
/// empty, and returns the pair to use or `None` to keep the automatic choice.
pub type InitialPairPrompt = dyn Fn(&[InitialPairCandidate]) -> Option<Pair>;

/// A two-view reconstruction that has not been applied to the state yet.
#[derive(Debug, Clone)]
struct TwoView {
    /// Pose of the second view. The first one sits at the origin.
    pose: WorldToCamera,
    landmarks: Vec<(TrackId, Landmark)>,
    shared_tracks: usize,
    median_angle: f64,
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
    /// Estimates the relative pose of the pair and triangulates the inliers.
    ///
    /// Every inlier that triangulates in front of both cameras within the triangulation precision counts
    /// toward the median angle. Only those at or above `minimum_triangulation_angle` become landmarks.
    fn two_view(
        &self,
        ctx: &SfmContext<'_>,
        scene: &Scene,
        pair: Pair,
    ) -> Result<TwoView, InitialPairFailure> {
        let (a, b) = (pair.first(), pair.second());
        let shared = ctx.tracks.shared_tracks(pair);
        let required = self
            .settings
            .initial_pair_minimum_shared_tracks
            .max(RE::MIN_SAMPLES);
        if shared.len() < required {
            return Err(InitialPairFailure::TooFewSharedTracks {
                found: shared.len(),
                required,
            });
        }

        let mut matches: Vec<(TrackId, FeatureId, FeatureId, BearingMatch)> = shared
            .iter()
            .filter_map(|&track| {
                let feature_a = ctx.tracks.feature(track, a)?;
                let feature_b = ctx.tracks.feature(track, b)?;
                let bearing_a = scene.bearing(ctx.features, a, feature_a)?;
                let bearing_b = scene.bearing(ctx.features, b, feature_b)?;
                Some((track, feature_a, feature_b, BearingMatch(bearing_a, bearing_b)))
            })
            .collect();
        matches.shuffle(&mut *self.rng.borrow_mut());
        let data: Vec<BearingMatch> = matches.iter().map(|&(_, _, _, data)| data).collect();
        let (relative, inliers) = <C as Consensus<RE, BearingMatch>>::model_inliers(
            &mut *self.consensus.borrow_mut(),
            &self.relative_pose_estimator,
            data.iter().copied(),
        )
        .ok_or(InitialPairFailure::NoRelativePose)?;

        let pose_a = WorldToCamera::identity();
        let pose_b = WorldToCamera::from(relative.isometry());
        let (center_a, center_b) = (optical_center(pose_a), optical_center(pose_b));
        let mut angles = vec![];
        let landmarks: Vec<(TrackId, Landmark)> = inliers
            .into_iter()
            .filter_map(|ix| matches.get(ix))
            .filter_map(|&(track, feature_a, feature_b, _)| {
                let observations = [
                    PosedObservation {
                        view: a,
                        feature: feature_a,
                        pose: pose_a,
                    },
                    PosedObservation {
                        view: b,
                        feature: feature_b,
                        pose: pose_b,
                    },
                ];
                let point = self
                    .triangulate_verified(ctx, scene, &observations, 0.0)
                    .ok()?;
                let angle = ray_angle(&center_a, &center_b, &point);
                angles.push(angle);
                (angle >= self.settings.minimum_triangulation_angle)
                    .then(|| (track, self.make_landmark(ctx, point, &observations)))
            })
            .collect();

        let median_angle = median(&mut angles).ok_or(InitialPairFailure::TooFewLandmarks {
            found: 0,
            required: self.settings.initial_pair_minimum_landmarks,
        })?;
        if median_angle < self.settings.initial_pair_minimum_angle
            || median_angle > self.settings.initial_pair_maximum_angle
        {
            return Err(InitialPairFailure::AngleOutOfRange {
                angle: median_angle,
            });
        }
        if landmarks.len() < self.settings.initial_pair_minimum_landmarks {
            return Err(InitialPairFailure::TooFewLandmarks {
                found: landmarks.len(),
                required: self.settings.initial_pair_minimum_landmarks,
            });
        }
        Ok(TwoView {
            pose: pose_b,
            landmarks,
            shared_tracks: shared.len(),
            median_angle,
        })
    }

    /// Evaluates every pair of views and ranks those that could seed the reconstruction.
    ///
    /// Sorted by descending score. Ties go to the pair with the smaller sum of view ids, then the
    /// smaller first view id.
    pub fn best_initial_pairs(
        &self,
        ctx: &SfmContext<'_>,
        scene: &Scene,
    ) -> Vec<InitialPairCandidate> {
        self.ranked_initial_pairs(ctx, scene)
            .into_iter()
            .map(|(candidate, _)| candidate)
            .collect()
    }

    /// Ranks candidates along with the two-view reconstruction each was scored on.
    fn ranked_initial_pairs(
        &self,
        ctx: &SfmContext<'_>,
        scene: &Scene,
    ) -> Vec<(InitialPairCandidate, TwoView)> {
        let views: Vec<ViewId> = ctx
            .tracks
            .views()
            .filter(|view| scene.views.contains_key(view))
            .collect();
        let mut candidates: Vec<(InitialPairCandidate, TwoView)> = views
            .iter()
            .tuple_combinations()
            .map(|(&a, &b)| Pair::new(a, b))
            .filter_map(|pair| match self.two_view(ctx, scene, pair) {
                Ok(two_view) => {
                    let tracks: Vec<TrackId> =
                        two_view.landmarks.iter().map(|&(track, _)| track).collect();
                    let spread = std::cmp::min(
                        ctx.scorer.score(ctx.pyramid, pair.first(), &tracks),
                        ctx.scorer.score(ctx.pyramid, pair.second(), &tracks),
                    );
                    let candidate = InitialPairCandidate {
                        pair,
                        shared_tracks: two_view.shared_tracks,
                        landmarks: two_view.landmarks.len(),
                        median_angle: two_view.median_angle,
                        score: two_view.median_angle * spread as f64,
                    };
                    Some((candidate, two_view))
                }
                Err(InitialPairFailure::TooFewSharedTracks { .. }) => None,
                Err(failure) => {
                    debug!(
                        "rejecting initial pair ({}, {}): {}",
                        pair.first(),
                        pair.second(),
                        failure
                    );
                    None
                }
            })
            .collect();
        candidates.sort_by(|(x, _), (y, _)| {
            FloatOrd(y.score).cmp(&FloatOrd(x.score)).then_with(|| {
                (x.pair.first() + x.pair.second(), x.pair.first())
                    .cmp(&(y.pair.first() + y.pair.second(), y.pair.first()))
            })
        });
        candidates
    }

    /// Seeds the reconstruction from a pair: the first view gets the identity pose, the second the
    /// relative pose, and the accepted points become landmarks.
    ///
    /// Nothing is changed on failure. Returns the number of landmarks created.
    pub fn make_initial_pair_3d(
        &self,
        ctx: &SfmContext<'_>,
        state: &mut ReconstructionState,
        pair: Pair,
    ) -> Result<usize, ReconstructionError> {
        if pair.first() == pair.second() {
            return Err(ReconstructionError::RepeatedView(pair.first()));
        }
        for view in [pair.first(), pair.second()] {
            if !state.scene().views.contains_key(&view) {
                return Err(ReconstructionError::UnknownView(view));
            }
        }
        let two_view = self
            .two_view(ctx, state.scene(), pair)
            .map_err(|reason| ReconstructionError::InitialPairFailed { pair, reason })?;
        Ok(seed(state, pair, two_view))
    }

    /// Picks the initial pair and seeds the reconstruction from it.
    ///
    /// A configured pair is used as is. Otherwise candidates are tried best first, after consulting the
    /// prompt in interactive mode when the choice is ambiguous. Ranked candidates are seeded from the
    /// two-view reconstruction they were scored on.
    pub fn initialize(
        &self,
        ctx: &SfmContext<'_>,
        state: &mut ReconstructionState,
    ) -> Result<Pair, ReconstructionError> {
        if let Some(pair) = self.settings.initial_pair {
            info!(
                "using the configured initial pair ({}, {})",
                pair.first(),
                pair.second()
            );
            self.make_initial_pair_3d(ctx, state, pair)?;
            return Ok(pair);
        }

        let mut ranked = self.ranked_initial_pairs(ctx, state.scene());
        info!("found {} initial pair candidates", ranked.len());
        if self.settings.interactive && ranked.len() != 1 {
            match &self.initial_pair_prompt {
                Some(prompt) => {
                    let candidates: Vec<InitialPairCandidate> =
                        ranked.iter().map(|(candidate, _)| *candidate).collect();
                    if let Some(pair) = prompt(&candidates) {
                        info!("initial pair ({}, {}) chosen by prompt", pair.first(), pair.second());
                        let ranked_ix =
                            ranked.iter().position(|(candidate, _)| candidate.pair == pair);
                        if let Some(ix) = ranked_ix {
                            let (_, two_view) = ranked.swap_remove(ix);
                            seed(state, pair, two_view);
                            return Ok(pair);
                        }
                        match self.make_initial_pair_3d(ctx, state, pair) {
                            Ok(_) => return Ok(pair),
                            Err(e) => warn!("{}, falling back to the ranked pairs", e),
                        }
                    }
                }
                None => warn!("interactive mode is set, but there is no initial pair prompt"),
            }
        }

        match ranked.into_iter().next() {
            Some((candidate, two_view)) => {
                seed(state, candidate.pair, two_view);
                Ok(candidate.pair)
            }
            None => Err(ReconstructionError::NoInitialPair),
        }
    }
}

/// Applies a two-view reconstruction to the state. Returns the number of landmarks created.
fn seed(state: &mut ReconstructionState, pair: Pair, two_view: TwoView) -> usize {
    state.attach_pose(pair.first(), WorldToCamera::identity());
    state.attach_pose(pair.second(), two_view.pose);
    let created = two_view.landmarks.len();
    for (track, landmark) in two_view.landmarks {
        state.insert_landmark(track, landmark);
    }
    info!(
        "seeded from views {} and {} with {} landmarks and a median angle of {:.2} degrees",
        pair.first(),
        pair.second(),
        created,
        two_view.median_angle
    );
    created
}

/// The median of the values, averaging the middle two for an even count.
fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable_by_key(|&value| FloatOrd(value));
    let middle = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[middle - 1] + values[middle]) / 2.0
    } else {
        values[middle]
    })
}
