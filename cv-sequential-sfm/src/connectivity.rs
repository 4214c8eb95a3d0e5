use crate::{ReconstructionState, SfmContext, SfmSettings, TrackId, ViewId};
use log::*;
use std::cmp::Reverse;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// How strongly a remaining view is connected to the current structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct ViewConnectionScore {
    pub view: ViewId,
    /// Tracks of the view that already have a landmark.
    pub shared_observations: usize,
    /// Pyramid score of those observations.
    pub score: usize,
    pub intrinsics_known: bool,
}

/// Ranks the remaining views that observe at least one landmark.
///
/// Sorted by descending score, then descending number of shared observations, then ascending view id.
/// An empty result means nothing more can be resected.
pub fn find_connected_views(
    ctx: &SfmContext<'_>,
    state: &ReconstructionState,
) -> Vec<ViewConnectionScore> {
    let scene = state.scene();
    let mut connected: Vec<ViewConnectionScore> = state
        .remaining()
        .iter()
        .filter_map(|&view| {
            let shared: Vec<TrackId> = ctx
                .tracks
                .tracks_of_view(view)
                .iter()
                .copied()
                .filter(|track| scene.landmarks.contains_key(track))
                .collect();
            if shared.is_empty() {
                return None;
            }
            Some(ViewConnectionScore {
                view,
                shared_observations: shared.len(),
                score: ctx.scorer.score(ctx.pyramid, view, &shared),
                intrinsics_known: scene
                    .view_intrinsics(view)
                    .map_or(false, |intrinsics| intrinsics.initialized),
            })
        })
        .collect();
    connected.sort_by_key(|candidate| {
        (
            Reverse(candidate.score),
            Reverse(candidate.shared_observations),
            candidate.view,
        )
    });
    debug!("{} remaining views see the structure", connected.len());
    connected
}

/// Picks the views to resect this round from a ranking made by [`find_connected_views`].
///
/// Views with fewer than `min_points_per_pose` shared observations, and views deferred after a
/// failed resection, are skipped. The batch is the best remaining candidate plus every following one
/// scoring at least `batch_score_ratio` of it, at most `max_batch_size` views.
/// Returns `None` when no view qualifies.
pub fn select_resection_batch(
    connected: &[ViewConnectionScore],
    state: &ReconstructionState,
    settings: &SfmSettings,
) -> Option<Vec<ViewId>> {
    let mut eligible = connected.iter().filter(|candidate| {
        candidate.shared_observations >= settings.min_points_per_pose
            && !state.is_deferred(candidate.view)
    });
    let best = eligible.next()?;
    let cutoff = best.score as f64 * settings.batch_score_ratio;
    let batch: Vec<ViewId> = std::iter::once(best)
        .chain(eligible.take_while(|candidate| candidate.score as f64 >= cutoff))
        .take(settings.max_batch_size.max(1))
        .map(|candidate| candidate.view)
        .collect();
    debug!(
        "selected {} views for resection out of {} connected",
        batch.len(),
        connected.len()
    );
    Some(batch)
}
