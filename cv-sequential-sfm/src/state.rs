use crate::{Landmark, Scene, TrackId, ViewId};
use cv_core::WorldToCamera;
use log::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The stages a reconstruction moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum ReconstructionStage {
    Init,
    TracksBuilt,
    Seed,
    Grow,
    Done,
}

impl fmt::Display for ReconstructionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReconstructionStage::Init => "init",
            ReconstructionStage::TracksBuilt => "tracks built",
            ReconstructionStage::Seed => "seed",
            ReconstructionStage::Grow => "grow",
            ReconstructionStage::Done => "done",
        };
        f.write_str(name)
    }
}

/// The scene under construction and the bookkeeping that drives the growth loop.
///
/// Every view of the scene is either reconstructed or remaining, never both. A view moves from
/// remaining to reconstructed exactly once, when its pose is attached.
#[derive(Debug, Clone)]
pub struct ReconstructionState {
    scene: Scene,
    stage: ReconstructionStage,
    reconstructed: BTreeSet<ViewId>,
    remaining: BTreeSet<ViewId>,
    /// Tracks whose landmark was rejected. They are never triangulated again.
    retired_tracks: BTreeSet<TrackId>,
    /// Size of the reconstructed set when the view last failed resection.
    deferred: BTreeMap<ViewId, usize>,
}

impl ReconstructionState {
    /// Starts a reconstruction of `scene` with every view remaining.
    ///
    /// Poses and landmarks already present in the scene are discarded.
    pub fn new(mut scene: Scene) -> Self {
        let mut discarded = 0;
        for view in scene.views.values_mut() {
            discarded += usize::from(view.pose.take().is_some());
        }
        if discarded != 0 || !scene.landmarks.is_empty() {
            warn!(
                "discarding {} input poses and {} input landmarks",
                discarded,
                scene.landmarks.len()
            );
            scene.landmarks.clear();
        }
        let remaining = scene.views.keys().copied().collect();
        Self {
            scene,
            stage: ReconstructionStage::Init,
            reconstructed: BTreeSet::new(),
            remaining,
            retired_tracks: BTreeSet::new(),
            deferred: BTreeMap::new(),
        }
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    /// Mutable access for refinement. Poses must not be added or removed through this.
    pub(crate) fn scene_mut(&mut self) -> &mut Scene {
        &mut self.scene
    }

    pub fn into_scene(self) -> Scene {
        self.scene
    }

    pub fn stage(&self) -> ReconstructionStage {
        self.stage
    }

    /// Moves to `stage`. Stages only ever advance.
    pub fn advance(&mut self, stage: ReconstructionStage) {
        if stage < self.stage {
            error!(
                "refusing to move the reconstruction back from {} to {}",
                self.stage, stage
            );
            return;
        }
        if stage != self.stage {
            info!("reconstruction stage: {} -> {}", self.stage, stage);
            self.stage = stage;
        }
    }

    pub fn reconstructed(&self) -> &BTreeSet<ViewId> {
        &self.reconstructed
    }

    pub fn remaining(&self) -> &BTreeSet<ViewId> {
        &self.remaining
    }

    pub fn is_reconstructed(&self, view: ViewId) -> bool {
        self.reconstructed.contains(&view)
    }

    /// Attaches the pose of a remaining view and marks it reconstructed.
    ///
    /// Returns `false` and changes nothing if the view is not remaining.
    pub fn attach_pose(&mut self, view: ViewId, pose: WorldToCamera) -> bool {
        if !self.remaining.remove(&view) {
            error!("tried to attach a pose to view {} which is not remaining", view);
            return false;
        }
        if let Some(view_data) = self.scene.views.get_mut(&view) {
            view_data.pose = Some(pose);
        }
        self.reconstructed.insert(view);
        self.deferred.remove(&view);
        true
    }

    /// Replaces the pose of a reconstructed view.
    pub(crate) fn update_pose(&mut self, view: ViewId, pose: WorldToCamera) -> bool {
        match self.scene.views.get_mut(&view) {
            Some(view_data) if self.reconstructed.contains(&view) => {
                view_data.pose = Some(pose);
                true
            }
            _ => false,
        }
    }

    /// Holds back a view that failed resection until the reconstruction grows.
    pub fn defer(&mut self, view: ViewId) {
        self.deferred.insert(view, self.reconstructed.len());
    }

    pub fn is_deferred(&self, view: ViewId) -> bool {
        self.deferred
            .get(&view)
            .map_or(false, |&size| size >= self.reconstructed.len())
    }

    pub fn insert_landmark(&mut self, track: TrackId, landmark: Landmark) {
        self.scene.landmarks.insert(track, landmark);
    }

    /// Removes a landmark and retires its track.
    pub fn remove_landmark(&mut self, track: TrackId) -> Option<Landmark> {
        self.retired_tracks.insert(track);
        self.scene.landmarks.remove(&track)
    }

    pub fn is_retired(&self, track: TrackId) -> bool {
        self.retired_tracks.contains(&track)
    }

    pub fn retired_tracks(&self) -> &BTreeSet<TrackId> {
        &self.retired_tracks
    }

    /// Checks the invariants of the state, logging every violation.
    ///
    /// Use this gratuitously while debugging; it is cheap compared to a refinement pass.
    pub fn sanity_check(&self) -> bool {
        let mut sane = true;
        if let Some(view) = self.reconstructed.intersection(&self.remaining).next() {
            error!("SANITY CHECK FAILURE: view {} is both reconstructed and remaining", view);
            sane = false;
        }
        let tracked: BTreeSet<ViewId> = self
            .reconstructed
            .union(&self.remaining)
            .copied()
            .collect();
        let all: BTreeSet<ViewId> = self.scene.views.keys().copied().collect();
        if tracked != all {
            error!("SANITY CHECK FAILURE: reconstructed and remaining views do not cover the scene");
            sane = false;
        }
        for (&view, view_data) in &self.scene.views {
            if view_data.pose.is_some() != self.reconstructed.contains(&view) {
                error!(
                    "SANITY CHECK FAILURE: view {} has pose {} but reconstructed {}",
                    view,
                    view_data.pose.is_some(),
                    self.reconstructed.contains(&view)
                );
                sane = false;
            }
        }
        for (track, landmark) in &self.scene.landmarks {
            if landmark.observations.len() < 2 {
                error!(
                    "SANITY CHECK FAILURE: landmark {} has {} observations",
                    track,
                    landmark.observations.len()
                );
                sane = false;
            }
            if let Some(view) = landmark
                .observations
                .keys()
                .find(|view| !self.reconstructed.contains(view))
            {
                error!(
                    "SANITY CHECK FAILURE: landmark {} is observed by view {} which has no pose",
                    track, view
                );
                sane = false;
            }
            if self.retired_tracks.contains(track) {
                error!("SANITY CHECK FAILURE: landmark {} was resurrected", track);
                sane = false;
            }
        }
        sane
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CameraModelKind, Intrinsics, View};
    use cv_core::nalgebra::{Point2, Point3};
    use cv_core::Pose;
    use maplit::btreemap;

    fn scene() -> Scene {
        let mut scene = Scene::new();
        scene.add_intrinsics(
            0,
            Intrinsics::new(CameraModelKind::Pinhole, 100.0, Point2::new(50.0, 50.0)),
        );
        for view in 0..3 {
            scene.add_view(view, View::new(0, 100, 100));
        }
        scene
    }

    #[test]
    fn views_move_from_remaining_to_reconstructed_once() {
        let mut state = ReconstructionState::new(scene());
        assert_eq!(state.remaining().len(), 3);
        assert!(state.attach_pose(1, WorldToCamera::identity()));
        assert!(!state.attach_pose(1, WorldToCamera::identity()));
        assert!(state.is_reconstructed(1));
        assert!(!state.remaining().contains(&1));
        assert!(state.sanity_check());
    }

    #[test]
    fn deferral_lasts_until_growth() {
        let mut state = ReconstructionState::new(scene());
        state.attach_pose(0, WorldToCamera::identity());
        state.defer(2);
        assert!(state.is_deferred(2));
        state.attach_pose(1, WorldToCamera::identity());
        assert!(!state.is_deferred(2));
    }

    #[test]
    fn removed_landmarks_are_retired() {
        let mut state = ReconstructionState::new(scene());
        state.attach_pose(0, WorldToCamera::identity());
        state.attach_pose(1, WorldToCamera::identity());
        state.insert_landmark(
            4,
            Landmark {
                point: Point3::new(0.0, 0.0, 1.0),
                color: [0; 3],
                observations: btreemap! {0 => 0, 1 => 0},
            },
        );
        assert!(state.sanity_check());
        assert!(state.remove_landmark(4).is_some());
        assert!(state.is_retired(4));
        assert!(state.scene().landmarks.is_empty());
    }

    #[test]
    fn stages_only_advance() {
        let mut state = ReconstructionState::new(scene());
        state.advance(ReconstructionStage::Seed);
        state.advance(ReconstructionStage::TracksBuilt);
        assert_eq!(state.stage(), ReconstructionStage::Seed);
    }
}
