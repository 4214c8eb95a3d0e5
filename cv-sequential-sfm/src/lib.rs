//! Incremental structure from motion.
//!
//! Given views with known or guessed intrinsics, their features, and putative pairwise matches,
//! [`SequentialSfm::process`] fuses the matches into tracks, seeds a reconstruction from the best
//! pair of views, and then grows it: views that see enough of the structure are resected in
//! batches, the tracks they reveal are triangulated, and the whole scene is periodically refined by
//! bundle adjustment followed by outlier rejection.
//!
//! Robust estimation, triangulation math, and bundle adjustment are supplied by the caller through
//! the [`Consensus`], [`Estimator`], [`TriangulatorObservations`], and [`BundleAdjuster`] traits.

mod camera;
mod connectivity;
mod consensus;
mod error;
mod export;
mod initial_pair;
mod pyramid;
mod refinement;
mod resection;
mod scene;
mod settings;
mod state;
mod statistics;
mod tracks;
mod triangulation;

pub use camera::*;
pub use connectivity::*;
pub use consensus::*;
pub use error::*;
pub use export::*;
pub use initial_pair::*;
pub use pyramid::*;
pub use refinement::*;
pub use resection::*;
pub use scene::*;
pub use settings::*;
pub use state::*;
pub use statistics::*;
pub use tracks::*;
pub use triangulation::*;

use cv_core::sample_consensus::{Consensus, Estimator};
use cv_core::{CameraToCamera, TriangulatorObservances as TriangulatorObservations, WorldToCamera};
use log::*;
use rand::Rng;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::Instant;

/// Everything a reconstruction starts from.
#[derive(Debug, Clone, Default)]
pub struct SfmInput {
    pub scene: Scene,
    pub features: FeaturesPerView,
    pub matches: PairwiseMatches,
}

/// The result of a reconstruction.
#[derive(Debug, Clone)]
pub struct SfmOutput {
    /// The reconstructed scene. Views without a pose could not be resected.
    pub scene: Scene,
    pub unreconstructed: BTreeSet<ViewId>,
    pub statistics: RunStatistics,
}

/// Read-only data shared by every stage of a run.
#[derive(Debug, Clone, Copy)]
pub struct SfmContext<'a> {
    pub features: &'a FeaturesPerView,
    pub tracks: &'a TrackIndex,
    pub scorer: &'a PyramidScorer,
    pub pyramid: &'a PyramidCache,
}

pub struct SequentialSfm<C, RE, PE, T, B, R> {
    /// Settings variables
    pub settings: SfmSettings,
    /// The consensus algorithm
    pub consensus: RefCell<C>,
    /// The relative pose estimator used on the initial pair
    pub relative_pose_estimator: RE,
    /// The absolute pose estimator used for resection
    pub pose_estimator: PE,
    /// The triangulation algorithm
    pub triangulator: T,
    /// The bundle adjustment algorithm
    pub bundle_adjuster: RefCell<B>,
    /// The random number generator
    pub rng: RefCell<R>,
    initial_pair_prompt: Option<Box<InitialPairPrompt>>,
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
    pub fn new(
        settings: SfmSettings,
        consensus: C,
        relative_pose_estimator: RE,
        pose_estimator: PE,
        triangulator: T,
        bundle_adjuster: B,
        rng: R,
    ) -> Self {
        Self {
            settings,
            consensus: RefCell::new(consensus),
            relative_pose_estimator,
            pose_estimator,
            triangulator,
            bundle_adjuster: RefCell::new(bundle_adjuster),
            rng: RefCell::new(rng),
            initial_pair_prompt: None,
        }
    }

    /// Sets the prompt consulted in interactive mode.
    pub fn initial_pair_prompt(
        self,
        prompt: impl Fn(&[InitialPairCandidate]) -> Option<Pair> + 'static,
    ) -> Self {
        Self {
            initial_pair_prompt: Some(Box::new(prompt)),
            ..self
        }
    }

    /// Runs the whole reconstruction.
    pub fn process(&self, input: SfmInput) -> Result<SfmOutput, ReconstructionError> {
        let started = Instant::now();
        let SfmInput {
            mut scene,
            features,
            matches,
        } = input;
        self.prepare_scene(&mut scene)?;
        let mut statistics = RunStatistics {
            views: scene.views.len(),
            ..RunStatistics::default()
        };
        let mut state = ReconstructionState::new(scene);

        let tracks = TrackIndex::build(&matches, self.settings.min_input_track_length);
        let views_with_tracks = tracks
            .views()
            .filter(|view| state.scene().views.contains_key(view))
            .count();
        if views_with_tracks < 2 {
            return Err(ReconstructionError::TooFewViews {
                found: views_with_tracks,
            });
        }
        let scorer = PyramidScorer::from_settings(&self.settings);
        let pyramid = PyramidCache::compute(&scorer, &tracks, &features, state.scene());
        let ctx = SfmContext {
            features: &features,
            tracks: &tracks,
            scorer: &scorer,
            pyramid: &pyramid,
        };
        statistics.tracks = tracks.len();
        statistics.timings.tracks = started.elapsed();
        state.advance(ReconstructionStage::TracksBuilt);

        let seed_started = Instant::now();
        state.advance(ReconstructionStage::Seed);
        statistics.initial_pair = Some(self.initialize(&ctx, &mut state)?);
        statistics.seed_landmarks = state.scene().landmarks.len();
        statistics.seed_refinement = Some(self.refine(&ctx, &mut state));
        self.write_snapshot(&state, "0000_seed");
        statistics.timings.seed = seed_started.elapsed();

        let growth_started = Instant::now();
        state.advance(ReconstructionStage::Grow);
        self.grow(&ctx, &mut state, &mut statistics);
        statistics.timings.growth = growth_started.elapsed();

        let final_started = Instant::now();
        statistics.final_refinement = Some(self.refine(&ctx, &mut state));
        state.advance(ReconstructionStage::Done);
        self.write_snapshot(&state, "final");
        state.sanity_check();
        statistics.timings.final_refinement = final_started.elapsed();

        statistics.residuals = compute_residuals_histogram(state.scene(), &features);
        statistics.track_lengths = compute_tracks_length_histogram(state.scene());
        statistics.reconstructed_views = state.reconstructed().len();
        statistics.landmarks = state.scene().landmarks.len();
        statistics.timings.total = started.elapsed();
        info!(
            "reconstructed {} of {} views with {} landmarks in {:?}",
            statistics.reconstructed_views,
            statistics.views,
            statistics.landmarks,
            statistics.timings.total
        );

        let unreconstructed = state.remaining().clone();
        Ok(SfmOutput {
            scene: state.into_scene(),
            unreconstructed,
            statistics,
        })
    }

    /// Checks that every view has intrinsics and gives unknown camera models the default model.
    fn prepare_scene(&self, scene: &mut Scene) -> Result<(), ReconstructionError> {
        for (&view, view_data) in &scene.views {
            if !scene.intrinsics.contains_key(&view_data.intrinsics) {
                return Err(ReconstructionError::MissingIntrinsics {
                    view,
                    intrinsics: view_data.intrinsics,
                });
            }
        }
        for (id, intrinsics) in &mut scene.intrinsics {
            if intrinsics.model == CameraModelKind::Unknown {
                intrinsics.resolve_model(self.settings.default_camera_model);
                debug!("intrinsics {} set to {:?}", id, intrinsics.model);
            }
        }
        Ok(())
    }

    /// Resects batches of views until no view can be added.
    ///
    /// Stops when no remaining view sees the structure, or after `max_stalled_rounds` consecutive
    /// rounds without an eligible view. Views that fail resection are deferred until the reconstruction
    /// grows, so the loop always ends.
    fn grow(
        &self,
        ctx: &SfmContext<'_>,
        state: &mut ReconstructionState,
        statistics: &mut RunStatistics,
    ) {
        let mut stalled = 0;
        let mut round = 0;
        loop {
            let connected = find_connected_views(ctx, state);
            if connected.is_empty() {
                info!("no remaining view sees the structure");
                break;
            }
            let batch = match select_resection_batch(&connected, state, &self.settings) {
                Some(batch) => batch,
                None => {
                    stalled += 1;
                    info!(
                        "{} views see the structure but none can be resected ({} stalled rounds)",
                        connected.len(),
                        stalled
                    );
                    if stalled >= self.settings.max_stalled_rounds.max(1) {
                        break;
                    }
                    continue;
                }
            };
            stalled = 0;
            round += 1;
            info!(
                "round {}: resecting {} views, {} reconstructed so far",
                round,
                batch.len(),
                state.reconstructed().len()
            );

            let resection = self.robust_resection_of_images(ctx, state, &batch);
            let triangulation = self.triangulate_new_tracks(ctx, state, &resection.resected);
            let refinement = (!resection.resected.is_empty()
                && round % self.settings.refinement_interval.max(1) == 0)
                .then(|| self.refine(ctx, state));
            if refinement.is_some() {
                self.write_snapshot(state, &format!("{:04}_grow", round));
            }
            state.sanity_check();

            statistics.rounds.push(RoundStatistics {
                round,
                batch,
                resected: resection.resected,
                rejected: resection.rejected.keys().copied().collect(),
                triangulation,
                refinement,
            });
        }
    }

    fn write_snapshot(&self, state: &ReconstructionState, label: &str) {
        let snapshot = match &self.settings.snapshot {
            Some(snapshot) => snapshot,
            None => return,
        };
        let path = snapshot.path(label);
        let result = File::create(&path).and_then(|file| {
            let mut writer = BufWriter::new(file);
            export_scene(&mut writer, state.scene(), snapshot.format, snapshot.contents)?;
            writer.flush()
        });
        match result {
            Ok(()) => debug!("wrote snapshot {}", path.display()),
            Err(e) => warn!("failed to write snapshot {}: {}", path.display(), e),
        }
    }
}
