//! Scores how evenly a set of observations covers an image.
//!
//! Level 0 is the whole image and level `k` splits it into `base^k` cells along each axis. Each
//! observation adds the weight of its level to the score for as long as the cell it falls into has
//! seen fewer than `threshold` observations. Finer levels weigh more, so spread-out observations
//! keep adding to the score where clustered ones saturate their cells.

use crate::{FeaturesPerView, Scene, SfmSettings, TrackId, TrackIndex, ViewId};
use cv_core::nalgebra::Point2;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PyramidScorer {
    base: usize,
    threshold: usize,
    /// Weight of each level, from the whole image down.
    weights: Vec<usize>,
}

impl PyramidScorer {
    /// Creates a scorer with `depth` levels below the whole image.
    ///
    /// The depth is capped so that the cell count of the finest level fits in a `usize`.
    pub fn new(base: usize, depth: usize, threshold: usize) -> Self {
        let base = base.max(2);
        Self {
            base,
            threshold: threshold.max(1),
            weights: (0..=depth)
                .map_while(|level| {
                    let level = u32::try_from(level).ok()?;
                    base.checked_pow(level.checked_mul(2)?)?;
                    Some(base.pow(level))
                })
                .collect(),
        }
    }

    pub fn from_settings(settings: &SfmSettings) -> Self {
        Self::new(
            settings.pyramid_base,
            settings.pyramid_depth,
            settings.pyramid_threshold,
        )
    }

    /// The number of levels including the whole image.
    pub fn levels(&self) -> usize {
        self.weights.len()
    }

    pub fn cells_per_axis(&self, level: usize) -> usize {
        self.base.pow(level as u32)
    }

    /// The cell index of `point` at every level, from the whole image down.
    ///
    /// Points outside the image are clamped onto its border cells.
    pub fn cells(&self, point: Point2<f64>, width: u32, height: u32) -> Vec<usize> {
        (0..self.levels())
            .map(|level| {
                let cells = self.cells_per_axis(level);
                let column = axis_cell(point.x, width, cells);
                let row = axis_cell(point.y, height, cells);
                row * cells + column
            })
            .collect()
    }

    /// The score of the observations of `tracks` in `view`.
    ///
    /// Tracks without a cached cell in the view are ignored.
    pub fn score<'a>(
        &self,
        cache: &PyramidCache,
        view: ViewId,
        tracks: impl IntoIterator<Item = &'a TrackId>,
    ) -> usize {
        self.score_cells(tracks.into_iter().filter_map(|&track| cache.cells(view, track)))
    }

    fn score_cells<'a>(&self, observations: impl Iterator<Item = &'a [usize]>) -> usize {
        let mut counts: Vec<HashMap<usize, usize>> = vec![HashMap::new(); self.levels()];
        let mut score: usize = 0;
        for cells in observations {
            for ((&cell, counts), &weight) in cells.iter().zip(&mut counts).zip(&self.weights) {
                let count = counts.entry(cell).or_default();
                if *count < self.threshold {
                    score = score.saturating_add(weight);
                }
                *count += 1;
            }
        }
        score
    }
}

fn axis_cell(coordinate: f64, extent: u32, cells: usize) -> usize {
    if extent == 0 || !coordinate.is_finite() || coordinate <= 0.0 {
        return 0;
    }
    let cell = (coordinate / f64::from(extent) * cells as f64) as usize;
    cell.min(cells - 1)
}

/// The pyramid cells of every `(view, track)` observation, computed once before reconstruction.
#[derive(Debug, Clone, Default)]
pub struct PyramidCache {
    cells: BTreeMap<ViewId, HashMap<TrackId, Vec<usize>>>,
}

impl PyramidCache {
    pub fn compute(
        scorer: &PyramidScorer,
        tracks: &TrackIndex,
        features: &FeaturesPerView,
        scene: &Scene,
    ) -> Self {
        let mut cache = Self::default();
        for (track_id, track) in tracks.tracks() {
            for (&view, &feature) in &track.observations {
                let (view_data, feature) =
                    match (scene.views.get(&view), features.feature(view, feature)) {
                        (Some(view_data), Some(feature)) => (view_data, feature),
                        _ => continue,
                    };
                cache.cells.entry(view).or_default().insert(
                    track_id,
                    scorer.cells(feature.point, view_data.width, view_data.height),
                );
            }
        }
        cache
    }

    pub fn cells(&self, view: ViewId, track: TrackId) -> Option<&[usize]> {
        self.cells.get(&view)?.get(&track).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer() -> PyramidScorer {
        PyramidScorer::new(2, 3, 1)
    }

    fn score_points(scorer: &PyramidScorer, points: &[(f64, f64)]) -> usize {
        let cells: Vec<Vec<usize>> = points
            .iter()
            .map(|&(x, y)| scorer.cells(Point2::new(x, y), 800, 800))
            .collect();
        scorer.score_cells(cells.iter().map(Vec::as_slice))
    }

    #[test]
    fn cells_are_clamped_to_the_image() {
        let scorer = scorer();
        assert_eq!(scorer.cells(Point2::new(0.0, 0.0), 800, 800), vec![0, 0, 0, 0]);
        assert_eq!(
            scorer.cells(Point2::new(799.9, 799.9), 800, 800),
            vec![0, 3, 15, 63]
        );
        assert_eq!(
            scorer.cells(Point2::new(900.0, -5.0), 800, 800),
            vec![0, 1, 3, 7]
        );
    }

    #[test]
    fn spread_observations_beat_clustered_ones() {
        let scorer = scorer();
        // Four points in four different finest cells, one per image quadrant.
        let spread = [(50.0, 50.0), (650.0, 50.0), (50.0, 650.0), (650.0, 650.0)];
        // Four points inside a single finest cell.
        let clustered = [(10.0, 10.0), (20.0, 20.0), (30.0, 30.0), (40.0, 40.0)];
        let spread = score_points(&scorer, &spread);
        let clustered = score_points(&scorer, &clustered);
        assert_eq!(clustered, 1 + 2 + 4 + 8);
        assert_eq!(spread, 1 + 4 * (2 + 4 + 8));
        assert!(spread > clustered);
    }

    #[test]
    fn deep_pyramids_are_capped() {
        let scorer = PyramidScorer::new(2, 100, 1);
        assert_eq!(scorer.levels(), (usize::BITS / 2) as usize);
        let cells = scorer.cells(Point2::new(900.0, 900.0), 800, 800);
        assert_eq!(cells.len(), scorer.levels());
        let finest = scorer.cells_per_axis(scorer.levels() - 1);
        assert_eq!(cells.last().copied(), Some(finest * finest - 1));
        assert_eq!(PyramidScorer::new(3, 2, 1).levels(), 3);
    }

    #[test]
    fn threshold_saturates_cells() {
        let clustered = [(10.0, 10.0), (20.0, 20.0), (30.0, 30.0), (40.0, 40.0)];
        let scorer = PyramidScorer::new(2, 3, 3);
        assert_eq!(score_points(&scorer, &clustered), 3 * (1 + 2 + 4 + 8));
    }
}
