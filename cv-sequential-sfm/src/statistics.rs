use crate::{FeaturesPerView, Pair, RefinementReport, Scene, TriangulationReport, ViewId};
use average::Mean;
use std::collections::BTreeSet;
use std::time::Duration;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Number of bins of the residual histogram.
const RESIDUAL_BINS: usize = 10;

/// Equal-width bins over `[start, end]`. Values outside the range are counted separately.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Histogram {
    pub start: f64,
    pub end: f64,
    pub bins: Vec<usize>,
    pub underflow: usize,
    pub overflow: usize,
}

impl Histogram {
    pub fn new(start: f64, end: f64, bins: usize) -> Self {
        let end = if end > start { end } else { start + 1.0 };
        Self {
            start,
            end,
            bins: vec![0; bins.max(1)],
            underflow: 0,
            overflow: 0,
        }
    }

    pub fn add(&mut self, value: f64) {
        if value < self.start {
            self.underflow += 1;
        } else if value > self.end || value.is_nan() {
            self.overflow += 1;
        } else {
            let last = self.bins.len() - 1;
            let bin = ((value - self.start) / (self.end - self.start) * self.bins.len() as f64)
                as usize;
            self.bins[bin.min(last)] += 1;
        }
    }

    /// The number of values that fell inside the range.
    pub fn count(&self) -> usize {
        self.bins.iter().sum()
    }

    /// The lower edge of every bin.
    pub fn bin_starts(&self) -> impl Iterator<Item = f64> + '_ {
        let width = (self.end - self.start) / self.bins.len() as f64;
        (0..self.bins.len()).map(move |bin| self.start + bin as f64 * width)
    }
}

/// Distribution of the pixel reprojection errors of every observation.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct ResidualStatistics {
    pub mean_squared_error: f64,
    pub histogram: Histogram,
}

/// Distribution of the number of observations per landmark.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct TrackLengthStatistics {
    pub mean_length: f64,
    /// One bin per length, starting at the shortest.
    pub histogram: Histogram,
}

/// Computes the reprojection error histogram and mean squared error of the scene.
///
/// Returns `None` if there is no observation to measure.
pub fn compute_residuals_histogram(
    scene: &Scene,
    features: &FeaturesPerView,
) -> Option<ResidualStatistics> {
    let residuals: Vec<f64> = scene
        .landmarks
        .values()
        .flat_map(|landmark| {
            landmark
                .observations
                .iter()
                .filter_map(move |(&view, &feature)| {
                    scene.reprojection_error(features, view, feature, &landmark.point)
                })
        })
        .collect();
    if residuals.is_empty() {
        return None;
    }
    let max = residuals.iter().copied().fold(0.0, f64::max);
    let mut histogram = Histogram::new(0.0, max, RESIDUAL_BINS);
    for &residual in &residuals {
        histogram.add(residual);
    }
    let mse: Mean = residuals.iter().map(|residual| residual * residual).collect();
    Some(ResidualStatistics {
        mean_squared_error: mse.mean(),
        histogram,
    })
}

/// Computes the histogram of landmark observation counts.
///
/// Returns `None` for a scene without landmarks.
pub fn compute_tracks_length_histogram(scene: &Scene) -> Option<TrackLengthStatistics> {
    let lengths: Vec<usize> = scene
        .landmarks
        .values()
        .map(|landmark| landmark.observations.len())
        .collect();
    let min = *lengths.iter().min()?;
    let max = *lengths.iter().max()?;
    let mut histogram = Histogram::new(min as f64, (max + 1) as f64, max + 1 - min);
    for &length in &lengths {
        histogram.add(length as f64);
    }
    let mean: Mean = lengths.iter().map(|&length| length as f64).collect();
    Some(TrackLengthStatistics {
        mean_length: mean.mean(),
        histogram,
    })
}

/// What happened in one round of the growth loop.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct RoundStatistics {
    pub round: usize,
    pub batch: Vec<ViewId>,
    pub resected: BTreeSet<ViewId>,
    pub rejected: BTreeSet<ViewId>,
    pub triangulation: TriangulationReport,
    /// Absent when the refinement interval skipped this round.
    pub refinement: Option<RefinementReport>,
}

/// Wall time spent in each stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct StageTimings {
    pub tracks: Duration,
    pub seed: Duration,
    pub growth: Duration,
    pub final_refinement: Duration,
    pub total: Duration,
}

/// A record of a whole reconstruction run.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct RunStatistics {
    pub views: usize,
    pub tracks: usize,
    pub initial_pair: Option<Pair>,
    pub seed_landmarks: usize,
    pub seed_refinement: Option<RefinementReport>,
    pub rounds: Vec<RoundStatistics>,
    pub final_refinement: Option<RefinementReport>,
    pub reconstructed_views: usize,
    pub landmarks: usize,
    pub residuals: Option<ResidualStatistics>,
    pub track_lengths: Option<TrackLengthStatistics>,
    pub timings: StageTimings,
}
