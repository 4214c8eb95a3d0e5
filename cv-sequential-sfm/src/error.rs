use crate::{IntrinsicsId, Pair, ViewId};
use thiserror::Error;

/// A failure that aborts the whole reconstruction.
#[derive(Debug, Error)]
pub enum ReconstructionError {
    /// Fewer than two views produced any track, so there is nothing to seed from.
    #[error("only {found} views produced tracks, at least 2 are required")]
    TooFewViews { found: usize },
    /// A view id was referenced that the scene does not contain.
    #[error("view {0} is not part of the scene")]
    UnknownView(ViewId),
    /// An initial pair names the same view twice.
    #[error("initial pair uses view {0} twice")]
    RepeatedView(ViewId),
    /// A view points at an intrinsics group that does not exist.
    #[error("view {view} references missing intrinsics group {intrinsics}")]
    MissingIntrinsics { view: ViewId, intrinsics: IntrinsicsId },
    /// No pair of views passed the initial pair requirements.
    #[error("no image pair satisfies the initial pair requirements")]
    NoInitialPair,
    /// The chosen initial pair could not be turned into a two-view reconstruction.
    #[error("initial pair ({}, {}) could not be reconstructed: {reason}", .pair.first(), .pair.second())]
    InitialPairFailed {
        pair: Pair,
        reason: InitialPairFailure,
    },
}

/// Why a two-view seed reconstruction was refused.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum InitialPairFailure {
    #[error("the views share {found} tracks, {required} are required")]
    TooFewSharedTracks { found: usize, required: usize },
    #[error("no consistent relative pose was found")]
    NoRelativePose,
    #[error("the median triangulation angle of {angle:.2} degrees is outside the accepted range")]
    AngleOutOfRange { angle: f64 },
    #[error("only {found} points triangulated, {required} are required")]
    TooFewLandmarks { found: usize, required: usize },
}

/// Error reported by a [`crate::BundleAdjuster`].
#[derive(Debug, Clone, Error)]
pub enum BundleAdjustmentError {
    /// The solver stopped before reaching its convergence criteria.
    #[error("the solver did not converge after {iterations} iterations")]
    NotConverged { iterations: usize },
    /// The problem could not be set up or solved.
    #[error("degenerate bundle adjustment problem: {0}")]
    Degenerate(String),
}
