//! Event detectors.
//!
//! Both detectors reduce a trace to a list of sample indices plus
//! per-candidate scores and shared diagnostics. Everything either detector
//! measures against a bound (threshold, separation, width) comes in through
//! its settings struct; the only internal constants are numerical
//! tolerances.

pub mod deconvolution;
pub(crate) mod peaks;
pub mod threshold;

use ephys_common::Real;

/// Signed deflection an analysis is looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
    Positive,
    Negative,
}

impl Direction {
    pub(crate) fn sign(&self) -> Real {
        match self {
            Self::Positive => 1.0,
            Self::Negative => -1.0,
        }
    }
}

/// Outcome of one detection call.
///
/// `indices` and `scores` are parallel and ascending in index. Zero events
/// is a valid outcome, not an error.
#[derive(Debug, Clone, Default)]
pub struct Detection {
    pub indices: Vec<usize>,
    pub scores: Vec<Real>,
    pub diagnostics: Diagnostics,
}

/// Detection byproducts kept for result tables and overlays.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    /// Noise scale the acceptance bound was derived from.
    pub noise_scale: Real,
    /// Effective prominence floor (threshold detector only).
    pub prominence_floor: Option<Real>,
    /// Kernel and FFT lengths (deconvolution detector only).
    pub kernel_len: Option<usize>,
    pub fft_len: Option<usize>,
    /// Candidates seen before the policy filters.
    pub candidates: usize,
    pub rejected_width: usize,
    pub rejected_separation: usize,
    pub rejected_artifact: usize,
    /// Samples excluded by the artifact mask.
    pub masked_samples: usize,
    /// The signal detection actually ran on (z-scored deconvolution or
    /// baseline-corrected trace), for overlay rendering.
    pub transformed: Vec<Real>,
}
