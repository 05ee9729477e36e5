//! Baseline-and-threshold detection.
//!
//! The classic detector: subtract a rolling-median baseline so slow drift
//! cannot masquerade as events, then accept signed excursions past an
//! adaptive prominence floor. The floor never drops below twice the robust
//! noise scale, so a threshold tuned on a quiet recording does not flood
//! the result table when applied to a noisier one.

use crate::{
    baseline,
    detectors::{Detection, Diagnostics, Direction, peaks},
    error::{AnalysisError, EngineResult, ErrorLocation},
    noise,
};
use ephys_common::{Real, Trace};

const LOCATION: ErrorLocation = ErrorLocation::ThresholdDetector;

/// Settings for [`detect_events`].
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdSettings {
    /// Deflection direction the threshold applies to.
    pub direction: Direction,
    /// Signed acceptance threshold on the baseline-corrected trace. Its
    /// sign must agree with `direction`.
    pub threshold: Real,
    /// Minimum spacing between events, in seconds. Candidates inside the
    /// refractory distance merge to the larger one.
    pub refractory_s: Real,
    /// Width of the rolling-median baseline window, in milliseconds.
    pub baseline_window_ms: Real,
    /// Estimate noise over the quietest window of the corrected trace
    /// instead of the whole of it.
    pub use_stable_window: bool,
    /// Stable-window length in seconds, used when `use_stable_window`.
    pub stable_window_s: Real,
    /// Stable-window search step in seconds, used when `use_stable_window`.
    pub stable_step_s: Real,
    /// Minimum half-height width of an event, in milliseconds.
    pub min_width_ms: Real,
    /// Mask high-slope spans (stimulus artifacts) out of the candidates.
    pub reject_artifacts: bool,
    /// Gradient magnitude threshold, in robust standard deviations of the
    /// gradient.
    pub artifact_slope_sd: Real,
    /// Half-width by which the artifact mask is dilated, in milliseconds.
    pub artifact_dilation_ms: Real,
}

impl Default for ThresholdSettings {
    fn default() -> Self {
        Self {
            direction: Direction::Negative,
            threshold: -5.0,
            refractory_s: 0.002,
            baseline_window_ms: 200.0,
            use_stable_window: false,
            stable_window_s: 0.1,
            stable_step_s: 0.025,
            min_width_ms: 0.2,
            reject_artifacts: false,
            artifact_slope_sd: 8.0,
            artifact_dilation_ms: 1.0,
        }
    }
}

impl ThresholdSettings {
    fn validate(&self) -> EngineResult<()> {
        if !self.threshold.is_finite() || self.threshold == 0.0 {
            return Err(AnalysisError::invalid_parameter(
                LOCATION,
                "threshold",
                format!("must be a finite nonzero value, got {}", self.threshold),
            ));
        }
        let agrees = match self.direction {
            Direction::Positive => self.threshold > 0.0,
            Direction::Negative => self.threshold < 0.0,
        };
        if !agrees {
            return Err(AnalysisError::invalid_parameter(
                LOCATION,
                "threshold",
                format!(
                    "sign of {} disagrees with direction {}",
                    self.threshold, self.direction
                ),
            ));
        }
        if !self.refractory_s.is_finite() || self.refractory_s < 0.0 {
            return Err(AnalysisError::invalid_parameter(
                LOCATION,
                "refractory_s",
                format!("must be non-negative, got {}", self.refractory_s),
            ));
        }
        if !self.baseline_window_ms.is_finite() || self.baseline_window_ms <= 0.0 {
            return Err(AnalysisError::invalid_parameter(
                LOCATION,
                "baseline_window_ms",
                format!("must be positive, got {}", self.baseline_window_ms),
            ));
        }
        if !self.min_width_ms.is_finite() || self.min_width_ms < 0.0 {
            return Err(AnalysisError::invalid_parameter(
                LOCATION,
                "min_width_ms",
                format!("must be non-negative, got {}", self.min_width_ms),
            ));
        }
        if !self.artifact_slope_sd.is_finite() || self.artifact_slope_sd <= 0.0 {
            return Err(AnalysisError::invalid_parameter(
                LOCATION,
                "artifact_slope_sd",
                format!("must be positive, got {}", self.artifact_slope_sd),
            ));
        }
        if !self.artifact_dilation_ms.is_finite() || self.artifact_dilation_ms < 0.0 {
            return Err(AnalysisError::invalid_parameter(
                LOCATION,
                "artifact_dilation_ms",
                format!("must be non-negative, got {}", self.artifact_dilation_ms),
            ));
        }
        Ok(())
    }
}

/// Detects threshold-crossing events on the baseline-corrected trace.
///
/// Scores are the signed corrected amplitudes at the accepted indices.
/// An all-quiet trace returns zero events, which is `Ok`, not an error.
#[tracing::instrument(skip_all, fields(trace_len = trace.len()))]
pub fn detect_events(trace: &Trace, settings: &ThresholdSettings) -> EngineResult<Detection> {
    settings.validate()?;
    if trace.is_empty() {
        return Ok(Detection::default());
    }

    let samples_per_ms = trace.sampling_rate() / 1000.0;
    let baseline_len = (settings.baseline_window_ms * samples_per_ms).round().max(1.0) as usize;
    let baseline = baseline::rolling_median(trace.samples(), baseline_len);
    let corrected: Vec<Real> = trace
        .samples()
        .iter()
        .zip(&baseline)
        .map(|(sample, level)| sample - level)
        .collect();

    let noise_scale = if settings.use_stable_window {
        let (start, end) =
            baseline::find_stable_window(trace, settings.stable_window_s, settings.stable_step_s)?;
        noise::estimate_noise(&corrected[start..end])
    } else {
        noise::estimate_noise(&corrected)
    };
    let prominence = settings.threshold.abs().max(2.0 * noise_scale);

    let sign = settings.direction.sign();
    let oriented: Vec<Real> = corrected.iter().map(|value| value * sign).collect();
    let refractory = (settings.refractory_s * trace.sampling_rate()).round() as usize;
    let min_width = settings.min_width_ms * samples_per_ms;
    let mut search = peaks::find_peaks(&oriented, prominence, refractory, min_width);

    let mut masked_samples = 0;
    let mut rejected_artifact = 0;
    if settings.reject_artifacts {
        let dilation = (settings.artifact_dilation_ms * samples_per_ms).round() as usize;
        let mask = artifact_mask(trace.samples(), settings.artifact_slope_sd, dilation);
        masked_samples = mask.iter().filter(|masked| **masked).count();
        search.accepted.retain(|candidate| {
            if mask[candidate.index] {
                rejected_artifact += 1;
                return false;
            }
            true
        });
    }

    let diagnostics = Diagnostics {
        noise_scale,
        prominence_floor: Some(prominence),
        kernel_len: None,
        fft_len: None,
        candidates: search.seen,
        rejected_width: search.rejected_width,
        rejected_separation: search.rejected_separation,
        rejected_artifact,
        masked_samples,
        transformed: corrected,
    };
    tracing::debug!(
        events = search.accepted.len(),
        candidates = diagnostics.candidates,
        prominence,
        "threshold detection finished"
    );
    Ok(Detection {
        indices: search.accepted.iter().map(|candidate| candidate.index).collect(),
        scores: search
            .accepted
            .iter()
            .map(|candidate| candidate.score * sign)
            .collect(),
        diagnostics,
    })
}

/// Marks samples whose gradient magnitude is an outlier against the
/// gradient's own robust scale, then dilates each mark by `dilation`
/// samples to cover an artifact's flanks.
fn artifact_mask(samples: &[Real], slope_sd: Real, dilation: usize) -> Vec<bool> {
    let len = samples.len();
    let mut gradient = vec![0.0; len];
    for index in 1..len.saturating_sub(1) {
        gradient[index] = (samples[index + 1] - samples[index - 1]) / 2.0;
    }
    let scale = noise::estimate_noise(&gradient);
    if scale <= 0.0 {
        return vec![false; len];
    }
    let centre = noise::median(&gradient);

    let mut mask: Vec<bool> = gradient
        .iter()
        .map(|slope| ((slope - centre) / scale).abs() > slope_sd)
        .collect();
    dilate(&mut mask, dilation);
    mask
}

fn dilate(mask: &mut [bool], radius: usize) {
    if radius == 0 {
        return;
    }
    let seeds: Vec<usize> = mask
        .iter()
        .enumerate()
        .filter(|(_, marked)| **marked)
        .map(|(index, _)| index)
        .collect();
    for seed in seeds {
        let start = seed.saturating_sub(radius);
        let end = (seed + radius + 1).min(mask.len());
        for slot in &mut mask[start..end] {
            *slot = true;
        }
    }
}
