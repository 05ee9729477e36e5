//! Per-event kinetics.
//!
//! Every interval here (half-width, 10–90% rise, 90–10% decay) comes from
//! linearly interpolated level crossings, not integer sample indices. At a
//! typical 10 kHz a fast event rises through the 10–90% band in a handful
//! of samples, and integer crossings would quantize the measurement to the
//! sample grid. Measurements that cannot be made are NaN, never zero: zero
//! is a valid physical value and silently corrupts downstream means.

use crate::{
    detectors::Direction,
    error::{AnalysisError, EngineResult, ErrorLocation},
    noise,
};
use ephys_common::{Real, Trace};

const LOCATION: ErrorLocation = ErrorLocation::FeatureExtractor;

/// Settings for [`extract_event_features`].
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSettings {
    /// Deflection direction the events were detected in.
    pub direction: Direction,
    /// Length of the pre-event baseline window, in milliseconds.
    pub baseline_window_ms: Real,
    /// Forward extent of one event's measurement span, in milliseconds.
    pub event_window_ms: Real,
}

impl Default for FeatureSettings {
    fn default() -> Self {
        Self {
            direction: Direction::Negative,
            baseline_window_ms: 5.0,
            event_window_ms: 50.0,
        }
    }
}

impl FeatureSettings {
    fn validate(&self) -> EngineResult<()> {
        for (name, value) in [
            ("baseline_window_ms", self.baseline_window_ms),
            ("event_window_ms", self.event_window_ms),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(AnalysisError::invalid_parameter(
                    LOCATION,
                    name,
                    format!("must be positive, got {value}"),
                ));
            }
        }
        Ok(())
    }
}

/// Kinetics of one detected event. Unmeasurable quantities are NaN.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    /// Sample index of the event peak.
    pub index: usize,
    /// Peak time in seconds, from the trace's time vector.
    pub time: Real,
    /// Signed peak deflection relative to the local baseline.
    pub amplitude: Real,
    /// Local baseline level the amplitude is measured against.
    pub baseline: Real,
    /// Interpolated 10–90% rise interval, in milliseconds.
    pub rise_time_ms: Real,
    /// Interpolated 90–10% decay interval, in milliseconds.
    pub decay_time_ms: Real,
    /// Interpolated width at half amplitude, in milliseconds.
    pub half_width_ms: Real,
    /// Largest central-difference slope over the event span, per second.
    pub max_slope: Real,
    /// Smallest central-difference slope over the event span, per second.
    pub min_slope: Real,
}

/// Measures kinetics for each event peak in `indices` (strictly ascending,
/// as the detectors produce them; anything else is rejected).
///
/// The local baseline is the median of `[peak − bw, peak − bw/2)`; the gap
/// of half a window keeps the event's own rising edge out of the estimate.
/// Events too close to the trace start fall back to the median of whatever
/// precedes the peak, and an event at index zero has no baseline at all, so
/// every baseline-relative measurement on it is NaN.
pub fn extract_event_features(
    trace: &Trace,
    indices: &[usize],
    settings: &FeatureSettings,
) -> EngineResult<Vec<EventRecord>> {
    settings.validate()?;
    if let Some(&bad) = indices.iter().find(|&&index| index >= trace.len()) {
        return Err(AnalysisError::invalid_parameter(
            LOCATION,
            "indices",
            format!("event index {bad} is outside the trace (len {})", trace.len()),
        ));
    }
    if let Some(pair) = indices.windows(2).find(|pair| pair[1] <= pair[0]) {
        return Err(AnalysisError::invalid_parameter(
            LOCATION,
            "indices",
            format!("must be strictly ascending, got {} after {}", pair[1], pair[0]),
        ));
    }

    let samples = trace.samples();
    let dt = trace.dt();
    let ms_per_sample = 1000.0 * dt;
    let samples_per_ms = trace.sampling_rate() / 1000.0;
    let bw = (settings.baseline_window_ms * samples_per_ms).round().max(1.0) as usize;
    let ew = (settings.event_window_ms * samples_per_ms).round().max(1.0) as usize;
    let sign = settings.direction.sign();

    let mut records = Vec::with_capacity(indices.len());
    for (position, &peak) in indices.iter().enumerate() {
        let baseline = if peak >= bw {
            noise::median(&samples[peak - bw..peak - bw / 2])
        } else {
            noise::median(&samples[..peak])
        };
        let amplitude = samples[peak] - baseline;

        // One event's span stops at its neighbours, so overlapping tails
        // are never measured twice.
        let previous_bound = if position > 0 { indices[position - 1] + 1 } else { 0 };
        let next_bound = indices
            .get(position + 1)
            .copied()
            .unwrap_or(samples.len());
        let span_start = peak.saturating_sub(bw).max(previous_bound);
        let span_end = (peak + ew + 1).min(next_bound);

        let oriented: Vec<Real> = samples[span_start..span_end]
            .iter()
            .map(|value| sign * (value - baseline))
            .collect();
        let peak_rel = peak - span_start;
        let d_peak = oriented[peak_rel];

        let (half_width_ms, rise_time_ms, decay_time_ms) = if d_peak > 0.0 {
            let half_left = crossing_before(&oriented, peak_rel, 0.5 * d_peak);
            let half_right = crossing_after(&oriented, peak_rel, 0.5 * d_peak);
            let half_width_ms = match (half_left, half_right) {
                (Some(left), Some(right)) => (right - left) * ms_per_sample,
                _ => Real::NAN,
            };

            let rise_time_ms = match (
                crossing_before(&oriented, peak_rel, 0.9 * d_peak),
                crossing_before(&oriented, peak_rel, 0.1 * d_peak),
            ) {
                (Some(high), Some(low)) if high > low => (high - low) * ms_per_sample,
                _ => Real::NAN,
            };
            let decay_time_ms = match (
                crossing_after(&oriented, peak_rel, 0.9 * d_peak),
                crossing_after(&oriented, peak_rel, 0.1 * d_peak),
            ) {
                (Some(high), Some(low)) if low > high => (low - high) * ms_per_sample,
                _ => Real::NAN,
            };
            (half_width_ms, rise_time_ms, decay_time_ms)
        } else {
            (Real::NAN, Real::NAN, Real::NAN)
        };

        let slopes: Vec<Real> = (span_start + 1..span_end.saturating_sub(1))
            .map(|index| (samples[index + 1] - samples[index - 1]) / (2.0 * dt))
            .collect();
        let max_slope = slopes.iter().copied().fold(Real::NAN, Real::max);
        let min_slope = slopes.iter().copied().fold(Real::NAN, Real::min);

        records.push(EventRecord {
            index: peak,
            time: trace.time()[peak],
            amplitude,
            baseline,
            rise_time_ms,
            decay_time_ms,
            half_width_ms,
            max_slope,
            min_slope,
        });
    }
    Ok(records)
}

/// Aggregate over one trace's events.
#[derive(Debug, Clone, PartialEq)]
pub struct EventSummary {
    pub count: usize,
    /// Events per second of trace, NaN when the trace spans no time.
    pub frequency_hz: Real,
    pub mean_amplitude: Real,
    pub mean_rise_ms: Real,
    pub mean_decay_ms: Real,
    pub mean_half_width_ms: Real,
}

/// Summarizes `records` over a trace of `duration_s` seconds.
///
/// Zero events over a valid duration is a frequency of exactly 0.0; every
/// mean without a finite measurement behind it is NaN.
pub fn summarize_events(records: &[EventRecord], duration_s: Real) -> EventSummary {
    let count = records.len();
    let frequency_hz = if !duration_s.is_finite() || duration_s <= 0.0 {
        Real::NAN
    } else {
        count as Real / duration_s
    };
    EventSummary {
        count,
        frequency_hz,
        mean_amplitude: finite_mean(records.iter().map(|record| record.amplitude)),
        mean_rise_ms: finite_mean(records.iter().map(|record| record.rise_time_ms)),
        mean_decay_ms: finite_mean(records.iter().map(|record| record.decay_time_ms)),
        mean_half_width_ms: finite_mean(records.iter().map(|record| record.half_width_ms)),
    }
}

fn finite_mean(values: impl Iterator<Item = Real>) -> Real {
    let mut sum = 0.0;
    let mut count = 0_usize;
    for value in values.filter(|value| value.is_finite()) {
        sum += value;
        count += 1;
    }
    if count == 0 {
        Real::NAN
    } else {
        sum / count as Real
    }
}

/// Sub-sample position of the first crossing of `level` walking left from
/// the peak of the oriented event.
fn crossing_before(oriented: &[Real], peak: usize, level: Real) -> Option<Real> {
    for index in (1..=peak).rev() {
        let prev = index - 1;
        if oriented[prev] < level && oriented[index] >= level {
            let step = oriented[index] - oriented[prev];
            return Some(prev as Real + (level - oriented[prev]) / step);
        }
    }
    None
}

/// Sub-sample position of the first crossing of `level` walking right from
/// the peak of the oriented event.
fn crossing_after(oriented: &[Real], peak: usize, level: Real) -> Option<Real> {
    for index in peak + 1..oriented.len() {
        let prev = index - 1;
        if oriented[prev] >= level && oriented[index] < level {
            let step = oriented[prev] - oriented[index];
            return Some(prev as Real + (oriented[prev] - level) / step);
        }
    }
    None
}
