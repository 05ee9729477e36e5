//! Baseline location and slow-drift handling.

use crate::{
    error::{AnalysisError, EngineResult, ErrorLocation},
    noise,
};
use ephys_common::{Real, Trace};

/// Finds the quietest fixed-duration window of a trace.
///
/// Slides a `window_s`-long window across the trace in `step_s` steps and
/// returns the half-open sample range `(start, end)` of minimum variance.
/// Equal variances break the tie to the earliest window, so the result is
/// deterministic. A window longer than the trace degrades to the whole
/// trace rather than failing; windows poisoned by NaN samples are skipped.
pub fn find_stable_window(
    trace: &Trace,
    window_s: Real,
    step_s: Real,
) -> EngineResult<(usize, usize)> {
    if !window_s.is_finite() || window_s <= 0.0 {
        return Err(AnalysisError::invalid_parameter(
            ErrorLocation::BaselineLocator,
            "window_s",
            format!("must be a positive duration, got {window_s}"),
        ));
    }
    if !step_s.is_finite() || step_s <= 0.0 {
        return Err(AnalysisError::invalid_parameter(
            ErrorLocation::BaselineLocator,
            "step_s",
            format!("must be a positive duration, got {step_s}"),
        ));
    }

    let samples = trace.samples();
    let len = samples.len();
    let window_len = ((window_s * trace.sampling_rate()).round() as usize).max(2);
    if window_len > len {
        return Ok((0, len));
    }
    let step_len = ((step_s * trace.sampling_rate()).round() as usize).max(1);

    // Prefix sums keep each candidate window O(1) regardless of step size.
    let mut sums = Vec::with_capacity(len + 1);
    let mut sums_sq = Vec::with_capacity(len + 1);
    sums.push(0.0);
    sums_sq.push(0.0);
    for value in samples {
        sums.push(sums.last().copied().unwrap_or(0.0) + value);
        sums_sq.push(sums_sq.last().copied().unwrap_or(0.0) + value * value);
    }

    let n = window_len as Real;
    let mut best_start = None;
    let mut best_variance = Real::INFINITY;
    let mut start = 0;
    while start + window_len <= len {
        let sum = sums[start + window_len] - sums[start];
        let sum_sq = sums_sq[start + window_len] - sums_sq[start];
        let variance = (sum_sq - sum * sum / n) / (n - 1.0);
        if variance < best_variance {
            best_variance = variance;
            best_start = Some(start);
        }
        start += step_len;
    }

    match best_start {
        Some(start) => Ok((start, start + window_len)),
        // Every window was NaN-poisoned; degrade the same way an oversized
        // window does.
        None => Ok((0, len)),
    }
}

/// Centred rolling median over a `window_len`-sample window, for slow-drift
/// (baseline wander) removal ahead of threshold detection.
///
/// The window shrinks at the ends instead of padding, NaN samples are left
/// out of the order statistics, and even windows average the two middle
/// values like [`noise::median`].
pub fn rolling_median(samples: &[Real], window_len: usize) -> Vec<Real> {
    let len = samples.len();
    if len == 0 {
        return Vec::new();
    }
    let window_len = window_len.max(1).min(len);
    let half = window_len / 2;

    let mut sorted: Vec<Real> = Vec::with_capacity(window_len + 1);
    let mut lo = 0;
    let mut hi = 0;
    let mut output = Vec::with_capacity(len);

    for index in 0..len {
        let target_lo = index.saturating_sub(half);
        let target_hi = (index + window_len - half).min(len);
        while hi < target_hi {
            let value = samples[hi];
            if value.is_finite() {
                let at = sorted.partition_point(|v| *v < value);
                sorted.insert(at, value);
            }
            hi += 1;
        }
        while lo < target_lo {
            let value = samples[lo];
            if value.is_finite() {
                let at = sorted.partition_point(|v| *v < value);
                if sorted.get(at).copied() == Some(value) {
                    sorted.remove(at);
                }
            }
            lo += 1;
        }
        output.push(sorted_median(&sorted));
    }
    output
}

fn sorted_median(sorted: &[Real]) -> Real {
    if sorted.is_empty() {
        return Real::NAN;
    }
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}

/// Least-squares slope of `samples` against `time`, in sample units per
/// second. NaN when fewer than two finite pairs are available or the time
/// span is degenerate.
pub fn drift_slope(time: &[Real], samples: &[Real]) -> Real {
    let pairs: Vec<(Real, Real)> = time
        .iter()
        .zip(samples)
        .filter(|(t, v)| t.is_finite() && v.is_finite())
        .map(|(t, v)| (*t, *v))
        .collect();
    if pairs.len() < 2 {
        return Real::NAN;
    }
    let n = pairs.len() as Real;
    let mean_t = pairs.iter().map(|(t, _)| t).sum::<Real>() / n;
    let mean_v = pairs.iter().map(|(_, v)| v).sum::<Real>() / n;
    let mut covariance = 0.0;
    let mut t_variance = 0.0;
    for (t, v) in &pairs {
        covariance += (t - mean_t) * (v - mean_v);
        t_variance += (t - mean_t).powi(2);
    }
    if t_variance == 0.0 {
        return Real::NAN;
    }
    covariance / t_variance
}
