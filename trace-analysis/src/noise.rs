//! Robust noise statistics.
//!
//! Every dispersion estimate here is median-based. A single hardware glitch
//! must not dominate an estimate spanning thousands of samples, so raw
//! standard deviation and min/max spreads are never used as robustness
//! proxies; the standard deviation appears only as the documented fallback
//! when the median absolute deviation degenerates to zero.

use ephys_common::Real;

/// Scale factor making the median absolute deviation a consistent estimator
/// of the standard deviation under Gaussian noise.
pub const MAD_SCALE: Real = 1.4826;

/// Fraction of the largest absolute deviation below which a MAD is treated
/// as numerically zero rather than as a usable scale.
const SCALE_DEGENERACY: Real = 1e-9;

/// Median of the finite values in `values`, NaN when there are none.
/// Even-length collections average the two middle values.
pub fn median(values: &[Real]) -> Real {
    let mut finite: Vec<Real> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return Real::NAN;
    }
    finite.sort_by(Real::total_cmp);
    let mid = finite.len() / 2;
    if finite.len() % 2 == 1 {
        finite[mid]
    } else {
        (finite[mid - 1] + finite[mid]) / 2.0
    }
}

/// Robust noise scale of a sample window: `1.4826 × MAD`.
///
/// Returns `0.0` for windows with fewer than two finite samples; callers
/// must branch on zero noise before dividing by it.
pub fn estimate_noise(window: &[Real]) -> Real {
    let finite: Vec<Real> = window.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.len() < 2 {
        return 0.0;
    }
    let centre = median(&finite);
    let deviations: Vec<Real> = finite.iter().map(|v| (v - centre).abs()).collect();
    MAD_SCALE * median(&deviations)
}

/// Sample standard deviation over the finite values, `0.0` below two samples.
pub fn sample_std(values: &[Real]) -> Real {
    let finite: Vec<Real> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.len() < 2 {
        return 0.0;
    }
    let n = finite.len() as Real;
    let mean = finite.iter().sum::<Real>() / n;
    let sum_sq = finite.iter().map(|v| (v - mean).powi(2)).sum::<Real>();
    (sum_sq / (n - 1.0)).sqrt()
}

/// Z-scores `values` around their median, scaled by the MAD-based noise
/// estimate.
///
/// Degenerate scales branch explicitly: a MAD at or within numerical
/// roundoff of zero (more than half the samples identical, e.g. a flat
/// trace with one transient, or a synthetic trace whose only spread is
/// floating-point residue) falls back to the sample standard deviation,
/// and a zero standard deviation yields all-zero scores, so a constant
/// trace scores no events instead of dividing by zero.
pub fn zscore(values: &[Real]) -> Vec<Real> {
    if values.is_empty() {
        return Vec::new();
    }
    let centre = median(values);
    let max_deviation = values
        .iter()
        .filter(|v| v.is_finite())
        .map(|v| (v - centre).abs())
        .fold(0.0, Real::max);
    let mut scale = estimate_noise(values);
    if scale <= max_deviation * SCALE_DEGENERACY {
        scale = sample_std(values);
    }
    if scale == 0.0 || !scale.is_finite() || !centre.is_finite() {
        return vec![0.0; values.len()];
    }
    values.iter().map(|v| (v - centre) / scale).collect()
}
