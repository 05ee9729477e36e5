//! Shared peak-candidate machinery.

use ephys_common::Real;
use itertools::Itertools;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Candidate {
    pub(crate) index: usize,
    pub(crate) score: Real,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct PeakSearch {
    pub(crate) accepted: Vec<Candidate>,
    pub(crate) seen: usize,
    pub(crate) rejected_width: usize,
    pub(crate) rejected_separation: usize,
}

/// Local maxima of `signal` at or above `threshold`, at least
/// `min_separation` samples apart and at least `min_width` samples wide at
/// half height.
///
/// Separation conflicts resolve to the taller candidate; equal heights keep
/// the earlier index, so repeated runs are bit-identical. Plateaus count
/// once, at their last sample. NaN samples never become candidates.
pub(crate) fn find_peaks(
    signal: &[Real],
    threshold: Real,
    min_separation: usize,
    min_width: Real,
) -> PeakSearch {
    let mut search = PeakSearch::default();
    let mut candidates: Vec<Candidate> = signal
        .iter()
        .enumerate()
        .tuple_windows()
        .flat_map(|((_, &left), (index, &value), (_, &right))| {
            if value >= threshold && value >= left && value > right {
                Some(Candidate { index, score: value })
            } else {
                None
            }
        })
        .collect();
    search.seen = candidates.len();

    candidates.retain(|candidate| {
        let wide_enough = half_height_width(signal, candidate.index) >= min_width;
        if !wide_enough {
            search.rejected_width += 1;
        }
        wide_enough
    });

    // Tallest first; the stable sort keeps equal scores in index order.
    let mut by_score = candidates;
    by_score.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut accepted: Vec<Candidate> = Vec::new();
    for candidate in by_score {
        let conflicts = accepted.iter().any(|kept| {
            kept.index.abs_diff(candidate.index) < min_separation.max(1)
        });
        if conflicts {
            search.rejected_separation += 1;
        } else {
            accepted.push(candidate);
        }
    }
    accepted.sort_by_key(|candidate| candidate.index);
    search.accepted = accepted;
    search
}

/// Width of the peak at half its height, in (fractional) samples, found by
/// walking out from the peak to the interpolated half-height crossings.
/// Sides that run off the signal count as half-width from the edge.
fn half_height_width(signal: &[Real], peak: usize) -> Real {
    let half = signal[peak] / 2.0;

    let mut left = peak as Real;
    for index in (0..peak).rev() {
        if signal[index] < half {
            let frac = crossing_offset(signal[index + 1], signal[index], half);
            left = (index + 1) as Real - frac;
            break;
        }
        left = index as Real;
    }

    let mut right = peak as Real;
    for index in peak + 1..signal.len() {
        if signal[index] < half {
            let frac = crossing_offset(signal[index - 1], signal[index], half);
            right = (index - 1) as Real + frac;
            break;
        }
        right = index as Real;
    }

    right - left
}

/// Fraction of the step from the `inner` (higher) sample toward the `outer`
/// sample at which `level` is crossed.
fn crossing_offset(inner: Real, outer: Real, level: Real) -> Real {
    let span = inner - outer;
    if span <= 0.0 || !span.is_finite() {
        return 0.0;
    }
    ((inner - level) / span).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle(centre: usize, half_base: usize, height: Real, len: usize) -> Vec<Real> {
        (0..len)
            .map(|i| {
                let distance = centre.abs_diff(i) as Real;
                (height * (1.0 - distance / half_base as Real)).max(0.0)
            })
            .collect()
    }

    #[test]
    fn short_signals_have_no_peaks() {
        assert!(find_peaks(&[], 1.0, 1, 0.0).accepted.is_empty());
        assert!(find_peaks(&[5.0, 5.0], 1.0, 1, 0.0).accepted.is_empty());
    }

    #[test]
    fn single_triangle_is_found_once() {
        let signal = triangle(50, 10, 8.0, 100);
        let search = find_peaks(&signal, 4.0, 5, 0.0);
        assert_eq!(search.accepted.len(), 1);
        assert_eq!(search.accepted[0].index, 50);
        assert_eq!(search.accepted[0].score, 8.0);
    }

    #[test]
    fn sub_threshold_peaks_are_ignored() {
        let signal = triangle(50, 10, 3.0, 100);
        assert!(find_peaks(&signal, 4.0, 5, 0.0).accepted.is_empty());
    }

    #[test]
    fn close_peaks_merge_to_the_taller_one() {
        let mut signal = triangle(40, 8, 6.0, 120);
        for (index, value) in triangle(52, 8, 9.0, 120).iter().enumerate() {
            signal[index] += value;
        }
        let search = find_peaks(&signal, 2.0, 20, 0.0);
        assert_eq!(search.accepted.len(), 1);
        assert_eq!(search.accepted[0].index, 52);
        assert_eq!(search.rejected_separation, 1);

        let relaxed = find_peaks(&signal, 2.0, 5, 0.0);
        assert_eq!(relaxed.accepted.len(), 2);
    }

    #[test]
    fn narrow_spikes_are_rejected_by_the_width_floor() {
        let mut signal = vec![0.0; 100];
        signal[30] = 10.0;
        let search = find_peaks(&signal, 4.0, 5, 3.0);
        assert!(search.accepted.is_empty());
        assert_eq!(search.rejected_width, 1);

        let wide = triangle(60, 12, 10.0, 100);
        assert_eq!(find_peaks(&wide, 4.0, 5, 3.0).accepted.len(), 1);
    }

    #[test]
    fn plateaus_count_once() {
        let mut signal = vec![0.0; 20];
        for value in signal.iter_mut().skip(8).take(4) {
            *value = 5.0;
        }
        let search = find_peaks(&signal, 1.0, 1, 0.0);
        assert_eq!(search.accepted.len(), 1);
        assert_eq!(search.accepted[0].index, 11);
    }

    #[test]
    fn nan_samples_are_never_candidates() {
        let mut signal = triangle(50, 10, 8.0, 100);
        signal[20] = Real::NAN;
        let search = find_peaks(&signal, 4.0, 5, 0.0);
        assert_eq!(search.accepted.len(), 1);
        assert_eq!(search.accepted[0].index, 50);
    }
}
