//! Second-order filter sections.
//!
//! Coefficients follow the audio-EQ cookbook forms, normalized so `a0 = 1`;
//! first-order sections come from the bilinear transform with `b2 = a2 = 0`.
//! Filtering runs each section in transposed direct form II, which keeps
//! only two state variables per section and stays well conditioned for the
//! low normalized frequencies typical of biological signals.

use ephys_common::Real;
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Biquad {
    b0: Real,
    b1: Real,
    b2: Real,
    a1: Real,
    a2: Real,
}

impl Biquad {
    /// Second-order low-pass at `normalized_freq` = f / sampling_rate.
    pub(crate) fn lowpass(normalized_freq: Real, q: Real) -> Self {
        let omega = 2.0 * PI * normalized_freq;
        let (sin_w, cos_w) = omega.sin_cos();
        let alpha = sin_w / (2.0 * q);
        let a0 = 1.0 + alpha;
        Self {
            b0: ((1.0 - cos_w) / 2.0) / a0,
            b1: (1.0 - cos_w) / a0,
            b2: ((1.0 - cos_w) / 2.0) / a0,
            a1: (-2.0 * cos_w) / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    /// Second-order high-pass at `normalized_freq`.
    pub(crate) fn highpass(normalized_freq: Real, q: Real) -> Self {
        let omega = 2.0 * PI * normalized_freq;
        let (sin_w, cos_w) = omega.sin_cos();
        let alpha = sin_w / (2.0 * q);
        let a0 = 1.0 + alpha;
        Self {
            b0: ((1.0 + cos_w) / 2.0) / a0,
            b1: (-(1.0 + cos_w)) / a0,
            b2: ((1.0 + cos_w) / 2.0) / a0,
            a1: (-2.0 * cos_w) / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    /// Narrow band-reject centred on `normalized_freq`.
    pub(crate) fn notch(normalized_freq: Real, q: Real) -> Self {
        let omega = 2.0 * PI * normalized_freq;
        let (sin_w, cos_w) = omega.sin_cos();
        let alpha = sin_w / (2.0 * q);
        let a0 = 1.0 + alpha;
        Self {
            b0: 1.0 / a0,
            b1: (-2.0 * cos_w) / a0,
            b2: 1.0 / a0,
            a1: (-2.0 * cos_w) / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    /// First-order low-pass (bilinear transform of 1 / (1 + s/ωc)).
    pub(crate) fn first_order_lowpass(normalized_freq: Real) -> Self {
        let t = (PI * normalized_freq).tan();
        let a0 = 1.0 + t;
        Self {
            b0: t / a0,
            b1: t / a0,
            b2: 0.0,
            a1: (t - 1.0) / a0,
            a2: 0.0,
        }
    }

    /// First-order high-pass.
    pub(crate) fn first_order_highpass(normalized_freq: Real) -> Self {
        let t = (PI * normalized_freq).tan();
        let a0 = 1.0 + t;
        Self {
            b0: 1.0 / a0,
            b1: -1.0 / a0,
            b2: 0.0,
            a1: (t - 1.0) / a0,
            a2: 0.0,
        }
    }
}

/// Butterworth cascade: one biquad per conjugate pole pair, with the section
/// Q taken from the pole angle, plus a first-order section for odd orders.
pub(crate) fn butterworth(
    normalized_freq: Real,
    order: usize,
    highpass: bool,
) -> Vec<Biquad> {
    let mut sections = Vec::with_capacity(order / 2 + 1);
    let n = order as Real;
    for k in 0..order / 2 {
        let theta = PI * (2.0 * k as Real + 1.0) / (2.0 * n);
        let q = 1.0 / (2.0 * theta.sin());
        sections.push(if highpass {
            Biquad::highpass(normalized_freq, q)
        } else {
            Biquad::lowpass(normalized_freq, q)
        });
    }
    if order % 2 == 1 {
        sections.push(if highpass {
            Biquad::first_order_highpass(normalized_freq)
        } else {
            Biquad::first_order_lowpass(normalized_freq)
        });
    }
    sections
}

/// Per-section state for transposed direct form II.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct BiquadState {
    d1: Real,
    d2: Real,
}

impl BiquadState {
    pub(crate) fn process(&mut self, coefficients: &Biquad, input: Real) -> Real {
        let output = coefficients.b0 * input + self.d1;
        self.d1 = coefficients.b1 * input - coefficients.a1 * output + self.d2;
        self.d2 = coefficients.b2 * input - coefficients.a2 * output;
        output
    }
}

/// Runs the full cascade over `samples` with fresh state.
pub(crate) fn process_cascade(sections: &[Biquad], samples: &mut [Real]) {
    let mut states = vec![BiquadState::default(); sections.len()];
    for value in samples.iter_mut() {
        let mut acc = *value;
        for (section, state) in sections.iter().zip(states.iter_mut()) {
            acc = state.process(section, acc);
        }
        *value = acc;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn dc_gain(section: &Biquad) -> Real {
        (section.b0 + section.b1 + section.b2) / (1.0 + section.a1 + section.a2)
    }

    fn nyquist_gain(section: &Biquad) -> Real {
        (section.b0 - section.b1 + section.b2) / (1.0 - section.a1 + section.a2)
    }

    #[test]
    fn lowpass_keeps_dc_and_kills_nyquist() {
        let section = Biquad::lowpass(0.1, std::f64::consts::FRAC_1_SQRT_2);
        assert_approx_eq!(dc_gain(&section), 1.0, 1e-12);
        assert_approx_eq!(nyquist_gain(&section), 0.0, 1e-12);
    }

    #[test]
    fn highpass_kills_dc_and_keeps_nyquist() {
        let section = Biquad::highpass(0.1, std::f64::consts::FRAC_1_SQRT_2);
        assert_approx_eq!(dc_gain(&section), 0.0, 1e-12);
        assert_approx_eq!(nyquist_gain(&section), 1.0, 1e-12);
    }

    #[test]
    fn notch_passes_both_band_edges() {
        let section = Biquad::notch(0.1, 30.0);
        assert_approx_eq!(dc_gain(&section), 1.0, 1e-12);
        assert_approx_eq!(nyquist_gain(&section), 1.0, 1e-12);
    }

    #[test]
    fn butterworth_section_count_follows_the_order() {
        assert_eq!(butterworth(0.1, 1, false).len(), 1);
        assert_eq!(butterworth(0.1, 2, false).len(), 1);
        assert_eq!(butterworth(0.1, 4, false).len(), 2);
        assert_eq!(butterworth(0.1, 5, false).len(), 3);
    }

    #[test]
    fn second_order_butterworth_uses_the_canonical_q() {
        let sections = butterworth(0.05, 2, false);
        let reference = Biquad::lowpass(0.05, std::f64::consts::FRAC_1_SQRT_2);
        assert_approx_eq!(sections[0].b0, reference.b0, 1e-12);
        assert_approx_eq!(sections[0].a2, reference.a2, 1e-12);
    }

    #[test]
    fn cascade_attenuates_a_high_frequency_tone() {
        // 10 Hz tone and 2 kHz tone through a 100 Hz low-pass at 10 kHz.
        let sections = butterworth(100.0 / 10_000.0, 4, false);
        let tone =
            |f: Real| -> Vec<Real> { (0..4000).map(|i| (2.0 * PI * f * i as Real / 10_000.0).sin()).collect() };

        let mut slow = tone(10.0);
        let mut fast = tone(2000.0);
        process_cascade(&sections, &mut slow);
        process_cascade(&sections, &mut fast);

        let peak = |signal: &[Real]| signal.iter().skip(2000).fold(0.0_f64, |m, v| m.max(v.abs()));
        assert!(peak(&slow) > 0.95, "passband tone was attenuated");
        assert!(peak(&fast) < 0.01, "stopband tone leaked through");
    }
}
