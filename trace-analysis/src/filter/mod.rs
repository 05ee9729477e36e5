//! Zero-phase digital conditioning.
//!
//! Every filter here runs forward and backward over the trace, so the
//! passband is applied twice and the phase response cancels exactly. Event
//! timing measured downstream is therefore never biased by the conditioning
//! stage, which is a hard correctness requirement for latency work.

mod biquad;

use crate::error::{AnalysisError, EngineResult, ErrorLocation};
use biquad::Biquad;
use ephys_common::{Real, Trace};

/// Filter shape plus the frequencies it needs.
///
/// `Bandpass` is realized as a high-pass/low-pass cascade; `Notch` and
/// `Comb` treat `order` as the total order applied per notched frequency
/// (two per biquad section).
#[derive(Debug, Clone, Copy, PartialEq, strum::Display)]
pub enum FilterKind {
    #[strum(to_string = "low-pass")]
    Lowpass { cutoff_hz: Real },
    #[strum(to_string = "high-pass")]
    Highpass { cutoff_hz: Real },
    #[strum(to_string = "band-pass")]
    Bandpass { low_hz: Real, high_hz: Real },
    #[strum(to_string = "notch")]
    Notch { center_hz: Real, q: Real },
    #[strum(to_string = "comb")]
    Comb { fundamental_hz: Real, q: Real },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterSpec {
    pub kind: FilterKind,
    pub order: usize,
}

impl FilterSpec {
    pub fn new(kind: FilterKind, order: usize) -> Self {
        Self { kind, order }
    }

    fn design(&self, sampling_rate: Real) -> EngineResult<Vec<Biquad>> {
        let nyquist = sampling_rate / 2.0;
        if self.order == 0 {
            return Err(AnalysisError::invalid_parameter(
                ErrorLocation::DigitalFilter,
                "order",
                "must be at least 1",
            ));
        }

        let sections = match self.kind {
            FilterKind::Lowpass { cutoff_hz } => {
                check_frequency("cutoff_hz", cutoff_hz, nyquist)?;
                biquad::butterworth(cutoff_hz / sampling_rate, self.order, false)
            }
            FilterKind::Highpass { cutoff_hz } => {
                check_frequency("cutoff_hz", cutoff_hz, nyquist)?;
                biquad::butterworth(cutoff_hz / sampling_rate, self.order, true)
            }
            FilterKind::Bandpass { low_hz, high_hz } => {
                check_frequency("low_hz", low_hz, nyquist)?;
                check_frequency("high_hz", high_hz, nyquist)?;
                if low_hz >= high_hz {
                    return Err(AnalysisError::invalid_parameter(
                        ErrorLocation::DigitalFilter,
                        "low_hz",
                        format!("band edges are inverted ({low_hz} >= {high_hz})"),
                    ));
                }
                let mut sections =
                    biquad::butterworth(high_hz / sampling_rate, self.order, false);
                sections.extend(biquad::butterworth(low_hz / sampling_rate, self.order, true));
                sections
            }
            FilterKind::Notch { center_hz, q } => {
                check_frequency("center_hz", center_hz, nyquist)?;
                check_q(q)?;
                vec![Biquad::notch(center_hz / sampling_rate, q); (self.order / 2).max(1)]
            }
            FilterKind::Comb { fundamental_hz, q } => {
                check_frequency("fundamental_hz", fundamental_hz, nyquist)?;
                check_q(q)?;
                let per_harmonic = (self.order / 2).max(1);
                let mut sections = Vec::new();
                let mut harmonic = fundamental_hz;
                while harmonic < nyquist {
                    sections.extend(vec![
                        Biquad::notch(harmonic / sampling_rate, q);
                        per_harmonic
                    ]);
                    harmonic += fundamental_hz;
                }
                sections
            }
        };
        Ok(sections)
    }
}

fn check_frequency(name: &'static str, frequency: Real, nyquist: Real) -> EngineResult<()> {
    if !frequency.is_finite() || frequency <= 0.0 {
        return Err(AnalysisError::invalid_parameter(
            ErrorLocation::DigitalFilter,
            name,
            format!("must be a positive frequency, got {frequency}"),
        ));
    }
    if frequency >= nyquist {
        return Err(AnalysisError::invalid_parameter(
            ErrorLocation::DigitalFilter,
            name,
            format!("{frequency} Hz is at or above the Nyquist frequency ({nyquist} Hz)"),
        ));
    }
    Ok(())
}

fn check_q(q: Real) -> EngineResult<()> {
    if !q.is_finite() || q <= 0.0 {
        return Err(AnalysisError::invalid_parameter(
            ErrorLocation::DigitalFilter,
            "q",
            format!("must be positive, got {q}"),
        ));
    }
    Ok(())
}

/// Applies `spec` to the trace with zero phase shift and returns the
/// filtered samples. An empty trace passes through empty.
pub fn apply_filter(trace: &Trace, spec: &FilterSpec) -> EngineResult<Vec<Real>> {
    let sections = spec.design(trace.sampling_rate())?;
    if trace.is_empty() {
        return Ok(Vec::new());
    }
    Ok(filtfilt(trace.samples(), &sections))
}

/// Forward-backward filtering with odd-reflection edge padding, which keeps
/// the filter settled where the real data begins.
fn filtfilt(samples: &[Real], sections: &[Biquad]) -> Vec<Real> {
    let len = samples.len();
    let pad = (6 * sections.len() + 3).min(len.saturating_sub(1));

    let mut extended = Vec::with_capacity(len + 2 * pad);
    if let (Some(first), Some(last)) = (samples.first(), samples.last()) {
        for i in (1..=pad).rev() {
            extended.push(2.0 * first - samples[i]);
        }
        extended.extend_from_slice(samples);
        for i in 1..=pad {
            extended.push(2.0 * last - samples[len - 1 - i]);
        }
    } else {
        return Vec::new();
    }

    biquad::process_cascade(sections, &mut extended);
    extended.reverse();
    biquad::process_cascade(sections, &mut extended);
    extended.reverse();

    extended[pad..pad + len].to_vec()
}
