use crate::Real;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Relative disagreement between the stated sampling rate and the rate
/// implied by the median time step, above which a warning is logged.
const RATE_MISMATCH_TOLERANCE: Real = 0.01;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("samples ({samples}) and time ({time}) differ in length")]
    MismatchedLengths { samples: usize, time: usize },

    #[error("sampling rate must be positive, got {0}")]
    NonPositiveSamplingRate(Real),

    #[error("time vector is not strictly increasing at index {0}")]
    NonMonotonicTime(usize),
}

/// One immutable recording segment: sample values, their time stamps in
/// seconds, and the sampling rate in Hz.
///
/// The length and monotonicity invariants are validated once at
/// construction, so analyses can consume the arrays without re-checking.
/// The stated sampling rate is cross-checked against the spacing of the
/// time vector; a disagreement is logged as a warning, never an error,
/// because acquisition software routinely rounds one or the other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    samples: Vec<Real>,
    time: Vec<Real>,
    sampling_rate: Real,
}

impl Trace {
    pub fn new(
        samples: Vec<Real>,
        time: Vec<Real>,
        sampling_rate: Real,
    ) -> Result<Self, TraceError> {
        if samples.len() != time.len() {
            return Err(TraceError::MismatchedLengths {
                samples: samples.len(),
                time: time.len(),
            });
        }
        if sampling_rate.is_nan() || sampling_rate <= 0.0 {
            return Err(TraceError::NonPositiveSamplingRate(sampling_rate));
        }
        // Written so a NaN stamp fails the check as well.
        if let Some(index) = time.windows(2).position(|pair| !(pair[1] > pair[0])) {
            return Err(TraceError::NonMonotonicTime(index + 1));
        }
        let trace = Self {
            samples,
            time,
            sampling_rate,
        };
        trace.check_sampling_rate();
        Ok(trace)
    }

    /// Builds the time vector from the sampling rate, starting at zero.
    pub fn from_samples(samples: Vec<Real>, sampling_rate: Real) -> Result<Self, TraceError> {
        if sampling_rate.is_nan() || sampling_rate <= 0.0 {
            return Err(TraceError::NonPositiveSamplingRate(sampling_rate));
        }
        let dt = sampling_rate.recip();
        let time = (0..samples.len()).map(|index| index as Real * dt).collect();
        Ok(Self {
            samples,
            time,
            sampling_rate,
        })
    }

    fn check_sampling_rate(&self) {
        if self.time.len() < 2 {
            return;
        }
        let mut steps: Vec<Real> = self.time.windows(2).map(|pair| pair[1] - pair[0]).collect();
        steps.sort_by(Real::total_cmp);
        let Some(median_step) = steps.get(steps.len() / 2) else {
            return;
        };
        let implied = median_step.recip();
        let relative = ((implied - self.sampling_rate) / self.sampling_rate).abs();
        if relative > RATE_MISMATCH_TOLERANCE {
            tracing::warn!(
                stated_hz = self.sampling_rate,
                implied_hz = implied,
                "sampling rate disagrees with time vector spacing"
            );
        }
    }

    pub fn samples(&self) -> &[Real] {
        &self.samples
    }

    pub fn time(&self) -> &[Real] {
        &self.time
    }

    pub fn sampling_rate(&self) -> Real {
        self.sampling_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sample interval in seconds.
    pub fn dt(&self) -> Real {
        self.sampling_rate.recip()
    }

    /// Spanned time in seconds, zero for traces shorter than two samples.
    pub fn duration(&self) -> Real {
        match (self.time.first(), self.time.last()) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        }
    }
}
