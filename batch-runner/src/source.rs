//! Supplier contract between file readers and the batch runner.

use anyhow::{anyhow, bail};
use ephys_common::Real;

/// One channel's worth of recorded trials, as handed over by a file reader.
///
/// The runner never touches storage itself: hosts adapt their format
/// readers to this trait and the runner asks for arrays. Data methods are
/// fallible so a truncated or corrupt file surfaces as a row diagnostic
/// instead of ending the batch.
pub trait TraceSource: Send + Sync {
    fn trial_count(&self) -> usize;

    /// Samples of one trial.
    fn get_data(&self, trial: usize) -> anyhow::Result<Vec<Real>>;

    /// Time stamps of one trial, in seconds relative to the trial start.
    fn get_relative_time_vector(&self, trial: usize) -> anyhow::Result<Vec<Real>>;

    /// Sample-wise mean across all trials.
    fn get_averaged_data(&self) -> anyhow::Result<Vec<Real>>;

    fn sampling_rate(&self) -> Real;
}

/// In-memory [`TraceSource`], for tests and for hosts that already hold
/// their data as arrays.
pub struct MemoryTraceSource {
    trials: Vec<Vec<Real>>,
    sampling_rate: Real,
}

impl MemoryTraceSource {
    pub fn new(trials: Vec<Vec<Real>>, sampling_rate: Real) -> Self {
        Self {
            trials,
            sampling_rate,
        }
    }
}

impl TraceSource for MemoryTraceSource {
    fn trial_count(&self) -> usize {
        self.trials.len()
    }

    fn get_data(&self, trial: usize) -> anyhow::Result<Vec<Real>> {
        self.trials
            .get(trial)
            .cloned()
            .ok_or_else(|| anyhow!("trial {trial} out of range ({} available)", self.trials.len()))
    }

    fn get_relative_time_vector(&self, trial: usize) -> anyhow::Result<Vec<Real>> {
        let len = self
            .trials
            .get(trial)
            .ok_or_else(|| anyhow!("trial {trial} out of range ({} available)", self.trials.len()))?
            .len();
        let dt = self.sampling_rate.recip();
        Ok((0..len).map(|index| index as Real * dt).collect())
    }

    fn get_averaged_data(&self) -> anyhow::Result<Vec<Real>> {
        let first = match self.trials.first() {
            Some(first) => first,
            None => bail!("source holds no trials to average"),
        };
        if self.trials.iter().any(|trial| trial.len() != first.len()) {
            bail!("trials have unequal lengths, cannot average");
        }
        let count = self.trials.len() as Real;
        let mut averaged = vec![0.0; first.len()];
        for trial in &self.trials {
            for (accumulator, sample) in averaged.iter_mut().zip(trial) {
                *accumulator += sample / count;
            }
        }
        Ok(averaged)
    }

    fn sampling_rate(&self) -> Real {
        self.sampling_rate
    }
}
