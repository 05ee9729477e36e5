use ephys_common::{ParameterError, TraceError};
use thiserror::Error;

pub type EngineResult<T> = Result<T, AnalysisError>;

/// Component a rejected parameter was handed to, for error context.
#[derive(Debug, Clone, Copy, strum::Display)]
pub enum ErrorLocation {
    #[strum(to_string = "baseline locator")]
    BaselineLocator,
    #[strum(to_string = "digital filter")]
    DigitalFilter,
    #[strum(to_string = "deconvolution detector")]
    DeconvolutionDetector,
    #[strum(to_string = "threshold detector")]
    ThresholdDetector,
    #[strum(to_string = "feature extractor")]
    FeatureExtractor,
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("{location}: invalid parameter `{name}`: {reason}")]
    InvalidParameter {
        location: ErrorLocation,
        name: &'static str,
        reason: String,
    },

    #[error("no analysis registered under `{0}`")]
    NotFound(String),

    #[error("an analysis is already registered under `{0}`")]
    DuplicateName(String),

    #[error("{0}")]
    Parameter(#[from] ParameterError),

    #[error("{0}")]
    Trace(#[from] TraceError),
}

impl AnalysisError {
    pub(crate) fn invalid_parameter(
        location: ErrorLocation,
        name: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidParameter {
            location,
            name,
            reason: reason.into(),
        }
    }
}
