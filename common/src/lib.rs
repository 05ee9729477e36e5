//! Shared data model for the signal-analysis workspace.
//!
//! Everything an analysis touches flows through the types defined here: the
//! immutable [`Trace`] handed in by a data supplier, the flat [`Parameters`]
//! map that fully determines one deterministic run, and the flat
//! [`AnalysisResult`] map handed back with its parameter provenance attached.

pub mod parameters;
pub mod results;
pub mod trace;

/// Scalar type used for samples, time stamps and all derived quantities.
pub type Real = f64;

pub use parameters::{
    ParameterDescriptor, ParameterError, ParameterKind, ParameterValue, Parameters,
};
pub use results::{AnalysisResult, ERROR_KEY, OVERLAY_PREFIX, ResultValue};
pub use trace::{Trace, TraceError};
