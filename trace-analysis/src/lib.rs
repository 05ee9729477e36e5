//! Signal-analysis engine for electrophysiological recordings.
//!
//! The engine is a set of pure functions over [`ephys_common::Trace`]
//! slices: robust noise estimation ([`noise`]), quiet-window location and
//! drift fitting ([`baseline`]), zero-phase IIR conditioning ([`filter`]),
//! two event detectors ([`detectors`]) and per-event kinetics
//! ([`features`]). Hosts reach all of it through the [`registry`]: every
//! analysis is registered under a stable name with a parameter schema, and
//! runs as a callable from a [`ephys_common::Trace`] and a flat
//! [`ephys_common::Parameters`] map to a flat
//! [`ephys_common::AnalysisResult`] carrying its own provenance.
//!
//! ```
//! use ephys_common::{Parameters, Trace};
//! use ephys_trace_analysis::{builtin, registry::AnalysisRegistry};
//!
//! let registry = AnalysisRegistry::new();
//! builtin::register_builtin_analyses(&registry);
//!
//! let trace = Trace::from_samples(vec![0.0; 1000], 10_000.0)?;
//! let analysis = registry.get(builtin::THRESHOLD_DETECTION)?;
//! let result = (analysis.callable)(&trace, &Parameters::new())?;
//! assert!(!result.is_error());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod baseline;
pub mod builtin;
pub mod detectors;
pub mod error;
pub mod features;
pub mod filter;
pub mod noise;
pub mod registry;

pub use error::{AnalysisError, EngineResult, ErrorLocation};
